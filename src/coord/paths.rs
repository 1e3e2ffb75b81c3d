//! Node-tree layout for a task.
//!
//! A dotted task name `a.b.<taskid>` maps to the coordination path
//! `/a/b/<taskid>`; the prefix is the task group. Per-task nodes live under
//! the task path, the shared llap bag lives at the group level.

use crate::coord::{CoordClient, CoordResult};
use crate::error::{AgentError, Result};

#[derive(Debug, Clone)]
pub struct TaskPaths {
    /// `/a/b/<taskid>` container.
    pub task: String,
    /// Ephemeral leadership marker.
    pub master: String,
    /// JSON array of agent ids that attempted this invocation.
    pub workers: String,
    /// Terminal `{status, id}` record of the winning run.
    pub status: String,
    /// Prefix for sequential per-attempt records.
    pub result: String,
    /// Group-level `{k,v}` env bag shared across invocations.
    pub llap: String,
}

impl TaskPaths {
    /// Derive the node tree for a dotted task name. The name needs at least
    /// two segments: the final one is the taskid, the rest the group.
    pub fn derive(name: &str) -> Result<Self> {
        let segments: Vec<&str> = name.split('.').collect();
        if segments.len() < 2 || segments.iter().any(|s| s.is_empty()) {
            return Err(AgentError::Config(format!(
                "task name {name:?} must be dotted, like group.task"
            )));
        }

        let task = format!("/{}", segments.join("/"));
        let group = task[..task.rfind('/').unwrap()].to_string();

        Ok(Self {
            master: format!("{task}/master"),
            workers: format!("{task}/workers"),
            status: format!("{task}/status"),
            result: format!("{task}/result"),
            llap: format!("{group}/llap"),
            task,
        })
    }

    /// Name of the `seq`-th sequential result record.
    pub fn result_at(&self, seq: u64) -> String {
        format!("{}{:010}", self.result, seq)
    }

    /// Materialize the tree: every prefix of the task path, then the workers
    /// and llap nodes. Idempotent and safe to race across agents.
    pub async fn ensure(&self, client: &CoordClient) -> CoordResult<()> {
        for (i, ch) in self.task.char_indices().skip(1) {
            if ch == '/' {
                client.ensure(&self.task[..i]).await?;
            }
        }
        client.ensure(&self.task).await?;
        client.ensure(&self.workers).await?;
        client.ensure(&self.llap).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coord::memory;
    use crate::coord::CoordClient;
    use std::sync::Arc;
    use tokio::sync::mpsc;

    #[test]
    fn derives_the_node_tree() {
        let paths = TaskPaths::derive("billing.eu.rollup_20260801").unwrap();
        assert_eq!(paths.task, "/billing/eu/rollup_20260801");
        assert_eq!(paths.master, "/billing/eu/rollup_20260801/master");
        assert_eq!(paths.workers, "/billing/eu/rollup_20260801/workers");
        assert_eq!(paths.status, "/billing/eu/rollup_20260801/status");
        assert_eq!(paths.llap, "/billing/eu/llap");
        assert_eq!(
            paths.result_at(3),
            "/billing/eu/rollup_20260801/result0000000003"
        );
    }

    #[test]
    fn rejects_undotted_and_empty_segments() {
        assert!(TaskPaths::derive("solo").is_err());
        assert!(TaskPaths::derive("a..b").is_err());
        assert!(TaskPaths::derive(".a").is_err());
    }

    #[tokio::test]
    async fn ensure_is_idempotent_and_concurrent_safe() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let client = CoordClient::new(Arc::new(memory::MemoryCoord::connect(
            "paths-ensure",
            tx,
        )));

        let paths = TaskPaths::derive("a.b.task").unwrap();
        paths.ensure(&client).await.unwrap();
        paths.ensure(&client).await.unwrap();

        let cluster = memory::cluster("paths-ensure");
        for node in ["/a", "/a/b", "/a/b/task", "/a/b/task/workers", "/a/b/llap"] {
            assert!(cluster.node_exists(node), "missing {node}");
        }
    }
}
