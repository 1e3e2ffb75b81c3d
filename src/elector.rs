//! Master election and failover state machine.
//!
//! One elector per invocation. It races the ephemeral `master` node, joins
//! the `workers` roster, and — when it loses — parks on a deletion watch
//! until the master vanishes, then decides between promotion and giving up
//! based on the retry policy and the published terminal status.
//!
//! Watcher callbacks arrive as [`WatchEvent`]s on a channel; a background
//! task folds them into a `watch`-channel [`ZkStatus`] that both the
//! suspended slave and the master's supervision loop observe. That pair
//! replaces the original mutex/condition around the shared status word.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch};

use crate::config::{Config, RetryPolicy};
use crate::coord::paths::TaskPaths;
use crate::coord::{CoordClient, CoordError, CreateMode, SetOutcome, WatchEvent, Watcher};

/// The agent's role for this invocation, including the coordination
/// verdicts the election can end in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Master,
    Slave,
    Out,
    /// Watch armed; keep waiting.
    ZkOk,
    /// Master vanished before the watch armed; re-run the election.
    ZkAgain,
    /// Unrecoverable coordination failure.
    ZkFatal,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Role::Master => "master",
            Role::Slave => "slave",
            Role::Out => "out",
            Role::ZkOk => "zkok",
            Role::ZkAgain => "zkagain",
            Role::ZkFatal => "zkfatal",
        };
        f.write_str(s)
    }
}

/// Coordination-level condition shared with the supervision loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ZkStatus {
    MasterGone,
    MasterWait,
    WorkerSuspend,
    SessionGone,
}

/// Terminal record of the winning run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusRecord {
    pub status: i32,
    pub id: String,
}

/// Per-attempt record, sequentially numbered by the coordination service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResultRecord {
    pub status: i32,
    pub id: String,
    pub retry: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

pub struct Elector {
    cfg: Arc<Config>,
    client: CoordClient,
    paths: TaskPaths,
    role: Role,
    zk: Arc<watch::Sender<ZkStatus>>,
    /// Handed to the backend when arming watches; events come back through
    /// the translator task.
    events: Watcher,
}

impl Elector {
    /// Build the elector around an established session. `events_tx` must be
    /// the same channel installed as the session watcher at connect time;
    /// `events_rx` is its receiving half.
    pub fn new(
        cfg: Arc<Config>,
        client: CoordClient,
        paths: TaskPaths,
        events_tx: Watcher,
        mut events_rx: mpsc::UnboundedReceiver<WatchEvent>,
    ) -> Self {
        let (zk, _) = watch::channel(ZkStatus::MasterGone);
        let zk = Arc::new(zk);

        let translator = zk.clone();
        tokio::spawn(async move {
            while let Some(event) = events_rx.recv().await {
                match event {
                    WatchEvent::NodeDeleted => {
                        translator.send_replace(ZkStatus::MasterGone);
                    }
                    WatchEvent::SessionExpired => {
                        translator.send_replace(ZkStatus::SessionGone);
                    }
                }
            }
        });

        Self {
            cfg,
            client,
            paths,
            role: Role::Slave,
            zk,
            events: events_tx,
        }
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn zk_status(&self) -> ZkStatus {
        *self.zk.borrow()
    }

    pub fn session_gone(&self) -> bool {
        self.zk_status() == ZkStatus::SessionGone
    }

    pub fn paths(&self) -> &TaskPaths {
        &self.paths
    }

    /// Run the initial election. `race` skips the startup jitter (stick
    /// window hit or crash-test run).
    pub async fn startup(&mut self, race: bool) -> Role {
        if !race {
            let jitter = rand::thread_rng().gen_range(200..1200u64);
            tokio::time::sleep(Duration::from_millis(jitter)).await;
        }

        loop {
            self.role = self.compete_master(true).await;
            match self.role {
                Role::Master => {
                    self.zk.send_replace(ZkStatus::MasterWait);
                }
                Role::Slave => {
                    if self.cfg.retry_on == RetryPolicy::None {
                        // Nothing to wait for: this agent will never promote.
                        self.role = Role::Out;
                    } else {
                        self.zk.send_replace(ZkStatus::WorkerSuspend);
                        let armed = self.set_watch().await;
                        if armed != Role::ZkOk {
                            self.role = armed;
                        }
                    }
                }
                _ => {}
            }
            if self.role != Role::ZkAgain {
                break;
            }
        }
        self.role
    }

    /// Race the ephemeral master node. On the first election the winner and
    /// losers both join the workers roster; promotion elections only
    /// reclassify.
    async fn compete_master(&mut self, first: bool) -> Role {
        loop {
            let outcome = if self.cfg.test_connloss_compete_failure {
                Err(CoordError::Disconnected)
            } else {
                let created = self
                    .client
                    .create(
                        &self.paths.master,
                        self.cfg.id.as_bytes(),
                        CreateMode::Ephemeral,
                    )
                    .await
                    .map(|_| ());
                if self.cfg.test_connloss_compete_success {
                    Err(CoordError::Disconnected)
                } else {
                    created
                }
            };

            match outcome {
                Ok(()) => {
                    return if first {
                        self.join_workers(true).await
                    } else {
                        Role::Master
                    }
                }
                Err(CoordError::NodeExists) => {
                    return if first {
                        self.join_workers(false).await
                    } else {
                        Role::Slave
                    }
                }
                Err(CoordError::Disconnected) => {
                    // The create raced a disconnect; find out whether it
                    // landed by reading the node back.
                    match self.client.get(&self.paths.master).await {
                        Ok((data, _)) => {
                            let won = data == self.cfg.id.as_bytes();
                            return match (won, first) {
                                (true, true) => self.join_workers(true).await,
                                (true, false) => Role::Master,
                                (false, true) => self.join_workers(false).await,
                                (false, false) => Role::Slave,
                            };
                        }
                        // Gone again before we could look: race once more.
                        Err(CoordError::NoNode) => continue,
                        Err(e) => {
                            tracing::error!(node = %self.paths.master, error = %e, "master read failed");
                            return Role::ZkFatal;
                        }
                    }
                }
                Err(e) => {
                    tracing::error!(node = %self.paths.master, error = %e, "master create failed");
                    return Role::ZkFatal;
                }
            }
        }
    }

    /// Append this agent to the workers roster via compare-and-set. Losers
    /// re-read; a roster already at the retry cap turns a would-be slave
    /// away without writing.
    async fn join_workers(&self, as_master: bool) -> Role {
        loop {
            let (data, version) = match self.client.get(&self.paths.workers).await {
                Ok(v) => v,
                Err(e) => {
                    tracing::error!(node = %self.paths.workers, error = %e, "workers read failed");
                    return Role::ZkFatal;
                }
            };

            let mut ids: Vec<String> = if data.is_empty() {
                Vec::new()
            } else {
                match serde_json::from_slice(&data) {
                    Ok(ids) => ids,
                    Err(e) => {
                        tracing::error!(
                            node = %self.paths.workers,
                            payload = %String::from_utf8_lossy(&data),
                            error = %e,
                            "workers content unreadable"
                        );
                        return Role::ZkFatal;
                    }
                }
            };

            if !as_master && ids.len() as u32 >= self.cfg.max_retry {
                return Role::Out;
            }
            ids.push(self.cfg.id.clone());

            let json = serde_json::to_vec(&ids).expect("worker ids serialize");
            tracing::info!(node = %self.paths.workers, payload = %String::from_utf8_lossy(&json), "set workers");

            match self.client.set_cas(&self.paths.workers, &json, version).await {
                Ok(SetOutcome::Applied) => {
                    return if as_master { Role::Master } else { Role::Slave }
                }
                Ok(SetOutcome::Stale) => continue,
                Err(e) => {
                    tracing::error!(node = %self.paths.workers, error = %e, "workers write failed");
                    return Role::ZkFatal;
                }
            }
        }
    }

    /// Arm the one-shot deletion watch on the master node.
    async fn set_watch(&self) -> Role {
        match self
            .client
            .exists_watch(&self.paths.master, self.events.clone())
            .await
        {
            Ok(true) => Role::ZkOk,
            // Master vanished before the watch armed.
            Ok(false) => Role::ZkAgain,
            Err(e) => {
                tracing::error!(node = %self.paths.master, error = %e, "watch install failed");
                Role::ZkFatal
            }
        }
    }

    /// Park until the watcher wakes us, then decide: give up, or promote by
    /// re-running the election until we are master, out, or broken.
    pub async fn suspend(&mut self) {
        tracing::info!(id = %self.cfg.id, task = %self.cfg.name, "suspend");

        let mut rx = self.zk.subscribe();
        loop {
            let status = *rx.borrow_and_update();
            if status != ZkStatus::WorkerSuspend {
                break;
            }
            if rx.changed().await.is_err() {
                break;
            }
        }

        if self.session_gone() {
            return;
        }

        tracing::info!(id = %self.cfg.id, task = %self.cfg.name, "wake up");

        // LLAP tasks always promote; everyone else first consults the
        // terminal status the old master may have left.
        if !self.cfg.llap {
            match self.client.get(&self.paths.status).await {
                Ok((data, _)) => match self.cfg.retry_on {
                    RetryPolicy::OnAbexit => self.role = Role::Out,
                    RetryPolicy::OnCrash => {
                        if let Ok(record) = serde_json::from_slice::<StatusRecord>(&data) {
                            if record.status == 0 {
                                self.role = Role::Out;
                            }
                        }
                    }
                    RetryPolicy::None => {}
                },
                Err(CoordError::NoNode) => {}
                Err(e) => {
                    tracing::error!(node = %self.paths.status, error = %e, "status read failed");
                    self.role = Role::ZkFatal;
                }
            }
        }

        if self.role != Role::Slave {
            return;
        }

        tracing::info!(id = %self.cfg.id, task = %self.cfg.name, "run");
        loop {
            self.role = self.compete_master(false).await;
            match self.role {
                Role::Master => {
                    self.zk.send_replace(ZkStatus::MasterWait);
                }
                Role::Slave => {
                    self.zk.send_replace(ZkStatus::WorkerSuspend);
                    let armed = self.set_watch().await;
                    if armed != Role::ZkOk {
                        self.role = armed;
                    }
                }
                _ => {}
            }
            if self.role != Role::ZkAgain {
                break;
            }
        }
    }

    /// Publish the terminal status of the winning run. Failures are logged;
    /// the run's outcome does not change because the report got lost.
    pub async fn publish_status(&self, exit_status: i32) {
        let record = StatusRecord {
            status: exit_status,
            id: self.cfg.id.clone(),
        };
        let json = serde_json::to_vec(&record).expect("status record serializes");
        tracing::info!(node = %self.paths.status, payload = %String::from_utf8_lossy(&json), "set status");

        if let Err(e) = self.client.set_or_create(&self.paths.status, &json).await {
            tracing::error!(node = %self.paths.status, error = %e, "status write failed");
        }
    }

    /// Publish one per-attempt record.
    pub async fn publish_result(&self, retry: u32, exit_status: i32, error: Option<&str>) {
        let record = ResultRecord {
            status: exit_status,
            id: self.cfg.id.clone(),
            retry,
            error: error.map(str::to_string),
        };
        let json = serde_json::to_vec(&record).expect("result record serializes");
        tracing::info!(node = %self.paths.result, retry, payload = %String::from_utf8_lossy(&json), "set result");

        if let Err(e) = self.client.create_seq(&self.paths.result, &json).await {
            tracing::error!(node = %self.paths.result, error = %e, "result write failed");
        }
    }

    /// Debug snapshot of the task's coordination subtree.
    pub async fn dump(&self) -> serde_json::Value {
        let mut obj = serde_json::Map::new();
        obj.insert("llap".to_string(), self.node_json(&self.paths.llap).await);
        obj.insert(
            "workers".to_string(),
            self.node_json(&self.paths.workers).await,
        );
        obj.insert(
            "status".to_string(),
            self.node_json(&self.paths.status).await,
        );

        let mut results = Vec::new();
        for seq in 0..10 {
            let value = self.node_json(&self.paths.result_at(seq)).await;
            if !value.is_null() {
                results.push(value);
            }
        }
        obj.insert("result".to_string(), serde_json::Value::Array(results));

        obj.insert("taskPath".to_string(), self.paths.task.clone().into());
        obj.insert("statusNode".to_string(), self.paths.status.clone().into());
        obj.insert("workersNode".to_string(), self.paths.workers.clone().into());
        obj.insert("llapNode".to_string(), self.paths.llap.clone().into());

        serde_json::Value::Object(obj)
    }

    async fn node_json(&self, path: &str) -> serde_json::Value {
        match self.client.get(path).await {
            Ok((data, _)) if !data.is_empty() => {
                serde_json::from_slice(&data).unwrap_or(serde_json::Value::Null)
            }
            _ => serde_json::Value::Null,
        }
    }
}
