//! Long-lived-application environment channel.
//!
//! Successive masters of an LLAP task exchange a small env bag through one
//! group-level coordination node holding a JSON array of `{k,v}` pairs. The
//! bag is bounded to [`ENV_ITEM_MAX`] entries; on overflow the oldest entry
//! (insertion order) is evicted. While the child runs it can stream
//! `KEY=VALUE` lines into the agent's fifo; each poll tick drains the fifo
//! and pushes the accumulated updates back to the node.

use std::io::Read;

use serde::{Deserialize, Serialize};

use crate::coord::{CoordClient, CoordResult};
use crate::error::{AgentError, Result};

/// Cap on entries carried between invocations.
pub const ENV_ITEM_MAX: usize = 5;

/// Wire form of one bag entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlapEntry {
    pub k: String,
    pub v: String,
}

/// Insertion-ordered map bounded to [`ENV_ITEM_MAX`] entries.
///
/// Re-inserting an existing key updates it in place; a brand-new key that
/// overflows the cap evicts from the front.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EnvMap {
    items: Vec<(String, String)>,
}

impl EnvMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, key: &str, value: &str) {
        if let Some(slot) = self.items.iter_mut().find(|(k, _)| k == key) {
            slot.1 = value.to_string();
            return;
        }
        self.items.push((key.to_string(), value.to_string()));
        while self.items.len() > ENV_ITEM_MAX {
            self.items.remove(0);
        }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.items
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.items.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    fn to_entries(&self) -> Vec<LlapEntry> {
        self.items
            .iter()
            .map(|(k, v)| LlapEntry {
                k: k.clone(),
                v: v.clone(),
            })
            .collect()
    }
}

/// The coordination-side half of the channel.
pub struct EnvChannel {
    client: CoordClient,
    node: String,
}

impl EnvChannel {
    pub fn new(client: CoordClient, node: String) -> Self {
        Self { client, node }
    }

    /// Read the bag for the child's starting environment. Malformed node
    /// content is fatal here: the bag is this task's contract.
    pub async fn load(&self) -> Result<EnvMap> {
        let (data, _) = self.client.get(&self.node).await?;
        let mut map = EnvMap::new();
        if data.is_empty() {
            return Ok(map);
        }
        let entries: Vec<LlapEntry> =
            serde_json::from_slice(&data).map_err(|e| AgentError::BadData {
                path: self.node.clone(),
                detail: e.to_string(),
            })?;
        for entry in entries {
            map.insert(&entry.k, &entry.v);
        }
        Ok(map)
    }

    /// Union `updates` into the stored bag and write it back blind
    /// (version −1). A racing writer can lose updates; the protocol accepts
    /// that. Unparsable stored content degrades to an empty bag.
    pub async fn merge_and_persist(&self, updates: &EnvMap) -> CoordResult<()> {
        let (data, _) = self.client.get(&self.node).await?;

        let mut merged = EnvMap::new();
        if !data.is_empty() {
            if let Ok(entries) = serde_json::from_slice::<Vec<LlapEntry>>(&data) {
                for entry in entries {
                    merged.insert(&entry.k, &entry.v);
                }
            }
        }
        for (k, v) in updates.iter() {
            merged.insert(k, v);
        }

        let json = serde_json::to_vec(&merged.to_entries()).expect("llap entries serialize");
        tracing::info!(node = %self.node, payload = %String::from_utf8_lossy(&json), "set llap");
        self.client.set_blind(&self.node, &json).await
    }
}

/// Drain the fifo without blocking and parse `KEY=VALUE\n` records.
///
/// Reads come in `PIPE_BUF`-sized chunks and each chunk is parsed on its
/// own: a record straddling a chunk boundary is dropped. Known limitation,
/// kept deliberately.
pub fn read_fifo(fifo: &mut std::fs::File) -> EnvMap {
    let mut map = EnvMap::new();
    let mut buffer = [0u8; libc::PIPE_BUF];
    loop {
        match fifo.read(&mut buffer) {
            Ok(0) => break,
            Ok(n) => parse_records(&mut map, &buffer[..n]),
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => {
                tracing::error!(error = %e, "fifo read error");
                break;
            }
        }
    }
    map
}

fn parse_records(map: &mut EnvMap, chunk: &[u8]) {
    let mut start = 0;
    let mut eq = None;
    for (i, &b) in chunk.iter().enumerate() {
        match b {
            b'=' => {
                if eq.is_none() {
                    eq = Some(i);
                }
            }
            b'\n' => {
                if let Some(e) = eq {
                    let key = String::from_utf8_lossy(&chunk[start..e]);
                    let value = String::from_utf8_lossy(&chunk[e + 1..i]);
                    map.insert(&key, &value);
                }
                eq = None;
                start = i + 1;
            }
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::File;
    use std::io::Write;
    use std::sync::Arc;
    use tokio::sync::mpsc;

    use crate::coord::{memory, CoordClient};

    #[test]
    fn env_map_bounds_to_five_in_insertion_order() {
        let mut map = EnvMap::new();
        for (k, v) in [("a", "1"), ("b", "2"), ("c", "3"), ("d", "4"), ("e", "5"), ("f", "6"), ("g", "7")] {
            map.insert(k, v);
        }
        let keys: Vec<&str> = map.iter().map(|(k, _)| k).collect();
        assert_eq!(keys, ["c", "d", "e", "f", "g"]);
    }

    #[test]
    fn reinsert_updates_in_place() {
        let mut map = EnvMap::new();
        map.insert("a", "1");
        map.insert("b", "2");
        map.insert("a", "9");
        let items: Vec<(&str, &str)> = map.iter().collect();
        assert_eq!(items, [("a", "9"), ("b", "2")]);
    }

    fn os_pipe() -> (File, File) {
        let (read_fd, write_fd) = nix::unistd::pipe().unwrap();
        (File::from(read_fd), File::from(write_fd))
    }

    #[test]
    fn fifo_records_round_trip_keeping_last_five() {
        let (mut reader, mut writer) = os_pipe();
        for i in 0..7 {
            writeln!(writer, "k{i}=v{i}").unwrap();
        }
        drop(writer);

        let map = read_fifo(&mut reader);
        let keys: Vec<&str> = map.iter().map(|(k, _)| k).collect();
        assert_eq!(keys, ["k2", "k3", "k4", "k5", "k6"]);
        assert_eq!(map.get("k6"), Some("v6"));
    }

    #[test]
    fn partial_record_at_chunk_end_is_dropped() {
        let mut map = EnvMap::new();
        parse_records(&mut map, b"a=1\nb=2");
        let keys: Vec<&str> = map.iter().map(|(k, _)| k).collect();
        assert_eq!(keys, ["a"]);

        // A record with no '=' before its newline is skipped too.
        parse_records(&mut map, b"junk\nc=3\n");
        let keys: Vec<&str> = map.iter().map(|(k, _)| k).collect();
        assert_eq!(keys, ["a", "c"]);
    }

    async fn channel(ns: &str) -> EnvChannel {
        let (tx, _rx) = mpsc::unbounded_channel();
        let client = CoordClient::new(Arc::new(memory::MemoryCoord::connect(ns, tx)));
        client.ensure("/g").await.unwrap();
        client.ensure("/g/llap").await.unwrap();
        EnvChannel::new(client, "/g/llap".to_string())
    }

    #[tokio::test]
    async fn merge_unions_and_bounds() {
        let chan = channel("llap-merge").await;

        let mut first = EnvMap::new();
        first.insert("a", "1");
        chan.merge_and_persist(&first).await.unwrap();

        let mut second = EnvMap::new();
        second.insert("b", "2");
        second.insert("c", "3");
        chan.merge_and_persist(&second).await.unwrap();

        let loaded = chan.load().await.unwrap();
        let items: Vec<(&str, &str)> = loaded.iter().collect();
        assert_eq!(items, [("a", "1"), ("b", "2"), ("c", "3")]);
    }

    #[tokio::test]
    async fn merge_treats_garbage_node_as_empty() {
        let chan = channel("llap-garbage").await;
        chan.client.set_blind("/g/llap", b"not json").await.unwrap();

        let mut updates = EnvMap::new();
        updates.insert("x", "1");
        chan.merge_and_persist(&updates).await.unwrap();

        let loaded = chan.load().await.unwrap();
        assert_eq!(loaded.get("x"), Some("1"));
        assert_eq!(loaded.len(), 1);
    }

    #[tokio::test]
    async fn load_rejects_garbage() {
        let chan = channel("llap-load-garbage").await;
        chan.client.set_blind("/g/llap", b"not json").await.unwrap();
        assert!(chan.load().await.is_err());
    }
}
