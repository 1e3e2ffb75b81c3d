//! In-process coordination backend.
//!
//! Implements the [`CoordBackend`] trait against a process-shared node tree,
//! one tree per namespace. Several sessions attached to the same namespace
//! coordinate exactly like agents attached to the same service: ephemeral
//! nodes disappear when their session ends, deletion watches fire, versioned
//! writes conflict.
//!
//! Not a production backend — no cross-process visibility, no persistence.
//! It exists so the election and failover machinery can be exercised without
//! a running coordination service, plus failure injection the tests drive:
//! [`Cluster::expire_session`], [`Cluster::expire_owner`] and
//! [`Cluster::inject_disconnects`].

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, OnceLock};

use async_trait::async_trait;

use super::{CoordBackend, CoordError, CoordResult, CreateMode, WatchEvent, Watcher, ANY_VERSION};

pub type SessionId = u64;

#[derive(Debug, Clone)]
struct Node {
    data: Vec<u8>,
    version: i64,
    ephemeral_owner: Option<SessionId>,
}

#[derive(Default)]
struct State {
    nodes: HashMap<String, Node>,
    /// One-shot deletion watches, tagged with the arming session.
    watches: HashMap<String, Vec<(SessionId, Watcher)>>,
    sessions: HashMap<SessionId, SessionInfo>,
    /// Monotonic suffix counter per sequential-path prefix.
    sequences: HashMap<String, u64>,
    next_session: SessionId,
}

struct SessionInfo {
    watcher: Watcher,
    alive: bool,
}

/// A namespaced coordination tree shared by every session in the process.
pub struct Cluster {
    state: Mutex<State>,
    pending_disconnects: AtomicU32,
}

fn registry() -> &'static Mutex<HashMap<String, Arc<Cluster>>> {
    static REGISTRY: OnceLock<Mutex<HashMap<String, Arc<Cluster>>>> = OnceLock::new();
    REGISTRY.get_or_init(|| Mutex::new(HashMap::new()))
}

/// Fetch (creating on first use) the cluster for `namespace`.
pub fn cluster(namespace: &str) -> Arc<Cluster> {
    registry()
        .lock()
        .unwrap()
        .entry(namespace.to_string())
        .or_insert_with(|| {
            Arc::new(Cluster {
                state: Mutex::new(State::default()),
                pending_disconnects: AtomicU32::new(0),
            })
        })
        .clone()
}

impl Cluster {
    fn open_session(self: &Arc<Self>, watcher: Watcher) -> SessionId {
        let mut state = self.state.lock().unwrap();
        let id = state.next_session;
        state.next_session += 1;
        state.sessions.insert(
            id,
            SessionInfo {
                watcher,
                alive: true,
            },
        );
        id
    }

    /// Make the next `n` operations fail with a transient disconnection.
    pub fn inject_disconnects(&self, n: u32) {
        self.pending_disconnects.store(n, Ordering::SeqCst);
    }

    /// Expire a session: its ephemerals vanish (firing deletion watches held
    /// by other sessions) and the session's own watchers observe expiry.
    pub fn expire_session(&self, session: SessionId) {
        self.end_session(session, true);
    }

    /// Expire the session owning the ephemeral node at `path`, if any.
    /// Returns the expired session id.
    pub fn expire_owner(&self, path: &str) -> Option<SessionId> {
        let owner = {
            let state = self.state.lock().unwrap();
            state.nodes.get(path)?.ephemeral_owner?
        };
        self.end_session(owner, true);
        Some(owner)
    }

    /// Read a node's data, outside any session. Test inspection only.
    pub fn read(&self, path: &str) -> Option<Vec<u8>> {
        self.state
            .lock()
            .unwrap()
            .nodes
            .get(path)
            .map(|n| n.data.clone())
    }

    pub fn node_exists(&self, path: &str) -> bool {
        self.state.lock().unwrap().nodes.contains_key(path)
    }

    fn end_session(&self, session: SessionId, expired: bool) {
        let mut state = self.state.lock().unwrap();
        let was_alive = match state.sessions.get_mut(&session) {
            Some(info) => std::mem::replace(&mut info.alive, false),
            None => return,
        };
        if !was_alive {
            return;
        }

        // The expiring session's own watches fire SessionExpired wherever
        // they are armed; the session-level watcher hears it too.
        if expired {
            for watchers in state.watches.values_mut() {
                watchers.retain(|(sid, tx)| {
                    if *sid == session {
                        let _ = tx.send(WatchEvent::SessionExpired);
                        false
                    } else {
                        true
                    }
                });
            }
            if let Some(info) = state.sessions.get(&session) {
                let _ = info.watcher.send(WatchEvent::SessionExpired);
            }
        } else {
            for watchers in state.watches.values_mut() {
                watchers.retain(|(sid, _)| *sid != session);
            }
        }

        // Ephemerals owned by the session vanish; deletion watches fire.
        let removed: Vec<String> = state
            .nodes
            .iter()
            .filter(|(_, n)| n.ephemeral_owner == Some(session))
            .map(|(p, _)| p.clone())
            .collect();
        for path in removed {
            state.nodes.remove(&path);
            if let Some(watchers) = state.watches.remove(&path) {
                for (_, tx) in watchers {
                    let _ = tx.send(WatchEvent::NodeDeleted);
                }
            }
        }
    }

    fn check_op(&self, session: SessionId) -> CoordResult<()> {
        loop {
            let n = self.pending_disconnects.load(Ordering::SeqCst);
            if n == 0 {
                break;
            }
            if self
                .pending_disconnects
                .compare_exchange(n, n - 1, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
            {
                return Err(CoordError::Disconnected);
            }
        }
        let state = self.state.lock().unwrap();
        match state.sessions.get(&session) {
            Some(info) if info.alive => Ok(()),
            _ => Err(CoordError::SessionExpired),
        }
    }

    fn create(
        &self,
        session: SessionId,
        path: &str,
        data: &[u8],
        mode: CreateMode,
    ) -> CoordResult<String> {
        let mut state = self.state.lock().unwrap();

        let name = match mode {
            CreateMode::Sequential => {
                let seq = state.sequences.entry(path.to_string()).or_insert(0);
                let name = format!("{path}{:010}", *seq);
                *seq += 1;
                name
            }
            _ => path.to_string(),
        };

        if let Some(parent) = parent_of(&name) {
            if !state.nodes.contains_key(parent) {
                return Err(CoordError::NoNode);
            }
        }
        if state.nodes.contains_key(&name) {
            return Err(CoordError::NodeExists);
        }

        state.nodes.insert(
            name.clone(),
            Node {
                data: data.to_vec(),
                version: 0,
                ephemeral_owner: (mode == CreateMode::Ephemeral).then_some(session),
            },
        );
        Ok(name)
    }

    fn get(&self, path: &str) -> CoordResult<(Vec<u8>, i64)> {
        let state = self.state.lock().unwrap();
        state
            .nodes
            .get(path)
            .map(|n| (n.data.clone(), n.version))
            .ok_or(CoordError::NoNode)
    }

    fn set(&self, path: &str, data: &[u8], version: i64) -> CoordResult<()> {
        let mut state = self.state.lock().unwrap();
        let node = state.nodes.get_mut(path).ok_or(CoordError::NoNode)?;
        if version != ANY_VERSION && version != node.version {
            return Err(CoordError::BadVersion);
        }
        node.data = data.to_vec();
        node.version += 1;
        Ok(())
    }

    fn exists(&self, session: SessionId, path: &str, watcher: Option<Watcher>) -> bool {
        let mut state = self.state.lock().unwrap();
        if state.nodes.contains_key(path) {
            if let Some(tx) = watcher {
                state
                    .watches
                    .entry(path.to_string())
                    .or_default()
                    .push((session, tx));
            }
            true
        } else {
            false
        }
    }
}

fn parent_of(path: &str) -> Option<&str> {
    match path.rfind('/') {
        Some(0) | None => None,
        Some(i) => Some(&path[..i]),
    }
}

/// One session against a namespaced [`Cluster`].
pub struct MemoryCoord {
    cluster: Arc<Cluster>,
    session: SessionId,
}

impl MemoryCoord {
    /// Open a session on `namespace`, installing the session-level watcher.
    pub fn connect(namespace: &str, session_watcher: Watcher) -> Self {
        let cluster = cluster(namespace);
        let session = cluster.open_session(session_watcher);
        Self { cluster, session }
    }

    pub fn session_id(&self) -> SessionId {
        self.session
    }
}

impl Drop for MemoryCoord {
    fn drop(&mut self) {
        // Graceful close: ephemerals vanish, no expiry events.
        self.cluster.end_session(self.session, false);
    }
}

#[async_trait]
impl CoordBackend for MemoryCoord {
    async fn create(&self, path: &str, data: &[u8], mode: CreateMode) -> CoordResult<String> {
        self.cluster.check_op(self.session)?;
        self.cluster.create(self.session, path, data, mode)
    }

    async fn get(&self, path: &str) -> CoordResult<(Vec<u8>, i64)> {
        self.cluster.check_op(self.session)?;
        self.cluster.get(path)
    }

    async fn set(&self, path: &str, data: &[u8], version: i64) -> CoordResult<()> {
        self.cluster.check_op(self.session)?;
        self.cluster.set(path, data, version)
    }

    async fn exists(&self, path: &str, watcher: Option<Watcher>) -> CoordResult<bool> {
        self.cluster.check_op(self.session)?;
        Ok(self.cluster.exists(self.session, path, watcher))
    }
}
