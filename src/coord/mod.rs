//! Coordination-service facade.
//!
//! The coordination service is an external collaborator reached through the
//! [`CoordBackend`] trait: create / get / set-by-version / exists-with-watch
//! primitives with typed errors. [`CoordClient`] wraps a backend with the
//! retry discipline every caller relies on: transient disconnections are
//! retried up to [`RETRY_MAX`] times with [`RETRY_SLEEP`] between attempts,
//! everything else surfaces immediately.
//!
//! The in-tree backend is [`memory`], a process-shared node tree addressed
//! as `mem://<namespace>`. Production backends plug in behind the same
//! trait.

pub mod memory;
pub mod paths;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;

/// Maximum attempts for a coordination call interrupted by disconnection.
pub const RETRY_MAX: u32 = 100;

/// Pause between retries of a disconnected coordination call.
pub const RETRY_SLEEP: Duration = Duration::from_millis(500);

/// Session establishment timeout handed to the backend.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(15);

/// Version argument that writes unconditionally.
pub const ANY_VERSION: i64 = -1;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CoordError {
    /// Transient loss of the service connection; retryable.
    #[error("transient disconnection")]
    Disconnected,

    #[error("node already exists")]
    NodeExists,

    #[error("no such node")]
    NoNode,

    #[error("version mismatch")]
    BadVersion,

    #[error("session expired")]
    SessionExpired,

    #[error("coordination failure: {0}")]
    Failure(String),
}

pub type CoordResult<T> = std::result::Result<T, CoordError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreateMode {
    Persistent,
    /// Lifetime bound to the creating session.
    Ephemeral,
    /// Persistent, with a monotonic zero-padded suffix appended to the name.
    Sequential,
}

/// Events delivered to watchers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchEvent {
    /// A watched node was deleted (explicitly or by its session ending).
    NodeDeleted,
    /// The watching session itself expired.
    SessionExpired,
}

/// Watchers are channels into whoever owns the reaction, rather than
/// callbacks with a context pointer.
pub type Watcher = mpsc::UnboundedSender<WatchEvent>;

/// Opaque provider of coordination primitives.
#[async_trait]
pub trait CoordBackend: Send + Sync {
    /// Create a node. Returns the path actually created (sequential nodes
    /// get a 10-digit suffix).
    async fn create(&self, path: &str, data: &[u8], mode: CreateMode) -> CoordResult<String>;

    /// Read a node's data and version.
    async fn get(&self, path: &str) -> CoordResult<(Vec<u8>, i64)>;

    /// Write a node's data if `version` matches (or unconditionally for
    /// [`ANY_VERSION`]).
    async fn set(&self, path: &str, data: &[u8], version: i64) -> CoordResult<()>;

    /// Check existence. When `watcher` is given and the node exists, a
    /// one-shot deletion watch is armed on it.
    async fn exists(&self, path: &str, watcher: Option<Watcher>) -> CoordResult<bool>;
}

/// Outcome of a compare-and-set write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SetOutcome {
    Applied,
    /// The node moved under us; re-read and retry.
    Stale,
}

/// Thin retrying facade over a [`CoordBackend`].
#[derive(Clone)]
pub struct CoordClient {
    backend: Arc<dyn CoordBackend>,
}

impl std::fmt::Debug for CoordClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CoordClient").finish_non_exhaustive()
    }
}

impl CoordClient {
    pub fn new(backend: Arc<dyn CoordBackend>) -> Self {
        Self { backend }
    }

    /// Connect to the coordination service named by `hosts` and install the
    /// session watcher. `mem://<namespace>` selects the in-process backend;
    /// other schemes are integration points for real clients.
    pub async fn connect(
        hosts: &str,
        _connect_timeout: Duration,
        session_watcher: Watcher,
    ) -> CoordResult<Self> {
        if let Some(namespace) = hosts.strip_prefix("mem://") {
            let session = memory::MemoryCoord::connect(namespace, session_watcher);
            Ok(Self::new(Arc::new(session)))
        } else {
            Err(CoordError::Failure(format!(
                "unsupported coordination host list {hosts:?} (expected mem://<namespace>)"
            )))
        }
    }

    /// Create a node, surfacing every outcome including disconnection.
    ///
    /// This is the one call that does not retry: the election recovery
    /// protocol has to observe the disconnect itself.
    pub async fn create(&self, path: &str, data: &[u8], mode: CreateMode) -> CoordResult<String> {
        self.backend.create(path, data, mode).await
    }

    /// Create `path` if it does not exist yet. Idempotent.
    pub async fn ensure(&self, path: &str) -> CoordResult<()> {
        self.retry(|| async {
            match self.backend.create(path, &[], CreateMode::Persistent).await {
                Ok(_) | Err(CoordError::NodeExists) => Ok(()),
                Err(e) => Err(e),
            }
        })
        .await
    }

    pub async fn get(&self, path: &str) -> CoordResult<(Vec<u8>, i64)> {
        self.retry(|| self.backend.get(path)).await
    }

    /// Compare-and-set write.
    pub async fn set_cas(&self, path: &str, data: &[u8], version: i64) -> CoordResult<SetOutcome> {
        self.retry(|| async {
            match self.backend.set(path, data, version).await {
                Ok(()) => Ok(SetOutcome::Applied),
                Err(CoordError::BadVersion) => Ok(SetOutcome::Stale),
                Err(e) => Err(e),
            }
        })
        .await
    }

    /// Unconditional write.
    pub async fn set_blind(&self, path: &str, data: &[u8]) -> CoordResult<()> {
        self.retry(|| self.backend.set(path, data, ANY_VERSION)).await
    }

    /// Create `path` with `data`, or overwrite it if it already exists.
    pub async fn set_or_create(&self, path: &str, data: &[u8]) -> CoordResult<()> {
        self.retry(|| async {
            match self.backend.create(path, data, CreateMode::Persistent).await {
                Ok(_) => Ok(()),
                Err(CoordError::NodeExists) => self.backend.set(path, data, ANY_VERSION).await,
                Err(e) => Err(e),
            }
        })
        .await
    }

    /// Append a sequential record under `path`.
    pub async fn create_seq(&self, path: &str, data: &[u8]) -> CoordResult<String> {
        self.retry(|| self.backend.create(path, data, CreateMode::Sequential))
            .await
    }

    /// Check existence and arm a one-shot deletion watch when present.
    /// Returns `true` if the node exists (watch armed), `false` otherwise.
    pub async fn exists_watch(&self, path: &str, watcher: Watcher) -> CoordResult<bool> {
        self.retry(|| self.backend.exists(path, Some(watcher.clone())))
            .await
    }

    async fn retry<T, F, Fut>(&self, mut op: F) -> CoordResult<T>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = CoordResult<T>>,
    {
        let mut attempts = 0;
        loop {
            match op().await {
                Err(CoordError::Disconnected) => {
                    attempts += 1;
                    if attempts >= RETRY_MAX {
                        return Err(CoordError::Disconnected);
                    }
                    tokio::time::sleep(RETRY_SLEEP).await;
                }
                other => return other,
            }
        }
    }
}
