//! Local affinity marker ("stick").
//!
//! The agent that last concluded an attempt for a task leaves
//! `<libdir>/<basename>.stick` holding the epoch seconds of that run. On the
//! next invocation the marker is read and unlinked; if it is fresh enough the
//! agent races the election without jitter, biasing leadership toward the
//! previous master. The basename is the task name with its final dot segment
//! (the date-derived taskid) stripped.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

fn stick_path(libdir: &Path, name: &str) -> Option<PathBuf> {
    let basename = &name[..name.rfind('.')?];
    Some(libdir.join(format!("{basename}.stick")))
}

fn epoch_secs() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

/// Read and unlink the marker. Returns true when the recorded run is less
/// than `window` seconds old. The file is consumed regardless of the answer.
pub fn consume(libdir: &Path, name: &str, window: u64) -> bool {
    let Some(path) = stick_path(libdir, name) else {
        return false;
    };
    let Ok(contents) = fs::read_to_string(&path) else {
        return false;
    };

    let fresh = contents
        .trim()
        .parse::<i64>()
        .map(|last| epoch_secs() - last < window as i64)
        .unwrap_or(false);

    let _ = fs::remove_file(&path);
    fresh
}

/// Record the current time. Best-effort: failures are logged, never fatal.
pub fn mark(libdir: &Path, name: &str) {
    let Some(path) = stick_path(libdir, name) else {
        tracing::warn!(name, "stick mark skipped, task name has no basename");
        return;
    };
    if let Err(e) = fs::write(&path, epoch_secs().to_string()) {
        tracing::warn!(path = %path.display(), error = %e, "stick mark failed");
    }
}
