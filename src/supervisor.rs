//! Child-process supervision.
//!
//! The elected master runs the user program under this supervisor: fifo
//! lifecycle, stdio capture, uid/gid switch, address-space limit, exit-code
//! translation and post-exit cleanup. The supervisor is mechanism only — the
//! retry/status policy stays with the invocation loop.

use std::ffi::CString;
use std::fs::{self, File, OpenOptions};
use std::os::unix::fs::OpenOptionsExt;
use std::os::unix::process::ExitStatusExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use nix::sys::resource::{setrlimit, Resource};
use nix::sys::signal::{kill, Signal};
use nix::sys::stat::Mode;
use nix::unistd::{chown, geteuid, initgroups, mkfifo, setgid, setuid, Gid, Pid, Uid};
use tokio::process::{Child, Command};

use crate::config::Config;
use crate::error::Result;
use crate::llap::{read_fifo, EnvMap};

/// Hard cap on child environment entries.
const CHILD_ENV_MAX: usize = 511;

/// Outcome of a spawn attempt.
pub enum Spawned {
    Child(Child),
    /// The program could not be executed; equivalent to the child exiting
    /// `EXIT_FAILURE` right after fork.
    ExecFailed,
}

pub struct Supervisor {
    cfg: Arc<Config>,
    fifo: Option<File>,
}

impl Supervisor {
    pub fn new(cfg: Arc<Config>) -> Self {
        Self { cfg, fifo: None }
    }

    /// Create the fifo, ignoring a leftover one.
    pub fn create_fifo(&self) -> Result<()> {
        match mkfifo(&self.cfg.fifo, Mode::from_bits_truncate(0o644)) {
            Ok(()) | Err(nix::errno::Errno::EEXIST) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Hand the fifo to the task user when one is configured.
    pub fn chown_fifo(&self) -> Result<()> {
        if let Some(run_as) = &self.cfg.run_as {
            chown(
                &self.cfg.fifo,
                Some(Uid::from_raw(run_as.uid)),
                Some(Gid::from_raw(run_as.gid)),
            )?;
        }
        Ok(())
    }

    pub fn remove_fifo(&self) {
        let _ = fs::remove_file(&self.cfg.fifo);
    }

    /// Open the fifo read-only and non-blocking for polling, closing any fd
    /// left over from a previous attempt.
    pub fn open_fifo(&mut self) -> std::io::Result<()> {
        self.fifo = None;
        let file = OpenOptions::new()
            .read(true)
            .custom_flags(libc::O_NONBLOCK)
            .open(&self.cfg.fifo)?;
        self.fifo = Some(file);
        Ok(())
    }

    /// Drain whatever the child has written since the last tick.
    pub fn drain_fifo(&mut self) -> EnvMap {
        match self.fifo.as_mut() {
            Some(file) => read_fifo(file),
            None => EnvMap::new(),
        }
    }

    /// Fork+exec the user program with the llap bag mapped into its
    /// environment.
    pub fn spawn(
        &mut self,
        program: &[String],
        env: &EnvMap,
        stick_hint: bool,
    ) -> std::io::Result<Spawned> {
        let mut cmd = Command::new(&program[0]);
        cmd.args(&program[1..]);
        cmd.env_clear();
        for (k, v) in self.child_env(env, stick_hint) {
            cmd.env(k, v);
        }

        if self.cfg.capture_stdio {
            match self.open_log(&self.stdout_path()) {
                Ok(file) => {
                    cmd.stdout(file);
                }
                Err(e) => tracing::warn!(error = %e, "stdout capture unavailable"),
            }
            match self.open_log(&self.stderr_path()) {
                Ok(file) => {
                    cmd.stderr(file);
                }
                Err(e) => tracing::warn!(error = %e, "stderr capture unavailable"),
            }
        }

        // uid switch and rlimit run between fork and exec. Only root may
        // switch; any failure aborts the exec.
        let switch = match &self.cfg.run_as {
            Some(run_as) if geteuid().is_root() => Some((
                CString::new(run_as.user.clone()).expect("user name has no NUL"),
                Uid::from_raw(run_as.uid),
                Gid::from_raw(run_as.gid),
            )),
            _ => None,
        };
        let rlimit_as = (self.cfg.rlimit_as > 0).then_some(self.cfg.rlimit_as);
        unsafe {
            cmd.pre_exec(move || {
                if let Some((user, uid, gid)) = &switch {
                    setgid(*gid).map_err(errno_to_io)?;
                    initgroups(user, *gid).map_err(errno_to_io)?;
                    setuid(*uid).map_err(errno_to_io)?;
                }
                if let Some(bytes) = rlimit_as {
                    setrlimit(Resource::RLIMIT_AS, bytes, bytes).map_err(errno_to_io)?;
                }
                Ok(())
            });
        }

        match cmd.spawn() {
            Ok(child) => {
                tracing::info!(program = %program.join(" "), pid = ?child.id(), "child started");
                Ok(Spawned::Child(child))
            }
            Err(e)
                if matches!(
                    e.kind(),
                    std::io::ErrorKind::NotFound
                        | std::io::ErrorKind::PermissionDenied
                        | std::io::ErrorKind::InvalidInput
                ) =>
            {
                tracing::error!(program = %program.join(" "), error = %e, "exec failed");
                Ok(Spawned::ExecFailed)
            }
            Err(e) => Err(e),
        }
    }

    /// Non-blocking wait. `Some(code)` carries the translated exit code.
    pub fn poll(&self, child: &mut Child) -> std::io::Result<Option<i32>> {
        Ok(child.try_wait()?.map(translate_exit))
    }

    /// Ask the child to terminate (session teardown).
    pub fn terminate(&self, child: &Child) {
        if let Some(pid) = child.id() {
            let _ = kill(Pid::from_raw(pid as i32), Signal::SIGTERM);
        }
    }

    /// Drop capture files that ended up empty.
    pub fn cleanup_logs(&self) {
        if !self.cfg.capture_stdio {
            return;
        }
        for path in [self.stdout_path(), self.stderr_path()] {
            if fs::metadata(&path).map(|m| m.len() == 0).unwrap_or(false) {
                let _ = fs::remove_file(&path);
            }
        }
    }

    fn stdout_path(&self) -> PathBuf {
        self.cfg.logdir.join(format!("{}.stdout", self.cfg.name))
    }

    fn stderr_path(&self) -> PathBuf {
        self.cfg.logdir.join(format!("{}.stderr", self.cfg.name))
    }

    fn open_log(&self, path: &Path) -> std::io::Result<File> {
        OpenOptions::new()
            .create(true)
            .append(true)
            .mode(0o644)
            .open(path)
    }

    /// Child environment: `DCRON_FIFO` first, the llap bag as `DCRON_<K>`,
    /// then the inherited environment. First occurrence of a name wins, and
    /// the total is capped at [`CHILD_ENV_MAX`] entries.
    fn child_env(&self, env: &EnvMap, stick_hint: bool) -> Vec<(String, String)> {
        let mut entries: Vec<(String, String)> = Vec::new();
        entries.push((
            "DCRON_FIFO".to_string(),
            self.cfg.fifo.display().to_string(),
        ));
        for (k, v) in env.iter() {
            entries.push((format!("DCRON_{k}"), v.to_string()));
        }
        if stick_hint {
            entries.push(("DCRON_TEST_STICK".to_string(), self.cfg.id.clone()));
        }
        for (k, v) in std::env::vars() {
            if entries.len() >= CHILD_ENV_MAX {
                break;
            }
            if entries.iter().any(|(name, _)| *name == k) {
                continue;
            }
            entries.push((k, v));
        }
        entries
    }
}

fn errno_to_io(e: nix::errno::Errno) -> std::io::Error {
    std::io::Error::from_raw_os_error(e as i32)
}

/// Normal exit keeps its code; death by signal N becomes `128 + N`.
fn translate_exit(status: std::process::ExitStatus) -> i32 {
    if let Some(code) = status.code() {
        code
    } else if let Some(sig) = status.signal() {
        128 + sig
    } else {
        status.into_raw()
    }
}
