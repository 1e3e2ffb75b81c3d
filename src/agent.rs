//! Single-invocation orchestration.
//!
//! The [`Agent`] owns one invocation from connect to exit code: consult the
//! stick marker, run the election, and then either supervise the user
//! program (master) or park on the master watch (slave). The master's
//! supervision loop ticks every 10 ms: reap the child, drain the fifo into
//! the llap node, and bail out with `SIGTERM` if the session expires.

use std::io::Write;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;

use crate::config::{Config, RetryPolicy};
use crate::coord::paths::TaskPaths;
use crate::coord::{CoordClient, CONNECT_TIMEOUT};
use crate::elector::{Elector, Role, ZkStatus};
use crate::error::Result;
use crate::llap::EnvChannel;
use crate::stick;
use crate::supervisor::{Spawned, Supervisor};

/// Exit and record code for failures inside the agent itself.
pub const INTERNAL_ERROR_STATUS: i32 = 254;

const POLL_TICK: Duration = Duration::from_millis(10);

pub struct Agent {
    cfg: Arc<Config>,
    elector: Elector,
    supervisor: Supervisor,
    env_channel: EnvChannel,
    program: Vec<String>,
    stick_raced: bool,
}

impl Agent {
    /// Connect, materialize the task's node tree and wire up the components.
    pub async fn bootstrap(cfg: Arc<Config>, program: Vec<String>) -> Result<Self> {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let client = CoordClient::connect(&cfg.hosts, CONNECT_TIMEOUT, events_tx.clone()).await?;

        let paths = TaskPaths::derive(&cfg.name)?;
        paths.ensure(&client).await?;

        let env_channel = EnvChannel::new(client.clone(), paths.llap.clone());
        let elector = Elector::new(cfg.clone(), client, paths, events_tx, events_rx);
        let supervisor = Supervisor::new(cfg.clone());

        Ok(Self {
            cfg,
            elector,
            supervisor,
            env_channel,
            program,
            stick_raced: false,
        })
    }

    /// Drive the invocation to completion and return the process exit code.
    pub async fn run(mut self) -> i32 {
        let code = self.lifecycle().await;
        if let Some(path) = self.cfg.zkdump.clone() {
            self.write_dump(&path).await;
        }
        code
    }

    async fn lifecycle(&mut self) -> i32 {
        self.stick_raced = stick::consume(&self.cfg.libdir, &self.cfg.name, self.cfg.stick_secs);
        let race = self.stick_raced || self.cfg.test_crash;
        if self.stick_raced {
            tracing::info!(id = %self.cfg.id, task = %self.cfg.name, "stick window hit, racing");
        }

        self.elector.startup(race).await;
        loop {
            match self.elector.role() {
                Role::Master => return self.run_master().await,
                Role::Slave => {
                    self.elector.suspend().await;
                    if self.elector.session_gone() {
                        tracing::info!(id = %self.cfg.id, task = %self.cfg.name, "session gone while standing by");
                        return 0;
                    }
                }
                Role::Out => {
                    tracing::info!(id = %self.cfg.id, task = %self.cfg.name, "standing down");
                    return 0;
                }
                Role::ZkOk | Role::ZkAgain | Role::ZkFatal => {
                    self.elector
                        .publish_result(0, INTERNAL_ERROR_STATUS, Some("zk error"))
                        .await;
                    return INTERNAL_ERROR_STATUS;
                }
            }
        }
    }

    /// The master side: run the program, feed the llap node, report.
    async fn run_master(&mut self) -> i32 {
        if self.cfg.test_crash {
            std::process::abort();
        }

        let env = match self.env_channel.load().await {
            Ok(env) => env,
            Err(e) => {
                tracing::error!(error = %e, "llap load failed");
                self.elector
                    .publish_result(0, INTERNAL_ERROR_STATUS, Some("zk error"))
                    .await;
                return INTERNAL_ERROR_STATUS;
            }
        };

        if let Err(e) = self.supervisor.create_fifo() {
            tracing::error!(fifo = %self.cfg.fifo.display(), error = %e, "mkfifo failed");
            self.elector
                .publish_result(0, INTERNAL_ERROR_STATUS, Some("mkfifo error"))
                .await;
            return INTERNAL_ERROR_STATUS;
        }
        if let Err(e) = self.supervisor.chown_fifo() {
            tracing::error!(fifo = %self.cfg.fifo.display(), error = %e, "chown failed");
            self.elector
                .publish_result(0, INTERNAL_ERROR_STATUS, Some("chown error"))
                .await;
            return INTERNAL_ERROR_STATUS;
        }

        let stick_hint = self.stick_raced && self.cfg.zkdump.is_some();
        let mut exit_status = INTERNAL_ERROR_STATUS;
        let mut attempt: u32 = 0;
        let mut retry = true;

        while retry {
            retry = false;

            if let Err(e) = self.supervisor.open_fifo() {
                tracing::error!(fifo = %self.cfg.fifo.display(), error = %e, "fifo open failed");
                self.elector
                    .publish_result(attempt, INTERNAL_ERROR_STATUS, Some("fifo error"))
                    .await;
                exit_status = INTERNAL_ERROR_STATUS;
                break;
            }

            let spawned = match self.supervisor.spawn(&self.program, &env, stick_hint) {
                Ok(spawned) => spawned,
                Err(e) => {
                    tracing::error!(program = %self.program.join(" "), error = %e, "fork failed");
                    self.elector
                        .publish_result(attempt, INTERNAL_ERROR_STATUS, Some("fork error"))
                        .await;
                    exit_status = INTERNAL_ERROR_STATUS;
                    break;
                }
            };

            match spawned {
                Spawned::ExecFailed => {
                    // The child would have died with EXIT_FAILURE right
                    // after fork; account for it the same way.
                    exit_status = 1;
                    self.conclude_attempt(1, attempt, &mut retry).await;
                }
                Spawned::Child(mut child) => loop {
                    let exited = match self.supervisor.poll(&mut child) {
                        Ok(exited) => exited,
                        Err(e) => {
                            tracing::error!(task = %self.cfg.name, error = %e, "waitpid failed");
                            self.elector
                                .publish_result(attempt, INTERNAL_ERROR_STATUS, Some("waitpid error"))
                                .await;
                            exit_status = INTERNAL_ERROR_STATUS;
                            break;
                        }
                    };

                    if let Some(code) = exited {
                        exit_status = code;
                        self.conclude_attempt(code, attempt, &mut retry).await;
                    }

                    // Drain after the exit decision so records written right
                    // before death still reach the llap node.
                    let updates = self.supervisor.drain_fifo();
                    if !updates.is_empty() {
                        if let Err(e) = self.env_channel.merge_and_persist(&updates).await {
                            tracing::error!(error = %e, "llap update failed");
                        }
                    }

                    if exited.is_some() {
                        break;
                    }
                    if self.elector.zk_status() == ZkStatus::SessionGone {
                        self.supervisor.terminate(&child);
                        tracing::error!(task = %self.cfg.name, "session expired, lost master, exit");
                        break;
                    }
                    tokio::time::sleep(POLL_TICK).await;
                },
            }

            attempt += 1;
        }

        self.supervisor.remove_fifo();
        exit_status
    }

    /// The exit decision: write the terminal `status` for a conclusive
    /// attempt, or a `result` record plus another round under on-abexit.
    async fn conclude_attempt(&mut self, code: i32, attempt: u32, retry: &mut bool) {
        let conclusive = code == 0
            || matches!(self.cfg.retry_on, RetryPolicy::None | RetryPolicy::OnCrash)
            || attempt + 1 >= self.cfg.max_retry;

        if conclusive {
            self.elector.publish_status(code).await;
        } else {
            self.elector.publish_result(attempt, code, None).await;
            *retry = true;
        }

        self.supervisor.cleanup_logs();
        if self.cfg.stick_secs > 0 {
            stick::mark(&self.cfg.libdir, &self.cfg.name);
        }
    }

    async fn write_dump(&self, path: &Path) {
        let snapshot = self.elector.dump().await;
        let result = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .and_then(|mut file| writeln!(file, "{snapshot}"));
        if let Err(e) = result {
            tracing::warn!(path = %path.display(), error = %e, "zkdump write failed");
        }
    }
}
