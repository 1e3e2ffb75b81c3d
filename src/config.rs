//! Agent configuration.
//!
//! Settings are resolved name by name: `KEY=VALUE` tokens given on the
//! command line before `--` win over environment variables of the same
//! name. The parsed [`Config`] is immutable for the lifetime of the
//! invocation.

use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;

use chrono::format::{Item, StrftimeItems};
use chrono::Local;
use nix::unistd::{Group, User};

use crate::error::{AgentError, Result};

/// When a failed master's standbys may take over.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryPolicy {
    /// Standbys never promote.
    None,
    /// Promote unless the task already concluded successfully.
    OnCrash,
    /// Promote only while no terminal status exists at all.
    OnAbexit,
}

/// Identity the child process runs as.
#[derive(Debug, Clone)]
pub struct RunAs {
    pub user: String,
    pub uid: u32,
    pub gid: u32,
}

#[derive(Debug, Clone)]
pub struct Config {
    /// Agent identity; defaults to the IPv4 address of `eth0`.
    pub id: String,
    /// Coordination host list.
    pub hosts: String,
    /// Expanded task name, `group...taskid` dotted.
    pub name: String,
    pub max_retry: u32,
    pub retry_on: RetryPolicy,
    pub llap: bool,
    /// Affinity window in seconds; 0 disables the stick race.
    pub stick_secs: u64,
    pub capture_stdio: bool,
    pub libdir: PathBuf,
    pub logdir: PathBuf,
    pub run_as: Option<RunAs>,
    /// Child address-space limit in bytes; 0 leaves it unset.
    pub rlimit_as: u64,
    /// Derived: `<libdir>/<name>.fifo`.
    pub fifo: PathBuf,
    /// Debug dump target for the coordination tree.
    pub zkdump: Option<PathBuf>,
    pub test_crash: bool,
    pub test_connloss_compete_success: bool,
    pub test_connloss_compete_failure: bool,
}

const MAX_RETRY_CAP: u32 = 5;

/// Name-by-name lookup: argv overrides first, then the environment.
struct EnvSource {
    overrides: HashMap<String, String>,
}

impl EnvSource {
    fn new(overrides: Vec<(String, String)>) -> Self {
        Self {
            overrides: overrides.into_iter().collect(),
        }
    }

    fn get(&self, name: &str) -> Option<String> {
        self.overrides
            .get(name)
            .cloned()
            .or_else(|| std::env::var(name).ok())
    }

    fn get_or(&self, name: &str, default: &str) -> String {
        self.get(name).unwrap_or_else(|| default.to_string())
    }

    fn get_u64(&self, name: &str, default: u64) -> Result<u64> {
        match self.get(name) {
            None => Ok(default),
            Some(raw) => raw
                .parse()
                .map_err(|_| AgentError::Config(format!("{name} is not a number: {raw:?}"))),
        }
    }

    fn get_bool(&self, name: &str, default: bool) -> Result<bool> {
        match self.get(name).as_deref() {
            None => Ok(default),
            Some("true") | Some("1") => Ok(true),
            Some("false") | Some("0") => Ok(false),
            Some(raw) => Err(AgentError::Config(format!(
                "{name} is not a boolean: {raw:?}"
            ))),
        }
    }
}

impl Config {
    /// Resolve the full configuration from argv overrides plus the
    /// environment.
    pub fn load(overrides: Vec<(String, String)>) -> Result<Self> {
        let env = EnvSource::new(overrides);

        let id = match env.get("DCRON_ID") {
            Some(id) => id,
            None => primary_ipv4("eth0").ok_or_else(|| {
                AgentError::Config("DCRON_ID unset and eth0 has no IPv4 address".to_string())
            })?,
        };

        let hosts = env
            .get("DCRON_ZK")
            .ok_or_else(|| AgentError::Config("DCRON_ZK is required".to_string()))?;

        let max_retry = (env.get_u64("DCRON_MAXRETRY", 2)? as u32).min(MAX_RETRY_CAP);

        let mut retry_on = match env.get_or("DCRON_RETRYON", "CRASH").as_str() {
            "CRASH" => RetryPolicy::OnCrash,
            "ABEXIT" => RetryPolicy::OnAbexit,
            _ => RetryPolicy::None,
        };

        let llap = env.get_bool("DCRON_LLAP", false)?;
        let stick_secs = env.get_u64("DCRON_STICK", if llap { 90 } else { 0 })?;
        let capture_stdio = env.get_bool("DCRON_STDIOCAP", !llap)?;

        let libdir = PathBuf::from(env.get_or("DCRON_LIBDIR", "/var/lib/dcron"));
        let logdir = PathBuf::from(env.get_or("DCRON_LOGDIR", "/var/log/dcron"));
        for dir in [&libdir, &logdir] {
            if !fs::metadata(dir).map(|m| m.is_dir()).unwrap_or(false) {
                return Err(AgentError::Config(format!(
                    "{} is not a directory",
                    dir.display()
                )));
            }
        }

        let run_as = match env.get("DCRON_USER") {
            Some(spec) if !spec.is_empty() => Some(parse_user(&spec)?),
            _ => None,
        };

        let rlimit_as = env.get_u64("DCRON_RLIMIT_AS", 0)?;

        let mut template = env
            .get("DCRON_NAME")
            .ok_or_else(|| AgentError::Config("DCRON_NAME is required".to_string()))?;
        if llap {
            template.push_str(".%Y%m%d_%H%M");
        }
        let name = expand_name(&template)?;
        if !name.contains('.') {
            return Err(AgentError::Config(format!(
                "task name {name:?} must be dotted, like group.task"
            )));
        }

        // LLAP tasks always retry on crash, whatever DCRON_RETRYON said.
        if llap {
            retry_on = RetryPolicy::OnCrash;
        }

        let fifo = libdir.join(format!("{name}.fifo"));

        Ok(Self {
            id,
            hosts,
            name,
            max_retry,
            retry_on,
            llap,
            stick_secs,
            capture_stdio,
            libdir,
            logdir,
            run_as,
            rlimit_as,
            fifo,
            zkdump: env.get("DCRON_ZKDUMP").map(PathBuf::from),
            test_crash: env.get_bool("DCRON_TEST_CRASH", false)?,
            test_connloss_compete_success: env
                .get_bool("DCRON_TEST_CONNECTIONLOSS_WHEN_COMPETE_MASTER_SUCCESS", false)?,
            test_connloss_compete_failure: env
                .get_bool("DCRON_TEST_CONNECTIONLOSS_WHEN_COMPETE_MASTER_FAILURE", false)?,
        })
    }
}

/// Expand strftime tokens in the task name template. The expansion must
/// change something: the taskid segment is what makes each invocation's
/// coordination subtree unique.
fn expand_name(template: &str) -> Result<String> {
    let items: Vec<Item> = StrftimeItems::new(template).collect();
    if items.iter().any(|item| matches!(item, Item::Error)) {
        return Err(AgentError::Config(format!(
            "DCRON_NAME template {template:?} has invalid strftime tokens"
        )));
    }

    let name = Local::now().format_with_items(items.into_iter()).to_string();
    if name == template {
        return Err(AgentError::Config(
            "DCRON_NAME must contain a date-derived taskid, like .%Y%m%d_%H%M".to_string(),
        ));
    }
    Ok(name)
}

/// Resolve `user[:group]` to uid/gid. The group defaults to the user name.
fn parse_user(spec: &str) -> Result<RunAs> {
    let (user_name, group_name) = match spec.split_once(':') {
        Some((u, g)) => (u, g),
        None => (spec, spec),
    };

    let user = User::from_name(user_name)
        .map_err(AgentError::Sys)?
        .ok_or_else(|| AgentError::Config(format!("unknown user {user_name:?}")))?;
    let group = Group::from_name(group_name)
        .map_err(AgentError::Sys)?
        .ok_or_else(|| AgentError::Config(format!("unknown group {group_name:?}")))?;

    Ok(RunAs {
        user: user_name.to_string(),
        uid: user.uid.as_raw(),
        gid: group.gid.as_raw(),
    })
}

/// IPv4 address of the named interface, the default agent identity.
fn primary_ipv4(interface: &str) -> Option<String> {
    let addrs = nix::ifaddrs::getifaddrs().ok()?;
    for ifaddr in addrs {
        if ifaddr.interface_name != interface {
            continue;
        }
        if let Some(addr) = ifaddr.address {
            if let Some(sin) = addr.as_sockaddr_in() {
                return Some(sin.ip().to_string());
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn base_overrides(dir: &TempDir) -> Vec<(String, String)> {
        [
            ("DCRON_ID", "10.0.0.1"),
            ("DCRON_ZK", "mem://config-tests"),
            ("DCRON_NAME", "group.job.%Y%m%d_%H%M"),
            ("DCRON_LIBDIR", dir.path().to_str().unwrap()),
            ("DCRON_LOGDIR", dir.path().to_str().unwrap()),
        ]
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
    }

    fn with(dir: &TempDir, extra: &[(&str, &str)]) -> Vec<(String, String)> {
        let mut overrides = base_overrides(dir);
        overrides.extend(extra.iter().map(|(k, v)| (k.to_string(), v.to_string())));
        overrides
    }

    #[test]
    fn defaults_and_derived_paths() {
        let dir = TempDir::new().unwrap();
        let cfg = Config::load(base_overrides(&dir)).unwrap();

        assert_eq!(cfg.max_retry, 2);
        assert_eq!(cfg.retry_on, RetryPolicy::OnCrash);
        assert!(!cfg.llap);
        assert_eq!(cfg.stick_secs, 0);
        assert!(cfg.capture_stdio);
        assert!(cfg.name.starts_with("group.job."));
        assert_ne!(cfg.name, "group.job.%Y%m%d_%H%M");
        assert_eq!(cfg.fifo, dir.path().join(format!("{}.fifo", cfg.name)));
    }

    #[test]
    fn max_retry_is_clamped() {
        let dir = TempDir::new().unwrap();
        let cfg = Config::load(with(&dir, &[("DCRON_MAXRETRY", "9")])).unwrap();
        assert_eq!(cfg.max_retry, 5);
    }

    #[test]
    fn retry_policy_mapping() {
        let dir = TempDir::new().unwrap();
        let cfg = Config::load(with(&dir, &[("DCRON_RETRYON", "ABEXIT")])).unwrap();
        assert_eq!(cfg.retry_on, RetryPolicy::OnAbexit);

        let cfg = Config::load(with(&dir, &[("DCRON_RETRYON", "whatever")])).unwrap();
        assert_eq!(cfg.retry_on, RetryPolicy::None);
    }

    #[test]
    fn llap_flips_defaults_and_forces_crash_policy() {
        let dir = TempDir::new().unwrap();
        let cfg = Config::load(with(
            &dir,
            &[
                ("DCRON_LLAP", "true"),
                ("DCRON_RETRYON", "ABEXIT"),
                ("DCRON_NAME", "group.job"),
            ],
        ))
        .unwrap();

        assert!(cfg.llap);
        assert_eq!(cfg.retry_on, RetryPolicy::OnCrash);
        assert_eq!(cfg.stick_secs, 90);
        assert!(!cfg.capture_stdio);
        // The date suffix was appended and expanded.
        assert!(cfg.name.len() > "group.job.".len());
        assert!(cfg.name.starts_with("group.job."));
    }

    #[test]
    fn name_without_taskid_tokens_is_rejected() {
        let dir = TempDir::new().unwrap();
        let err = Config::load(with(&dir, &[("DCRON_NAME", "group.fixed")])).unwrap_err();
        assert!(err.to_string().contains("taskid"));
    }

    #[test]
    fn bad_boolean_and_number_are_rejected() {
        let dir = TempDir::new().unwrap();
        assert!(Config::load(with(&dir, &[("DCRON_LLAP", "yes")])).is_err());
        assert!(Config::load(with(&dir, &[("DCRON_MAXRETRY", "two")])).is_err());
    }

    #[test]
    fn missing_directories_are_rejected() {
        let dir = TempDir::new().unwrap();
        let err =
            Config::load(with(&dir, &[("DCRON_LIBDIR", "/nonexistent/dcron")])).unwrap_err();
        assert!(err.to_string().contains("not a directory"));
    }
}
