use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{ArtelError, Result};

/// Top-level daemon configuration, read from `.artel/wire.yml`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonConfig {
    /// How the wire-mode agent is launched.
    #[serde(default)]
    pub agent: AgentConfig,

    /// Wire protocol version announced in the handshake. Default: "1.3".
    #[serde(default = "default_protocol_version")]
    pub protocol_version: String,

    /// Timeout for ordinary outbound calls in seconds. Default: 120.
    #[serde(default = "default_call_timeout")]
    pub call_timeout_secs: u64,

    /// Timeout for the initialize handshake in seconds. Default: 30.
    #[serde(default = "default_handshake_timeout")]
    pub handshake_timeout_secs: u64,

    /// Branch head polling interval in seconds. Default: 2.
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,

    /// Control loop liveness tick in seconds. Default: 1.
    #[serde(default = "default_tick_interval")]
    pub tick_interval_secs: u64,

    /// Grace period before a terminated agent is force-killed. Default: 5.
    #[serde(default = "default_stop_grace")]
    pub stop_grace_secs: u64,

    /// Number of snapshots retained in the metrics history. Default: 100.
    #[serde(default = "default_history_cap")]
    pub metrics_history_cap: usize,

    #[serde(default)]
    pub restart: RestartConfig,

    #[serde(default)]
    pub paths: PathsConfig,
}

fn default_protocol_version() -> String {
    "1.3".into()
}
fn default_call_timeout() -> u64 {
    120
}
fn default_handshake_timeout() -> u64 {
    30
}
fn default_poll_interval() -> u64 {
    2
}
fn default_tick_interval() -> u64 {
    1
}
fn default_stop_grace() -> u64 {
    5
}
fn default_history_cap() -> usize {
    100
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            agent: AgentConfig::default(),
            protocol_version: default_protocol_version(),
            call_timeout_secs: 120,
            handshake_timeout_secs: 30,
            poll_interval_secs: 2,
            tick_interval_secs: 1,
            stop_grace_secs: 5,
            metrics_history_cap: 100,
            restart: RestartConfig::default(),
            paths: PathsConfig::default(),
        }
    }
}

impl DaemonConfig {
    /// Load config from a YAML file. Returns default if file doesn't exist.
    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let contents = std::fs::read_to_string(path)?;
        if contents.trim().is_empty() {
            return Ok(Self::default());
        }
        let config: Self = serde_yaml::from_str(&contents).map_err(|e| ArtelError::ConfigParse {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;
        config.check().map_err(|reason| ArtelError::ConfigParse {
            path: path.to_path_buf(),
            reason,
        })?;
        Ok(config)
    }

    /// Reject values the daemon cannot run with.
    pub fn validate(&self) -> Result<()> {
        self.check()
            .map_err(|reason| ArtelError::InvalidConfig { reason })
    }

    fn check(&self) -> std::result::Result<(), String> {
        let nonzero = [
            ("call_timeout_secs", self.call_timeout_secs),
            ("handshake_timeout_secs", self.handshake_timeout_secs),
            ("poll_interval_secs", self.poll_interval_secs),
            ("tick_interval_secs", self.tick_interval_secs),
            ("restart.max_attempts", u64::from(self.restart.max_attempts)),
            ("restart.base_delay_secs", self.restart.base_delay_secs),
            ("metrics_history_cap", self.metrics_history_cap as u64),
        ];
        match nonzero.iter().find(|(_, value)| *value == 0) {
            Some((field, _)) => Err(format!("{field} must be greater than zero")),
            None => Ok(()),
        }
    }

    /// Load config from the project root. Checks `.artel/wire.yml`.
    pub fn load_project(project_root: &Path) -> Result<Self> {
        Self::load_from(&project_root.join(".artel").join("wire.yml"))
    }

    pub fn call_timeout(&self) -> Duration {
        Duration::from_secs(self.call_timeout_secs)
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_secs(self.handshake_timeout_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_secs(self.tick_interval_secs)
    }

    pub fn stop_grace(&self) -> Duration {
        Duration::from_secs(self.stop_grace_secs)
    }
}

/// Agent process launch settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    /// Agent definition file, passed as `--agent-file` when it exists.
    pub agent_file: Option<PathBuf>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            command: "kimi".into(),
            args: vec!["--wire".into()],
            agent_file: Some(PathBuf::from(".agents/kimi-overseer.yaml")),
        }
    }
}

/// Bounded exponential restart policy: delay = base^attempt seconds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RestartConfig {
    pub max_attempts: u32,
    pub base_delay_secs: u64,
}

impl Default for RestartConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_secs: 2,
        }
    }
}

/// On-disk locations. Relative paths resolve against the project root.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PathsConfig {
    pub pid_file: PathBuf,
    pub log_file: PathBuf,
    pub metrics_file: PathBuf,
    pub approval_log: PathBuf,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            pid_file: PathBuf::from(".git/wire-daemon.pid"),
            log_file: PathBuf::from(".git/hooks/wire-daemon.log"),
            metrics_file: PathBuf::from(".ai/metrics/wire-metrics.json"),
            approval_log: PathBuf::from(".ai/metrics/approvals.jsonl"),
        }
    }
}

impl PathsConfig {
    /// Return a copy with every relative path joined onto `root`.
    pub fn resolve(&self, root: &Path) -> Self {
        let join = |p: &PathBuf| {
            if p.is_absolute() {
                p.clone()
            } else {
                root.join(p)
            }
        };
        Self {
            pid_file: join(&self.pid_file),
            log_file: join(&self.log_file),
            metrics_file: join(&self.metrics_file),
            approval_log: join(&self.approval_log),
        }
    }
}
