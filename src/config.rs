use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

use crate::queue::QueueKind;

/// Server configuration, read from a YAML file. Every section has defaults
/// so an empty file (or none at all) yields a working single-queue server.
#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(default)]
pub struct ServerConfig {
    /// Name this server uses in job ids and destinations.
    pub server_name: String,
    pub port: u16,
    pub spool_dir: PathBuf,
    /// Users allowed to act on any job.
    pub managers: Vec<String>,
    pub default_queue: String,
    pub max_array_size: u32,
    /// Program run to notify job owners; receives the recipient as its only
    /// argument and the message on stdin.
    pub mailer: Option<PathBuf>,
    pub dispatch: DispatchConfig,
    pub connections: ConnectionConfig,
    pub nanny: NannyConfig,
    pub store: StoreConfig,
    pub purge: PurgeConfig,
    pub exec_hosts: ExecHostConfig,
    pub queues: Vec<QueueConfig>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            server_name: "localhost".into(),
            port: 15001,
            spool_dir: PathBuf::from("spool"),
            managers: vec!["root".into()],
            default_queue: "batch".into(),
            max_array_size: 1024,
            mailer: None,
            dispatch: DispatchConfig::default(),
            connections: ConnectionConfig::default(),
            nanny: NannyConfig::default(),
            store: StoreConfig::default(),
            purge: PurgeConfig::default(),
            exec_hosts: ExecHostConfig::default(),
            queues: vec![QueueConfig {
                name: "batch".into(),
                ..QueueConfig::default()
            }],
        }
    }
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(default)]
pub struct DispatchConfig {
    /// Attempts made against one destination before giving up on it.
    pub retry_cap: u32,
    pub backoff_base_ms: u64,
    pub backoff_max_ms: u64,
    /// Bound on each network step of a dispatch attempt.
    pub step_timeout_secs: u64,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            retry_cap: 3,
            backoff_base_ms: 500,
            backoff_max_ms: 8_000,
            step_timeout_secs: 30,
        }
    }
}

impl DispatchConfig {
    pub fn step_timeout(&self) -> Duration {
        Duration::from_secs(self.step_timeout_secs)
    }

    /// Delay before attempt `attempt` (1-based); the first attempt is
    /// immediate.
    pub fn backoff(&self, attempt: u32) -> Duration {
        if attempt <= 1 {
            return Duration::ZERO;
        }
        let factor = 1u64.checked_shl(attempt - 2).unwrap_or(u64::MAX);
        let ms = self.backoff_base_ms.saturating_mul(factor);
        Duration::from_millis(ms.min(self.backoff_max_ms))
    }
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(default)]
pub struct ConnectionConfig {
    /// Outbound connections that may be open at once.
    pub max: usize,
    pub connect_timeout_secs: u64,
    pub disconnect_timeout_secs: u64,
    /// Inbound connections silent this long are dropped; 0 means never.
    pub idle_timeout_secs: u64,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            max: 64,
            connect_timeout_secs: 10,
            disconnect_timeout_secs: 5,
            idle_timeout_secs: 300,
        }
    }
}

impl ConnectionConfig {
    pub fn idle_timeout(&self) -> Option<Duration> {
        (self.idle_timeout_secs > 0)
            .then(|| Duration::from_secs(self.idle_timeout_secs))
    }
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(default)]
pub struct NannyConfig {
    pub enabled: bool,
    pub delay_secs: u64,
}

impl Default for NannyConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            delay_secs: 60,
        }
    }
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(default)]
pub struct StoreConfig {
    /// Attempts at a full save before reporting failure.
    pub save_retries: u32,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self { save_retries: 3 }
    }
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(default)]
pub struct PurgeConfig {
    /// How long completed jobs stay visible.
    pub keep_completed_secs: u64,
    pub sweep_interval_secs: u64,
}

impl Default for PurgeConfig {
    fn default() -> Self {
        Self {
            keep_completed_secs: 300,
            sweep_interval_secs: 60,
        }
    }
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(default)]
pub struct ExecHostConfig {
    /// Execution hosts, as `host` or `host:port`.
    pub moms: Vec<String>,
    pub mom_port: u16,
    /// How long a host that failed a dispatch is skipped.
    pub suspect_secs: u64,
}

impl Default for ExecHostConfig {
    fn default() -> Self {
        Self {
            moms: Vec::new(),
            mom_port: 15002,
            suspect_secs: 120,
        }
    }
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(default)]
pub struct QueueConfig {
    pub name: String,
    pub kind: QueueKind,
    pub enabled: bool,
    pub started: bool,
    /// Running jobs allowed at once; 0 means no limit.
    pub max_run: u32,
    /// Jobs allowed in the queue at once; 0 means no limit.
    pub max_queued: u32,
    /// Routing destinations, as `queue` or `queue@server[:port]`.
    pub destinations: Vec<String>,
    pub route_retry_secs: u64,
    /// How long a job may sit in a routing queue; 0 means forever.
    pub route_lifetime_secs: u64,
    pub route_held: bool,
    pub route_waiting: bool,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            name: String::new(),
            kind: QueueKind::Execution,
            enabled: true,
            started: true,
            max_run: 0,
            max_queued: 0,
            destinations: Vec::new(),
            route_retry_secs: 30,
            route_lifetime_secs: 0,
            route_held: false,
            route_waiting: false,
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file '{path}': {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },
    #[error("failed to parse config file '{path}': {source}")]
    Parse {
        path: String,
        source: serde_yaml::Error,
    },
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

impl ServerConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_string_lossy().to_string(),
            source,
        })?;
        let cfg: Self =
            serde_yaml::from_str(&text).map_err(|source| ConfigError::Parse {
                path: path.to_string_lossy().to_string(),
                source,
            })?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.server_name.is_empty()
            || self.server_name.contains(&['@', ':'][..])
        {
            let name = &self.server_name;
            return Err(invalid(format!("bad server_name '{name}'")));
        }
        if self.dispatch.retry_cap == 0 {
            return Err(invalid("dispatch.retry_cap must be > 0"));
        }
        if self.connections.max == 0 {
            return Err(invalid("connections.max must be > 0"));
        }

        let mut seen = std::collections::BTreeSet::new();
        for q in &self.queues {
            if q.name.is_empty() || q.name.contains(&['@', '.'][..]) {
                return Err(invalid(format!("bad queue name '{}'", q.name)));
            }
            if !seen.insert(q.name.as_str()) {
                return Err(invalid(format!("duplicate queue '{}'", q.name)));
            }
            if q.kind == QueueKind::Routing && q.destinations.is_empty() {
                return Err(invalid(format!(
                    "routing queue '{}' has no destinations",
                    q.name
                )));
            }
        }
        if !self.queues.is_empty()
            && !seen.contains(self.default_queue.as_str())
        {
            return Err(invalid(format!(
                "default queue '{}' is not defined",
                self.default_queue
            )));
        }

        Ok(())
    }

    /// Address form of this server used when naming destinations.
    pub fn server_id(&self) -> String {
        format!("{}:{}", self.server_name, self.port)
    }
}

fn invalid(msg: impl Into<String>) -> ConfigError {
    ConfigError::Invalid(msg.into())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_document_gives_defaults() {
        let cfg: ServerConfig = serde_yaml::from_str("{}").unwrap();
        assert_eq!(cfg, ServerConfig::default());
        cfg.validate().unwrap();
    }

    #[test]
    fn sections_merge_with_defaults() {
        let cfg: ServerConfig = serde_yaml::from_str(
            r#"
server_name: head
dispatch:
  retry_cap: 5
queues:
  - name: route
    kind: routing
    destinations: [batch, batch@other]
  - name: batch
    max_run: 2
"#,
        )
        .unwrap();
        cfg.validate().unwrap();

        assert_eq!(cfg.dispatch.retry_cap, 5);
        assert_eq!(cfg.dispatch.backoff_base_ms, 500);
        assert_eq!(cfg.queues[0].kind, QueueKind::Routing);
        assert_eq!(cfg.queues[1].max_run, 2);
        assert!(cfg.queues[1].enabled);
    }

    #[test]
    fn invalid_configs_are_rejected() {
        let mut cfg = ServerConfig::default();
        cfg.queues.push(QueueConfig {
            name: "r".into(),
            kind: QueueKind::Routing,
            ..QueueConfig::default()
        });
        assert!(matches!(cfg.validate(), Err(ConfigError::Invalid(_))));

        let mut cfg = ServerConfig::default();
        cfg.default_queue = "nope".into();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn backoff_doubles_up_to_the_cap() {
        let d = DispatchConfig {
            backoff_base_ms: 100,
            backoff_max_ms: 350,
            ..DispatchConfig::default()
        };
        assert_eq!(d.backoff(1), Duration::ZERO);
        assert_eq!(d.backoff(2), Duration::from_millis(100));
        assert_eq!(d.backoff(3), Duration::from_millis(200));
        assert_eq!(d.backoff(4), Duration::from_millis(350));
        assert_eq!(d.backoff(80), Duration::from_millis(350));
    }
}
