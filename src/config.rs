//! TOML configuration for the TestFlow engine.
//!
//! Layered model: compiled-in defaults, overridden by a TOML file found via
//! `$TESTFLOW_CONFIG` or the standard system location. Every section is
//! optional and partial sections keep the defaults of the keys they omit.

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::executor::DEFAULT_USER_AGENT;
use crate::notifier::DEFAULT_OUTBOX_CAPACITY;
use crate::queue::{QueueConfig, QueueName};

pub const CONFIG_ENV: &str = "TESTFLOW_CONFIG";
pub const SYSTEM_CONFIG_PATH: &str = "/etc/testflow/testflow.toml";

// ---------------------------------------------------------------------------
// Top-level config
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub server: ServerConfig,
    pub storage: StorageConfig,
    pub executor: ExecutorConfig,
    pub queues: QueuesConfig,
    pub scheduler: SchedulerConfig,
    pub notifier: NotifierConfig,
    pub logging: LoggingConfig,
}

impl EngineConfig {
    /// Load configuration from a TOML file at `path`.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;
        let config: Self = toml::from_str(&content)
            .with_context(|| format!("failed to parse config file: {}", path.display()))?;
        info!(path = %path.display(), "loaded engine configuration");
        Ok(config)
    }

    /// `$TESTFLOW_CONFIG`, then the system file, then defaults.
    pub fn load_or_default() -> Self {
        if let Ok(env_path) = std::env::var(CONFIG_ENV) {
            let path = Path::new(&env_path);
            match Self::load(path) {
                Ok(cfg) => return cfg,
                Err(e) => {
                    warn!(
                        path = %path.display(),
                        error = %e,
                        "TESTFLOW_CONFIG set but file could not be loaded, trying fallback"
                    );
                }
            }
        }

        let system_path = Path::new(SYSTEM_CONFIG_PATH);
        if system_path.exists() {
            match Self::load(system_path) {
                Ok(cfg) => return cfg,
                Err(e) => {
                    warn!(
                        path = %system_path.display(),
                        error = %e,
                        "system config file exists but could not be loaded, using defaults"
                    );
                }
            }
        }

        debug!("no config file found, using compiled-in defaults");
        Self::default()
    }

    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).context("failed to render configuration")
    }
}

// ---------------------------------------------------------------------------
// Server / storage / executor
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Address the HTTP API and websocket endpoint listen on.
    pub bind: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0:8080".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// SQLite database file. Empty or `:memory:` keeps everything in process.
    pub path: String,
}

impl StorageConfig {
    pub fn is_in_memory(&self) -> bool {
        let path = self.path.trim();
        path.is_empty() || path == ":memory:"
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            path: "data/testflow.db".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutorConfig {
    /// Sent with every outbound call unless the test overrides it.
    pub user_agent: String,
    pub max_redirects: usize,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            user_agent: DEFAULT_USER_AGENT.to_string(),
            max_redirects: 10,
        }
    }
}

// ---------------------------------------------------------------------------
// Queues
// ---------------------------------------------------------------------------

/// One section per named queue. Omitted keys keep that queue's built-in
/// value, not the generic queue default.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawQueues")]
pub struct QueuesConfig {
    pub test_execution: QueueConfig,
    pub monitoring: QueueConfig,
    pub notifications: QueueConfig,
    pub analytics: QueueConfig,
}

impl QueuesConfig {
    pub fn get(&self, name: QueueName) -> &QueueConfig {
        match name {
            QueueName::TestExecution => &self.test_execution,
            QueueName::Monitoring => &self.monitoring,
            QueueName::Notifications => &self.notifications,
            QueueName::Analytics => &self.analytics,
        }
    }
}

impl Default for QueuesConfig {
    fn default() -> Self {
        Self {
            test_execution: QueueConfig::defaults_for(QueueName::TestExecution),
            monitoring: QueueConfig::defaults_for(QueueName::Monitoring),
            notifications: QueueConfig::defaults_for(QueueName::Notifications),
            analytics: QueueConfig::defaults_for(QueueName::Analytics),
        }
    }
}

#[derive(Deserialize, Default)]
#[serde(default, deny_unknown_fields)]
struct RawQueues {
    test_execution: Option<toml::Table>,
    monitoring: Option<toml::Table>,
    notifications: Option<toml::Table>,
    analytics: Option<toml::Table>,
}

impl TryFrom<RawQueues> for QueuesConfig {
    type Error = String;

    fn try_from(raw: RawQueues) -> Result<Self, Self::Error> {
        Ok(Self {
            test_execution: overlay(QueueName::TestExecution, raw.test_execution)?,
            monitoring: overlay(QueueName::Monitoring, raw.monitoring)?,
            notifications: overlay(QueueName::Notifications, raw.notifications)?,
            analytics: overlay(QueueName::Analytics, raw.analytics)?,
        })
    }
}

fn overlay(name: QueueName, section: Option<toml::Table>) -> Result<QueueConfig, String> {
    let defaults = QueueConfig::defaults_for(name);
    let Some(section) = section else {
        return Ok(defaults);
    };
    let mut merged = toml::Value::try_from(defaults).map_err(|e| e.to_string())?;
    if let toml::Value::Table(table) = &mut merged {
        table.extend(section);
    }
    merged
        .try_into()
        .map_err(|e| format!("invalid [queues.{}] section: {}", name.as_str().replace('-', "_"), e))
}

// ---------------------------------------------------------------------------
// Scheduler
// ---------------------------------------------------------------------------

/// Cadences of the built-in periodic tasks. The due-scan cadence is
/// independent of each test's own interval.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    pub due_scan_secs: u64,
    pub metrics_secs: u64,
    pub alert_secs: u64,
    /// Window of execution records an alert evaluation looks at.
    pub alert_lookback_secs: u64,
    pub retention_secs: u64,
    pub execution_retention_days: u64,
    /// Age after which finished jobs are purged from every queue.
    pub job_retention_secs: u64,
}

impl SchedulerConfig {
    pub fn due_scan(&self) -> Duration {
        Duration::from_secs(self.due_scan_secs)
    }

    pub fn metrics(&self) -> Duration {
        Duration::from_secs(self.metrics_secs)
    }

    pub fn alert(&self) -> Duration {
        Duration::from_secs(self.alert_secs)
    }

    pub fn alert_lookback(&self) -> Duration {
        Duration::from_secs(self.alert_lookback_secs)
    }

    pub fn retention(&self) -> Duration {
        Duration::from_secs(self.retention_secs)
    }

    pub fn execution_retention(&self) -> Duration {
        Duration::from_secs(self.execution_retention_days.saturating_mul(24 * 3600))
    }

    pub fn job_retention(&self) -> Duration {
        Duration::from_secs(self.job_retention_secs)
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            due_scan_secs: 60,
            metrics_secs: 300,
            alert_secs: 120,
            alert_lookback_secs: 900,
            retention_secs: 3600,
            execution_retention_days: 90,
            job_retention_secs: 86_400,
        }
    }
}

// ---------------------------------------------------------------------------
// Notifier / logging
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NotifierConfig {
    /// Events buffered per connection before new ones are dropped.
    pub outbox_capacity: usize,
    /// Base64 Ed25519 public key that subscriber tokens must verify against.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub verifying_key: Option<String>,
}

impl Default for NotifierConfig {
    fn default() -> Self {
        Self {
            outbox_capacity: DEFAULT_OUTBOX_CAPACITY,
            verifying_key: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Minimum tracing level (`trace`, `debug`, `info`, `warn`, `error`).
    /// `RUST_LOG` takes precedence when set.
    pub level: String,
    /// Emit JSON lines instead of human-readable output.
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::Backoff;

    #[test]
    fn test_defaults_are_sane() {
        let cfg = EngineConfig::default();

        assert_eq!(cfg.server.bind, "0.0.0.0:8080");
        assert_eq!(cfg.storage.path, "data/testflow.db");
        assert!(!cfg.storage.is_in_memory());
        assert_eq!(cfg.executor.user_agent, "TestFlow/1.0");

        assert_eq!(cfg.queues.test_execution.concurrency, 5);
        assert_eq!(cfg.queues.test_execution.max_attempts, 3);
        assert_eq!(
            cfg.queues.test_execution.backoff,
            Backoff::Exponential { delay_ms: 2000 }
        );
        assert_eq!(cfg.queues.monitoring.concurrency, 10);
        assert_eq!(cfg.queues.notifications.max_attempts, 5);
        assert_eq!(cfg.queues.analytics.max_attempts, 1);

        assert_eq!(cfg.scheduler.due_scan(), Duration::from_secs(60));
        assert_eq!(cfg.scheduler.alert_lookback(), Duration::from_secs(900));
        assert_eq!(
            cfg.scheduler.execution_retention(),
            Duration::from_secs(90 * 86_400)
        );

        assert_eq!(cfg.notifier.outbox_capacity, 64);
        assert!(cfg.notifier.verifying_key.is_none());
        assert_eq!(cfg.logging.level, "info");
        assert!(!cfg.logging.json);
    }

    #[test]
    fn test_parse_example_toml() {
        let toml_str = r#"
[server]
bind = "127.0.0.1:9000"

[storage]
path = ":memory:"

[executor]
user_agent = "TestFlow-staging/1.0"
max_redirects = 3

[queues.test_execution]
concurrency = 8
max_attempts = 4
backoff = { type = "fixed", delay_ms = 500 }

[scheduler]
due_scan_secs = 30
alert_lookback_secs = 600

[notifier]
outbox_capacity = 16
verifying_key = "AAAA"

[logging]
level = "debug"
json = true
"#;

        let cfg: EngineConfig = toml::from_str(toml_str).unwrap();

        assert_eq!(cfg.server.bind, "127.0.0.1:9000");
        assert!(cfg.storage.is_in_memory());
        assert_eq!(cfg.executor.max_redirects, 3);
        assert_eq!(cfg.queues.test_execution.concurrency, 8);
        assert_eq!(cfg.queues.test_execution.max_attempts, 4);
        assert_eq!(
            cfg.queues.test_execution.backoff,
            Backoff::Fixed { delay_ms: 500 }
        );
        assert_eq!(cfg.scheduler.due_scan_secs, 30);
        assert_eq!(cfg.scheduler.alert_lookback_secs, 600);
        assert_eq!(cfg.scheduler.metrics_secs, 300);
        assert_eq!(cfg.notifier.outbox_capacity, 16);
        assert_eq!(cfg.notifier.verifying_key.as_deref(), Some("AAAA"));
        assert_eq!(cfg.logging.level, "debug");
        assert!(cfg.logging.json);
    }

    #[test]
    fn test_partial_queue_section_keeps_queue_defaults() {
        let toml_str = r#"
[queues.notifications]
concurrency = 1
"#;
        let cfg: EngineConfig = toml::from_str(toml_str).unwrap();

        assert_eq!(cfg.queues.notifications.concurrency, 1);
        assert_eq!(cfg.queues.notifications.max_attempts, 5);
        assert_eq!(
            cfg.queues.notifications.backoff,
            Backoff::Exponential { delay_ms: 1000 }
        );
        assert_eq!(cfg.queues.get(QueueName::Monitoring).concurrency, 10);
    }

    #[test]
    fn test_unknown_queue_section_rejected() {
        let toml_str = r#"
[queues.email]
concurrency = 1
"#;
        assert!(toml::from_str::<EngineConfig>(toml_str).is_err());
    }

    #[test]
    fn test_empty_toml_uses_all_defaults() {
        let cfg: EngineConfig = toml::from_str("").unwrap();
        let defaults = EngineConfig::default();

        assert_eq!(cfg.server.bind, defaults.server.bind);
        assert_eq!(cfg.queues, defaults.queues);
        assert_eq!(cfg.scheduler.retention_secs, defaults.scheduler.retention_secs);
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("testflow.toml");
        std::fs::write(
            &path,
            r#"
[server]
bind = "0.0.0.0:9999"
"#,
        )
        .unwrap();

        let cfg = EngineConfig::load(&path).unwrap();
        assert_eq!(cfg.server.bind, "0.0.0.0:9999");
    }

    #[test]
    fn test_load_missing_file_errors() {
        let result = EngineConfig::load(Path::new("/nonexistent/path/testflow.toml"));
        assert!(result.is_err());
    }

    #[test]
    fn test_serialization_roundtrip() {
        let cfg = EngineConfig::default();
        let toml_str = cfg.to_toml().unwrap();
        let roundtripped: EngineConfig = toml::from_str(&toml_str).unwrap();

        assert_eq!(cfg.server.bind, roundtripped.server.bind);
        assert_eq!(cfg.queues, roundtripped.queues);
        assert_eq!(
            cfg.scheduler.job_retention_secs,
            roundtripped.scheduler.job_retention_secs
        );
    }
}
