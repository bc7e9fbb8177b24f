use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;
use tracing::warn;

use crate::error::ConfigError;
use crate::telemetry::logging::LogLevel;

const ENV_PREFIX: &str = "TIDE";

/// Tunables for the sync core. Every field has a default, so an empty
/// environment yields a working configuration.
#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
pub struct SyncConfig {
    #[serde(default)]
    pub backoff: BackoffConfig,
    #[serde(default)]
    pub connection: ConnectionConfig,
    #[serde(default)]
    pub ledger: LedgerConfig,
    #[serde(default)]
    pub router: RouterConfig,
    #[serde(default)]
    pub log: LogSettings,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct BackoffConfig {
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    #[serde(default = "default_jitter_max_ms")]
    pub jitter_max_ms: u64,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            base_delay_ms: default_base_delay_ms(),
            multiplier: default_multiplier(),
            max_delay_ms: default_max_delay_ms(),
            jitter_max_ms: default_jitter_max_ms(),
            max_attempts: default_max_attempts(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct ConnectionConfig {
    #[serde(default = "default_heartbeat_interval_ms")]
    pub heartbeat_interval_ms: u64,
    /// Channel errors on one topic before the failure escalates to a full reconnect.
    #[serde(default = "default_topic_error_threshold")]
    pub topic_error_threshold: u32,
    #[serde(default = "default_topic_retry_delay_ms")]
    pub topic_retry_delay_ms: u64,
}

impl ConnectionConfig {
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn topic_retry_delay(&self) -> Duration {
        Duration::from_millis(self.topic_retry_delay_ms)
    }
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval_ms: default_heartbeat_interval_ms(),
            topic_error_threshold: default_topic_error_threshold(),
            topic_retry_delay_ms: default_topic_retry_delay_ms(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct LedgerConfig {
    #[serde(default = "default_operation_timeout_ms")]
    pub operation_timeout_ms: u64,
    #[serde(default = "default_confirm_grace_ms")]
    pub confirm_grace_ms: u64,
    #[serde(default = "default_max_pending")]
    pub max_pending: usize,
    #[serde(default = "default_sweep_interval_ms")]
    pub sweep_interval_ms: u64,
}

impl LedgerConfig {
    pub fn operation_timeout(&self) -> Duration {
        Duration::from_millis(self.operation_timeout_ms)
    }

    pub fn confirm_grace(&self) -> Duration {
        Duration::from_millis(self.confirm_grace_ms)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }

    /// Entries older than this are removed by a sweep regardless of state.
    pub fn sweep_age(&self) -> Duration {
        self.operation_timeout() * 2
    }
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            operation_timeout_ms: default_operation_timeout_ms(),
            confirm_grace_ms: default_confirm_grace_ms(),
            max_pending: default_max_pending(),
            sweep_interval_ms: default_sweep_interval_ms(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
pub struct RouterConfig {
    /// Votes cast by this user are already applied by the ledger and are
    /// skipped when they echo back through the feed.
    #[serde(default)]
    pub local_user_id: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
pub struct LogSettings {
    #[serde(default)]
    pub level: LogLevel,
    #[serde(default)]
    pub file: Option<PathBuf>,
}

impl SyncConfig {
    /// Loads `TIDE__SECTION__KEY` variables, falling back to defaults when
    /// the environment cannot be parsed.
    pub fn from_env() -> Self {
        match Self::try_from_env() {
            Ok(config) => config,
            Err(err) => {
                warn!(target = "tide.config", error = %err, "invalid sync configuration; using defaults");
                SyncConfig::default()
            }
        }
    }

    pub fn try_from_env() -> Result<Self, ConfigError> {
        let config = config::Config::builder()
            .add_source(config::Environment::with_prefix(ENV_PREFIX).separator("__"))
            .build()?
            .try_deserialize::<SyncConfig>()?;
        config.normalize()
    }

    fn normalize(mut self) -> Result<Self, ConfigError> {
        if !self.backoff.multiplier.is_finite() {
            return Err(ConfigError::Invalid("backoff.multiplier must be finite".into()));
        }
        if self.backoff.multiplier < 1.0 {
            self.backoff.multiplier = 1.0;
        }
        if self.backoff.max_delay_ms < self.backoff.base_delay_ms {
            self.backoff.max_delay_ms = self.backoff.base_delay_ms;
        }
        if self.ledger.operation_timeout_ms == 0 {
            return Err(ConfigError::Invalid("ledger.operation_timeout_ms must be positive".into()));
        }
        self.connection.topic_error_threshold = self.connection.topic_error_threshold.max(1);
        self.ledger.max_pending = self.ledger.max_pending.max(1);
        self.router.local_user_id = normalize_opt(self.router.local_user_id.take());
        Ok(self)
    }
}

fn normalize_opt(value: Option<String>) -> Option<String> {
    value.and_then(|s| {
        let trimmed = s.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(trimmed.to_string())
        }
    })
}

fn default_base_delay_ms() -> u64 {
    1_000
}

fn default_multiplier() -> f64 {
    2.0
}

fn default_max_delay_ms() -> u64 {
    30_000
}

fn default_jitter_max_ms() -> u64 {
    1_000
}

fn default_max_attempts() -> u32 {
    10
}

fn default_heartbeat_interval_ms() -> u64 {
    30_000
}

fn default_topic_error_threshold() -> u32 {
    3
}

fn default_topic_retry_delay_ms() -> u64 {
    1_000
}

fn default_operation_timeout_ms() -> u64 {
    10_000
}

fn default_confirm_grace_ms() -> u64 {
    2_000
}

fn default_max_pending() -> usize {
    100
}

fn default_sweep_interval_ms() -> u64 {
    30_000
}
