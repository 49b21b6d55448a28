//! Configuration management for Floodgate.
//!
//! Configuration is read from an optional YAML file and then overridden by
//! `FLOODGATE__<SECTION>__<KEY>` environment variables.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::abuse::{EscalationSettings, MAX_WINDOW_SECS};
use crate::error::{FloodgateError, Result};
use crate::identity::ResolverSettings;
use crate::janitor::JanitorSettings;
use crate::ratelimit::{LimiterSettings, PolicySet};

/// Environment variable prefix for overrides.
pub const ENV_PREFIX: &str = "FLOODGATE";

/// Main configuration for the Floodgate subsystem.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FloodgateConfig {
    /// Storage backend
    #[serde(default)]
    pub store: StoreConfig,

    /// Failure and conflict handling for rate limit checks
    #[serde(default)]
    pub limiter: LimiterSettings,

    /// Inline operation policies
    #[serde(default)]
    pub policies: PolicySet,

    /// Optional policy file; replaces `policies` when set
    #[serde(default)]
    pub policy_file: Option<PathBuf>,

    /// Client identifier resolution
    #[serde(default)]
    pub resolver: ResolverSettings,

    /// Abuse metric recording
    #[serde(default)]
    pub metrics: MetricsConfig,

    /// Challenge escalation
    #[serde(default)]
    pub escalation: EscalationSettings,

    /// Idle bucket eviction
    #[serde(default)]
    pub janitor: JanitorSettings,

    /// Log output
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Which store backs buckets and metrics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    /// Process-local; suitable for a single instance or tests
    Memory,
    /// SQLite database file shared by every process on the host
    #[default]
    Sqlite,
}

/// Storage configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    #[serde(default)]
    pub backend: StoreBackend,

    /// Database file for the SQLite backend
    #[serde(default = "default_store_path")]
    pub path: PathBuf,

    /// How long a writer waits for a locked database before reporting a conflict
    #[serde(default = "default_busy_timeout_ms")]
    pub busy_timeout_ms: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackend::default(),
            path: default_store_path(),
            busy_timeout_ms: default_busy_timeout_ms(),
        }
    }
}

impl StoreConfig {
    pub fn busy_timeout(&self) -> Duration {
        Duration::from_millis(self.busy_timeout_ms)
    }
}

fn default_store_path() -> PathBuf {
    PathBuf::from("floodgate.db")
}

fn default_busy_timeout_ms() -> u64 {
    2000
}

/// Abuse metric recording configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    /// Upper bound on a single metric insert
    #[serde(default = "default_record_timeout_ms")]
    pub record_timeout_ms: u64,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            record_timeout_ms: default_record_timeout_ms(),
        }
    }
}

impl MetricsConfig {
    pub fn record_timeout(&self) -> Duration {
        Duration::from_millis(self.record_timeout_ms)
    }
}

fn default_record_timeout_ms() -> u64 {
    250
}

/// Log output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Filter used when `RUST_LOG` is unset
    #[serde(default = "default_log_level")]
    pub level: String,

    #[serde(default)]
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: LogFormat::default(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

impl FloodgateConfig {
    /// Load configuration from an optional YAML file plus environment overrides.
    pub fn load(path: Option<&str>) -> Result<Self> {
        let mut builder = ::config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(::config::File::new(path, ::config::FileFormat::Yaml));
        }
        builder = builder.add_source(
            ::config::Environment::with_prefix(ENV_PREFIX)
                .separator("__")
                .try_parsing(true),
        );

        let config: FloodgateConfig = builder.build()?.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a YAML file, without environment overrides.
    pub fn from_file(path: &str) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Parse configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: FloodgateConfig = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject settings the subsystem cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.policy_file.is_none() {
            self.policies.validate()?;
        }
        if self.escalation.window_secs == 0 || self.escalation.window_secs > MAX_WINDOW_SECS {
            return Err(FloodgateError::Config(format!(
                "escalation.window_secs must be between 1 and {}",
                MAX_WINDOW_SECS
            )));
        }
        if self.escalation.global_threshold == 0 || self.escalation.identifier_threshold == 0 {
            return Err(FloodgateError::Config(
                "escalation thresholds must be at least 1".to_string(),
            ));
        }
        if self.janitor.interval_secs == 0 {
            return Err(FloodgateError::Config(
                "janitor.interval_secs must be positive".to_string(),
            ));
        }
        if self.resolver.header_order.is_empty() {
            return Err(FloodgateError::Config(
                "resolver.header_order must name at least one header".to_string(),
            ));
        }
        Ok(())
    }

    /// The effective policy table: the policy file if configured, else the inline table.
    pub fn load_policies(&self) -> Result<PolicySet> {
        match &self.policy_file {
            Some(path) => PolicySet::from_file(path),
            None => Ok(self.policies.clone()),
        }
    }
}
