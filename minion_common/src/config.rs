//! Configuration loading traits and types.
//!
//! Every minion process is configured through explicit structs. Unknown keys
//! are rejected at parse time (`deny_unknown_fields`) so that a typo in a
//! topology file surfaces as a [`ConfigError::ParseError`] instead of being
//! silently ignored.
//!
//! # Usage
//!
//! ```rust,no_run
//! use minion_common::config::{ConfigError, ConfigLoader, TopologyConfig};
//! use std::path::Path;
//!
//! fn main() -> Result<(), ConfigError> {
//!     let topology = TopologyConfig::load(Path::new("topology.toml"))?;
//!     topology.validate()?;
//!     println!("Service: {}", topology.shared.service_name);
//!     Ok(())
//! }
//! ```

use crate::consts::{BUFFER_MAX_SIZE, DEFAULT_LOCK_TIMEOUT, DEFAULT_STATE_SIZE};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Error type for configuration loading operations.
#[derive(Debug, Clone, Error)]
pub enum ConfigError {
    /// Configuration file not found at specified path.
    #[error("Configuration file not found")]
    FileNotFound,

    /// TOML parsing failed (including unknown fields).
    #[error("Failed to parse configuration: {0}")]
    ParseError(String),

    /// Semantic validation failed.
    #[error("Configuration validation failed: {0}")]
    ValidationError(String),
}

/// Log level for application logging.
///
/// Uses lowercase serde values for TOML compatibility.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    /// Most verbose, detailed tracing information.
    Trace,
    /// Debug information useful during development.
    Debug,
    /// General information about application operation.
    #[default]
    Info,
    /// Warning messages for potentially problematic situations.
    Warn,
    /// Error messages for serious problems.
    Error,
}

impl From<LogLevel> for tracing::Level {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Trace => tracing::Level::TRACE,
            LogLevel::Debug => tracing::Level::DEBUG,
            LogLevel::Info => tracing::Level::INFO,
            LogLevel::Warn => tracing::Level::WARN,
            LogLevel::Error => tracing::Level::ERROR,
        }
    }
}

impl From<&tracing::Level> for LogLevel {
    fn from(level: &tracing::Level) -> Self {
        match *level {
            tracing::Level::TRACE => LogLevel::Trace,
            tracing::Level::DEBUG => LogLevel::Debug,
            tracing::Level::INFO => LogLevel::Info,
            tracing::Level::WARN => LogLevel::Warn,
            _ => LogLevel::Error,
        }
    }
}

/// Common configuration fields shared across all minion applications.
///
/// # TOML Example
///
/// ```toml
/// [shared]
/// log_level = "debug"
/// service_name = "optics-bench"
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SharedConfig {
    /// Logging verbosity level.
    #[serde(default)]
    pub log_level: LogLevel,

    /// Application instance identifier.
    pub service_name: String,
}

impl SharedConfig {
    /// Validate the configuration.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ValidationError` if `service_name` is empty.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.service_name.is_empty() {
            return Err(ConfigError::ValidationError(
                "service_name cannot be empty".to_string(),
            ));
        }
        Ok(())
    }
}

/// How a shared segment serializes access to its payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum LockMode {
    /// Process-shared mutex held in a sibling `.lock` file (`flock`).
    #[default]
    Exclusive,
    /// Spin on the header lock byte; readers share, writers exclude.
    ReadWrite,
}

/// Lock behaviour of a shared segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LockSettings {
    /// Locking strategy.
    #[serde(default)]
    pub mode: LockMode,
    /// Acquisition budget in spin iterations before giving up.
    #[serde(default = "default_lock_timeout")]
    pub timeout: u32,
}

impl Default for LockSettings {
    fn default() -> Self {
        Self {
            mode: LockMode::default(),
            timeout: DEFAULT_LOCK_TIMEOUT,
        }
    }
}

impl LockSettings {
    /// Read/write spin lock with the default timeout.
    pub fn read_write() -> Self {
        Self {
            mode: LockMode::ReadWrite,
            ..Self::default()
        }
    }

    /// Same mode, different timeout.
    pub fn with_timeout(self, timeout: u32) -> Self {
        Self { timeout, ..self }
    }
}

fn default_lock_timeout() -> u32 {
    DEFAULT_LOCK_TIMEOUT
}

/// Per-minion runtime configuration.
///
/// # TOML Example
///
/// ```toml
/// refresh_interval_ms = 20
/// state_size = 131072
///
/// [lock]
/// mode = "read_write"
/// timeout = 5000
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MinionConfig {
    /// Base interval inherited by timers without a custom one.
    #[serde(default = "default_refresh_interval_ms")]
    pub refresh_interval_ms: u64,
    /// Poll period while suspended.
    #[serde(default = "default_suspend_poll_ms")]
    pub suspend_poll_ms: u64,
    /// Upper bound of the run loop's sleep between iterations.
    #[serde(default = "default_max_idle_ms")]
    pub max_idle_ms: u64,
    /// Payload capacity of the state store in bytes.
    #[serde(default = "default_state_size")]
    pub state_size: usize,
    /// Lock settings applied to the state store and array buffers.
    #[serde(default)]
    pub lock: LockSettings,
    /// Number of slots in each outbound channel.
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,
    /// Maximum encoded size of one channel packet.
    #[serde(default = "default_channel_slot_size")]
    pub channel_slot_size: usize,
    /// Verbosity of this minion's own logging.
    #[serde(default)]
    pub log_level: LogLevel,
}

fn default_refresh_interval_ms() -> u64 {
    10
}

fn default_suspend_poll_ms() -> u64 {
    100
}

fn default_max_idle_ms() -> u64 {
    5
}

fn default_state_size() -> usize {
    DEFAULT_STATE_SIZE
}

fn default_channel_capacity() -> usize {
    64
}

fn default_channel_slot_size() -> usize {
    4096
}

impl Default for MinionConfig {
    fn default() -> Self {
        Self {
            refresh_interval_ms: default_refresh_interval_ms(),
            suspend_poll_ms: default_suspend_poll_ms(),
            max_idle_ms: default_max_idle_ms(),
            state_size: default_state_size(),
            lock: LockSettings::default(),
            channel_capacity: default_channel_capacity(),
            channel_slot_size: default_channel_slot_size(),
            log_level: LogLevel::default(),
        }
    }
}

impl MinionConfig {
    /// Base timer interval.
    pub fn refresh_interval(&self) -> Duration {
        Duration::from_millis(self.refresh_interval_ms)
    }

    /// Poll period while suspended.
    pub fn suspend_poll(&self) -> Duration {
        Duration::from_millis(self.suspend_poll_ms)
    }

    /// Longest sleep between two loop iterations.
    pub fn max_idle(&self) -> Duration {
        Duration::from_millis(self.max_idle_ms)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.refresh_interval_ms == 0 {
            return Err(ConfigError::ValidationError(
                "refresh_interval_ms must be positive".to_string(),
            ));
        }
        if self.state_size == 0 || self.state_size > BUFFER_MAX_SIZE {
            return Err(ConfigError::ValidationError(format!(
                "state_size {} outside 1..={}",
                self.state_size, BUFFER_MAX_SIZE
            )));
        }
        if self.lock.timeout == 0 {
            return Err(ConfigError::ValidationError(
                "lock.timeout must be positive".to_string(),
            ));
        }
        if self.channel_capacity == 0 {
            return Err(ConfigError::ValidationError(
                "channel_capacity must be positive".to_string(),
            ));
        }
        if self.channel_slot_size < 64 {
            return Err(ConfigError::ValidationError(
                "channel_slot_size must be at least 64 bytes".to_string(),
            ));
        }
        Ok(())
    }
}

/// Logger minion configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LoggerConfig {
    /// Name of the logger minion.
    pub name: String,
    /// How long one dequeue may block.
    #[serde(default = "default_record_timeout_ms")]
    pub record_timeout_ms: u64,
    /// How often reporter liveness is polled.
    #[serde(default = "default_liveness_interval_ms")]
    pub liveness_interval_ms: u64,
    /// How long a reporter that was never seen alive may stay absent before
    /// it counts as gone.
    #[serde(default = "default_reporter_grace_ms")]
    pub reporter_grace_ms: u64,
    /// Directory for per-reporter log files. `None` keeps records in `tracing` only.
    #[serde(default)]
    pub log_dir: Option<PathBuf>,
    /// Number of slots in the shared record queue.
    #[serde(default = "default_log_queue_capacity")]
    pub queue_capacity: usize,
    /// Maximum encoded size of one record.
    #[serde(default = "default_channel_slot_size")]
    pub slot_size: usize,
}

fn default_record_timeout_ms() -> u64 {
    100
}

fn default_liveness_interval_ms() -> u64 {
    250
}

fn default_reporter_grace_ms() -> u64 {
    2000
}

fn default_log_queue_capacity() -> usize {
    1024
}

impl LoggerConfig {
    /// Logger with default settings.
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            record_timeout_ms: default_record_timeout_ms(),
            liveness_interval_ms: default_liveness_interval_ms(),
            reporter_grace_ms: default_reporter_grace_ms(),
            log_dir: None,
            queue_capacity: default_log_queue_capacity(),
            slot_size: default_channel_slot_size(),
        }
    }

    /// Dequeue timeout.
    pub fn record_timeout(&self) -> Duration {
        Duration::from_millis(self.record_timeout_ms)
    }

    /// Reporter liveness poll period.
    pub fn liveness_interval(&self) -> Duration {
        Duration::from_millis(self.liveness_interval_ms)
    }

    /// Startup grace for reporters not yet seen alive.
    pub fn reporter_grace(&self) -> Duration {
        Duration::from_millis(self.reporter_grace_ms)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.name.is_empty() {
            return Err(ConfigError::ValidationError(
                "logger name cannot be empty".to_string(),
            ));
        }
        if self.queue_capacity == 0 {
            return Err(ConfigError::ValidationError(
                "queue_capacity must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

/// One `[[minion]]` entry of a topology file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MinionEntry {
    /// Unique minion name.
    pub name: String,
    /// Overrides of the topology-wide defaults.
    #[serde(default)]
    pub config: Option<MinionConfig>,
    /// Logger this minion reports to.
    #[serde(default)]
    pub reporter_of: Option<String>,
}

/// One `[[connection]]` entry of a topology file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ConnectionEntry {
    /// First endpoint.
    pub a: String,
    /// Second endpoint.
    pub b: String,
}

/// A complete process topology.
///
/// # TOML Example
///
/// ```toml
/// [shared]
/// service_name = "optics-bench"
///
/// [logger]
/// name = "logger"
///
/// [[minion]]
/// name = "camera"
/// reporter_of = "logger"
///
/// [[minion]]
/// name = "viewer"
///
/// [[connection]]
/// a = "camera"
/// b = "viewer"
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TopologyConfig {
    /// Service-wide settings.
    pub shared: SharedConfig,
    /// Defaults applied to minions without overrides.
    #[serde(default)]
    pub defaults: MinionConfig,
    /// Optional log aggregation minion.
    #[serde(default)]
    pub logger: Option<LoggerConfig>,
    /// Minions to create.
    #[serde(default, rename = "minion")]
    pub minions: Vec<MinionEntry>,
    /// Channels to wire.
    #[serde(default, rename = "connection")]
    pub connections: Vec<ConnectionEntry>,
}

impl TopologyConfig {
    /// Effective configuration of a minion entry.
    pub fn config_for(&self, entry: &MinionEntry) -> MinionConfig {
        entry.config.clone().unwrap_or_else(|| self.defaults.clone())
    }

    /// Validate names, references and nested configs.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.shared.validate()?;
        self.defaults.validate()?;

        let mut names = HashSet::new();
        if let Some(logger) = &self.logger {
            logger.validate()?;
            names.insert(logger.name.as_str());
        }
        for entry in &self.minions {
            if entry.name.is_empty() {
                return Err(ConfigError::ValidationError(
                    "minion name cannot be empty".to_string(),
                ));
            }
            if !names.insert(entry.name.as_str()) {
                return Err(ConfigError::ValidationError(format!(
                    "duplicate minion name '{}'",
                    entry.name
                )));
            }
            if let Some(config) = &entry.config {
                config.validate()?;
            }
        }
        for entry in &self.minions {
            if let Some(logger) = &entry.reporter_of {
                let known = self.logger.as_ref().is_some_and(|l| &l.name == logger);
                if !known {
                    return Err(ConfigError::ValidationError(format!(
                        "minion '{}' reports to unknown logger '{}'",
                        entry.name, logger
                    )));
                }
            }
        }
        for connection in &self.connections {
            if connection.a == connection.b {
                return Err(ConfigError::ValidationError(format!(
                    "minion '{}' cannot connect to itself",
                    connection.a
                )));
            }
            for end in [&connection.a, &connection.b] {
                if !names.contains(end.as_str()) {
                    return Err(ConfigError::ValidationError(format!(
                        "connection references unknown minion '{end}'"
                    )));
                }
            }
        }
        Ok(())
    }
}

/// Trait for loading configuration from TOML files.
///
/// # Contract
///
/// - Returns `ConfigError::FileNotFound` if the file does not exist
/// - Returns `ConfigError::ParseError` if TOML syntax is invalid or a field is unknown
pub trait ConfigLoader: Sized + serde::de::DeserializeOwned {
    /// Load configuration from a TOML file.
    fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                ConfigError::FileNotFound
            } else {
                ConfigError::ParseError(e.to_string())
            }
        })?;

        Self::from_toml(&content)
    }

    /// Parse configuration from a TOML string.
    fn from_toml(content: &str) -> Result<Self, ConfigError> {
        toml::from_str(content).map_err(|e| ConfigError::ParseError(e.to_string()))
    }
}

// Blanket implementation for all types that implement DeserializeOwned.
impl<T: serde::de::DeserializeOwned> ConfigLoader for T {}
