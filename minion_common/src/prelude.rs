//! Common re-exports.

pub use crate::config::{
    ConfigError, ConfigLoader, LockMode, LockSettings, LogLevel, LoggerConfig, MinionConfig,
    SharedConfig, TopologyConfig,
};
pub use crate::consts::*;
pub use crate::message::{LogRecord, Message, Packet};
pub use crate::status::MinionStatus;
