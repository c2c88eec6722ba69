//! Wire types carried over minion channels and the log queue.
//!
//! Everything is JSON encoded; a slot in a shared queue holds exactly one
//! serialized [`Packet`] or [`LogRecord`].

use crate::config::LogLevel;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::{SystemTime, UNIX_EPOCH};

/// A discrete event exchanged between two connected minions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// Application-level discriminator chosen by the sender.
    pub tag: String,
    /// Arbitrary JSON payload.
    pub payload: Value,
}

impl Message {
    /// Build a message from a tag and any JSON value.
    pub fn new(tag: impl Into<String>, payload: impl Into<Value>) -> Self {
        Self {
            tag: tag.into(),
            payload: payload.into(),
        }
    }
}

/// Everything that travels over a point-to-point channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Packet {
    /// User message, surfaced through `Minion::get`.
    Message(Message),
    /// Liveness broadcast. `alive: false` is sent once on shutdown.
    Liveness {
        /// Name of the sending minion.
        from: String,
        /// Whether the sender is still running.
        alive: bool,
    },
}

/// A log event forwarded from a reporter minion to a logger minion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogRecord {
    /// Reporter that emitted the event.
    pub minion: String,
    /// Event severity.
    pub level: LogLevel,
    /// `tracing` target of the event.
    pub target: String,
    /// Rendered message plus `key=value` fields.
    pub message: String,
    /// Wall-clock time in microseconds since the Unix epoch.
    pub timestamp_us: u64,
}

impl LogRecord {
    /// Build a record stamped with the current time.
    pub fn now(
        minion: impl Into<String>,
        level: LogLevel,
        target: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        let timestamp_us = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_micros() as u64;
        Self {
            minion: minion.into(),
            level,
            target: target.into(),
            message: message.into(),
            timestamp_us,
        }
    }
}
