//! Minion lifecycle status.
//!
//! The status lives under the reserved `status` key of every state store as
//! a plain integer so that any process, in any language, can read or request
//! a transition.

use serde::{Deserialize, Serialize};

/// Lifecycle status of a minion.
///
/// `Initializing` is local to the starting process and never stored; the
/// other four map onto the stored integer codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MinionStatus {
    /// Store created, `initialize` hook not finished yet.
    Initializing,
    /// Main loop dispatching timers (code `1`).
    Running,
    /// Parked in the low-frequency poll loop (code `0`).
    Suspended,
    /// Shutdown requested or in progress (code `-1`).
    ShuttingDown,
    /// Segments released, process about to exit (code `-2`).
    Terminated,
}

impl MinionStatus {
    /// Integer code stored under the `status` key.
    pub const fn code(self) -> i64 {
        match self {
            Self::Initializing | Self::Running => 1,
            Self::Suspended => 0,
            Self::ShuttingDown => -1,
            Self::Terminated => -2,
        }
    }

    /// Decode a stored status code. Returns `None` for unknown values.
    pub const fn from_code(code: i64) -> Option<Self> {
        match code {
            1 => Some(Self::Running),
            0 => Some(Self::Suspended),
            -1 => Some(Self::ShuttingDown),
            -2 => Some(Self::Terminated),
            _ => None,
        }
    }

    /// True for `ShuttingDown` and `Terminated`.
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::ShuttingDown | Self::Terminated)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_codes_roundtrip() {
        for status in [
            MinionStatus::Running,
            MinionStatus::Suspended,
            MinionStatus::ShuttingDown,
            MinionStatus::Terminated,
        ] {
            assert_eq!(MinionStatus::from_code(status.code()), Some(status));
        }
        assert_eq!(MinionStatus::from_code(2), None);
        assert_eq!(MinionStatus::from_code(-3), None);
    }

    #[test]
    fn test_initializing_stores_as_running() {
        assert_eq!(MinionStatus::Initializing.code(), 1);
    }

    #[test]
    fn test_terminal_states() {
        assert!(MinionStatus::ShuttingDown.is_terminal());
        assert!(MinionStatus::Terminated.is_terminal());
        assert!(!MinionStatus::Running.is_terminal());
        assert!(!MinionStatus::Suspended.is_terminal());
    }
}
