//! Error types for the minion process layer

use minion_common::config::ConfigError;
use minion_shm::ShmError;
use thiserror::Error;

/// Errors raised by minions, loggers and the manager
#[derive(Error, Debug)]
pub enum MinionError {
    /// Shared memory primitive failed
    #[error(transparent)]
    Shm(#[from] ShmError),

    /// Invalid configuration
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// Send or receive on a peer that was never connected
    #[error("No channel between {from} and {peer}")]
    ChannelNotFound {
        /// Local minion
        from: String,
        /// Requested peer
        peer: String,
    },

    /// Cross-minion state access on a peer that is not linked
    #[error("{from} is not linked to {peer}")]
    NotLinked {
        /// Local minion
        from: String,
        /// Requested peer
        peer: String,
    },

    /// Operation requires a started minion
    #[error("Minion {name} has not been started")]
    NotStarted {
        /// Minion name
        name: String,
    },

    /// Manager has no minion of that name
    #[error("Unknown minion: {name}")]
    UnknownMinion {
        /// Requested name
        name: String,
    },

    /// A minion cannot be connected to itself
    #[error("Minion {name} cannot connect to itself")]
    SelfConnection {
        /// Minion name
        name: String,
    },

    /// Creating or reaping a minion process failed
    #[error("Process management failed for {name}: {source}")]
    Spawn {
        /// Minion name
        name: String,
        /// Underlying errno
        #[source]
        source: nix::Error,
    },

    /// Log sink could not be opened or written
    #[error("IO error: {source}")]
    Io {
        /// Source IO error
        #[from]
        source: std::io::Error,
    },
}

/// Result type for minion operations
pub type MinionResult<T> = Result<T, MinionError>;
