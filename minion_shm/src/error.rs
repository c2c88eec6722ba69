//! Error types for shared memory operations

use thiserror::Error;

/// Errors that can occur during shared memory operations
#[derive(Error, Debug)]
pub enum ShmError {
    /// Segment already exists and its creator is still alive
    #[error("Segment already exists: {name}")]
    AlreadyExists {
        /// Segment name
        name: String,
    },

    /// Segment, state entry or buffer not found
    #[error("Segment not found: {name}")]
    NotFound {
        /// Segment name
        name: String,
    },

    /// Requested size outside the allowed range, or payload larger than the segment
    #[error("Allocation failed for {name}: {requested} bytes (limit {limit})")]
    Allocation {
        /// Segment name
        name: String,
        /// Requested size in bytes
        requested: usize,
        /// Maximum allowed size in bytes
        limit: usize,
    },

    /// Header identity or descriptor does not match what the opener expects
    #[error("Type mismatch on {name}: expected {expected}, found {found}")]
    TypeMismatch {
        /// Segment name
        name: String,
        /// Expected identity
        expected: String,
        /// Identity found in the header
        found: String,
    },

    /// Array shape differs from the shape fixed at creation
    #[error("Shape mismatch: expected {expected:?}, found {found:?}")]
    ShapeMismatch {
        /// Shape fixed at creation
        expected: Vec<usize>,
        /// Shape supplied by the caller
        found: Vec<usize>,
    },

    /// Lock not acquired within the configured number of attempts
    #[error("Lock acquisition on {name} timed out after {attempts} attempts")]
    LockTimeout {
        /// Segment name
        name: String,
        /// Attempts made
        attempts: u32,
    },

    /// Handle used from a process other than the one that opened it
    #[error("Access denied on {name}: opened by pid {owner_pid}, used from pid {current_pid}")]
    AccessDenied {
        /// Segment name
        name: String,
        /// Pid recorded at open
        owner_pid: u32,
        /// Pid of the caller
        current_pid: u32,
    },

    /// Key is reserved and cannot be changed through the mapping interface
    #[error("Key is reserved: {key}")]
    ReservedKey {
        /// Offending key
        key: String,
    },

    /// Store declares a different minion name than expected
    #[error("Name mismatch: expected {expected}, store declares {found}")]
    NameMismatch {
        /// Expected minion name
        expected: String,
        /// Declared minion name
        found: String,
    },

    /// Queue has no free slot
    #[error("Queue full: {name}")]
    QueueFull {
        /// Queue name
        name: String,
    },

    /// Consumer side of a queue has gone away
    #[error("Queue disconnected: {name}")]
    Disconnected {
        /// Queue name
        name: String,
    },

    /// Handle was closed or terminated
    #[error("Segment closed: {name}")]
    Closed {
        /// Segment name
        name: String,
    },

    /// IO error
    #[error("IO error: {source}")]
    Io {
        /// Source IO error
        #[from]
        source: std::io::Error,
    },

    /// JSON serialization/deserialization error
    #[error("JSON error: {source}")]
    Json {
        /// Source JSON error
        #[from]
        source: serde_json::Error,
    },
}

/// Result type for shared memory operations
pub type ShmResult<T> = Result<T, ShmError>;
