//! # Minion Shared Memory
//!
//! Named OS shared memory primitives for minion processes on one host. A
//! segment is a file under `/dev/shm` starting with a 64-byte header that
//! records the segment kind, payload size, creator pid, a one-byte lock and
//! flags.
//!
//! ## Primitives
//!
//! - [`SharedBuffer`] - one JSON document, null padded (up to 16 MiB)
//! - [`SharedArrayBuffer`] - raw fixed-shape numeric array (up to 4 GiB)
//! - [`ShmQueue`] - bounded multi-producer queue of byte messages
//! - [`SharedStateStore`] - key/value mapping over a [`SharedBuffer`], one per minion
//!
//! ## Locking
//!
//! Each handle picks a [`LockMode`](minion_common::config::LockMode):
//! `flock` on a sibling lock file, or a spin on the header lock byte. Both
//! give up after a bounded number of attempts with
//! [`ShmError::LockTimeout`]; nothing in this crate blocks indefinitely.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use minion_common::config::LockSettings;
//! use minion_shm::{SharedStateStore, ShmResult};
//!
//! # fn main() -> ShmResult<()> {
//! let mut camera = SharedStateStore::create("camera", 64 * 1024, LockSettings::default())?;
//! camera.set("exposure_ms", &12.5)?;
//!
//! let mut viewer = SharedStateStore::open("camera", LockSettings::default())?;
//! assert_eq!(viewer.get_as::<f64>("exposure_ms")?, Some(12.5));
//!
//! camera.terminate()?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Stale segments
//!
//! Creating a segment whose name is taken by a dead process's leftover
//! reclaims it. A segment whose creator is still alive is never touched.

#![deny(missing_docs)]
#![warn(clippy::all)]

pub mod array;
pub mod buffer;
pub mod error;
pub mod lock;
pub mod platform;
pub mod queue;
pub mod segment;
pub mod store;

pub use array::{ArrayDescriptor, DType, Element, SharedArrayBuffer};
pub use buffer::SharedBuffer;
pub use error::{ShmError, ShmResult};
pub use lock::{Access, LockGuard, SegmentLock};
pub use queue::ShmQueue;
pub use segment::{SegmentHeader, SharedMemorySegment};
pub use store::SharedStateStore;

/// Initialize human-readable tracing for a standalone minion process.
///
/// Filter taken from `RUST_LOG`, falling back to `default_level`.
pub fn init_tracing(default_level: &str) {
    use tracing_subscriber::{EnvFilter, fmt};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    let subscriber = fmt::Subscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(true)
        .with_line_number(true)
        .finish();

    let _ = tracing::subscriber::set_global_default(subscriber);
}

/// Initialize JSON tracing, one event per line.
pub fn init_tracing_json(default_level: &str) {
    use tracing_subscriber::{EnvFilter, fmt};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    let subscriber = fmt::Subscriber::builder()
        .with_env_filter(filter)
        .json()
        .finish();

    let _ = tracing::subscriber::set_global_default(subscriber);
}
