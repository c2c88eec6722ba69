//! Best-effort segment locking.
//!
//! Two modes, chosen per handle through [`LockSettings`]:
//!
//! - [`LockMode::Exclusive`]: `flock(2)` on a sibling `<name>.lock` file.
//!   Readers and writers exclude each other.
//! - [`LockMode::ReadWrite`]: spin on the one-byte lock field of the segment
//!   header. `'\0'` or `' '` is free, `'w'` is held by one writer, `'r'` is
//!   held by one or more readers.
//!
//! Both modes try at most `timeout` times and then give up with
//! [`ShmError::LockTimeout`]. The spin lock carries no reader count, so the
//! first reader to leave frees the byte for a writer while other readers may
//! still be copying; a torn read then fails to decode and is reported as an
//! empty value by the caller.

use crate::error::{ShmError, ShmResult};
use crate::platform::{funlock, open_lock_file, try_flock_exclusive};
use minion_common::config::{LockMode, LockSettings};
use std::fs::File;
use std::sync::atomic::{AtomicU8, Ordering};

/// Lock byte value: free.
pub const LOCK_FREE: u8 = b'\0';
/// Lock byte value: free (alternate encoding written by other implementations).
pub const LOCK_FREE_ALT: u8 = b' ';
/// Lock byte value: write-held.
pub const LOCK_WRITE: u8 = b'w';
/// Lock byte value: read-held (shared).
pub const LOCK_READ: u8 = b'r';

/// Spins before the acquire loop starts yielding the CPU.
const SPINS_BEFORE_YIELD: u32 = 64;

/// Requested access.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    /// Shared access.
    Read,
    /// Exclusive access.
    Write,
}

/// Per-handle lock state.
pub struct SegmentLock {
    name: String,
    settings: LockSettings,
    file: Option<File>,
}

impl SegmentLock {
    /// Prepare the lock of segment `name`. Opens the lock file in exclusive mode.
    pub fn open(name: &str, settings: LockSettings) -> ShmResult<Self> {
        let file = match settings.mode {
            LockMode::Exclusive => Some(open_lock_file(name)?),
            LockMode::ReadWrite => None,
        };
        Ok(Self {
            name: name.to_string(),
            settings,
            file,
        })
    }

    /// Name of the guarded segment.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Lock settings of this handle.
    pub fn settings(&self) -> LockSettings {
        self.settings
    }

    /// Acquire the lock, giving up after `settings.timeout` attempts.
    pub fn acquire<'a>(&'a self, byte: &'a AtomicU8, access: Access) -> ShmResult<LockGuard<'a>> {
        let attempts = self.settings.timeout.max(1);

        for attempt in 0..attempts {
            let acquired = match &self.file {
                Some(file) => try_flock_exclusive(file)?.then_some(Held::Flock(file)),
                None => try_spin(byte, access).then_some(Held::Spin { byte, access }),
            };
            if let Some(held) = acquired {
                return Ok(LockGuard { held });
            }

            if attempt < SPINS_BEFORE_YIELD {
                std::hint::spin_loop();
            } else {
                std::thread::yield_now();
            }
        }

        Err(ShmError::LockTimeout {
            name: self.name.clone(),
            attempts,
        })
    }
}

fn try_spin(byte: &AtomicU8, access: Access) -> bool {
    let current = byte.load(Ordering::Acquire);
    match (current, access) {
        (LOCK_FREE | LOCK_FREE_ALT, Access::Write) => byte
            .compare_exchange(current, LOCK_WRITE, Ordering::AcqRel, Ordering::Acquire)
            .is_ok(),
        (LOCK_FREE | LOCK_FREE_ALT, Access::Read) => byte
            .compare_exchange(current, LOCK_READ, Ordering::AcqRel, Ordering::Acquire)
            .is_ok(),
        (LOCK_READ, Access::Read) => true,
        _ => false,
    }
}

enum Held<'a> {
    Spin { byte: &'a AtomicU8, access: Access },
    Flock(&'a File),
}

/// Releases the lock on drop.
pub struct LockGuard<'a> {
    held: Held<'a>,
}

impl Drop for LockGuard<'_> {
    fn drop(&mut self) {
        match self.held {
            Held::Spin {
                byte,
                access: Access::Write,
            } => byte.store(LOCK_FREE, Ordering::Release),
            Held::Spin {
                byte,
                access: Access::Read,
            } => {
                // A writer may only have taken over if the byte was freed
                let _ = byte.compare_exchange(
                    LOCK_READ,
                    LOCK_FREE,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                );
            }
            Held::Flock(file) => funlock(file),
        }
    }
}
