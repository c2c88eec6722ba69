//! Linux-specific shared memory operations
//!
//! Segments are plain files under `/dev/shm`, mapped with `memmap2`. The
//! exclusive lock mode uses `flock(2)` on a sibling `.lock` file.

use crate::error::{ShmError, ShmResult};
use memmap2::{MmapMut, MmapOptions};
use minion_common::consts::SHM_DIR;
use nix::unistd::getpid;
use std::fs::{File, OpenOptions};
use std::io::ErrorKind;
use std::os::unix::fs::OpenOptionsExt;
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};

/// Filesystem path backing a named segment.
pub fn segment_path(name: &str) -> PathBuf {
    Path::new(SHM_DIR).join(name)
}

/// Path of the lock file used by the exclusive lock mode.
pub fn lock_path(name: &str) -> PathBuf {
    Path::new(SHM_DIR).join(format!("{name}.lock"))
}

/// Create a new segment file of `size` bytes and map it.
///
/// Fails with `AlreadyExists` if the file is already present.
pub fn create_segment_mmap(name: &str, size: usize) -> ShmResult<MmapMut> {
    let file = OpenOptions::new()
        .create_new(true)
        .read(true)
        .write(true)
        .mode(0o600) // Owner read/write only
        .open(segment_path(name))
        .map_err(|e| match e.kind() {
            ErrorKind::AlreadyExists => ShmError::AlreadyExists {
                name: name.to_string(),
            },
            _ => ShmError::Io { source: e },
        })?;

    file.set_len(size as u64)?;

    let mmap = unsafe { MmapOptions::new().populate().map_mut(&file)? };
    Ok(mmap)
}

/// Attach to an existing segment.
pub fn attach_segment_mmap(name: &str) -> ShmResult<MmapMut> {
    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .open(segment_path(name))
        .map_err(|e| not_found_or_io(name, e))?;

    let mmap = unsafe { MmapOptions::new().map_mut(&file)? };
    Ok(mmap)
}

/// Open-then-close probe. `Ok(false)` only when the segment is absent.
pub fn probe_segment(name: &str) -> ShmResult<bool> {
    match File::open(segment_path(name)) {
        Ok(_) => Ok(true),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
        Err(e) => Err(ShmError::Io { source: e }),
    }
}

/// Remove a segment and its lock file. Missing files are not an error.
pub fn unlink_segment(name: &str) -> ShmResult<()> {
    for path in [segment_path(name), lock_path(name)] {
        match std::fs::remove_file(&path) {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => return Err(ShmError::Io { source: e }),
        }
    }
    Ok(())
}

/// Open (creating if needed) the lock file of a segment.
pub fn open_lock_file(name: &str) -> ShmResult<File> {
    let file = OpenOptions::new()
        .create(true)
        .read(true)
        .write(true)
        .mode(0o600)
        .open(lock_path(name))?;
    Ok(file)
}

/// Non-blocking `flock(LOCK_EX)`. `Ok(false)` when another holder has it.
pub fn try_flock_exclusive(file: &File) -> ShmResult<bool> {
    let rc = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
    if rc == 0 {
        return Ok(true);
    }
    let err = std::io::Error::last_os_error();
    match err.raw_os_error() {
        Some(code) if code == libc::EWOULDBLOCK || code == libc::EINTR => Ok(false),
        _ => Err(ShmError::Io { source: err }),
    }
}

/// Release a lock taken with [`try_flock_exclusive`].
pub fn funlock(file: &File) {
    unsafe {
        libc::flock(file.as_raw_fd(), libc::LOCK_UN);
    }
}

/// Check if process is alive using kill(pid, 0)
pub fn is_process_alive(pid: u32) -> bool {
    use nix::sys::signal::kill;
    use nix::unistd::Pid;

    // 0 and negative pids address process groups
    if pid == 0 || pid > i32::MAX as u32 {
        return false;
    }

    match kill(Pid::from_raw(pid as i32), None) {
        Ok(_) => true,
        Err(nix::Error::ESRCH) => false, // No such process
        Err(nix::Error::EPERM) => true,  // Exists, not ours to signal
        Err(_) => false,
    }
}

/// Get current process ID
pub fn get_current_pid() -> u32 {
    getpid().as_raw() as u32
}

fn not_found_or_io(name: &str, e: std::io::Error) -> ShmError {
    if e.kind() == ErrorKind::NotFound {
        ShmError::NotFound {
            name: name.to_string(),
        }
    } else {
        ShmError::Io { source: e }
    }
}
