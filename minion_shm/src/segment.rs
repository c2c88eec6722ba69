//! Shared memory segment structures and operations
//!
//! Every segment starts with a 64-byte [`SegmentHeader`]:
//!
//! ```text
//! 0        32           40          44     45      46        64
//! ┌────────┬────────────┬───────────┬──────┬───────┬─────────┐
//! │identity│payload_size│ owner_pid │ lock │ flags │ padding │
//! └────────┴────────────┴───────────┴──────┴───────┴─────────┘
//! ```
//!
//! followed by an optional extension region (the array descriptor) and the
//! payload at `data_offset`.

use crate::error::{ShmError, ShmResult};
use crate::platform::{
    attach_segment_mmap, create_segment_mmap, get_current_pid, is_process_alive, probe_segment,
    unlink_segment,
};
use memmap2::MmapMut;
use minion_common::consts::{HEADER_SIZE, IDENTITY_LEN};
use static_assertions::const_assert_eq;
use std::sync::atomic::{AtomicU8, Ordering, fence};
use tracing::warn;

/// Flag bit set by a queue consumer that stopped listening.
pub const FLAG_DISCONNECTED: u8 = 0b0000_0001;

/// Segment header with cache-line alignment
#[repr(C, align(64))]
pub struct SegmentHeader {
    /// Null-padded identity string naming the segment's logical type
    pub identity: [u8; IDENTITY_LEN],
    /// Payload capacity in bytes
    pub payload_size: u64,
    /// Pid of the creating process
    pub owner_pid: u32,
    /// One-byte lock field (`'\0'`/`' '` free, `'w'` write, `'r'` read)
    pub lock: AtomicU8,
    /// Segment flags (see [`FLAG_DISCONNECTED`])
    pub flags: AtomicU8,
    _padding: [u8; 18],
}

const_assert_eq!(core::mem::size_of::<SegmentHeader>(), HEADER_SIZE);

impl SegmentHeader {
    /// Create new segment header
    pub fn new(identity: &str, payload_size: usize, owner_pid: u32) -> Self {
        Self {
            identity: encode_identity(identity),
            payload_size: payload_size as u64,
            owner_pid,
            lock: AtomicU8::new(0),
            flags: AtomicU8::new(0),
            _padding: [0; 18],
        }
    }

    /// Identity string up to the first null byte
    pub fn identity(&self) -> String {
        let end = self
            .identity
            .iter()
            .position(|&b| b == 0)
            .unwrap_or(IDENTITY_LEN);
        String::from_utf8_lossy(&self.identity[..end]).into_owned()
    }

    /// Whether a flag bit is set
    pub fn has_flag(&self, flag: u8) -> bool {
        self.flags.load(Ordering::Acquire) & flag != 0
    }

    /// Set a flag bit
    pub fn set_flag(&self, flag: u8) {
        self.flags.fetch_or(flag, Ordering::AcqRel);
    }
}

fn encode_identity(identity: &str) -> [u8; IDENTITY_LEN] {
    let mut out = [0u8; IDENTITY_LEN];
    let bytes = identity.as_bytes();
    let len = bytes.len().min(IDENTITY_LEN);
    out[..len].copy_from_slice(&bytes[..len]);
    out
}

/// Core shared memory segment representation
pub struct SharedMemorySegment {
    name: String,
    data_offset: usize,
    data_size: usize,
    mmap: Option<MmapMut>,
}

impl SharedMemorySegment {
    /// Create a segment, reclaiming a stale one left behind by a dead process.
    ///
    /// `data_offset` must be a multiple of 64 and at least [`HEADER_SIZE`].
    pub fn create(
        name: &str,
        identity: &str,
        data_offset: usize,
        data_size: usize,
    ) -> ShmResult<Self> {
        debug_assert!(data_offset >= HEADER_SIZE && data_offset % HEADER_SIZE == 0);

        if probe_segment(name)? {
            reclaim_if_stale(name)?;
        }

        let mut mmap = create_segment_mmap(name, data_offset + data_size)?;
        {
            let header = unsafe { &mut *(mmap.as_mut_ptr() as *mut SegmentHeader) };
            *header = SegmentHeader::new(identity, data_size, get_current_pid());
        }

        // Header must be visible before anyone attaches
        fence(Ordering::Release);

        Ok(Self {
            name: name.to_string(),
            data_offset,
            data_size,
            mmap: Some(mmap),
        })
    }

    /// Attach to an existing segment, validating its identity.
    pub fn attach(name: &str, identity: &str, data_offset: usize) -> ShmResult<Self> {
        let mmap = attach_segment_mmap(name)?;

        if mmap.len() < data_offset {
            return Err(ShmError::TypeMismatch {
                name: name.to_string(),
                expected: identity.to_string(),
                found: format!("truncated segment of {} bytes", mmap.len()),
            });
        }

        let header = unsafe { &*(mmap.as_ptr() as *const SegmentHeader) };
        let found = header.identity();
        if found != identity {
            return Err(ShmError::TypeMismatch {
                name: name.to_string(),
                expected: identity.to_string(),
                found,
            });
        }

        let data_size = header.payload_size as usize;
        if mmap.len() < data_offset + data_size {
            return Err(ShmError::TypeMismatch {
                name: name.to_string(),
                expected: identity.to_string(),
                found: format!("payload of {data_size} bytes past end of mapping"),
            });
        }

        Ok(Self {
            name: name.to_string(),
            data_offset,
            data_size,
            mmap: Some(mmap),
        })
    }

    /// Segment name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Payload capacity in bytes
    pub fn data_size(&self) -> usize {
        self.data_size
    }

    /// Whether this handle is still mapped
    pub fn is_mapped(&self) -> bool {
        self.mmap.is_some()
    }

    /// Header of a mapped segment
    pub fn header(&self) -> ShmResult<&SegmentHeader> {
        let mmap = self.mapping()?;
        Ok(unsafe { &*(mmap.as_ptr() as *const SegmentHeader) })
    }

    /// Bytes between the header and the payload
    pub fn extension(&self) -> ShmResult<&[u8]> {
        let mmap = self.mapping()?;
        Ok(&mmap[HEADER_SIZE..self.data_offset])
    }

    /// Mutable bytes between the header and the payload
    pub fn extension_mut(&mut self) -> ShmResult<&mut [u8]> {
        let offset = self.data_offset;
        let mmap = self.mapping_mut()?;
        Ok(&mut mmap[HEADER_SIZE..offset])
    }

    /// Header and payload, borrowed together
    pub fn split(&self) -> ShmResult<(&SegmentHeader, &[u8])> {
        let (offset, size) = (self.data_offset, self.data_size);
        let mmap = self.mapping()?;
        let header = unsafe { &*(mmap.as_ptr() as *const SegmentHeader) };
        Ok((header, &mmap[offset..offset + size]))
    }

    /// Header and mutable payload, borrowed together
    pub fn split_mut(&mut self) -> ShmResult<(&SegmentHeader, &mut [u8])> {
        let (offset, size) = (self.data_offset, self.data_size);
        let mmap = self.mapping_mut()?;
        let (head, rest) = mmap.split_at_mut(HEADER_SIZE);
        let header = unsafe { &*(head.as_ptr() as *const SegmentHeader) };
        let start = offset - HEADER_SIZE;
        Ok((header, &mut rest[start..start + size]))
    }

    /// Unmap without removing the segment
    pub fn close(&mut self) {
        self.mmap = None;
    }

    /// Unmap and remove the segment from the OS
    pub fn unlink(&mut self) -> ShmResult<()> {
        self.close();
        unlink_segment(&self.name)
    }

    fn mapping(&self) -> ShmResult<&MmapMut> {
        self.mmap.as_ref().ok_or_else(|| ShmError::Closed {
            name: self.name.clone(),
        })
    }

    fn mapping_mut(&mut self) -> ShmResult<&mut MmapMut> {
        let name = &self.name;
        self.mmap.as_mut().ok_or_else(|| ShmError::Closed { name: name.clone() })
    }
}

/// Remove an existing segment whose creator is gone.
fn reclaim_if_stale(name: &str) -> ShmResult<()> {
    let owner = match attach_segment_mmap(name) {
        Ok(mmap) if mmap.len() >= HEADER_SIZE => {
            let header = unsafe { &*(mmap.as_ptr() as *const SegmentHeader) };
            Some(header.owner_pid)
        }
        Ok(_) => None,
        Err(ShmError::NotFound { .. }) => return Ok(()),
        Err(e) => return Err(e),
    };

    match owner {
        Some(pid) if is_process_alive(pid) => Err(ShmError::AlreadyExists {
            name: name.to_string(),
        }),
        _ => {
            warn!("Reclaiming stale segment {} (owner {:?} gone)", name, owner);
            unlink_segment(name)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    fn unique(prefix: &str) -> String {
        static CTR: AtomicU32 = AtomicU32::new(0);
        let id = CTR.fetch_add(1, Ordering::Relaxed);
        format!("{prefix}_{}_{id}", std::process::id())
    }

    #[test]
    fn test_header_creation() {
        let header = SegmentHeader::new("minion_test", 4096, 12345);
        assert_eq!(header.identity(), "minion_test");
        assert_eq!(header.payload_size, 4096);
        assert_eq!(header.owner_pid, 12345);
        assert_eq!(header.lock.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn test_identity_truncated_to_width() {
        let long = "x".repeat(IDENTITY_LEN + 10);
        let header = SegmentHeader::new(&long, 0, 1);
        assert_eq!(header.identity().len(), IDENTITY_LEN);
    }

    #[test]
    fn test_flags() {
        let header = SegmentHeader::new("q", 0, 1);
        assert!(!header.has_flag(FLAG_DISCONNECTED));
        header.set_flag(FLAG_DISCONNECTED);
        assert!(header.has_flag(FLAG_DISCONNECTED));
    }

    #[test]
    fn test_attach_checks_identity() {
        let name = unique("segment_identity");
        let mut created = SharedMemorySegment::create(&name, "kind_a", HEADER_SIZE, 128).unwrap();

        let attached = SharedMemorySegment::attach(&name, "kind_a", HEADER_SIZE).unwrap();
        assert_eq!(attached.data_size(), 128);

        let wrong = SharedMemorySegment::attach(&name, "kind_b", HEADER_SIZE);
        assert!(matches!(wrong, Err(ShmError::TypeMismatch { .. })));

        created.unlink().unwrap();
    }

    #[test]
    fn test_payload_shared_between_handles() {
        let name = unique("segment_shared");
        let mut created = SharedMemorySegment::create(&name, "kind", HEADER_SIZE, 16).unwrap();
        let attached = SharedMemorySegment::attach(&name, "kind", HEADER_SIZE).unwrap();

        created.split_mut().unwrap().1[..3].copy_from_slice(b"abc");
        assert_eq!(&attached.split().unwrap().1[..3], b"abc");

        created.unlink().unwrap();
    }

    #[test]
    fn test_live_owner_blocks_create() {
        let name = unique("segment_live");
        let mut created = SharedMemorySegment::create(&name, "kind", HEADER_SIZE, 16).unwrap();

        let again = SharedMemorySegment::create(&name, "kind", HEADER_SIZE, 16);
        assert!(matches!(again, Err(ShmError::AlreadyExists { .. })));

        created.unlink().unwrap();
    }

    #[test]
    fn test_stale_segment_reclaimed() {
        let name = unique("segment_stale");
        let mut created = SharedMemorySegment::create(&name, "kind", HEADER_SIZE, 16).unwrap();
        {
            let mmap = created.mapping_mut().unwrap();
            let header = unsafe { &mut *(mmap.as_mut_ptr() as *mut SegmentHeader) };
            // Above the kernel's pid_max, so never alive
            header.owner_pid = 0x3FFF_FFFF;
        }
        created.close();

        let mut replaced = SharedMemorySegment::create(&name, "kind", HEADER_SIZE, 32).unwrap();
        assert_eq!(replaced.data_size(), 32);
        assert_eq!(replaced.header().unwrap().owner_pid, get_current_pid());

        replaced.unlink().unwrap();
    }

    #[test]
    fn test_closed_handle_errors() {
        let name = unique("segment_closed");
        let mut created = SharedMemorySegment::create(&name, "kind", HEADER_SIZE, 16).unwrap();
        created.close();
        assert!(matches!(created.header(), Err(ShmError::Closed { .. })));
        assert!(probe_segment(&name).unwrap());
        created.unlink().unwrap();
        assert!(!probe_segment(&name).unwrap());
    }
}
