//! Bounded shared memory queue.
//!
//! Fixed number of fixed-size slots in one segment, used for the directed
//! minion channels and for the shared log queue. The payload region starts
//! with a 64-byte [`QueueState`] followed by `capacity` slots of
//! `[len: u32 LE][bytes; slot_size]`.
//!
//! Every access, push or pop, takes the segment lock for writing, so any
//! number of producers and consumers may share a queue. `head` and `tail` are
//! monotonically increasing counters; the slot of counter `n` is
//! `n % capacity`.

use crate::error::{ShmError, ShmResult};
use crate::lock::{Access, SegmentLock};
use crate::platform::probe_segment;
use crate::segment::{FLAG_DISCONNECTED, SharedMemorySegment};
use bytemuck::{Pod, Zeroable};
use minion_common::config::LockSettings;
use minion_common::consts::{BUFFER_MAX_SIZE, HEADER_SIZE, QUEUE_IDENTITY};
use serde::Serialize;
use serde::de::DeserializeOwned;
use static_assertions::const_assert_eq;
use std::time::{Duration, Instant};
use tracing::warn;

const QUEUE_STATE_SIZE: usize = 64;
const LEN_PREFIX: usize = 4;
const POLL_INTERVAL: Duration = Duration::from_millis(1);

/// Queue bookkeeping stored at the start of the payload.
#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
struct QueueState {
    head: u64,
    tail: u64,
    capacity: u64,
    slot_size: u64,
    _reserved: [u64; 4],
}

const_assert_eq!(core::mem::size_of::<QueueState>(), QUEUE_STATE_SIZE);

impl QueueState {
    fn load(data: &[u8]) -> Self {
        bytemuck::pod_read_unaligned(&data[..QUEUE_STATE_SIZE])
    }

    fn store(&self, data: &mut [u8]) {
        data[..QUEUE_STATE_SIZE].copy_from_slice(bytemuck::bytes_of(self));
    }

    fn len(&self) -> u64 {
        self.tail.wrapping_sub(self.head)
    }

    fn slot_offset(&self, counter: u64) -> usize {
        let index = (counter % self.capacity) as usize;
        QUEUE_STATE_SIZE + index * (LEN_PREFIX + self.slot_size as usize)
    }
}

fn payload_size(capacity: usize, slot_size: usize) -> Option<usize> {
    capacity
        .checked_mul(slot_size.checked_add(LEN_PREFIX)?)?
        .checked_add(QUEUE_STATE_SIZE)
}

/// Named bounded queue of byte messages in shared memory.
pub struct ShmQueue {
    segment: SharedMemorySegment,
    lock: SegmentLock,
    capacity: usize,
    slot_size: usize,
    terminated: bool,
}

impl ShmQueue {
    /// Create a queue with `capacity` slots of at most `slot_size` bytes.
    pub fn create(
        name: &str,
        capacity: usize,
        slot_size: usize,
        settings: LockSettings,
    ) -> ShmResult<Self> {
        let size = payload_size(capacity, slot_size).unwrap_or(usize::MAX);
        if capacity == 0 || slot_size == 0 || slot_size > u32::MAX as usize || size > BUFFER_MAX_SIZE {
            return Err(ShmError::Allocation {
                name: name.to_string(),
                requested: size,
                limit: BUFFER_MAX_SIZE,
            });
        }

        let mut segment = SharedMemorySegment::create(name, QUEUE_IDENTITY, HEADER_SIZE, size)?;
        let state = QueueState {
            head: 0,
            tail: 0,
            capacity: capacity as u64,
            slot_size: slot_size as u64,
            _reserved: [0; 4],
        };
        state.store(segment.split_mut()?.1);

        let lock = SegmentLock::open(name, settings)?;
        Ok(Self {
            segment,
            lock,
            capacity,
            slot_size,
            terminated: false,
        })
    }

    /// Attach to an existing queue.
    pub fn open(name: &str, settings: LockSettings) -> ShmResult<Self> {
        let segment = SharedMemorySegment::attach(name, QUEUE_IDENTITY, HEADER_SIZE)?;
        let (_, data) = segment.split()?;
        if data.len() < QUEUE_STATE_SIZE {
            return Err(ShmError::TypeMismatch {
                name: name.to_string(),
                expected: QUEUE_IDENTITY.to_string(),
                found: format!("payload of {} bytes", data.len()),
            });
        }

        let state = QueueState::load(data);
        let (capacity, slot_size) = (state.capacity as usize, state.slot_size as usize);
        if capacity == 0 || payload_size(capacity, slot_size) != Some(data.len()) {
            return Err(ShmError::TypeMismatch {
                name: name.to_string(),
                expected: format!("{capacity} slots of {slot_size} bytes"),
                found: format!("payload of {} bytes", data.len()),
            });
        }

        let lock = SegmentLock::open(name, settings)?;
        Ok(Self {
            segment,
            lock,
            capacity,
            slot_size,
            terminated: false,
        })
    }

    /// Create the queue, or attach to it if a live creator already made it.
    pub fn open_or_create(
        name: &str,
        capacity: usize,
        slot_size: usize,
        settings: LockSettings,
    ) -> ShmResult<Self> {
        match Self::create(name, capacity, slot_size, settings) {
            Err(ShmError::AlreadyExists { .. }) => Self::open(name, settings),
            other => other,
        }
    }

    /// Segment name.
    pub fn name(&self) -> &str {
        self.segment.name()
    }

    /// Number of slots.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Largest message accepted by [`push`](Self::push).
    pub fn slot_size(&self) -> usize {
        self.slot_size
    }

    /// Enqueue one message without blocking.
    pub fn push(&mut self, bytes: &[u8]) -> ShmResult<()> {
        if bytes.len() > self.slot_size {
            return Err(ShmError::Allocation {
                name: self.name().to_string(),
                requested: bytes.len(),
                limit: self.slot_size,
            });
        }

        let (header, data) = self.segment.split_mut()?;
        if header.has_flag(FLAG_DISCONNECTED) {
            return Err(ShmError::Disconnected {
                name: self.lock.name().to_string(),
            });
        }

        let _guard = self.lock.acquire(&header.lock, Access::Write)?;
        let mut state = QueueState::load(data);
        if state.len() >= state.capacity {
            return Err(ShmError::QueueFull {
                name: self.lock.name().to_string(),
            });
        }

        let offset = state.slot_offset(state.tail);
        data[offset..offset + LEN_PREFIX].copy_from_slice(&(bytes.len() as u32).to_le_bytes());
        data[offset + LEN_PREFIX..offset + LEN_PREFIX + bytes.len()].copy_from_slice(bytes);
        state.tail = state.tail.wrapping_add(1);
        state.store(data);
        Ok(())
    }

    /// Dequeue one message without blocking. `Ok(None)` when empty.
    pub fn pop(&mut self) -> ShmResult<Option<Vec<u8>>> {
        let (header, data) = self.segment.split_mut()?;
        let _guard = self.lock.acquire(&header.lock, Access::Write)?;
        let mut state = QueueState::load(data);
        if state.len() == 0 {
            return Ok(None);
        }

        let offset = state.slot_offset(state.head);
        let mut len_bytes = [0u8; LEN_PREFIX];
        len_bytes.copy_from_slice(&data[offset..offset + LEN_PREFIX]);
        let len = u32::from_le_bytes(len_bytes) as usize;
        state.head = state.head.wrapping_add(1);
        state.store(data);

        if len > state.slot_size as usize {
            return Err(ShmError::Allocation {
                name: self.lock.name().to_string(),
                requested: len,
                limit: state.slot_size as usize,
            });
        }
        let start = offset + LEN_PREFIX;
        Ok(Some(data[start..start + len].to_vec()))
    }

    /// Dequeue one message, polling until `timeout` elapses.
    pub fn pop_timeout(&mut self, timeout: Duration) -> ShmResult<Option<Vec<u8>>> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(bytes) = self.pop()? {
                return Ok(Some(bytes));
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            std::thread::sleep(POLL_INTERVAL.min(deadline - now));
        }
    }

    /// Serialize `value` as JSON and enqueue it.
    pub fn push_json<T: Serialize + ?Sized>(&mut self, value: &T) -> ShmResult<()> {
        let encoded = serde_json::to_vec(value)?;
        self.push(&encoded)
    }

    /// Dequeue and decode one JSON message.
    pub fn pop_json<T: DeserializeOwned>(&mut self) -> ShmResult<Option<T>> {
        match self.pop()? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Dequeue and decode one JSON message, polling until `timeout` elapses.
    pub fn pop_json_timeout<T: DeserializeOwned>(&mut self, timeout: Duration) -> ShmResult<Option<T>> {
        match self.pop_timeout(timeout)? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Number of queued messages.
    pub fn len(&self) -> ShmResult<usize> {
        let (header, data) = self.segment.split()?;
        let _guard = self.lock.acquire(&header.lock, Access::Read)?;
        Ok(QueueState::load(data).len() as usize)
    }

    /// Whether no message is queued.
    pub fn is_empty(&self) -> ShmResult<bool> {
        Ok(self.len()? == 0)
    }

    /// Tell producers the consumer has stopped listening.
    pub fn disconnect(&self) -> ShmResult<()> {
        self.segment.header()?.set_flag(FLAG_DISCONNECTED);
        Ok(())
    }

    /// Whether the consumer side has disconnected. A closed handle reports `true`.
    pub fn is_disconnected(&self) -> bool {
        self.segment
            .header()
            .map(|header| header.has_flag(FLAG_DISCONNECTED))
            .unwrap_or(true)
    }

    /// Detach without destroying the segment.
    pub fn close(&mut self) {
        self.segment.close();
    }

    /// Disconnect, detach and unlink. Calling it again is a no-op.
    pub fn terminate(&mut self) -> ShmResult<()> {
        if self.terminated {
            return Ok(());
        }
        if self.segment.is_mapped() {
            self.disconnect()?;
        }
        self.segment.unlink()?;
        self.terminated = true;
        Ok(())
    }

    /// Best-effort liveness: the segment can still be opened by name.
    pub fn is_alive(&self) -> bool {
        if self.terminated {
            return false;
        }
        probe_segment(self.name()).unwrap_or_else(|e| {
            warn!("Probe of {} failed: {}", self.name(), e);
            false
        })
    }
}
