//! JSON shared buffer.
//!
//! A named segment holding one JSON document, UTF-8 encoded and null padded
//! to the segment size. Every write zero-fills the payload before copying the
//! new document in, so a reader decodes up to the first null byte.

use crate::error::{ShmError, ShmResult};
use crate::lock::{Access, SegmentLock};
use crate::platform::probe_segment;
use crate::segment::SharedMemorySegment;
use minion_common::config::LockSettings;
use minion_common::consts::{BUFFER_IDENTITY, BUFFER_MAX_SIZE, HEADER_SIZE};
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::warn;

/// Named shared memory segment holding a JSON payload.
pub struct SharedBuffer {
    segment: SharedMemorySegment,
    lock: SegmentLock,
    terminated: bool,
}

impl SharedBuffer {
    /// Allocate a new buffer with `size` bytes of payload capacity.
    pub fn create(name: &str, size: usize, settings: LockSettings) -> ShmResult<Self> {
        if size == 0 || size > BUFFER_MAX_SIZE {
            return Err(ShmError::Allocation {
                name: name.to_string(),
                requested: size,
                limit: BUFFER_MAX_SIZE,
            });
        }

        let segment = SharedMemorySegment::create(name, BUFFER_IDENTITY, HEADER_SIZE, size)?;
        let lock = SegmentLock::open(name, settings)?;
        Ok(Self {
            segment,
            lock,
            terminated: false,
        })
    }

    /// Allocate a buffer sized to hold exactly `value`, and write it.
    pub fn create_with_value<T: Serialize + ?Sized>(
        name: &str,
        value: &T,
        settings: LockSettings,
    ) -> ShmResult<Self> {
        let encoded = serde_json::to_vec(value)?;
        let mut buffer = Self::create(name, encoded.len(), settings)?;
        buffer.write_encoded(&encoded)?;
        Ok(buffer)
    }

    /// Attach to an existing buffer.
    pub fn open(name: &str, settings: LockSettings) -> ShmResult<Self> {
        let segment = SharedMemorySegment::attach(name, BUFFER_IDENTITY, HEADER_SIZE)?;
        let lock = SegmentLock::open(name, settings)?;
        Ok(Self {
            segment,
            lock,
            terminated: false,
        })
    }

    /// Whether a buffer named `name` exists. Errors other than absence propagate.
    pub fn exists(name: &str) -> ShmResult<bool> {
        probe_segment(name)
    }

    /// Segment name.
    pub fn name(&self) -> &str {
        self.segment.name()
    }

    /// Payload capacity in bytes.
    pub fn size(&self) -> usize {
        self.segment.data_size()
    }

    /// Serialize `value` and overwrite the payload.
    ///
    /// A value serializing to JSON `null` clears the payload.
    pub fn write<T: Serialize + ?Sized>(&mut self, value: &T) -> ShmResult<()> {
        let encoded = serde_json::to_vec(value)?;
        self.write_encoded(&encoded)
    }

    /// Zero the payload.
    pub fn clear(&mut self) -> ShmResult<()> {
        self.write_encoded(&[])
    }

    fn write_encoded(&mut self, encoded: &[u8]) -> ShmResult<()> {
        let encoded = if encoded == b"null" { &[][..] } else { encoded };
        if encoded.len() > self.segment.data_size() {
            return Err(ShmError::Allocation {
                name: self.segment.name().to_string(),
                requested: encoded.len(),
                limit: self.segment.data_size(),
            });
        }

        let (header, data) = self.segment.split_mut()?;
        let _guard = self.lock.acquire(&header.lock, Access::Write)?;
        data.fill(0);
        data[..encoded.len()].copy_from_slice(encoded);
        Ok(())
    }

    /// Read, transform and write back the stored document under one write
    /// lock. `f` receives `None` for an empty or undecodable payload.
    pub fn update<F>(&mut self, f: F) -> ShmResult<()>
    where
        F: FnOnce(Option<Value>) -> Value,
    {
        let name = self.segment.name().to_string();
        let (header, data) = self.segment.split_mut()?;
        let _guard = self.lock.acquire(&header.lock, Access::Write)?;

        let end = data.iter().position(|&b| b == 0).unwrap_or(data.len());
        let current = if end == 0 {
            None
        } else {
            match serde_json::from_slice(&data[..end]) {
                Ok(value) => Some(value),
                Err(e) => {
                    warn!("Undecodable payload in {}: {}", name, e);
                    None
                }
            }
        };

        let next = f(current);
        let encoded = if next.is_null() {
            Vec::new()
        } else {
            serde_json::to_vec(&next)?
        };
        if encoded.len() > data.len() {
            return Err(ShmError::Allocation {
                name,
                requested: encoded.len(),
                limit: data.len(),
            });
        }
        data.fill(0);
        data[..encoded.len()].copy_from_slice(&encoded);
        Ok(())
    }

    /// Decode the stored document.
    ///
    /// Returns `Ok(None)` when the payload is empty or cannot be decoded;
    /// the decode failure is logged.
    pub fn read(&self) -> ShmResult<Option<Value>> {
        let raw = self.read_raw()?;
        if raw.is_empty() {
            return Ok(None);
        }
        match serde_json::from_slice(&raw) {
            Ok(value) => Ok(Some(value)),
            Err(e) => {
                warn!("Undecodable payload in {}: {}", self.name(), e);
                Ok(None)
            }
        }
    }

    /// Decode the stored document into `T`.
    pub fn read_as<T: DeserializeOwned>(&self) -> ShmResult<Option<T>> {
        match self.read()? {
            Some(value) => Ok(Some(serde_json::from_value(value)?)),
            None => Ok(None),
        }
    }

    fn read_raw(&self) -> ShmResult<Vec<u8>> {
        let (header, data) = self.segment.split()?;
        let _guard = self.lock.acquire(&header.lock, Access::Read)?;
        let end = data.iter().position(|&b| b == 0).unwrap_or(data.len());
        Ok(data[..end].to_vec())
    }

    /// Detach without destroying the segment.
    pub fn close(&mut self) {
        self.segment.close();
    }

    /// Clear, detach and unlink the segment. Calling it again is a no-op.
    pub fn terminate(&mut self) -> ShmResult<()> {
        if self.terminated {
            return Ok(());
        }
        if self.segment.is_mapped() {
            if let Err(e) = self.clear() {
                warn!("Failed to clear {} before unlink: {}", self.name(), e);
            }
        }
        self.segment.unlink()?;
        self.terminated = true;
        Ok(())
    }

    /// Best-effort liveness: the segment can still be opened by name.
    pub fn is_alive(&self) -> bool {
        !self.terminated && Self::exists(self.name()).unwrap_or(false)
    }
}
