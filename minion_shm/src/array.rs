//! Raw shared array buffer.
//!
//! Fixed-shape, fixed-dtype numeric arrays copied in and out of shared memory
//! without any encoding, for high-rate overwrite-in-place data such as camera
//! frames. The first 512 bytes hold the segment header and a JSON
//! [`ArrayDescriptor`]; the raw little-endian elements follow.

use crate::error::{ShmError, ShmResult};
use crate::lock::{Access, SegmentLock};
use crate::platform::probe_segment;
use crate::segment::SharedMemorySegment;
use bytemuck::Pod;
use minion_common::config::LockSettings;
use minion_common::consts::{ARRAY_HEADER_SIZE, ARRAY_IDENTITY, ARRAY_MAX_SIZE};
use ndarray::{ArrayBase, ArrayD, Data, Dimension, IxDyn};
use serde::{Deserialize, Serialize};
use tracing::warn;

/// Element type of a shared array.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DType {
    /// `u8`
    U8,
    /// `u16`
    U16,
    /// `u32`
    U32,
    /// `u64`
    U64,
    /// `i8`
    I8,
    /// `i16`
    I16,
    /// `i32`
    I32,
    /// `i64`
    I64,
    /// `f32`
    F32,
    /// `f64`
    F64,
}

impl DType {
    /// Size of one element in bytes.
    pub const fn itemsize(self) -> usize {
        match self {
            Self::U8 | Self::I8 => 1,
            Self::U16 | Self::I16 => 2,
            Self::U32 | Self::I32 | Self::F32 => 4,
            Self::U64 | Self::I64 | Self::F64 => 8,
        }
    }
}

/// Rust types storable in a shared array.
pub trait Element: Pod {
    /// Matching dtype tag.
    const DTYPE: DType;
}

macro_rules! impl_element {
    ($($ty:ty => $dtype:ident),* $(,)?) => {
        $(impl Element for $ty {
            const DTYPE: DType = DType::$dtype;
        })*
    };
}

impl_element!(
    u8 => U8, u16 => U16, u32 => U32, u64 => U64,
    i8 => I8, i16 => I16, i32 => I32, i64 => I64,
    f32 => F32, f64 => F64,
);

/// Shape and dtype, fixed at creation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArrayDescriptor {
    /// Array shape (row-major).
    pub shape: Vec<usize>,
    /// Element type.
    pub dtype: DType,
}

impl ArrayDescriptor {
    /// Number of elements.
    pub fn len(&self) -> usize {
        self.shape.iter().product()
    }

    /// Whether the array has no elements.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Payload size in bytes, `None` on overflow.
    pub fn byte_size(&self) -> Option<usize> {
        self.shape
            .iter()
            .try_fold(self.dtype.itemsize(), |acc, &dim| acc.checked_mul(dim))
    }
}

/// Named shared memory segment holding a raw numeric array.
pub struct SharedArrayBuffer {
    segment: SharedMemorySegment,
    lock: SegmentLock,
    descriptor: ArrayDescriptor,
    terminated: bool,
}

impl SharedArrayBuffer {
    /// Allocate an array buffer of the given shape and dtype.
    pub fn create(
        name: &str,
        shape: &[usize],
        dtype: DType,
        settings: LockSettings,
    ) -> ShmResult<Self> {
        let descriptor = ArrayDescriptor {
            shape: shape.to_vec(),
            dtype,
        };
        let size = descriptor.byte_size().unwrap_or(usize::MAX);
        if size == 0 || size > ARRAY_MAX_SIZE {
            return Err(ShmError::Allocation {
                name: name.to_string(),
                requested: size,
                limit: ARRAY_MAX_SIZE,
            });
        }

        let encoded = serde_json::to_vec(&descriptor)?;
        let mut segment = SharedMemorySegment::create(name, ARRAY_IDENTITY, ARRAY_HEADER_SIZE, size)?;
        let extension = segment.extension_mut()?;
        if encoded.len() >= extension.len() {
            let limit = extension.len();
            segment.unlink()?;
            return Err(ShmError::Allocation {
                name: name.to_string(),
                requested: encoded.len(),
                limit,
            });
        }
        extension[..encoded.len()].copy_from_slice(&encoded);

        let lock = SegmentLock::open(name, settings)?;
        Ok(Self {
            segment,
            lock,
            descriptor,
            terminated: false,
        })
    }

    /// Allocate an array buffer for element type `T`.
    pub fn create_for<T: Element>(
        name: &str,
        shape: &[usize],
        settings: LockSettings,
    ) -> ShmResult<Self> {
        Self::create(name, shape, T::DTYPE, settings)
    }

    /// Attach to an existing array buffer and read its descriptor.
    pub fn open(name: &str, settings: LockSettings) -> ShmResult<Self> {
        let segment = SharedMemorySegment::attach(name, ARRAY_IDENTITY, ARRAY_HEADER_SIZE)?;
        let extension = segment.extension()?;
        let end = extension
            .iter()
            .position(|&b| b == 0)
            .unwrap_or(extension.len());
        let descriptor: ArrayDescriptor =
            serde_json::from_slice(&extension[..end]).map_err(|e| ShmError::TypeMismatch {
                name: name.to_string(),
                expected: "array descriptor".to_string(),
                found: e.to_string(),
            })?;

        if descriptor.byte_size() != Some(segment.data_size()) {
            return Err(ShmError::TypeMismatch {
                name: name.to_string(),
                expected: format!("{:?}", descriptor),
                found: format!("{} payload bytes", segment.data_size()),
            });
        }

        let lock = SegmentLock::open(name, settings)?;
        Ok(Self {
            segment,
            lock,
            descriptor,
            terminated: false,
        })
    }

    /// Segment name.
    pub fn name(&self) -> &str {
        self.segment.name()
    }

    /// Shape fixed at creation.
    pub fn shape(&self) -> &[usize] {
        &self.descriptor.shape
    }

    /// Dtype fixed at creation.
    pub fn dtype(&self) -> DType {
        self.descriptor.dtype
    }

    /// Shape and dtype.
    pub fn descriptor(&self) -> &ArrayDescriptor {
        &self.descriptor
    }

    /// Copy `array` into the segment. Its shape must match exactly.
    pub fn write<T, S, D>(&mut self, array: &ArrayBase<S, D>) -> ShmResult<()>
    where
        T: Element,
        S: Data<Elem = T>,
        D: Dimension,
    {
        if array.shape() != self.descriptor.shape.as_slice() {
            return Err(ShmError::ShapeMismatch {
                expected: self.descriptor.shape.clone(),
                found: array.shape().to_vec(),
            });
        }
        let standard = array.as_standard_layout();
        match standard.as_slice() {
            Some(values) => self.write_slice(values),
            None => Err(ShmError::ShapeMismatch {
                expected: self.descriptor.shape.clone(),
                found: array.shape().to_vec(),
            }),
        }
    }

    /// Copy a flat row-major slice into the segment.
    pub fn write_slice<T: Element>(&mut self, values: &[T]) -> ShmResult<()> {
        self.check_dtype::<T>()?;
        if values.len() != self.descriptor.len() {
            return Err(ShmError::ShapeMismatch {
                expected: self.descriptor.shape.clone(),
                found: vec![values.len()],
            });
        }

        let bytes: &[u8] = bytemuck::cast_slice(values);
        let (header, data) = self.segment.split_mut()?;
        let _guard = self.lock.acquire(&header.lock, Access::Write)?;
        data.copy_from_slice(bytes);
        Ok(())
    }

    /// Copy the current contents out.
    pub fn read<T: Element>(&self) -> ShmResult<ArrayD<T>> {
        let values = self.read_vec::<T>()?;
        ArrayD::from_shape_vec(IxDyn(&self.descriptor.shape), values).map_err(|_| {
            ShmError::ShapeMismatch {
                expected: self.descriptor.shape.clone(),
                found: vec![self.descriptor.len()],
            }
        })
    }

    /// Copy the current contents out as a flat row-major vector.
    pub fn read_vec<T: Element>(&self) -> ShmResult<Vec<T>> {
        self.check_dtype::<T>()?;
        let (header, data) = self.segment.split()?;
        let _guard = self.lock.acquire(&header.lock, Access::Read)?;
        Ok(bytemuck::pod_collect_to_vec(data))
    }

    fn check_dtype<T: Element>(&self) -> ShmResult<()> {
        if T::DTYPE != self.descriptor.dtype {
            return Err(ShmError::TypeMismatch {
                name: self.name().to_string(),
                expected: format!("{:?}", self.descriptor.dtype),
                found: format!("{:?}", T::DTYPE),
            });
        }
        Ok(())
    }

    /// Detach without destroying the segment.
    pub fn close(&mut self) {
        self.segment.close();
    }

    /// Zero the elements, then unlink the segment. Calling it again is a
    /// no-op.
    pub fn terminate(&mut self) -> ShmResult<()> {
        if self.terminated {
            return Ok(());
        }
        if self.segment.is_mapped() {
            if let Err(e) = self.zero() {
                warn!("Failed to clear {} before unlink: {}", self.name(), e);
            }
        }
        self.segment.unlink()?;
        self.terminated = true;
        Ok(())
    }

    fn zero(&mut self) -> ShmResult<()> {
        let (header, data) = self.segment.split_mut()?;
        let _guard = self.lock.acquire(&header.lock, Access::Write)?;
        data.fill(0);
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
