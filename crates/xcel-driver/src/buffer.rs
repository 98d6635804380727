//! Device buffers
//!
//! A [`DeviceBuffer`] is a vector of one element type living in device-visible
//! memory. The host reads and writes it in place and the accelerator sees the same
//! bytes at [`DeviceBuffer::address`]. Nothing is copied on sync.
//!
//! The buffer records which side last wrote it ([`SyncState`]). It only tracks
//! this; it does not stop a caller from reading stale data.

use crate::dma::{DmaDomain, DmaMemory, SyncDirection};
use crate::error::{Result, XcelError};
use std::rc::Rc;
use xcel_chip::ElementType;

/// Rust scalar types that map onto an [`ElementType`].
pub trait Element: bytemuck::Pod + PartialEq + std::fmt::Debug {
    /// Matching element type.
    const TYPE: ElementType;

    /// Wrap a slice of this type.
    fn host_slice(values: &[Self]) -> HostSlice<'_>;
}

macro_rules! element {
    ($ty:ty, $variant:ident) => {
        impl Element for $ty {
            const TYPE: ElementType = ElementType::$variant;

            fn host_slice(values: &[Self]) -> HostSlice<'_> {
                HostSlice::$variant(values)
            }
        }
    };
}

element!(f32, F32);
element!(f64, F64);
element!(i32, I32);
element!(i64, I64);
element!(u32, U32);

/// Borrowed host vector with a runtime element type.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum HostSlice<'a> {
    /// `float32`
    F32(&'a [f32]),
    /// `float64`
    F64(&'a [f64]),
    /// `int32`
    I32(&'a [i32]),
    /// `int64`
    I64(&'a [i64]),
    /// `uint32`
    U32(&'a [u32]),
}

impl HostSlice<'_> {
    /// Runtime element type.
    pub const fn element_type(&self) -> ElementType {
        match self {
            Self::F32(_) => ElementType::F32,
            Self::F64(_) => ElementType::F64,
            Self::I32(_) => ElementType::I32,
            Self::I64(_) => ElementType::I64,
            Self::U32(_) => ElementType::U32,
        }
    }

    /// Element count.
    pub const fn len(&self) -> usize {
        match *self {
            Self::F32(v) => v.len(),
            Self::F64(v) => v.len(),
            Self::I32(v) => v.len(),
            Self::I64(v) => v.len(),
            Self::U32(v) => v.len(),
        }
    }

    /// `true` when there are no elements.
    pub const fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Raw little-endian bytes.
    pub fn as_bytes(&self) -> &[u8] {
        match *self {
            Self::F32(v) => bytemuck::cast_slice(v),
            Self::F64(v) => bytemuck::cast_slice(v),
            Self::I32(v) => bytemuck::cast_slice(v),
            Self::I64(v) => bytemuck::cast_slice(v),
            Self::U32(v) => bytemuck::cast_slice(v),
        }
    }
}

impl<'a, T: Element> From<&'a [T]> for HostSlice<'a> {
    fn from(values: &'a [T]) -> Self {
        T::host_slice(values)
    }
}

impl<'a, T: Element> From<&'a Vec<T>> for HostSlice<'a> {
    fn from(values: &'a Vec<T>) -> Self {
        T::host_slice(values)
    }
}

impl<'a, T: Element, const N: usize> From<&'a [T; N]> for HostSlice<'a> {
    fn from(values: &'a [T; N]) -> Self {
        T::host_slice(values)
    }
}

/// Which side last wrote a buffer without a following sync.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncState {
    /// Host and device views agree.
    Clean,
    /// Host wrote; needs `sync_to_device` before the accelerator reads.
    HostDirty,
    /// Accelerator wrote; needs `sync_from_device` before the host reads.
    DeviceDirty,
}

/// Vector in physically-contiguous, device-visible memory.
#[derive(Debug)]
pub struct DeviceBuffer {
    memory: DmaMemory,
    element_type: ElementType,
    len: usize,
    state: SyncState,
}

impl DeviceBuffer {
    /// Allocate `count` zeroed elements of `element_type` from `domain`.
    ///
    /// # Errors
    ///
    /// Returns [`XcelError::InvalidValue`] for `count == 0` and
    /// [`XcelError::Allocation`] when the domain cannot provide the memory.
    pub fn allocate(
        domain: &Rc<dyn DmaDomain>,
        count: usize,
        element_type: ElementType,
    ) -> Result<Self> {
        if count == 0 {
            return Err(XcelError::invalid_value("buffer element count must be > 0"));
        }
        let bytes = count
            .checked_mul(element_type.size_bytes())
            .ok_or_else(|| XcelError::allocation(usize::MAX, "size overflows usize"))?;
        let memory = DmaMemory::map(domain, bytes)?;
        tracing::debug!(
            "Allocated {count} x {element_type} at device {:#x}",
            memory.device_address()
        );
        Ok(Self {
            memory,
            element_type,
            len: count,
            state: SyncState::Clean,
        })
    }

    /// Element count.
    pub const fn len(&self) -> usize {
        self.len
    }

    /// Always `false`: buffers hold at least one element.
    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Element type.
    pub const fn element_type(&self) -> ElementType {
        self.element_type
    }

    /// Device-visible base address.
    pub const fn address(&self) -> u64 {
        self.memory.device_address()
    }

    /// Size in bytes.
    pub const fn size_bytes(&self) -> usize {
        self.memory.len()
    }

    /// Dirty-direction flag.
    pub const fn sync_state(&self) -> SyncState {
        self.state
    }

    fn check_type<T: Element>(&self) -> Result<()> {
        if T::TYPE == self.element_type {
            Ok(())
        } else {
            Err(XcelError::Type {
                expected: self.element_type,
                actual: T::TYPE,
            })
        }
    }

    fn element_range(&self, index: usize) -> Result<std::ops::Range<usize>> {
        if index >= self.len {
            return Err(XcelError::Index {
                index,
                len: self.len,
            });
        }
        let size = self.element_type.size_bytes();
        Ok(index * size..(index + 1) * size)
    }

    /// Read one element.
    ///
    /// # Errors
    ///
    /// Returns [`XcelError::Index`] if `index >= len` and [`XcelError::Type`] if `T`
    /// does not match the buffer's element type.
    pub fn read<T: Element>(&self, index: usize) -> Result<T> {
        self.check_type::<T>()?;
        let range = self.element_range(index)?;
        Ok(bytemuck::pod_read_unaligned(&self.memory.as_bytes()[range]))
    }

    /// Write one element.
    ///
    /// # Errors
    ///
    /// Returns [`XcelError::Index`] if `index >= len` and [`XcelError::Type`] if `T`
    /// does not match the buffer's element type.
    pub fn write<T: Element>(&mut self, index: usize, value: T) -> Result<()> {
        self.check_type::<T>()?;
        let range = self.element_range(index)?;
        self.memory.as_bytes_mut()[range].copy_from_slice(bytemuck::bytes_of(&value));
        self.state = SyncState::HostDirty;
        Ok(())
    }

    /// Overwrite the whole buffer from a host vector of the same type and length.
    ///
    /// # Errors
    ///
    /// Returns [`XcelError::Type`] or [`XcelError::Shape`] on mismatch.
    pub fn copy_from(&mut self, source: HostSlice<'_>) -> Result<()> {
        if source.element_type() != self.element_type {
            return Err(XcelError::Type {
                expected: self.element_type,
                actual: source.element_type(),
            });
        }
        if source.len() != self.len {
            return Err(XcelError::shape(format!(
                "source has {} elements, buffer has {}",
                source.len(),
                self.len
            )));
        }
        self.memory.as_bytes_mut().copy_from_slice(source.as_bytes());
        self.state = SyncState::HostDirty;
        Ok(())
    }

    /// Typed view of the contents.
    ///
    /// # Errors
    ///
    /// Returns [`XcelError::Type`] if `T` does not match the element type.
    pub fn as_slice<T: Element>(&self) -> Result<&[T]> {
        self.check_type::<T>()?;
        bytemuck::try_cast_slice(self.memory.as_bytes())
            .map_err(|e| XcelError::hardware(format!("misaligned DMA view: {e:?}")))
    }

    /// Mutable typed view of the contents. Marks the buffer host-dirty.
    ///
    /// # Errors
    ///
    /// Returns [`XcelError::Type`] if `T` does not match the element type.
    pub fn as_mut_slice<T: Element>(&mut self) -> Result<&mut [T]> {
        self.check_type::<T>()?;
        self.state = SyncState::HostDirty;
        bytemuck::try_cast_slice_mut(self.memory.as_bytes_mut())
            .map_err(|e| XcelError::hardware(format!("misaligned DMA view: {e:?}")))
    }

    /// Copy the contents out.
    ///
    /// # Errors
    ///
    /// Returns [`XcelError::Type`] if `T` does not match the element type.
    pub fn to_vec<T: Element>(&self) -> Result<Vec<T>> {
        self.as_slice::<T>().map(<[T]>::to_vec)
    }

    /// Publish host writes to the accelerator.
    ///
    /// # Errors
    ///
    /// Propagates platform cache maintenance failures.
    pub fn sync_to_device(&mut self) -> Result<()> {
        self.memory.sync(SyncDirection::ToDevice)?;
        self.state = SyncState::Clean;
        Ok(())
    }

    /// Make accelerator writes visible to the host.
    ///
    /// # Errors
    ///
    /// Propagates platform cache maintenance failures.
    pub fn sync_from_device(&mut self) -> Result<()> {
        self.memory.sync(SyncDirection::FromDevice)?;
        self.state = SyncState::Clean;
        Ok(())
    }

    /// Record that the accelerator has written this buffer.
    pub(crate) fn mark_device_written(&mut self) {
        self.state = SyncState::DeviceDirty;
    }
}
