//! Device-visible memory
//!
//! A [`DmaDomain`] hands out [`DmaMapping`]s: host virtual memory that is also
//! addressable by the accelerator at a stable device (physical / bus) address.
//! There is exactly one copy of the data. "Sync" is a cache maintenance
//! operation on that copy, never a transfer.
//!
//! ```text
//!   host CPU ──▶ vaddr ─┐
//!                       ├──▶ same physical pages ◀── device address ◀── accelerator m_axi
//!   (cache)  ◀── sync ──┘
//! ```

use crate::error::{Result, XcelError};
use std::alloc::Layout;
use std::ptr::NonNull;
use std::rc::Rc;

/// Page size used for DMA alignment and rounding.
pub const PAGE_SIZE: usize = 4096;

/// Direction of a cache maintenance operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncDirection {
    /// Host wrote; make it visible to the device (clean / flush).
    ToDevice,
    /// Device wrote; make it visible to the host (invalidate).
    FromDevice,
}

/// A region of device-visible memory, as reported by the domain that mapped it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DmaMapping {
    /// Host virtual address.
    pub host: NonNull<u8>,
    /// Address the accelerator uses for the same bytes.
    pub device_address: u64,
    /// Mapped size in bytes (page-rounded).
    pub size: usize,
}

/// Platform allocator of physically-contiguous, device-visible memory.
///
/// Implementations use interior mutability; a domain is shared by every buffer
/// it mapped through an `Rc` and is not thread-safe.
pub trait DmaDomain: std::fmt::Debug {
    /// Map at least `bytes` bytes, zero-filled.
    ///
    /// # Errors
    ///
    /// Returns [`XcelError::Allocation`] if no contiguous region is available.
    fn map(&self, bytes: usize) -> Result<DmaMapping>;

    /// Release a mapping previously returned by [`DmaDomain::map`].
    fn unmap(&self, mapping: &DmaMapping);

    /// Cache maintenance on `len` bytes at `offset` within `mapping`.
    ///
    /// # Errors
    ///
    /// Returns an error if the platform sync interface fails.
    fn sync(
        &self,
        mapping: &DmaMapping,
        offset: usize,
        len: usize,
        direction: SyncDirection,
    ) -> Result<()>;

    /// Short identifier for logs.
    fn name(&self) -> &str;
}

/// Owned device-visible memory. Unmapped on drop.
#[derive(Debug)]
pub struct DmaMemory {
    mapping: DmaMapping,
    len: usize,
    domain: Rc<dyn DmaDomain>,
}

impl DmaMemory {
    /// Map `len` bytes from `domain`.
    ///
    /// # Errors
    ///
    /// Returns [`XcelError::Allocation`] for zero-sized requests or when the
    /// domain cannot satisfy the request.
    pub fn map(domain: &Rc<dyn DmaDomain>, len: usize) -> Result<Self> {
        if len == 0 {
            return Err(XcelError::allocation(0, "zero-sized DMA mapping"));
        }
        let mapping = domain.map(len)?;
        if mapping.size < len {
            domain.unmap(&mapping);
            return Err(XcelError::allocation(
                len,
                format!("{} returned only {} bytes", domain.name(), mapping.size),
            ));
        }
        tracing::debug!(
            "DMA map via {}: {len} bytes at {:p} (device {:#x})",
            domain.name(),
            mapping.host,
            mapping.device_address
        );
        Ok(Self {
            mapping,
            len,
            domain: Rc::clone(domain),
        })
    }

    /// Requested length in bytes.
    pub const fn len(&self) -> usize {
        self.len
    }

    /// `true` if the mapping holds no bytes (never, after a successful map).
    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Device-visible base address.
    pub const fn device_address(&self) -> u64 {
        self.mapping.device_address
    }

    /// Host base pointer.
    pub const fn host_ptr(&self) -> NonNull<u8> {
        self.mapping.host
    }

    /// Bytes as seen by the host.
    pub const fn as_bytes(&self) -> &[u8] {
        // SAFETY: (1) host pointer from DmaDomain::map, valid for mapping.size >= len
        // bytes until unmap in Drop; (2) &self excludes concurrent host mutation;
        // (3) u8 has alignment 1.
        unsafe { std::slice::from_raw_parts(self.mapping.host.as_ptr(), self.len) }
    }

    /// Mutable bytes as seen by the host.
    pub fn as_bytes_mut(&mut self) -> &mut [u8] {
        // SAFETY: (1) host pointer valid for len bytes until Drop; (2) &mut self gives
        // exclusive host access; (3) u8 has alignment 1.
        unsafe { std::slice::from_raw_parts_mut(self.mapping.host.as_ptr(), self.len) }
    }

    /// Cache maintenance over the whole requested length.
    ///
    /// # Errors
    ///
    /// Propagates platform sync failures.
    pub fn sync(&self, direction: SyncDirection) -> Result<()> {
        self.domain.sync(&self.mapping, 0, self.len, direction)
    }
}

impl Drop for DmaMemory {
    fn drop(&mut self) {
        self.domain.unmap(&self.mapping);
        tracing::debug!(
            "DMA unmap via {}: device {:#x}",
            self.domain.name(),
            self.mapping.device_address
        );
    }
}

/// Page-aligned, zero-filled heap allocation with a stable address.
#[derive(Debug)]
pub(crate) struct PinnedAlloc {
    ptr: NonNull<u8>,
    layout: Layout,
}

impl PinnedAlloc {
    /// Allocate `size` bytes rounded up to whole pages.
    pub(crate) fn new(size: usize) -> Result<Self> {
        let size = page_round(size);
        let layout = Layout::from_size_align(size, PAGE_SIZE)
            .map_err(|e| XcelError::allocation(size, format!("invalid layout: {e}")))?;

        // SAFETY: layout has non-zero size (page_round never returns 0) and a power-of-two
        // alignment; the pointer is released in Drop with the same layout.
        let raw = unsafe { std::alloc::alloc_zeroed(layout) };
        let ptr = NonNull::new(raw)
            .ok_or_else(|| XcelError::allocation(size, "host allocator out of memory"))?;
        Ok(Self { ptr, layout })
    }

    pub(crate) const fn ptr(&self) -> NonNull<u8> {
        self.ptr
    }

    pub(crate) const fn size(&self) -> usize {
        self.layout.size()
    }
}

impl Drop for PinnedAlloc {
    fn drop(&mut self) {
        // SAFETY: ptr came from alloc_zeroed with self.layout and is freed exactly once.
        unsafe { std::alloc::dealloc(self.ptr.as_ptr(), self.layout) };
    }
}

/// Round up to a whole number of pages (minimum one page).
pub const fn page_round(bytes: usize) -> usize {
    if bytes == 0 {
        PAGE_SIZE
    } else {
        bytes.div_ceil(PAGE_SIZE) * PAGE_SIZE
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn page_rounding() {
        assert_eq!(page_round(0), PAGE_SIZE);
        assert_eq!(page_round(1), PAGE_SIZE);
        assert_eq!(page_round(PAGE_SIZE), PAGE_SIZE);
        assert_eq!(page_round(PAGE_SIZE + 1), 2 * PAGE_SIZE);
    }

    #[test]
    fn pinned_alloc_is_page_aligned_and_zeroed() {
        let alloc = PinnedAlloc::new(100).unwrap();
        assert_eq!(alloc.size(), PAGE_SIZE);
        assert_eq!(alloc.ptr().as_ptr() as usize % PAGE_SIZE, 0);
        // SAFETY: allocation is PAGE_SIZE bytes and live for this scope.
        let bytes = unsafe { std::slice::from_raw_parts(alloc.ptr().as_ptr(), alloc.size()) };
        assert!(bytes.iter().all(|&b| b == 0));
    }
}
