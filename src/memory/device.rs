//! The physical-memory device boundary.

use super::{CachePolicy, MemoryTarget};
use crate::error::Result;
use std::ptr::NonNull;

/// One contiguous physical allocation as the device describes it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RawRegion {
    /// Physical start address. Doubles as the buffer id other domains use.
    pub phys_addr: u64,
    /// Size in bytes.
    pub size: usize,
    /// Region the memory lives in.
    pub target: MemoryTarget,
    /// Cache policy the memory was allocated with.
    pub cache: CachePolicy,
}

/// A process-local mapping of a [`RawRegion`].
///
/// The mapping covers whole pages; the region starts `offset` bytes into it.
pub struct DeviceMapping {
    base: NonNull<u8>,
    len: usize,
    offset: usize,
}

// SAFETY: The mapping is plain shared memory. It owns no thread-affine state
// and access is synchronized by the owning handle.
unsafe impl Send for DeviceMapping {}
unsafe impl Sync for DeviceMapping {}

impl DeviceMapping {
    /// Wrap a mapping created by a device.
    ///
    /// # Safety
    ///
    /// `base..base + len` must be a live mapping that stays valid until it is
    /// handed back to [`MemoryDevice::unmap`], and `offset` must be within it.
    pub unsafe fn new(base: NonNull<u8>, len: usize, offset: usize) -> Self {
        debug_assert!(offset < len);
        Self { base, len, offset }
    }

    /// Start of the mapped pages.
    #[inline]
    pub fn base(&self) -> NonNull<u8> {
        self.base
    }

    /// Length of the mapped pages.
    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    /// Always false; mappings are never empty.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Virtual address of the region's first byte.
    #[inline]
    pub fn addr(&self) -> NonNull<u8> {
        // SAFETY: offset < len, checked at construction.
        unsafe { self.base.add(self.offset) }
    }
}

impl std::fmt::Debug for DeviceMapping {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceMapping")
            .field("addr", &self.addr())
            .field("len", &self.len)
            .finish()
    }
}

/// Driver interface to the accelerator's physical memory.
///
/// Implementations hand out physical regions per [`MemoryTarget`], let other
/// components attach to live regions by physical address, and perform CPU
/// cache maintenance on mapped regions.
pub trait MemoryDevice: Send + Sync {
    /// Allocate physically contiguous regions, one per size, in order.
    ///
    /// Region `i + 1` must start exactly where region `i` ends.
    fn alloc_contiguous(
        &self,
        target: MemoryTarget,
        cache: CachePolicy,
        sizes: &[usize],
    ) -> Result<Vec<RawRegion>>;

    /// Allocate a single region.
    fn alloc(&self, target: MemoryTarget, cache: CachePolicy, size: usize) -> Result<RawRegion> {
        let mut regions = self.alloc_contiguous(target, cache, &[size])?;
        regions.pop().ok_or_else(|| crate::Error::AllocationFailed {
            target,
            size,
            reason: "device returned no region".into(),
        })
    }

    /// Obtain a non-owning reference to a live region by its physical address.
    fn attach(&self, phys_addr: u64) -> Result<RawRegion>;

    /// Map a region into this process.
    fn map(&self, region: &RawRegion) -> Result<DeviceMapping>;

    /// Remove a mapping returned by [`map`](Self::map).
    fn unmap(&self, region: &RawRegion, mapping: DeviceMapping) -> Result<()>;

    /// Discard CPU cache lines so reads see memory written by other domains.
    fn invalidate(&self, region: &RawRegion, mapping: &DeviceMapping) -> Result<()>;

    /// Write back CPU cache lines so other domains see CPU writes.
    fn flush(&self, region: &RawRegion, mapping: &DeviceMapping) -> Result<()>;

    /// Release an owned region.
    fn free(&self, region: &RawRegion) -> Result<()>;

    /// Release an attached region.
    fn detach(&self, region: &RawRegion) -> Result<()>;
}
