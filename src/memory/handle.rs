//! Handle to one contiguous physical allocation.

use super::device::{DeviceMapping, MemoryDevice, RawRegion};
use super::{CachePolicy, MemoryTarget};
use crate::error::Result;
use std::ptr::NonNull;
use std::sync::{Arc, Mutex, PoisonError};

/// How a handle came to reference its memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Origin {
    /// Allocated by this handle; freed on release.
    Allocated,
    /// Attached to memory owned elsewhere; detached on release.
    Attached,
}

/// Opaque handle wrapping one contiguous physical allocation.
///
/// The region is mapped lazily on the first [`map`](Self::map) call and the
/// address stays fixed until the handle is dropped, which unmaps and then
/// frees (or detaches) the region.
pub struct PhysicalMemoryHandle {
    device: Arc<dyn MemoryDevice>,
    region: RawRegion,
    origin: Origin,
    mapping: Mutex<Option<DeviceMapping>>,
}

impl PhysicalMemoryHandle {
    /// Allocate a new region.
    pub fn allocate(
        device: Arc<dyn MemoryDevice>,
        target: MemoryTarget,
        cache: CachePolicy,
        size: usize,
    ) -> Result<Self> {
        let region = device.alloc(target, cache, size)?;
        Ok(Self::from_region(device, region, Origin::Allocated))
    }

    /// Attach to a live region by id (its physical address).
    ///
    /// The returned handle does not own the memory but still must be
    /// released, which happens on drop.
    pub fn attach(device: Arc<dyn MemoryDevice>, id: u64) -> Result<Self> {
        let region = device.attach(id)?;
        Ok(Self::from_region(device, region, Origin::Attached))
    }

    /// Wrap a region the device already handed out.
    pub(crate) fn from_region(
        device: Arc<dyn MemoryDevice>,
        region: RawRegion,
        origin: Origin,
    ) -> Self {
        Self {
            device,
            region,
            origin,
            mapping: Mutex::new(None),
        }
    }

    /// Map the region, or return the existing mapping.
    pub fn map(&self) -> Result<NonNull<u8>> {
        let mut mapping = self.lock();
        if let Some(m) = mapping.as_ref() {
            return Ok(m.addr());
        }
        let m = self.device.map(&self.region)?;
        let addr = m.addr();
        *mapping = Some(m);
        Ok(addr)
    }

    /// Virtual address, if mapped.
    pub fn vaddr(&self) -> Option<NonNull<u8>> {
        self.lock().as_ref().map(DeviceMapping::addr)
    }

    /// Whether the region is mapped into this process.
    pub fn is_mapped(&self) -> bool {
        self.lock().is_some()
    }

    /// Invalidate CPU caches over the mapping. No-op while unmapped.
    pub fn invalidate(&self) -> Result<()> {
        match self.lock().as_ref() {
            Some(m) => self.device.invalidate(&self.region, m),
            None => Ok(()),
        }
    }

    /// Flush CPU caches over the mapping. No-op while unmapped.
    pub fn flush(&self) -> Result<()> {
        match self.lock().as_ref() {
            Some(m) => self.device.flush(&self.region, m),
            None => Ok(()),
        }
    }

    /// Physical address of the first byte.
    #[inline]
    pub fn phys_addr(&self) -> u64 {
        self.region.phys_addr
    }

    /// Buffer id other domains use to attach. Same as the physical address.
    #[inline]
    pub fn id(&self) -> u64 {
        self.region.phys_addr
    }

    /// Size in bytes.
    #[inline]
    pub fn size(&self) -> usize {
        self.region.size
    }

    /// Memory target.
    #[inline]
    pub fn target(&self) -> MemoryTarget {
        self.region.target
    }

    /// Cache policy.
    #[inline]
    pub fn cache_policy(&self) -> CachePolicy {
        self.region.cache
    }

    /// Whether this handle only references memory owned elsewhere.
    #[inline]
    pub fn is_attached(&self) -> bool {
        self.origin == Origin::Attached
    }

    /// The device backing this handle.
    pub fn device(&self) -> &Arc<dyn MemoryDevice> {
        &self.device
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Option<DeviceMapping>> {
        self.mapping.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for PhysicalMemoryHandle {
    fn drop(&mut self) {
        let mapping = self
            .mapping
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(mapping) = mapping
            && let Err(e) = self.device.unmap(&self.region, mapping)
        {
            tracing::warn!(phys = self.region.phys_addr, error = %e, "unmap failed");
        }

        let released = match self.origin {
            Origin::Allocated => self.device.free(&self.region),
            Origin::Attached => self.device.detach(&self.region),
        };
        if let Err(e) = released {
            tracing::warn!(
                phys = self.region.phys_addr,
                origin = ?self.origin,
                error = %e,
                "release of physical memory failed"
            );
        }
    }
}

impl std::fmt::Debug for PhysicalMemoryHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PhysicalMemoryHandle")
            .field("phys_addr", &format_args!("{:#x}", self.region.phys_addr))
            .field("size", &self.region.size)
            .field("target", &self.region.target)
            .field("cache", &self.region.cache)
            .field("origin", &self.origin)
            .field("mapped", &self.is_mapped())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::SimDevice;

    #[test]
    fn test_map_is_stable() {
        let device = SimDevice::new();
        let handle =
            PhysicalMemoryHandle::allocate(device.clone(), MemoryTarget::Dms1, CachePolicy::Default, 512)
                .unwrap();

        assert!(handle.vaddr().is_none());
        let first = handle.map().unwrap();
        let second = handle.map().unwrap();
        assert_eq!(first, second);
        assert_eq!(handle.vaddr(), Some(first));
        assert_eq!(device.stats().maps, 1);
    }

    #[test]
    fn test_drop_unmaps_then_frees() {
        let device = SimDevice::new();
        {
            let handle = PhysicalMemoryHandle::allocate(
                device.clone(),
                MemoryTarget::Generic,
                CachePolicy::Default,
                64,
            )
            .unwrap();
            handle.map().unwrap();
        }
        let stats = device.stats();
        assert_eq!(stats.unmaps, 1);
        assert_eq!(stats.frees, 1);
        assert_eq!(stats.live_regions, 0);
    }

    #[test]
    fn test_attach_is_non_owning() {
        let device = SimDevice::new();
        let owner = PhysicalMemoryHandle::allocate(
            device.clone(),
            MemoryTarget::Ev74,
            CachePolicy::Cached,
            256,
        )
        .unwrap();

        let attached = PhysicalMemoryHandle::attach(device.clone(), owner.id()).unwrap();
        assert!(attached.is_attached());
        assert_eq!(attached.phys_addr(), owner.phys_addr());
        assert_eq!(attached.target(), MemoryTarget::Ev74);
        assert_eq!(attached.cache_policy(), CachePolicy::Cached);

        drop(attached);
        let stats = device.stats();
        assert_eq!(stats.detaches, 1);
        assert_eq!(stats.frees, 0);
        assert_eq!(stats.live_regions, 1);
    }

    #[test]
    fn test_cache_ops_need_mapping() {
        let device = SimDevice::new();
        let handle = PhysicalMemoryHandle::allocate(
            device.clone(),
            MemoryTarget::Generic,
            CachePolicy::Cached,
            64,
        )
        .unwrap();

        handle.flush().unwrap();
        assert_eq!(device.stats().flushes, 0);

        handle.map().unwrap();
        handle.flush().unwrap();
        handle.invalidate().unwrap();
        let stats = device.stats();
        assert_eq!(stats.flushes, 1);
        assert_eq!(stats.invalidates, 1);
    }
}
