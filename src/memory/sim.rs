//! memfd-backed reference device.
//!
//! [`SimDevice`] stands in for the accelerator's memory driver when running
//! standalone or under test. Every target gets its own physical address
//! window; each allocation is backed by an anonymous memfd so attached
//! mappings see the same pages as the owner's mapping.
//!
//! # Memory Model
//!
//! - One memfd per allocation call, with contiguous runs carved at
//!   consecutive file offsets
//! - Physical addresses are page aligned at the start of every allocation
//! - Mapped with `MAP_SHARED`; flush and invalidate are `msync`
//! - Freed regions stay resolvable until their last attachment detaches

use super::device::{DeviceMapping, MemoryDevice, RawRegion};
use super::{CachePolicy, MemoryTarget, defaults};
use crate::error::{Error, Result};
use rustix::fd::OwnedFd;
use rustix::mm::{MapFlags, MsyncFlags, ProtFlags};
use std::collections::HashMap;
use std::ffi::CString;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

/// Spacing between the physical windows of two targets.
const WINDOW_STRIDE: u64 = 1 << 36;

/// First physical address of the first window.
const WINDOW_BASE: u64 = 0x1_0000_0000;

/// Snapshot of device activity counters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SimDeviceStats {
    /// Successful allocation calls.
    pub allocs: u64,
    /// Owned regions freed.
    pub frees: u64,
    /// Successful attaches.
    pub attaches: u64,
    /// Attached regions released.
    pub detaches: u64,
    /// Mappings created.
    pub maps: u64,
    /// Mappings removed.
    pub unmaps: u64,
    /// Cache invalidations.
    pub invalidates: u64,
    /// Cache flushes.
    pub flushes: u64,
    /// Regions still resolvable by physical address.
    pub live_regions: usize,
}

#[derive(Default)]
struct Counters {
    allocs: AtomicU64,
    frees: AtomicU64,
    attaches: AtomicU64,
    detaches: AtomicU64,
    maps: AtomicU64,
    unmaps: AtomicU64,
    invalidates: AtomicU64,
    flushes: AtomicU64,
}

struct SimRegion {
    fd: Arc<OwnedFd>,
    fd_offset: u64,
    size: usize,
    target: MemoryTarget,
    cache: CachePolicy,
    attachments: usize,
    freed: bool,
}

struct Window {
    next_phys: u64,
    capacity: usize,
    used: usize,
}

struct SimState {
    regions: HashMap<u64, SimRegion>,
    windows: [Window; MemoryTarget::ALL.len()],
}

/// Simulated accelerator memory.
///
/// # Example
///
/// ```rust,ignore
/// let device = SimDevice::builder()
///     .capacity(MemoryTarget::Ocm, 64 * 1024)
///     .build();
/// let region = device.alloc(MemoryTarget::Ocm, CachePolicy::Default, 4096)?;
/// ```
pub struct SimDevice {
    state: Mutex<SimState>,
    counters: Counters,
    page_size: usize,
}

/// Builder for [`SimDevice`] window capacities.
#[derive(Debug, Clone)]
pub struct SimDeviceBuilder {
    capacities: [usize; MemoryTarget::ALL.len()],
}

impl SimDeviceBuilder {
    /// Set the byte capacity of one target's window.
    pub fn capacity(mut self, target: MemoryTarget, bytes: usize) -> Self {
        self.capacities[target.index()] = bytes;
        self
    }

    /// Create the device.
    pub fn build(self) -> Arc<SimDevice> {
        let windows = std::array::from_fn(|i| Window {
            next_phys: WINDOW_BASE + WINDOW_STRIDE * i as u64,
            capacity: self.capacities[i],
            used: 0,
        });
        Arc::new(SimDevice {
            state: Mutex::new(SimState {
                regions: HashMap::new(),
                windows,
            }),
            counters: Counters::default(),
            page_size: rustix::param::page_size(),
        })
    }
}

impl Default for SimDeviceBuilder {
    fn default() -> Self {
        let mut capacities = [defaults::SIM_DMS_CAPACITY; MemoryTarget::ALL.len()];
        capacities[MemoryTarget::Generic.index()] = defaults::SIM_GENERIC_CAPACITY;
        capacities[MemoryTarget::Ocm.index()] = defaults::SIM_OCM_CAPACITY;
        capacities[MemoryTarget::Ev74.index()] = defaults::SIM_EV74_CAPACITY;
        Self { capacities }
    }
}

impl SimDevice {
    /// Create a device with default window capacities.
    pub fn new() -> Arc<Self> {
        Self::builder().build()
    }

    /// Start configuring a device.
    pub fn builder() -> SimDeviceBuilder {
        SimDeviceBuilder::default()
    }

    /// Activity counters.
    pub fn stats(&self) -> SimDeviceStats {
        let c = &self.counters;
        SimDeviceStats {
            allocs: c.allocs.load(Ordering::Relaxed),
            frees: c.frees.load(Ordering::Relaxed),
            attaches: c.attaches.load(Ordering::Relaxed),
            detaches: c.detaches.load(Ordering::Relaxed),
            maps: c.maps.load(Ordering::Relaxed),
            unmaps: c.unmaps.load(Ordering::Relaxed),
            invalidates: c.invalidates.load(Ordering::Relaxed),
            flushes: c.flushes.load(Ordering::Relaxed),
            live_regions: self.lock().regions.len(),
        }
    }

    /// Bytes currently allocated in a target's window.
    pub fn used(&self, target: MemoryTarget) -> usize {
        self.lock().windows[target.index()].used
    }

    /// Start address of the live region containing `phys_addr`.
    ///
    /// Lets simulated firmware reach tensors inside a segment.
    pub fn containing_region(&self, phys_addr: u64) -> Option<u64> {
        self.lock()
            .regions
            .iter()
            .find(|(start, r)| {
                !r.freed && phys_addr >= **start && phys_addr < **start + r.size as u64
            })
            .map(|(start, _)| *start)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, SimState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn align_up(&self, value: u64) -> u64 {
        let page = self.page_size as u64;
        value.div_ceil(page) * page
    }

    fn release(&self, phys_addr: u64, owner: bool) -> Result<()> {
        let mut state = self.lock();
        let region = state.regions.get_mut(&phys_addr).ok_or_else(|| Error::AttachFailed {
            id: phys_addr,
            reason: "no such region".into(),
        })?;

        let (target, size) = (region.target, region.size);
        if owner {
            if region.freed {
                return Err(Error::InvalidArgument(format!(
                    "region {phys_addr:#x} freed twice"
                )));
            }
            region.freed = true;
        } else {
            region.attachments = region.attachments.saturating_sub(1);
        }

        let retire = region.freed && region.attachments == 0;
        if owner {
            let window = &mut state.windows[target.index()];
            window.used = window.used.saturating_sub(size);
        }
        if retire {
            state.regions.remove(&phys_addr);
        }
        Ok(())
    }
}

impl MemoryDevice for SimDevice {
    fn alloc_contiguous(
        &self,
        target: MemoryTarget,
        cache: CachePolicy,
        sizes: &[usize],
    ) -> Result<Vec<RawRegion>> {
        if sizes.is_empty() || sizes.contains(&0) {
            return Err(Error::InvalidArgument(
                "region sizes must be non-empty and non-zero".into(),
            ));
        }
        let total = sizes
            .iter()
            .try_fold(0usize, |acc, &size| acc.checked_add(size))
            .ok_or_else(|| Error::InvalidArgument("region sizes overflow".into()))?;

        let mut state = self.lock();
        let window = &state.windows[target.index()];
        if window.used.checked_add(total).is_none_or(|end| end > window.capacity) {
            return Err(Error::AllocationFailed {
                target,
                size: total,
                reason: format!(
                    "region exhausted ({} of {} bytes in use)",
                    window.used, window.capacity
                ),
            });
        }

        let name = CString::new(format!("edgeflow:{}", target.as_str().to_lowercase()))
            .map_err(|e| Error::AllocationFailed {
                target,
                size: total,
                reason: e.to_string(),
            })?;
        let fd = rustix::fs::memfd_create(&name, rustix::fs::MemfdFlags::CLOEXEC)?;
        rustix::fs::ftruncate(&fd, self.align_up(total as u64))?;
        let fd = Arc::new(fd);

        let start = self.align_up(window.next_phys);
        let mut regions = Vec::with_capacity(sizes.len());
        let mut offset = 0u64;
        for &size in sizes {
            let phys_addr = start + offset;
            state.regions.insert(
                phys_addr,
                SimRegion {
                    fd: fd.clone(),
                    fd_offset: offset,
                    size,
                    target,
                    cache,
                    attachments: 0,
                    freed: false,
                },
            );
            regions.push(RawRegion {
                phys_addr,
                size,
                target,
                cache,
            });
            offset += size as u64;
        }

        let window = &mut state.windows[target.index()];
        window.next_phys = start + offset;
        window.used += total;
        self.counters.allocs.fetch_add(1, Ordering::Relaxed);
        Ok(regions)
    }

    fn attach(&self, phys_addr: u64) -> Result<RawRegion> {
        let mut state = self.lock();
        let region = state
            .regions
            .get_mut(&phys_addr)
            .filter(|r| !r.freed)
            .ok_or_else(|| Error::AttachFailed {
                id: phys_addr,
                reason: "no live allocation at this address".into(),
            })?;
        region.attachments += 1;
        self.counters.attaches.fetch_add(1, Ordering::Relaxed);
        Ok(RawRegion {
            phys_addr,
            size: region.size,
            target: region.target,
            cache: region.cache,
        })
    }

    fn map(&self, region: &RawRegion) -> Result<DeviceMapping> {
        let (fd, fd_offset) = {
            let state = self.lock();
            let r = state
                .regions
                .get(&region.phys_addr)
                .ok_or_else(|| Error::MappingFailed(format!(
                    "region {:#x} is not live",
                    region.phys_addr
                )))?;
            (r.fd.clone(), r.fd_offset)
        };

        let page = self.page_size as u64;
        let map_offset = fd_offset - fd_offset % page;
        let delta = (fd_offset - map_offset) as usize;
        let len = self.align_up((delta + region.size) as u64) as usize;

        // SAFETY: A fresh shared mapping of a memfd we keep alive; the kernel
        // picks the address.
        let ptr = unsafe {
            rustix::mm::mmap(
                std::ptr::null_mut(),
                len,
                ProtFlags::READ | ProtFlags::WRITE,
                MapFlags::SHARED,
                &*fd,
                map_offset,
            )?
        };
        let base = NonNull::new(ptr.cast::<u8>())
            .ok_or_else(|| Error::MappingFailed("mmap returned null".into()))?;

        self.counters.maps.fetch_add(1, Ordering::Relaxed);
        // SAFETY: base..base+len was just mapped and delta < len.
        Ok(unsafe { DeviceMapping::new(base, len, delta) })
    }

    fn unmap(&self, _region: &RawRegion, mapping: DeviceMapping) -> Result<()> {
        // SAFETY: The mapping was created by `map` and is consumed here.
        unsafe { rustix::mm::munmap(mapping.base().as_ptr().cast(), mapping.len())? };
        self.counters.unmaps.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn invalidate(&self, _region: &RawRegion, mapping: &DeviceMapping) -> Result<()> {
        // SAFETY: The mapping is live for the duration of the borrow.
        unsafe {
            rustix::mm::msync(
                mapping.base().as_ptr().cast(),
                mapping.len(),
                MsyncFlags::INVALIDATE,
            )?
        };
        self.counters.invalidates.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn flush(&self, _region: &RawRegion, mapping: &DeviceMapping) -> Result<()> {
        // SAFETY: The mapping is live for the duration of the borrow.
        unsafe {
            rustix::mm::msync(
                mapping.base().as_ptr().cast(),
                mapping.len(),
                MsyncFlags::SYNC,
            )?
        };
        self.counters.flushes.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn free(&self, region: &RawRegion) -> Result<()> {
        self.release(region.phys_addr, true)?;
        self.counters.frees.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn detach(&self, region: &RawRegion) -> Result<()> {
        self.release(region.phys_addr, false)?;
        self.counters.detaches.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}

impl std::fmt::Debug for SimDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SimDevice")
            .field("page_size", &self.page_size)
            .field("stats", &self.stats())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write(device: &SimDevice, region: &RawRegion, bytes: &[u8]) -> DeviceMapping {
        let mapping = device.map(region).unwrap();
        unsafe {
            std::ptr::copy_nonoverlapping(bytes.as_ptr(), mapping.addr().as_ptr(), bytes.len());
        }
        mapping
    }

    #[test]
    fn test_contiguous_regions() {
        let device = SimDevice::new();
        let regions = device
            .alloc_contiguous(MemoryTarget::Dms0, CachePolicy::Default, &[100, 4000, 33])
            .unwrap();

        assert_eq!(regions.len(), 3);
        for pair in regions.windows(2) {
            assert_eq!(pair[1].phys_addr, pair[0].phys_addr + pair[0].size as u64);
        }
        assert_eq!(device.used(MemoryTarget::Dms0), 4133);
    }

    #[test]
    fn test_targets_use_separate_windows() {
        let device = SimDevice::new();
        let a = device.alloc(MemoryTarget::Generic, CachePolicy::Default, 64).unwrap();
        let b = device.alloc(MemoryTarget::Ev74, CachePolicy::Default, 64).unwrap();
        assert_ne!(a.phys_addr >> 36, b.phys_addr >> 36);
        assert_eq!(a.phys_addr % rustix::param::page_size() as u64, 0);
    }

    #[test]
    fn test_window_exhaustion() {
        let device = SimDevice::builder().capacity(MemoryTarget::Ocm, 8192).build();
        let first = device.alloc(MemoryTarget::Ocm, CachePolicy::Default, 8192).unwrap();

        let err = device.alloc(MemoryTarget::Ocm, CachePolicy::Default, 1).unwrap_err();
        assert!(matches!(err, Error::AllocationFailed { target: MemoryTarget::Ocm, .. }));

        device.free(&first).unwrap();
        assert!(device.alloc(MemoryTarget::Ocm, CachePolicy::Default, 4096).is_ok());
    }

    #[test]
    fn test_oversized_requests_are_rejected() {
        let device = SimDevice::new();
        let err = device
            .alloc_contiguous(MemoryTarget::Dms0, CachePolicy::Default, &[usize::MAX, 2])
            .unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)));

        let _held = device.alloc(MemoryTarget::Dms0, CachePolicy::Default, 64).unwrap();
        let err = device
            .alloc_contiguous(MemoryTarget::Dms0, CachePolicy::Default, &[usize::MAX])
            .unwrap_err();
        assert!(matches!(err, Error::AllocationFailed { target: MemoryTarget::Dms0, .. }));
        assert_eq!(device.used(MemoryTarget::Dms0), 64);
    }

    #[test]
    fn test_attached_mapping_shares_pages() {
        let device = SimDevice::new();
        let regions = device
            .alloc_contiguous(MemoryTarget::Generic, CachePolicy::Default, &[10, 20])
            .unwrap();
        let owner_map = write(&device, &regions[1], b"segment-two");

        let attached = device.attach(regions[1].phys_addr).unwrap();
        assert_eq!(attached, regions[1]);
        let attached_map = device.map(&attached).unwrap();
        let seen = unsafe { std::slice::from_raw_parts(attached_map.addr().as_ptr(), 11) };
        assert_eq!(seen, b"segment-two");

        device.unmap(&attached, attached_map).unwrap();
        device.unmap(&regions[1], owner_map).unwrap();
    }

    #[test]
    fn test_free_waits_for_detach() {
        let device = SimDevice::new();
        let region = device.alloc(MemoryTarget::Generic, CachePolicy::Default, 128).unwrap();
        let attached = device.attach(region.phys_addr).unwrap();

        device.free(&region).unwrap();
        assert_eq!(device.stats().live_regions, 1);
        assert!(device.attach(region.phys_addr).is_err());

        device.detach(&attached).unwrap();
        assert_eq!(device.stats().live_regions, 0);
    }

    #[test]
    fn test_double_free_rejected() {
        let device = SimDevice::new();
        let region = device.alloc(MemoryTarget::Generic, CachePolicy::Default, 128).unwrap();
        let _attached = device.attach(region.phys_addr).unwrap();
        device.free(&region).unwrap();
        assert!(device.free(&region).is_err());
    }

    #[test]
    fn test_containing_region() {
        let device = SimDevice::new();
        let regions = device
            .alloc_contiguous(MemoryTarget::Dms0, CachePolicy::Default, &[64, 64])
            .unwrap();
        let second = regions[1].phys_addr;

        assert_eq!(device.containing_region(second + 10), Some(second));
        assert_eq!(device.containing_region(regions[0].phys_addr + 63), Some(regions[0].phys_addr));
        assert_eq!(device.containing_region(second + 64), None);
    }

    #[test]
    fn test_unknown_address_fails_attach() {
        let device = SimDevice::new();
        let err = device.attach(0xdead_0000).unwrap_err();
        assert!(matches!(err, Error::AttachFailed { id: 0xdead_0000, .. }));
    }
}
