//! Buffer id to virtual address cache.
//!
//! Buffers cross domain boundaries as bare ids (physical addresses). Turning
//! an id into something the CPU can read means attaching to the memory and
//! mapping it, which is too slow to repeat for every frame. The cache keeps
//! the first [`ID_CACHE_CAPACITY`] ids it sees attached and mapped for the
//! rest of its life.
//!
//! # Saturation
//!
//! Slots are never evicted: another thread may still be reading through a
//! cached mapping. Once every slot is taken, lookups of new ids attach and
//! map privately and hand ownership of that mapping to the caller. This is
//! slower but never touches an existing slot.

use super::defaults::ID_CACHE_CAPACITY;
use super::device::MemoryDevice;
use super::handle::PhysicalMemoryHandle;
use crate::error::{Error, Result};
use crate::observability;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// Cache usage counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IdCacheStats {
    /// Lookups answered from a slot.
    pub hits: u64,
    /// Lookups that filled a new slot.
    pub misses: u64,
    /// Lookups served without caching because the table was full.
    pub bypasses: u64,
}

/// A resolved buffer id.
///
/// Holds the mapping alive for as long as the value exists, even if the
/// cache is cleared meanwhile.
#[derive(Debug, Clone)]
pub struct Resolved {
    handle: Arc<PhysicalMemoryHandle>,
    addr: NonNull<u8>,
    cached: bool,
}

// SAFETY: `addr` points into the mapping owned by `handle`, which is
// Send + Sync; the pointer is only an address.
unsafe impl Send for Resolved {}
unsafe impl Sync for Resolved {}

impl Resolved {
    /// Physical address of the buffer.
    #[inline]
    pub fn phys_addr(&self) -> u64 {
        self.handle.phys_addr()
    }

    /// Process-local virtual address.
    #[inline]
    pub fn as_ptr(&self) -> NonNull<u8> {
        self.addr
    }

    /// Size of the attached region.
    #[inline]
    pub fn size(&self) -> usize {
        self.handle.size()
    }

    /// Whether the mapping lives in a cache slot.
    #[inline]
    pub fn is_cached(&self) -> bool {
        self.cached
    }

    /// The attached memory.
    pub fn handle(&self) -> &Arc<PhysicalMemoryHandle> {
        &self.handle
    }

    /// View the attached memory.
    ///
    /// # Safety
    ///
    /// No other domain or thread may write the region while the slice is
    /// alive.
    pub unsafe fn as_slice(&self) -> &[u8] {
        // SAFETY: The mapping covers `size` bytes and outlives `self`; the
        // caller rules out concurrent writers.
        unsafe { std::slice::from_raw_parts(self.addr.as_ptr(), self.size()) }
    }
}

struct Slot {
    id: u64,
    phys_addr: u64,
    addr: NonNull<u8>,
    handle: Arc<PhysicalMemoryHandle>,
}

struct Table {
    slots: Vec<Option<Slot>>,
    occupied: u64,
}

// SAFETY: Slot addresses belong to mappings owned by the slot handles.
unsafe impl Send for Table {}

impl Table {
    fn find(&self, id: u64) -> Option<&Slot> {
        let mut mask = self.occupied;
        while mask != 0 {
            let index = mask.trailing_zeros() as usize;
            mask &= mask - 1;
            if let Some(slot) = &self.slots[index]
                && slot.id == id
            {
                return Some(slot);
            }
        }
        None
    }

    fn free_index(&self) -> Option<usize> {
        let free = !self.occupied & mask_for(self.slots.len());
        (free != 0).then(|| free.trailing_zeros() as usize)
    }
}

fn mask_for(capacity: usize) -> u64 {
    if capacity >= u64::BITS as usize {
        u64::MAX
    } else {
        (1u64 << capacity) - 1
    }
}

/// Fixed-capacity, no-eviction map from buffer id to virtual address.
///
/// One mutex guards the whole table; lookups scan at most
/// [`capacity`](Self::capacity) slots.
pub struct BufferIdCache {
    device: Arc<dyn MemoryDevice>,
    table: Mutex<Table>,
    hits: AtomicU64,
    misses: AtomicU64,
    bypasses: AtomicU64,
}

impl BufferIdCache {
    /// Create a cache with [`ID_CACHE_CAPACITY`] slots.
    pub fn new(device: Arc<dyn MemoryDevice>) -> Self {
        Self::build(device, ID_CACHE_CAPACITY)
    }

    /// Create a cache with fewer slots.
    pub fn with_capacity(device: Arc<dyn MemoryDevice>, capacity: usize) -> Result<Self> {
        if capacity == 0 || capacity > ID_CACHE_CAPACITY {
            return Err(Error::InvalidArgument(format!(
                "id cache capacity must be 1..={ID_CACHE_CAPACITY}, got {capacity}"
            )));
        }
        Ok(Self::build(device, capacity))
    }

    fn build(device: Arc<dyn MemoryDevice>, capacity: usize) -> Self {
        Self {
            device,
            table: Mutex::new(Table {
                slots: (0..capacity).map(|_| None).collect(),
                occupied: 0,
            }),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            bypasses: AtomicU64::new(0),
        }
    }

    /// Resolve an id to a mapped address.
    ///
    /// The first lookup of an id attaches and maps it; later lookups return
    /// the same address without touching the device. When the table is full
    /// the mapping is created for this call only.
    pub fn resolve(&self, id: u64) -> Result<Resolved> {
        let mut table = self.lock();
        if let Some(slot) = table.find(id) {
            self.hits.fetch_add(1, Ordering::Relaxed);
            observability::record_id_cache_hit();
            return Ok(Resolved {
                handle: slot.handle.clone(),
                addr: slot.addr,
                cached: true,
            });
        }

        let Some(index) = table.free_index() else {
            drop(table);
            return self.bypass(id);
        };
        let slot = self.fill(&mut table, index, id)?;
        Ok(Resolved {
            handle: slot.handle.clone(),
            addr: slot.addr,
            cached: true,
        })
    }

    /// Resolve an id to its physical address only.
    ///
    /// Cached ids answer from their slot. Other ids are attached to validate
    /// them; full tables skip the map.
    pub fn resolve_phys(&self, id: u64) -> Result<u64> {
        let mut table = self.lock();
        if let Some(slot) = table.find(id) {
            self.hits.fetch_add(1, Ordering::Relaxed);
            observability::record_id_cache_hit();
            return Ok(slot.phys_addr);
        }
        let Some(index) = table.free_index() else {
            drop(table);
            self.note_bypass(id);
            let handle = PhysicalMemoryHandle::attach(self.device.clone(), id)?;
            return Ok(handle.phys_addr());
        };
        Ok(self.fill(&mut table, index, id)?.phys_addr)
    }

    /// Attach and map `id` into the free slot `index` while the table lock
    /// is held.
    fn fill<'t>(&self, table: &'t mut Table, index: usize, id: u64) -> Result<&'t Slot> {
        let handle = Arc::new(PhysicalMemoryHandle::attach(self.device.clone(), id)?);
        let addr = handle.map()?;
        table.occupied |= 1 << index;
        self.misses.fetch_add(1, Ordering::Relaxed);
        observability::record_id_cache_miss();
        tracing::debug!(id, slot = index, "cached buffer mapping");
        Ok(table.slots[index].insert(Slot {
            id,
            phys_addr: handle.phys_addr(),
            addr,
            handle,
        }))
    }

    fn bypass(&self, id: u64) -> Result<Resolved> {
        self.note_bypass(id);
        let handle = Arc::new(PhysicalMemoryHandle::attach(self.device.clone(), id)?);
        let addr = handle.map()?;
        Ok(Resolved {
            handle,
            addr,
            cached: false,
        })
    }

    fn note_bypass(&self, id: u64) {
        self.bypasses.fetch_add(1, Ordering::Relaxed);
        observability::record_id_cache_bypass();
        tracing::warn!(
            id,
            capacity = self.capacity(),
            "ran out of space to store buffer address, mapping without caching"
        );
    }

    /// Whether `id` occupies a slot.
    pub fn contains(&self, id: u64) -> bool {
        self.lock().find(id).is_some()
    }

    /// Occupied slots.
    pub fn len(&self) -> usize {
        self.lock().occupied.count_ones() as usize
    }

    /// Whether no slot is occupied.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Total slots.
    pub fn capacity(&self) -> usize {
        self.lock().slots.len()
    }

    /// Usage counters.
    pub fn stats(&self) -> IdCacheStats {
        IdCacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            bypasses: self.bypasses.load(Ordering::Relaxed),
        }
    }

    /// Drop every slot. Mappings still held through [`Resolved`] values stay
    /// valid until those are dropped.
    pub fn clear(&self) {
        let mut table = self.lock();
        let slots: Vec<_> = table.slots.iter_mut().filter_map(Option::take).collect();
        table.occupied = 0;
        drop(table);
        drop(slots);
    }

    fn lock(&self) -> MutexGuard<'_, Table> {
        self.table.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl std::fmt::Debug for BufferIdCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BufferIdCache")
            .field("len", &self.len())
            .field("capacity", &self.capacity())
            .field("stats", &self.stats())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{CachePolicy, MemoryTarget, SimDevice};
    use std::thread;

    fn owned(device: &Arc<SimDevice>, fill: u8) -> PhysicalMemoryHandle {
        let handle =
            PhysicalMemoryHandle::allocate(device.clone(), MemoryTarget::Dms0, CachePolicy::Default, 64)
                .unwrap();
        let addr = handle.map().unwrap();
        unsafe { std::ptr::write_bytes(addr.as_ptr(), fill, 64) };
        handle
    }

    #[test]
    fn test_resolve_is_idempotent() {
        let device = SimDevice::new();
        let cache = BufferIdCache::new(device.clone());
        let buffer = owned(&device, 7);
        let before = device.stats();

        let first = cache.resolve(buffer.id()).unwrap();
        let second = cache.resolve(buffer.id()).unwrap();

        assert_eq!(first.as_ptr(), second.as_ptr());
        assert!(first.is_cached());
        let after = device.stats();
        assert_eq!(after.attaches - before.attaches, 1);
        assert_eq!(after.maps - before.maps, 1);
        assert_eq!(cache.stats(), IdCacheStats { hits: 1, misses: 1, bypasses: 0 });
        assert!(unsafe { first.as_slice() }.iter().all(|&b| b == 7));
    }

    #[test]
    fn test_saturation_keeps_existing_slots() {
        let device = SimDevice::new();
        let cache = BufferIdCache::with_capacity(device.clone(), 4).unwrap();
        let buffers: Vec<_> = (0..5).map(|i| owned(&device, i as u8)).collect();

        let first: Vec<_> = buffers[..4]
            .iter()
            .map(|b| cache.resolve(b.id()).unwrap().as_ptr())
            .collect();
        assert_eq!(cache.len(), 4);

        let extra = cache.resolve(buffers[4].id()).unwrap();
        assert!(!extra.is_cached());
        assert!(!cache.contains(buffers[4].id()));
        assert_eq!(unsafe { extra.as_slice() }[0], 4);

        for (buffer, addr) in buffers[..4].iter().zip(&first) {
            let again = cache.resolve(buffer.id()).unwrap();
            assert!(again.is_cached());
            assert_eq!(again.as_ptr(), *addr);
        }

        // Bypassed ids are attached again on every lookup.
        let attaches = device.stats().attaches;
        drop(cache.resolve(buffers[4].id()).unwrap());
        assert_eq!(device.stats().attaches, attaches + 1);
        assert_eq!(cache.stats().bypasses, 2);
    }

    #[test]
    fn test_bypass_releases_its_mapping() {
        let device = SimDevice::new();
        let cache = BufferIdCache::with_capacity(device.clone(), 1).unwrap();
        let a = owned(&device, 1);
        let b = owned(&device, 2);
        cache.resolve(a.id()).unwrap();

        let before = device.stats();
        drop(cache.resolve(b.id()).unwrap());
        let after = device.stats();
        assert_eq!(after.unmaps - before.unmaps, 1);
        assert_eq!(after.detaches - before.detaches, 1);
    }

    #[test]
    fn test_resolve_phys() {
        let device = SimDevice::new();
        let cache = BufferIdCache::with_capacity(device.clone(), 1).unwrap();
        let a = owned(&device, 1);
        let b = owned(&device, 2);

        assert_eq!(cache.resolve_phys(a.id()).unwrap(), a.phys_addr());
        assert!(cache.contains(a.id()));

        let maps = device.stats().maps;
        assert_eq!(cache.resolve_phys(b.id()).unwrap(), b.phys_addr());
        assert_eq!(device.stats().maps, maps);
    }

    #[test]
    fn test_unknown_id_is_error() {
        let device = SimDevice::new();
        let cache = BufferIdCache::new(device);
        assert!(matches!(cache.resolve(0x42), Err(Error::AttachFailed { id: 0x42, .. })));
        assert!(cache.is_empty());
    }

    #[test]
    fn test_capacity_bounds() {
        let device = SimDevice::new();
        assert!(BufferIdCache::with_capacity(device.clone(), 0).is_err());
        assert!(BufferIdCache::with_capacity(device.clone(), 65).is_err());
        assert_eq!(BufferIdCache::with_capacity(device.clone(), 64).unwrap().capacity(), 64);
        assert_eq!(BufferIdCache::new(device).capacity(), ID_CACHE_CAPACITY);
    }

    #[test]
    fn test_clear_detaches() {
        let device = SimDevice::new();
        let cache = BufferIdCache::new(device.clone());
        let a = owned(&device, 1);

        let held = cache.resolve(a.id()).unwrap();
        cache.clear();
        assert!(cache.is_empty());
        assert_eq!(device.stats().detaches, 0);

        drop(held);
        assert_eq!(device.stats().detaches, 1);
    }

    #[test]
    fn test_concurrent_resolve_attaches_once() {
        let device = SimDevice::new();
        let cache = Arc::new(BufferIdCache::new(device.clone()));
        let buffer = owned(&device, 9);
        let id = buffer.id();

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let cache = cache.clone();
                thread::spawn(move || cache.resolve(id).unwrap().as_ptr().as_ptr() as usize)
            })
            .collect();
        let addrs: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();

        assert!(addrs.windows(2).all(|w| w[0] == w[1]));
        assert_eq!(device.stats().attaches, 1);
        assert_eq!(cache.stats().misses, 1);
    }

    #[test]
    fn test_concurrent_resolve_phys_fills_last_slot_once() {
        let device = SimDevice::new();
        let cache = Arc::new(BufferIdCache::with_capacity(device.clone(), 1).unwrap());
        let buffer = owned(&device, 3);
        let id = buffer.id();
        let before = device.stats();

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let cache = cache.clone();
                thread::spawn(move || cache.resolve_phys(id).unwrap())
            })
            .collect();
        for handle in handles {
            assert_eq!(handle.join().unwrap(), buffer.phys_addr());
        }

        assert!(cache.contains(id));
        let after = device.stats();
        assert_eq!(after.attaches - before.attaches, 1);
        assert_eq!(after.maps - before.maps, 1);
        assert_eq!(cache.stats(), IdCacheStats { hits: 7, misses: 1, bypasses: 0 });
    }
}
