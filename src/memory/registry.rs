//! Named allocator registration.
//!
//! Stages look allocators up by name instead of reaching for process
//! globals. The registry is created once and shared (usually in an `Arc`);
//! creation of each named allocator happens at most once no matter how many
//! threads ask for it concurrently.

use super::allocator::{Allocator, ContiguousAllocator, SegmentAllocator};
use super::device::MemoryDevice;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

/// Well-known name of the single-region allocator.
pub const CONTIGUOUS_ALLOCATOR: &str = "edgeflow-contiguous";

/// Well-known name of the multi-segment allocator.
pub const SEGMENT_ALLOCATOR: &str = "edgeflow-segment";

/// Allocators by name.
#[derive(Default)]
pub struct AllocatorRegistry {
    entries: Mutex<HashMap<String, Arc<dyn Allocator>>>,
}

impl AllocatorRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the allocator registered under `name`, creating it with `make`
    /// if absent.
    pub fn get_or_create<F>(&self, name: &str, make: F) -> Arc<dyn Allocator>
    where
        F: FnOnce() -> Arc<dyn Allocator>,
    {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(existing) = entries.get(name) {
            return existing.clone();
        }
        let allocator = make();
        tracing::debug!(name, "registered allocator");
        entries.insert(name.to_string(), allocator.clone());
        allocator
    }

    /// Look up a registered allocator.
    pub fn get(&self, name: &str) -> Option<Arc<dyn Allocator>> {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned()
    }

    /// Names of all registered allocators, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        names.sort();
        names
    }

    /// The single-region allocator over `device`.
    pub fn contiguous(&self, device: &Arc<dyn MemoryDevice>) -> Arc<dyn Allocator> {
        self.get_or_create(CONTIGUOUS_ALLOCATOR, || {
            Arc::new(ContiguousAllocator::new(CONTIGUOUS_ALLOCATOR, device.clone()))
        })
    }

    /// The multi-segment allocator over `device`.
    pub fn segmented(&self, device: &Arc<dyn MemoryDevice>) -> Arc<dyn Allocator> {
        self.get_or_create(SEGMENT_ALLOCATOR, || {
            Arc::new(SegmentAllocator::new(SEGMENT_ALLOCATOR, device.clone()))
        })
    }
}

impl std::fmt::Debug for AllocatorRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AllocatorRegistry")
            .field("names", &self.names())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::SimDevice;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;

    #[test]
    fn test_get_or_create_is_idempotent() {
        let device: Arc<dyn MemoryDevice> = SimDevice::new();
        let registry = AllocatorRegistry::new();

        let a = registry.contiguous(&device);
        let b = registry.contiguous(&device);
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(a.name(), CONTIGUOUS_ALLOCATOR);

        registry.segmented(&device);
        assert_eq!(registry.names(), [CONTIGUOUS_ALLOCATOR, SEGMENT_ALLOCATOR]);
        assert!(registry.get("missing").is_none());
    }

    #[test]
    fn test_concurrent_creation_runs_once() {
        let device: Arc<dyn MemoryDevice> = SimDevice::new();
        let registry = Arc::new(AllocatorRegistry::new());
        let created = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let registry = registry.clone();
                let device = device.clone();
                let created = created.clone();
                thread::spawn(move || {
                    registry.get_or_create("shared", || {
                        created.fetch_add(1, Ordering::SeqCst);
                        Arc::new(SegmentAllocator::new("shared", device))
                    })
                })
            })
            .collect();

        let allocators: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        assert_eq!(created.load(Ordering::SeqCst), 1);
        assert!(allocators.windows(2).all(|w| Arc::ptr_eq(&w[0], &w[1])));
    }
}
