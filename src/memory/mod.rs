//! Physical memory management for edgeflow.
//!
//! This module provides the allocation layer that lets buffers move between
//! compute domains without copying.
//!
//! # Architecture
//!
//! - [`MemoryDevice`]: Driver boundary (allocate, attach, map, cache maintenance)
//! - [`PhysicalMemoryHandle`]: One contiguous physical allocation
//! - [`SegmentedBuffer`]: Named, physically contiguous segments as one buffer
//! - [`Allocator`]: Creates buffers against a target and cache policy
//! - [`AllocatorRegistry`]: Allocators by name, created once
//! - [`BufferPool`]: Bounded pool of pre-allocated buffers
//! - [`BufferIdCache`]: Buffer id to virtual address lookups
//!
//! # Example
//!
//! ```rust,ignore
//! use edgeflow::memory::{AllocatorRegistry, MemoryFlags, SimDevice};
//!
//! let device: Arc<dyn MemoryDevice> = SimDevice::new();
//! let registry = AllocatorRegistry::new();
//! let allocator = registry.segmented(&device);
//!
//! let buffer = allocator.alloc_segments(
//!     MemoryFlags::DMS0 | MemoryFlags::CACHED,
//!     &[SegmentSpec::new("ifm0", 4096), SegmentSpec::new("ifm1", 4096)],
//! )?;
//! assert_eq!(buffer.segment(Some("ifm1")).unwrap().phys_addr(), buffer.phys_addr() + 4096);
//! ```

mod allocator;
mod buffer_pool;
pub mod defaults;
mod device;
mod handle;
mod id_cache;
mod registry;
mod segmented;
mod sim;
mod target;

pub use allocator::{Allocator, ContiguousAllocator, SegmentAllocator};
pub use buffer_pool::{BufferPool, PoolStats, PooledBuffer};
pub use device::{DeviceMapping, MemoryDevice, RawRegion};
pub use handle::{Origin, PhysicalMemoryHandle};
pub use id_cache::{BufferIdCache, IdCacheStats, Resolved};
pub use registry::{AllocatorRegistry, CONTIGUOUS_ALLOCATOR, SEGMENT_ALLOCATOR};
pub use segmented::{BufferView, BufferViewMut, Segment, SegmentSpec, SegmentedBuffer};
pub use sim::{SimDevice, SimDeviceBuilder, SimDeviceStats};
pub use target::{CachePolicy, MemoryFlags, MemoryTarget};
