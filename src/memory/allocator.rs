//! Allocators that produce [`SegmentedBuffer`]s.
//!
//! Two variants exist:
//!
//! - [`ContiguousAllocator`]: one region per buffer, named `"parent"`.
//! - [`SegmentAllocator`]: up to [`MAX_SEGMENTS`] named segments, physically
//!   back to back.
//!
//! Both resolve the requested [`MemoryFlags`] to one target and one cache
//! policy, allocate without retrying, and log failures with the attempted
//! target and size.

use super::defaults::{MAX_SEGMENTS, PARENT_SEGMENT};
use super::device::MemoryDevice;
use super::handle::{Origin, PhysicalMemoryHandle};
use super::segmented::{Segment, SegmentSpec, SegmentedBuffer};
use super::MemoryFlags;
use crate::error::{Error, Result};
use crate::observability;
use smallvec::SmallVec;
use std::collections::HashSet;
use std::sync::Arc;

/// Creates buffers against a memory target and cache policy.
pub trait Allocator: Send + Sync {
    /// Registration name.
    fn name(&self) -> &str;

    /// Allocate a single-segment buffer.
    fn alloc(&self, flags: MemoryFlags, size: usize) -> Result<SegmentedBuffer>;

    /// Allocate a buffer with one segment per spec, in order.
    fn alloc_segments(&self, flags: MemoryFlags, layout: &[SegmentSpec]) -> Result<SegmentedBuffer>;

    /// Release a buffer, unmapping and freeing all segments together.
    fn free(&self, buffer: SegmentedBuffer) {
        drop(buffer);
    }
}

// ============================================================================
// ContiguousAllocator
// ============================================================================

/// Single-region allocator.
pub struct ContiguousAllocator {
    name: String,
    device: Arc<dyn MemoryDevice>,
}

impl ContiguousAllocator {
    /// Create an allocator over a device.
    pub fn new(name: impl Into<String>, device: Arc<dyn MemoryDevice>) -> Self {
        Self {
            name: name.into(),
            device,
        }
    }
}

impl Allocator for ContiguousAllocator {
    fn name(&self) -> &str {
        &self.name
    }

    fn alloc(&self, flags: MemoryFlags, size: usize) -> Result<SegmentedBuffer> {
        allocate(&self.device, flags, &[SegmentSpec::new(PARENT_SEGMENT, size)])
    }

    fn alloc_segments(&self, flags: MemoryFlags, layout: &[SegmentSpec]) -> Result<SegmentedBuffer> {
        match layout {
            [only] => allocate(&self.device, flags, std::slice::from_ref(only)),
            _ => Err(Error::InvalidArgument(format!(
                "{} allocates single-region buffers, got {} segments",
                self.name,
                layout.len()
            ))),
        }
    }
}

// ============================================================================
// SegmentAllocator
// ============================================================================

/// Multi-segment allocator.
pub struct SegmentAllocator {
    name: String,
    device: Arc<dyn MemoryDevice>,
}

impl SegmentAllocator {
    /// Create an allocator over a device.
    pub fn new(name: impl Into<String>, device: Arc<dyn MemoryDevice>) -> Self {
        Self {
            name: name.into(),
            device,
        }
    }
}

impl Allocator for SegmentAllocator {
    fn name(&self) -> &str {
        &self.name
    }

    fn alloc(&self, flags: MemoryFlags, size: usize) -> Result<SegmentedBuffer> {
        allocate(&self.device, flags, &[SegmentSpec::new(PARENT_SEGMENT, size)])
    }

    fn alloc_segments(&self, flags: MemoryFlags, layout: &[SegmentSpec]) -> Result<SegmentedBuffer> {
        allocate(&self.device, flags, layout)
    }
}

fn validate(layout: &[SegmentSpec]) -> Result<()> {
    if layout.is_empty() {
        return Err(Error::InvalidArgument("no segments requested".into()));
    }
    if layout.len() > MAX_SEGMENTS {
        return Err(Error::InvalidArgument(format!(
            "{} segments requested, at most {MAX_SEGMENTS} allowed",
            layout.len()
        )));
    }
    let mut names = HashSet::with_capacity(layout.len());
    for spec in layout {
        if spec.size == 0 {
            return Err(Error::InvalidArgument(format!(
                "segment '{}' has zero size",
                spec.name
            )));
        }
        if spec.name.is_empty() {
            return Err(Error::InvalidArgument("segment names must not be empty".into()));
        }
        if !names.insert(spec.name.as_str()) {
            return Err(Error::InvalidArgument(format!(
                "duplicate segment name '{}'",
                spec.name
            )));
        }
    }
    if layout
        .iter()
        .try_fold(0usize, |acc, spec| acc.checked_add(spec.size))
        .is_none()
    {
        return Err(Error::InvalidArgument("segment sizes overflow".into()));
    }
    Ok(())
}

fn allocate(
    device: &Arc<dyn MemoryDevice>,
    flags: MemoryFlags,
    layout: &[SegmentSpec],
) -> Result<SegmentedBuffer> {
    validate(layout)?;

    let target = flags.target();
    let cache = flags.cache_policy();
    let sizes: SmallVec<[usize; 4]> = layout.iter().map(|s| s.size).collect();
    let total: usize = sizes.iter().sum();

    let regions = match device.alloc_contiguous(target, cache, &sizes) {
        Ok(regions) => regions,
        Err(e) => {
            tracing::error!(
                memory = %target,
                size = total,
                segments = layout.len(),
                error = %e,
                "physical allocation failed"
            );
            observability::record_allocation_failure(target);
            return Err(e);
        }
    };

    let segments = regions
        .into_iter()
        .zip(layout)
        .map(|(region, spec)| {
            Segment::new(
                spec.name.clone(),
                PhysicalMemoryHandle::from_region(device.clone(), region, Origin::Allocated),
            )
        })
        .collect();

    // Mapping the parent can still fail; the segments are released on drop.
    let buffer = SegmentedBuffer::from_segments(segments, flags).inspect_err(|e| {
        tracing::error!(memory = %target, size = total, error = %e, "mapping new buffer failed");
    })?;

    observability::record_allocation(target);
    tracing::debug!(
        memory = %target,
        cache = %cache,
        size = total,
        phys = buffer.phys_addr(),
        "allocated buffer"
    );
    Ok(buffer)
}
