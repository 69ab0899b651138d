//! Buffers made of named, physically contiguous segments.

use super::defaults::MAX_SEGMENTS;
use super::handle::PhysicalMemoryHandle;
use super::{CachePolicy, MemoryFlags, MemoryTarget};
use crate::error::{Error, Result};
use smallvec::SmallVec;
use std::ptr::NonNull;
use std::sync::{Mutex, PoisonError};

/// Requested name and size of one segment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SegmentSpec {
    /// Segment name, unique within a buffer.
    pub name: String,
    /// Size in bytes.
    pub size: usize,
}

impl SegmentSpec {
    /// Create a segment spec.
    pub fn new(name: impl Into<String>, size: usize) -> Self {
        Self {
            name: name.into(),
            size,
        }
    }
}

/// A named sub-region of a [`SegmentedBuffer`].
pub struct Segment {
    name: String,
    handle: PhysicalMemoryHandle,
}

impl Segment {
    pub(crate) fn new(name: impl Into<String>, handle: PhysicalMemoryHandle) -> Self {
        Self {
            name: name.into(),
            handle,
        }
    }

    /// Segment name.
    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Size in bytes.
    #[inline]
    pub fn size(&self) -> usize {
        self.handle.size()
    }

    /// Physical address of the segment's first byte.
    #[inline]
    pub fn phys_addr(&self) -> u64 {
        self.handle.phys_addr()
    }

    /// The backing physical memory.
    #[inline]
    pub fn handle(&self) -> &PhysicalMemoryHandle {
        &self.handle
    }
}

impl std::fmt::Debug for Segment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Segment")
            .field("name", &self.name)
            .field("phys_addr", &format_args!("{:#x}", self.phys_addr()))
            .field("size", &self.size())
            .finish()
    }
}

/// One logical buffer made of up to [`MAX_SEGMENTS`] named segments.
///
/// Segments are laid out back to back in physical memory, so a consumer can
/// treat the buffer as one region starting at [`phys_addr`](Self::phys_addr)
/// while still addressing each segment by name. The first segment is the
/// parent; it is mapped when the buffer is created and its address is reused
/// for the buffer's whole life.
pub struct SegmentedBuffer {
    segments: SmallVec<[Segment; 4]>,
    size: usize,
    flags: MemoryFlags,
    map_lock: Mutex<()>,
}

impl SegmentedBuffer {
    /// Assemble a buffer and map its parent segment.
    pub(crate) fn from_segments(segments: SmallVec<[Segment; 4]>, flags: MemoryFlags) -> Result<Self> {
        if segments.is_empty() || segments.len() > MAX_SEGMENTS {
            return Err(Error::InvalidArgument(format!(
                "a buffer holds 1 to {MAX_SEGMENTS} segments, got {}",
                segments.len()
            )));
        }
        segments[0].handle.map()?;

        let size = segments.iter().map(Segment::size).sum();
        Ok(Self {
            segments,
            size,
            flags,
            map_lock: Mutex::new(()),
        })
    }

    /// All segments, parent first.
    #[inline]
    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    /// The parent segment.
    #[inline]
    pub fn parent(&self) -> &Segment {
        &self.segments[0]
    }

    /// Look up a segment. `None` selects the parent.
    pub fn segment(&self, name: Option<&str>) -> Option<&Segment> {
        match name {
            None => self.segments.first(),
            Some(name) => self.segments.iter().find(|s| s.name == name),
        }
    }

    /// Look up a segment that must exist.
    pub fn segment_by_name(&self, name: &str) -> Result<&Segment> {
        self.segment(Some(name)).ok_or_else(|| {
            Error::ConfigMismatch(format!("buffer has no segment named '{name}'"))
        })
    }

    /// Names of all segments, parent first.
    pub fn segment_names(&self) -> impl Iterator<Item = &str> {
        self.segments.iter().map(Segment::name)
    }

    /// Physical address of the parent segment.
    #[inline]
    pub fn phys_addr(&self) -> u64 {
        self.parent().phys_addr()
    }

    /// Total size (sum of all segment sizes).
    #[inline]
    pub fn size(&self) -> usize {
        self.size
    }

    /// Flags the buffer was allocated with.
    #[inline]
    pub fn flags(&self) -> MemoryFlags {
        self.flags
    }

    /// Resolved memory target.
    #[inline]
    pub fn target(&self) -> MemoryTarget {
        self.parent().handle.target()
    }

    /// Resolved cache policy.
    #[inline]
    pub fn cache_policy(&self) -> CachePolicy {
        self.parent().handle.cache_policy()
    }

    /// Base virtual address (the parent segment's mapping).
    pub fn vaddr(&self) -> Option<NonNull<u8>> {
        self.parent().handle.vaddr()
    }

    /// Map for reading.
    ///
    /// Cached buffers are invalidated first so reads observe what other
    /// domains wrote.
    pub fn map(&self) -> Result<BufferView<'_>> {
        let addrs = self.prepare()?;
        Ok(BufferView {
            buffer: self,
            addrs,
        })
    }

    /// Map for reading and writing.
    ///
    /// Cached buffers are invalidated now and flushed when the view is
    /// unmapped or dropped.
    pub fn map_mut(&mut self) -> Result<BufferViewMut<'_>> {
        let addrs = self.prepare()?;
        Ok(BufferViewMut {
            buffer: self,
            addrs,
            unmapped: false,
        })
    }

    fn prepare(&self) -> Result<SmallVec<[NonNull<u8>; 4]>> {
        let _guard = self.map_lock.lock().unwrap_or_else(PoisonError::into_inner);
        let addrs = self
            .segments
            .iter()
            .map(|s| s.handle.map())
            .collect::<Result<SmallVec<_>>>()?;
        if self.cache_policy().is_cached() {
            for segment in &self.segments {
                segment.handle.invalidate()?;
            }
        }
        Ok(addrs)
    }

    fn flush(&self) -> Result<()> {
        let _guard = self.map_lock.lock().unwrap_or_else(PoisonError::into_inner);
        if self.cache_policy().is_cached() {
            for segment in &self.segments {
                segment.handle.flush()?;
            }
        }
        Ok(())
    }

    fn index_of(&self, name: &str) -> Option<usize> {
        self.segments.iter().position(|s| s.name == name)
    }
}

impl std::fmt::Debug for SegmentedBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SegmentedBuffer")
            .field("size", &self.size)
            .field("target", &self.target())
            .field("cache", &self.cache_policy())
            .field("segments", &self.segments)
            .finish()
    }
}

/// Read access to a mapped [`SegmentedBuffer`].
pub struct BufferView<'a> {
    buffer: &'a SegmentedBuffer,
    addrs: SmallVec<[NonNull<u8>; 4]>,
}

impl BufferView<'_> {
    /// Bytes of the parent segment.
    pub fn as_slice(&self) -> &[u8] {
        self.bytes(0)
    }

    /// Bytes of a named segment.
    pub fn segment(&self, name: &str) -> Option<&[u8]> {
        self.buffer.index_of(name).map(|i| self.bytes(i))
    }

    /// Every segment's name and bytes, parent first.
    pub fn segments(&self) -> impl Iterator<Item = (&str, &[u8])> {
        (0..self.addrs.len()).map(|i| (self.buffer.segments[i].name(), self.bytes(i)))
    }

    fn bytes(&self, index: usize) -> &[u8] {
        let len = self.buffer.segments[index].size();
        // SAFETY: Segment mappings live until the buffer is dropped, and the
        // view borrows the buffer.
        unsafe { std::slice::from_raw_parts(self.addrs[index].as_ptr(), len) }
    }
}

/// Read/write access to a mapped [`SegmentedBuffer`].
///
/// Unmapping flushes cached buffers. Dropping the view unmaps it; use
/// [`unmap`](Self::unmap) to observe flush errors.
pub struct BufferViewMut<'a> {
    buffer: &'a SegmentedBuffer,
    addrs: SmallVec<[NonNull<u8>; 4]>,
    unmapped: bool,
}

impl BufferViewMut<'_> {
    /// Bytes of the parent segment.
    pub fn as_slice(&self) -> &[u8] {
        self.bytes(0)
    }

    /// Mutable bytes of the parent segment.
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        self.bytes_mut(0)
    }

    /// Bytes of a named segment.
    pub fn segment(&self, name: &str) -> Option<&[u8]> {
        self.buffer.index_of(name).map(|i| self.bytes(i))
    }

    /// Mutable bytes of a named segment.
    pub fn segment_mut(&mut self, name: &str) -> Option<&mut [u8]> {
        self.buffer.index_of(name).map(|i| self.bytes_mut(i))
    }

    /// Finish writing. Flushes cached buffers.
    pub fn unmap(mut self) -> Result<()> {
        self.unmapped = true;
        self.buffer.flush()
    }

    fn bytes(&self, index: usize) -> &[u8] {
        let len = self.buffer.segments[index].size();
        // SAFETY: See `BufferView::bytes`.
        unsafe { std::slice::from_raw_parts(self.addrs[index].as_ptr(), len) }
    }

    fn bytes_mut(&mut self, index: usize) -> &mut [u8] {
        let len = self.buffer.segments[index].size();
        // SAFETY: The view was created from `&mut SegmentedBuffer`, so no
        // other view of this buffer exists.
        unsafe { std::slice::from_raw_parts_mut(self.addrs[index].as_ptr(), len) }
    }
}

impl Drop for BufferViewMut<'_> {
    fn drop(&mut self) {
        if !self.unmapped
            && let Err(e) = self.buffer.flush()
        {
            tracing::warn!(phys = self.buffer.phys_addr(), error = %e, "flush on unmap failed");
        }
    }
}
