//! Bounded pools of pre-allocated segmented buffers.
//!
//! A pipeline stage creates one pool for its outputs. The pool:
//! - Allocates `min` buffers when activated and grows lazily up to `max`
//! - Returns buffers automatically when a [`PooledBuffer`] is dropped
//! - Refuses to hand out buffers while inactive
//! - Tracks statistics for monitoring
//!
//! # Example
//!
//! ```rust,ignore
//! use edgeflow::memory::{BufferPool, MemoryFlags};
//!
//! let pool = BufferPool::create(allocator, 2, 4, MemoryFlags::EV74, &[1 << 20], &[])?;
//! pool.set_active(true)?;
//!
//! let mut buffer = pool.acquire()?;
//! buffer.map_mut()?.as_mut_slice().fill(0);
//!
//! // Buffer returns to pool when dropped
//! drop(buffer);
//! pool.set_active(false)?;
//! ```

use super::allocator::Allocator;
use super::segmented::{SegmentSpec, SegmentedBuffer};
use super::MemoryFlags;
use crate::error::{Error, Result};
use crate::observability;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

/// Statistics about pool usage.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PoolStats {
    /// Buffers allocated at activation.
    pub min: usize,
    /// Upper bound on live buffers.
    pub max: usize,
    /// Buffers currently allocated (idle plus in use).
    pub allocated: usize,
    /// Idle buffers ready to hand out.
    pub available: usize,
    /// Buffers currently handed out.
    pub in_use: usize,
    /// Total number of acquisitions.
    pub acquisitions: u64,
    /// Acquisitions that had to wait for a buffer.
    pub waits: u64,
}

// ============================================================================
// PooledBuffer
// ============================================================================

/// A buffer borrowed from a pool.
///
/// Derefs to [`SegmentedBuffer`]. Dropping it hands the buffer back to an
/// active pool, or frees it if the pool has been deactivated meanwhile.
pub struct PooledBuffer {
    buffer: Option<SegmentedBuffer>,
    pool_inner: Arc<PoolInner>,
}

impl Deref for PooledBuffer {
    type Target = SegmentedBuffer;

    fn deref(&self) -> &SegmentedBuffer {
        match &self.buffer {
            Some(buffer) => buffer,
            None => unreachable!("pooled buffer accessed after release"),
        }
    }
}

impl DerefMut for PooledBuffer {
    fn deref_mut(&mut self) -> &mut SegmentedBuffer {
        match &mut self.buffer {
            Some(buffer) => buffer,
            None => unreachable!("pooled buffer accessed after release"),
        }
    }
}

impl Drop for PooledBuffer {
    fn drop(&mut self) {
        if let Some(buffer) = self.buffer.take() {
            self.pool_inner.release(buffer);
        }
    }
}

impl std::fmt::Debug for PooledBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledBuffer")
            .field("pool", &self.pool_inner.name)
            .field("buffer", &self.buffer)
            .finish()
    }
}

// ============================================================================
// BufferPool
// ============================================================================

/// A bounded pool of buffers drawn from one [`Allocator`].
///
/// Pools start inactive. Activation allocates `min` buffers up front;
/// further buffers are allocated on demand until `max` exist, after which
/// [`acquire`](Self::acquire) blocks and [`try_acquire`](Self::try_acquire)
/// reports would-block. Pools must be deactivated before they are dropped.
pub struct BufferPool {
    inner: Arc<PoolInner>,
}

/// Shared pool state (referenced by both pool and pooled buffers).
struct PoolInner {
    name: String,
    allocator: Arc<dyn Allocator>,
    flags: MemoryFlags,
    layout: Vec<SegmentSpec>,
    named: bool,
    min: usize,
    max: usize,
    buffer_size: usize,
    state: Mutex<PoolState>,
    notify: Condvar,
    acquisitions: AtomicU64,
    waits: AtomicU64,
}

struct PoolState {
    active: bool,
    idle: Vec<SegmentedBuffer>,
    /// Buffers that exist or are being allocated.
    allocated: usize,
}

impl BufferPool {
    /// Create an inactive pool.
    ///
    /// `names` is either empty (a single segment allocated with
    /// [`Allocator::alloc`]) or parallel to `sizes`.
    pub fn create(
        allocator: Arc<dyn Allocator>,
        min_buffers: usize,
        max_buffers: usize,
        flags: MemoryFlags,
        sizes: &[usize],
        names: &[&str],
    ) -> Result<Self> {
        if max_buffers == 0 || min_buffers > max_buffers {
            return Err(Error::InvalidArgument(format!(
                "pool bounds must satisfy 0 < max and min <= max (min {min_buffers}, max {max_buffers})"
            )));
        }
        if sizes.is_empty() {
            return Err(Error::InvalidArgument("pool needs at least one segment size".into()));
        }
        let named = !names.is_empty();
        if named && names.len() != sizes.len() {
            return Err(Error::InvalidArgument(format!(
                "{} segment names for {} sizes",
                names.len(),
                sizes.len()
            )));
        }
        if !named && sizes.len() > 1 {
            return Err(Error::InvalidArgument(
                "multiple segment sizes need segment names".into(),
            ));
        }

        let layout: Vec<SegmentSpec> = if named {
            names
                .iter()
                .zip(sizes)
                .map(|(name, &size)| SegmentSpec::new(*name, size))
                .collect()
        } else {
            vec![SegmentSpec::new(super::defaults::PARENT_SEGMENT, sizes[0])]
        };
        let buffer_size = sizes
            .iter()
            .try_fold(0usize, |acc, &size| acc.checked_add(size))
            .ok_or_else(|| Error::InvalidArgument("pool buffer size overflows".into()))?;

        Ok(Self {
            inner: Arc::new(PoolInner {
                name: format!("{}-pool", allocator.name()),
                allocator,
                flags,
                layout,
                named,
                min: min_buffers,
                max: max_buffers,
                buffer_size,
                state: Mutex::new(PoolState {
                    active: false,
                    idle: Vec::with_capacity(max_buffers),
                    allocated: 0,
                }),
                notify: Condvar::new(),
                acquisitions: AtomicU64::new(0),
                waits: AtomicU64::new(0),
            }),
        })
    }

    /// Activate or deactivate the pool.
    ///
    /// Activation allocates `min` buffers; if any allocation fails the pool
    /// stays inactive and the error is returned. Deactivation frees idle
    /// buffers, wakes blocked acquirers, and causes buffers still in use to
    /// be freed when they are returned.
    pub fn set_active(&self, active: bool) -> Result<()> {
        let inner = &self.inner;
        let mut state = inner.lock();
        if state.active == active {
            return Ok(());
        }

        if active {
            let mut fresh = Vec::with_capacity(inner.min.saturating_sub(state.idle.len()));
            while state.idle.len() + fresh.len() < inner.min {
                fresh.push(inner.allocate()?);
            }
            state.allocated += fresh.len();
            state.idle.extend(fresh);
            state.active = true;
            let available = state.idle.len();
            drop(state);
            observability::record_pool_available(&inner.name, available);
            tracing::debug!(pool = %inner.name, buffers = available, "pool activated");
        } else {
            state.active = false;
            let idle = std::mem::take(&mut state.idle);
            state.allocated -= idle.len();
            drop(state);
            for buffer in idle {
                inner.allocator.free(buffer);
            }
            inner.notify.notify_all();
            observability::record_pool_available(&inner.name, 0);
            tracing::debug!(pool = %inner.name, "pool deactivated");
        }
        Ok(())
    }

    /// Whether the pool hands out buffers.
    pub fn is_active(&self) -> bool {
        self.inner.lock().active
    }

    /// Acquire a buffer, blocking until one is returned if `max` are in use.
    pub fn acquire(&self) -> Result<PooledBuffer> {
        self.acquire_until(None)?
            .ok_or_else(|| Error::InvalidState("pool acquire woke without a buffer".into()))
    }

    /// Acquire a buffer without blocking.
    ///
    /// Returns `Ok(None)` when `max` buffers are already in use.
    pub fn try_acquire(&self) -> Result<Option<PooledBuffer>> {
        let guard = self.inner.lock();
        Ok(self.take(guard)?.ok())
    }

    /// Acquire with a timeout. Returns `Ok(None)` if it expires first.
    ///
    /// A timeout too large to form a deadline blocks like [`acquire`](Self::acquire).
    pub fn acquire_timeout(&self, timeout: Duration) -> Result<Option<PooledBuffer>> {
        self.acquire_until(Instant::now().checked_add(timeout))
    }

    fn acquire_until(&self, deadline: Option<Instant>) -> Result<Option<PooledBuffer>> {
        let mut guard = self.inner.lock();
        let mut waited = false;
        loop {
            match self.take(guard)? {
                Ok(buffer) => return Ok(Some(buffer)),
                Err(g) => guard = g,
            }

            if !waited {
                waited = true;
                self.inner.waits.fetch_add(1, Ordering::Relaxed);
                observability::record_pool_wait(&self.inner.name);
            }

            guard = match deadline {
                None => self
                    .inner
                    .notify
                    .wait(guard)
                    .unwrap_or_else(PoisonError::into_inner),
                Some(deadline) => {
                    let remaining = deadline.saturating_duration_since(Instant::now());
                    if remaining.is_zero() {
                        return Ok(None);
                    }
                    self.inner
                        .notify
                        .wait_timeout(guard, remaining)
                        .unwrap_or_else(PoisonError::into_inner)
                        .0
                }
            };
        }
    }

    /// Hand out an idle buffer or allocate a new one under the bound.
    ///
    /// Gives the guard back when nothing can be handed out right now.
    fn take<'a>(
        &'a self,
        mut state: MutexGuard<'a, PoolState>,
    ) -> Result<std::result::Result<PooledBuffer, MutexGuard<'a, PoolState>>> {
        if !state.active {
            return Err(Error::PoolInactive);
        }

        let buffer = if let Some(buffer) = state.idle.pop() {
            buffer
        } else if state.allocated < self.inner.max {
            state.allocated += 1;
            drop(state);
            match self.inner.allocate() {
                Ok(buffer) => buffer,
                Err(e) => {
                    self.inner.lock().allocated -= 1;
                    self.inner.notify.notify_one();
                    return Err(e);
                }
            }
        } else {
            return Ok(Err(state));
        };

        self.inner.acquisitions.fetch_add(1, Ordering::Relaxed);
        observability::record_pool_acquisition(&self.inner.name);
        Ok(Ok(PooledBuffer {
            buffer: Some(buffer),
            pool_inner: self.inner.clone(),
        }))
    }

    /// Get pool statistics.
    pub fn stats(&self) -> PoolStats {
        let state = self.inner.lock();
        PoolStats {
            min: self.inner.min,
            max: self.inner.max,
            allocated: state.allocated,
            available: state.idle.len(),
            in_use: state.allocated - state.idle.len(),
            acquisitions: self.inner.acquisitions.load(Ordering::Relaxed),
            waits: self.inner.waits.load(Ordering::Relaxed),
        }
    }

    /// Size of every buffer (sum of the segment sizes).
    pub fn buffer_size(&self) -> usize {
        self.inner.buffer_size
    }

    /// Idle buffers.
    pub fn available(&self) -> usize {
        self.inner.lock().idle.len()
    }

    /// Segment layout of every buffer.
    pub fn layout(&self) -> &[SegmentSpec] {
        &self.inner.layout
    }

    /// Flags buffers are allocated with.
    pub fn flags(&self) -> MemoryFlags {
        self.inner.flags
    }

    /// Debug name.
    pub fn name(&self) -> &str {
        &self.inner.name
    }
}

impl PoolInner {
    fn lock(&self) -> MutexGuard<'_, PoolState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn allocate(&self) -> Result<SegmentedBuffer> {
        if self.named {
            self.allocator.alloc_segments(self.flags, &self.layout)
        } else {
            self.allocator.alloc(self.flags, self.buffer_size)
        }
    }

    fn release(&self, buffer: SegmentedBuffer) {
        let mut state = self.lock();
        if state.active {
            state.idle.push(buffer);
            drop(state);
        } else {
            state.allocated -= 1;
            drop(state);
            self.allocator.free(buffer);
        }
        self.notify.notify_one();
    }
}

impl Drop for BufferPool {
    fn drop(&mut self) {
        if self.is_active() {
            tracing::warn!(pool = %self.inner.name, "buffer pool dropped while active");
            if let Err(e) = self.set_active(false) {
                tracing::warn!(pool = %self.inner.name, error = %e, "deactivation failed");
            }
        }
        self.inner.notify.notify_all();
    }
}

impl std::fmt::Debug for BufferPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BufferPool")
            .field("name", &self.inner.name)
            .field("buffer_size", &self.inner.buffer_size)
            .field("stats", &self.stats())
            .finish()
    }
}
