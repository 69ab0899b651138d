//! Limits and default sizes.
//!
//! # Usage
//!
//! ```rust,ignore
//! use edgeflow::memory::defaults;
//!
//! let segments = vec![0usize; defaults::MAX_SEGMENTS];
//! ```

use std::time::Duration;

// =============================================================================
// Buffer Layout
// =============================================================================

/// Most segments a single buffer may hold.
pub const MAX_SEGMENTS: usize = 16;

/// Name of the first segment of every buffer.
pub const PARENT_SEGMENT: &str = "parent";

// =============================================================================
// Pools and Caches
// =============================================================================

/// Fewest output buffers a stage pool is created with.
///
/// One buffer is being filled while the downstream stage reads another.
pub const MIN_POOL_SIZE: usize = 2;

/// Slots in a buffer id cache. Matches the width of the occupancy mask.
pub const ID_CACHE_CAPACITY: usize = u64::BITS as usize;

// =============================================================================
// Dispatch
// =============================================================================

/// Time a job may run before it is reported as timed out.
pub const JOB_TIMEOUT: Duration = Duration::from_secs(60);

/// Jobs a thread engine accepts before reporting a full queue.
pub const ENGINE_QUEUE_DEPTH: usize = 8;

/// Completions a board holds before new submissions are refused.
pub const COMPLETION_BOARD_DEPTH: usize = 64;

// =============================================================================
// Simulated Device Windows (bytes)
// =============================================================================

/// Generic DRAM window.
pub const SIM_GENERIC_CAPACITY: usize = 1024 * 1024 * 1024;

/// On-chip memory window.
pub const SIM_OCM_CAPACITY: usize = 4 * 1024 * 1024;

/// Each DMS window.
pub const SIM_DMS_CAPACITY: usize = 256 * 1024 * 1024;

/// Vector core window.
pub const SIM_EV74_CAPACITY: usize = 256 * 1024 * 1024;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cache_capacity_fits_mask() {
        assert_eq!(ID_CACHE_CAPACITY, 64);
        assert!(MIN_POOL_SIZE >= 2);
    }
}
