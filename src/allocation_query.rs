//! Allocation negotiation between neighbouring stages.
//!
//! A downstream stage answers its upstream neighbour's allocation query with
//! the memory target and cache policy it wants its input buffers in. The
//! strings are the ones the media framework already uses, so hints can be
//! exchanged with existing stages unchanged.

use crate::memory::{CachePolicy, MemoryFlags, MemoryTarget};

/// Name of the structure carried by the allocation query.
pub const QUERY_NAME: &str = "simaai-allocation-meta";

/// Field holding the memory target.
pub const MEMORY_TYPE_FIELD: &str = "memory_type";

/// Field holding the cache policy.
pub const MEMORY_FLAG_FIELD: &str = "memory_flag";

const TARGET_PREFIX: &str = "GST_SIMAAI_MEMORY_TARGET_";
const FLAG_PREFIX: &str = "GST_SIMAAI_MEMORY_FLAG_";

/// Where a stage wants its input buffers allocated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct AllocationHint {
    /// Requested memory target.
    pub target: MemoryTarget,
    /// Requested cache policy.
    pub cache: CachePolicy,
}

impl AllocationHint {
    /// Create a hint.
    pub fn new(target: MemoryTarget, cache: CachePolicy) -> Self {
        Self { target, cache }
    }

    /// The `memory_type` and `memory_flag` field values.
    pub fn to_fields(&self) -> (String, String) {
        (
            format!("{TARGET_PREFIX}{}", self.target.as_str()),
            format!("{FLAG_PREFIX}{}", self.cache.as_str()),
        )
    }

    /// Parse the field values of a received query.
    ///
    /// Unrecognized values fall back to `Generic` and `Default`.
    pub fn from_fields(memory_type: &str, memory_flag: &str) -> Self {
        let target = memory_type
            .strip_prefix(TARGET_PREFIX)
            .and_then(MemoryTarget::from_name)
            .unwrap_or_else(|| {
                tracing::warn!(memory_type, "unknown memory type in allocation query, using GENERIC");
                MemoryTarget::Generic
            });
        let cache = memory_flag
            .strip_prefix(FLAG_PREFIX)
            .and_then(CachePolicy::from_name)
            .unwrap_or_else(|| {
                tracing::warn!(memory_flag, "unknown memory flag in allocation query, using DEFAULT");
                CachePolicy::Default
            });
        Self { target, cache }
    }

    /// Allocation flags for this hint.
    pub fn flags(&self) -> MemoryFlags {
        MemoryFlags::new(self.target, self.cache)
    }
}

impl From<MemoryFlags> for AllocationHint {
    fn from(flags: MemoryFlags) -> Self {
        Self::new(flags.target(), flags.cache_policy())
    }
}
