//! Memory targets and cache policy flags.

use bitflags::bitflags;
use std::fmt;

/// Physical memory region a buffer is allocated against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum MemoryTarget {
    /// General-purpose DRAM visible to the host.
    #[default]
    Generic,
    /// On-chip memory.
    Ocm,
    /// Accelerator scratch region 0.
    Dms0,
    /// Accelerator scratch region 1.
    Dms1,
    /// Accelerator scratch region 2.
    Dms2,
    /// Accelerator scratch region 3.
    Dms3,
    /// Vector core memory.
    Ev74,
}

impl MemoryTarget {
    /// All targets, in flag resolution order.
    pub const ALL: [MemoryTarget; 7] = [
        MemoryTarget::Generic,
        MemoryTarget::Ocm,
        MemoryTarget::Dms0,
        MemoryTarget::Dms1,
        MemoryTarget::Dms2,
        MemoryTarget::Dms3,
        MemoryTarget::Ev74,
    ];

    /// Dense index, stable across releases.
    #[inline]
    pub fn index(self) -> usize {
        self as usize
    }

    /// Upper-case name used in configuration and negotiation strings.
    pub fn as_str(self) -> &'static str {
        match self {
            MemoryTarget::Generic => "GENERIC",
            MemoryTarget::Ocm => "OCM",
            MemoryTarget::Dms0 => "DMS0",
            MemoryTarget::Dms1 => "DMS1",
            MemoryTarget::Dms2 => "DMS2",
            MemoryTarget::Dms3 => "DMS3",
            MemoryTarget::Ev74 => "EV74",
        }
    }

    /// Look up a target by its upper-case name.
    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|t| t.as_str() == name)
    }

    fn flag(self) -> MemoryFlags {
        match self {
            MemoryTarget::Generic => MemoryFlags::GENERIC,
            MemoryTarget::Ocm => MemoryFlags::OCM,
            MemoryTarget::Dms0 => MemoryFlags::DMS0,
            MemoryTarget::Dms1 => MemoryFlags::DMS1,
            MemoryTarget::Dms2 => MemoryFlags::DMS2,
            MemoryTarget::Dms3 => MemoryFlags::DMS3,
            MemoryTarget::Ev74 => MemoryFlags::EV74,
        }
    }
}

impl fmt::Display for MemoryTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// CPU-side cache policy of a buffer.
///
/// `Cached` buffers need an invalidate before the CPU reads data written by
/// another domain and a flush after the CPU writes. `ReadOnly` is a
/// convention only; nothing stops a writer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum CachePolicy {
    /// Uncached mapping.
    #[default]
    Default,
    /// CPU cache enabled; explicit maintenance required.
    Cached,
    /// Immutable by convention.
    ReadOnly,
}

impl CachePolicy {
    /// All policies, in flag resolution order.
    pub const ALL: [CachePolicy; 3] = [CachePolicy::Default, CachePolicy::Cached, CachePolicy::ReadOnly];

    /// Upper-case name used in negotiation strings.
    pub fn as_str(self) -> &'static str {
        match self {
            CachePolicy::Default => "DEFAULT",
            CachePolicy::Cached => "CACHED",
            CachePolicy::ReadOnly => "RDONLY",
        }
    }

    /// Look up a policy by its upper-case name.
    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|p| p.as_str() == name)
    }

    /// Whether CPU cache maintenance is needed.
    #[inline]
    pub fn is_cached(self) -> bool {
        self == CachePolicy::Cached
    }

    fn flag(self) -> MemoryFlags {
        match self {
            CachePolicy::Default => MemoryFlags::DEFAULT,
            CachePolicy::Cached => MemoryFlags::CACHED,
            CachePolicy::ReadOnly => MemoryFlags::READ_ONLY,
        }
    }
}

impl fmt::Display for CachePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

bitflags! {
    /// Allocation request bits: one per target, one per cache policy.
    ///
    /// Callers are expected to set a single target bit and a single policy
    /// bit. When several are set, the one latest in resolution order wins.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct MemoryFlags: u32 {
        /// [`MemoryTarget::Generic`].
        const GENERIC = 1 << 0;
        /// [`MemoryTarget::Ocm`].
        const OCM = 1 << 1;
        /// [`MemoryTarget::Dms0`].
        const DMS0 = 1 << 2;
        /// [`MemoryTarget::Dms1`].
        const DMS1 = 1 << 3;
        /// [`MemoryTarget::Dms2`].
        const DMS2 = 1 << 4;
        /// [`MemoryTarget::Dms3`].
        const DMS3 = 1 << 5;
        /// [`MemoryTarget::Ev74`].
        const EV74 = 1 << 6;

        /// [`CachePolicy::Default`].
        const DEFAULT = 1 << 16;
        /// [`CachePolicy::Cached`].
        const CACHED = 1 << 17;
        /// [`CachePolicy::ReadOnly`].
        const READ_ONLY = 1 << 18;
    }
}

impl MemoryFlags {
    /// Flags for one target and one policy.
    pub fn new(target: MemoryTarget, cache: CachePolicy) -> Self {
        target.flag() | cache.flag()
    }

    /// Resolved target (last set bit wins, `Generic` when none is set).
    pub fn target(self) -> MemoryTarget {
        MemoryTarget::ALL
            .into_iter()
            .rev()
            .find(|t| self.contains(t.flag()))
            .unwrap_or_default()
    }

    /// Resolved cache policy (last set bit wins, `Default` when none is set).
    pub fn cache_policy(self) -> CachePolicy {
        CachePolicy::ALL
            .into_iter()
            .rev()
            .find(|p| self.contains(p.flag()))
            .unwrap_or_default()
    }
}

impl From<MemoryTarget> for MemoryFlags {
    fn from(target: MemoryTarget) -> Self {
        target.flag()
    }
}

impl From<CachePolicy> for MemoryFlags {
    fn from(cache: CachePolicy) -> Self {
        cache.flag()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_single_bits_resolve() {
        for target in MemoryTarget::ALL {
            for cache in CachePolicy::ALL {
                let flags = MemoryFlags::new(target, cache);
                assert_eq!(flags.target(), target);
                assert_eq!(flags.cache_policy(), cache);
            }
        }
    }

    #[test]
    fn test_empty_flags_resolve_to_defaults() {
        let flags = MemoryFlags::empty();
        assert_eq!(flags.target(), MemoryTarget::Generic);
        assert_eq!(flags.cache_policy(), CachePolicy::Default);
    }

    #[test]
    fn test_last_bit_wins() {
        let flags = MemoryFlags::OCM | MemoryFlags::EV74 | MemoryFlags::DMS1;
        assert_eq!(flags.target(), MemoryTarget::Ev74);

        let flags = MemoryFlags::READ_ONLY | MemoryFlags::CACHED;
        assert_eq!(flags.cache_policy(), CachePolicy::ReadOnly);

        let flags = MemoryFlags::DEFAULT | MemoryFlags::CACHED | MemoryFlags::GENERIC;
        assert_eq!(flags.cache_policy(), CachePolicy::Cached);
        assert_eq!(flags.target(), MemoryTarget::Generic);
    }

    #[test]
    fn test_names() {
        assert_eq!(MemoryTarget::from_name("DMS2"), Some(MemoryTarget::Dms2));
        assert_eq!(MemoryTarget::from_name("dms2"), None);
        assert_eq!(CachePolicy::from_name("RDONLY"), Some(CachePolicy::ReadOnly));
        assert_eq!(MemoryTarget::Ev74.to_string(), "EV74");
    }
}
