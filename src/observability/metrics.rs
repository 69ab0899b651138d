//! Metrics collection using metrics-rs.

use crate::config::ComputeDomain;
use crate::error::DispatchError;
use crate::memory::MemoryTarget;
use metrics::{Counter, Histogram, Unit, counter, gauge, histogram};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

/// Whether metrics have been initialized.
static METRICS_INITIALIZED: AtomicBool = AtomicBool::new(false);

const ALLOCATIONS: &str = "edgeflow_allocations";
const ALLOCATION_FAILURES: &str = "edgeflow_allocation_failures";
const POOL_ACQUISITIONS: &str = "edgeflow_pool_acquisitions";
const POOL_WAITS: &str = "edgeflow_pool_waits";
const POOL_BUFFERS_AVAILABLE: &str = "edgeflow_pool_buffers_available";
const ID_CACHE_HITS: &str = "edgeflow_id_cache_hits";
const ID_CACHE_MISSES: &str = "edgeflow_id_cache_misses";
const ID_CACHE_BYPASSES: &str = "edgeflow_id_cache_bypasses";
const JOBS_DISPATCHED: &str = "edgeflow_jobs_dispatched";
const JOB_FAILURES: &str = "edgeflow_job_failures";
const JOB_DURATION_NS: &str = "edgeflow_job_duration_ns";

/// Initialize metrics descriptions.
///
/// Safe to call multiple times (subsequent calls are no-ops).
pub fn init_metrics() {
    if METRICS_INITIALIZED.swap(true, Ordering::SeqCst) {
        return;
    }

    metrics::describe_counter!(ALLOCATIONS, Unit::Count, "Physical buffers allocated");
    metrics::describe_counter!(
        ALLOCATION_FAILURES,
        Unit::Count,
        "Physical allocations that failed"
    );
    metrics::describe_counter!(
        POOL_ACQUISITIONS,
        Unit::Count,
        "Buffers handed out by pools"
    );
    metrics::describe_counter!(
        POOL_WAITS,
        Unit::Count,
        "Acquisitions that blocked on an empty pool"
    );
    metrics::describe_gauge!(
        POOL_BUFFERS_AVAILABLE,
        Unit::Count,
        "Idle buffers in a pool"
    );
    metrics::describe_counter!(ID_CACHE_HITS, Unit::Count, "Buffer id lookups served from cache");
    metrics::describe_counter!(
        ID_CACHE_MISSES,
        Unit::Count,
        "Buffer id lookups that attached and mapped"
    );
    metrics::describe_counter!(
        ID_CACHE_BYPASSES,
        Unit::Count,
        "Buffer id lookups mapped without caching"
    );
    metrics::describe_counter!(JOBS_DISPATCHED, Unit::Count, "Jobs posted to a compute domain");
    metrics::describe_counter!(JOB_FAILURES, Unit::Count, "Jobs that failed, by error");
    metrics::describe_histogram!(
        JOB_DURATION_NS,
        Unit::Nanoseconds,
        "Time from post to completion"
    );
}

/// Record a successful physical allocation.
#[inline]
pub fn record_allocation(target: MemoryTarget) {
    counter!(ALLOCATIONS, "target" => target.as_str()).increment(1);
}

/// Record a failed physical allocation.
#[inline]
pub fn record_allocation_failure(target: MemoryTarget) {
    counter!(ALLOCATION_FAILURES, "target" => target.as_str()).increment(1);
}

/// Record idle buffers in a pool.
#[inline]
pub fn record_pool_available(pool: &str, available: usize) {
    gauge!(POOL_BUFFERS_AVAILABLE, "pool" => pool.to_string()).set(available as f64);
}

/// Record a buffer handed out by a pool.
#[inline]
pub fn record_pool_acquisition(pool: &str) {
    counter!(POOL_ACQUISITIONS, "pool" => pool.to_string()).increment(1);
}

/// Record an acquisition that had to wait.
#[inline]
pub fn record_pool_wait(pool: &str) {
    counter!(POOL_WAITS, "pool" => pool.to_string()).increment(1);
}

/// Record an id cache hit.
#[inline]
pub fn record_id_cache_hit() {
    counter!(ID_CACHE_HITS).increment(1);
}

/// Record an id cache miss.
#[inline]
pub fn record_id_cache_miss() {
    counter!(ID_CACHE_MISSES).increment(1);
}

/// Record a lookup that bypassed a full id cache.
#[inline]
pub fn record_id_cache_bypass() {
    counter!(ID_CACHE_BYPASSES).increment(1);
}

/// Metrics for one stage, with labels bound once.
#[derive(Clone)]
pub struct StageMetrics {
    node: String,
    domain: ComputeDomain,
    dispatched: Counter,
    duration: Histogram,
}

impl StageMetrics {
    /// Create a collector for the stage `node`.
    pub fn new(node: &str, domain: ComputeDomain) -> Self {
        Self {
            node: node.to_string(),
            domain,
            dispatched: counter!(
                JOBS_DISPATCHED,
                "domain" => domain.as_str(),
                "node" => node.to_string()
            ),
            duration: histogram!(
                JOB_DURATION_NS,
                "domain" => domain.as_str(),
                "node" => node.to_string()
            ),
        }
    }

    /// Record a posted job.
    #[inline]
    pub fn record_dispatched(&self) {
        self.dispatched.increment(1);
    }

    /// Record a completed job.
    #[inline]
    pub fn record_completed(&self, elapsed: Duration) {
        self.duration.record(elapsed.as_nanos() as f64);
    }

    /// Record a failed job.
    #[inline]
    pub fn record_failed(&self, error: DispatchError) {
        counter!(
            JOB_FAILURES,
            "domain" => self.domain.as_str(),
            "node" => self.node.clone(),
            "error" => error.as_str()
        )
        .increment(1);
    }

    /// Stage name.
    pub fn node(&self) -> &str {
        &self.node
    }
}

impl std::fmt::Debug for StageMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StageMetrics")
            .field("node", &self.node)
            .field("domain", &self.domain)
            .finish()
    }
}
