//! Observability features: metrics and tracing.
//!
//! ## Metrics
//!
//! | Metric | Type | Description |
//! |--------|------|-------------|
//! | `edgeflow_allocations` | Counter | Physical buffers allocated, by target |
//! | `edgeflow_allocation_failures` | Counter | Failed allocations, by target |
//! | `edgeflow_pool_acquisitions` | Counter | Buffers handed out, by pool |
//! | `edgeflow_pool_waits` | Counter | Acquisitions that blocked, by pool |
//! | `edgeflow_pool_buffers_available` | Gauge | Idle buffers, by pool |
//! | `edgeflow_id_cache_hits` | Counter | Id lookups served from cache |
//! | `edgeflow_id_cache_misses` | Counter | Id lookups that attached |
//! | `edgeflow_id_cache_bypasses` | Counter | Id lookups past a full cache |
//! | `edgeflow_jobs_dispatched` | Counter | Jobs posted, by domain |
//! | `edgeflow_job_failures` | Counter | Failed jobs, by domain and error |
//! | `edgeflow_job_duration_ns` | Histogram | Post to completion time |
//!
//! Nothing is exported unless the application installs a `metrics` recorder.
//!
//! ## Tracing
//!
//! Dispatchers run inside a `stage` span; each job gets a `job` span.

mod metrics;
mod tracing_support;

pub use metrics::{
    StageMetrics, init_metrics, record_allocation, record_allocation_failure,
    record_id_cache_bypass, record_id_cache_hit, record_id_cache_miss, record_pool_acquisition,
    record_pool_available, record_pool_wait,
};
pub use tracing_support::{span_job, span_stage};
