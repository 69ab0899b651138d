//! # edgeflow
//!
//! Physical-memory buffers and per-domain job dispatch for edge AI
//! accelerators with a host core, a vector core and a matrix accelerator.
//!
//! ## Features
//!
//! - **Physical buffers**: contiguous and segmented allocations on every
//!   memory target, with explicit cache maintenance
//! - **Bounded pools**: min/max buffer pools that block or fail fast
//! - **Buffer-id cache**: attach to buffers published by other stages
//! - **Dispatchers**: one lifecycle for host, vector and accelerator jobs,
//!   including accelerator batching
//! - **Simulation**: [`memory::SimDevice`] and
//!   [`dispatch::SimulatedAccelerator`] stand in for the hardware
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use edgeflow::prelude::*;
//!
//! let device = SimDevice::new();
//! let registry = Arc::new(AllocatorRegistry::new());
//! let config = StageConfig::new("preproc", ComputeDomain::Vector)
//!     .with_next_domain(ComputeDomain::Accelerator)
//!     .with_output_size(640 * 480 * 3);
//!
//! let ctx = DispatchContext::new(registry, device, Backend::Vector(engine));
//! let mut dispatcher = create_dispatcher(config, ctx)?;
//! dispatcher.init()?;
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_op_in_unsafe_fn)]

pub mod allocation_query;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod memory;
pub mod metadata;
pub mod observability;

/// Prelude for convenient imports
pub mod prelude {
    pub use crate::config::{ComputeDomain, OutputLayout, StageConfig};
    pub use crate::dispatch::{
        Backend, BufferBinding, DispatchContext, Dispatcher, Job, JobPayload, RequestId,
        create_dispatcher,
    };
    pub use crate::error::{DispatchError, Error, Result};
    pub use crate::memory::{
        AllocatorRegistry, BufferIdCache, BufferPool, CachePolicy, MemoryDevice, MemoryFlags,
        MemoryTarget, SegmentSpec, SegmentedBuffer, SimDevice,
    };
    pub use crate::metadata::{FrameMeta, Metadata};
}

pub use error::{DispatchError, Error, Result};
