//! Jobs and request ids.

use crate::config::{ComputeDomain, StageConfig};
use crate::error::{Error, Result};
use crate::memory::defaults::JOB_TIMEOUT;
use crate::memory::{Segment, SegmentedBuffer};
use smallvec::SmallVec;
use std::fmt;
use std::time::Duration;

const FNV_OFFSET_BASIS: u32 = 2_166_136_261;
const FNV_PRIME: u32 = 16_777_619;

/// 32-bit FNV-1a hash.
pub fn fnv1a32(bytes: &[u8]) -> u32 {
    bytes.iter().fold(FNV_OFFSET_BASIS, |hash, &b| {
        (hash ^ u32::from(b)).wrapping_mul(FNV_PRIME)
    })
}

// =============================================================================
// RequestId
// =============================================================================

/// Identifier correlating a posted job with its completion.
///
/// The high 32 bits hash the stage and stream, the low 32 bits carry the
/// frame number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RequestId(pub u64);

impl RequestId {
    /// Derive the id of the job `node` runs on `frame` of `stream`.
    pub fn derive(node: &str, stream: &str, frame: u64) -> Self {
        let mut key = Vec::with_capacity(node.len() + stream.len());
        key.extend_from_slice(node.as_bytes());
        key.extend_from_slice(stream.as_bytes());
        let hash = u64::from(fnv1a32(&key));
        RequestId(hash << 32 | (frame & 0xFFFF_FFFF))
    }

    /// Frame number (low 32 bits).
    pub fn frame(self) -> u32 {
        self.0 as u32
    }

    /// Hash of stage and stream (high 32 bits).
    pub fn stage_hash(self) -> u32 {
        (self.0 >> 32) as u32
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#018x}", self.0)
    }
}

// =============================================================================
// Bindings
// =============================================================================

/// Whether a domain reads or writes a bound region.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BufferDirection {
    /// Read by the job.
    Input,
    /// Written by the job.
    Output,
}

/// Physical region bound to a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferBinding {
    /// Physical address of the region.
    pub phys_addr: u64,
    /// Size in bytes.
    pub size: usize,
    /// Read or written.
    pub direction: BufferDirection,
}

impl BufferBinding {
    /// An input region.
    pub fn input(phys_addr: u64, size: usize) -> Self {
        Self {
            phys_addr,
            size,
            direction: BufferDirection::Input,
        }
    }

    /// An output region.
    pub fn output(phys_addr: u64, size: usize) -> Self {
        Self {
            phys_addr,
            size,
            direction: BufferDirection::Output,
        }
    }

    /// Bind a whole segment.
    pub fn from_segment(segment: &Segment, direction: BufferDirection) -> Self {
        Self {
            phys_addr: segment.phys_addr(),
            size: segment.size(),
            direction,
        }
    }
}

/// A binding and the name the domain knows it by.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NamedBinding {
    /// Binding name.
    pub name: String,
    /// Region.
    pub binding: BufferBinding,
}

// =============================================================================
// Payload
// =============================================================================

/// Domain-specific part of a job.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum JobPayload {
    /// Host jobs need nothing beyond their bindings.
    #[default]
    Host,
    /// A vector graph invocation.
    Vector {
        /// Graph to run.
        graph_id: u32,
        /// Graph-specific request kind.
        request_type: u32,
    },
    /// A model invocation.
    Accelerator {
        /// Loaded model handle, or the stage's model when empty.
        model: Option<u64>,
        /// Samples in this job.
        batch_size: usize,
        /// Samples per model invocation.
        batch_model: usize,
        /// Bytes per input sample.
        in_tensor_size: usize,
        /// Bytes per output sample.
        out_tensor_size: usize,
    },
}

impl JobPayload {
    /// Payload a stage configured by `config` runs with.
    pub fn for_stage(config: &StageConfig) -> Self {
        match config.domain {
            ComputeDomain::Host => JobPayload::Host,
            ComputeDomain::Vector => JobPayload::Vector {
                graph_id: config.graph_id,
                request_type: 0,
            },
            ComputeDomain::Accelerator => JobPayload::Accelerator {
                model: None,
                batch_size: config.batch_size,
                batch_model: config.batch_model,
                in_tensor_size: config.in_tensor_size,
                out_tensor_size: config.out_tensor_size,
            },
        }
    }

    /// Domain this payload is meant for.
    pub fn domain(&self) -> ComputeDomain {
        match self {
            JobPayload::Host => ComputeDomain::Host,
            JobPayload::Vector { .. } => ComputeDomain::Vector,
            JobPayload::Accelerator { .. } => ComputeDomain::Accelerator,
        }
    }
}

// =============================================================================
// Job
// =============================================================================

/// One unit of work for a compute domain.
///
/// # Example
///
/// ```rust,ignore
/// let job = Job::new(ComputeDomain::Vector, meta.request_id("detess"))
///     .with_input("ifm0", BufferBinding::input(input.phys_addr(), input.size()))
///     .with_output_buffer(&output)
///     .with_payload(JobPayload::Vector { graph_id: 7, request_type: 0 });
/// ```
#[derive(Debug, Clone)]
pub struct Job {
    domain: ComputeDomain,
    request_id: RequestId,
    bindings: SmallVec<[NamedBinding; 4]>,
    timeout: Duration,
    payload: JobPayload,
}

impl Job {
    /// Create a job with no bindings.
    pub fn new(domain: ComputeDomain, request_id: RequestId) -> Self {
        let payload = match domain {
            ComputeDomain::Host => JobPayload::Host,
            ComputeDomain::Vector => JobPayload::Vector {
                graph_id: 0,
                request_type: 0,
            },
            ComputeDomain::Accelerator => JobPayload::Accelerator {
                model: None,
                batch_size: 1,
                batch_model: 1,
                in_tensor_size: 0,
                out_tensor_size: 0,
            },
        };
        Self {
            domain,
            request_id,
            bindings: SmallVec::new(),
            timeout: JOB_TIMEOUT,
            payload,
        }
    }

    /// Create a job carrying the payload and timeout of a configured stage.
    pub fn for_stage(config: &StageConfig, request_id: RequestId) -> Self {
        Self::new(config.domain, request_id)
            .with_payload(JobPayload::for_stage(config))
            .with_timeout(config.timeout)
    }

    /// Bind an input region.
    pub fn with_input(self, name: impl Into<String>, binding: BufferBinding) -> Self {
        self.with_binding(name, binding, BufferDirection::Input)
    }

    /// Bind an output region.
    pub fn with_output(self, name: impl Into<String>, binding: BufferBinding) -> Self {
        self.with_binding(name, binding, BufferDirection::Output)
    }

    /// Bind every segment of `buffer` as an output, under its segment name.
    pub fn with_output_buffer(mut self, buffer: &SegmentedBuffer) -> Self {
        for segment in buffer.segments() {
            self = self.with_binding(
                segment.name(),
                BufferBinding::from_segment(segment, BufferDirection::Output),
                BufferDirection::Output,
            );
        }
        self
    }

    fn with_binding(
        mut self,
        name: impl Into<String>,
        mut binding: BufferBinding,
        direction: BufferDirection,
    ) -> Self {
        binding.direction = direction;
        let name = name.into();
        match self.bindings.iter_mut().find(|b| b.name == name) {
            Some(existing) => existing.binding = binding,
            None => self.bindings.push(NamedBinding { name, binding }),
        }
        self
    }

    /// Set the completion timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Set the domain-specific payload.
    pub fn with_payload(mut self, payload: JobPayload) -> Self {
        self.payload = payload;
        self
    }

    /// Domain this job targets.
    pub fn domain(&self) -> ComputeDomain {
        self.domain
    }

    /// Request id.
    pub fn request_id(&self) -> RequestId {
        self.request_id
    }

    /// Completion timeout.
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Domain-specific payload.
    pub fn payload(&self) -> &JobPayload {
        &self.payload
    }

    /// All bindings, in the order added.
    pub fn bindings(&self) -> &[NamedBinding] {
        &self.bindings
    }

    /// Input bindings, in order.
    pub fn inputs(&self) -> impl Iterator<Item = &NamedBinding> {
        self.bindings
            .iter()
            .filter(|b| b.binding.direction == BufferDirection::Input)
    }

    /// Output bindings, in order.
    pub fn outputs(&self) -> impl Iterator<Item = &NamedBinding> {
        self.bindings
            .iter()
            .filter(|b| b.binding.direction == BufferDirection::Output)
    }

    /// Input binding by name.
    pub fn input(&self, name: &str) -> Option<&BufferBinding> {
        self.inputs().find(|b| b.name == name).map(|b| &b.binding)
    }

    /// Output binding by name.
    pub fn output(&self, name: &str) -> Option<&BufferBinding> {
        self.outputs().find(|b| b.name == name).map(|b| &b.binding)
    }

    /// First output binding.
    pub fn primary_output(&self) -> Option<&NamedBinding> {
        self.outputs().next()
    }

    /// First input binding.
    pub fn primary_input(&self) -> Option<&NamedBinding> {
        self.inputs().next()
    }

    /// Binding `name`, which must exist with the given direction.
    pub fn require(&self, name: &str, direction: BufferDirection) -> Result<&BufferBinding> {
        let named = self
            .bindings
            .iter()
            .find(|b| b.name == name)
            .ok_or_else(|| Error::ConfigMismatch(format!("job has no binding '{name}'")))?;
        if named.binding.direction != direction {
            return Err(Error::ConfigMismatch(format!(
                "binding '{name}' is {:?}, expected {direction:?}",
                named.binding.direction
            )));
        }
        Ok(&named.binding)
    }
}
