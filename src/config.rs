//! Typed stage configuration.
//!
//! Configuration reaches the crate already parsed. A [`StageConfig`] carries
//! everything one dispatcher needs: where its outputs live, how many of them
//! to keep, which model or graph to run and where to dump data for debugging.
//!
//! # Example
//!
//! ```rust,ignore
//! use edgeflow::config::{ComputeDomain, StageConfig};
//!
//! let config = StageConfig::new("detess", ComputeDomain::Accelerator)
//!     .with_next_domain(ComputeDomain::Vector)
//!     .with_output_size(1 << 20)
//!     .with_output_buffers(4)
//!     .with_model_path("/data/model.lm");
//! config.validate()?;
//! ```

use crate::error::{Error, Result};
use crate::memory::defaults::{JOB_TIMEOUT, MIN_POOL_SIZE};
use crate::memory::{CachePolicy, MemoryTarget, SegmentSpec};
use rkyv::{Archive, Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// Default name of the input binding a vector stage reads.
pub const DEFAULT_INPUT_NAME: &str = "ifm0";

/// Default directory for output dumps.
pub const DEFAULT_DUMP_DIR: &str = "/tmp";

// =============================================================================
// Compute Domain
// =============================================================================

/// Processor class that executes a stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Archive, Serialize, Deserialize)]
pub enum ComputeDomain {
    /// Host application core.
    #[default]
    Host,
    /// Vector DSP core.
    Vector,
    /// Matrix accelerator.
    Accelerator,
}

impl ComputeDomain {
    /// All domains.
    pub const ALL: [ComputeDomain; 3] = [
        ComputeDomain::Host,
        ComputeDomain::Vector,
        ComputeDomain::Accelerator,
    ];

    /// Memory target that buffers consumed by this domain are allocated on.
    pub fn memory_target(self) -> MemoryTarget {
        match self {
            ComputeDomain::Host => MemoryTarget::Generic,
            ComputeDomain::Vector => MemoryTarget::Ev74,
            ComputeDomain::Accelerator => MemoryTarget::Dms0,
        }
    }

    /// Lower-case name used in logs and metric labels.
    pub fn as_str(self) -> &'static str {
        match self {
            ComputeDomain::Host => "host",
            ComputeDomain::Vector => "vector",
            ComputeDomain::Accelerator => "accelerator",
        }
    }
}

impl fmt::Display for ComputeDomain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ComputeDomain {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "host" | "a65" | "apu" => Ok(ComputeDomain::Host),
            "vector" | "evxx" | "ev74" | "cvu" => Ok(ComputeDomain::Vector),
            "accelerator" | "mla" => Ok(ComputeDomain::Accelerator),
            _ => Err(Error::InvalidArgument(format!("unknown compute domain '{s}'"))),
        }
    }
}

// =============================================================================
// Output Layout
// =============================================================================

/// Shape of each output buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutputLayout {
    /// One unnamed region of the given size.
    Single(usize),
    /// Named segments, laid out contiguously in order.
    Segments(Vec<SegmentSpec>),
}

impl OutputLayout {
    /// Total bytes of one output buffer.
    pub fn total_size(&self) -> usize {
        match self {
            OutputLayout::Single(size) => *size,
            OutputLayout::Segments(specs) => specs.iter().fold(0, |acc, s| acc.saturating_add(s.size)),
        }
    }

    /// Whether the layout needs the multi-segment allocator.
    pub fn is_segmented(&self) -> bool {
        matches!(self, OutputLayout::Segments(_))
    }
}

impl Default for OutputLayout {
    fn default() -> Self {
        OutputLayout::Single(0)
    }
}

// =============================================================================
// Stage Configuration
// =============================================================================

/// Configuration of one pipeline stage.
#[derive(Debug, Clone, PartialEq)]
pub struct StageConfig {
    /// Stage name, used in request ids, logs and dump file names.
    pub node_name: String,
    /// Domain that executes this stage.
    pub domain: ComputeDomain,
    /// Domain of the stage consuming this stage's outputs.
    pub next_domain: ComputeDomain,
    /// Requested number of output buffers.
    pub num_output_buffers: usize,
    /// Shape of each output buffer.
    pub output: OutputLayout,
    /// Cache policy of output buffers.
    pub output_cache: CachePolicy,
    /// Input binding read by vector graphs.
    pub input_name: String,
    /// Model file loaded by accelerator stages.
    pub model_path: Option<PathBuf>,
    /// Samples per job.
    pub batch_size: usize,
    /// Samples the compiled model takes per invocation.
    pub batch_model: usize,
    /// Bytes of one input sample.
    pub in_tensor_size: usize,
    /// Bytes of one output sample.
    pub out_tensor_size: usize,
    /// Graph run by vector stages.
    pub graph_id: u32,
    /// Time a job may take.
    pub timeout: Duration,
    /// File loaded as the input in standalone runs.
    pub debug_input: Option<PathBuf>,
    /// Write every output to `dump_dir`.
    pub dump_data: bool,
    /// Directory for output dumps.
    pub dump_dir: PathBuf,
}

impl StageConfig {
    /// Create a configuration with defaults for everything but the name and
    /// domain.
    pub fn new(node_name: impl Into<String>, domain: ComputeDomain) -> Self {
        Self {
            node_name: node_name.into(),
            domain,
            next_domain: ComputeDomain::Host,
            num_output_buffers: MIN_POOL_SIZE,
            output: OutputLayout::default(),
            output_cache: CachePolicy::Default,
            input_name: DEFAULT_INPUT_NAME.to_string(),
            model_path: None,
            batch_size: 1,
            batch_model: 1,
            in_tensor_size: 0,
            out_tensor_size: 0,
            graph_id: 0,
            timeout: JOB_TIMEOUT,
            debug_input: None,
            dump_data: false,
            dump_dir: PathBuf::from(DEFAULT_DUMP_DIR),
        }
    }

    /// Set the consuming domain.
    pub fn with_next_domain(mut self, domain: ComputeDomain) -> Self {
        self.next_domain = domain;
        self
    }

    /// Set the requested output buffer count.
    pub fn with_output_buffers(mut self, count: usize) -> Self {
        self.num_output_buffers = count;
        self
    }

    /// Use single-region outputs of `size` bytes.
    pub fn with_output_size(mut self, size: usize) -> Self {
        self.output = OutputLayout::Single(size);
        self
    }

    /// Use segmented outputs.
    pub fn with_output_segments(mut self, segments: Vec<SegmentSpec>) -> Self {
        self.output = OutputLayout::Segments(segments);
        self
    }

    /// Set the output cache policy.
    pub fn with_output_cache(mut self, cache: CachePolicy) -> Self {
        self.output_cache = cache;
        self
    }

    /// Set the input binding name.
    pub fn with_input_name(mut self, name: impl Into<String>) -> Self {
        self.input_name = name.into();
        self
    }

    /// Set the model file.
    pub fn with_model_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.model_path = Some(path.into());
        self
    }

    /// Set the job and model batch sizes.
    pub fn with_batch(mut self, batch_size: usize, batch_model: usize) -> Self {
        self.batch_size = batch_size;
        self.batch_model = batch_model;
        self
    }

    /// Set per-sample tensor sizes.
    pub fn with_tensor_sizes(mut self, input: usize, output: usize) -> Self {
        self.in_tensor_size = input;
        self.out_tensor_size = output;
        self
    }

    /// Set the vector graph id.
    pub fn with_graph_id(mut self, graph_id: u32) -> Self {
        self.graph_id = graph_id;
        self
    }

    /// Set the job timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Load `path` as the input in standalone runs.
    pub fn with_debug_input(mut self, path: impl Into<PathBuf>) -> Self {
        self.debug_input = Some(path.into());
        self
    }

    /// Dump every output into `dir`.
    pub fn with_dump_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.dump_data = true;
        self.dump_dir = dir.into();
        self
    }

    /// Output buffers the pool is created with.
    pub fn output_buffer_count(&self) -> usize {
        if self.num_output_buffers < MIN_POOL_SIZE {
            tracing::warn!(
                node = %self.node_name,
                requested = self.num_output_buffers,
                using = MIN_POOL_SIZE,
                "too few output buffers requested"
            );
            return MIN_POOL_SIZE;
        }
        self.num_output_buffers
    }

    /// Memory target of output buffers.
    pub fn output_target(&self) -> MemoryTarget {
        self.next_domain.memory_target()
    }

    /// Check the configuration for internal consistency.
    pub fn validate(&self) -> Result<()> {
        if self.node_name.is_empty() {
            return Err(Error::InvalidArgument("stage has no name".into()));
        }

        match &self.output {
            OutputLayout::Single(0) => {
                return Err(Error::InvalidArgument(format!(
                    "stage '{}' has a zero-sized output",
                    self.node_name
                )));
            }
            OutputLayout::Single(_) => {}
            OutputLayout::Segments(specs) => {
                if specs.is_empty() {
                    return Err(Error::InvalidArgument(format!(
                        "stage '{}' has an empty segment layout",
                        self.node_name
                    )));
                }
                let mut seen = HashSet::new();
                for spec in specs {
                    if spec.size == 0 || spec.name.is_empty() || !seen.insert(spec.name.as_str()) {
                        return Err(Error::InvalidArgument(format!(
                            "stage '{}' has an invalid output segment '{}'",
                            self.node_name, spec.name
                        )));
                    }
                }
                if specs
                    .iter()
                    .try_fold(0usize, |acc, spec| acc.checked_add(spec.size))
                    .is_none()
                {
                    return Err(Error::InvalidArgument(format!(
                        "stage '{}' output segments overflow",
                        self.node_name
                    )));
                }
            }
        }

        if self.batch_size == 0 || self.batch_model == 0 {
            return Err(Error::InvalidArgument(format!(
                "stage '{}' has batch size {} and model batch {}",
                self.node_name, self.batch_size, self.batch_model
            )));
        }

        if self.timeout.is_zero() {
            return Err(Error::InvalidArgument(format!(
                "stage '{}' has a zero timeout",
                self.node_name
            )));
        }

        if self.domain == ComputeDomain::Accelerator {
            if self.model_path.is_none() {
                return Err(Error::ConfigMismatch(format!(
                    "accelerator stage '{}' has no model",
                    self.node_name
                )));
            }
            let needed = self
                .batch_size
                .checked_mul(self.out_tensor_size)
                .ok_or_else(|| {
                    Error::InvalidArgument(format!(
                        "stage '{}' batch output size overflows",
                        self.node_name
                    ))
                })?;
            if needed > self.output.total_size() {
                return Err(Error::ConfigMismatch(format!(
                    "stage '{}' outputs {} bytes per job into {}-byte buffers",
                    self.node_name,
                    needed,
                    self.output.total_size()
                )));
            }
        }

        if self.domain == ComputeDomain::Vector && self.input_name.is_empty() {
            return Err(Error::ConfigMismatch(format!(
                "vector stage '{}' has no input name",
                self.node_name
            )));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_domain_names() {
        for name in ["host", "A65", "apu"] {
            assert_eq!(name.parse::<ComputeDomain>().unwrap(), ComputeDomain::Host);
        }
        for name in ["vector", "evxx", "EV74", "cvu"] {
            assert_eq!(name.parse::<ComputeDomain>().unwrap(), ComputeDomain::Vector);
        }
        for name in ["accelerator", "MLA"] {
            assert_eq!(name.parse::<ComputeDomain>().unwrap(), ComputeDomain::Accelerator);
        }
        assert!("gpu".parse::<ComputeDomain>().is_err());
    }

    #[test]
    fn test_next_domain_targets() {
        assert_eq!(ComputeDomain::Vector.memory_target(), MemoryTarget::Ev74);
        assert_eq!(ComputeDomain::Accelerator.memory_target(), MemoryTarget::Dms0);
        assert_eq!(ComputeDomain::Host.memory_target(), MemoryTarget::Generic);

        let config = StageConfig::new("a", ComputeDomain::Host).with_next_domain(ComputeDomain::Vector);
        assert_eq!(config.output_target(), MemoryTarget::Ev74);
    }

    #[test]
    fn test_defaults() {
        let config = StageConfig::new("a", ComputeDomain::Vector);
        assert_eq!(config.input_name, "ifm0");
        assert_eq!(config.batch_size, 1);
        assert_eq!(config.batch_model, 1);
        assert_eq!(config.timeout, Duration::from_secs(60));
        assert_eq!(config.dump_dir, PathBuf::from("/tmp"));
        assert!(!config.dump_data);
    }

    #[test]
    fn test_output_count_clamped() {
        let config = StageConfig::new("a", ComputeDomain::Host).with_output_buffers(1);
        assert_eq!(config.output_buffer_count(), 2);
        let config = config.with_output_buffers(0);
        assert_eq!(config.output_buffer_count(), 2);
        let config = config.with_output_buffers(5);
        assert_eq!(config.output_buffer_count(), 5);
    }

    #[test]
    fn test_validate_output_layout() {
        let config = StageConfig::new("a", ComputeDomain::Host);
        assert!(matches!(config.validate(), Err(Error::InvalidArgument(_))));

        let config = config.with_output_segments(vec![
            SegmentSpec::new("ofm0", 64),
            SegmentSpec::new("ofm0", 64),
        ]);
        assert!(matches!(config.validate(), Err(Error::InvalidArgument(_))));

        let config = config.with_output_segments(vec![
            SegmentSpec::new("ofm0", 64),
            SegmentSpec::new("ofm1", 64),
        ]);
        assert!(config.validate().is_ok());
        assert_eq!(config.output.total_size(), 128);

        let config = config.with_output_segments(vec![
            SegmentSpec::new("ofm0", usize::MAX),
            SegmentSpec::new("ofm1", 64),
        ]);
        assert!(matches!(config.validate(), Err(Error::InvalidArgument(_))));
        assert_eq!(config.output.total_size(), usize::MAX);
    }

    #[test]
    fn test_validate_accelerator() {
        let config = StageConfig::new("mla", ComputeDomain::Accelerator)
            .with_output_size(4096)
            .with_tensor_sizes(1024, 1024)
            .with_batch(4, 2);
        assert!(matches!(config.validate(), Err(Error::ConfigMismatch(_))));

        let config = config.with_model_path("/models/m.lm");
        assert!(config.validate().is_ok());

        let config = config.with_batch(5, 2);
        assert!(matches!(config.validate(), Err(Error::ConfigMismatch(_))));

        let config = config.with_batch(0, 2);
        assert!(matches!(config.validate(), Err(Error::InvalidArgument(_))));

        let config = config.with_batch(usize::MAX, 2);
        assert!(matches!(config.validate(), Err(Error::InvalidArgument(_))));
    }
}
