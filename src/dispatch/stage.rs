//! Resources every dispatcher owns regardless of domain.
//!
//! - the output pool, sized and placed for the next stage;
//! - the standalone debug input;
//! - output dumps.

use super::job::Job;
use crate::config::{OutputLayout, StageConfig};
use crate::error::{Error, Result};
use crate::memory::{
    AllocatorRegistry, BufferPool, CachePolicy, MemoryDevice, MemoryFlags, PhysicalMemoryHandle,
    SegmentedBuffer,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Output pool, debug input and dump settings of one stage.
pub struct StageResources {
    node: String,
    device: Arc<dyn MemoryDevice>,
    pool: Option<BufferPool>,
    debug_input_path: Option<PathBuf>,
    debug_input: Option<SegmentedBuffer>,
    debug_flags: MemoryFlags,
    registry: Arc<AllocatorRegistry>,
    dump_dir: Option<PathBuf>,
}

impl StageResources {
    /// Create the (inactive) output pool described by `config`.
    pub fn prepare(
        config: &StageConfig,
        registry: Arc<AllocatorRegistry>,
        device: Arc<dyn MemoryDevice>,
    ) -> Result<Self> {
        let count = config.output_buffer_count();
        let flags = MemoryFlags::new(config.output_target(), config.output_cache);

        let pool = match &config.output {
            OutputLayout::Single(size) => {
                BufferPool::create(registry.contiguous(&device), count, count, flags, &[*size], &[])?
            }
            OutputLayout::Segments(specs) => {
                let sizes: Vec<usize> = specs.iter().map(|s| s.size).collect();
                let names: Vec<&str> = specs.iter().map(|s| s.name.as_str()).collect();
                BufferPool::create(registry.segmented(&device), count, count, flags, &sizes, &names)?
            }
        };

        tracing::debug!(
            node = %config.node_name,
            buffers = count,
            size = config.output.total_size(),
            memory = %config.output_target(),
            cache = %config.output_cache,
            "output pool prepared"
        );

        Ok(Self {
            node: config.node_name.clone(),
            device,
            pool: Some(pool),
            debug_input_path: config.debug_input.clone(),
            debug_input: None,
            debug_flags: MemoryFlags::new(config.domain.memory_target(), CachePolicy::Default),
            registry,
            dump_dir: config.dump_data.then(|| config.dump_dir.clone()),
        })
    }

    /// Activate the pool and load the debug input, if configured.
    pub fn activate(&mut self) -> Result<()> {
        if let Some(path) = self.debug_input_path.clone() {
            self.debug_input = Some(self.load_debug_input(&path)?);
        }
        match &self.pool {
            Some(pool) => pool.set_active(true),
            None => Err(Error::InvalidState(format!(
                "stage '{}' resources were released",
                self.node
            ))),
        }
    }

    fn load_debug_input(&self, path: &Path) -> Result<SegmentedBuffer> {
        let bytes = std::fs::read(path)?;
        if bytes.is_empty() {
            return Err(Error::InvalidArgument(format!(
                "debug input {} is empty",
                path.display()
            )));
        }
        let mut buffer = self
            .registry
            .contiguous(&self.device)
            .alloc(self.debug_flags, bytes.len())?;
        let mut view = buffer.map_mut()?;
        view.as_mut_slice()[..bytes.len()].copy_from_slice(&bytes);
        view.unmap()?;
        tracing::debug!(
            node = %self.node,
            path = %path.display(),
            size = bytes.len(),
            phys = buffer.phys_addr(),
            "loaded debug input"
        );
        Ok(buffer)
    }

    /// The output pool, until released.
    pub fn output_pool(&self) -> Option<&BufferPool> {
        self.pool.as_ref()
    }

    /// The standalone input buffer, if one was loaded.
    pub fn debug_input(&self) -> Option<&SegmentedBuffer> {
        self.debug_input.as_ref()
    }

    /// Path an output dump for `job` is written to, when dumping is on.
    pub fn dump_path(&self, job: &Job) -> Option<PathBuf> {
        self.dump_dir
            .as_ref()
            .map(|dir| dir.join(format!("{}-{}.out", self.node, job.request_id().frame())))
    }

    /// Write the primary output of a finished job to the dump directory.
    pub fn dump_output(&self, job: &Job) -> Result<()> {
        let Some(path) = self.dump_path(job) else {
            return Ok(());
        };
        let output = job
            .primary_output()
            .ok_or_else(|| Error::ConfigMismatch("job has no output to dump".into()))?;

        let handle = PhysicalMemoryHandle::attach(self.device.clone(), output.binding.phys_addr)?;
        let addr = handle.map()?;
        handle.invalidate()?;
        let len = output.binding.size.min(handle.size());
        // SAFETY: The mapping covers `handle.size()` bytes and lives as long
        // as `handle`.
        let bytes = unsafe { std::slice::from_raw_parts(addr.as_ptr(), len) };
        std::fs::write(&path, bytes)?;
        tracing::debug!(node = %self.node, path = %path.display(), size = len, "dumped output");
        Ok(())
    }

    /// Deactivate and drop the pool and free the debug input.
    pub fn release(&mut self) -> Result<()> {
        self.debug_input = None;
        if let Some(pool) = self.pool.take() {
            pool.set_active(false)?;
        }
        Ok(())
    }
}

impl Drop for StageResources {
    fn drop(&mut self) {
        if let Err(e) = self.release() {
            tracing::warn!(node = %self.node, error = %e, "releasing stage resources failed");
        }
    }
}

impl std::fmt::Debug for StageResources {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StageResources")
            .field("node", &self.node)
            .field("pool", &self.pool)
            .field("debug_input", &self.debug_input)
            .field("dump_dir", &self.dump_dir)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ComputeDomain;
    use crate::dispatch::{BufferBinding, RequestId};
    use crate::memory::{MemoryTarget, SegmentSpec, SimDevice};

    fn setup() -> (Arc<AllocatorRegistry>, Arc<dyn MemoryDevice>) {
        (Arc::new(AllocatorRegistry::new()), SimDevice::new())
    }

    #[test]
    fn test_pool_follows_config() {
        let (registry, device) = setup();
        let config = StageConfig::new("cvu", ComputeDomain::Vector)
            .with_next_domain(ComputeDomain::Accelerator)
            .with_output_size(4096)
            .with_output_cache(CachePolicy::Cached)
            .with_output_buffers(1);

        let mut stage = StageResources::prepare(&config, registry, device).unwrap();
        let pool = stage.output_pool().unwrap();
        assert!(!pool.is_active());

        stage.activate().unwrap();
        let pool = stage.output_pool().unwrap();
        let stats = pool.stats();
        assert_eq!((stats.min, stats.max), (2, 2));
        assert_eq!(pool.flags().target(), MemoryTarget::Dms0);
        assert_eq!(pool.flags().cache_policy(), CachePolicy::Cached);

        stage.release().unwrap();
        assert!(stage.output_pool().is_none());
    }

    #[test]
    fn test_segmented_outputs_use_segment_allocator() {
        let (registry, device) = setup();
        let config = StageConfig::new("host", ComputeDomain::Host)
            .with_output_segments(vec![SegmentSpec::new("ofm0", 128), SegmentSpec::new("ofm1", 64)]);

        let mut stage = StageResources::prepare(&config, registry.clone(), device).unwrap();
        stage.activate().unwrap();
        let buffer = stage.output_pool().unwrap().acquire().unwrap();
        assert_eq!(buffer.segment_names().collect::<Vec<_>>(), ["ofm0", "ofm1"]);
        assert!(registry.get(crate::memory::SEGMENT_ALLOCATOR).is_some());
    }

    #[test]
    fn test_debug_input_placement() {
        let (registry, device) = setup();
        let file = tempfile::NamedTempFile::new().unwrap();
        std::fs::write(file.path(), b"0123456789").unwrap();

        let config = StageConfig::new("cvu", ComputeDomain::Vector)
            .with_output_size(64)
            .with_debug_input(file.path());
        let mut stage = StageResources::prepare(&config, registry, device).unwrap();
        stage.activate().unwrap();

        let input = stage.debug_input().unwrap();
        assert_eq!(input.target(), MemoryTarget::Ev74);
        assert_eq!(input.size(), 10);
        assert_eq!(input.map().unwrap().as_slice(), b"0123456789");
    }

    #[test]
    fn test_dump_output() {
        let (registry, device) = setup();
        let dir = tempfile::tempdir().unwrap();
        let config = StageConfig::new("mla", ComputeDomain::Host)
            .with_output_size(8)
            .with_dump_dir(dir.path());
        let mut stage = StageResources::prepare(&config, registry, device).unwrap();
        stage.activate().unwrap();

        let mut buffer = stage.output_pool().unwrap().acquire().unwrap();
        buffer.map_mut().unwrap().as_mut_slice().copy_from_slice(b"outbytes");
        let job = Job::new(ComputeDomain::Host, RequestId::derive("mla", "s", 12))
            .with_output("parent", BufferBinding::output(buffer.phys_addr(), 8));

        stage.dump_output(&job).unwrap();
        let path = dir.path().join("mla-12.out");
        assert_eq!(stage.dump_path(&job).unwrap(), path);
        assert_eq!(std::fs::read(path).unwrap(), b"outbytes");
    }
}
