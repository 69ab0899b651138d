//! Job dispatch to the host, vector and accelerator domains.
//!
//! Every stage owns one [`Dispatcher`]. The dispatcher accepts a [`Job`],
//! hands it to its compute domain and blocks in
//! [`wait_done`](Dispatcher::wait_done) until the domain reports back. All
//! domain status codes are translated into [`DispatchError`].
//!
//! # Architecture
//!
//! - [`StageDispatcher`]: lifecycle, metrics, output pool and dumps, shared
//!   by all domains
//! - [`DomainRuntime`]: what differs per domain ([`HostRuntime`],
//!   [`VectorRuntime`], [`AcceleratorRuntime`])
//! - [`Engine`] and [`Transport`]: the boundary to external runtimes and
//!   firmware
//!
//! # Lifecycle
//!
//! ```text
//! Uninitialized --init--> Ready --post--> Waiting --wait_done--> Ready
//!       |                   |
//!       +------fini---------+-----fini--> Finalized
//! ```
//!
//! # Example
//!
//! ```rust,ignore
//! let ctx = DispatchContext::new(registry, device, Backend::Vector(engine));
//! let mut dispatcher = create_dispatcher(config, ctx)?;
//! dispatcher.init()?;
//!
//! let output = dispatcher.output_pool().unwrap().acquire()?;
//! let job = dispatcher.make_job(meta.request_id(dispatcher.node()))
//!     .with_input("ifm0", input)
//!     .with_output_buffer(&output);
//! dispatcher.run(&job)?;
//! ```

mod accelerator;
mod batch;
mod completion;
mod engine;
mod firmware;
mod host;
mod job;
mod stage;
mod transport;
mod vector;

pub use accelerator::{AcceleratorDispatcher, AcceleratorRuntime};
pub use batch::{BatchInvocation, BatchSpec, InvocationKind, plan_batches};
pub use completion::{CompletionBoard, CompletionHandle};
pub use engine::{Engine, EngineRequest, HostRequest, Kernel, ThreadEngine, VectorRequest};
pub use firmware::{RunLog, RunRecord, SimulatedAccelerator};
pub use host::{HostDispatcher, HostRuntime};
pub use job::{BufferBinding, BufferDirection, Job, JobPayload, NamedBinding, RequestId, fnv1a32};
pub use stage::StageResources;
pub use transport::{ChannelTransport, FirmwareService, Opcode, Param, Request, Response, Transport};
pub use vector::{VectorDispatcher, VectorRuntime};

use crate::config::{ComputeDomain, StageConfig};
use crate::error::{DispatchError, Error, Result};
use crate::memory::{AllocatorRegistry, BufferPool, MemoryDevice, SegmentedBuffer};
use crate::observability::{self, StageMetrics};
use std::sync::Arc;
use std::time::{Duration, Instant};

// =============================================================================
// Dispatcher
// =============================================================================

/// Lifecycle state of a dispatcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatcherState {
    /// Created, not yet initialized.
    Uninitialized,
    /// Initialized and idle.
    Ready,
    /// Submitting a job.
    Posting,
    /// A job is in flight.
    Waiting,
    /// Torn down.
    Finalized,
}

/// A finished job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Completion {
    /// Request that completed.
    pub request_id: RequestId,
    /// Time from post to completion.
    pub elapsed: Duration,
}

/// Per-stage job submission to one compute domain.
pub trait Dispatcher: Send {
    /// Domain jobs are sent to.
    fn domain(&self) -> ComputeDomain;

    /// Stage name.
    fn node(&self) -> &str;

    /// Stage configuration.
    fn config(&self) -> &StageConfig;

    /// Current lifecycle state.
    fn state(&self) -> DispatcherState;

    /// Initialize the domain and allocate the output pool.
    fn init(&mut self) -> Result<()>;

    /// Submit a job. At most one job is in flight.
    fn post(&mut self, job: &Job) -> Result<RequestId>;

    /// Block until the posted job completes or times out.
    fn wait_done(&mut self, request_id: RequestId) -> Result<Completion>;

    /// Tear down the domain and release the output pool.
    fn fini(&mut self) -> Result<()>;

    /// Pool output buffers are drawn from, once initialized.
    fn output_pool(&self) -> Option<&BufferPool>;

    /// Input loaded from the configured debug file, once initialized.
    fn debug_input(&self) -> Option<&SegmentedBuffer>;

    /// Post a job and wait for it.
    fn run(&mut self, job: &Job) -> Result<Completion> {
        let request_id = self.post(job)?;
        self.wait_done(request_id)
    }

    /// Start a job with this stage's payload and timeout.
    fn make_job(&self, request_id: RequestId) -> Job {
        Job::for_stage(self.config(), request_id)
    }
}

/// The domain-specific half of a dispatcher.
pub trait DomainRuntime: Send {
    /// Domain served.
    fn domain(&self) -> ComputeDomain;

    /// Open the domain for this stage.
    fn init(&mut self, _config: &StageConfig) -> Result<()> {
        Ok(())
    }

    /// Hand `job` to the domain.
    fn submit(&mut self, job: &Job) -> Result<()>;

    /// Wait for the submitted `job` to finish.
    fn complete(&mut self, job: &Job) -> Result<()>;

    /// Close the domain.
    fn fini(&mut self) -> Result<()> {
        Ok(())
    }
}

struct InFlight {
    job: Job,
    posted: Instant,
}

/// Dispatcher for any domain, parameterized by its runtime.
pub struct StageDispatcher<R: DomainRuntime> {
    config: StageConfig,
    runtime: R,
    registry: Arc<AllocatorRegistry>,
    device: Arc<dyn MemoryDevice>,
    resources: Option<StageResources>,
    state: DispatcherState,
    in_flight: Option<InFlight>,
    metrics: StageMetrics,
    span: tracing::Span,
}

impl<R: DomainRuntime> StageDispatcher<R> {
    /// Create an uninitialized dispatcher.
    pub fn new(
        config: StageConfig,
        runtime: R,
        registry: Arc<AllocatorRegistry>,
        device: Arc<dyn MemoryDevice>,
    ) -> Result<Self> {
        if runtime.domain() != config.domain {
            return Err(Error::ConfigMismatch(format!(
                "stage '{}' is configured for {} but its runtime serves {}",
                config.node_name,
                config.domain,
                runtime.domain()
            )));
        }
        Ok(Self {
            metrics: StageMetrics::new(&config.node_name, config.domain),
            span: observability::span_stage(&config.node_name, config.domain),
            config,
            runtime,
            registry,
            device,
            resources: None,
            state: DispatcherState::Uninitialized,
            in_flight: None,
        })
    }

    /// The domain runtime.
    pub fn runtime(&self) -> &R {
        &self.runtime
    }

    fn invalid(&self, op: &str) -> Error {
        Error::InvalidState(format!(
            "{op} on stage '{}' in state {:?}",
            self.config.node_name, self.state
        ))
    }

    fn record_failure(&self, error: &Error) {
        if let Some(e) = error.dispatch_error() {
            self.metrics.record_failed(e);
        }
    }
}

impl<R: DomainRuntime> Dispatcher for StageDispatcher<R> {
    fn domain(&self) -> ComputeDomain {
        self.config.domain
    }

    fn node(&self) -> &str {
        &self.config.node_name
    }

    fn config(&self) -> &StageConfig {
        &self.config
    }

    fn state(&self) -> DispatcherState {
        self.state
    }

    fn init(&mut self) -> Result<()> {
        let _guard = self.span.clone().entered();
        if self.state != DispatcherState::Uninitialized {
            return Err(self.invalid("init"));
        }
        self.config.validate()?;

        let mut resources =
            StageResources::prepare(&self.config, self.registry.clone(), self.device.clone())?;
        self.runtime.init(&self.config)?;
        if let Err(e) = resources.activate() {
            if let Err(fini) = self.runtime.fini() {
                tracing::warn!(error = %fini, "closing domain after failed init");
            }
            return Err(e);
        }

        self.resources = Some(resources);
        self.state = DispatcherState::Ready;
        tracing::debug!("dispatcher ready");
        Ok(())
    }

    fn post(&mut self, job: &Job) -> Result<RequestId> {
        let _guard = self.span.clone().entered();
        if self.state != DispatcherState::Ready {
            return Err(self.invalid("post"));
        }
        if job.domain() != self.config.domain || job.payload().domain() != self.config.domain {
            let error = Error::Dispatch(DispatchError::MalformedJob);
            self.record_failure(&error);
            return Err(error);
        }

        let request_id = job.request_id();
        let _job = observability::span_job(&self.config.node_name, request_id).entered();
        self.state = DispatcherState::Posting;
        if let Err(e) = self.runtime.submit(job) {
            self.state = DispatcherState::Ready;
            tracing::debug!(error = %e, "post failed");
            self.record_failure(&e);
            return Err(e);
        }

        self.in_flight = Some(InFlight {
            job: job.clone(),
            posted: Instant::now(),
        });
        self.state = DispatcherState::Waiting;
        self.metrics.record_dispatched();
        Ok(request_id)
    }

    fn wait_done(&mut self, request_id: RequestId) -> Result<Completion> {
        let _guard = self.span.clone().entered();
        if self.state != DispatcherState::Waiting {
            return Err(self.invalid("wait_done"));
        }
        match &self.in_flight {
            Some(in_flight) if in_flight.job.request_id() == request_id => {}
            _ => {
                return Err(Error::InvalidState(format!(
                    "request {request_id} is not in flight on stage '{}'",
                    self.config.node_name
                )));
            }
        }
        let Some(InFlight { job, posted }) = self.in_flight.take() else {
            return Err(self.invalid("wait_done"));
        };

        let _job = observability::span_job(&self.config.node_name, request_id).entered();
        let result = self.runtime.complete(&job);
        self.state = DispatcherState::Ready;
        if let Err(e) = result {
            tracing::debug!(error = %e, "job failed");
            self.record_failure(&e);
            return Err(e);
        }

        let elapsed = posted.elapsed();
        self.metrics.record_completed(elapsed);
        if let Some(resources) = &self.resources
            && let Err(e) = resources.dump_output(&job)
        {
            tracing::warn!(error = %e, "dumping output failed");
        }
        Ok(Completion {
            request_id,
            elapsed,
        })
    }

    fn fini(&mut self) -> Result<()> {
        let _guard = self.span.clone().entered();
        match self.state {
            DispatcherState::Uninitialized => {}
            DispatcherState::Ready => self.runtime.fini()?,
            _ => return Err(self.invalid("fini")),
        }
        if let Some(mut resources) = self.resources.take() {
            resources.release()?;
        }
        self.state = DispatcherState::Finalized;
        tracing::debug!("dispatcher finalized");
        Ok(())
    }

    fn output_pool(&self) -> Option<&BufferPool> {
        self.resources.as_ref().and_then(StageResources::output_pool)
    }

    fn debug_input(&self) -> Option<&SegmentedBuffer> {
        self.resources.as_ref().and_then(StageResources::debug_input)
    }
}

impl<R: DomainRuntime> std::fmt::Debug for StageDispatcher<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StageDispatcher")
            .field("node", &self.config.node_name)
            .field("domain", &self.config.domain)
            .field("state", &self.state)
            .finish()
    }
}

// =============================================================================
// Construction
// =============================================================================

/// Connection to the runtime of one domain.
#[derive(Clone)]
pub enum Backend {
    /// Host runtime.
    Host(Arc<dyn Engine>),
    /// Vector runtime.
    Vector(Arc<dyn Engine>),
    /// Accelerator firmware.
    Accelerator(Arc<dyn Transport>),
}

impl Backend {
    /// Domain this backend reaches.
    pub fn domain(&self) -> ComputeDomain {
        match self {
            Backend::Host(_) => ComputeDomain::Host,
            Backend::Vector(_) => ComputeDomain::Vector,
            Backend::Accelerator(_) => ComputeDomain::Accelerator,
        }
    }
}

impl std::fmt::Debug for Backend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("Backend").field(&self.domain()).finish()
    }
}

/// Everything besides configuration a dispatcher is built from.
#[derive(Clone)]
pub struct DispatchContext {
    /// Allocators, shared by all stages.
    pub registry: Arc<AllocatorRegistry>,
    /// Physical memory.
    pub device: Arc<dyn MemoryDevice>,
    /// Domain runtime.
    pub backend: Backend,
}

impl DispatchContext {
    /// Bundle a context.
    pub fn new(registry: Arc<AllocatorRegistry>, device: Arc<dyn MemoryDevice>, backend: Backend) -> Self {
        Self {
            registry,
            device,
            backend,
        }
    }
}

/// Build the dispatcher for `config.domain`.
pub fn create_dispatcher(config: StageConfig, ctx: DispatchContext) -> Result<Box<dyn Dispatcher>> {
    observability::init_metrics();
    if ctx.backend.domain() != config.domain {
        return Err(Error::ConfigMismatch(format!(
            "stage '{}' is configured for {} but was given a {} backend",
            config.node_name,
            config.domain,
            ctx.backend.domain()
        )));
    }
    let DispatchContext {
        registry,
        device,
        backend,
    } = ctx;
    Ok(match backend {
        Backend::Host(engine) => Box::new(HostDispatcher::new(
            config,
            HostRuntime::new(engine),
            registry,
            device,
        )?),
        Backend::Vector(engine) => Box::new(VectorDispatcher::new(
            config,
            VectorRuntime::new(engine),
            registry,
            device,
        )?),
        Backend::Accelerator(transport) => Box::new(AcceleratorDispatcher::new(
            config,
            AcceleratorRuntime::new(transport),
            registry,
            device,
        )?),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::SimDevice;

    fn context(backend: Backend) -> DispatchContext {
        DispatchContext::new(Arc::new(AllocatorRegistry::new()), SimDevice::new(), backend)
    }

    fn host_engine() -> Arc<dyn Engine> {
        ThreadEngine::spawn("host", 4, |_: &EngineRequest| 0).unwrap()
    }

    fn host_config() -> StageConfig {
        StageConfig::new("host", ComputeDomain::Host).with_output_size(256)
    }

    fn host_job(dispatcher: &dyn Dispatcher, frame: u64) -> Job {
        let output = dispatcher.output_pool().unwrap().try_acquire().unwrap().unwrap();
        dispatcher
            .make_job(RequestId::derive("host", "s", frame))
            .with_input("ifm0", BufferBinding::input(0x1000, 16))
            .with_output("ofm0", BufferBinding::output(output.phys_addr(), output.size()))
    }

    #[test]
    fn test_backend_domain_must_match() {
        let err = create_dispatcher(
            StageConfig::new("v", ComputeDomain::Vector).with_output_size(64),
            context(Backend::Host(host_engine())),
        )
        .err().expect("expected error");
        assert!(matches!(err, Error::ConfigMismatch(_)));
    }

    #[test]
    fn test_lifecycle() {
        let mut dispatcher = create_dispatcher(host_config(), context(Backend::Host(host_engine()))).unwrap();
        assert_eq!(dispatcher.state(), DispatcherState::Uninitialized);
        assert!(dispatcher.output_pool().is_none());

        dispatcher.init().unwrap();
        assert_eq!(dispatcher.state(), DispatcherState::Ready);
        assert!(matches!(dispatcher.init(), Err(Error::InvalidState(_))));

        let job = host_job(dispatcher.as_ref(), 1);
        let id = dispatcher.post(&job).unwrap();
        assert_eq!(dispatcher.state(), DispatcherState::Waiting);
        assert!(matches!(dispatcher.post(&job), Err(Error::InvalidState(_))));
        assert!(matches!(dispatcher.fini(), Err(Error::InvalidState(_))));

        let done = dispatcher.wait_done(id).unwrap();
        assert_eq!(done.request_id, id);
        assert_eq!(dispatcher.state(), DispatcherState::Ready);
        assert!(matches!(dispatcher.wait_done(id), Err(Error::InvalidState(_))));

        dispatcher.fini().unwrap();
        assert_eq!(dispatcher.state(), DispatcherState::Finalized);
        assert!(dispatcher.output_pool().is_none());
        assert!(matches!(dispatcher.fini(), Err(Error::InvalidState(_))));
    }

    #[test]
    fn test_wait_for_other_request_rejected() {
        let mut dispatcher = create_dispatcher(host_config(), context(Backend::Host(host_engine()))).unwrap();
        dispatcher.init().unwrap();
        let job = host_job(dispatcher.as_ref(), 1);
        let id = dispatcher.post(&job).unwrap();

        assert!(matches!(dispatcher.wait_done(RequestId(id.0 + 1)), Err(Error::InvalidState(_))));
        assert!(dispatcher.wait_done(id).is_ok());
    }

    #[test]
    fn test_post_before_init_rejected() {
        let mut dispatcher = create_dispatcher(host_config(), context(Backend::Host(host_engine()))).unwrap();
        let job = Job::new(ComputeDomain::Host, RequestId(1));
        assert!(matches!(dispatcher.post(&job), Err(Error::InvalidState(_))));
        dispatcher.fini().unwrap();
    }

    #[test]
    fn test_wrong_domain_job_is_malformed() {
        let mut dispatcher = create_dispatcher(host_config(), context(Backend::Host(host_engine()))).unwrap();
        dispatcher.init().unwrap();
        let job = Job::new(ComputeDomain::Vector, RequestId(1));
        let err = dispatcher.post(&job).unwrap_err();
        assert_eq!(err.dispatch_error(), Some(DispatchError::MalformedJob));
        assert_eq!(dispatcher.state(), DispatcherState::Ready);
    }

    #[test]
    fn test_failed_job_leaves_dispatcher_ready() {
        let engine: Arc<dyn Engine> = ThreadEngine::spawn("host", 4, |r: &EngineRequest| {
            if r.request_id().frame() == 1 { libc::ETIMEDOUT } else { 0 }
        })
        .unwrap();
        let mut dispatcher = create_dispatcher(host_config(), context(Backend::Host(engine))).unwrap();
        dispatcher.init().unwrap();

        let job = host_job(dispatcher.as_ref(), 1);
        let err = dispatcher.run(&job).unwrap_err();
        assert_eq!(err.dispatch_error(), Some(DispatchError::Timeout));
        assert_eq!(dispatcher.state(), DispatcherState::Ready);

        let job = host_job(dispatcher.as_ref(), 2);
        assert!(dispatcher.run(&job).is_ok());
    }
}
