//! Boundary to the host and vector runtimes.
//!
//! An [`Engine`] accepts requests and completes them later through a
//! [`CompletionHandle`]. [`ThreadEngine`] is the in-process implementation:
//! a worker thread fed by a bounded channel runs a [`Kernel`] per request.

use super::completion::CompletionHandle;
use super::job::{BufferBinding, NamedBinding, RequestId};
use crate::error::{DispatchError, Result};
use crate::memory::defaults::ENGINE_QUEUE_DEPTH;
use kanal::{Receiver, Sender};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::thread::JoinHandle;

// =============================================================================
// Requests
// =============================================================================

/// A host job as its runtime sees it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostRequest {
    /// Request id.
    pub request_id: RequestId,
    /// Stage that posted the job.
    pub node: String,
    /// Every binding of the job.
    pub bindings: Vec<NamedBinding>,
}

/// A vector graph invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VectorRequest {
    /// Request id.
    pub request_id: RequestId,
    /// Graph to run.
    pub graph_id: u32,
    /// Primary input.
    pub input: BufferBinding,
    /// Primary output.
    pub output: BufferBinding,
    /// Bindings beyond the primary input and output.
    pub aux: Vec<NamedBinding>,
    /// Graph-specific request kind.
    pub request_type: u32,
}

/// Anything an engine can be asked to run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineRequest {
    /// Host runtime request.
    Host(HostRequest),
    /// Vector runtime request.
    Vector(VectorRequest),
}

impl EngineRequest {
    /// Request id.
    pub fn request_id(&self) -> RequestId {
        match self {
            EngineRequest::Host(r) => r.request_id,
            EngineRequest::Vector(r) => r.request_id,
        }
    }
}

// =============================================================================
// Engine and Kernel
// =============================================================================

/// A compute runtime that completes requests asynchronously.
pub trait Engine: Send + Sync {
    /// Engine name for logs.
    fn name(&self) -> &str;

    /// Queue a request. `done` must be completed exactly once.
    fn submit(&self, request: EngineRequest, done: CompletionHandle) -> std::result::Result<(), DispatchError>;
}

/// Work a [`ThreadEngine`] performs per request.
///
/// Returns an errno-style status: 0 on success.
pub trait Kernel: Send + Sync + 'static {
    /// Execute one request.
    fn run(&self, request: &EngineRequest) -> i32;
}

impl<F> Kernel for F
where
    F: Fn(&EngineRequest) -> i32 + Send + Sync + 'static,
{
    fn run(&self, request: &EngineRequest) -> i32 {
        self(request)
    }
}

type Submission = (EngineRequest, CompletionHandle);

/// Engine backed by one worker thread.
///
/// # Example
///
/// ```rust,ignore
/// let engine = ThreadEngine::spawn("vector", 8, |request: &EngineRequest| 0)?;
/// ```
pub struct ThreadEngine {
    name: String,
    sender: Option<Sender<Submission>>,
    worker: Option<JoinHandle<()>>,
}

impl ThreadEngine {
    /// Start a worker with the default queue depth.
    pub fn start<K: Kernel>(name: impl Into<String>, kernel: K) -> Result<Arc<Self>> {
        Self::spawn(name, ENGINE_QUEUE_DEPTH, kernel)
    }

    /// Start a worker that runs `kernel`, accepting up to `depth` queued
    /// requests.
    pub fn spawn<K: Kernel>(name: impl Into<String>, depth: usize, kernel: K) -> Result<Arc<Self>> {
        let name = name.into();
        let (sender, receiver) = kanal::bounded::<Submission>(depth.max(1));
        let worker = std::thread::Builder::new()
            .name(format!("edgeflow-{name}"))
            .spawn(move || serve(receiver, kernel))?;
        tracing::debug!(engine = %name, depth, "engine started");
        Ok(Arc::new(Self {
            name,
            sender: Some(sender),
            worker: Some(worker),
        }))
    }

    /// Requests waiting for the worker.
    pub fn queued(&self) -> usize {
        self.sender.as_ref().map_or(0, |s| s.len())
    }

    /// Requests the queue holds before submissions fail with `QueueFull`.
    pub fn depth(&self) -> usize {
        self.sender.as_ref().map_or(0, |s| s.capacity())
    }
}

fn serve<K: Kernel>(receiver: Receiver<Submission>, kernel: K) {
    while let Ok((request, done)) = receiver.recv() {
        let status = catch_unwind(AssertUnwindSafe(|| kernel.run(&request))).unwrap_or_else(|_| {
            tracing::error!(request_id = %request.request_id(), "kernel panicked");
            DispatchError::OperatorException.errno()
        });
        done.complete(status);
    }
}

impl Engine for ThreadEngine {
    fn name(&self) -> &str {
        &self.name
    }

    fn submit(&self, request: EngineRequest, done: CompletionHandle) -> std::result::Result<(), DispatchError> {
        let sender = self.sender.as_ref().ok_or(DispatchError::MessageLost)?;
        match sender.try_send((request, done)) {
            Ok(true) => Ok(()),
            Ok(false) => Err(DispatchError::QueueFull),
            Err(_) => Err(DispatchError::MessageLost),
        }
    }
}

impl Drop for ThreadEngine {
    fn drop(&mut self) {
        // Dropping the sender ends the worker loop once the queue drains.
        self.sender.take();
        if let Some(worker) = self.worker.take()
            && worker.join().is_err()
        {
            tracing::warn!(engine = %self.name, "engine worker exited abnormally");
        }
    }
}

impl std::fmt::Debug for ThreadEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ThreadEngine")
            .field("name", &self.name)
            .field("queued", &self.queued())
            .finish()
    }
}
