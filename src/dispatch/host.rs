//! Host-domain dispatch.

use super::completion::CompletionBoard;
use super::engine::{Engine, EngineRequest, HostRequest};
use super::job::Job;
use super::{DomainRuntime, StageDispatcher};
use crate::config::{ComputeDomain, StageConfig};
use crate::error::{DispatchError, Result};
use std::sync::Arc;

/// Dispatcher for host stages.
pub type HostDispatcher = StageDispatcher<HostRuntime>;

/// Posts jobs to a host engine.
pub struct HostRuntime {
    engine: Arc<dyn Engine>,
    board: Arc<CompletionBoard>,
    node: String,
}

impl HostRuntime {
    /// Create a runtime over `engine`.
    pub fn new(engine: Arc<dyn Engine>) -> Self {
        Self {
            engine,
            board: CompletionBoard::new(),
            node: String::new(),
        }
    }
}

impl DomainRuntime for HostRuntime {
    fn domain(&self) -> ComputeDomain {
        ComputeDomain::Host
    }

    fn init(&mut self, config: &StageConfig) -> Result<()> {
        self.node = config.node_name.clone();
        tracing::debug!(engine = self.engine.name(), "host runtime attached");
        Ok(())
    }

    fn submit(&mut self, job: &Job) -> Result<()> {
        let request = EngineRequest::Host(HostRequest {
            request_id: job.request_id(),
            node: self.node.clone(),
            bindings: job.bindings().to_vec(),
        });
        submit(&*self.engine, &self.board, request)
    }

    fn complete(&mut self, job: &Job) -> Result<()> {
        wait(&self.board, job)
    }
}

/// Submit to an engine, tracking completion on `board`.
pub(super) fn submit(engine: &dyn Engine, board: &Arc<CompletionBoard>, request: EngineRequest) -> Result<()> {
    let id = request.request_id();
    let handle = board.register(id)?;
    if let Err(e) = engine.submit(request, handle) {
        board.cancel(id);
        return Err(e.into());
    }
    Ok(())
}

/// Wait for `job` on `board` and translate its status.
pub(super) fn wait(board: &CompletionBoard, job: &Job) -> Result<()> {
    match board.wait(job.request_id(), job.timeout())? {
        0 => Ok(()),
        errno => Err(DispatchError::from_errno(errno).into()),
    }
}
