//! Vector-domain dispatch.
//!
//! A vector job names one input binding (`input_name` in the stage config)
//! and writes its primary output. Every other binding is passed along as an
//! auxiliary buffer.

use super::completion::CompletionBoard;
use super::engine::{Engine, EngineRequest, VectorRequest};
use super::host::{submit, wait};
use super::job::{BufferDirection, Job, JobPayload};
use super::{DomainRuntime, StageDispatcher};
use crate::config::{ComputeDomain, DEFAULT_INPUT_NAME, StageConfig};
use crate::error::{DispatchError, Error, Result};
use std::sync::Arc;

/// Dispatcher for vector stages.
pub type VectorDispatcher = StageDispatcher<VectorRuntime>;

/// Posts graph invocations to a vector engine.
pub struct VectorRuntime {
    engine: Arc<dyn Engine>,
    board: Arc<CompletionBoard>,
    input_name: String,
}

impl VectorRuntime {
    /// Create a runtime over `engine`.
    pub fn new(engine: Arc<dyn Engine>) -> Self {
        Self {
            engine,
            board: CompletionBoard::new(),
            input_name: DEFAULT_INPUT_NAME.to_string(),
        }
    }

    fn request(&self, job: &Job) -> Result<VectorRequest> {
        let JobPayload::Vector {
            graph_id,
            request_type,
        } = *job.payload()
        else {
            return Err(DispatchError::MalformedJob.into());
        };
        let input = *job.require(&self.input_name, BufferDirection::Input)?;
        let primary = job
            .primary_output()
            .ok_or_else(|| Error::ConfigMismatch("vector job has no output".into()))?;
        let aux = job
            .bindings()
            .iter()
            .filter(|b| b.name != self.input_name && b.name != primary.name)
            .cloned()
            .collect();

        Ok(VectorRequest {
            request_id: job.request_id(),
            graph_id,
            input,
            output: primary.binding,
            aux,
            request_type,
        })
    }
}

impl DomainRuntime for VectorRuntime {
    fn domain(&self) -> ComputeDomain {
        ComputeDomain::Vector
    }

    fn init(&mut self, config: &StageConfig) -> Result<()> {
        self.input_name = config.input_name.clone();
        tracing::debug!(
            engine = self.engine.name(),
            graph_id = config.graph_id,
            input = %self.input_name,
            "vector runtime attached"
        );
        Ok(())
    }

    fn submit(&mut self, job: &Job) -> Result<()> {
        let request = self.request(job)?;
        submit(&*self.engine, &self.board, EngineRequest::Vector(request))
    }

    fn complete(&mut self, job: &Job) -> Result<()> {
        wait(&self.board, job)
    }
}
