//! Accelerator-domain dispatch over the firmware transport.
//!
//! Init opens a driver handle and loads the stage's model. A job is cut into
//! invocations by [`plan_batches`]; all but the last are run and waited on
//! during post, the last is waited on in `wait_done`.

use super::batch::{BatchInvocation, BatchSpec, InvocationKind, plan_batches};
use super::job::{Job, JobPayload};
use super::transport::{Opcode, Param, Request, Transport};
use super::{DomainRuntime, StageDispatcher};
use crate::config::{ComputeDomain, StageConfig};
use crate::error::{DispatchError, Error, Result};
use crate::memory::defaults::JOB_TIMEOUT;
use std::sync::Arc;
use std::time::Duration;

/// Dispatcher for accelerator stages.
pub type AcceleratorDispatcher = StageDispatcher<AcceleratorRuntime>;

impl AcceleratorDispatcher {
    /// Query the firmware status word.
    pub fn status(&self) -> Result<u32> {
        self.runtime().status()
    }
}

/// Drives accelerator firmware through a [`Transport`].
pub struct AcceleratorRuntime {
    transport: Arc<dyn Transport>,
    driver: Option<u64>,
    model: Option<u64>,
    timeout: Duration,
}

impl AcceleratorRuntime {
    /// Create a runtime over `transport`. Nothing is opened until init.
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self {
            transport,
            driver: None,
            model: None,
            timeout: JOB_TIMEOUT,
        }
    }

    /// Loaded model handle, once initialized.
    pub fn model(&self) -> Option<u64> {
        self.model
    }

    /// Query the firmware status word.
    pub fn status(&self) -> Result<u32> {
        if self.driver.is_none() {
            return Err(DispatchError::DriverHandleError.into());
        }
        let outputs = self.call(Opcode::GetStatus, Vec::new(), self.timeout)?;
        outputs
            .first()
            .and_then(Param::as_u32)
            .ok_or(Error::Dispatch(DispatchError::MessageLost))
    }

    fn call(
        &self,
        opcode: Opcode,
        params: Vec<Param>,
        timeout: Duration,
    ) -> std::result::Result<Vec<Param>, DispatchError> {
        self.transport.rpc(Request::new(opcode, params), timeout)?.into_result()
    }

    fn handle_output(outputs: &[Param]) -> std::result::Result<u64, DispatchError> {
        outputs
            .first()
            .and_then(Param::as_u64)
            .ok_or(DispatchError::MessageLost)
    }

    fn invoke(&self, model: u64, invocation: &BatchInvocation, timeout: Duration) -> Result<()> {
        let inputs = Param::AddrList(invocation.inputs.to_vec());
        let outputs = Param::AddrList(invocation.outputs.to_vec());
        let (opcode, params) = match invocation.kind {
            InvocationKind::Single => (Opcode::RunModel, vec![Param::U64(model), inputs, outputs]),
            InvocationKind::Native => {
                let samples =
                    u32::try_from(invocation.samples).map_err(|_| DispatchError::InvalidArgument)?;
                (
                    Opcode::RunBatchModel,
                    vec![Param::U64(model), Param::U32(samples), inputs, outputs],
                )
            }
        };
        tracing::trace!(?opcode, samples = invocation.samples, "running model");
        self.call(opcode, params, timeout)?;
        Ok(())
    }

    fn plan(&self, job: &Job) -> Result<(u64, Vec<BatchInvocation>)> {
        let JobPayload::Accelerator {
            model,
            batch_size,
            batch_model,
            in_tensor_size,
            out_tensor_size,
        } = *job.payload()
        else {
            return Err(DispatchError::MalformedJob.into());
        };
        let model = model.or(self.model).ok_or(DispatchError::DriverHandleError)?;

        let (Some(input), Some(output)) = (job.primary_input(), job.primary_output()) else {
            tracing::debug!("accelerator job needs an input and an output");
            return Err(DispatchError::MalformedJob.into());
        };
        let spec = BatchSpec {
            batch_size,
            batch_model,
            input_base: input.binding.phys_addr,
            output_base: output.binding.phys_addr,
            in_tensor_size,
            out_tensor_size,
        };
        let (Some(needed_input), Some(needed_output)) = (spec.input_bytes(), spec.output_bytes()) else {
            tracing::debug!(batch_size, in_tensor_size, out_tensor_size, "accelerator batch size overflows");
            return Err(DispatchError::MalformedJob.into());
        };
        if input.binding.size < needed_input || output.binding.size < needed_output {
            tracing::debug!(
                input = input.binding.size,
                needed_input,
                output = output.binding.size,
                needed_output,
                "accelerator buffers smaller than the batch"
            );
            return Err(DispatchError::MalformedJob.into());
        }
        Ok((model, plan_batches(&spec)?))
    }
}

impl DomainRuntime for AcceleratorRuntime {
    fn domain(&self) -> ComputeDomain {
        ComputeDomain::Accelerator
    }

    fn init(&mut self, config: &StageConfig) -> Result<()> {
        self.timeout = config.timeout;
        let path = config.model_path.as_ref().ok_or_else(|| {
            Error::ConfigMismatch(format!("stage '{}' has no model", config.node_name))
        })?;

        let driver = Self::handle_output(&self.call(Opcode::GetHandle, Vec::new(), self.timeout)?)?;
        let outputs = self.call(
            Opcode::LoadModel,
            vec![
                Param::U64(driver),
                Param::Bytes(path.as_os_str().as_encoded_bytes().to_vec()),
            ],
            self.timeout,
        );
        let model = match outputs {
            Ok(outputs) => Self::handle_output(&outputs)?,
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "loading model failed");
                return Err(e.into());
            }
        };

        self.driver = Some(driver);
        self.model = Some(model);
        tracing::debug!(driver, model, path = %path.display(), "model loaded");
        Ok(())
    }

    fn submit(&mut self, job: &Job) -> Result<()> {
        let (model, plan) = self.plan(job)?;
        let timeout = job.timeout();
        let Some((last, rest)) = plan.split_last() else {
            return Err(DispatchError::MalformedJob.into());
        };
        for invocation in rest {
            self.invoke(model, invocation, timeout)?;
            self.call(Opcode::WaitDone, Vec::new(), timeout)?;
        }
        self.invoke(model, last, timeout)
    }

    fn complete(&mut self, job: &Job) -> Result<()> {
        self.call(Opcode::WaitDone, Vec::new(), job.timeout())?;
        Ok(())
    }

    fn fini(&mut self) -> Result<()> {
        if let (Some(driver), Some(model)) = (self.driver.take(), self.model.take()) {
            tracing::debug!(driver, model, "accelerator closed");
        }
        Ok(())
    }
}

impl std::fmt::Debug for AcceleratorRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AcceleratorRuntime")
            .field("driver", &self.driver)
            .field("model", &self.model)
            .finish_non_exhaustive()
    }
}
