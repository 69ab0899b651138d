//! Splitting a batched job into model invocations.
//!
//! A model is compiled for a fixed number of samples per invocation
//! (`batch_model`). A job may carry any number of samples (`batch_size`);
//! the planner cuts it into whole-model invocations plus one remainder.

use crate::error::DispatchError;
use smallvec::SmallVec;

/// Inputs to [`plan_batches`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchSpec {
    /// Samples in the job.
    pub batch_size: usize,
    /// Samples per model invocation.
    pub batch_model: usize,
    /// Physical address of the first input sample.
    pub input_base: u64,
    /// Physical address of the first output sample.
    pub output_base: u64,
    /// Bytes per input sample.
    pub in_tensor_size: usize,
    /// Bytes per output sample.
    pub out_tensor_size: usize,
}

impl BatchSpec {
    /// Input bytes the whole job reads, or `None` on overflow.
    pub fn input_bytes(&self) -> Option<usize> {
        self.batch_size.checked_mul(self.in_tensor_size)
    }

    /// Output bytes the whole job writes, or `None` on overflow.
    pub fn output_bytes(&self) -> Option<usize> {
        self.batch_size.checked_mul(self.out_tensor_size)
    }

    fn fits_address_space(&self) -> bool {
        let end = |base: u64, bytes: Option<usize>| {
            bytes
                .and_then(|b| u64::try_from(b).ok())
                .and_then(|b| base.checked_add(b))
        };
        end(self.input_base, self.input_bytes()).is_some()
            && end(self.output_base, self.output_bytes()).is_some()
    }
}

/// How the firmware is asked to run an invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvocationKind {
    /// Plain single-sample run.
    Single,
    /// Batched run with one address per sample.
    Native,
}

/// One model invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchInvocation {
    /// Run kind.
    pub kind: InvocationKind,
    /// Samples in this invocation.
    pub samples: usize,
    /// Input sample addresses.
    pub inputs: SmallVec<[u64; 4]>,
    /// Output sample addresses.
    pub outputs: SmallVec<[u64; 4]>,
}

/// Cut a job into invocations, in execution order.
pub fn plan_batches(spec: &BatchSpec) -> Result<Vec<BatchInvocation>, DispatchError> {
    if spec.batch_size < 1 || spec.batch_model < 1 {
        return Err(DispatchError::InvalidArgument);
    }
    if !spec.fits_address_space() {
        return Err(DispatchError::MalformedJob);
    }

    if spec.batch_size == 1 {
        return Ok(vec![BatchInvocation {
            kind: InvocationKind::Single,
            samples: 1,
            inputs: SmallVec::from_elem(spec.input_base, 1),
            outputs: SmallVec::from_elem(spec.output_base, 1),
        }]);
    }

    let in_stride = spec.in_tensor_size as u64;
    let out_stride = spec.out_tensor_size as u64;
    let native = |first: usize, samples: usize| BatchInvocation {
        kind: InvocationKind::Native,
        samples,
        inputs: (first..first + samples)
            .map(|i| spec.input_base + i as u64 * in_stride)
            .collect(),
        outputs: (first..first + samples)
            .map(|i| spec.output_base + i as u64 * out_stride)
            .collect(),
    };

    if spec.batch_size <= spec.batch_model {
        return Ok(vec![native(0, spec.batch_size)]);
    }

    let full = spec.batch_size / spec.batch_model;
    let remainder = spec.batch_size % spec.batch_model;
    let mut plan: Vec<_> = (0..full)
        .map(|k| native(k * spec.batch_model, spec.batch_model))
        .collect();
    if remainder > 0 {
        plan.push(native(full * spec.batch_model, remainder));
    }
    Ok(plan)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(batch_size: usize, batch_model: usize) -> BatchSpec {
        BatchSpec {
            batch_size,
            batch_model,
            input_base: 0x1000_0000,
            output_base: 0x2000_0000,
            in_tensor_size: 0x100,
            out_tensor_size: 0x40,
        }
    }

    #[test]
    fn test_single_sample() {
        let plan = plan_batches(&spec(1, 4)).unwrap();
        assert_eq!(plan.len(), 1);
        assert_eq!(plan[0].kind, InvocationKind::Single);
        assert_eq!(plan[0].inputs.as_slice(), [0x1000_0000]);
        assert_eq!(plan[0].outputs.as_slice(), [0x2000_0000]);
    }

    #[test]
    fn test_fits_in_model() {
        let plan = plan_batches(&spec(3, 4)).unwrap();
        assert_eq!(plan.len(), 1);
        assert_eq!(plan[0].kind, InvocationKind::Native);
        assert_eq!(plan[0].inputs.as_slice(), [0x1000_0000, 0x1000_0100, 0x1000_0200]);
        assert_eq!(plan[0].outputs.as_slice(), [0x2000_0000, 0x2000_0040, 0x2000_0080]);
    }

    #[test]
    fn test_seven_by_three() {
        let plan = plan_batches(&spec(7, 3)).unwrap();
        let sizes: Vec<_> = plan.iter().map(|p| p.samples).collect();
        assert_eq!(sizes, [3, 3, 1]);

        for (k, invocation) in plan.iter().enumerate() {
            assert_eq!(invocation.kind, InvocationKind::Native);
            assert_eq!(invocation.inputs[0], 0x1000_0000 + (k * 3 * 0x100) as u64);
            assert_eq!(invocation.outputs[0], 0x2000_0000 + (k * 3 * 0x40) as u64);
            assert_eq!(invocation.inputs.len(), invocation.samples);
        }
    }

    #[test]
    fn test_exact_multiple_has_no_remainder() {
        let plan = plan_batches(&spec(6, 3)).unwrap();
        assert_eq!(plan.len(), 2);
        assert_eq!(plan.iter().map(|p| p.samples).sum::<usize>(), 6);
    }

    #[test]
    fn test_invalid_sizes() {
        assert_eq!(plan_batches(&spec(0, 3)), Err(DispatchError::InvalidArgument));
        assert_eq!(plan_batches(&spec(3, 0)), Err(DispatchError::InvalidArgument));
    }

    #[test]
    fn test_byte_totals() {
        let s = spec(7, 3);
        assert_eq!(s.input_bytes(), Some(7 * 0x100));
        assert_eq!(s.output_bytes(), Some(7 * 0x40));
    }

    #[test]
    fn test_overflowing_batch_is_malformed() {
        let mut s = spec(usize::MAX, 3);
        assert_eq!(s.input_bytes(), None);
        assert_eq!(plan_batches(&s), Err(DispatchError::MalformedJob));

        s = spec(4, 2);
        s.output_base = u64::MAX - 0x40;
        assert_eq!(plan_batches(&s), Err(DispatchError::MalformedJob));
    }
}
