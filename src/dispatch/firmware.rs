//! Simulated accelerator firmware.
//!
//! [`SimulatedAccelerator`] answers the firmware protocol in-process so the
//! accelerator dispatcher can run without hardware. It validates arguments
//! the way the driver does, records every run and can fail on request.

use super::transport::{FirmwareService, Opcode, Param, Request};
use crate::memory::{MemoryDevice, PhysicalMemoryHandle, SimDevice};
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

/// One recorded run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunRecord {
    /// `RunModel` or `RunBatchModel`.
    pub opcode: Opcode,
    /// Model handle.
    pub model: u64,
    /// Samples in the run.
    pub samples: usize,
    /// Input sample addresses.
    pub inputs: Vec<u64>,
    /// Output sample addresses.
    pub outputs: Vec<u64>,
}

/// Shared view of the runs a [`SimulatedAccelerator`] has executed.
#[derive(Debug, Clone, Default)]
pub struct RunLog(Arc<Mutex<Vec<RunRecord>>>);

impl RunLog {
    /// All runs so far, oldest first.
    pub fn runs(&self) -> Vec<RunRecord> {
        self.0.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Number of runs so far.
    pub fn len(&self) -> usize {
        self.0.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Whether nothing has run.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn push(&self, record: RunRecord) {
        self.0.lock().unwrap_or_else(PoisonError::into_inner).push(record);
    }
}

struct CopyMode {
    device: Arc<SimDevice>,
    in_tensor_size: usize,
    out_tensor_size: usize,
}

/// Reference firmware for the accelerator.
pub struct SimulatedAccelerator {
    next_handle: u64,
    driver_handles: HashSet<u64>,
    models: HashMap<u64, PathBuf>,
    log: RunLog,
    runs: u64,
    fail_run: Option<(u64, i32)>,
    run_delay: Option<Duration>,
    copy: Option<CopyMode>,
}

impl SimulatedAccelerator {
    /// Create firmware with nothing loaded.
    pub fn new() -> Self {
        Self {
            next_handle: 1,
            driver_handles: HashSet::new(),
            models: HashMap::new(),
            log: RunLog::default(),
            runs: 0,
            fail_run: None,
            run_delay: None,
            copy: None,
        }
    }

    /// Copy each input sample to its output sample on every run.
    pub fn with_copy(mut self, device: Arc<SimDevice>, in_tensor_size: usize, out_tensor_size: usize) -> Self {
        self.copy = Some(CopyMode {
            device,
            in_tensor_size,
            out_tensor_size,
        });
        self
    }

    /// Fail the `nth` run (1-based) with `errno`.
    pub fn fail_run(mut self, nth: u64, errno: i32) -> Self {
        self.fail_run = Some((nth, errno));
        self
    }

    /// Sleep this long in every run.
    pub fn with_run_delay(mut self, delay: Duration) -> Self {
        self.run_delay = Some(delay);
        self
    }

    /// Handle to the run log, valid after the firmware moves to its thread.
    pub fn run_log(&self) -> RunLog {
        self.log.clone()
    }

    fn issue_handle(&mut self) -> u64 {
        let handle = self.next_handle;
        self.next_handle += 1;
        handle
    }

    fn load_model(&mut self, params: &[Param]) -> Result<Vec<Param>, i32> {
        let [Param::U64(driver), Param::Bytes(path)] = params else {
            return Err(libc::EBADRQC);
        };
        if !self.driver_handles.contains(driver) {
            return Err(libc::EBADFD);
        }
        let path = PathBuf::from(String::from_utf8(path.clone()).map_err(|_| libc::EINVAL)?);
        if !path.is_file() {
            tracing::warn!(path = %path.display(), "model file not found");
            return Err(libc::ENOENT);
        }
        let model = self.issue_handle();
        self.models.insert(model, path);
        Ok(vec![Param::U64(model)])
    }

    fn run(&mut self, opcode: Opcode, params: &[Param]) -> Result<Vec<Param>, i32> {
        let (model, samples, inputs, outputs) = match (opcode, params) {
            (Opcode::RunModel, [Param::U64(model), Param::AddrList(inputs), Param::AddrList(outputs)]) => {
                (*model, 1, inputs, outputs)
            }
            (
                Opcode::RunBatchModel,
                [Param::U64(model), Param::U32(samples), Param::AddrList(inputs), Param::AddrList(outputs)],
            ) => (*model, *samples as usize, inputs, outputs),
            _ => return Err(libc::EBADRQC),
        };
        if !self.models.contains_key(&model) {
            return Err(libc::EINVAL);
        }
        if inputs.len() != samples || outputs.len() != samples {
            return Err(libc::EBADRQC);
        }

        self.runs += 1;
        if let Some(delay) = self.run_delay {
            std::thread::sleep(delay);
        }
        if let Some((nth, errno)) = self.fail_run
            && nth == self.runs
        {
            return Err(errno);
        }

        if let Some(copy) = &self.copy {
            for (&src, &dst) in inputs.iter().zip(outputs.iter()) {
                copy.sample(src, dst)?;
            }
        }

        self.log.push(RunRecord {
            opcode,
            model,
            samples,
            inputs: inputs.clone(),
            outputs: outputs.clone(),
        });
        Ok(Vec::new())
    }
}

impl CopyMode {
    fn attach(&self, addr: u64) -> Result<(PhysicalMemoryHandle, usize), i32> {
        let base = self.device.containing_region(addr).ok_or(libc::EINVAL)?;
        let device: Arc<dyn MemoryDevice> = self.device.clone();
        let handle = PhysicalMemoryHandle::attach(device, base).map_err(|_| libc::EINVAL)?;
        handle.map().map_err(|_| libc::EINVAL)?;
        Ok((handle, (addr - base) as usize))
    }

    fn sample(&self, src: u64, dst: u64) -> Result<(), i32> {
        let len = self.in_tensor_size.min(self.out_tensor_size);
        let (from, from_offset) = self.attach(src)?;
        let (to, to_offset) = self.attach(dst)?;
        let fits = |offset: usize, size: usize| offset.checked_add(len).is_some_and(|end| end <= size);
        if !fits(from_offset, from.size()) || !fits(to_offset, to.size()) {
            return Err(libc::EINVAL);
        }
        from.invalidate().map_err(|_| libc::EINVAL)?;
        let (Some(from_ptr), Some(to_ptr)) = (from.vaddr(), to.vaddr()) else {
            return Err(libc::EINVAL);
        };
        // SAFETY: Both ranges were bounds-checked against live mappings that
        // outlive this call; `copy` tolerates overlap.
        unsafe {
            std::ptr::copy(
                from_ptr.as_ptr().add(from_offset),
                to_ptr.as_ptr().add(to_offset),
                len,
            );
        }
        to.flush().map_err(|_| libc::EINVAL)
    }
}

impl Default for SimulatedAccelerator {
    fn default() -> Self {
        Self::new()
    }
}

impl FirmwareService for SimulatedAccelerator {
    fn handle(&mut self, request: &Request) -> Result<Vec<Param>, i32> {
        match request.opcode {
            Opcode::GetHandle => {
                let handle = self.issue_handle();
                self.driver_handles.insert(handle);
                Ok(vec![Param::U64(handle)])
            }
            Opcode::LoadModel => self.load_model(&request.params),
            Opcode::RunModel | Opcode::RunBatchModel => self.run(request.opcode, &request.params),
            Opcode::WaitDone => Ok(Vec::new()),
            Opcode::GetStatus => Ok(vec![Param::U32(0), Param::U64(self.runs)]),
        }
    }
}

impl std::fmt::Debug for SimulatedAccelerator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SimulatedAccelerator")
            .field("models", &self.models.len())
            .field("runs", &self.runs)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{CachePolicy, MemoryTarget};

    fn request(opcode: Opcode, params: Vec<Param>) -> Request {
        Request::new(opcode, params)
    }

    fn loaded(firmware: &mut SimulatedAccelerator) -> u64 {
        let model_file = tempfile::NamedTempFile::new().unwrap();
        let Ok(out) = firmware.handle(&request(Opcode::GetHandle, Vec::new())) else {
            panic!("no handle");
        };
        let path = model_file.path().to_string_lossy().into_owned().into_bytes();
        let out = firmware
            .handle(&request(Opcode::LoadModel, vec![out[0].clone(), Param::Bytes(path)]))
            .unwrap();
        out[0].as_u64().unwrap()
    }

    #[test]
    fn test_missing_model_is_enoent() {
        let mut firmware = SimulatedAccelerator::new();
        let out = firmware.handle(&request(Opcode::GetHandle, Vec::new())).unwrap();
        let result = firmware.handle(&request(
            Opcode::LoadModel,
            vec![out[0].clone(), Param::Bytes(b"/nonexistent/model.lm".to_vec())],
        ));
        assert_eq!(result, Err(libc::ENOENT));
    }

    #[test]
    fn test_load_needs_driver_handle() {
        let mut firmware = SimulatedAccelerator::new();
        let result = firmware.handle(&request(
            Opcode::LoadModel,
            vec![Param::U64(99), Param::Bytes(b"/tmp".to_vec())],
        ));
        assert_eq!(result, Err(libc::EBADFD));
    }

    #[test]
    fn test_runs_are_recorded() {
        let mut firmware = SimulatedAccelerator::new();
        let log = firmware.run_log();
        let model = loaded(&mut firmware);

        firmware
            .handle(&request(
                Opcode::RunBatchModel,
                vec![Param::U64(model), Param::U32(2), Param::AddrList(vec![1, 2]), Param::AddrList(vec![3, 4])],
            ))
            .unwrap();

        let runs = log.runs();
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].samples, 2);
        assert_eq!(runs[0].outputs, [3, 4]);
    }

    #[test]
    fn test_malformed_run() {
        let mut firmware = SimulatedAccelerator::new();
        let model = loaded(&mut firmware);
        let result = firmware.handle(&request(
            Opcode::RunBatchModel,
            vec![Param::U64(model), Param::U32(3), Param::AddrList(vec![1]), Param::AddrList(vec![2])],
        ));
        assert_eq!(result, Err(libc::EBADRQC));
        assert_eq!(
            firmware.handle(&request(Opcode::RunModel, vec![Param::U32(1)])),
            Err(libc::EBADRQC)
        );
    }

    #[test]
    fn test_fault_injection() {
        let mut firmware = SimulatedAccelerator::new().fail_run(2, libc::ECANCELED);
        let model = loaded(&mut firmware);
        let run = request(
            Opcode::RunModel,
            vec![Param::U64(model), Param::AddrList(vec![1]), Param::AddrList(vec![2])],
        );
        assert!(firmware.handle(&run).is_ok());
        assert_eq!(firmware.handle(&run), Err(libc::ECANCELED));
        assert!(firmware.handle(&run).is_ok());
    }

    #[test]
    fn test_copy_mode_moves_samples() {
        let device = SimDevice::new();
        let dyn_device: Arc<dyn MemoryDevice> = device.clone();
        let input = PhysicalMemoryHandle::allocate(dyn_device.clone(), MemoryTarget::Dms0, CachePolicy::Default, 64).unwrap();
        let output = PhysicalMemoryHandle::allocate(dyn_device, MemoryTarget::Dms0, CachePolicy::Default, 64).unwrap();
        let src = input.map().unwrap();
        unsafe { std::ptr::copy_nonoverlapping(b"abcdefgh".as_ptr(), src.as_ptr(), 8) };

        let mut firmware = SimulatedAccelerator::new().with_copy(device, 4, 4);
        let model = loaded(&mut firmware);
        firmware
            .handle(&request(
                Opcode::RunBatchModel,
                vec![
                    Param::U64(model),
                    Param::U32(2),
                    Param::AddrList(vec![input.phys_addr(), input.phys_addr() + 4]),
                    Param::AddrList(vec![output.phys_addr() + 8, output.phys_addr()]),
                ],
            ))
            .unwrap();

        let dst = output.map().unwrap();
        let seen = unsafe { std::slice::from_raw_parts(dst.as_ptr(), 12) };
        assert_eq!(&seen[..4], b"efgh");
        assert_eq!(&seen[8..12], b"abcd");
    }
}
