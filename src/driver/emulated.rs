//! In-process accelerator.
//!
//! Batches are accepted by `submit` and computed on the polling thread once
//! the configured latency has elapsed, which reproduces the asynchronous
//! submit/poll contract of a real device. Faults can be injected at runtime
//! to exercise the software fallback.

use std::{
    collections::HashMap,
    sync::{
        Mutex, MutexGuard, PoisonError,
        atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering},
    },
    time::{Duration, Instant},
};

use serde::{Deserialize, Serialize};

use super::{AcceleratorDriver, DriverError, InstanceHandle, PollStatus, SubmissionId};
use crate::bignum::ModExpJob;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EmulatorConfig {
    pub instances: usize,
    pub batch_size: usize,
    /// Time between submission and the batch becoming pollable as complete.
    pub latency: Duration,
    pub fail_mem_init: bool,
    pub fail_start: bool,
    pub fail_stop: bool,
}

impl Default for EmulatorConfig {
    fn default() -> Self {
        Self {
            instances: 8,
            batch_size: 16,
            latency: Duration::ZERO,
            fail_mem_init: false,
            fail_start: false,
            fail_stop: false,
        }
    }
}

struct InFlight {
    instance: InstanceHandle,
    jobs: Vec<ModExpJob>,
    submitted_at: Instant,
}

#[derive(Default)]
struct DeviceState {
    memory_ready: bool,
    running: bool,
    in_flight: HashMap<SubmissionId, InFlight>,
}

#[derive(Default)]
struct Faults {
    reject_submissions: AtomicU32,
    fault_polls: AtomicU32,
    stall: AtomicBool,
}

impl Faults {
    fn take(counter: &AtomicU32) -> bool {
        counter
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
            .is_ok()
    }
}

pub struct EmulatedAccelerator {
    config: EmulatorConfig,
    state: Mutex<DeviceState>,
    faults: Faults,
    next_submission: AtomicU64,
    batches_completed: AtomicU64,
    jobs_completed: AtomicU64,
}

impl Default for EmulatedAccelerator {
    fn default() -> Self {
        Self::new(EmulatorConfig::default())
    }
}

impl EmulatedAccelerator {
    pub fn new(config: EmulatorConfig) -> Self {
        Self {
            config,
            state: Mutex::new(DeviceState::default()),
            faults: Faults::default(),
            next_submission: AtomicU64::new(0),
            batches_completed: AtomicU64::new(0),
            jobs_completed: AtomicU64::new(0),
        }
    }

    /// Reject the next `n` submitted batches.
    pub fn reject_next_submissions(&self, n: u32) {
        self.faults.reject_submissions.store(n, Ordering::Release);
    }

    /// Report a device fault on the next `n` polls.
    pub fn fault_next_polls(&self, n: u32) {
        self.faults.fault_polls.store(n, Ordering::Release);
    }

    /// While set, no batch ever completes.
    pub fn stall(&self, stalled: bool) {
        self.faults.stall.store(stalled, Ordering::Release);
    }

    pub fn batches_completed(&self) -> u64 {
        self.batches_completed.load(Ordering::Acquire)
    }

    pub fn jobs_completed(&self) -> u64 {
        self.jobs_completed.load(Ordering::Acquire)
    }

    pub fn is_running(&self) -> bool {
        self.lock().running
    }

    pub fn in_flight(&self) -> usize {
        self.lock().in_flight.len()
    }

    fn lock(&self) -> MutexGuard<'_, DeviceState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl AcceleratorDriver for EmulatedAccelerator {
    fn name(&self) -> &str {
        "emulated"
    }

    fn mem_init(&self) -> Result<(), DriverError> {
        if self.config.fail_mem_init {
            return Err(DriverError::MemoryPool("allocator unavailable".into()));
        }
        self.lock().memory_ready = true;
        Ok(())
    }

    fn mem_destroy(&self) -> Result<(), DriverError> {
        let mut state = self.lock();
        if !state.memory_ready {
            return Err(DriverError::MemoryPool("not initialized".into()));
        }
        state.memory_ready = false;
        Ok(())
    }

    fn start(&self) -> Result<(), DriverError> {
        let mut state = self.lock();
        if self.config.fail_start {
            return Err(DriverError::Service("service refused to start".into()));
        }
        if !state.memory_ready {
            return Err(DriverError::Service("memory pool not initialized".into()));
        }
        state.running = true;
        Ok(())
    }

    fn stop(&self) -> Result<(), DriverError> {
        let mut state = self.lock();
        state.running = false;
        state.in_flight.clear();
        if self.config.fail_stop {
            return Err(DriverError::Service("service did not acknowledge stop".into()));
        }
        Ok(())
    }

    fn instances(&self, max: usize) -> Result<Vec<InstanceHandle>, DriverError> {
        if !self.lock().running {
            return Err(DriverError::Service("service not started".into()));
        }
        Ok((0..self.config.instances.min(max) as u64)
            .map(InstanceHandle::new)
            .collect())
    }

    fn preferred_batch_size(&self) -> usize {
        self.config.batch_size
    }

    fn submit(
        &self,
        instance: InstanceHandle,
        jobs: &[ModExpJob],
    ) -> Result<SubmissionId, DriverError> {
        if Faults::take(&self.faults.reject_submissions) {
            return Err(DriverError::Rejected {
                instance,
                reason: "injected submission fault".into(),
            });
        }

        let mut state = self.lock();
        if !state.running {
            return Err(DriverError::Rejected {
                instance,
                reason: "service stopped".into(),
            });
        }

        let id = SubmissionId::new(self.next_submission.fetch_add(1, Ordering::AcqRel));
        state.in_flight.insert(
            id,
            InFlight {
                instance,
                jobs: jobs.to_vec(),
                submitted_at: Instant::now(),
            },
        );
        Ok(id)
    }

    fn poll(&self, instance: InstanceHandle, id: SubmissionId) -> Result<PollStatus, DriverError> {
        if Faults::take(&self.faults.fault_polls) {
            self.lock().in_flight.remove(&id);
            return Err(DriverError::Faulted {
                instance,
                reason: "injected device fault".into(),
            });
        }

        let batch = {
            let mut state = self.lock();
            let ready = match state.in_flight.get(&id) {
                None => return Err(DriverError::UnknownSubmission(id)),
                Some(batch) if batch.instance != instance => {
                    return Err(DriverError::UnknownSubmission(id));
                }
                Some(batch) => {
                    !self.faults.stall.load(Ordering::Acquire)
                        && batch.submitted_at.elapsed() >= self.config.latency
                }
            };
            if !ready {
                return Ok(PollStatus::Pending);
            }
            state.in_flight.remove(&id)
        };

        let Some(batch) = batch else {
            return Err(DriverError::UnknownSubmission(id));
        };
        let results: Vec<_> = batch.jobs.iter().map(ModExpJob::compute).collect();
        self.batches_completed.fetch_add(1, Ordering::AcqRel);
        self.jobs_completed
            .fetch_add(results.len() as u64, Ordering::AcqRel);
        Ok(PollStatus::Complete(results))
    }

    fn cancel(&self, instance: InstanceHandle, id: SubmissionId) -> Result<(), DriverError> {
        let mut state = self.lock();
        match state.in_flight.get(&id) {
            Some(batch) if batch.instance == instance => {
                state.in_flight.remove(&id);
                Ok(())
            }
            _ => Err(DriverError::UnknownSubmission(id)),
        }
    }
}
