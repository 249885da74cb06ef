//! Accelerator instance workers.
//!
//! Each acquired instance gets one thread that claims ready buffers, submits
//! them to the driver, polls until the batch completes and writes every result
//! back to its request. A batch that cannot be completed on the device is
//! failed request-by-request so callers fall back to software.

use std::{
    io,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    thread::{self, JoinHandle},
};

use num_bigint::BigUint;
use tracing::{debug, info, warn};

use super::{Request, context::Shared};
use crate::{
    bignum::ModExpJob,
    driver::{DriverError, InstanceHandle, PollStatus},
    error::HardwareError,
};

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InstanceStatus {
    pub id: usize,
    pub handle: InstanceHandle,
    /// Core the worker is pinned to, if pinning succeeded.
    pub core: Option<usize>,
    /// Working on a claimed buffer.
    pub active: bool,
    /// Waiting for the device to complete a submission.
    pub polling: bool,
    pub running: bool,
}

#[derive(Default)]
struct InstanceFlags {
    active: AtomicBool,
    polling: AtomicBool,
    running: AtomicBool,
    pinned: AtomicBool,
}

pub(crate) struct HardwareInstance {
    id: usize,
    handle: InstanceHandle,
    core: Option<core_affinity::CoreId>,
    flags: Arc<InstanceFlags>,
    thread: Option<JoinHandle<()>>,
}

impl HardwareInstance {
    pub(crate) fn spawn(
        id: usize,
        handle: InstanceHandle,
        core: Option<core_affinity::CoreId>,
        shared: Arc<Shared>,
    ) -> io::Result<Self> {
        let flags = Arc::new(InstanceFlags::default());
        flags.running.store(true, Ordering::Release);

        let worker_flags = Arc::clone(&flags);
        let thread = thread::Builder::new()
            .name(format!("offload-inst-{id}"))
            .spawn(move || {
                if let Some(core) = core {
                    let pinned = core_affinity::set_for_current(core);
                    worker_flags.pinned.store(pinned, Ordering::Release);
                }
                let _running = Running(&worker_flags);
                run(&shared, id, handle, &worker_flags);
            })?;

        Ok(Self {
            id,
            handle,
            core,
            flags,
            thread: Some(thread),
        })
    }

    pub(crate) fn status(&self) -> InstanceStatus {
        InstanceStatus {
            id: self.id,
            handle: self.handle,
            core: self
                .core
                .filter(|_| self.flags.pinned.load(Ordering::Acquire))
                .map(|core| core.id),
            active: self.flags.active.load(Ordering::Acquire),
            polling: self.flags.polling.load(Ordering::Acquire),
            running: self.flags.running.load(Ordering::Acquire),
        }
    }

    /// Wait for the worker to exit. The pool must be closed first.
    pub(crate) fn join(&mut self) {
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                warn!(instance = self.id, "instance worker panicked");
            }
        }
    }
}

/// Cores for `n` workers: every other core when the machine has SMT siblings
/// and room to skip them, otherwise the first cores, wrapping around when
/// workers outnumber cores. All `None` when core detection fails.
pub(crate) fn select_cores(n: usize) -> Vec<Option<core_affinity::CoreId>> {
    let smt = num_cpus::get() > num_cpus::get_physical();
    let cores: Vec<_> = match core_affinity::get_core_ids() {
        Some(cores) if smt && cores.len() >= 2 * n => {
            cores.into_iter().step_by(2).take(n).collect()
        }
        Some(cores) => cores.into_iter().take(n).collect(),
        None => Vec::new(),
    };
    if cores.is_empty() {
        return vec![None; n];
    }
    cores.iter().copied().cycle().take(n).map(Some).collect()
}

/// Clears `running` when the worker exits, unwinding included.
struct Running<'a>(&'a InstanceFlags);

impl Drop for Running<'_> {
    fn drop(&mut self) {
        self.0.running.store(false, Ordering::Release);
    }
}

/// A claimed buffer. Dropping it returns the buffer to the pool; if the
/// worker is unwinding mid-batch, unemitted slots are abandoned first.
struct Claim<'a> {
    shared: &'a Shared,
    index: usize,
    flags: &'a InstanceFlags,
}

impl Drop for Claim<'_> {
    fn drop(&mut self) {
        if thread::panicking() {
            let lost = self.shared.pool.buffer(self.index).abandon_drain();
            self.shared.stats.batches_failed.fetch_add(1, Ordering::Relaxed);
            warn!(buffer = self.index, lost, "worker panicked mid-batch");
        }
        self.shared.pool.release(self.index);
        self.flags.polling.store(false, Ordering::Release);
        self.flags.active.store(false, Ordering::Release);
    }
}

fn run(shared: &Shared, id: usize, handle: InstanceHandle, flags: &InstanceFlags) {
    let _span = tracing::info_span!("offload_instance", instance = id).entered();
    info!(%handle, "instance worker started");

    while let Some(index) = shared.pool.claim_ready() {
        let _claim = Claim {
            shared,
            index,
            flags,
        };
        flags.active.store(true, Ordering::Release);
        let buffer = shared.pool.buffer(index);
        let (jobs, slots): (Vec<ModExpJob>, Vec<_>) = buffer
            .begin_drain()
            .into_iter()
            .map(Request::into_parts)
            .unzip();

        shared.stats.batches_submitted.fetch_add(1, Ordering::Relaxed);
        flags.polling.store(true, Ordering::Release);
        let outcome = execute(shared, handle, &jobs);
        flags.polling.store(false, Ordering::Release);

        match outcome {
            Ok(results) => {
                debug!(buffer = index, jobs = jobs.len(), "batch complete");
                for (slot, value) in slots.into_iter().zip(results) {
                    slot.fill(Ok(value));
                    buffer.record_emitted();
                }
            }
            Err(err) => {
                warn!(buffer = index, jobs = jobs.len(), error = %err, "batch failed");
                shared.stats.batches_failed.fetch_add(1, Ordering::Relaxed);
                for slot in slots {
                    slot.fill(Err(err.clone()));
                    buffer.record_emitted();
                }
            }
        }
    }

    info!("instance worker stopped");
}

fn execute(
    shared: &Shared,
    handle: InstanceHandle,
    jobs: &[ModExpJob],
) -> Result<Vec<BigUint>, HardwareError> {
    let id = shared.driver.submit(handle, jobs)?;

    let poll = &shared.poll;
    let mut interval = poll.initial_interval();
    for _ in 0..poll.max_attempts {
        match shared.driver.poll(handle, id)? {
            PollStatus::Complete(results) if results.len() == jobs.len() => return Ok(results),
            PollStatus::Complete(results) => {
                return Err(DriverError::Faulted {
                    instance: handle,
                    reason: format!("{} results for {} jobs", results.len(), jobs.len()),
                }
                .into());
            }
            PollStatus::Pending => {
                thread::sleep(interval);
                interval = poll.next_interval(interval);
            }
        }
    }

    if let Err(err) = shared.driver.cancel(handle, id) {
        warn!(%handle, submission = id.raw(), error = %err, "failed to cancel timed-out batch");
    }
    Err(HardwareError::PollTimeout {
        attempts: poll.max_attempts,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn core_selection_covers_every_worker() {
        for n in [1, 3, 64] {
            let cores = select_cores(n);
            assert_eq!(cores.len(), n);
            if let Some(available) = core_affinity::get_core_ids() {
                if !available.is_empty() {
                    assert!(cores.iter().all(Option::is_some));
                }
            }
        }
    }
}
