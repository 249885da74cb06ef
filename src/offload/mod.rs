//! Hybrid CPU / accelerator scheduler for modular exponentiation.
//!
//! Flow of one hardware-routed job:
//! caller -> bounded submission queue -> [`manager`] packs it into an
//! outstanding buffer -> an [`instance`] worker drains the buffer through the
//! driver -> the result is written into the request's completion slot and the
//! caller wakes up. Jobs the ratio controller keeps in software are computed
//! by the caller while it waits.

use crossbeam::channel;
use num_bigint::BigUint;
use serde::{Deserialize, Serialize};

use crate::{
    bignum::{self, ModExpJob},
    error::{HardwareError, SubmitError},
};

pub mod buffer;
pub mod context;
pub mod instance;
pub mod manager;

pub use buffer::{BufferState, FillStatus, PoolCounts};
pub use context::{OffloadContext, OffloadStats};
pub use instance::InstanceStatus;
pub use manager::{DeadlineFlush, FlushPolicy};

/// Call site that produced a batch of modexp jobs; selects the hybrid ratio.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OperationKind {
    Encrypt,
    Decrypt,
    Multiply,
}

pub type Completion = Result<BigUint, HardwareError>;

/// One unit of offload work travelling from a caller to an instance worker.
#[derive(Debug)]
pub struct Request {
    job: ModExpJob,
    slot: Slot,
}

/// Destination of a request's result. Filling consumes it, so a result is
/// written at most once.
#[derive(Debug)]
pub struct Slot(channel::Sender<Completion>);

impl Slot {
    pub fn fill(self, outcome: Completion) {
        // The caller may have given up only if it panicked; nothing to do then.
        let _ = self.0.send(outcome);
    }
}

/// Caller side of a request's completion signal.
#[derive(Debug)]
pub(crate) struct Ticket(channel::Receiver<Completion>);

impl Ticket {
    /// Blocks until the request completes. A request dropped without being
    /// completed reports [`HardwareError::Dropped`].
    pub(crate) fn wait(self) -> Completion {
        self.0.recv().unwrap_or(Err(HardwareError::Dropped))
    }
}

impl Request {
    pub(crate) fn new(job: ModExpJob) -> (Self, Ticket) {
        let (tx, rx) = channel::bounded(1);
        (Self { job, slot: Slot(tx) }, Ticket(rx))
    }

    pub fn job(&self) -> &ModExpJob {
        &self.job
    }

    pub fn into_parts(self) -> (ModExpJob, Slot) {
        (self.job, self.slot)
    }

    pub fn complete(self, outcome: Completion) {
        self.slot.fill(outcome);
    }
}

/// Anything able to run a batch of modexp jobs, preserving order.
pub trait ModExpExecutor: Send + Sync {
    fn mod_exp(&self, jobs: &[ModExpJob], kind: OperationKind)
    -> Result<Vec<BigUint>, SubmitError>;
}

/// Pure software execution on the rayon pool.
#[derive(Clone, Copy, Debug, Default)]
pub struct SoftwareExecutor;

impl ModExpExecutor for SoftwareExecutor {
    fn mod_exp(
        &self,
        jobs: &[ModExpJob],
        _kind: OperationKind,
    ) -> Result<Vec<BigUint>, SubmitError> {
        validate(jobs)?;
        Ok(bignum::mod_exp_batch(jobs))
    }
}

pub(crate) fn validate(jobs: &[ModExpJob]) -> Result<(), SubmitError> {
    if jobs.is_empty() {
        return Err(SubmitError::EmptyBatch);
    }
    match jobs
        .iter()
        .enumerate()
        .find_map(|(index, job)| job.defect().map(|reason| (index, reason)))
    {
        Some((index, reason)) => Err(SubmitError::MalformedJob { index, reason }),
        None => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use num_traits::Zero;

    use super::*;

    fn job(base: u32) -> ModExpJob {
        ModExpJob::new(BigUint::from(base), BigUint::from(2u32), BigUint::from(97u32))
    }

    #[test]
    fn request_completes_exactly_once() {
        let (request, ticket) = Request::new(job(5));
        assert_eq!(request.job().base, BigUint::from(5u32));
        request.complete(Ok(BigUint::from(25u32)));
        assert_eq!(ticket.wait(), Ok(BigUint::from(25u32)));
    }

    #[test]
    fn dropped_request_reports_dropped() {
        let (request, ticket) = Request::new(job(5));
        drop(request);
        assert_eq!(ticket.wait(), Err(HardwareError::Dropped));
    }

    #[test]
    fn software_executor_validates_batches() {
        assert_eq!(
            SoftwareExecutor.mod_exp(&[], OperationKind::Encrypt),
            Err(SubmitError::EmptyBatch)
        );

        let bad = ModExpJob::new(BigUint::from(2u32), BigUint::from(2u32), BigUint::zero());
        assert_eq!(
            SoftwareExecutor.mod_exp(&[job(1), bad], OperationKind::Multiply),
            Err(SubmitError::MalformedJob {
                index: 1,
                reason: "modulus is zero"
            })
        );

        let out = SoftwareExecutor
            .mod_exp(&[job(10), job(3)], OperationKind::Multiply)
            .unwrap();
        assert_eq!(out, vec![BigUint::from(3u32), BigUint::from(9u32)]);
    }
}
