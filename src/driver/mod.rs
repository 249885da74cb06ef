//! Boundary to the cryptographic accelerator.
//!
//! The scheduler only needs instance enumeration, memory-pool and service
//! lifecycle, and batched submit-then-poll. Everything behind this trait is
//! opaque; [`emulated::EmulatedAccelerator`] provides an in-process device.

use std::fmt;

use num_bigint::BigUint;

use crate::bignum::ModExpJob;

pub mod emulated;

pub use emulated::{EmulatedAccelerator, EmulatorConfig};

/// Opaque handle of one accelerator execution context.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct InstanceHandle(u64);

impl InstanceHandle {
    pub fn new(raw: u64) -> Self {
        Self(raw)
    }

    pub fn raw(self) -> u64 {
        self.0
    }
}

impl fmt::Display for InstanceHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "inst#{}", self.0)
    }
}

/// Identifier of a batch accepted by [`AcceleratorDriver::submit`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct SubmissionId(u64);

impl SubmissionId {
    pub fn new(raw: u64) -> Self {
        Self(raw)
    }

    pub fn raw(self) -> u64 {
        self.0
    }
}

#[derive(Debug, PartialEq, Eq)]
pub enum PollStatus {
    Pending,
    /// Results in submission order.
    Complete(Vec<BigUint>),
}

#[derive(Debug, thiserror::Error, Clone, PartialEq, Eq)]
pub enum DriverError {
    #[error("memory pool: {0}")]
    MemoryPool(String),
    #[error("service: {0}")]
    Service(String),
    #[error("{instance} rejected batch: {reason}")]
    Rejected {
        instance: InstanceHandle,
        reason: String,
    },
    #[error("{instance} faulted: {reason}")]
    Faulted {
        instance: InstanceHandle,
        reason: String,
    },
    #[error("unknown submission {0:?}")]
    UnknownSubmission(SubmissionId),
}

/// Capability offered by a hardware modexp accelerator.
pub trait AcceleratorDriver: Send + Sync + 'static {
    fn name(&self) -> &str;

    fn mem_init(&self) -> Result<(), DriverError>;

    fn mem_destroy(&self) -> Result<(), DriverError>;

    fn start(&self) -> Result<(), DriverError>;

    fn stop(&self) -> Result<(), DriverError>;

    /// Acquire up to `max` instances.
    fn instances(&self, max: usize) -> Result<Vec<InstanceHandle>, DriverError>;

    /// Batch size the device processes most efficiently.
    fn preferred_batch_size(&self) -> usize;

    /// Hand a batch to `instance`; completion is observed through [`Self::poll`].
    fn submit(&self, instance: InstanceHandle, jobs: &[ModExpJob])
    -> Result<SubmissionId, DriverError>;

    fn poll(&self, instance: InstanceHandle, id: SubmissionId) -> Result<PollStatus, DriverError>;

    /// Abandon a submission that is still pending. Its results, if the
    /// device ever produces them, are discarded.
    fn cancel(&self, instance: InstanceHandle, id: SubmissionId) -> Result<(), DriverError>;
}
