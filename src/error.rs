use std::io;

use crate::driver::DriverError;

/// Errors rejected at the call site of a cryptographic operation.
///
/// None of these are caused by the accelerator: hardware trouble never
/// reaches the caller, it only slows the operation down.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum PaillierError {
    #[error("key size {bits} is not supported (even, {min}..={max} bits)")]
    InvalidKeySize { bits: u64, min: u64, max: u64 },
    #[error("size mismatch: lhs has {lhs} elements, rhs has {rhs}")]
    SizeMismatch { lhs: usize, rhs: usize },
    #[error("operands were produced under different public keys")]
    KeyMismatch,
    #[error("cannot shift by {shift} a batch of {size} elements")]
    RotationOutOfRange { shift: i64, size: usize },
    #[error("cannot rotate a single-element batch")]
    RotateSingle,
    #[error("operation requires at least one element")]
    EmptyText,
    #[error("plaintext element {index} is not below the public modulus")]
    PlaintextOutOfRange { index: usize },
    #[error("element index {index} out of range for size {size}")]
    IndexOutOfRange { index: usize, size: usize },
    #[error("key generation failed: {0}")]
    KeyGeneration(&'static str),
    #[error("invalid public key: {0}")]
    InvalidPublicKey(&'static str),
    #[error(transparent)]
    Submit(#[from] SubmitError),
}

/// Malformed work handed to the modexp submission interface.
#[derive(Debug, thiserror::Error, Clone, PartialEq, Eq)]
pub enum SubmitError {
    #[error("modexp batch is empty")]
    EmptyBatch,
    #[error("modexp job {index} is malformed: {reason}")]
    MalformedJob { index: usize, reason: &'static str },
}

/// Failure of a single offloaded request.
///
/// Recorded against the request by an instance worker and consumed by the
/// submission interface, which recomputes the operand in software.
#[derive(Debug, thiserror::Error, Clone, PartialEq, Eq)]
pub enum HardwareError {
    #[error("accelerator driver: {0}")]
    Driver(#[from] DriverError),
    #[error("no completion after {attempts} polls")]
    PollTimeout { attempts: u32 },
    #[error("request dropped before completion")]
    Dropped,
}

/// Startup failures of the offload context. `initialize` leaves nothing
/// running when it returns one of these.
#[derive(Debug, thiserror::Error)]
pub enum ContextError {
    #[error("offload context is already active")]
    AlreadyActive,
    #[error("no accelerator instances available")]
    NoInstances,
    #[error("accelerator memory pool init failed: {0}")]
    MemoryInit(DriverError),
    #[error("accelerator service failed to start: {0}")]
    ServiceStart(DriverError),
    #[error("instance enumeration failed: {0}")]
    Enumerate(DriverError),
    #[error("failed to spawn {what} thread: {source}")]
    ThreadSpawn {
        what: &'static str,
        #[source]
        source: io::Error,
    },
    #[error("invalid configuration: {0}")]
    InvalidConfig(&'static str),
    #[error("unknown context selector `{0}`")]
    UnknownSelector(String),
    #[error(transparent)]
    Config(#[from] ConfigError),
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("malformed config: {0}")]
    Json(#[from] serde_json::Error),
    #[error("environment variable {name} has invalid value `{value}`")]
    Env { name: &'static str, value: String },
    #[error("unknown hybrid mode `{0}`")]
    UnknownMode(String),
}

/// Failures of the handle-based [`crate::session::Session`] API.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error(transparent)]
    Handle(#[from] crate::handles::HandleError),
    #[error(transparent)]
    Paillier(#[from] PaillierError),
    #[error("serialization: {0}")]
    Json(#[from] serde_json::Error),
}
