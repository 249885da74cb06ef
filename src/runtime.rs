//! Process-wide offload context and hybrid mode.
//!
//! Most callers never build an [`OffloadContext`] themselves: they select the
//! hardware path once with [`initialize_context`] and every key and text
//! operation picks it up through [`GlobalExecutor`]. Without an active
//! context everything runs in software.

use std::{
    env,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use num_bigint::BigUint;
use tracing::info;

use crate::{
    bignum::ModExpJob,
    config::{ENV_MODE, OffloadConfig},
    driver::{AcceleratorDriver, EmulatedAccelerator},
    error::{ContextError, SubmitError},
    hybrid::HybridMode,
    offload::{ModExpExecutor, OffloadContext, OperationKind, SoftwareExecutor},
};

static CONTEXT: Mutex<Option<Arc<OffloadContext>>> = Mutex::new(None);
/// Mode set through [`set_hybrid_mode`]; survives context restarts.
static HYBRID_MODE: Mutex<Option<HybridMode>> = Mutex::new(None);

fn lock<T>(mutex: &'static Mutex<T>) -> MutexGuard<'static, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Select the execution backend.
///
/// `"QAT"` / `"HW"` start the offload context on the in-process accelerator,
/// configured from the `PAILLIER_HYBRID_*` environment; unless a mode was set
/// there or through [`set_hybrid_mode`], every modexp goes to hardware.
/// `"default"`, `"CPU"` and `"IPP"` select software and succeed without
/// starting anything.
pub fn initialize_context(selector: &str) -> Result<(), ContextError> {
    match selector.trim().to_ascii_uppercase().as_str() {
        "QAT" | "HW" => {
            let mut config = OffloadConfig::from_env()?;
            if env::var_os(ENV_MODE).is_none() {
                config.hybrid.mode = HybridMode::Fixed(100);
            }
            initialize_context_with(config, Arc::new(EmulatedAccelerator::default()))
        }
        "DEFAULT" | "CPU" | "IPP" => {
            info!(selector, "software context selected");
            Ok(())
        }
        _ => Err(ContextError::UnknownSelector(selector.to_string())),
    }
}

/// Start the process-wide context on `driver`.
pub fn initialize_context_with(
    mut config: OffloadConfig,
    driver: Arc<dyn AcceleratorDriver>,
) -> Result<(), ContextError> {
    let mut current = lock(&CONTEXT);
    if current.as_ref().is_some_and(|ctx| ctx.is_active()) {
        return Err(ContextError::AlreadyActive);
    }
    if let Some(mode) = *lock(&HYBRID_MODE) {
        config.hybrid.mode = mode;
    }
    *current = Some(Arc::new(OffloadContext::initialize(config, driver)?));
    Ok(())
}

/// Stop the process-wide context. Does nothing when none is active.
pub fn terminate_context() {
    let context = lock(&CONTEXT).take();
    if let Some(context) = context {
        context.terminate();
    }
}

pub fn is_context_active() -> bool {
    lock(&CONTEXT).as_ref().is_some_and(|ctx| ctx.is_active())
}

/// The active context, if any.
pub fn current() -> Option<Arc<OffloadContext>> {
    lock(&CONTEXT).clone()
}

/// Applies to the running context immediately and to any context started
/// later.
pub fn set_hybrid_mode(mode: HybridMode) {
    // lock order: CONTEXT, then HYBRID_MODE
    let context = lock(&CONTEXT);
    *lock(&HYBRID_MODE) = Some(mode);
    if let Some(context) = context.as_ref() {
        context.set_hybrid_mode(mode);
    }
}

pub fn set_hybrid_off() {
    set_hybrid_mode(HybridMode::Off);
}

pub fn hybrid_mode() -> HybridMode {
    if let Some(context) = current() {
        return context.hybrid_mode();
    }
    (*lock(&HYBRID_MODE)).unwrap_or_default()
}

/// Executor used by the key and text layer: the process-wide context when
/// one is active, software otherwise.
#[derive(Clone, Copy, Debug, Default)]
pub struct GlobalExecutor;

impl ModExpExecutor for GlobalExecutor {
    fn mod_exp(
        &self,
        jobs: &[ModExpJob],
        kind: OperationKind,
    ) -> Result<Vec<BigUint>, SubmitError> {
        match current() {
            Some(context) => context.mod_exp(jobs, kind),
            None => SoftwareExecutor.mod_exp(jobs, kind),
        }
    }
}
