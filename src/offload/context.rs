//! The offload context: owns the buffer pool, the buffer manager and the
//! instance workers, and routes modexp batches between software and the
//! accelerator.
//!
//! Construction is initialization: [`OffloadContext::initialize`] brings the
//! device up and starts every thread, or cleans up and fails. Teardown happens
//! in [`OffloadContext::terminate`] (also run on drop).

use std::{
    sync::{
        Arc, Mutex, MutexGuard, PoisonError, RwLock,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
    thread::{self, JoinHandle},
};

use crossbeam::channel::{self, SendError};
use num_bigint::BigUint;
use rayon::prelude::*;
use serde::Serialize;
use tracing::{debug, info, warn};

use super::{
    ModExpExecutor, OperationKind, Request, Ticket,
    buffer::{OutstandingBufferPool, PoolCounts},
    instance::{self, HardwareInstance, InstanceStatus},
    manager::{BufferManager, FlushPolicy},
    validate,
};
use crate::{
    bignum::{self, ModExpJob},
    config::{OffloadConfig, PollConfig},
    driver::AcceleratorDriver,
    error::{ContextError, HardwareError, SubmitError},
    hybrid::{HybridConfig, HybridMode},
};

#[derive(Default)]
pub(crate) struct StatCounters {
    pub(crate) hardware_jobs: AtomicU64,
    pub(crate) software_jobs: AtomicU64,
    pub(crate) fallback_jobs: AtomicU64,
    pub(crate) batches_submitted: AtomicU64,
    pub(crate) batches_failed: AtomicU64,
    pub(crate) timeout_flushes: AtomicU64,
}

/// Counters since the context was initialized.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct OffloadStats {
    /// Jobs whose result came back from the device.
    pub hardware_jobs: u64,
    /// Jobs the ratio controller kept in software.
    pub software_jobs: u64,
    /// Jobs routed to hardware that were recomputed in software.
    pub fallback_jobs: u64,
    pub batches_submitted: u64,
    pub batches_failed: u64,
    /// Partial buffers flushed by the flush policy.
    pub timeout_flushes: u64,
}

impl StatCounters {
    fn snapshot(&self) -> OffloadStats {
        OffloadStats {
            hardware_jobs: self.hardware_jobs.load(Ordering::Relaxed),
            software_jobs: self.software_jobs.load(Ordering::Relaxed),
            fallback_jobs: self.fallback_jobs.load(Ordering::Relaxed),
            batches_submitted: self.batches_submitted.load(Ordering::Relaxed),
            batches_failed: self.batches_failed.load(Ordering::Relaxed),
            timeout_flushes: self.timeout_flushes.load(Ordering::Relaxed),
        }
    }
}

/// State shared with the instance workers.
pub(crate) struct Shared {
    pub(crate) pool: Arc<OutstandingBufferPool>,
    pub(crate) driver: Arc<dyn AcceleratorDriver>,
    pub(crate) stats: Arc<StatCounters>,
    pub(crate) poll: PollConfig,
}

pub struct OffloadContext {
    shared: Arc<Shared>,
    hybrid: RwLock<HybridConfig>,
    active: AtomicBool,
    submissions: RwLock<Option<channel::Sender<Request>>>,
    manager: Mutex<Option<JoinHandle<()>>>,
    instances: Mutex<Vec<HardwareInstance>>,
}

impl OffloadContext {
    /// Start the device and all scheduler threads, flushing partial buffers
    /// per `config.flush`.
    pub fn initialize(
        config: OffloadConfig,
        driver: Arc<dyn AcceleratorDriver>,
    ) -> Result<Self, ContextError> {
        let policy = Arc::new(config.flush.policy());
        Self::initialize_with_policy(config, driver, policy)
    }

    pub fn initialize_with_policy(
        config: OffloadConfig,
        driver: Arc<dyn AcceleratorDriver>,
        policy: Arc<dyn FlushPolicy>,
    ) -> Result<Self, ContextError> {
        let _span = tracing::info_span!("offload_init", driver = driver.name()).entered();
        config.validate()?;

        driver.mem_init().map_err(ContextError::MemoryInit)?;
        if let Err(err) = driver.start() {
            release_memory(driver.as_ref());
            return Err(ContextError::ServiceStart(err));
        }
        let handles = match driver.instances(config.instances) {
            Ok(handles) if !handles.is_empty() => handles,
            Ok(_) => {
                shutdown_driver(driver.as_ref());
                return Err(ContextError::NoInstances);
            }
            Err(err) => {
                shutdown_driver(driver.as_ref());
                return Err(ContextError::Enumerate(err));
            }
        };

        let batch_size = config
            .batch_size
            .unwrap_or_else(|| driver.preferred_batch_size())
            .max(1);
        let shared = Arc::new(Shared {
            pool: Arc::new(OutstandingBufferPool::new(config.buffer_count, batch_size)),
            driver,
            stats: Arc::new(StatCounters::default()),
            poll: config.poll.clone(),
        });

        let cores = if config.pin_threads {
            instance::select_cores(handles.len())
        } else {
            vec![None; handles.len()]
        };
        let mut workers = Vec::with_capacity(handles.len());
        for (id, (handle, core)) in handles.into_iter().zip(cores).enumerate() {
            match HardwareInstance::spawn(id, handle, core, Arc::clone(&shared)) {
                Ok(worker) => workers.push(worker),
                Err(source) => {
                    abort_startup(&shared, &mut workers);
                    return Err(ContextError::ThreadSpawn {
                        what: "instance worker",
                        source,
                    });
                }
            }
        }

        let (tx, rx) = channel::bounded(config.submission_queue_depth);
        let manager = BufferManager::new(
            Arc::clone(&shared.pool),
            policy,
            Arc::clone(&shared.stats),
        );
        let manager = match thread::Builder::new()
            .name("offload-manager".into())
            .spawn(move || manager.run(rx))
        {
            Ok(handle) => handle,
            Err(source) => {
                abort_startup(&shared, &mut workers);
                return Err(ContextError::ThreadSpawn {
                    what: "buffer manager",
                    source,
                });
            }
        };

        let pinned = workers.iter().filter(|w| w.status().core.is_some()).count();
        info!(
            instances = workers.len(),
            pinned,
            buffers = config.buffer_count,
            batch_size,
            mode = %config.hybrid.mode,
            "offload context initialized"
        );

        Ok(Self {
            shared,
            hybrid: RwLock::new(config.hybrid),
            active: AtomicBool::new(true),
            submissions: RwLock::new(Some(tx)),
            manager: Mutex::new(Some(manager)),
            instances: Mutex::new(workers),
        })
    }

    /// Drain outstanding work, stop every thread and release the device.
    /// Later calls do nothing; batches submitted afterwards run in software.
    pub fn terminate(&self) {
        if !self.active.swap(false, Ordering::AcqRel) {
            return;
        }
        let _span = tracing::info_span!("offload_terminate").entered();

        // Dropping the only sender lets the manager drain the queue and exit.
        drop(
            self.submissions
                .write()
                .unwrap_or_else(PoisonError::into_inner)
                .take(),
        );
        if let Some(manager) = lock(&self.manager).take() {
            if manager.join().is_err() {
                warn!("buffer manager panicked");
            }
        }

        self.shared.pool.close();
        for worker in lock(&self.instances).iter_mut() {
            worker.join();
        }

        shutdown_driver(self.shared.driver.as_ref());
        info!(stats = ?self.stats(), "offload context terminated");
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    pub fn hybrid_config(&self) -> HybridConfig {
        self.hybrid
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn hybrid_mode(&self) -> HybridMode {
        self.hybrid_config().mode
    }

    pub fn set_hybrid_mode(&self, mode: HybridMode) {
        debug!(%mode, "hybrid mode set");
        self.hybrid
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .mode = mode;
    }

    pub fn set_hybrid_config(&self, config: HybridConfig) {
        *self.hybrid.write().unwrap_or_else(PoisonError::into_inner) = config;
    }

    pub fn stats(&self) -> OffloadStats {
        self.shared.stats.snapshot()
    }

    pub fn instances(&self) -> Vec<InstanceStatus> {
        lock(&self.instances)
            .iter()
            .map(HardwareInstance::status)
            .collect()
    }

    pub fn pool_counts(&self) -> PoolCounts {
        self.shared.pool.counts()
    }

    pub fn batch_size(&self) -> usize {
        self.shared.pool.capacity()
    }

    pub fn driver_name(&self) -> &str {
        self.shared.driver.name()
    }

    /// Queue `jobs` for the hardware path. A job that cannot be queued is
    /// completed at once as dropped, so its ticket always resolves.
    fn enqueue(&self, jobs: &[ModExpJob]) -> Vec<Ticket> {
        let submissions = self
            .submissions
            .read()
            .unwrap_or_else(PoisonError::into_inner);
        jobs.iter()
            .map(|job| {
                let (request, ticket) = Request::new(job.clone());
                match submissions.as_ref() {
                    Some(tx) => {
                        if let Err(SendError(request)) = tx.send(request) {
                            request.complete(Err(HardwareError::Dropped));
                        }
                    }
                    None => request.complete(Err(HardwareError::Dropped)),
                }
                ticket
            })
            .collect()
    }
}

impl ModExpExecutor for OffloadContext {
    /// The first `h` jobs go to the accelerator (h from the ratio controller),
    /// the rest are computed here while the device works. Failed hardware
    /// jobs are recomputed in software, so the result is always complete.
    fn mod_exp(
        &self,
        jobs: &[ModExpJob],
        kind: OperationKind,
    ) -> Result<Vec<BigUint>, SubmitError> {
        validate(jobs)?;
        let stats = &self.shared.stats;

        let hardware = if self.is_active() {
            self.hybrid_config().hardware_share(jobs.len(), kind)
        } else {
            0
        };
        if hardware == 0 {
            stats
                .software_jobs
                .fetch_add(jobs.len() as u64, Ordering::Relaxed);
            return Ok(bignum::mod_exp_batch(jobs));
        }

        let (hw_jobs, sw_jobs) = jobs.split_at(hardware);
        let tickets = self.enqueue(hw_jobs);
        let software = bignum::mod_exp_batch(sw_jobs);

        let outcomes: Vec<_> = tickets.into_iter().map(Ticket::wait).collect();
        let failed = outcomes.iter().filter(|o| o.is_err()).count();
        if let Some(Err(err)) = outcomes.iter().find(|o| o.is_err()) {
            warn!(failed, of = hardware, ?kind, error = %err, "falling back to software");
        }

        let mut results: Vec<BigUint> = outcomes
            .into_par_iter()
            .zip(hw_jobs.par_iter())
            .map(|(outcome, job)| outcome.unwrap_or_else(|_| job.compute()))
            .collect();
        results.extend(software);

        stats
            .hardware_jobs
            .fetch_add((hardware - failed) as u64, Ordering::Relaxed);
        stats
            .fallback_jobs
            .fetch_add(failed as u64, Ordering::Relaxed);
        stats
            .software_jobs
            .fetch_add(sw_jobs.len() as u64, Ordering::Relaxed);
        Ok(results)
    }
}

impl Drop for OffloadContext {
    fn drop(&mut self) {
        self.terminate();
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn abort_startup(shared: &Shared, workers: &mut [HardwareInstance]) {
    shared.pool.close();
    for worker in workers {
        worker.join();
    }
    shutdown_driver(shared.driver.as_ref());
}

fn release_memory(driver: &dyn AcceleratorDriver) {
    if let Err(err) = driver.mem_destroy() {
        warn!(error = %err, "memory pool teardown failed");
    }
}

fn shutdown_driver(driver: &dyn AcceleratorDriver) {
    if let Err(err) = driver.stop() {
        warn!(error = %err, "service stop failed");
    }
    release_memory(driver);
}
