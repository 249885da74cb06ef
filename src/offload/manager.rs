//! Buffer manager: the single thread that packs submitted requests into
//! outstanding buffers and decides when a partial buffer is flushed.

use std::{
    fmt,
    sync::{Arc, atomic::Ordering},
    time::Duration,
};

use crossbeam::channel::{self, RecvTimeoutError};
use tracing::{debug, info};

use super::{
    Request,
    buffer::{FillStatus, OutstandingBufferPool},
    context::StatCounters,
};
use crate::error::HardwareError;

/// Decides when a filling buffer that is not yet full goes to the instances.
pub trait FlushPolicy: Send + Sync + fmt::Debug {
    /// How long the manager waits for an arrival before re-checking.
    fn tick(&self) -> Duration;

    fn should_flush(&self, status: &FillStatus) -> bool;
}

/// Flush on whichever deadline passes first: no arrivals for `idle`, or the
/// oldest request older than `max_age`. With both unset, only full buffers
/// (and shutdown) flush; [`crate::OffloadConfig::validate`] rejects that for
/// configured contexts.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DeadlineFlush {
    pub idle: Option<Duration>,
    pub max_age: Option<Duration>,
    pub tick: Duration,
}

impl FlushPolicy for DeadlineFlush {
    fn tick(&self) -> Duration {
        self.tick
    }

    fn should_flush(&self, status: &FillStatus) -> bool {
        status.filled > 0
            && (self.idle.is_some_and(|idle| status.idle >= idle)
                || self.max_age.is_some_and(|max| status.age >= max))
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum FlushReason {
    Full,
    Deadline,
    Shutdown,
}

pub(crate) struct BufferManager {
    pool: Arc<OutstandingBufferPool>,
    policy: Arc<dyn FlushPolicy>,
    stats: Arc<StatCounters>,
    current: Option<usize>,
}

impl BufferManager {
    pub(crate) fn new(
        pool: Arc<OutstandingBufferPool>,
        policy: Arc<dyn FlushPolicy>,
        stats: Arc<StatCounters>,
    ) -> Self {
        Self {
            pool,
            policy,
            stats,
            current: None,
        }
    }

    /// Runs until every sender of `submissions` is gone, then flushes what is
    /// left so no request is stranded.
    pub(crate) fn run(mut self, submissions: channel::Receiver<Request>) {
        let _span = tracing::info_span!("buffer_manager").entered();
        info!(
            buffers = self.pool.len(),
            batch = self.pool.capacity(),
            "buffer manager started"
        );

        loop {
            match submissions.recv_timeout(self.policy.tick()) {
                Ok(request) => self.admit(request),
                Err(RecvTimeoutError::Timeout) => self.flush_if_due(),
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }

        if let Some(index) = self.current {
            self.flush(index, FlushReason::Shutdown);
        }
        info!("buffer manager stopped");
    }

    fn admit(&mut self, request: Request) {
        let index = match self.current {
            Some(index) => index,
            None => match self.pool.acquire_free() {
                Some(index) => {
                    self.current = Some(index);
                    index
                }
                None => {
                    request.complete(Err(HardwareError::Dropped));
                    return;
                }
            },
        };

        let status = self.pool.buffer(index).push(request);
        if status.is_full() {
            self.flush(index, FlushReason::Full);
        } else if self.policy.should_flush(&status) {
            self.flush(index, FlushReason::Deadline);
        }
    }

    fn flush_if_due(&mut self) {
        if let Some(index) = self.current {
            let status = self.pool.buffer(index).fill_status();
            if self.policy.should_flush(&status) {
                self.flush(index, FlushReason::Deadline);
            }
        }
    }

    fn flush(&mut self, index: usize, reason: FlushReason) {
        debug!(buffer = index, ?reason, "flushing");
        if reason == FlushReason::Deadline {
            self.stats.timeout_flushes.fetch_add(1, Ordering::Relaxed);
        }
        self.pool.publish_ready(index);
        self.current = None;
    }
}
