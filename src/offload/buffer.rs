//! Outstanding buffers: fixed-capacity batches between the buffer manager and
//! the instance workers.
//!
//! Every buffer cycles `Free -> Filling -> Ready -> Draining -> Free`. The pool
//! tracks the coarse state of each index in `free_buffer` / `ready_buffer`;
//! an index with neither flag set is busy filling. Lock order: a thread never
//! holds the pool mutex and a buffer mutex at the same time.

use std::{
    collections::VecDeque,
    mem,
    sync::{Condvar, Mutex, MutexGuard, PoisonError},
    time::{Duration, Instant},
};

use log::{debug, trace};

use super::Request;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BufferState {
    Free,
    Filling,
    Ready,
    Draining,
}

/// Snapshot of a filling buffer, consumed by the flush policy.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FillStatus {
    pub filled: usize,
    pub capacity: usize,
    /// Time since the first request landed in the buffer.
    pub age: Duration,
    /// Time since the most recent request landed in the buffer.
    pub idle: Duration,
}

impl FillStatus {
    pub fn is_full(&self) -> bool {
        self.filled >= self.capacity
    }
}

/// Pool-visible buffer counts. `free + filling + ready` always equals the
/// number of buffers in the pool.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PoolCounts {
    pub free: usize,
    pub filling: usize,
    /// Ready or draining.
    pub ready: usize,
}

impl PoolCounts {
    pub fn total(&self) -> usize {
        self.free + self.filling + self.ready
    }
}

struct Slots {
    state: BufferState,
    data: Vec<Request>,
    next_free_slot: usize,
    next_data_slot: usize,
    next_data_out: usize,
    opened_at: Option<Instant>,
    last_arrival: Option<Instant>,
}

pub struct OutstandingBuffer {
    id: usize,
    capacity: usize,
    slots: Mutex<Slots>,
}

impl OutstandingBuffer {
    fn new(id: usize, capacity: usize) -> Self {
        Self {
            id,
            capacity,
            slots: Mutex::new(Slots {
                state: BufferState::Free,
                data: Vec::with_capacity(capacity),
                next_free_slot: 0,
                next_data_slot: 0,
                next_data_out: 0,
                opened_at: None,
                last_arrival: None,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Slots> {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn id(&self) -> usize {
        self.id
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn state(&self) -> BufferState {
        self.lock().state
    }

    fn open(&self) {
        let mut slots = self.lock();
        debug_assert_eq!(slots.state, BufferState::Free);
        slots.state = BufferState::Filling;
        trace!("buffer {} filling", self.id);
    }

    /// Write `request` into the next free slot. The buffer must be filling
    /// and not yet full.
    pub fn push(&self, request: Request) -> FillStatus {
        let mut slots = self.lock();
        debug_assert_eq!(slots.state, BufferState::Filling);
        debug_assert!(slots.next_free_slot < self.capacity);

        let now = Instant::now();
        slots.opened_at.get_or_insert(now);
        slots.last_arrival = Some(now);
        slots.data.push(request);
        slots.next_free_slot += 1;
        slots.next_data_slot = slots.next_free_slot;

        self.status_of(&slots, now)
    }

    pub fn fill_status(&self) -> FillStatus {
        let slots = self.lock();
        self.status_of(&slots, Instant::now())
    }

    fn status_of(&self, slots: &Slots, now: Instant) -> FillStatus {
        let since = |t: Option<Instant>| t.map_or(Duration::ZERO, |t| now.duration_since(t));
        FillStatus {
            filled: slots.next_data_slot,
            capacity: self.capacity,
            age: since(slots.opened_at),
            idle: since(slots.last_arrival),
        }
    }

    /// `Filling -> Ready`; returns the number of requests sealed in.
    fn seal(&self) -> usize {
        let mut slots = self.lock();
        debug_assert_eq!(slots.state, BufferState::Filling);
        slots.state = BufferState::Ready;
        trace!("buffer {} ready with {} requests", self.id, slots.next_data_slot);
        slots.next_data_slot
    }

    /// `Ready -> Draining`; hands the batch, in slot order, to the worker.
    pub fn begin_drain(&self) -> Vec<Request> {
        let mut slots = self.lock();
        debug_assert_eq!(slots.state, BufferState::Ready);
        slots.state = BufferState::Draining;
        mem::replace(&mut slots.data, Vec::with_capacity(self.capacity))
    }

    /// Account for one result written back to its request.
    pub fn record_emitted(&self) {
        let mut slots = self.lock();
        debug_assert_eq!(slots.state, BufferState::Draining);
        debug_assert!(slots.next_data_out < slots.next_data_slot);
        slots.next_data_out += 1;
    }

    /// Close out a claimed buffer whose worker stopped mid-batch. Requests
    /// still held are dropped, so their callers see
    /// [`crate::HardwareError::Dropped`]. Returns the number of slots never
    /// emitted.
    pub(crate) fn abandon_drain(&self) -> usize {
        let (pending, lost) = {
            let mut slots = self.lock();
            slots.state = BufferState::Draining;
            let lost = slots.next_data_slot - slots.next_data_out;
            slots.next_data_out = slots.next_data_slot;
            (mem::take(&mut slots.data), lost)
        };
        drop(pending);
        debug!("buffer {} abandoned with {lost} unemitted slots", self.id);
        lost
    }

    /// `Draining -> Free`, once every slot has been emitted.
    fn reset(&self) {
        let mut slots = self.lock();
        debug_assert_eq!(slots.state, BufferState::Draining);
        debug_assert_eq!(slots.next_data_out, slots.next_data_slot);
        slots.state = BufferState::Free;
        slots.next_free_slot = 0;
        slots.next_data_slot = 0;
        slots.next_data_out = 0;
        slots.opened_at = None;
        slots.last_arrival = None;
        trace!("buffer {} free", self.id);
    }
}

struct PoolState {
    free_buffer: Box<[bool]>,
    ready_buffer: Box<[bool]>,
    busy_count: usize,
    ready_queue: VecDeque<usize>,
    closed: bool,
}

pub struct OutstandingBufferPool {
    buffers: Box<[OutstandingBuffer]>,
    state: Mutex<PoolState>,
    any_free_buffer: Condvar,
    any_ready_buffer: Condvar,
}

impl OutstandingBufferPool {
    pub fn new(count: usize, capacity: usize) -> Self {
        assert!(count > 0 && capacity > 0, "empty buffer pool");
        Self {
            buffers: (0..count)
                .map(|id| OutstandingBuffer::new(id, capacity))
                .collect(),
            state: Mutex::new(PoolState {
                free_buffer: vec![true; count].into_boxed_slice(),
                ready_buffer: vec![false; count].into_boxed_slice(),
                busy_count: 0,
                ready_queue: VecDeque::with_capacity(count),
                closed: false,
            }),
            any_free_buffer: Condvar::new(),
            any_ready_buffer: Condvar::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, PoolState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn len(&self) -> usize {
        self.buffers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffers.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.buffers[0].capacity
    }

    pub fn buffer(&self, index: usize) -> &OutstandingBuffer {
        &self.buffers[index]
    }

    /// Block until a buffer is free, mark it busy and open it for filling.
    /// Returns `None` once the pool is closed.
    pub fn acquire_free(&self) -> Option<usize> {
        let index = {
            let mut state = self.lock();
            loop {
                if state.closed {
                    return None;
                }
                if let Some(index) = state.free_buffer.iter().position(|free| *free) {
                    state.free_buffer[index] = false;
                    state.busy_count += 1;
                    break index;
                }
                state = self
                    .any_free_buffer
                    .wait(state)
                    .unwrap_or_else(PoisonError::into_inner);
            }
        };

        self.buffers[index].open();
        Some(index)
    }

    /// Seal a filling buffer and hand it over to the instance workers.
    pub fn publish_ready(&self, index: usize) {
        let sealed = self.buffers[index].seal();

        let mut state = self.lock();
        debug_assert!(!state.free_buffer[index] && !state.ready_buffer[index]);
        state.ready_buffer[index] = true;
        state.ready_queue.push_back(index);
        drop(state);

        debug!("buffer {index} published with {sealed} requests");
        self.any_ready_buffer.notify_one();
    }

    /// Block until a ready buffer exists and claim it for draining.
    ///
    /// After [`Self::close`], remaining ready buffers are still handed out;
    /// `None` is returned only once none are left.
    pub fn claim_ready(&self) -> Option<usize> {
        let mut state = self.lock();
        loop {
            if let Some(index) = state.ready_queue.pop_front() {
                return Some(index);
            }
            if state.closed {
                return None;
            }
            state = self
                .any_ready_buffer
                .wait(state)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    /// Return a fully drained buffer to the free set.
    pub fn release(&self, index: usize) {
        self.buffers[index].reset();

        let mut state = self.lock();
        debug_assert!(state.ready_buffer[index] && !state.free_buffer[index]);
        state.ready_buffer[index] = false;
        state.free_buffer[index] = true;
        state.busy_count -= 1;
        drop(state);

        self.any_free_buffer.notify_one();
    }

    /// Wake every waiter; no buffer will be handed out for filling again.
    pub fn close(&self) {
        self.lock().closed = true;
        self.any_free_buffer.notify_all();
        self.any_ready_buffer.notify_all();
    }

    pub fn counts(&self) -> PoolCounts {
        let state = self.lock();
        let free = state.free_buffer.iter().filter(|f| **f).count();
        let ready = state.ready_buffer.iter().filter(|r| **r).count();
        debug_assert_eq!(state.busy_count, self.buffers.len() - free);
        PoolCounts {
            free,
            filling: state.busy_count - ready,
            ready,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{
        sync::{
            Arc,
            atomic::{AtomicBool, Ordering},
        },
        thread,
    };

    use num_bigint::BigUint;

    use super::*;
    use crate::{bignum::ModExpJob, error::HardwareError};

    fn request(i: u32) -> (Request, crate::offload::Ticket) {
        Request::new(ModExpJob::new(
            BigUint::from(i),
            BigUint::from(1u32),
            BigUint::from(1_000_003u32),
        ))
    }

    #[test]
    fn abandoned_buffer_returns_to_the_free_set() {
        let pool = OutstandingBufferPool::new(1, 4);
        let idx = pool.acquire_free().unwrap();
        let tickets: Vec<_> = (0..3)
            .map(|i| {
                let (req, ticket) = request(i);
                pool.buffer(idx).push(req);
                ticket
            })
            .collect();
        pool.publish_ready(idx);
        assert_eq!(pool.claim_ready(), Some(idx));

        let mut drained = pool.buffer(idx).begin_drain().into_iter();
        drained.next().unwrap().complete(Ok(BigUint::from(5u32)));
        pool.buffer(idx).record_emitted();
        drop(drained);

        assert_eq!(pool.buffer(idx).abandon_drain(), 2);
        pool.release(idx);
        assert_eq!(pool.counts(), PoolCounts { free: 1, filling: 0, ready: 0 });

        let outcomes: Vec<_> = tickets.into_iter().map(|t| t.wait()).collect();
        assert_eq!(outcomes[0], Ok(BigUint::from(5u32)));
        assert!(outcomes[1..].iter().all(|o| *o == Err(HardwareError::Dropped)));
        assert_eq!(pool.acquire_free(), Some(idx));
    }

    #[test]
    fn lifecycle_moves_through_every_state() {
        let pool = OutstandingBufferPool::new(2, 3);
        assert_eq!(pool.counts(), PoolCounts { free: 2, filling: 0, ready: 0 });

        let idx = pool.acquire_free().unwrap();
        assert_eq!(pool.buffer(idx).state(), BufferState::Filling);
        assert_eq!(pool.counts(), PoolCounts { free: 1, filling: 1, ready: 0 });

        let mut tickets = Vec::new();
        for i in 0..3 {
            let (req, ticket) = request(i);
            let status = pool.buffer(idx).push(req);
            assert_eq!(status.filled, i as usize + 1);
            tickets.push(ticket);
        }
        assert!(pool.buffer(idx).fill_status().is_full());

        pool.publish_ready(idx);
        assert_eq!(pool.buffer(idx).state(), BufferState::Ready);
        assert_eq!(pool.counts(), PoolCounts { free: 1, filling: 0, ready: 1 });

        assert_eq!(pool.claim_ready(), Some(idx));
        let batch = pool.buffer(idx).begin_drain();
        assert_eq!(pool.buffer(idx).state(), BufferState::Draining);

        // FIFO within the buffer
        let bases: Vec<_> = batch.iter().map(|r| r.job().base.clone()).collect();
        assert_eq!(bases, (0u32..3).map(BigUint::from).collect::<Vec<_>>());

        for req in batch {
            let value = req.job().base.clone();
            req.complete(Ok(value));
            pool.buffer(idx).record_emitted();
        }
        pool.release(idx);

        assert_eq!(pool.buffer(idx).state(), BufferState::Free);
        assert_eq!(pool.counts(), PoolCounts { free: 2, filling: 0, ready: 0 });
        for (i, ticket) in tickets.into_iter().enumerate() {
            assert_eq!(ticket.wait(), Ok(BigUint::from(i)));
        }
    }

    #[test]
    fn closed_pool_hands_out_remaining_ready_buffers() {
        let pool = OutstandingBufferPool::new(2, 1);
        let idx = pool.acquire_free().unwrap();
        let (req, _ticket) = request(1);
        pool.buffer(idx).push(req);
        pool.publish_ready(idx);

        pool.close();
        assert_eq!(pool.acquire_free(), None);
        assert_eq!(pool.claim_ready(), Some(idx));
        assert_eq!(pool.claim_ready(), None);
    }

    #[test]
    fn acquire_blocks_until_release() {
        let pool = Arc::new(OutstandingBufferPool::new(1, 1));
        let idx = pool.acquire_free().unwrap();
        let (req, _ticket) = request(9);
        pool.buffer(idx).push(req);
        pool.publish_ready(idx);

        let acquired = Arc::new(AtomicBool::new(false));
        let waiter = {
            let pool = Arc::clone(&pool);
            let acquired = Arc::clone(&acquired);
            thread::spawn(move || {
                let got = pool.acquire_free();
                acquired.store(true, Ordering::SeqCst);
                got
            })
        };

        thread::sleep(Duration::from_millis(50));
        assert!(!acquired.load(Ordering::SeqCst));

        let claimed = pool.claim_ready().unwrap();
        for req in pool.buffer(claimed).begin_drain() {
            req.complete(Err(crate::error::HardwareError::Dropped));
            pool.buffer(claimed).record_emitted();
        }
        pool.release(claimed);

        assert_eq!(waiter.join().unwrap(), Some(idx));
    }

    #[test]
    fn counts_are_conserved_under_contention() {
        const BUFFERS: usize = 4;
        let pool = Arc::new(OutstandingBufferPool::new(BUFFERS, 2));
        let stop = Arc::new(AtomicBool::new(false));

        let checker = {
            let pool = Arc::clone(&pool);
            let stop = Arc::clone(&stop);
            thread::spawn(move || {
                let mut samples = 0usize;
                loop {
                    assert_eq!(pool.counts().total(), BUFFERS);
                    samples += 1;
                    if stop.load(Ordering::SeqCst) {
                        break samples;
                    }
                }
            })
        };

        let drainers: Vec<_> = (0..2)
            .map(|_| {
                let pool = Arc::clone(&pool);
                thread::spawn(move || {
                    let mut drained = 0usize;
                    while let Some(idx) = pool.claim_ready() {
                        for req in pool.buffer(idx).begin_drain() {
                            let value = req.job().base.clone();
                            req.complete(Ok(value));
                            pool.buffer(idx).record_emitted();
                            drained += 1;
                        }
                        pool.release(idx);
                    }
                    drained
                })
            })
            .collect();

        let mut tickets = Vec::new();
        for round in 0..200u32 {
            let idx = pool.acquire_free().unwrap();
            for k in 0..2 {
                let (req, ticket) = request(round * 2 + k);
                pool.buffer(idx).push(req);
                tickets.push(ticket);
            }
            pool.publish_ready(idx);
        }

        for (i, ticket) in tickets.into_iter().enumerate() {
            assert_eq!(ticket.wait(), Ok(BigUint::from(i)));
        }
        pool.close();

        let drained: usize = drainers.into_iter().map(|h| h.join().unwrap()).sum();
        assert_eq!(drained, 400);

        stop.store(true, Ordering::SeqCst);
        assert!(checker.join().unwrap() > 0);
        assert_eq!(pool.counts(), PoolCounts { free: BUFFERS, filling: 0, ready: 0 });
    }
}
