//! Bounded work queue with shared control state
//!
//! This module provides the one piece of state every participant shares:
//! a capacity-limited FIFO of work units plus the control flags and the
//! per-worker lifecycle states. All of it lives behind a single mutex so
//! that a flag transition is never observed out of step with queue
//! occupancy.
//!
//! Four condition variables hang off that mutex:
//! - `NotFull`: producers (and the supervisor) waiting for space
//! - `NotEmpty`: consumers (and the supervisor) waiting for work
//! - `Resumed`: paused workers waiting for the halt to clear
//! - `StateChanged`: supervisor waits and the startup gate
//!
//! Every flag change is broadcast on all four.

use crate::error::PushError;
use crate::flags::ControlFlags;
use crate::worker::WorkerState;
use parking_lot::{Condvar, Mutex, MutexGuard};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;
use tracing::{debug, info, trace};

/// Statistics for the work queue
#[derive(Debug, Default)]
pub struct QueueStats {
    /// Total units enqueued
    pub enqueued: AtomicU64,

    /// Total units dequeued
    pub dequeued: AtomicU64,

    /// Number of times a worker entered the paused state
    pub pauses: AtomicU64,

    /// Number of times a push had to wait for space
    pub backpressure_events: AtomicU64,
}

impl QueueStats {
    /// Take a consistent-enough copy of the counters
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            enqueued: self.enqueued.load(Ordering::Relaxed),
            dequeued: self.dequeued.load(Ordering::Relaxed),
            pauses: self.pauses.load(Ordering::Relaxed),
            backpressure_events: self.backpressure_events.load(Ordering::Relaxed),
        }
    }

    pub(crate) fn record_enqueue(&self) {
        self.enqueued.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_dequeue(&self) {
        self.dequeued.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_pause(&self) {
        self.pauses.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_backpressure(&self) {
        self.backpressure_events.fetch_add(1, Ordering::Relaxed);
    }
}

/// Point-in-time copy of [`QueueStats`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub enqueued: u64,
    pub dequeued: u64,
    pub pauses: u64,
    pub backpressure_events: u64,
}

/// Outcome of a blocking pop
#[derive(Debug)]
pub enum Popped<W> {
    /// A unit was removed; `depth` counts it
    Item { unit: W, depth: usize },

    /// Queue empty and finished
    Finished,

    /// Queue empty and aborted
    Aborted,

    /// Queue empty and one of the caller's extra stop flags is set
    Flagged(ControlFlags),

    /// Supervisor deadline elapsed
    TimedOut,
}

/// Condition variables guarded by the queue mutex
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Signal {
    NotFull,
    NotEmpty,
    Resumed,
    StateChanged,
}

/// Everything protected by the queue lock
pub(crate) struct QueueState<W> {
    items: VecDeque<W>,
    capacity: usize,
    flags: ControlFlags,
    workers: Vec<WorkerState>,
    num_producers: usize,
    producers_live: usize,
    started: bool,
    init_failure: Option<(usize, String)>,
    released: bool,
}

impl<W> QueueState<W> {
    pub(crate) fn len(&self) -> usize {
        self.items.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub(crate) fn is_full(&self) -> bool {
        self.items.len() >= self.capacity
    }

    pub(crate) fn flags(&self) -> ControlFlags {
        self.flags
    }

    /// Append at the tail; hands the unit back if there is no room
    pub(crate) fn try_push(&mut self, unit: W) -> Result<(), W> {
        if self.is_full() {
            return Err(unit);
        }
        self.items.push_back(unit);
        Ok(())
    }

    /// Remove from the head
    pub(crate) fn try_pop(&mut self) -> Option<W> {
        self.items.pop_front()
    }

    /// Set flags without waking anyone; caller broadcasts
    pub(crate) fn raise(&mut self, flags: ControlFlags) {
        self.flags.insert(flags);
        self.refresh_pause_ack();
    }

    /// Clear flags without waking anyone; caller broadcasts
    pub(crate) fn clear(&mut self, flags: ControlFlags) {
        self.flags.remove(flags);
        self.refresh_pause_ack();
    }

    pub(crate) fn worker_state(&self, id: usize) -> WorkerState {
        self.workers[id]
    }

    pub(crate) fn worker_states(&self) -> Vec<WorkerState> {
        self.workers.clone()
    }

    pub(crate) fn set_worker_state(&mut self, id: usize, state: WorkerState) {
        self.workers[id] = state;
        self.refresh_pause_ack();
    }

    pub(crate) fn num_consumers(&self) -> usize {
        self.workers.len() - self.num_producers
    }

    /// Producers that have not yet finished or aborted
    pub(crate) fn producers_live(&self) -> usize {
        self.producers_live
    }

    pub(crate) fn retire_producer(&mut self) {
        self.producers_live = self.producers_live.saturating_sub(1);
    }

    /// Workers that have not reached `Terminated`
    pub(crate) fn unterminated(&self) -> usize {
        self.workers
            .iter()
            .filter(|s| **s != WorkerState::Terminated)
            .count()
    }

    /// True while any worker is still running its init hook
    pub(crate) fn initializing(&self) -> bool {
        self.workers.iter().any(|s| *s == WorkerState::Init)
    }

    pub(crate) fn is_started(&self) -> bool {
        self.started
    }

    pub(crate) fn start(&mut self) {
        self.started = true;
    }

    pub(crate) fn record_init_failure(&mut self, id: usize, reason: String) {
        // keep the lowest-numbered failure for a stable report
        match &self.init_failure {
            Some((prev, _)) if *prev <= id => {}
            _ => self.init_failure = Some((id, reason)),
        }
    }

    pub(crate) fn take_init_failure(&mut self) -> Option<(usize, String)> {
        self.init_failure.take()
    }

    pub(crate) fn is_released(&self) -> bool {
        self.released
    }

    /// Drop queue storage; only valid once the queue is empty
    pub(crate) fn release(&mut self) {
        self.items = VecDeque::new();
        self.released = true;
    }

    /// Raise FINISHED once every producer retired and nothing is left queued.
    /// Returns true if the flag was newly set.
    pub(crate) fn maybe_finish(&mut self) -> bool {
        if self.producers_live == 0
            && self.items.is_empty()
            && !self.flags.intersects(ControlFlags::TERMINAL)
        {
            self.raise(ControlFlags::FINISHED);
            return true;
        }
        false
    }

    /// PAUSED mirrors "halt requested and every active worker paused"
    fn refresh_pause_ack(&mut self) {
        let all_paused = self.flags.contains(ControlFlags::HALT)
            && self
                .workers
                .iter()
                .filter(|s| s.is_active())
                .all(|s| *s == WorkerState::Paused);
        if all_paused {
            self.flags.insert(ControlFlags::PAUSED);
        } else {
            self.flags.remove(ControlFlags::PAUSED);
        }
    }
}

/// Bounded FIFO plus control flags, shared by all workers and the supervisor
pub struct WorkQueue<W> {
    state: Mutex<QueueState<W>>,
    not_full: Condvar,
    not_empty: Condvar,
    resumed: Condvar,
    state_changed: Condvar,
    stats: QueueStats,
    log_prefix: String,
}

impl<W> WorkQueue<W> {
    /// Create a queue for `num_workers` workers, the first `num_producers`
    /// of which are producers
    pub fn new(
        capacity: usize,
        init_flags: ControlFlags,
        num_workers: usize,
        num_producers: usize,
        log_prefix: impl Into<String>,
    ) -> Self {
        let log_prefix = log_prefix.into();
        debug!(
            queue = %log_prefix,
            capacity,
            workers = num_workers,
            producers = num_producers,
            flags = %init_flags,
            "Allocating work queue"
        );

        let mut state = QueueState {
            items: VecDeque::with_capacity(capacity.min(4096)),
            capacity,
            flags: ControlFlags::NONE,
            workers: vec![WorkerState::Init; num_workers],
            num_producers,
            producers_live: num_producers,
            started: false,
            init_failure: None,
            released: false,
        };
        state.raise(init_flags.difference(ControlFlags::PAUSED));

        Self {
            state: Mutex::new(state),
            not_full: Condvar::new(),
            not_empty: Condvar::new(),
            resumed: Condvar::new(),
            state_changed: Condvar::new(),
            stats: QueueStats::default(),
            log_prefix,
        }
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, QueueState<W>> {
        self.state.lock()
    }

    pub fn log_prefix(&self) -> &str {
        &self.log_prefix
    }

    pub fn stats(&self) -> &QueueStats {
        &self.stats
    }

    /// Current number of queued units
    pub fn len(&self) -> usize {
        self.state.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.lock().is_empty()
    }

    pub fn flags(&self) -> ControlFlags {
        self.state.lock().flags()
    }

    /// Set caller-owned flags and wake everyone; returns the new flags
    pub fn set_flags(&self, flags: ControlFlags) -> ControlFlags {
        let mut st = self.lock();
        st.raise(flags & ControlFlags::CALLER_MASK);
        let now = st.flags();
        info!(queue = %self.log_prefix, set = %flags, flags = %now, "Flags set");
        self.broadcast();
        now
    }

    /// Clear caller-owned flags and wake everyone; returns the new flags
    pub fn unset_flags(&self, flags: ControlFlags) -> ControlFlags {
        let mut st = self.lock();
        st.clear(flags & ControlFlags::CALLER_MASK);
        let now = st.flags();
        info!(queue = %self.log_prefix, cleared = %flags, flags = %now, "Flags cleared");
        self.broadcast();
        now
    }

    /// Wake one waiter on `signal`
    pub(crate) fn notify(&self, signal: Signal) {
        self.condvar(signal).notify_one();
    }

    /// Wake every waiter on `signal`
    pub(crate) fn notify_all(&self, signal: Signal) {
        self.condvar(signal).notify_all();
    }

    /// Wake everyone; used after any flag change
    pub(crate) fn broadcast(&self) {
        self.not_full.notify_all();
        self.not_empty.notify_all();
        self.resumed.notify_all();
        self.state_changed.notify_all();
    }

    /// Block on `signal`, optionally until `deadline`; returns true on timeout
    pub(crate) fn wait(
        &self,
        signal: Signal,
        guard: &mut MutexGuard<'_, QueueState<W>>,
        deadline: Option<Instant>,
    ) -> bool {
        let cv = self.condvar(signal);
        match deadline {
            Some(deadline) => cv.wait_until(guard, deadline).timed_out(),
            None => {
                cv.wait(guard);
                false
            }
        }
    }

    fn condvar(&self, signal: Signal) -> &Condvar {
        match signal {
            Signal::NotFull => &self.not_full,
            Signal::NotEmpty => &self.not_empty,
            Signal::Resumed => &self.resumed,
            Signal::StateChanged => &self.state_changed,
        }
    }

    /// Enqueue from outside the worker pool, blocking while full.
    ///
    /// Refused (with the unit handed back) once the queue is aborted,
    /// finished, halted or released, or when `deadline` passes.
    pub fn push(&self, unit: W, deadline: Option<Instant>) -> Result<(), PushError<W>> {
        let mut st = self.lock();
        let mut stalled = false;
        loop {
            let flags = st.flags();
            if st.is_released() {
                return Err(PushError::Closed(unit));
            }
            if flags.contains(ControlFlags::ABORT) {
                return Err(PushError::Aborted(unit));
            }
            if flags.contains(ControlFlags::FINISHED) {
                return Err(PushError::Finished(unit));
            }
            if flags.contains(ControlFlags::HALT) {
                return Err(PushError::Halted(unit));
            }
            if !st.is_full() {
                break;
            }
            if !stalled {
                stalled = true;
                self.stats.record_backpressure();
            }
            trace!(queue = %self.log_prefix, depth = st.len(), "Waiting for space to enqueue");
            if self.wait(Signal::NotFull, &mut st, deadline) {
                return Err(PushError::TimedOut(unit));
            }
        }

        st.items.push_back(unit);
        self.stats.record_enqueue();
        trace!(queue = %self.log_prefix, depth = st.len(), "Enqueued work");
        self.notify(Signal::NotEmpty);
        Ok(())
    }

    /// Dequeue from outside the worker pool, blocking while empty.
    ///
    /// Items are handed out even after an abort so the queue can be
    /// drained; only an empty queue reports a stop reason. `ABORT` and
    /// `FINISHED` always stop the wait, `extra_stop` adds more flags.
    pub fn pop(&self, extra_stop: ControlFlags, deadline: Option<Instant>) -> Popped<W> {
        let mut st = self.lock();
        loop {
            let depth = st.len();
            if let Some(unit) = st.try_pop() {
                self.stats.record_dequeue();
                trace!(queue = %self.log_prefix, depth, "Dequeued work");
                self.notify(Signal::NotFull);
                if st.maybe_finish() {
                    info!(queue = %self.log_prefix, "Queue drained with all producers retired; FINISHED");
                    self.broadcast();
                }
                return Popped::Item { unit, depth };
            }

            let flags = st.flags();
            if flags.contains(ControlFlags::ABORT) {
                return Popped::Aborted;
            }
            if flags.contains(ControlFlags::FINISHED) {
                return Popped::Finished;
            }
            if flags.intersects(extra_stop) {
                return Popped::Flagged(flags & extra_stop);
            }
            if self.wait(Signal::NotEmpty, &mut st, deadline) {
                return Popped::TimedOut;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    fn queue(capacity: usize) -> WorkQueue<u32> {
        WorkQueue::new(capacity, ControlFlags::NONE, 1, 1, "test")
    }

    #[test]
    fn test_queue_fifo() {
        let q = queue(4);
        q.push(1, None).unwrap();
        q.push(2, None).unwrap();
        q.push(3, None).unwrap();
        assert_eq!(q.len(), 3);

        match q.pop(ControlFlags::NONE, None) {
            Popped::Item { unit, depth } => {
                assert_eq!(unit, 1);
                assert_eq!(depth, 3);
            }
            other => panic!("unexpected {:?}", other),
        }
        assert!(matches!(q.pop(ControlFlags::NONE, None), Popped::Item { unit: 2, .. }));
        assert!(matches!(q.pop(ControlFlags::NONE, None), Popped::Item { unit: 3, .. }));
        assert!(q.is_empty());
    }

    #[test]
    fn test_push_blocks_until_space() {
        let q = Arc::new(queue(1));
        q.push(10, None).unwrap();

        let q2 = Arc::clone(&q);
        let pusher = thread::spawn(move || q2.push(11, None));

        while q.stats().snapshot().backpressure_events == 0 {
            thread::sleep(Duration::from_millis(1));
        }
        // wakeups without room must not count as new stalls
        for _ in 0..5 {
            q.notify_all(Signal::NotFull);
            thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(q.len(), 1, "queue must never exceed capacity");

        assert!(matches!(q.pop(ControlFlags::NONE, None), Popped::Item { unit: 10, .. }));
        pusher.join().unwrap().unwrap();
        assert!(matches!(q.pop(ControlFlags::NONE, None), Popped::Item { unit: 11, .. }));
        assert_eq!(q.stats().snapshot().backpressure_events, 1);
    }

    #[test]
    fn test_abort_releases_blocked_push() {
        let q = Arc::new(queue(1));
        q.push(1, None).unwrap();

        let q2 = Arc::clone(&q);
        let pusher = thread::spawn(move || q2.push(2, None));

        thread::sleep(Duration::from_millis(50));
        q.set_flags(ControlFlags::ABORT);

        let err = pusher.join().unwrap().unwrap_err();
        assert!(matches!(err, PushError::Aborted(_)));
        assert_eq!(err.into_inner(), 2);
        assert_eq!(q.len(), 1);
    }

    #[test]
    fn test_pop_distinguishes_stop_reasons() {
        let q = queue(2);
        q.set_flags(ControlFlags::HALT);
        assert!(matches!(
            q.pop(ControlFlags::HALT, None),
            Popped::Flagged(f) if f == ControlFlags::HALT
        ));

        q.set_flags(ControlFlags::ABORT);
        assert!(matches!(q.pop(ControlFlags::NONE, None), Popped::Aborted));

        let q = queue(2);
        q.set_flags(ControlFlags::FINISHED);
        assert!(matches!(q.pop(ControlFlags::NONE, None), Popped::Finished));
    }

    #[test]
    fn test_pop_drains_after_abort() {
        let q = queue(4);
        q.push(7, None).unwrap();
        q.set_flags(ControlFlags::ABORT);
        assert!(matches!(q.pop(ControlFlags::NONE, None), Popped::Item { unit: 7, .. }));
        assert!(matches!(q.pop(ControlFlags::NONE, None), Popped::Aborted));
    }

    #[test]
    fn test_pop_times_out() {
        let q = queue(1);
        let deadline = Instant::now() + Duration::from_millis(20);
        assert!(matches!(q.pop(ControlFlags::NONE, Some(deadline)), Popped::TimedOut));
    }

    #[test]
    fn test_caller_cannot_set_paused() {
        let q = queue(1);
        let flags = q.set_flags(ControlFlags::PAUSED);
        assert!(!flags.contains(ControlFlags::PAUSED));
    }

    #[test]
    fn test_pause_ack_requires_every_active_worker() {
        let q: WorkQueue<u32> = WorkQueue::new(4, ControlFlags::HALT, 3, 1, "ack");
        let mut st = q.lock();
        st.set_worker_state(0, WorkerState::Paused);
        st.set_worker_state(1, WorkerState::Paused);
        assert!(!st.flags().contains(ControlFlags::PAUSED));

        // a terminated worker no longer counts
        st.set_worker_state(2, WorkerState::Terminated);
        assert!(st.flags().contains(ControlFlags::PAUSED));

        st.clear(ControlFlags::HALT);
        assert!(!st.flags().contains(ControlFlags::PAUSED));
    }

    #[test]
    fn test_finish_needs_retired_producers_and_empty_queue() {
        let q: WorkQueue<u32> = WorkQueue::new(4, ControlFlags::NONE, 2, 2, "fin");
        let mut st = q.lock();
        st.try_push(1).unwrap();
        st.retire_producer();
        st.retire_producer();
        assert!(!st.maybe_finish());

        st.try_pop();
        assert!(st.maybe_finish());
        assert!(st.flags().contains(ControlFlags::FINISHED));

        st.raise(ControlFlags::ABORT);
        assert!(!st.maybe_finish());
    }
}
