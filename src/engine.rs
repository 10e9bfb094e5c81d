//! Thread queue supervisor
//!
//! The supervisor handle is responsible for:
//! - Validating options, allocating the queue and spawning workers
//! - Holding every worker at the startup gate until all have initialized
//! - Flag control, pause barriers and completion waits
//! - Ad-hoc enqueue/dequeue from the supervising thread
//! - Collecting worker contexts and releasing the queue

use crate::config::QueueOptions;
use crate::error::{ConfigError, HookResult, PushError, Result, TqError, WorkerError};
use crate::flags::ControlFlags;
use crate::queue::{Popped, Signal, StatsSnapshot, WorkQueue};
use crate::worker::{Consumer, InitFn, NoConsumer, Producer, Worker, WorkerState, WorkerStatus};
use std::mem;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info, warn};

/// A unit taken off the queue by the supervisor
#[derive(Debug)]
pub struct Dequeued<W> {
    pub unit: W,

    /// Queue depth before removal (always positive)
    pub depth: usize,
}

/// Cloneable flag handle, usable from other threads and signal handlers
pub struct QueueControl<W> {
    queue: Arc<WorkQueue<W>>,
}

impl<W> Clone for QueueControl<W> {
    fn clone(&self) -> Self {
        Self {
            queue: Arc::clone(&self.queue),
        }
    }
}

impl<W> QueueControl<W> {
    pub fn get_flags(&self) -> ControlFlags {
        self.queue.flags()
    }

    pub fn set_flags(&self, flags: ControlFlags) -> ControlFlags {
        self.queue.set_flags(flags)
    }

    pub fn unset_flags(&self, flags: ControlFlags) -> ControlFlags {
        self.queue.unset_flags(flags)
    }

    /// Request cancellation of the whole pass
    pub fn abort(&self) -> ControlFlags {
        self.queue.set_flags(ControlFlags::ABORT)
    }

    pub fn depth(&self) -> usize {
        self.queue.len()
    }
}

enum Slot<P, C> {
    Running(Worker<P, C>),
    Joined(std::result::Result<WorkerStatus<P, C>, WorkerError>),
    Collected,
}

/// Supervisor handle over a pool of producer and consumer threads
pub struct ThreadQueue<W, P, C = NoConsumer> {
    queue: Arc<WorkQueue<W>>,
    options: QueueOptions,
    workers: Vec<Slot<P, C>>,
    cursor: usize,
    closed: bool,
}

impl<W, P, C> ThreadQueue<W, P, C>
where
    W: Send + 'static,
    P: Producer<W> + Send + 'static,
    C: Consumer<W> + Send + 'static,
{
    /// Start a queue with `options.num_threads` workers.
    ///
    /// Workers `0..num_prod_threads` are producers built by `init_producer`,
    /// the rest consumers built by `init_consumer`. Each init runs on its own
    /// worker thread; no worker starts until all of them have succeeded. If
    /// any init fails the queue is aborted, every thread is joined and the
    /// failure is returned.
    pub fn init<G, FP, FC>(
        options: QueueOptions,
        global: Arc<G>,
        init_producer: FP,
        init_consumer: FC,
    ) -> Result<Self>
    where
        G: Send + Sync + 'static,
        FP: Fn(usize, &Arc<G>) -> HookResult<P> + Send + Sync + 'static,
        FC: Fn(usize, &Arc<G>) -> HookResult<C> + Send + Sync + 'static,
    {
        options.validate()?;

        let queue = Arc::new(WorkQueue::new(
            options.max_qdepth,
            options.init_flags,
            options.num_threads,
            options.num_prod_threads,
            options.log_prefix.clone(),
        ));
        let init_producer: Arc<InitFn<G, P>> = Arc::new(init_producer);
        let init_consumer: Arc<InitFn<G, C>> = Arc::new(init_consumer);

        let mut workers = Vec::with_capacity(options.num_threads);
        for id in 0..options.num_threads {
            let spawned = if id < options.num_prod_threads {
                Worker::spawn_producer(id, &queue, &global, &init_producer)
            } else {
                Worker::spawn_consumer(id, &queue, &global, &init_consumer)
            };

            match spawned {
                Ok(worker) => workers.push(worker),
                Err(e) => {
                    error!(queue = %options.log_prefix, worker = id, error = %e, "Failed to spawn worker");
                    {
                        let mut st = queue.lock();
                        // threads that never existed must not hold the gate
                        for rest in id..options.num_threads {
                            st.set_worker_state(rest, WorkerState::Terminated);
                            if rest < options.num_prod_threads {
                                st.retire_producer();
                            }
                        }
                        st.raise(ControlFlags::ABORT);
                        st.start();
                        queue.broadcast();
                    }
                    join_quietly(&options.log_prefix, workers);
                    return Err(e.into());
                }
            }
        }

        let failure = {
            let mut st = queue.lock();
            while st.initializing() {
                queue.wait(Signal::StateChanged, &mut st, None);
            }
            let failure = st.take_init_failure();
            if failure.is_some() {
                st.raise(ControlFlags::ABORT);
            }
            st.start();
            queue.broadcast();
            failure
        };

        if let Some((id, reason)) = failure {
            error!(queue = %options.log_prefix, worker = id, reason = %reason, "Worker init failed; queue aborted");
            join_quietly(&options.log_prefix, workers);
            return Err(WorkerError::InitFailed { id, reason }.into());
        }

        info!(
            queue = %options.log_prefix,
            threads = options.num_threads,
            producers = options.num_prod_threads,
            consumers = options.num_consumers(),
            depth = options.max_qdepth,
            flags = %queue.flags(),
            "Thread queue started"
        );

        Ok(Self {
            queue,
            options,
            workers: workers.into_iter().map(Slot::Running).collect(),
            cursor: 0,
            closed: false,
        })
    }
}

impl<W, P, C> ThreadQueue<W, P, C> {
    /// Options the queue was started with
    pub fn options(&self) -> &QueueOptions {
        &self.options
    }

    /// Current number of queued units
    pub fn depth(&self) -> usize {
        self.queue.len()
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.queue.stats().snapshot()
    }

    /// Lifecycle state of every worker, indexed by id
    pub fn worker_states(&self) -> Vec<WorkerState> {
        self.queue.lock().worker_states()
    }

    /// Handle for flag control from other threads
    pub fn controller(&self) -> QueueControl<W> {
        QueueControl {
            queue: Arc::clone(&self.queue),
        }
    }

    pub fn get_flags(&self) -> ControlFlags {
        self.queue.flags()
    }

    /// Set `HALT`, `ABORT` or `FINISHED`; `PAUSED` is engine-owned and ignored
    pub fn set_flags(&self, flags: ControlFlags) -> ControlFlags {
        self.queue.set_flags(flags)
    }

    pub fn unset_flags(&self, flags: ControlFlags) -> ControlFlags {
        self.queue.unset_flags(flags)
    }

    fn deadline(&self) -> Option<Instant> {
        self.options.wait_timeout.map(|t| Instant::now() + t)
    }

    fn timeout(&self, op: &'static str) -> TqError {
        TqError::Timeout {
            op,
            after: self.options.wait_timeout.unwrap_or_default(),
        }
    }

    /// Block until every active worker has acknowledged a halt
    pub fn wait_for_pause(&self) -> Result<()> {
        let deadline = self.deadline();
        let mut st = self.queue.lock();
        let mut timed_out = false;
        loop {
            let flags = st.flags();
            if !flags.contains(ControlFlags::HALT) {
                return Err(TqError::NotHalted { flags });
            }
            if flags.is_terminal() {
                return Err(TqError::Terminal { flags });
            }
            if flags.contains(ControlFlags::PAUSED) {
                info!(queue = %self.queue.log_prefix(), "All workers paused");
                return Ok(());
            }
            if timed_out {
                return Err(self.timeout("wait_for_pause"));
            }
            timed_out = self.queue.wait(Signal::StateChanged, &mut st, deadline);
        }
    }

    /// Block until a flag outside `ignore` is set; returns the flags seen
    pub fn wait_for_flags(&self, ignore: ControlFlags) -> Result<ControlFlags> {
        if ignore.contains(ControlFlags::CALLER_MASK) {
            return Err(ConfigError::IgnoresAllFlags.into());
        }
        let watch = ControlFlags::CALLER_MASK.difference(ignore);

        let deadline = self.deadline();
        let mut st = self.queue.lock();
        let mut timed_out = false;
        loop {
            let flags = st.flags();
            if flags.intersects(watch) {
                debug!(queue = %self.queue.log_prefix(), flags = %flags, "Observed flags");
                return Ok(flags);
            }
            if timed_out {
                return Err(self.timeout("wait_for_flags"));
            }
            timed_out = self.queue.wait(Signal::StateChanged, &mut st, deadline);
        }
    }

    /// Block until every worker has terminated.
    ///
    /// Fails if the queue aborts, or with `PossibleDeadlock` when items sit
    /// in a queue without consumers while producers are still running.
    pub fn wait_for_completion(&self) -> Result<()> {
        let deadline = self.deadline();
        let mut st = self.queue.lock();
        let mut timed_out = false;
        loop {
            let flags = st.flags();
            if flags.contains(ControlFlags::ABORT) {
                return Err(TqError::Terminal { flags });
            }
            if st.unterminated() == 0 {
                info!(queue = %self.queue.log_prefix(), "All workers terminated");
                return Ok(());
            }
            if st.num_consumers() == 0 && !st.is_empty() && st.producers_live() > 0 {
                let depth = st.len();
                warn!(queue = %self.queue.log_prefix(), depth, "No consumers to drain queued work");
                return Err(TqError::PossibleDeadlock { depth });
            }
            if timed_out {
                return Err(self.timeout("wait_for_completion"));
            }
            timed_out = self.queue.wait(Signal::StateChanged, &mut st, deadline);
        }
    }

    /// Take a unit off the queue from the supervising thread.
    ///
    /// Returns `Ok(None)` once the queue is empty and `ABORT`, `FINISHED` or
    /// a flag in `terminal_mask` is set. Queued units are still handed out
    /// after an abort.
    pub fn dequeue(&self, terminal_mask: ControlFlags) -> Result<Option<Dequeued<W>>> {
        if self.closed {
            return Err(TqError::Closed);
        }
        match self.queue.pop(terminal_mask, self.deadline()) {
            Popped::Item { unit, depth } => Ok(Some(Dequeued { unit, depth })),
            Popped::Finished | Popped::Aborted | Popped::Flagged(_) => Ok(None),
            Popped::TimedOut => Err(self.timeout("dequeue")),
        }
    }

    /// Add a unit from the supervising thread; blocks while full
    pub fn enqueue(&self, unit: W) -> std::result::Result<(), PushError<W>> {
        if self.closed {
            return Err(PushError::Closed(unit));
        }
        self.queue.push(unit, self.deadline())
    }

    /// Collect the next worker's context, in id order.
    ///
    /// Only valid once every worker has terminated. Returns `Ok(None)` after
    /// the last worker.
    pub fn next_thread_status(&mut self) -> Result<Option<WorkerStatus<P, C>>> {
        let running = self.queue.lock().unterminated();
        if running > 0 {
            return Err(TqError::WorkersRunning { running });
        }
        self.join_workers();

        while self.cursor < self.workers.len() {
            let slot = mem::replace(&mut self.workers[self.cursor], Slot::Collected);
            self.cursor += 1;
            match slot {
                Slot::Joined(Ok(status)) => return Ok(Some(status)),
                Slot::Joined(Err(e)) => return Err(e.into()),
                Slot::Running(worker) => return worker.join().map(Some).map_err(Into::into),
                Slot::Collected => continue,
            }
        }
        Ok(None)
    }

    /// Join every worker and release the queue.
    ///
    /// A queue that is neither finished nor aborted is aborted first. If
    /// units remain queued their count is returned and nothing is released;
    /// drain with `dequeue` and close again.
    pub fn close(&mut self) -> Result<usize> {
        if self.closed {
            return Ok(0);
        }

        let flags = self.queue.flags();
        if !flags.is_terminal() {
            warn!(queue = %self.queue.log_prefix(), flags = %flags, "Closing a live queue; forcing ABORT");
            self.queue.set_flags(ControlFlags::ABORT);
        }
        self.join_workers();

        let mut st = self.queue.lock();
        let depth = st.len();
        if depth > 0 {
            warn!(queue = %self.queue.log_prefix(), depth, "Cannot close a non-empty queue");
            return Ok(depth);
        }
        st.release();
        self.closed = true;
        info!(queue = %self.queue.log_prefix(), "Thread queue closed");
        Ok(0)
    }

    fn join_workers(&mut self) {
        for slot in self.workers.iter_mut() {
            if let Slot::Running(_) = slot {
                if let Slot::Running(worker) = mem::replace(slot, Slot::Collected) {
                    debug!(
                        queue = %self.queue.log_prefix(),
                        worker = worker.id(),
                        role = %worker.role(),
                        "Joining worker"
                    );
                    *slot = Slot::Joined(worker.join());
                }
            }
        }
    }
}

impl<W, P, C> Drop for ThreadQueue<W, P, C> {
    fn drop(&mut self) {
        if self.closed {
            return;
        }
        if !self.queue.flags().is_terminal() {
            debug!(queue = %self.queue.log_prefix(), "Dropping a live queue; forcing ABORT");
            self.queue.set_flags(ControlFlags::ABORT);
        }
        self.join_workers();
    }
}

fn join_quietly<P, C>(prefix: &str, workers: Vec<Worker<P, C>>) {
    for worker in workers {
        let id = worker.id();
        if let Err(e) = worker.join() {
            debug!(queue = %prefix, worker = id, error = %e, "Worker exited during failed startup");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::HookError;
    use crate::worker::{Flow, WorkerHooks};
    use std::time::Duration;

    struct Emit {
        left: u32,
    }

    impl WorkerHooks<u32> for Emit {}

    impl Producer<u32> for Emit {
        fn produce(&mut self, slot: &mut Option<u32>) -> Flow {
            if self.left == 0 {
                return Flow::Done;
            }
            *slot = Some(self.left);
            self.left -= 1;
            Flow::Continue
        }
    }

    #[derive(Default)]
    struct Sink {
        seen: usize,
    }

    impl WorkerHooks<u32> for Sink {}

    impl Consumer<u32> for Sink {
        fn consume(&mut self, slot: &mut Option<u32>) -> Flow {
            slot.take();
            self.seen += 1;
            Flow::Continue
        }
    }

    fn start(opts: QueueOptions, per_producer: u32) -> ThreadQueue<u32, Emit, Sink> {
        ThreadQueue::init(
            opts,
            Arc::new(()),
            move |_, _| Ok(Emit { left: per_producer }),
            |_, _| Ok(Sink::default()),
        )
        .unwrap()
    }

    #[test]
    fn test_rejects_invalid_options() {
        let result: Result<ThreadQueue<u32, Emit, Sink>> = ThreadQueue::init(
            QueueOptions::new(2, 3, 4),
            Arc::new(()),
            |_, _| Ok(Emit { left: 1 }),
            |_, _| Ok(Sink::default()),
        );
        assert!(matches!(
            result,
            Err(TqError::Config(ConfigError::InvalidProducerCount { .. }))
        ));
    }

    #[test]
    fn test_init_failure_reports_worker() {
        let result: Result<ThreadQueue<u32, Emit, Sink>> = ThreadQueue::init(
            QueueOptions::new(3, 1, 4),
            Arc::new(()),
            |_, _| Ok(Emit { left: 100 }),
            |id, _| {
                if id == 2 {
                    Err(HookError::new("no target volume"))
                } else {
                    Ok(Sink::default())
                }
            },
        );
        match result {
            Err(TqError::Worker(WorkerError::InitFailed { id, reason })) => {
                assert_eq!(id, 2);
                assert_eq!(reason, "no target volume");
            }
            Err(e) => panic!("unexpected error: {}", e),
            Ok(_) => panic!("init should fail"),
        }
    }

    #[test]
    fn test_runs_to_completion() {
        let mut tq = start(QueueOptions::new(3, 1, 4), 50);
        tq.wait_for_completion().unwrap();
        assert!(tq.get_flags().contains(ControlFlags::FINISHED));

        let mut consumed = 0;
        while let Some(status) = tq.next_thread_status().unwrap() {
            if let Some(sink) = status.into_consumer() {
                consumed += sink.seen;
            }
        }
        assert_eq!(consumed, 50);
        assert_eq!(tq.close().unwrap(), 0);
        assert_eq!(tq.close().unwrap(), 0);
    }

    #[test]
    fn test_misuse_errors() {
        let tq = start(
            QueueOptions::new(2, 1, 4).with_init_flags(ControlFlags::HALT),
            10,
        );

        assert!(matches!(
            tq.wait_for_flags(ControlFlags::CALLER_MASK),
            Err(TqError::Config(ConfigError::IgnoresAllFlags))
        ));

        tq.wait_for_pause().unwrap();
        tq.unset_flags(ControlFlags::HALT);
        assert!(matches!(
            tq.wait_for_pause(),
            Err(TqError::NotHalted { .. })
        ));
    }

    #[test]
    fn test_status_requires_terminated_workers() {
        let mut tq = start(
            QueueOptions::new(2, 1, 4).with_init_flags(ControlFlags::HALT),
            10,
        );
        tq.wait_for_pause().unwrap();
        assert!(matches!(
            tq.next_thread_status(),
            Err(TqError::WorkersRunning { running: 2 })
        ));
        assert_eq!(tq.close().unwrap(), 0);
    }

    #[test]
    fn test_wait_timeout() {
        let tq = start(
            QueueOptions::new(2, 1, 4)
                .with_init_flags(ControlFlags::HALT)
                .with_wait_timeout(Duration::from_millis(30)),
            10,
        );
        assert!(matches!(
            tq.wait_for_flags(ControlFlags::HALT),
            Err(TqError::Timeout {
                op: "wait_for_flags",
                ..
            })
        ));
    }

    #[test]
    fn test_controller_aborts_from_another_thread() {
        let tq = start(
            QueueOptions::new(2, 1, 4).with_init_flags(ControlFlags::HALT),
            10,
        );
        let control = tq.controller();
        std::thread::spawn(move || {
            control.abort();
        })
        .join()
        .unwrap();

        let flags = tq.wait_for_flags(ControlFlags::HALT).unwrap();
        assert!(flags.contains(ControlFlags::ABORT));
        assert!(matches!(tq.wait_for_completion(), Err(TqError::Terminal { .. })));
    }
}
