//! Worker roles and the per-thread lifecycle
//!
//! Every worker thread:
//! - Builds its private context with the caller's init hook
//! - Waits at the startup gate until every peer has initialized
//! - Runs the producer or consumer loop, honouring halt and abort
//! - Hands any held unit to its terminate hook and stays joinable
//!
//! Producers emit work through `produce`; whatever they leave in the slot
//! is enqueued on their behalf. Consumers receive dequeued units through
//! `consume`; a unit left in the slot is retained and handed back on the
//! next call instead of a fresh one.

use crate::error::{HookError, HookResult, WorkerError};
use crate::flags::ControlFlags;
use crate::queue::{QueueState, Signal, WorkQueue};
use parking_lot::MutexGuard;
use std::any::Any;
use std::fmt;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tracing::{debug, error, info, trace, warn};

/// Result of one `produce` or `consume` call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    /// Keep going
    Continue,

    /// This worker has nothing more to do
    Done,

    /// Request a queue-wide halt
    Pause,

    /// Request a queue-wide abort
    Abort,
}

impl Flow {
    /// Map an integer status: 0 continue, 1 done, above 1 pause, negative abort
    pub fn from_code(code: i32) -> Self {
        match code {
            0 => Flow::Continue,
            1 => Flow::Done,
            c if c > 1 => Flow::Pause,
            _ => Flow::Abort,
        }
    }
}

/// How a worker left its main loop
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    Finished,
    Aborted,
}

impl fmt::Display for Termination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Termination::Finished => f.write_str("finished"),
            Termination::Aborted => f.write_str("aborted"),
        }
    }
}

/// Lifecycle state of one worker
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Init,
    Running,
    Pausing,
    Paused,
    Resuming,
    Finishing,
    Aborting,
    Terminated,
}

impl WorkerState {
    /// Active workers are the ones the pause acknowledgment waits for
    pub fn is_active(self) -> bool {
        matches!(
            self,
            WorkerState::Init
                | WorkerState::Running
                | WorkerState::Pausing
                | WorkerState::Paused
                | WorkerState::Resuming
        )
    }
}

/// Which loop a worker runs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Producer,
    Consumer,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Producer => f.write_str("producer"),
            Role::Consumer => f.write_str("consumer"),
        }
    }
}

/// Hooks shared by both roles
///
/// `held` is the unit the worker currently owns, if any. Pause and resume
/// hooks may inspect or replace it; an error from either aborts the queue.
pub trait WorkerHooks<W> {
    fn on_pause(&mut self, _held: &mut Option<W>) -> HookResult {
        Ok(())
    }

    fn on_resume(&mut self, _held: &mut Option<W>) -> HookResult {
        Ok(())
    }

    /// Called exactly once, after the worker leaves its loop
    fn on_terminate(&mut self, _held: Option<W>, _how: Termination) {}
}

/// A worker that generates units
pub trait Producer<W>: WorkerHooks<W> {
    /// Called with an empty slot; a unit left in it is enqueued
    fn produce(&mut self, slot: &mut Option<W>) -> Flow;
}

/// A worker that processes units
pub trait Consumer<W>: WorkerHooks<W> {
    /// Called with a dequeued (or retained) unit; leave it in the slot to
    /// get it back on the next call
    fn consume(&mut self, slot: &mut Option<W>) -> Flow;
}

/// Consumer type for setups where every worker is a producer
#[derive(Debug)]
pub enum NoConsumer {}

impl NoConsumer {
    /// Consumer init for queues whose workers are all producers
    pub fn init<G>(id: usize, _global: &Arc<G>) -> HookResult<NoConsumer> {
        Err(HookError::new(format!("worker {} has no consumer role", id)))
    }
}

impl<W> WorkerHooks<W> for NoConsumer {}

impl<W> Consumer<W> for NoConsumer {
    fn consume(&mut self, _slot: &mut Option<W>) -> Flow {
        match *self {}
    }
}

/// Worker-context factory: `(worker_id, global_state) -> context`
pub type InitFn<G, T> = dyn Fn(usize, &Arc<G>) -> HookResult<T> + Send + Sync;

/// Context of a terminated worker
#[derive(Debug)]
pub enum WorkerContext<P, C> {
    Producer(P),
    Consumer(C),
}

/// What a joined worker reports back
#[derive(Debug)]
pub struct WorkerStatus<P, C> {
    pub id: usize,
    pub termination: Termination,
    pub context: WorkerContext<P, C>,
}

impl<P, C> WorkerStatus<P, C> {
    pub fn role(&self) -> Role {
        match self.context {
            WorkerContext::Producer(_) => Role::Producer,
            WorkerContext::Consumer(_) => Role::Consumer,
        }
    }

    pub fn into_consumer(self) -> Option<C> {
        match self.context {
            WorkerContext::Consumer(c) => Some(c),
            WorkerContext::Producer(_) => None,
        }
    }
}

type Guard<'a, W> = MutexGuard<'a, QueueState<W>>;

/// A spawned worker thread
pub(crate) struct Worker<P, C> {
    id: usize,
    role: Role,
    handle: JoinHandle<Result<WorkerStatus<P, C>, WorkerError>>,
}

impl<P, C> Worker<P, C>
where
    P: Send + 'static,
    C: Send + 'static,
{
    /// Spawn a producer thread
    pub(crate) fn spawn_producer<W, G>(
        id: usize,
        queue: &Arc<WorkQueue<W>>,
        global: &Arc<G>,
        init: &Arc<InitFn<G, P>>,
    ) -> Result<Self, WorkerError>
    where
        W: Send + 'static,
        G: Send + Sync + 'static,
        P: Producer<W>,
    {
        let queue = Arc::clone(queue);
        let global = Arc::clone(global);
        let init = Arc::clone(init);
        Self::spawn(id, Role::Producer, move || {
            run_worker(&*queue, &global, id, Role::Producer, &*init, producer_loop::<W, P>).map(
                |(termination, ctx)| WorkerStatus {
                    id,
                    termination,
                    context: WorkerContext::Producer(ctx),
                },
            )
        })
    }

    /// Spawn a consumer thread
    pub(crate) fn spawn_consumer<W, G>(
        id: usize,
        queue: &Arc<WorkQueue<W>>,
        global: &Arc<G>,
        init: &Arc<InitFn<G, C>>,
    ) -> Result<Self, WorkerError>
    where
        W: Send + 'static,
        G: Send + Sync + 'static,
        C: Consumer<W>,
    {
        let queue = Arc::clone(queue);
        let global = Arc::clone(global);
        let init = Arc::clone(init);
        Self::spawn(id, Role::Consumer, move || {
            run_worker(&*queue, &global, id, Role::Consumer, &*init, consumer_loop::<W, C>).map(
                |(termination, ctx)| WorkerStatus {
                    id,
                    termination,
                    context: WorkerContext::Consumer(ctx),
                },
            )
        })
    }

    fn spawn<F>(id: usize, role: Role, body: F) -> Result<Self, WorkerError>
    where
        F: FnOnce() -> Result<WorkerStatus<P, C>, WorkerError> + Send + 'static,
    {
        let name = match role {
            Role::Producer => format!("tq-prod-{}", id),
            Role::Consumer => format!("tq-cons-{}", id),
        };
        let handle = thread::Builder::new()
            .name(name)
            .spawn(body)
            .map_err(|e| WorkerError::SpawnFailed {
                id,
                reason: e.to_string(),
            })?;

        Ok(Self { id, role, handle })
    }

}

impl<P, C> Worker<P, C> {
    pub(crate) fn id(&self) -> usize {
        self.id
    }

    pub(crate) fn role(&self) -> Role {
        self.role
    }

    /// Wait for the thread and collect its status
    pub(crate) fn join(self) -> Result<WorkerStatus<P, C>, WorkerError> {
        let id = self.id;
        match self.handle.join() {
            Ok(result) => result,
            Err(payload) => Err(WorkerError::Panicked {
                id,
                message: panic_message(payload.as_ref()),
            }),
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "Worker thread panicked".into()
    }
}

/// Keeps the queue consistent if a worker thread unwinds
struct PanicGuard<'a, W> {
    queue: &'a WorkQueue<W>,
    id: usize,
    role: Role,
}

impl<W> Drop for PanicGuard<'_, W> {
    fn drop(&mut self) {
        if !thread::panicking() {
            return;
        }
        let mut st = self.queue.lock();
        let prior = st.worker_state(self.id);
        if prior == WorkerState::Init {
            st.record_init_failure(self.id, "panicked during init".into());
        }
        if self.role == Role::Producer && prior.is_active() {
            st.retire_producer();
        }
        st.set_worker_state(self.id, WorkerState::Terminated);
        st.raise(ControlFlags::ABORT);
        error!(
            queue = %self.queue.log_prefix(),
            worker = self.id,
            role = %self.role,
            "Worker panicked; aborting queue"
        );
        self.queue.broadcast();
    }
}

/// Init, startup gate, main loop
fn run_worker<W, G, T>(
    queue: &WorkQueue<W>,
    global: &Arc<G>,
    id: usize,
    role: Role,
    init: &InitFn<G, T>,
    body: fn(&WorkQueue<W>, usize, &mut T) -> Termination,
) -> Result<(Termination, T), WorkerError> {
    let _guard = PanicGuard { queue, id, role };
    debug!(queue = %queue.log_prefix(), worker = id, role = %role, "Worker initializing");

    let mut ctx = match init(id, global) {
        Ok(ctx) => ctx,
        Err(e) => {
            error!(queue = %queue.log_prefix(), worker = id, error = %e, "Worker init failed");
            let mut st = queue.lock();
            st.record_init_failure(id, e.reason.clone());
            if role == Role::Producer {
                st.retire_producer();
            }
            st.set_worker_state(id, WorkerState::Terminated);
            st.raise(ControlFlags::ABORT);
            queue.broadcast();
            return Err(WorkerError::InitFailed {
                id,
                reason: e.reason,
            });
        }
    };

    {
        let mut st = queue.lock();
        st.set_worker_state(id, WorkerState::Running);
        queue.notify_all(Signal::StateChanged);
        while !st.is_started() {
            queue.wait(Signal::StateChanged, &mut st, None);
        }
    }

    info!(queue = %queue.log_prefix(), worker = id, role = %role, "Worker starting");
    let termination = body(queue, id, &mut ctx);
    info!(
        queue = %queue.log_prefix(),
        worker = id,
        role = %role,
        termination = %termination,
        "Worker terminated"
    );
    Ok((termination, ctx))
}

/// Producer main loop
pub(crate) fn producer_loop<W, P: Producer<W>>(
    queue: &WorkQueue<W>,
    id: usize,
    ctx: &mut P,
) -> Termination {
    let mut held: Option<W> = None;
    let mut done = false;
    let mut stalled = false;
    let mut st = queue.lock();

    let how = loop {
        loop {
            let flags = st.flags();
            if flags.contains(ControlFlags::ABORT) {
                break;
            }
            if flags.is_halted() {
                if !hold_while_halted(queue, &mut st, id, ctx, &mut held) {
                    break;
                }
                continue;
            }
            if held.is_some() && st.is_full() {
                if !stalled {
                    stalled = true;
                    queue.stats().record_backpressure();
                }
                // a stalled producer matters to deadlock detection
                queue.notify_all(Signal::StateChanged);
                queue.wait(Signal::NotFull, &mut st, None);
                continue;
            }
            break;
        }

        if st.flags().contains(ControlFlags::ABORT) {
            break Termination::Aborted;
        }

        if let Some(unit) = held.take() {
            match st.try_push(unit) {
                Ok(()) => {
                    stalled = false;
                    queue.stats().record_enqueue();
                    trace!(queue = %queue.log_prefix(), worker = id, depth = st.len(), "Enqueued work");
                    queue.notify(Signal::NotEmpty);
                }
                Err(unit) => {
                    held = Some(unit);
                    continue;
                }
            }
        }

        if done || st.flags().contains(ControlFlags::FINISHED) {
            break Termination::Finished;
        }

        let flow = MutexGuard::unlocked(&mut st, || ctx.produce(&mut held));
        match flow {
            Flow::Continue => {}
            Flow::Done => {
                debug!(queue = %queue.log_prefix(), worker = id, "Producer exhausted");
                done = true;
            }
            Flow::Pause => request_halt(queue, &mut st, id),
            Flow::Abort => raise_abort(queue, &mut st, id, "produce returned abort"),
        }
    };

    retire(queue, st, id, Role::Producer, how, ctx, held);
    how
}

/// Consumer main loop
pub(crate) fn consumer_loop<W, C: Consumer<W>>(
    queue: &WorkQueue<W>,
    id: usize,
    ctx: &mut C,
) -> Termination {
    let mut held: Option<W> = None;
    let mut st = queue.lock();

    let how = loop {
        loop {
            let flags = st.flags();
            if flags.contains(ControlFlags::ABORT) {
                break;
            }
            if flags.is_halted() {
                if !hold_while_halted(queue, &mut st, id, ctx, &mut held) {
                    break;
                }
                continue;
            }
            if held.is_none() && st.is_empty() {
                if st.producers_live() == 0 {
                    break;
                }
                queue.wait(Signal::NotEmpty, &mut st, None);
                continue;
            }
            break;
        }

        if st.flags().contains(ControlFlags::ABORT) {
            break Termination::Aborted;
        }

        if held.is_none() {
            let depth = st.len();
            match st.try_pop() {
                Some(unit) => {
                    queue.stats().record_dequeue();
                    trace!(queue = %queue.log_prefix(), worker = id, depth, "Dequeued work");
                    queue.notify(Signal::NotFull);
                    if st.maybe_finish() {
                        info!(queue = %queue.log_prefix(), "Queue drained with all producers retired; FINISHED");
                        queue.broadcast();
                    }
                    held = Some(unit);
                }
                // producers gone and nothing left
                None => break Termination::Finished,
            }
        }

        let flow = MutexGuard::unlocked(&mut st, || ctx.consume(&mut held));
        match flow {
            Flow::Continue => {}
            Flow::Done => break Termination::Finished,
            Flow::Pause => request_halt(queue, &mut st, id),
            Flow::Abort => raise_abort(queue, &mut st, id, "consume returned abort"),
        }
    };

    retire(queue, st, id, Role::Consumer, how, ctx, held);
    how
}

/// Park until the halt clears. Returns false if the queue aborted instead.
fn hold_while_halted<W, T: WorkerHooks<W>>(
    queue: &WorkQueue<W>,
    st: &mut Guard<'_, W>,
    id: usize,
    ctx: &mut T,
    held: &mut Option<W>,
) -> bool {
    st.set_worker_state(id, WorkerState::Pausing);
    debug!(queue = %queue.log_prefix(), worker = id, holding = held.is_some(), "Worker pausing");

    if let Err(e) = MutexGuard::unlocked(st, || ctx.on_pause(held)) {
        raise_abort(queue, st, id, &format!("pause hook failed: {}", e));
        return false;
    }

    st.set_worker_state(id, WorkerState::Paused);
    queue.stats().record_pause();
    if st.flags().contains(ControlFlags::PAUSED) {
        debug!(queue = %queue.log_prefix(), "All active workers paused");
    }
    queue.notify_all(Signal::StateChanged);

    while st.flags().is_halted() && !st.flags().contains(ControlFlags::ABORT) {
        queue.wait(Signal::Resumed, st, None);
    }
    if st.flags().contains(ControlFlags::ABORT) {
        return false;
    }

    st.set_worker_state(id, WorkerState::Resuming);
    debug!(queue = %queue.log_prefix(), worker = id, "Worker resuming");
    if let Err(e) = MutexGuard::unlocked(st, || ctx.on_resume(held)) {
        raise_abort(queue, st, id, &format!("resume hook failed: {}", e));
        return false;
    }
    st.set_worker_state(id, WorkerState::Running);
    queue.notify_all(Signal::StateChanged);
    true
}

/// Set HALT on behalf of a worker; ignored once the queue is terminal
fn request_halt<W>(queue: &WorkQueue<W>, st: &mut Guard<'_, W>, id: usize) {
    if st.flags().is_terminal() || st.flags().contains(ControlFlags::HALT) {
        return;
    }
    st.raise(ControlFlags::HALT);
    info!(queue = %queue.log_prefix(), worker = id, "Worker requested halt");
    queue.broadcast();
}

fn raise_abort<W>(queue: &WorkQueue<W>, st: &mut Guard<'_, W>, id: usize, reason: &str) {
    if st.flags().contains(ControlFlags::ABORT) {
        return;
    }
    st.raise(ControlFlags::ABORT);
    warn!(queue = %queue.log_prefix(), worker = id, reason, "Worker raised ABORT");
    queue.broadcast();
}

/// Leave the loop: announce, run the terminate hook, mark terminated
fn retire<W, T: WorkerHooks<W>>(
    queue: &WorkQueue<W>,
    mut st: Guard<'_, W>,
    id: usize,
    role: Role,
    how: Termination,
    ctx: &mut T,
    held: Option<W>,
) {
    let state = match how {
        Termination::Finished => WorkerState::Finishing,
        Termination::Aborted => WorkerState::Aborting,
    };
    st.set_worker_state(id, state);
    if role == Role::Producer {
        st.retire_producer();
        debug!(
            queue = %queue.log_prefix(),
            worker = id,
            producers_left = st.producers_live(),
            "Producer retired"
        );
    }
    if st.maybe_finish() {
        info!(queue = %queue.log_prefix(), "All producers retired with an empty queue; FINISHED");
        queue.broadcast();
    } else {
        queue.notify_all(Signal::NotEmpty);
        queue.notify_all(Signal::StateChanged);
    }

    if held.is_some() {
        debug!(queue = %queue.log_prefix(), worker = id, "Terminating with a held unit");
    }
    MutexGuard::unlocked(&mut st, || ctx.on_terminate(held, how));

    st.set_worker_state(id, WorkerState::Terminated);
    queue.notify_all(Signal::StateChanged);
}
