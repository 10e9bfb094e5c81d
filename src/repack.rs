//! Synthetic repack pass
//!
//! Producers issue object ids from a shared counter; consumers "move" each
//! object and forward a record to a tally thread that keeps the totals and
//! drives the progress display. The supervisor follows the usual flow:
//! watch flags, checkpoint on pauses, drain on abort, then collect every
//! worker's report and close the queue.

use crate::config::DemoConfig;
use crate::engine::{QueueControl, ThreadQueue};
use crate::error::{HookResult, Result, TqError};
use crate::flags::ControlFlags;
use crate::progress::{ProgressReporter, RepackProgress, Summary};
use crate::worker::{Consumer, Flow, Producer, Termination, WorkerContext, WorkerHooks};
use crossbeam_channel::{bounded, Receiver, Sender};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Instant;
use tracing::{debug, info, warn};

/// Records buffered between consumers and the tally thread
const TALLY_CHANNEL_SIZE: usize = 4096;

/// Progress refresh interval, in moved objects
const PROGRESS_EVERY: u64 = 256;

/// One object to relocate
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ObjectRef {
    pub id: u64,
    pub size: u64,
}

/// A completed move, sent to the tally thread
#[derive(Debug, Clone, Copy)]
pub struct MoveRecord {
    pub worker: usize,
    pub object: ObjectRef,
}

/// State shared by every worker of a pass
#[derive(Debug)]
pub struct RepackState {
    total: u64,
    object_size: u64,
    pause_after: Option<u64>,
    abort_after: Option<u64>,
    next_id: AtomicU64,
    claimed: AtomicU64,
}

impl RepackState {
    pub fn new(config: &DemoConfig) -> Self {
        Self {
            total: config.objects,
            object_size: config.object_size,
            pause_after: config.pause_after,
            abort_after: config.abort_after,
            next_id: AtomicU64::new(0),
            claimed: AtomicU64::new(0),
        }
    }

    /// Objects handed out so far
    pub fn issued(&self) -> u64 {
        self.next_id.load(Ordering::Relaxed).min(self.total)
    }
}

/// Producer: issues object ids until the pass total is reached
#[derive(Debug)]
pub struct Issuer {
    state: Arc<RepackState>,
    pub issued: u64,
    pub unissued: u64,
}

impl WorkerHooks<ObjectRef> for Issuer {
    fn on_terminate(&mut self, held: Option<ObjectRef>, how: Termination) {
        if let Some(object) = held {
            debug!(object = object.id, termination = %how, "Issuer exiting with an unqueued object");
            self.unissued += 1;
        }
    }
}

impl Producer<ObjectRef> for Issuer {
    fn produce(&mut self, slot: &mut Option<ObjectRef>) -> Flow {
        let id = self.state.next_id.fetch_add(1, Ordering::Relaxed);
        if id >= self.state.total {
            return Flow::Done;
        }
        *slot = Some(ObjectRef {
            id,
            size: self.state.object_size,
        });
        self.issued += 1;
        Flow::Continue
    }
}

/// Consumer: moves objects and reports them to the tally
#[derive(Debug)]
pub struct Mover {
    id: usize,
    state: Arc<RepackState>,
    tally: Option<Sender<MoveRecord>>,
    pub objects: u64,
    pub bytes: u64,
    pub retained: u64,
}

impl Mover {
    pub fn new(id: usize, state: Arc<RepackState>, tally: Sender<MoveRecord>) -> Self {
        Self {
            id,
            state,
            tally: Some(tally),
            objects: 0,
            bytes: 0,
            retained: 0,
        }
    }

    fn record(&mut self, object: ObjectRef) {
        self.objects += 1;
        self.bytes += object.size;
        if let Some(tally) = &self.tally {
            // a closed tally only loses display updates
            let _ = tally.send(MoveRecord {
                worker: self.id,
                object,
            });
        }
    }
}

impl WorkerHooks<ObjectRef> for Mover {
    fn on_pause(&mut self, held: &mut Option<ObjectRef>) -> HookResult {
        debug!(worker = self.id, holding = held.is_some(), "Mover paused");
        Ok(())
    }

    fn on_terminate(&mut self, held: Option<ObjectRef>, how: Termination) {
        if let Some(object) = held {
            warn!(worker = self.id, object = object.id, termination = %how, "Mover left an object unmoved");
            self.retained += 1;
        }
        self.tally = None;
    }
}

impl Consumer<ObjectRef> for Mover {
    fn consume(&mut self, slot: &mut Option<ObjectRef>) -> Flow {
        let Some(object) = slot.take() else {
            return Flow::Continue;
        };

        let n = self.state.claimed.fetch_add(1, Ordering::Relaxed) + 1;
        if self.state.abort_after == Some(n) {
            *slot = Some(object);
            return Flow::Abort;
        }

        self.record(object);

        if self.state.pause_after == Some(n) {
            Flow::Pause
        } else {
            Flow::Continue
        }
    }
}

/// Totals kept by the tally thread
#[derive(Debug, Clone, Copy, Default)]
struct Tally {
    objects: u64,
    bytes: u64,
}

fn spawn_tally(
    rx: Receiver<MoveRecord>,
    state: Arc<RepackState>,
    control: QueueControl<ObjectRef>,
    progress: Option<ProgressReporter>,
    start: Instant,
) -> Result<JoinHandle<Tally>> {
    thread::Builder::new()
        .name("tq-tally".into())
        .spawn(move || {
            let mut tally = Tally::default();
            for record in rx {
                tally.objects += 1;
                tally.bytes += record.object.size;
                if let Some(p) = &progress {
                    if tally.objects % PROGRESS_EVERY == 0 {
                        p.update(&RepackProgress {
                            issued: state.issued(),
                            moved: tally.objects,
                            bytes: tally.bytes,
                            queue_depth: control.depth(),
                            flags: control.get_flags(),
                            elapsed: start.elapsed(),
                        });
                    }
                }
            }
            tally
        })
        .map_err(TqError::from)
}

/// Collect the tally totals; a panicked tally leaves zeros behind
fn join_tally(handle: JoinHandle<Tally>) -> Tally {
    match handle.join() {
        Ok(totals) => totals,
        Err(_) => {
            warn!("Tally thread panicked; progress totals unavailable");
            Tally::default()
        }
    }
}

/// A started repack pass
pub struct RepackPass {
    config: DemoConfig,
    state: Arc<RepackState>,
    queue: ThreadQueue<ObjectRef, Issuer, Mover>,
    tally_tx: Sender<MoveRecord>,
    tally: JoinHandle<Tally>,
    start: Instant,
}

impl RepackPass {
    /// Spawn the worker pool and the tally thread
    pub fn start(config: DemoConfig, progress: Option<ProgressReporter>) -> Result<Self> {
        let start = Instant::now();
        let state = Arc::new(RepackState::new(&config));
        let (tally_tx, tally_rx) = bounded(TALLY_CHANNEL_SIZE);

        let consumer_tx = tally_tx.clone();
        let queue = ThreadQueue::init(
            config.queue.clone(),
            Arc::clone(&state),
            |_, state: &Arc<RepackState>| {
                Ok(Issuer {
                    state: Arc::clone(state),
                    issued: 0,
                    unissued: 0,
                })
            },
            move |id, state: &Arc<RepackState>| {
                Ok(Mover::new(id, Arc::clone(state), consumer_tx.clone()))
            },
        )?;

        let tally = spawn_tally(
            tally_rx,
            Arc::clone(&state),
            queue.controller(),
            progress,
            start,
        )?;

        Ok(Self {
            config,
            state,
            queue,
            tally_tx,
            tally,
            start,
        })
    }

    /// Flag handle for signal handlers
    pub fn controller(&self) -> QueueControl<ObjectRef> {
        self.queue.controller()
    }

    /// Drive the pass to the end and collect the summary
    pub fn run(self) -> Result<Summary> {
        let RepackPass {
            config,
            state,
            mut queue,
            tally_tx,
            tally,
            start,
        } = self;

        if queue.get_flags().contains(ControlFlags::HALT) {
            checkpoint(&queue, &state)?;
        }

        let mut supervisor = if config.queue.num_consumers() == 0 {
            let mut mover = Mover::new(config.queue.num_threads, Arc::clone(&state), tally_tx.clone());
            drain_into(&queue, &state, &mut mover)?;
            Some(mover)
        } else {
            watch(&queue, &state)?;
            None
        };

        let mut drained = 0;
        let completed = match queue.wait_for_completion() {
            Ok(()) => true,
            Err(TqError::Terminal { flags }) => {
                warn!(flags = %flags, "Pass aborted; draining queue");
                while queue.dequeue(ControlFlags::NONE)?.is_some() {
                    drained += 1;
                }
                false
            }
            Err(e) => return Err(e),
        };

        let leftover = queue.close()?;
        if leftover > 0 {
            warn!(leftover, "Objects enqueued during close");
            while queue.dequeue(ControlFlags::NONE)?.is_some() {
                drained += 1;
            }
            queue.close()?;
        }

        let mut summary = Summary {
            drained,
            pauses: queue.stats().pauses,
            completed,
            ..Summary::default()
        };
        let mut issued = 0;
        while let Some(status) = queue.next_thread_status()? {
            match status.context {
                WorkerContext::Producer(issuer) => {
                    issued += issuer.issued;
                    summary.drained += issuer.unissued;
                }
                WorkerContext::Consumer(mover) => {
                    summary.objects_moved += mover.objects;
                    summary.bytes_moved += mover.bytes;
                    summary.retained += mover.retained;
                }
            }
        }
        if let Some(mover) = supervisor.as_mut() {
            summary.objects_moved += mover.objects;
            summary.bytes_moved += mover.bytes;
            summary.retained += mover.retained;
            mover.tally = None;
        }

        drop(supervisor);
        drop(tally_tx);
        let totals = join_tally(tally);
        if totals.objects != summary.objects_moved {
            warn!(
                tally = totals.objects,
                reports = summary.objects_moved,
                "Tally disagrees with worker reports"
            );
        }

        summary.duration = start.elapsed();
        info!(
            issued,
            moved = summary.objects_moved,
            bytes = summary.bytes_moved,
            drained = summary.drained,
            retained = summary.retained,
            duration_secs = summary.duration.as_secs(),
            "Repack pass finished"
        );
        Ok(summary)
    }
}

/// Wait for a requested halt to take hold, log, release it
fn checkpoint(queue: &ThreadQueue<ObjectRef, Issuer, Mover>, state: &RepackState) -> Result<()> {
    match queue.wait_for_pause() {
        Ok(()) => {
            info!(
                issued = state.issued(),
                claimed = state.claimed.load(Ordering::Relaxed),
                depth = queue.depth(),
                "Checkpoint: all workers paused"
            );
            queue.unset_flags(ControlFlags::HALT);
            Ok(())
        }
        // ended while pausing; completion handling takes over
        Err(TqError::Terminal { .. }) => Ok(()),
        Err(e) => Err(e),
    }
}

/// Follow flag changes until the pass finishes or aborts
fn watch(queue: &ThreadQueue<ObjectRef, Issuer, Mover>, state: &RepackState) -> Result<()> {
    loop {
        let flags = queue.wait_for_flags(ControlFlags::NONE)?;
        if flags.is_terminal() {
            debug!(flags = %flags, "Pass reached a terminal state");
            return Ok(());
        }
        if flags.contains(ControlFlags::HALT) {
            checkpoint(queue, state)?;
        }
    }
}

/// Supervisor acts as the only consumer
fn drain_into(
    queue: &ThreadQueue<ObjectRef, Issuer, Mover>,
    state: &RepackState,
    mover: &mut Mover,
) -> Result<()> {
    while let Some(item) = queue.dequeue(ControlFlags::NONE)? {
        let mut slot = Some(item.unit);
        match mover.consume(&mut slot) {
            Flow::Continue | Flow::Done => {}
            Flow::Pause => {
                queue.set_flags(ControlFlags::HALT);
                checkpoint(queue, state)?;
            }
            Flow::Abort => {
                queue.set_flags(ControlFlags::ABORT);
                mover.on_terminate(slot, Termination::Aborted);
                return Ok(());
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CliArgs;
    use clap::Parser;

    fn config(argv: &[&str]) -> DemoConfig {
        let mut full = vec!["tq-engine", "-q"];
        full.extend_from_slice(argv);
        DemoConfig::from_args(CliArgs::parse_from(full)).unwrap()
    }

    #[test]
    fn test_issuer_stops_at_total() {
        let cfg = config(&["-p", "1", "-c", "1", "--objects", "2"]);
        let state = Arc::new(RepackState::new(&cfg));
        let mut issuer = Issuer {
            state,
            issued: 0,
            unissued: 0,
        };

        let mut slot = None;
        assert_eq!(issuer.produce(&mut slot), Flow::Continue);
        assert_eq!(slot.take().map(|o| o.id), Some(0));
        assert_eq!(issuer.produce(&mut slot), Flow::Continue);
        assert_eq!(slot.take().map(|o| o.id), Some(1));
        assert_eq!(issuer.produce(&mut slot), Flow::Done);
        assert!(slot.is_none());
        assert_eq!(issuer.issued, 2);
    }

    #[test]
    fn test_mover_keeps_object_on_abort() {
        let cfg = config(&["-p", "1", "-c", "1", "--abort-after", "2"]);
        let state = Arc::new(RepackState::new(&cfg));
        let (tx, rx) = bounded(8);
        let mut mover = Mover::new(1, state, tx);

        let mut slot = Some(ObjectRef { id: 0, size: 10 });
        assert_eq!(mover.consume(&mut slot), Flow::Continue);
        assert!(slot.is_none());

        let mut slot = Some(ObjectRef { id: 1, size: 10 });
        assert_eq!(mover.consume(&mut slot), Flow::Abort);
        assert_eq!(slot.map(|o| o.id), Some(1));

        mover.on_terminate(slot, Termination::Aborted);
        assert_eq!(mover.objects, 1);
        assert_eq!(mover.retained, 1);
        drop(mover);
        assert_eq!(rx.iter().count(), 1);
    }

    #[test]
    fn test_join_tally_survives_panic() {
        let ok = thread::spawn(|| Tally { objects: 3, bytes: 30 });
        let totals = join_tally(ok);
        assert_eq!((totals.objects, totals.bytes), (3, 30));

        let broken = thread::spawn(|| -> Tally { panic!("tally lost its channel") });
        let totals = join_tally(broken);
        assert_eq!((totals.objects, totals.bytes), (0, 0));
    }

    #[test]
    fn test_full_pass() {
        let cfg = config(&["-p", "2", "-c", "3", "--objects", "500", "--queue-depth", "8"]);
        let summary = RepackPass::start(cfg, None).unwrap().run().unwrap();
        assert!(summary.completed);
        assert_eq!(summary.objects_moved, 500);
        assert_eq!(summary.drained, 0);
    }

    #[test]
    fn test_pass_without_consumers() {
        let cfg = config(&["-p", "2", "-c", "0", "--objects", "100", "--queue-depth", "4"]);
        let summary = RepackPass::start(cfg, None).unwrap().run().unwrap();
        assert!(summary.completed);
        assert_eq!(summary.objects_moved, 100);
    }

    #[test]
    fn test_pass_with_pause_and_start_halted() {
        let cfg = config(&[
            "-p", "1", "-c", "2", "--objects", "300", "--pause-after", "100", "--start-halted",
        ]);
        let summary = RepackPass::start(cfg, None).unwrap().run().unwrap();
        assert!(summary.completed);
        assert_eq!(summary.objects_moved, 300);
        assert!(summary.pauses >= 3);
    }

    #[test]
    fn test_aborted_pass_accounts_for_every_object() {
        let cfg = config(&["-p", "1", "-c", "1", "--objects", "1000", "--abort-after", "50"]);
        let summary = RepackPass::start(cfg, None).unwrap().run().unwrap();
        assert!(!summary.completed);
        assert_eq!(summary.objects_moved, 49);
        assert_eq!(summary.retained, 1);
    }
}
