//! tq-engine - Bounded Multi-Role Work Queue
//!
//! A thread-pool engine for bulk passes over large object stores (scans,
//! garbage collection, rebuilds, repacks). A fixed set of producer threads
//! generates work units into a bounded FIFO, a fixed set of consumer
//! threads processes them, and a supervisor steers the whole pool through
//! shared control flags.
//!
//! # Features
//!
//! - **Bounded Queue**: Producers block when the queue is full, so memory
//!   stays flat no matter how fast work is generated.
//!
//! - **Pause Barrier**: A halt request parks every worker at a safe point;
//!   the supervisor can wait until all of them have acknowledged.
//!
//! - **Cooperative Abort**: Any worker or the supervisor can abort the pass.
//!   Queued units stay available for draining.
//!
//! - **Retained Work**: Consumers may hand a unit back and receive it again
//!   on the next call, or at termination.
//!
//! # Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────┐
//! │                       Supervisor                          │
//! │   set/unset flags · wait_for_pause · dequeue · close      │
//! └─────────────────────────────┬─────────────────────────────┘
//!                               │
//!   ┌──────────┐  ┌──────────┐  │  ┌──────────┐  ┌──────────┐
//!   │Producer 0│  │Producer 1│  │  │Consumer 2│  │Consumer 3│
//!   └────┬─────┘  └────┬─────┘  │  └────▲─────┘  └────▲─────┘
//!        │             │        ▼       │             │
//!        │      ┌─────────────────────────────┐       │
//!        └─────►│  Bounded FIFO + flags       │───────┘
//!               │  HALT PAUSED ABORT FINISHED │
//!               └─────────────────────────────┘
//! ```
//!
//! # Example
//!
//! ```bash
//! # Synthetic repack with 2 producers and 8 consumers
//! tq-engine --objects 100000 -p 2 -c 8
//!
//! # Pause half way, then abort a second run early
//! tq-engine --objects 5000 --pause-after 2500
//! tq-engine --objects 5000 --abort-after 1000
//! ```

pub mod config;
pub mod engine;
pub mod error;
pub mod flags;
pub mod progress;
pub mod queue;
pub mod repack;
pub mod worker;

pub use config::{CliArgs, DemoConfig, QueueOptions};
pub use engine::{Dequeued, QueueControl, ThreadQueue};
pub use error::{ConfigError, HookError, HookResult, PushError, Result, TqError, WorkerError};
pub use flags::ControlFlags;
pub use queue::StatsSnapshot;
pub use worker::{
    Consumer, Flow, NoConsumer, Producer, Role, Termination, WorkerContext, WorkerHooks,
    WorkerState, WorkerStatus,
};
