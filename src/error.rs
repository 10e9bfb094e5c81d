//! Error types for tq-engine
//!
//! This module defines the error hierarchy for the engine:
//! - Configuration errors (rejected before any thread starts)
//! - Worker errors (init, spawn and panic failures)
//! - Caller misuse of the supervisor handle (wrong state, timeouts)
//! - Hook errors returned by pause/resume callbacks
//!
//! Design philosophy:
//! - Use thiserror for structured error types in library code
//! - Misuse errors never change engine state, so the caller can retry
//! - Preserve error chains for debugging

use crate::flags::ControlFlags;
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Top-level error type for the engine
#[derive(Error, Debug)]
pub enum TqError {
    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Worker/concurrency errors
    #[error("Worker error: {0}")]
    Worker(#[from] WorkerError),

    /// `wait_for_pause` called (or still waiting) without a halt request
    #[error("Queue is not halted (flags: {flags})")]
    NotHalted { flags: ControlFlags },

    /// Operation is meaningless once the queue is finished or aborted
    #[error("Queue is in a terminal state (flags: {flags})")]
    Terminal { flags: ControlFlags },

    /// Thread status requested before every worker terminated
    #[error("{running} worker(s) have not terminated yet")]
    WorkersRunning { running: usize },

    /// Supervisor wait exceeded the configured timeout
    #[error("Timed out after {after:?} waiting in {op}")]
    Timeout { op: &'static str, after: Duration },

    /// No consumers exist and the queue holds items nobody will take
    #[error("Possible deadlock: {depth} item(s) queued and no consumer threads exist")]
    PossibleDeadlock { depth: usize },

    /// The handle has already released its resources
    #[error("Queue has been closed")]
    Closed,

    /// I/O errors (helper threads)
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Configuration errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// Invalid total thread count
    #[error("Invalid thread count {count}: must be between 1 and {max}")]
    InvalidThreadCount { count: usize, max: usize },

    /// Invalid producer count
    #[error("Invalid producer count {producers}: must be between 1 and the thread count ({threads})")]
    InvalidProducerCount { producers: usize, threads: usize },

    /// Invalid queue depth
    #[error("Invalid queue depth {depth}: must be at least {min}")]
    InvalidQueueDepth { depth: usize, min: usize },

    /// Caller tried to preset an engine-owned flag
    #[error("Initial flags {flags} include engine-owned bits")]
    InvalidInitFlags { flags: ControlFlags },

    /// `wait_for_flags` would never return
    #[error("Cannot wait while ignoring every control flag")]
    IgnoresAllFlags,

    /// Demo object count
    #[error("Invalid object count {count}: must be at least 1")]
    InvalidObjectCount { count: u64 },
}

/// Worker thread errors
#[derive(Error, Debug)]
pub enum WorkerError {
    /// Worker init hook failed
    #[error("Failed to initialize worker {id}: {reason}")]
    InitFailed { id: usize, reason: String },

    /// OS refused to create the worker thread
    #[error("Failed to spawn worker {id}: {reason}")]
    SpawnFailed { id: usize, reason: String },

    /// Worker panicked
    #[error("Worker {id} panicked: {message}")]
    Panicked { id: usize, message: String },
}

/// Error returned by init, pause and resume hooks
///
/// Any hook error aborts the whole queue.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{reason}")]
pub struct HookError {
    pub reason: String,
}

impl HookError {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

/// Why a push was refused; the rejected unit is handed back
#[derive(Error)]
pub enum PushError<W> {
    #[error("Queue aborted while waiting to enqueue")]
    Aborted(W),

    #[error("Queue is finished and accepts no more work")]
    Finished(W),

    #[error("Queue is halted")]
    Halted(W),

    #[error("Timed out waiting for queue space")]
    TimedOut(W),

    #[error("Queue has been closed")]
    Closed(W),
}

impl<W> PushError<W> {
    /// Recover the unit that was not enqueued
    pub fn into_inner(self) -> W {
        match self {
            PushError::Aborted(w)
            | PushError::Finished(w)
            | PushError::Halted(w)
            | PushError::TimedOut(w)
            | PushError::Closed(w) => w,
        }
    }
}

impl<W> fmt::Debug for PushError<W> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match self {
            PushError::Aborted(_) => "Aborted",
            PushError::Finished(_) => "Finished",
            PushError::Halted(_) => "Halted",
            PushError::TimedOut(_) => "TimedOut",
            PushError::Closed(_) => "Closed",
        };
        f.debug_tuple(kind).finish_non_exhaustive()
    }
}

/// Result type alias for TqError
pub type Result<T> = std::result::Result<T, TqError>;

/// Result type alias for hook callbacks
pub type HookResult<T = ()> = std::result::Result<T, HookError>;
