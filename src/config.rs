//! Configuration types for tq-engine
//!
//! This module defines:
//! - `QueueOptions`, the validated engine construction parameters
//! - CLI argument parsing for the demo binary using clap derive macros
//! - `DemoConfig`, the validated runtime configuration of the demo

use crate::error::ConfigError;
use crate::flags::ControlFlags;
use clap::Parser;
use std::time::Duration;

/// Maximum worker threads per queue
pub const MAX_THREADS: usize = 512;

/// Minimum queue depth
const MIN_QUEUE_DEPTH: usize = 1;

/// Default label for log fields
pub const DEFAULT_LOG_PREFIX: &str = "ThreadQueue";

/// Engine construction parameters
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueOptions {
    /// Total worker count
    pub num_threads: usize,

    /// Producer count; workers `0..num_prod_threads` are producers
    pub num_prod_threads: usize,

    /// Queue capacity
    pub max_qdepth: usize,

    /// Flags set before any worker runs
    pub init_flags: ControlFlags,

    /// Label used in log fields
    pub log_prefix: String,

    /// Optional bound on supervisor-side waits
    pub wait_timeout: Option<Duration>,
}

impl QueueOptions {
    pub fn new(num_threads: usize, num_prod_threads: usize, max_qdepth: usize) -> Self {
        Self {
            num_threads,
            num_prod_threads,
            max_qdepth,
            init_flags: ControlFlags::NONE,
            log_prefix: DEFAULT_LOG_PREFIX.to_string(),
            wait_timeout: None,
        }
    }

    pub fn with_init_flags(mut self, flags: ControlFlags) -> Self {
        self.init_flags = flags;
        self
    }

    pub fn with_log_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.log_prefix = prefix.into();
        self
    }

    pub fn with_wait_timeout(mut self, timeout: Duration) -> Self {
        self.wait_timeout = Some(timeout);
        self
    }

    /// Number of consumer workers
    pub fn num_consumers(&self) -> usize {
        self.num_threads.saturating_sub(self.num_prod_threads)
    }

    /// Reject parameters the engine cannot run with
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.num_threads == 0 || self.num_threads > MAX_THREADS {
            return Err(ConfigError::InvalidThreadCount {
                count: self.num_threads,
                max: MAX_THREADS,
            });
        }

        if self.num_prod_threads == 0 || self.num_prod_threads > self.num_threads {
            return Err(ConfigError::InvalidProducerCount {
                producers: self.num_prod_threads,
                threads: self.num_threads,
            });
        }

        if self.max_qdepth < MIN_QUEUE_DEPTH {
            return Err(ConfigError::InvalidQueueDepth {
                depth: self.max_qdepth,
                min: MIN_QUEUE_DEPTH,
            });
        }

        if !self.init_flags.difference(ControlFlags::CALLER_MASK).is_empty() {
            return Err(ConfigError::InvalidInitFlags {
                flags: self.init_flags,
            });
        }

        Ok(())
    }
}

/// Synthetic repack pass driven by a bounded work queue
#[derive(Parser, Debug, Clone)]
#[command(
    name = "tq-engine",
    version,
    about = "Synthetic repack pass driven by a bounded producer/consumer work queue",
    long_about = "Producers issue object ids from a shared counter, consumers \"move\" each object.\n\n\
                  Demonstrates halting and resuming the pool, cooperative aborts, and draining\n\
                  the queue from the supervisor when no consumers are configured.",
    after_help = "EXAMPLES:\n    \
        tq-engine --objects 100000 -p 2 -c 8\n    \
        tq-engine --objects 5000 --pause-after 2000\n    \
        tq-engine --objects 5000 --abort-after 1000 -q\n    \
        tq-engine --objects 500 --consumers 0  # supervisor drains the queue"
)]
pub struct CliArgs {
    /// Number of producer threads
    #[arg(short = 'p', long, default_value_t = default_producers(), value_name = "NUM")]
    pub producers: usize,

    /// Number of consumer threads (0: the supervisor drains the queue)
    #[arg(short = 'c', long, default_value_t = default_consumers(), value_name = "NUM")]
    pub consumers: usize,

    /// Maximum number of queued objects
    #[arg(long, default_value = "256", value_name = "NUM")]
    pub queue_depth: usize,

    /// Total number of objects to issue
    #[arg(short = 'n', long, default_value = "10000", value_name = "COUNT")]
    pub objects: u64,

    /// Synthetic size of each object in bytes
    #[arg(long, default_value = "1048576", value_name = "BYTES")]
    pub object_size: u64,

    /// Have a consumer request a pause after this many objects
    #[arg(long, value_name = "COUNT")]
    pub pause_after: Option<u64>,

    /// Have a consumer abort the pass after this many objects
    #[arg(long, value_name = "COUNT")]
    pub abort_after: Option<u64>,

    /// Start with the queue halted, then release it
    #[arg(long)]
    pub start_halted: bool,

    /// Bound supervisor waits (seconds)
    #[arg(long, value_name = "SECS")]
    pub wait_timeout: Option<u64>,

    /// Quiet mode - suppress progress output
    #[arg(short = 'q', long)]
    pub quiet: bool,

    /// Verbose output (debug logging)
    #[arg(short = 'v', long)]
    pub verbose: bool,
}

fn default_producers() -> usize {
    (num_cpus::get() / 4).max(1)
}

fn default_consumers() -> usize {
    num_cpus::get()
}

/// Validated runtime configuration of the demo
#[derive(Debug, Clone)]
pub struct DemoConfig {
    /// Engine parameters
    pub queue: QueueOptions,

    /// Objects to issue
    pub objects: u64,

    /// Bytes per object
    pub object_size: u64,

    /// Consumer-requested pause threshold
    pub pause_after: Option<u64>,

    /// Consumer-requested abort threshold
    pub abort_after: Option<u64>,

    /// Show progress indicator
    pub show_progress: bool,

    /// Verbose logging
    pub verbose: bool,
}

impl DemoConfig {
    /// Create and validate configuration from CLI arguments
    pub fn from_args(args: CliArgs) -> Result<Self, ConfigError> {
        if args.objects == 0 {
            return Err(ConfigError::InvalidObjectCount {
                count: args.objects,
            });
        }

        let mut queue = QueueOptions::new(
            args.producers.saturating_add(args.consumers),
            args.producers,
            args.queue_depth,
        )
        .with_log_prefix("repack");

        if args.start_halted {
            queue = queue.with_init_flags(ControlFlags::HALT);
        }
        if let Some(secs) = args.wait_timeout {
            queue = queue.with_wait_timeout(Duration::from_secs(secs));
        }

        queue.validate()?;

        Ok(Self {
            queue,
            objects: args.objects,
            object_size: args.object_size,
            pause_after: args.pause_after,
            abort_after: args.abort_after,
            show_progress: !args.quiet,
            verbose: args.verbose,
        })
    }

    /// Total bytes the pass would move if it ran to completion
    pub fn total_bytes(&self) -> u64 {
        self.objects.saturating_mul(self.object_size)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(extra: &[&str]) -> CliArgs {
        let mut argv = vec!["tq-engine", "-p", "2", "-c", "4"];
        argv.extend_from_slice(extra);
        CliArgs::parse_from(argv)
    }

    #[test]
    fn test_validate_thread_counts() {
        assert!(QueueOptions::new(4, 1, 8).validate().is_ok());
        assert!(QueueOptions::new(4, 4, 8).validate().is_ok());

        assert_eq!(
            QueueOptions::new(0, 0, 8).validate(),
            Err(ConfigError::InvalidThreadCount {
                count: 0,
                max: MAX_THREADS
            })
        );
        assert!(matches!(
            QueueOptions::new(MAX_THREADS + 1, 1, 8).validate(),
            Err(ConfigError::InvalidThreadCount { .. })
        ));
        assert_eq!(
            QueueOptions::new(4, 5, 8).validate(),
            Err(ConfigError::InvalidProducerCount {
                producers: 5,
                threads: 4
            })
        );
        assert!(matches!(
            QueueOptions::new(4, 0, 8).validate(),
            Err(ConfigError::InvalidProducerCount { .. })
        ));
    }

    #[test]
    fn test_validate_depth_and_flags() {
        assert!(matches!(
            QueueOptions::new(2, 1, 0).validate(),
            Err(ConfigError::InvalidQueueDepth { depth: 0, .. })
        ));

        let halted = QueueOptions::new(2, 1, 4).with_init_flags(ControlFlags::HALT);
        assert!(halted.validate().is_ok());

        let paused = QueueOptions::new(2, 1, 4).with_init_flags(ControlFlags::PAUSED);
        assert!(matches!(
            paused.validate(),
            Err(ConfigError::InvalidInitFlags { .. })
        ));
    }

    #[test]
    fn test_defaults() {
        let opts = QueueOptions::new(3, 1, 16);
        assert_eq!(opts.log_prefix, DEFAULT_LOG_PREFIX);
        assert_eq!(opts.wait_timeout, None);
        assert_eq!(opts.num_consumers(), 2);
    }

    #[test]
    fn test_demo_config_from_args() {
        let config = DemoConfig::from_args(args(&[
            "--objects",
            "100",
            "--start-halted",
            "--wait-timeout",
            "5",
            "-q",
        ]))
        .unwrap();

        assert_eq!(config.queue.num_threads, 6);
        assert_eq!(config.queue.num_prod_threads, 2);
        assert_eq!(config.queue.init_flags, ControlFlags::HALT);
        assert_eq!(config.queue.wait_timeout, Some(Duration::from_secs(5)));
        assert_eq!(config.objects, 100);
        assert!(!config.show_progress);
        assert_eq!(config.total_bytes(), 100 * 1_048_576);
    }

    #[test]
    fn test_demo_config_allows_zero_consumers() {
        let config = DemoConfig::from_args(CliArgs::parse_from([
            "tq-engine", "-p", "1", "-c", "0",
        ]))
        .unwrap();
        assert_eq!(config.queue.num_consumers(), 0);
    }

    #[test]
    fn test_demo_config_rejects_bad_values() {
        assert!(matches!(
            DemoConfig::from_args(args(&["--objects", "0"])),
            Err(ConfigError::InvalidObjectCount { count: 0 })
        ));
        assert!(matches!(
            DemoConfig::from_args(args(&["--queue-depth", "0"])),
            Err(ConfigError::InvalidQueueDepth { .. })
        ));
        assert!(matches!(
            DemoConfig::from_args(CliArgs::parse_from(["tq-engine", "-p", "0", "-c", "2"])),
            Err(ConfigError::InvalidProducerCount { .. })
        ));
    }
}
