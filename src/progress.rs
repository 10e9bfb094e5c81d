//! Progress reporting for repack passes
//!
//! Provides real-time progress display using indicatif progress bars.

use crate::flags::ControlFlags;
use console::style;
use humansize::{format_size, BINARY};
use indicatif::{ProgressBar, ProgressStyle};
use std::time::Duration;

/// Snapshot of a running pass
#[derive(Debug, Clone)]
pub struct RepackProgress {
    /// Objects handed to the queue
    pub issued: u64,

    /// Objects moved by consumers
    pub moved: u64,

    /// Bytes moved
    pub bytes: u64,

    /// Current queue depth
    pub queue_depth: usize,

    /// Current control flags
    pub flags: ControlFlags,

    /// Elapsed time
    pub elapsed: Duration,
}

impl RepackProgress {
    /// Objects moved per second
    pub fn objects_per_second(&self) -> f64 {
        let secs = self.elapsed.as_secs_f64();
        if secs > 0.0 {
            self.moved as f64 / secs
        } else {
            0.0
        }
    }
}

/// Progress reporter that displays pass status
#[derive(Clone)]
pub struct ProgressReporter {
    bar: ProgressBar,
}

impl ProgressReporter {
    /// Create a new progress reporter
    pub fn new() -> Self {
        let bar = ProgressBar::new_spinner();

        let style = ProgressStyle::default_spinner()
            .template("{spinner:.green} [{elapsed_precise}] {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner())
            .tick_chars("⠋⠙⠹⠸⠼⠴⠦⠧⠇⠏");
        bar.set_style(style);
        bar.enable_steady_tick(Duration::from_millis(100));

        Self { bar }
    }

    /// Update the progress display
    pub fn update(&self, progress: &RepackProgress) {
        let msg = format!(
            "Issued: {} | Moved: {} | Size: {} | Rate: {:.0}/s | Queue: {} | Flags: {}",
            format_number(progress.issued),
            format_number(progress.moved),
            format_size(progress.bytes, BINARY),
            progress.objects_per_second(),
            progress.queue_depth,
            progress.flags,
        );

        self.bar.set_message(msg);
    }

    /// Set a status message
    pub fn set_status(&self, status: &str) {
        self.bar.set_message(status.to_string());
    }

    /// Finish the progress display with a final message
    pub fn finish(&self, message: &str) {
        self.bar.finish_with_message(message.to_string());
    }
}

impl Default for ProgressReporter {
    fn default() -> Self {
        Self::new()
    }
}

/// Format a number with thousands separators
pub fn format_number(n: u64) -> String {
    let digits = n.to_string();
    let mut out = String::with_capacity(digits.len() + digits.len() / 3);
    for (i, ch) in digits.chars().enumerate() {
        if i > 0 && (digits.len() - i) % 3 == 0 {
            out.push(',');
        }
        out.push(ch);
    }
    out
}

/// Final numbers of a pass
#[derive(Debug, Clone, Default)]
pub struct Summary {
    pub objects_moved: u64,
    pub bytes_moved: u64,
    pub drained: u64,
    pub retained: u64,
    pub pauses: u64,
    pub duration: Duration,
    pub completed: bool,
}

/// Print a summary of the pass
pub fn print_summary(summary: &Summary) {
    let secs = summary.duration.as_secs_f64();
    let rate = if secs > 0.0 {
        summary.objects_moved as f64 / secs
    } else {
        0.0
    };

    println!();
    if summary.completed {
        println!("{}", style("Repack Complete").green().bold());
    } else {
        println!("{}", style("Repack Aborted").yellow().bold());
    }
    println!("{}", style("─".repeat(50)).dim());
    println!(
        "  {} {}",
        style("Objects:").bold(),
        format_number(summary.objects_moved)
    );
    println!(
        "  {} {}",
        style("Moved:").bold(),
        format_size(summary.bytes_moved, BINARY)
    );
    println!(
        "  {} {:.1}s ({:.0} objects/sec)",
        style("Duration:").bold(),
        secs,
        rate
    );
    if summary.pauses > 0 {
        println!(
            "  {} {}",
            style("Pauses:").bold(),
            format_number(summary.pauses)
        );
    }
    if summary.drained > 0 || summary.retained > 0 {
        println!(
            "  {} {} drained, {} retained",
            style("Left over:").yellow().bold(),
            format_number(summary.drained),
            format_number(summary.retained)
        );
    }
    println!();
}

/// Print a header at the start of the pass
pub fn print_header(producers: usize, consumers: usize, depth: usize, objects: u64) {
    println!();
    println!(
        "{} {}",
        style("tq-engine").cyan().bold(),
        env!("CARGO_PKG_VERSION")
    );
    println!("{}", style("─".repeat(50)).dim());
    println!("  {} {}", style("Producers:").bold(), producers);
    println!("  {} {}", style("Consumers:").bold(), consumers);
    println!("  {} {}", style("Queue depth:").bold(), depth);
    println!("  {} {}", style("Objects:").bold(), format_number(objects));
    println!();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_number() {
        assert_eq!(format_number(0), "0");
        assert_eq!(format_number(999), "999");
        assert_eq!(format_number(1000), "1,000");
        assert_eq!(format_number(1234567), "1,234,567");
        assert_eq!(format_number(1234567890), "1,234,567,890");
    }

    #[test]
    fn test_progress_rate() {
        let progress = RepackProgress {
            issued: 2000,
            moved: 1000,
            bytes: 1024 * 1024,
            queue_depth: 16,
            flags: ControlFlags::NONE,
            elapsed: Duration::from_secs(10),
        };
        assert!((progress.objects_per_second() - 100.0).abs() < 0.1);
    }
}
