//! tq-engine - bounded producer/consumer work queue
//!
//! Entry point for the synthetic repack demo.

use anyhow::{Context, Result};
use clap::Parser;
use std::process::ExitCode;
use tq_engine::config::{CliArgs, DemoConfig};
use tq_engine::progress::{print_header, print_summary, ProgressReporter};
use tq_engine::repack::RepackPass;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

fn main() -> ExitCode {
    match run() {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::from(2),
        Err(e) => {
            error!("{:#}", e);
            eprintln!("Error: {:#}", e);
            ExitCode::FAILURE
        }
    }
}

/// Returns whether the pass completed (vs was aborted)
fn run() -> Result<bool> {
    let args = CliArgs::parse();

    setup_logging(args.verbose)?;

    let config = DemoConfig::from_args(args).context("Invalid configuration")?;

    if config.show_progress {
        print_header(
            config.queue.num_prod_threads,
            config.queue.num_consumers(),
            config.queue.max_qdepth,
            config.objects,
        );
    }

    let progress = if config.show_progress {
        Some(ProgressReporter::new())
    } else {
        None
    };

    if let Some(ref p) = progress {
        p.set_status("Starting workers...");
    }

    let pass = RepackPass::start(config, progress.clone()).context("Failed to start repack pass")?;

    // Ctrl-C aborts the pass; queued objects are drained and reported
    let control = pass.controller();
    ctrlc::set_handler(move || {
        eprintln!("\nInterrupt received, aborting...");
        control.abort();
    })
    .context("Failed to set signal handler")?;

    let summary = pass.run().context("Repack pass failed")?;

    if let Some(ref p) = progress {
        if summary.completed {
            p.finish("Repack completed");
        } else {
            p.finish("Repack aborted");
        }
    }

    print_summary(&summary);

    if !summary.completed {
        info!(
            drained = summary.drained,
            retained = summary.retained,
            "Pass was aborted before completion"
        );
    }

    Ok(summary.completed)
}

fn setup_logging(verbose: bool) -> Result<()> {
    let filter = if verbose {
        EnvFilter::new("tq_engine=debug,warn")
    } else {
        EnvFilter::new("tq_engine=info,warn")
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_names(true)
        .with_file(false)
        .with_line_number(false)
        .try_init()
        .map_err(|e| anyhow::anyhow!("Failed to initialize logging: {}", e))?;

    Ok(())
}
