//! crosspost-send - Background daemon for scheduled publishing
//!
//! Restores scheduled records from storage, fires each one when it is due
//! and resumes publishes interrupted by a previous shutdown or crash.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use clap::Parser;
use libcrosspost::logging::init_default;
use libcrosspost::{Config, CrosspostError, PublishService};
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(name = "crosspost-send")]
#[command(version)]
#[command(about = "Background daemon that publishes scheduled posts when they are due")]
#[command(long_about = "\
crosspost-send - Background daemon for scheduled publishing

DESCRIPTION:
    crosspost-send is a long-running daemon that publishes scheduled posts
    at their scheduled time. Each due post is published to all of its target
    platforms in parallel, with per-platform retry and backoff.

    Scheduled posts are read from storage on startup and re-read every poll
    interval, so posts created or cancelled with the crosspost CLI while the
    daemon runs are picked up.

USAGE:
    # Run in foreground (logs to stderr)
    crosspost-send

    # Re-read storage every 30 seconds
    crosspost-send --poll-interval 30

    # Enable verbose logging
    crosspost-send --verbose

SIGNALS:
    SIGTERM, SIGINT - Graceful shutdown (in-flight publishes finish first)

CONFIGURATION:
    Configuration file: ~/.config/crosspost/config.toml

    [scheduler]
    resync_interval_secs = 60   # default poll interval

    [executor]
    workers = 4                 # concurrent publish jobs
    max_attempts = 3            # per platform, including the first

LOGGING:
    CROSSPOST_LOG_FORMAT  - text, json or pretty
    CROSSPOST_LOG_LEVEL   - error, warn, info, debug or trace

EXIT CODES:
    0 - Clean shutdown
    1 - Runtime error
    2 - Configuration error
")]
struct Cli {
    /// Path to config file
    #[arg(long, env = "CROSSPOST_CONFIG", value_name = "PATH")]
    config: Option<PathBuf>,

    /// Seconds between storage resyncs (overrides config)
    #[arg(long, value_name = "SECONDS")]
    poll_interval: Option<u64>,

    /// Enable verbose logging to stderr
    #[arg(short, long)]
    verbose: bool,

    /// Publish everything currently due, wait for it, and exit
    #[arg(long)]
    once: bool,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    init_default(cli.verbose);

    if let Err(e) = run(cli).await {
        error!("{:#}", e);
        eprintln!("Error: {:#}", e);
        let code = e
            .downcast_ref::<CrosspostError>()
            .map(CrosspostError::exit_code)
            .unwrap_or(1);
        std::process::exit(code);
    }
}

async fn run(cli: Cli) -> Result<()> {
    let config = match &cli.config {
        Some(path) => Config::load_from_path(path),
        None => Config::load(),
    }
    .context("Failed to load configuration")?;

    let poll_interval = Duration::from_secs(
        cli.poll_interval
            .unwrap_or(config.scheduler.resync_interval_secs)
            .max(1),
    );

    let service = PublishService::from_config(config)
        .await
        .context("Failed to initialize publish service")?;

    if service.registry().is_empty() {
        warn!("No platforms configured; every publish will fail");
    }

    info!("crosspost-send daemon starting");

    if cli.once {
        let submitted = process_due_once(&service).await?;
        info!(submitted, "Processed due publishes once, exiting");
        return Ok(());
    }

    service.start().await?;
    info!(poll_interval_secs = poll_interval.as_secs(), "Daemon running");

    let shutdown = wait_for_shutdown_signal();
    tokio::pin!(shutdown);

    let mut ticker = tokio::time::interval(poll_interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    // The first tick completes immediately and start() just restored
    ticker.tick().await;

    loop {
        tokio::select! {
            result = &mut shutdown => {
                result?;
                info!("Received shutdown signal, stopping gracefully...");
                break;
            }
            _ = ticker.tick() => {
                if let Err(e) = service.resync().await {
                    error!(error = %e, "Failed to resync schedule from storage");
                }
                match service.resume_interrupted().await {
                    Ok(0) => {}
                    Ok(resumed) => info!(resumed, "Resumed publishes whose claim lapsed"),
                    Err(e) => error!(error = %e, "Failed to resume interrupted publishes"),
                }
            }
        }
    }

    service.shutdown().await;
    info!("crosspost-send daemon stopped");
    Ok(())
}

/// Submit every due or interrupted record and wait for all of them
async fn process_due_once(service: &PublishService) -> Result<usize> {
    service.resync().await?;
    let due = service.scheduler().take_due(Utc::now());

    let mut submitted = service.resume_interrupted().await?;
    for id in &due {
        if service.executor().submit(id)? {
            submitted += 1;
        }
    }

    service.shutdown().await;
    Ok(submitted)
}

#[cfg(unix)]
async fn wait_for_shutdown_signal() -> Result<()> {
    use futures::StreamExt;
    use signal_hook::consts::{SIGINT, SIGTERM};
    use signal_hook_tokio::Signals;

    let mut signals = Signals::new([SIGINT, SIGTERM]).context("Signal setup failed")?;
    let handle = signals.handle();

    if let Some(signal) = signals.next().await {
        info!(signal, "Shutdown signal received");
    }
    handle.close();
    Ok(())
}

#[cfg(not(unix))]
async fn wait_for_shutdown_signal() -> Result<()> {
    tokio::signal::ctrl_c()
        .await
        .context("Signal setup failed")?;
    Ok(())
}
