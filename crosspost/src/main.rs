//! crosspost - Publish one post to many social platforms
//!
//! Unix-style front end for the publish service: create, schedule, cancel
//! and inspect publish records.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand, ValueEnum};
use libcrosspost::logging::LoggingConfig;
use libcrosspost::schedule_time::parse_schedule;
use libcrosspost::service::TargetMetrics;
use libcrosspost::types::OutcomeStatus;
use libcrosspost::{
    Config, PublishRecord, PublishRequest, PublishService, PublishStatus, Result,
};
use serde::Serialize;
use tracing::debug;

#[derive(Parser, Debug)]
#[command(name = "crosspost")]
#[command(version)]
#[command(about = "Publish one post to many social platforms, now or later")]
#[command(long_about = "\
crosspost - Publish one post to many social platforms, now or later

DESCRIPTION:
    crosspost creates publish records and sends them to every configured
    target platform. Immediate posts are published by this process, which
    waits until every platform has a final outcome. Scheduled posts are
    stored and published by the crosspost-send daemon when they are due.

USAGE EXAMPLES:
    # Publish now to two platforms
    crosspost post --title \"Launch\" --body \"We are live\" -p facebook -p youtube

    # Publish tomorrow afternoon
    crosspost post --title \"Recap\" --body \"...\" -p facebook --at \"tomorrow 3pm\"

    # Inspect, reschedule or cancel
    crosspost show <ID>
    crosspost reschedule <ID> 2h
    crosspost cancel <ID>

CONFIGURATION:
    Configuration file: ~/.config/crosspost/config.toml

    Override with environment variables:
        CROSSPOST_CONFIG    - Path to config file
        CROSSPOST_DB_PATH   - Path to database file
        CROSSPOST_LOG_LEVEL - Log level for stderr (default: warn)

NOTE:
    A platform that times out may have published anyway. Such attempts are
    recorded as 'ambiguous' and retried, which can produce a duplicate post.

EXIT CODES:
    0 - Success (every target published)
    1 - One or more targets failed, or a runtime error
    2 - Configuration error or expired platform credentials
    3 - Invalid input (unknown platform, bad time, unknown record)
")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Path to config file
    #[arg(long, global = true, env = "CROSSPOST_CONFIG", value_name = "PATH")]
    config: Option<PathBuf>,

    /// Enable verbose logging to stderr
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Create a post and publish it now, later, or keep it as a draft
    Post {
        #[command(flatten)]
        content: ContentArgs,

        /// When to publish (RFC 3339, "30m", "tomorrow 3pm")
        #[arg(long, value_name = "WHEN")]
        at: Option<String>,

        /// Save as draft without publishing
        #[arg(short, long)]
        draft: bool,

        /// Acting user id recorded on the post
        #[arg(long, env = "CROSSPOST_OWNER_ID", default_value_t = 0)]
        owner: i64,

        #[arg(short, long, value_enum, default_value_t = OutputFormat::Text)]
        format: OutputFormat,
    },

    /// Replace the content of a draft
    Edit {
        id: String,

        #[arg(long)]
        title: Option<String>,

        #[arg(long)]
        body: Option<String>,

        /// Replace target platforms
        #[arg(short, long = "platform", value_delimiter = ',')]
        platforms: Vec<String>,

        /// Replace media references
        #[arg(short, long = "media")]
        media: Vec<String>,

        #[arg(short, long, value_enum, default_value_t = OutputFormat::Text)]
        format: OutputFormat,
    },

    /// Publish a draft or scheduled post immediately
    Publish {
        id: String,

        #[arg(short, long, value_enum, default_value_t = OutputFormat::Text)]
        format: OutputFormat,
    },

    /// Cancel a scheduled post before it is due
    Cancel { id: String },

    /// Move a draft or scheduled post to a new time
    Reschedule {
        id: String,

        /// New time (RFC 3339, "30m", "tomorrow 3pm")
        when: String,
    },

    /// Show one post and its per-platform outcomes
    Show {
        id: String,

        #[arg(short, long, value_enum, default_value_t = OutputFormat::Text)]
        format: OutputFormat,
    },

    /// List posts
    List {
        /// Only posts in this status (draft, scheduled, publishing,
        /// published, partially_failed, failed, cancelled)
        #[arg(short, long)]
        status: Option<String>,

        #[arg(short, long, value_enum, default_value_t = OutputFormat::Text)]
        format: OutputFormat,
    },

    /// Fetch engagement counters for a published post
    Metrics {
        id: String,

        #[arg(short, long, value_enum, default_value_t = OutputFormat::Text)]
        format: OutputFormat,
    },
}

#[derive(clap::Args, Debug)]
struct ContentArgs {
    #[arg(long, default_value = "")]
    title: String,

    #[arg(long, default_value = "")]
    body: String,

    /// Target platform (repeatable or comma-separated)
    #[arg(short, long = "platform", value_delimiter = ',')]
    platforms: Vec<String>,

    /// Already-uploaded media URL or handle (repeatable)
    #[arg(short, long = "media")]
    media: Vec<String>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum OutputFormat {
    Text,
    Json,
}

#[derive(Serialize)]
struct Handoff<'a> {
    id: &'a str,
    status: PublishStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    scheduled_at: Option<DateTime<Utc>>,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    init_logging(cli.verbose);

    match run(cli).await {
        Ok(code) => std::process::exit(code),
        Err(e) => {
            eprintln!("Error: {}", e);
            std::process::exit(e.exit_code());
        }
    }
}

/// Quiet by default; the CLI reports through stdout
fn init_logging(verbose: bool) {
    LoggingConfig::from_env("warn", verbose).init();
}

async fn run(cli: Cli) -> Result<i32> {
    let config = match &cli.config {
        Some(path) => Config::load_from_path(path)?,
        None => Config::load()?,
    };
    let service = PublishService::from_config(config).await?;

    let code = match cli.command {
        Commands::Post {
            content,
            at,
            draft,
            owner,
            format,
        } => {
            let scheduled_at = at.as_deref().map(parse_schedule).transpose()?;
            let request = PublishRequest {
                owner_id: owner,
                title: content.title,
                body: content.body,
                media_refs: content.media,
                targets: content.platforms,
                scheduled_at,
                draft,
            };
            let id = service.create_publish(request).await?;
            finish(&service, &id, format).await?
        }
        Commands::Edit {
            id,
            title,
            body,
            platforms,
            media,
            format,
        } => {
            let current = service.get_publish(&id).await?;
            let request = PublishRequest {
                owner_id: current.owner_id,
                title: title.unwrap_or(current.title),
                body: body.unwrap_or(current.body),
                media_refs: if media.is_empty() { current.media_refs } else { media },
                targets: if platforms.is_empty() { current.targets } else { platforms },
                ..Default::default()
            };
            let record = service.update_draft(&id, request).await?;
            print_record(&record, format);
            0
        }
        Commands::Publish { id, format } => {
            service.publish_now(&id).await?;
            settle(&service, &id, format).await?
        }
        Commands::Cancel { id } => {
            service.cancel_publish(&id).await?;
            println!("Cancelled {}", id);
            0
        }
        Commands::Reschedule { id, when } => {
            let at = parse_schedule(&when)?;
            let record = service.reschedule(&id, at).await?;
            println!("Rescheduled {} for {}", record.id, at.to_rfc3339());
            0
        }
        Commands::Show { id, format } => {
            let record = service.get_publish(&id).await?;
            print_record(&record, format);
            0
        }
        Commands::List { status, format } => {
            let status: Option<PublishStatus> = status.as_deref().map(str::parse).transpose()?;
            let records = service.list(status).await?;
            print_list(&records, format);
            0
        }
        Commands::Metrics { id, format } => {
            let metrics = service.fetch_metrics(&id).await?;
            print_metrics(&metrics, format);
            if metrics.iter().any(|m| m.error.is_some()) {
                1
            } else {
                0
            }
        }
    };

    service.shutdown().await;
    Ok(code)
}

/// Report a freshly created record
///
/// Records this process is publishing are awaited until every platform has
/// a final outcome; drafts and scheduled records are reported as stored.
async fn finish(service: &PublishService, id: &str, format: OutputFormat) -> Result<i32> {
    // Checked before reading the record so a job claiming it in between still counts
    let in_flight = service.executor().is_in_flight(id);
    let record = service.get_publish(id).await?;

    let stored_only = !in_flight
        && matches!(
            record.status,
            PublishStatus::Draft | PublishStatus::Scheduled
        );

    if stored_only {
        print_handoff(&record, format);
        return Ok(0);
    }

    settle(service, id, format).await
}

/// Wait for every platform to reach a final outcome and report it
///
/// Exits 0 only when every target published.
async fn settle(service: &PublishService, id: &str, format: OutputFormat) -> Result<i32> {
    debug!(record_id = %id, "Waiting for all platforms to settle");
    let record = service.await_settled(id).await?;
    print_record(&record, format);

    Ok(match record.status {
        PublishStatus::Published => 0,
        _ => 1,
    })
}

fn print_handoff(record: &PublishRecord, format: OutputFormat) {
    match format {
        OutputFormat::Json => print_json(&Handoff {
            id: &record.id,
            status: record.status,
            scheduled_at: record.scheduled_at,
        }),
        OutputFormat::Text => match (record.status, record.scheduled_at) {
            (PublishStatus::Scheduled, Some(at)) => {
                println!("{} scheduled for {}", record.id, at.to_rfc3339())
            }
            (status, _) => println!("{} {}", record.id, status),
        },
    }
}

fn print_record(record: &PublishRecord, format: OutputFormat) {
    if format == OutputFormat::Json {
        print_json(record);
        return;
    }

    println!("{} {}", record.id, record.status);
    if !record.title.is_empty() {
        println!("  title: {}", record.title);
    }
    if let Some(at) = record.scheduled_at {
        println!("  scheduled: {}", at.to_rfc3339());
    }

    for target in &record.targets {
        match record.outcome(target) {
            None => println!("  {}: pending", target),
            Some(outcome) if outcome.status == OutcomeStatus::Success => println!(
                "  {}: ok {}{}",
                target,
                outcome.remote_id.as_deref().unwrap_or("-"),
                outcome
                    .url
                    .as_deref()
                    .map(|u| format!(" {}", u))
                    .unwrap_or_default()
            ),
            Some(outcome) => println!(
                "  {}: {} {} after {} attempt(s): {}",
                target,
                if outcome.terminal { "failed" } else { "retrying" },
                outcome
                    .error_kind
                    .map(|k| k.to_string())
                    .unwrap_or_else(|| "error".to_string()),
                outcome.attempt_count,
                outcome.error_message.as_deref().unwrap_or("")
            ),
        }
    }
}

fn print_list(records: &[PublishRecord], format: OutputFormat) {
    if format == OutputFormat::Json {
        print_json(&records);
        return;
    }

    for record in records {
        let when = record
            .scheduled_at
            .map(|at| at.to_rfc3339())
            .unwrap_or_else(|| "-".to_string());
        println!(
            "{} | {} | {} | {} | {}",
            record.id,
            record.status,
            when,
            record.targets.join(","),
            truncate(&record.title, 40)
        );
    }
}

fn print_metrics(metrics: &[TargetMetrics], format: OutputFormat) {
    if format == OutputFormat::Json {
        print_json(&metrics);
        return;
    }

    for entry in metrics {
        match (&entry.metrics, &entry.error) {
            (Some(m), _) => {
                let counters: Vec<String> = m
                    .counters
                    .iter()
                    .map(|(name, value)| format!("{}={}", name, value))
                    .collect();
                println!("{} {} {}", entry.platform, entry.remote_id, counters.join(" "));
            }
            (None, error) => println!(
                "{} {} error: {}",
                entry.platform,
                entry.remote_id,
                error.as_deref().unwrap_or("unknown")
            ),
        }
    }
}

fn print_json<T: Serialize + ?Sized>(value: &T) {
    match serde_json::to_string_pretty(value) {
        Ok(json) => println!("{}", json),
        Err(e) => eprintln!("Error: failed to serialize output: {}", e),
    }
}

fn truncate(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        text.to_string()
    } else {
        let cut: String = text.chars().take(max_chars).collect();
        format!("{}...", cut)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_truncate_counts_chars() {
        assert_eq!(truncate("short", 10), "short");
        assert_eq!(truncate("ééééé", 3), "ééé...");
    }

    #[test]
    fn test_cli_parses_repeated_and_comma_platforms() {
        let cli = Cli::try_parse_from([
            "crosspost", "post", "--body", "hi", "-p", "facebook,youtube", "-p", "sandbox",
        ])
        .unwrap();

        match cli.command {
            Commands::Post { content, .. } => {
                assert_eq!(content.platforms, vec!["facebook", "youtube", "sandbox"]);
            }
            other => panic!("unexpected command: {:?}", other),
        }
    }
}
