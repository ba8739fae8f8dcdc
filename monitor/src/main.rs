//! Event Monitor - tails rotated structured event logs.
//!
//! # Commands
//!
//! - `event-monitor run`: Follow an event directory and print each parsed
//!   event as one JSON line on stdout
//! - `event-monitor emit`: Append one event to `event_<SOURCE_TYPE>.log`
//!
//! # Environment Variables
//!
//! See the [`config`](event_monitor::config) module for available configuration options.

use std::io::{self, Write};
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

use event_monitor::config::MonitorConfig;
use event_monitor::monitor::{channel, Monitor};
use event_monitor::parser::EventParser;
use event_monitor::types::{Severity, SourceType};
use event_monitor::writer::{EventLogger, RotationPolicy, DEFAULT_BACKUP_COUNT, DEFAULT_MAX_BYTES};

/// Event Monitor - tails rotated structured event logs.
#[derive(Parser, Debug)]
#[command(name = "event-monitor")]
#[command(author, version, about, long_about = None)]
#[command(after_help = "\
ENVIRONMENT VARIABLES:
    EVENT_MONITOR_DIR                     Event directory (required for 'run' without --dir)
    EVENT_MONITOR_SCAN_INTERVAL_MS        Scan interval (default: 2000)
    EVENT_MONITOR_LINE_LENGTH_LIMIT       Longest accepted line in bytes (default: 2097152)
    EVENT_MONITOR_LINE_COUNT_LIMIT        Lines per file per scan (default: 200)
    EVENT_MONITOR_SOURCE_TYPES            Comma-separated source types to follow
    EVENT_MONITOR_FAILURE_WARN_THRESHOLD  Failed scans before an error is logged (default: 5)

EXAMPLES:
    # Follow a session's event directory
    event-monitor run --dir /tmp/session/logs/events

    # Append a test event
    event-monitor emit --dir /tmp/session/logs/events --source-type GCS \\
        --field job_id=01000000 \"node added\"
")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

/// CLI subcommands.
#[derive(Subcommand, Debug)]
enum Command {
    /// Follow an event directory and print events as JSON lines.
    Run {
        /// Event directory (overrides EVENT_MONITOR_DIR).
        #[arg(short, long)]
        dir: Option<PathBuf>,

        /// Scan interval in milliseconds (overrides EVENT_MONITOR_SCAN_INTERVAL_MS).
        #[arg(short, long)]
        interval_ms: Option<u64>,

        /// Only follow these source types; may be repeated.
        #[arg(short, long = "source-type")]
        source_types: Vec<SourceType>,

        /// Emit logs as JSON lines on stderr.
        #[arg(long)]
        log_json: bool,
    },

    /// Append one event to a source's live log file.
    Emit {
        /// Event directory.
        #[arg(short, long)]
        dir: PathBuf,

        /// Emitting subsystem (e.g. GCS, RAYLET, JOBS).
        #[arg(short, long)]
        source_type: SourceType,

        /// Event severity.
        #[arg(long, value_enum, default_value_t = SeverityArg::Info)]
        severity: SeverityArg,

        /// Custom field as key=value; may be repeated.
        #[arg(short, long = "field", value_parser = parse_field)]
        fields: Vec<(String, String)>,

        /// Rotate the live file at this size in bytes.
        #[arg(long, default_value_t = DEFAULT_MAX_BYTES)]
        max_bytes: u64,

        /// Number of rotated backups to keep.
        #[arg(long, default_value_t = DEFAULT_BACKUP_COUNT)]
        backup_count: usize,

        /// Event message.
        message: String,
    },
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum SeverityArg {
    Debug,
    Info,
    Warning,
    Error,
    Fatal,
}

impl From<SeverityArg> for Severity {
    fn from(arg: SeverityArg) -> Self {
        match arg {
            SeverityArg::Debug => Severity::Debug,
            SeverityArg::Info => Severity::Info,
            SeverityArg::Warning => Severity::Warning,
            SeverityArg::Error => Severity::Error,
            SeverityArg::Fatal => Severity::Fatal,
        }
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Command::Run {
            dir,
            interval_ms,
            source_types,
            log_json,
        } => {
            init_logging(log_json);

            let runtime = tokio::runtime::Builder::new_multi_thread()
                .enable_all()
                .build()
                .context("Failed to create tokio runtime")?;

            runtime.block_on(run_monitor(dir, interval_ms, source_types))
        }
        Command::Emit {
            dir,
            source_type,
            severity,
            fields,
            max_bytes,
            backup_count,
            message,
        } => {
            let policy = RotationPolicy {
                max_bytes,
                backup_count,
            };
            let mut logger = EventLogger::open(&dir, source_type, policy)
                .with_context(|| format!("Failed to open event log in {}", dir.display()))?;
            let record = logger
                .emit(severity.into(), message, fields)
                .context("Failed to write event")?;
            println!("{}", record.event_id);
            Ok(())
        }
    }
}

/// Runs the monitor until SIGINT or SIGTERM.
async fn run_monitor(
    dir: Option<PathBuf>,
    interval_ms: Option<u64>,
    source_types: Vec<SourceType>,
) -> Result<()> {
    let mut config = match dir {
        Some(dir) => MonitorConfig::from_env_with_dir(dir),
        None => MonitorConfig::from_env(),
    }
    .context("Failed to load configuration")?;

    if let Some(ms) = interval_ms {
        config.scan_interval = Duration::from_millis(ms);
    }
    if !source_types.is_empty() {
        config = config.with_source_types(source_types.iter().map(|s| s.as_str()));
    }

    info!(
        event_dir = %config.event_dir.display(),
        scan_interval_ms = config.scan_interval.as_millis() as u64,
        "Configuration loaded"
    );

    let (consumer, mut batches) = channel();
    let mut handle = Monitor::new(config, EventParser)
        .context("Invalid monitor configuration")?
        .spawn(consumer, None)
        .context("Failed to start monitor")?;

    let mut stdout = io::stdout().lock();
    let shutdown = wait_for_shutdown();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            () = &mut shutdown => {
                info!("Shutdown signal received");
                break;
            }

            batch = batches.recv() => {
                let Some(batch) = batch else {
                    warn!("Monitor task exited unexpectedly");
                    break;
                };
                for record in batch {
                    let line = serde_json::to_string(&record)?;
                    writeln!(stdout, "{line}")?;
                }
                stdout.flush()?;
            }
        }
    }

    handle.cancel();
    if let Err(e) = handle.wait().await {
        if !e.is_cancelled() {
            warn!(error = %e, "Monitor stopped with an error");
        }
    }

    let stats = handle.stats();
    info!(
        cycles = stats.cycles,
        delivered = stats.records_delivered,
        oversized = stats.oversized_lines,
        malformed = stats.malformed_lines,
        "Monitor stopped"
    );
    Ok(())
}

/// Parses a `key=value` custom field.
fn parse_field(raw: &str) -> std::result::Result<(String, String), String> {
    raw.split_once('=')
        .map(|(k, v)| (k.trim().to_string(), v.to_string()))
        .filter(|(k, _)| !k.is_empty())
        .ok_or_else(|| format!("expected key=value, got '{raw}'"))
}

/// Initializes the logging subsystem. Logs go to stderr; stdout carries events.
fn init_logging(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    if json {
        let json_layer = fmt::layer()
            .json()
            .with_writer(io::stderr)
            .with_target(true)
            .with_level(true)
            .with_file(false)
            .with_line_number(false);

        tracing_subscriber::registry()
            .with(filter)
            .with(json_layer)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(io::stderr)
            .with_target(true)
            .with_level(true)
            .init();
    }
}

/// Waits for a shutdown signal (SIGINT or SIGTERM).
async fn wait_for_shutdown() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
