//! Proscout CLI: operator surface for research runs.
//!
//! Runs are stored under the configured state directory, so a `trigger` in one
//! invocation can be worked, paused or inspected by the next.

mod commands;

use clap::Parser;
use std::path::PathBuf;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};
use uuid::Uuid;

/// Proscout: resumable multi-source product research
#[derive(Parser, Debug)]
#[command(name = "proscout", version, about, long_about = None)]
pub(crate) struct Cli {
    /// Workspace directory (reads `.proscout/config.toml`)
    #[arg(short, long, default_value = ".")]
    workspace: PathBuf,

    /// State directory for runs and the job queue (overrides `storage.state_dir`)
    #[arg(long)]
    state_dir: Option<PathBuf>,

    /// JSON fixture answering research tool calls
    #[arg(short, long)]
    fixture: Option<PathBuf>,

    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Suppress non-essential output
    #[arg(short, long)]
    quiet: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
pub(crate) enum Commands {
    /// Create a research run for a subject and queue it
    Trigger {
        /// Subject (item) identifier
        subject: String,
        /// Owner of the subject
        #[arg(long)]
        owner: String,
    },
    /// Ask a running run to pause at its next phase boundary
    Pause { run_id: Uuid },
    /// Queue a paused or failed run to continue from its checkpoint
    Resume { run_id: Uuid },
    /// Cancel a run
    Cancel { run_id: Uuid },
    /// Show one run and its result, if any
    Status { run_id: Uuid },
    /// List all runs
    List,
    /// Process queued jobs
    Work {
        /// Keep polling the queue until interrupted
        #[arg(long)]
        follow: bool,
        /// Number of concurrent workers (overrides `workers.concurrency`)
        #[arg(long)]
        concurrency: Option<usize>,
    },
    /// Reconcile stored runs against the job queue
    Reconcile {
        /// Skip the startup grace delay
        #[arg(long)]
        now: bool,
    },
    /// Manage configuration
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(clap::Subcommand, Debug)]
pub(crate) enum ConfigAction {
    /// Write a default configuration file to the workspace
    Init,
    /// Print the resolved configuration
    Show,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file if present
    let _ = dotenvy::dotenv();

    let cli = Cli::parse();

    let filter = match cli.verbose {
        0 if cli.quiet => "error",
        0 => "info",
        1 => "debug",
        _ => "trace",
    };

    let stderr_layer = tracing_subscriber::fmt::layer()
        .with_target(false)
        .with_writer(std::io::stderr)
        .with_filter(EnvFilter::new(filter));

    let log_dir = directories::ProjectDirs::from("dev", "proscout", "proscout")
        .map(|d| d.data_dir().join("logs"))
        .unwrap_or_else(|| PathBuf::from("."));
    let _ = std::fs::create_dir_all(&log_dir);
    let file_appender = tracing_appender::rolling::daily(&log_dir, "proscout.log");
    let (non_blocking, _guard) = tracing_appender::non_blocking(file_appender);
    let json_layer = tracing_subscriber::fmt::layer()
        .json()
        .with_writer(non_blocking)
        .with_filter(EnvFilter::new("debug"));

    tracing_subscriber::registry()
        .with(stderr_layer)
        .with(json_layer)
        .init();

    let workspace = cli
        .workspace
        .canonicalize()
        .unwrap_or_else(|_| std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")));

    commands::handle_command(cli, &workspace).await
}
