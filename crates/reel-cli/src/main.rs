//! Reel CLI - run and operate the background job queue
//!
//! # Usage
//!
//! ```bash
//! # Run the worker pool until Ctrl-C
//! reel worker
//!
//! # Queue an email
//! reel enqueue email --to a@example.com --subject Hi --text Body
//!
//! # Inspect and operate on jobs
//! reel jobs list --state failed
//! reel jobs retry 42 --role admin
//!
//! # Data migration level
//! reel migration show
//! ```

use anyhow::Result;
use clap::{Parser, Subcommand};
use colored::Colorize;

mod commands;

use commands::{enqueue, jobs, migration, worker, DbArgs, KindArgs};

/// Reel job queue
///
/// Background processing for the Reel video platform: email delivery and
/// other deferred work, with retries and crash recovery.
#[derive(Parser)]
#[command(
    name = "reel",
    version,
    about = "Reel CLI - background job queue",
    long_about = "Runs the Reel worker pool and operates on its job store.\n\n\
                  Jobs are persisted in SQLite, claimed under a lease and\n\
                  retried with exponential backoff until they succeed or fail."
)]
struct Cli {
    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(flatten)]
    db: DbArgs,

    #[command(flatten)]
    kinds: KindArgs,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the worker pool
    #[command(name = "worker")]
    Worker,

    /// Submit a job
    #[command(name = "enqueue")]
    Enqueue(enqueue::EnqueueArgs),

    /// Inspect, retry and prune jobs
    #[command(name = "jobs")]
    Jobs(jobs::JobsArgs),

    /// Read or set the data migration version
    #[command(name = "migration")]
    Migration(migration::MigrationArgs),
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Setup tracing based on verbosity
    setup_logging(cli.verbose);

    let db = cli.db.connect().await?;

    match cli.command {
        Commands::Worker => worker::run(db, &cli.kinds).await,
        Commands::Enqueue(args) => enqueue::run(args, db, &cli.kinds).await,
        Commands::Jobs(args) => jobs::run(args, db, &cli.kinds).await,
        Commands::Migration(args) => migration::run(args, db).await,
    }
}

/// Setup logging based on verbosity level
fn setup_logging(verbosity: u8) {
    use tracing_subscriber::EnvFilter;

    let filter = match verbosity {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)))
        .init();
}

/// Print a success message with a checkmark
pub fn print_success(msg: &str) {
    println!("{} {}", "✓".green().bold(), msg);
}

/// Print a warning message
pub fn print_warning(msg: &str) {
    println!("{} {}", "⚠".yellow().bold(), msg);
}

/// Print an info message
pub fn print_info(msg: &str) {
    println!("{} {}", "ℹ".blue().bold(), msg);
}
