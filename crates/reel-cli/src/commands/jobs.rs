//! Jobs command - inspect and operate on stored jobs
//!
//! Usage:
//! ```bash
//! reel jobs list --state failed
//! reel jobs show 42
//! reel jobs stats
//! reel jobs retry 42 --role admin
//! reel jobs prune --older-than-secs 86400 --role admin
//! ```

use anyhow::{bail, Result};
use chrono::{DateTime, Utc};
use clap::{Args, Subcommand, ValueEnum};
use colored::Colorize;
use comfy_table::{modifiers::UTF8_ROUND_CORNERS, presets::UTF8_FULL, Cell, Color, Table};
use std::time::Duration;

use reel_persist::SqliteDatabase;
use reel_queue::{JobId, JobRecord, JobState, Principal, QueueManager};

use super::{queue_manager, KindArgs};
use crate::{print_info, print_success, print_warning};

/// Arguments for the jobs command
#[derive(Args)]
pub struct JobsArgs {
    #[command(subcommand)]
    command: JobsCommand,
}

#[derive(Subcommand)]
pub enum JobsCommand {
    /// Show one job in full
    #[command(name = "show")]
    Show { id: JobId },

    /// List recent jobs
    #[command(name = "list")]
    List {
        /// Only jobs in this state
        #[arg(long)]
        state: Option<JobState>,

        #[arg(long, default_value_t = 20)]
        limit: usize,
    },

    /// Job counts per state
    #[command(name = "stats")]
    Stats,

    /// Give a failed job a fresh set of attempts (admin only)
    #[command(name = "retry")]
    Retry {
        id: JobId,

        #[command(flatten)]
        operator: OperatorArgs,
    },

    /// Delete completed jobs older than the cutoff (admin only)
    #[command(name = "prune")]
    Prune {
        #[arg(long, default_value_t = 7 * 24 * 60 * 60)]
        older_than_secs: u64,

        #[command(flatten)]
        operator: OperatorArgs,
    },
}

#[derive(Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Role {
    Admin,
    Operator,
}

/// Who is running a privileged command
#[derive(Args)]
pub struct OperatorArgs {
    #[arg(long, env = "REEL_ROLE", value_enum, default_value_t = Role::Operator)]
    role: Role,

    /// Name recorded in logs; defaults to $USER
    #[arg(long = "as", env = "USER", default_value = "operator")]
    name: String,
}

impl Principal for OperatorArgs {
    fn name(&self) -> &str {
        &self.name
    }

    fn is_admin(&self) -> bool {
        self.role == Role::Admin
    }
}

/// Run the jobs command
pub async fn run(args: JobsArgs, db: SqliteDatabase, kinds: &KindArgs) -> Result<()> {
    let manager = queue_manager(&db, kinds);

    match args.command {
        JobsCommand::Show { id } => show(&manager, id).await,
        JobsCommand::List { state, limit } => list(&manager, state, limit).await,
        JobsCommand::Stats => stats(&manager).await,
        JobsCommand::Retry { id, operator } => {
            let job = manager.admin(&operator)?.retry(id).await?;
            print_success(&format!(
                "Job {} ({}) is pending again",
                job.id.to_string().green().bold(),
                job.kind
            ));
            Ok(())
        }
        JobsCommand::Prune {
            older_than_secs,
            operator,
        } => {
            let pruned = manager
                .admin(&operator)?
                .prune_completed(Duration::from_secs(older_than_secs))
                .await?;
            print_success(&format!("Pruned {pruned} completed job(s)"));
            Ok(())
        }
    }
}

fn format_time(at: DateTime<Utc>) -> String {
    at.format("%Y-%m-%d %H:%M:%S").to_string()
}

fn state_color(state: JobState) -> Color {
    match state {
        JobState::Pending => Color::White,
        JobState::Active => Color::Blue,
        JobState::Completed => Color::Green,
        JobState::Failed => Color::Red,
        JobState::Delayed => Color::Yellow,
    }
}

async fn show(manager: &QueueManager, id: JobId) -> Result<()> {
    let Some(job) = manager.get(id).await? else {
        bail!("Job {id} not found. Run 'reel jobs list' to see recent jobs.");
    };

    println!("{} {}", "Job".bold(), job.id.to_string().cyan().bold());
    println!("  {} {}", "Kind:".dimmed(), job.kind.green());
    println!("  {} {}", "State:".dimmed(), job.state);
    println!("  {} {}/{}", "Attempts:".dimmed(), job.attempts, job.max_attempts);
    println!("  {} {}", "Created:".dimmed(), format_time(job.created_at));
    println!("  {} {}", "Next run:".dimmed(), format_time(job.next_run_at));
    if let Some(lease) = job.lease_expires_at {
        println!("  {} {}", "Lease until:".dimmed(), format_time(lease));
    }
    if let Some(finished) = job.finished_at {
        println!("  {} {}", "Finished:".dimmed(), format_time(finished));
    }
    if let Some(error) = &job.last_error {
        println!("  {} {}", "Last error:".dimmed(), error.red());
    }
    println!();
    println!("{}", "Payload:".bold());
    println!("{}", serde_json::to_string_pretty(&job.payload)?);

    Ok(())
}

async fn list(manager: &QueueManager, state: Option<JobState>, limit: usize) -> Result<()> {
    let jobs: Vec<JobRecord> = manager.store().list(state, limit).await?;
    if jobs.is_empty() {
        print_info("No jobs found");
        return Ok(());
    }

    let mut table = Table::new();
    table
        .load_preset(UTF8_FULL)
        .apply_modifier(UTF8_ROUND_CORNERS)
        .set_header(vec![
            Cell::new("ID").fg(Color::Cyan),
            Cell::new("Kind").fg(Color::Cyan),
            Cell::new("State").fg(Color::Cyan),
            Cell::new("Attempts").fg(Color::Cyan),
            Cell::new("Next run").fg(Color::Cyan),
            Cell::new("Last error").fg(Color::Cyan),
        ]);

    for job in &jobs {
        table.add_row(vec![
            Cell::new(job.id),
            Cell::new(&job.kind).fg(Color::Green),
            Cell::new(job.state).fg(state_color(job.state)),
            Cell::new(format!("{}/{}", job.attempts, job.max_attempts)),
            Cell::new(format_time(job.next_run_at)),
            Cell::new(job.last_error.as_deref().unwrap_or("-")),
        ]);
    }

    println!("{table}");
    Ok(())
}

async fn stats(manager: &QueueManager) -> Result<()> {
    let counts = manager.store().counts().await?;

    let mut table = Table::new();
    table
        .load_preset(UTF8_FULL)
        .apply_modifier(UTF8_ROUND_CORNERS)
        .set_header(vec![
            Cell::new("State").fg(Color::Cyan),
            Cell::new("Jobs").fg(Color::Cyan),
        ]);

    for (state, n) in [
        (JobState::Pending, counts.pending),
        (JobState::Delayed, counts.delayed),
        (JobState::Active, counts.active),
        (JobState::Completed, counts.completed),
        (JobState::Failed, counts.failed),
    ] {
        table.add_row(vec![Cell::new(state).fg(state_color(state)), Cell::new(n)]);
    }

    println!("{table}");
    println!("{} {}", "Total:".bold(), counts.total());
    if counts.failed > 0 {
        print_warning(&format!(
            "{} failed job(s); inspect with 'reel jobs list --state failed'",
            counts.failed
        ));
    }
    Ok(())
}
