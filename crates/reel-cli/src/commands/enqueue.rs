//! Enqueue command - submit jobs from the shell
//!
//! Usage:
//! ```bash
//! reel enqueue email --to a@example.com --subject Hi --text Body
//! ```

use anyhow::Result;
use clap::{Args, Subcommand};
use colored::Colorize;
use std::time::Duration;

use reel_persist::SqliteDatabase;
use reel_queue::{EmailPayload, JobOptions};

use super::{queue_manager, KindArgs};
use crate::print_success;

/// Arguments for the enqueue command
#[derive(Args)]
pub struct EnqueueArgs {
    #[command(subcommand)]
    command: EnqueueCommand,
}

#[derive(Subcommand)]
pub enum EnqueueCommand {
    /// Queue an email
    #[command(name = "email")]
    Email {
        /// Recipient, repeat for several
        #[arg(long = "to", required = true)]
        to: Vec<String>,

        #[arg(long)]
        subject: String,

        /// Plain-text body
        #[arg(long)]
        text: String,

        /// Display name of the sender
        #[arg(long)]
        from_name: Option<String>,

        #[arg(long)]
        reply_to: Option<String>,

        /// Wait this long before the first attempt
        #[arg(long)]
        delay_secs: Option<u64>,

        /// Override the kind's attempt ceiling
        #[arg(long)]
        max_attempts: Option<u32>,
    },
}

/// Run the enqueue command
pub async fn run(args: EnqueueArgs, db: SqliteDatabase, kinds: &KindArgs) -> Result<()> {
    let manager = queue_manager(&db, kinds);

    match args.command {
        EnqueueCommand::Email {
            to,
            subject,
            text,
            from_name,
            reply_to,
            delay_secs,
            max_attempts,
        } => {
            let payload = EmailPayload {
                from_display_name: from_name,
                reply_to,
                ..EmailPayload::new(to, subject, text)
            };
            let options = JobOptions {
                delay: delay_secs.map(Duration::from_secs),
                max_attempts,
            };

            let id = manager.enqueue_payload(&payload, options).await?;
            print_success(&format!(
                "Queued email job {} for {}",
                id.to_string().green().bold(),
                payload.to.join(", ")
            ));
        }
    }

    Ok(())
}
