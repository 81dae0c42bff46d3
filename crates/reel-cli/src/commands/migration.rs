//! Migration command - the data migration counter
//!
//! Usage:
//! ```bash
//! reel migration show
//! reel migration set 5
//! ```

use anyhow::Result;
use clap::{Args, Subcommand};
use colored::Colorize;

use reel_persist::SqliteDatabase;

use crate::{print_success, print_warning};

/// Arguments for the migration command
#[derive(Args)]
pub struct MigrationArgs {
    #[command(subcommand)]
    command: MigrationCommand,
}

#[derive(Subcommand)]
pub enum MigrationCommand {
    /// Print the current version
    #[command(name = "show")]
    Show,

    /// Record a new version
    #[command(name = "set")]
    Set { version: i64 },
}

/// Run the migration command
pub async fn run(args: MigrationArgs, db: SqliteDatabase) -> Result<()> {
    let versions = db.migration_versions();

    match args.command {
        MigrationCommand::Show => match versions.load().await? {
            Some(version) => println!(
                "{} {}",
                "Migration version:".bold(),
                version.to_string().green()
            ),
            None => print_warning("Migration version not initialized"),
        },
        MigrationCommand::Set { version } => {
            versions.initialize().await?;
            versions.update(version).await?;
            print_success(&format!("Migration version set to {version}"));
        }
    }

    Ok(())
}
