//! Worker command - run the pool until interrupted
//!
//! Usage:
//! ```bash
//! reel worker --email-concurrency 4
//! ```

use anyhow::{Context, Result};
use colored::Colorize;

use reel_persist::SqliteDatabase;
use reel_queue::{WorkerConfig, WorkerPool};

use super::{queue_manager, KindArgs};
use crate::{print_info, print_success};

/// Run the worker command. Per-kind settings such as `--email-concurrency`
/// are global options, shared with `reel enqueue`.
pub async fn run(db: SqliteDatabase, kinds: &KindArgs) -> Result<()> {
    let manager = queue_manager(&db, kinds);

    let recovered = manager
        .store()
        .recover_expired_leases()
        .await
        .context("Lease recovery failed")?;
    if recovered > 0 {
        print_info(&format!("Recovered {recovered} job(s) from a previous run"));
    }

    let config = WorkerConfig::from_env();
    let pool = WorkerPool::new(manager.clone(), config.clone()).start();

    print_success(&format!(
        "Worker pool running for {} (lease {}s)",
        manager.registry().kinds().join(", ").green(),
        config.lease.as_secs()
    ));
    print_info("Press Ctrl-C to stop");

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl-C")?;

    print_info("Stopping, waiting for running jobs...");
    pool.shutdown().await;
    print_success("Worker pool stopped");

    Ok(())
}
