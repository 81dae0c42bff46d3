pub mod enqueue;
pub mod jobs;
pub mod migration;
pub mod worker;

use anyhow::{Context, Result};
use clap::Args;
use std::sync::Arc;
use std::time::Duration;

use reel_persist::{SqliteConfig, SqliteDatabase};
use reel_queue::{
    EmailHandler, EmailPayload, JobStore, KindConfig, LogMailer, QueueManager, TypedPayload,
};

/// Database selection shared by every command
#[derive(Args)]
pub struct DbArgs {
    /// SQLite URL; defaults to REEL_DATABASE_URL, then sqlite:reel.db
    #[arg(long, global = true)]
    database_url: Option<String>,
}

impl DbArgs {
    pub async fn connect(&self) -> Result<SqliteDatabase> {
        let mut config = SqliteConfig::from_env();
        if let Some(url) = &self.database_url {
            config.url = url.clone();
        }

        SqliteDatabase::connect(&config)
            .await
            .with_context(|| format!("Failed to open database {}", config.url))
    }
}

/// Per-kind settings, shared by producers and workers.
///
/// A job's attempt ceiling is fixed when it is queued, so `enqueue` and
/// `worker` must agree on these.
#[derive(Args, Debug, Clone)]
pub struct KindArgs {
    /// Concurrent email deliveries per worker process
    #[arg(long, env = "REEL_EMAIL_CONCURRENCY", global = true, default_value_t = 2)]
    email_concurrency: usize,

    /// Attempts before an email job fails for good
    #[arg(long, env = "REEL_EMAIL_MAX_ATTEMPTS", global = true, default_value_t = 5)]
    email_attempts: u32,

    /// Per-attempt email timeout in seconds, 0 to disable
    #[arg(long, env = "REEL_EMAIL_TIMEOUT_SECS", global = true, default_value_t = 60)]
    email_timeout_secs: u64,
}

impl KindArgs {
    pub fn email(&self) -> KindConfig {
        let config = KindConfig::default()
            .with_concurrency(self.email_concurrency)
            .with_max_attempts(self.email_attempts);
        match self.email_timeout_secs {
            0 => config,
            secs => config.with_timeout(Duration::from_secs(secs)),
        }
    }
}

/// Queue manager over the database with every known job kind registered
/// and configured
pub fn queue_manager(db: &SqliteDatabase, kinds: &KindArgs) -> Arc<QueueManager> {
    let store: Arc<dyn JobStore> = Arc::new(db.job_store());
    let manager = Arc::new(QueueManager::new(store));
    manager.register(EmailPayload::KIND, EmailHandler::new(LogMailer));
    manager.configure(EmailPayload::KIND, kinds.email());
    manager
}

#[cfg(test)]
mod tests {
    use super::*;
    use reel_queue::JobOptions;

    fn kinds(email_attempts: u32) -> KindArgs {
        KindArgs {
            email_concurrency: 1,
            email_attempts,
            email_timeout_secs: 0,
        }
    }

    #[test]
    fn test_email_kind_config() {
        let config = kinds(2).email();
        assert_eq!(config.max_attempts, 2);
        assert_eq!(config.concurrency, 1);
        assert_eq!(config.timeout, None);

        let with_timeout = KindArgs {
            email_timeout_secs: 30,
            ..kinds(2)
        };
        assert_eq!(with_timeout.email().timeout, Some(Duration::from_secs(30)));
    }

    #[tokio::test]
    async fn test_producer_and_worker_share_attempt_ceiling() {
        let db = SqliteDatabase::connect(&SqliteConfig::memory()).await.unwrap();
        let settings = kinds(2);

        // `reel enqueue` and `reel worker` each build their own manager
        let producer = queue_manager(&db, &settings);
        let worker = queue_manager(&db, &settings);

        let email = EmailPayload::new(vec!["a@example.com".into()], "Hi", "Body");
        let id = producer
            .enqueue_payload(&email, JobOptions::default())
            .await
            .unwrap();

        let job = worker.get(id).await.unwrap().unwrap();
        assert_eq!(job.max_attempts, 2);
        assert_eq!(worker.kind_config(EmailPayload::KIND).max_attempts, 2);
    }
}
