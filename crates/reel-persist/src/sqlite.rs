//! SQLite connection setup

use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use std::env;
use std::str::FromStr;
use tracing::info;

use crate::error::StorageError;
use crate::migration_version::MigrationVersionStore;
use crate::queue::SqliteJobStore;

/// SQLite configuration options
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SqliteConfig {
    /// Database URL (e.g., "sqlite:reel.db" or "sqlite::memory:")
    pub url: String,
    /// Maximum number of connections in the pool
    pub max_connections: u32,
    /// Enable WAL journal mode for better concurrency
    pub wal_mode: bool,
    /// Busy timeout in seconds
    pub busy_timeout_secs: u32,
}

impl Default for SqliteConfig {
    fn default() -> Self {
        Self {
            url: "sqlite:reel.db?mode=rwc".to_string(),
            max_connections: 5,
            wal_mode: true,
            busy_timeout_secs: 30,
        }
    }
}

impl SqliteConfig {
    /// Create config for in-memory database (testing)
    pub fn memory() -> Self {
        Self {
            url: "sqlite::memory:".to_string(),
            max_connections: 1,
            wal_mode: false,
            busy_timeout_secs: 5,
        }
    }

    /// Load from `REEL_DATABASE_URL`, `REEL_DB_MAX_CONNECTIONS`,
    /// `REEL_DB_WAL` and `REEL_DB_BUSY_TIMEOUT_SECS`
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            url: env::var("REEL_DATABASE_URL").unwrap_or(defaults.url),
            max_connections: env::var("REEL_DB_MAX_CONNECTIONS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.max_connections),
            wal_mode: env::var("REEL_DB_WAL")
                .map(|v| v != "0" && v != "false")
                .unwrap_or(defaults.wal_mode),
            busy_timeout_secs: env::var("REEL_DB_BUSY_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.busy_timeout_secs),
        }
    }

    fn is_memory(&self) -> bool {
        self.url.contains(":memory:") || self.url.contains("mode=memory")
    }
}

/// A migrated connection pool
#[derive(Debug, Clone)]
pub struct SqliteDatabase {
    pool: SqlitePool,
}

impl SqliteDatabase {
    /// Connect to `url` with default settings
    pub async fn new(url: &str) -> Result<Self, StorageError> {
        let config = SqliteConfig {
            url: url.to_string(),
            ..Default::default()
        };
        Self::connect(&config).await
    }

    /// Open the pool, apply pragmas and run embedded migrations
    pub async fn connect(config: &SqliteConfig) -> Result<Self, StorageError> {
        let mut options = SqliteConnectOptions::from_str(&config.url)
            .map_err(|e| StorageError::Connection(e.to_string()))?
            .pragma("busy_timeout", config.busy_timeout_secs.saturating_mul(1000).to_string());

        if config.wal_mode {
            options = options.pragma("journal_mode", "WAL");
        }

        let mut pool_options = SqlitePoolOptions::new().max_connections(config.max_connections);
        if config.is_memory() {
            // Each in-memory connection is its own database; never recycle it
            pool_options = pool_options.idle_timeout(None).max_lifetime(None);
        }

        let pool = pool_options
            .connect_with(options)
            .await
            .map_err(|e| StorageError::Connection(e.to_string()))?;

        info!(
            url = %config.url,
            wal = config.wal_mode,
            max_connections = config.max_connections,
            "Connected to SQLite"
        );

        sqlx::migrate!("./migrations").run(&pool).await?;

        Ok(Self { pool })
    }

    /// Get the connection pool
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub fn job_store(&self) -> SqliteJobStore {
        SqliteJobStore::new(self.pool.clone())
    }

    pub fn migration_versions(&self) -> MigrationVersionStore {
        MigrationVersionStore::new(self.pool.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_config() {
        let config = SqliteConfig::memory();
        assert!(config.is_memory());
        assert_eq!(config.max_connections, 1);
        assert!(!SqliteConfig::default().is_memory());
    }

    #[tokio::test]
    async fn test_connect_runs_migrations() {
        let db = SqliteDatabase::connect(&SqliteConfig::memory()).await.unwrap();

        let tables: Vec<String> = sqlx::query_scalar(
            "SELECT name FROM sqlite_master WHERE type = 'table' AND name IN ('jobs', 'application') ORDER BY name",
        )
        .fetch_all(db.pool())
        .await
        .unwrap();
        assert_eq!(tables, vec!["application", "jobs"]);
    }
}
