//! Migration version counter
//!
//! A single `application` row holding the data migration level the
//! database has reached.

use sqlx::{Sqlite, SqlitePool, Transaction};
use tracing::info;

use crate::error::StorageError;

const ROW_ID: i64 = 1;

fn check(version: i64) -> Result<i64, StorageError> {
    if version < 0 {
        return Err(StorageError::Invalid(format!(
            "migration version must be non-negative, got {version}"
        )));
    }
    Ok(version)
}

#[derive(Debug, Clone)]
pub struct MigrationVersionStore {
    pool: SqlitePool,
}

impl MigrationVersionStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Create the row at version 0 unless it already exists
    pub async fn initialize(&self) -> Result<(), StorageError> {
        sqlx::query("INSERT OR IGNORE INTO application (id, migration_version) VALUES (?, 0)")
            .bind(ROW_ID)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Current version, `None` before [`initialize`](Self::initialize)
    pub async fn load(&self) -> Result<Option<i64>, StorageError> {
        let version =
            sqlx::query_scalar::<_, i64>("SELECT migration_version FROM application WHERE id = ?")
                .bind(ROW_ID)
                .fetch_optional(&self.pool)
                .await?;
        Ok(version)
    }

    pub async fn update(&self, version: i64) -> Result<(), StorageError> {
        let mut tx = self.pool.begin().await?;
        Self::update_in(&mut tx, version).await?;
        tx.commit().await?;
        Ok(())
    }

    /// Write the version inside a caller's transaction, so it commits or
    /// rolls back with the migration step it belongs to
    pub async fn update_in(
        tx: &mut Transaction<'_, Sqlite>,
        version: i64,
    ) -> Result<(), StorageError> {
        let version = check(version)?;
        sqlx::query(
            "INSERT INTO application (id, migration_version) VALUES (?, ?) \
             ON CONFLICT(id) DO UPDATE SET migration_version = excluded.migration_version",
        )
        .bind(ROW_ID)
        .bind(version)
        .execute(&mut **tx)
        .await?;

        info!(migration_version = version, "Updated migration version");
        Ok(())
    }

    /// Read-modify-write in one transaction. Returns the stored value.
    pub async fn update_with<F>(&self, f: F) -> Result<i64, StorageError>
    where
        F: FnOnce(i64) -> i64 + Send,
    {
        let mut tx = self.pool.begin().await?;

        // Take the write lock before reading so concurrent writers queue up
        sqlx::query("INSERT OR IGNORE INTO application (id, migration_version) VALUES (?, 0)")
            .bind(ROW_ID)
            .execute(&mut *tx)
            .await?;
        sqlx::query("UPDATE application SET migration_version = migration_version WHERE id = ?")
            .bind(ROW_ID)
            .execute(&mut *tx)
            .await?;

        let current: i64 =
            sqlx::query_scalar("SELECT migration_version FROM application WHERE id = ?")
                .bind(ROW_ID)
                .fetch_one(&mut *tx)
                .await?;

        let next = f(current);
        Self::update_in(&mut tx, next).await?;
        tx.commit().await?;
        Ok(next)
    }
}
