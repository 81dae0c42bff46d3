//! Storage error types

use reel_queue::StoreError;

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Query error: {0}")]
    Query(String),

    #[error("Migration failed: {0}")]
    Migration(String),

    #[error("Invalid value: {0}")]
    Invalid(String),
}

impl From<sqlx::Error> for StorageError {
    fn from(error: sqlx::Error) -> Self {
        match error {
            sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::Io(_) => {
                Self::Connection(error.to_string())
            }
            other => Self::Query(other.to_string()),
        }
    }
}

impl From<sqlx::migrate::MigrateError> for StorageError {
    fn from(error: sqlx::migrate::MigrateError) -> Self {
        Self::Migration(error.to_string())
    }
}

impl From<StorageError> for StoreError {
    fn from(error: StorageError) -> Self {
        match error {
            // Whether the statement ran is unknown
            StorageError::Connection(msg) => StoreError::Unavailable(msg),
            other => StoreError::Backend(other.to_string()),
        }
    }
}

/// Route a driver error into the job store taxonomy
pub(crate) fn store_error(error: sqlx::Error) -> StoreError {
    StorageError::from(error).into()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pool_errors_are_unavailable() {
        assert!(store_error(sqlx::Error::PoolTimedOut).is_unavailable());
        assert!(store_error(sqlx::Error::PoolClosed).is_unavailable());
        assert!(!store_error(sqlx::Error::RowNotFound).is_unavailable());
    }
}
