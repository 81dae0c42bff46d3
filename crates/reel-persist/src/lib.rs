//! # Reel Persistence
//!
//! SQLite storage for the Reel job queue.
//!
//! Provides:
//! - `SqliteJobStore`, a durable `reel_queue::JobStore`
//! - `MigrationVersionStore`, the data migration counter
//! - Connection configuration and embedded schema migrations

pub mod error;
pub mod migration_version;
pub mod queue;
pub mod sqlite;

pub use error::StorageError;
pub use migration_version::MigrationVersionStore;
pub use queue::SqliteJobStore;
pub use sqlite::{SqliteConfig, SqliteDatabase};
