//! # Reel Queue
//!
//! Durable background job queue for the Reel video platform.
//!
//! Features:
//! - Typed job kinds validated at enqueue
//! - Pluggable `JobStore` (memory here, SQLite in `reel-persist`)
//! - Worker pool with per-kind concurrency, timeouts and lease heartbeats
//! - Retry with capped exponential backoff, at-least-once delivery

pub mod admin;
pub mod backend;
pub mod config;
pub mod email;
pub mod error;
pub mod job;
pub mod manager;
pub mod memory;
pub mod registry;
pub mod worker;

pub use admin::{ensure_is_admin, AdminError, AdminOps, Principal};
pub use backend::{JobStore, StoreError};
pub use config::WorkerConfig;
pub use email::{EmailHandler, EmailPayload, LogMailer, MailError, Mailer};
pub use error::{HandlerError, JobFailure, QueueError};
pub use job::{BackoffStrategy, JobCounts, JobId, JobOptions, JobRecord, JobState, KindConfig};
pub use manager::{JobEvent, JobOutcome, JobTicket, QueueManager};
pub use memory::MemoryJobStore;
pub use registry::{HandlerRegistry, JobContext, JobHandler, JobPayload, TypedPayload};
pub use worker::{Dispatcher, WorkerPool, WorkerPoolHandle};
