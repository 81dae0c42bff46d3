//! Job Store Trait

use crate::job::{BackoffStrategy, JobCounts, JobId, JobOptions, JobRecord, JobState};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Job not found: {0}")]
    NotFound(JobId),
    #[error("Job {id} is {state}, transition not allowed")]
    InvalidTransition { id: JobId, state: JobState },
    /// The store could not be reached; whether the operation took effect is unknown
    #[error("Store unavailable: {0}")]
    Unavailable(String),
    #[error("Backend error: {0}")]
    Backend(String),
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl StoreError {
    pub fn is_unavailable(&self) -> bool {
        matches!(self, Self::Unavailable(_))
    }
}

/// Durable persistence of job records.
///
/// Every mutation of a record's state or attempt count goes through these
/// operations; `claim` must hand a given record to at most one caller.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Persist a new `Pending` job. Payload validation happens before this call.
    async fn create(
        &self,
        kind: &str,
        payload: serde_json::Value,
        options: &JobOptions,
    ) -> Result<JobRecord, StoreError>;

    /// Atomically take the eligible job with the earliest `next_run_at`
    /// (ties by ascending id) whose kind is in `kinds`, moving it to
    /// `Active` and incrementing its attempts.
    async fn claim(&self, kinds: &[String], lease: Duration)
        -> Result<Option<JobRecord>, StoreError>;

    /// `Active -> Completed`.
    ///
    /// `attempt` is the attempt number returned by `claim`; the write only
    /// applies while the job is still held by that attempt. Once the lease
    /// sweep has handed the job to another worker, the stale holder gets
    /// `InvalidTransition`. The same holds for `fail`, `fail_terminal` and
    /// `heartbeat`.
    async fn complete(&self, id: JobId, attempt: u32) -> Result<JobRecord, StoreError>;

    /// `Active -> Delayed` with backoff while attempts remain, else `Active -> Failed`
    async fn fail(
        &self,
        id: JobId,
        attempt: u32,
        error: &str,
        backoff: &BackoffStrategy,
    ) -> Result<JobRecord, StoreError>;

    /// `Active -> Failed` regardless of remaining attempts
    async fn fail_terminal(
        &self,
        id: JobId,
        attempt: u32,
        error: &str,
    ) -> Result<JobRecord, StoreError>;

    /// Extend the lease of an `Active` job
    async fn heartbeat(&self, id: JobId, attempt: u32, lease: Duration) -> Result<(), StoreError>;

    async fn get(&self, id: JobId) -> Result<Option<JobRecord>, StoreError>;

    /// Return `Active` jobs whose lease expired to the eligible set.
    /// Jobs with no attempts left are failed instead.
    async fn recover_expired_leases(&self) -> Result<u64, StoreError>;

    /// `Failed -> Pending` with a fresh attempt budget
    async fn retry(&self, id: JobId) -> Result<JobRecord, StoreError>;

    /// Delete `Completed` jobs that finished before `before`
    async fn prune_completed(&self, before: DateTime<Utc>) -> Result<u64, StoreError>;

    /// Most recent jobs first, optionally filtered by state
    async fn list(&self, state: Option<JobState>, limit: usize)
        -> Result<Vec<JobRecord>, StoreError>;

    async fn counts(&self) -> Result<JobCounts, StoreError>;
}

/// Error message recorded on jobs recovered by the lease sweep
pub const LEASE_EXPIRED: &str = "lease expired";
