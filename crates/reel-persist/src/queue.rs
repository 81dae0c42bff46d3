//! Durable job store on SQLite
//!
//! Timestamps are stored as integer unix milliseconds so that eligibility
//! checks compare numbers, not strings.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reel_queue::backend::LEASE_EXPIRED;
use reel_queue::job::{
    BackoffStrategy, JobCounts, JobId, JobOptions, JobRecord, JobState, DEFAULT_MAX_ATTEMPTS,
};
use reel_queue::{JobStore, StoreError};
use serde_json::Value;
use sqlx::{FromRow, QueryBuilder, Sqlite, SqlitePool};
use std::time::Duration;

use crate::error::store_error;

const COLUMNS: &str = "id, kind, payload, state, attempts, max_attempts, created_at, \
                       next_run_at, last_error, lease_expires_at, finished_at";

#[derive(Debug, FromRow)]
struct JobRow {
    id: i64,
    kind: String,
    payload: String,
    state: String,
    attempts: i64,
    max_attempts: i64,
    created_at: i64,
    next_run_at: i64,
    last_error: Option<String>,
    lease_expires_at: Option<i64>,
    finished_at: Option<i64>,
}

fn millis(at: DateTime<Utc>) -> i64 {
    at.timestamp_millis()
}

fn timestamp(ms: i64) -> Result<DateTime<Utc>, StoreError> {
    DateTime::from_timestamp_millis(ms)
        .ok_or_else(|| StoreError::Backend(format!("timestamp out of range: {ms}")))
}

fn after(now: DateTime<Utc>, delay: Duration) -> i64 {
    millis(now)
        .saturating_add(i64::try_from(delay.as_millis()).unwrap_or(i64::MAX))
        .min(millis(DateTime::<Utc>::MAX_UTC))
}

impl TryFrom<JobRow> for JobRecord {
    type Error = StoreError;

    fn try_from(row: JobRow) -> Result<Self, Self::Error> {
        let state = row
            .state
            .parse::<JobState>()
            .map_err(|e| StoreError::Backend(e.to_string()))?;

        Ok(JobRecord {
            id: row.id,
            kind: row.kind,
            payload: serde_json::from_str(&row.payload)?,
            state,
            attempts: u32::try_from(row.attempts).unwrap_or(0),
            max_attempts: u32::try_from(row.max_attempts).unwrap_or(DEFAULT_MAX_ATTEMPTS),
            created_at: timestamp(row.created_at)?,
            next_run_at: timestamp(row.next_run_at)?,
            last_error: row.last_error,
            lease_expires_at: row.lease_expires_at.map(timestamp).transpose()?,
            finished_at: row.finished_at.map(timestamp).transpose()?,
        })
    }
}

fn record(row: Option<JobRow>) -> Result<Option<JobRecord>, StoreError> {
    row.map(JobRecord::try_from).transpose()
}

/// `JobStore` backed by a SQLite pool.
///
/// Claims are a single `UPDATE ... WHERE id = (SELECT ...) RETURNING`
/// statement, so they stay exclusive across connections and processes
/// sharing the database file.
#[derive(Debug, Clone)]
pub struct SqliteJobStore {
    pool: SqlitePool,
}

impl SqliteJobStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Error for a guarded update (`state = 'active' AND attempts = ?`)
    /// that matched no row
    async fn rejected(&self, id: JobId) -> StoreError {
        match self.get(id).await {
            Ok(Some(job)) => StoreError::InvalidTransition {
                id,
                state: job.state,
            },
            Ok(None) => StoreError::NotFound(id),
            Err(e) => e,
        }
    }

    async fn finish_active(
        &self,
        id: JobId,
        attempt: u32,
        state: JobState,
        error: Option<&str>,
    ) -> Result<JobRecord, StoreError> {
        let row = sqlx::query_as::<_, JobRow>(&format!(
            "UPDATE jobs SET state = ?, last_error = COALESCE(?, last_error), \
             lease_expires_at = NULL, finished_at = ? \
             WHERE id = ? AND state = 'active' AND attempts = ? RETURNING {COLUMNS}"
        ))
        .bind(state.as_str())
        .bind(error)
        .bind(millis(Utc::now()))
        .bind(id)
        .bind(i64::from(attempt))
        .fetch_optional(&self.pool)
        .await
        .map_err(store_error)?;

        match record(row)? {
            Some(job) => Ok(job),
            None => Err(self.rejected(id).await),
        }
    }
}

#[async_trait]
impl JobStore for SqliteJobStore {
    async fn create(
        &self,
        kind: &str,
        payload: Value,
        options: &JobOptions,
    ) -> Result<JobRecord, StoreError> {
        let now = Utc::now();
        let max_attempts = options.max_attempts.unwrap_or(DEFAULT_MAX_ATTEMPTS).max(1);

        let row = sqlx::query_as::<_, JobRow>(&format!(
            "INSERT INTO jobs (kind, payload, state, attempts, max_attempts, created_at, next_run_at) \
             VALUES (?, ?, 'pending', 0, ?, ?, ?) RETURNING {COLUMNS}"
        ))
        .bind(kind)
        .bind(serde_json::to_string(&payload)?)
        .bind(i64::from(max_attempts))
        .bind(millis(now))
        .bind(after(now, options.delay.unwrap_or_default()))
        .fetch_one(&self.pool)
        .await
        .map_err(store_error)?;

        row.try_into()
    }

    async fn claim(
        &self,
        kinds: &[String],
        lease: Duration,
    ) -> Result<Option<JobRecord>, StoreError> {
        if kinds.is_empty() {
            return Ok(None);
        }
        let now = Utc::now();

        let mut query = QueryBuilder::<Sqlite>::new(
            "UPDATE jobs SET state = 'active', attempts = attempts + 1, lease_expires_at = ",
        );
        query.push_bind(after(now, lease));
        query.push(
            " WHERE id = (SELECT id FROM jobs WHERE state IN ('pending', 'delayed') AND next_run_at <= ",
        );
        query.push_bind(millis(now));
        query.push(" AND kind IN (");
        let mut separated = query.separated(", ");
        for kind in kinds {
            separated.push_bind(kind.clone());
        }
        separated.push_unseparated(") ORDER BY next_run_at ASC, id ASC LIMIT 1) RETURNING ");
        query.push(COLUMNS);

        let row = query
            .build_query_as::<JobRow>()
            .fetch_optional(&self.pool)
            .await
            .map_err(store_error)?;
        record(row)
    }

    async fn complete(&self, id: JobId, attempt: u32) -> Result<JobRecord, StoreError> {
        self.finish_active(id, attempt, JobState::Completed, None).await
    }

    async fn fail(
        &self,
        id: JobId,
        attempt: u32,
        error: &str,
        backoff: &BackoffStrategy,
    ) -> Result<JobRecord, StoreError> {
        let job = match self.get(id).await? {
            Some(job) if job.state == JobState::Active && job.attempts == attempt => job,
            Some(job) => {
                return Err(StoreError::InvalidTransition {
                    id,
                    state: job.state,
                })
            }
            None => return Err(StoreError::NotFound(id)),
        };

        if !job.has_attempts_left() {
            return self
                .finish_active(id, attempt, JobState::Failed, Some(error))
                .await;
        }

        let next_run_at = after(Utc::now(), backoff.delay(attempt));
        let row = sqlx::query_as::<_, JobRow>(&format!(
            "UPDATE jobs SET state = 'delayed', next_run_at = ?, last_error = ?, lease_expires_at = NULL \
             WHERE id = ? AND state = 'active' AND attempts = ? RETURNING {COLUMNS}"
        ))
        .bind(next_run_at)
        .bind(error)
        .bind(id)
        .bind(i64::from(attempt))
        .fetch_optional(&self.pool)
        .await
        .map_err(store_error)?;

        match record(row)? {
            Some(job) => {
                tracing::debug!(
                    job.id = id,
                    attempts = job.attempts,
                    next_run_at = %job.next_run_at,
                    "Re-queuing job with backoff"
                );
                Ok(job)
            }
            None => Err(self.rejected(id).await),
        }
    }

    async fn fail_terminal(
        &self,
        id: JobId,
        attempt: u32,
        error: &str,
    ) -> Result<JobRecord, StoreError> {
        self.finish_active(id, attempt, JobState::Failed, Some(error))
            .await
    }

    async fn heartbeat(&self, id: JobId, attempt: u32, lease: Duration) -> Result<(), StoreError> {
        let result = sqlx::query(
            "UPDATE jobs SET lease_expires_at = ? WHERE id = ? AND state = 'active' AND attempts = ?",
        )
        .bind(after(Utc::now(), lease))
        .bind(id)
        .bind(i64::from(attempt))
        .execute(&self.pool)
        .await
        .map_err(store_error)?;

        if result.rows_affected() == 0 {
            return Err(self.rejected(id).await);
        }
        Ok(())
    }

    async fn get(&self, id: JobId) -> Result<Option<JobRecord>, StoreError> {
        let row = sqlx::query_as::<_, JobRow>(&format!("SELECT {COLUMNS} FROM jobs WHERE id = ?"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(store_error)?;
        record(row)
    }

    async fn recover_expired_leases(&self) -> Result<u64, StoreError> {
        let now = millis(Utc::now());
        let result = sqlx::query(
            r#"
            UPDATE jobs
            SET state = CASE WHEN attempts < max_attempts THEN 'delayed' ELSE 'failed' END,
                next_run_at = CASE WHEN attempts < max_attempts THEN ? ELSE next_run_at END,
                finished_at = CASE WHEN attempts < max_attempts THEN NULL ELSE ? END,
                last_error = ?,
                lease_expires_at = NULL
            WHERE state = 'active' AND (lease_expires_at IS NULL OR lease_expires_at <= ?)
            "#,
        )
        .bind(now)
        .bind(now)
        .bind(LEASE_EXPIRED)
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(store_error)?;

        Ok(result.rows_affected())
    }

    async fn retry(&self, id: JobId) -> Result<JobRecord, StoreError> {
        let row = sqlx::query_as::<_, JobRow>(&format!(
            "UPDATE jobs SET state = 'pending', attempts = 0, next_run_at = ?, finished_at = NULL \
             WHERE id = ? AND state = 'failed' RETURNING {COLUMNS}"
        ))
        .bind(millis(Utc::now()))
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(store_error)?;

        match record(row)? {
            Some(job) => Ok(job),
            None => Err(self.rejected(id).await),
        }
    }

    async fn prune_completed(&self, before: DateTime<Utc>) -> Result<u64, StoreError> {
        let result = sqlx::query("DELETE FROM jobs WHERE state = 'completed' AND finished_at < ?")
            .bind(millis(before))
            .execute(&self.pool)
            .await
            .map_err(store_error)?;
        Ok(result.rows_affected())
    }

    async fn list(
        &self,
        state: Option<JobState>,
        limit: usize,
    ) -> Result<Vec<JobRecord>, StoreError> {
        let state = state.map(|s| s.as_str());
        let rows = sqlx::query_as::<_, JobRow>(&format!(
            "SELECT {COLUMNS} FROM jobs WHERE (? IS NULL OR state = ?) ORDER BY id DESC LIMIT ?"
        ))
        .bind(state)
        .bind(state)
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await
        .map_err(store_error)?;

        rows.into_iter().map(JobRecord::try_from).collect()
    }

    async fn counts(&self) -> Result<JobCounts, StoreError> {
        let rows: Vec<(String, i64)> =
            sqlx::query_as("SELECT state, COUNT(*) FROM jobs GROUP BY state")
                .fetch_all(&self.pool)
                .await
                .map_err(store_error)?;

        let mut counts = JobCounts::default();
        for (state, n) in rows {
            let state = state
                .parse::<JobState>()
                .map_err(|e| StoreError::Backend(e.to_string()))?;
            counts.add(state, u64::try_from(n).unwrap_or(0));
        }
        Ok(counts)
    }
}
