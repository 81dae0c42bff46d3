//! In-memory job store with run-time ordered scheduling

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;
use tokio::sync::Mutex;

use crate::backend::{JobStore, StoreError, LEASE_EXPIRED};
use crate::job::{
    later, BackoffStrategy, JobCounts, JobId, JobOptions, JobRecord, JobState,
    DEFAULT_MAX_ATTEMPTS,
};

/// Index entry for eligible jobs - ordered by run_at, then id
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct ReadyEntry {
    run_at: DateTime<Utc>,
    id: JobId,
}

impl ReadyEntry {
    fn of(job: &JobRecord) -> Self {
        Self {
            run_at: job.next_run_at,
            id: job.id,
        }
    }
}

#[derive(Debug, Default)]
struct State {
    last_id: JobId,
    jobs: BTreeMap<JobId, JobRecord>,
    /// Exactly the Pending and Delayed jobs
    ready: BTreeSet<ReadyEntry>,
}

/// The job, if it is `Active` under the given attempt
fn active_mut(
    jobs: &mut BTreeMap<JobId, JobRecord>,
    id: JobId,
    attempt: u32,
) -> Result<&mut JobRecord, StoreError> {
    let job = jobs.get_mut(&id).ok_or(StoreError::NotFound(id))?;
    if job.state != JobState::Active || job.attempts != attempt {
        return Err(StoreError::InvalidTransition {
            id,
            state: job.state,
        });
    }
    Ok(job)
}

/// Job store kept in process memory.
///
/// A single mutex guards every operation, which makes `claim` atomic across
/// all workers sharing the store. Nothing survives a restart.
#[derive(Debug, Default)]
pub struct MemoryJobStore {
    state: Mutex<State>,
}

impl MemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl JobStore for MemoryJobStore {
    async fn create(
        &self,
        kind: &str,
        payload: serde_json::Value,
        options: &JobOptions,
    ) -> Result<JobRecord, StoreError> {
        let now = Utc::now();
        let next_run_at = later(now, options.delay.unwrap_or_default());

        let mut guard = self.state.lock().await;
        let state = &mut *guard;
        state.last_id += 1;

        let job = JobRecord {
            id: state.last_id,
            kind: kind.to_string(),
            payload,
            state: JobState::Pending,
            attempts: 0,
            max_attempts: options.max_attempts.unwrap_or(DEFAULT_MAX_ATTEMPTS).max(1),
            created_at: now,
            next_run_at,
            last_error: None,
            lease_expires_at: None,
            finished_at: None,
        };

        state.ready.insert(ReadyEntry::of(&job));
        state.jobs.insert(job.id, job.clone());

        Ok(job)
    }

    async fn claim(
        &self,
        kinds: &[String],
        lease: Duration,
    ) -> Result<Option<JobRecord>, StoreError> {
        let now = Utc::now();
        let mut guard = self.state.lock().await;
        let state = &mut *guard;

        let entry = state
            .ready
            .iter()
            .take_while(|entry| entry.run_at <= now)
            .find(|entry| {
                state
                    .jobs
                    .get(&entry.id)
                    .is_some_and(|job| kinds.iter().any(|k| *k == job.kind))
            })
            .copied();

        let Some(entry) = entry else {
            return Ok(None);
        };
        state.ready.remove(&entry);

        let job = state
            .jobs
            .get_mut(&entry.id)
            .ok_or(StoreError::NotFound(entry.id))?;
        job.state = JobState::Active;
        job.attempts += 1;
        job.lease_expires_at = Some(later(now, lease));

        Ok(Some(job.clone()))
    }

    async fn complete(&self, id: JobId, attempt: u32) -> Result<JobRecord, StoreError> {
        let mut state = self.state.lock().await;
        let job = active_mut(&mut state.jobs, id, attempt)?;

        job.state = JobState::Completed;
        job.lease_expires_at = None;
        job.finished_at = Some(Utc::now());

        Ok(job.clone())
    }

    async fn fail(
        &self,
        id: JobId,
        attempt: u32,
        error: &str,
        backoff: &BackoffStrategy,
    ) -> Result<JobRecord, StoreError> {
        let now = Utc::now();
        let mut guard = self.state.lock().await;
        let state = &mut *guard;
        let job = active_mut(&mut state.jobs, id, attempt)?;

        job.last_error = Some(error.to_string());
        job.lease_expires_at = None;

        if job.has_attempts_left() {
            let delay = backoff.delay(job.attempts);
            job.state = JobState::Delayed;
            job.next_run_at = later(now, delay);

            tracing::debug!(
                job.id = id,
                attempts = job.attempts,
                delay_ms = delay.as_millis() as u64,
                "Re-queuing job with backoff"
            );
            state.ready.insert(ReadyEntry::of(job));
        } else {
            job.state = JobState::Failed;
            job.finished_at = Some(now);
        }

        Ok(job.clone())
    }

    async fn fail_terminal(
        &self,
        id: JobId,
        attempt: u32,
        error: &str,
    ) -> Result<JobRecord, StoreError> {
        let mut state = self.state.lock().await;
        let job = active_mut(&mut state.jobs, id, attempt)?;

        job.state = JobState::Failed;
        job.last_error = Some(error.to_string());
        job.lease_expires_at = None;
        job.finished_at = Some(Utc::now());

        Ok(job.clone())
    }

    async fn heartbeat(&self, id: JobId, attempt: u32, lease: Duration) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        let job = active_mut(&mut state.jobs, id, attempt)?;
        job.lease_expires_at = Some(later(Utc::now(), lease));
        Ok(())
    }

    async fn get(&self, id: JobId) -> Result<Option<JobRecord>, StoreError> {
        let state = self.state.lock().await;
        Ok(state.jobs.get(&id).cloned())
    }

    async fn recover_expired_leases(&self) -> Result<u64, StoreError> {
        let now = Utc::now();
        let mut guard = self.state.lock().await;
        let state = &mut *guard;
        let mut recovered = 0;

        for job in state.jobs.values_mut() {
            let expired = job.state == JobState::Active
                && job.lease_expires_at.is_none_or(|expires| expires <= now);
            if !expired {
                continue;
            }

            job.last_error = Some(LEASE_EXPIRED.to_string());
            job.lease_expires_at = None;
            if job.has_attempts_left() {
                job.state = JobState::Delayed;
                job.next_run_at = now;
                state.ready.insert(ReadyEntry::of(job));
            } else {
                job.state = JobState::Failed;
                job.finished_at = Some(now);
            }
            recovered += 1;
        }

        Ok(recovered)
    }

    async fn retry(&self, id: JobId) -> Result<JobRecord, StoreError> {
        let now = Utc::now();
        let mut guard = self.state.lock().await;
        let state = &mut *guard;

        let job = state.jobs.get_mut(&id).ok_or(StoreError::NotFound(id))?;
        if job.state != JobState::Failed {
            return Err(StoreError::InvalidTransition {
                id,
                state: job.state,
            });
        }

        job.state = JobState::Pending;
        job.attempts = 0;
        job.next_run_at = now;
        job.finished_at = None;
        state.ready.insert(ReadyEntry::of(job));

        Ok(job.clone())
    }

    async fn prune_completed(&self, before: DateTime<Utc>) -> Result<u64, StoreError> {
        let mut state = self.state.lock().await;
        let count = state.jobs.len();
        state.jobs.retain(|_, job| {
            !(job.state == JobState::Completed && job.finished_at.is_some_and(|at| at < before))
        });
        Ok((count - state.jobs.len()) as u64)
    }

    async fn list(
        &self,
        state: Option<JobState>,
        limit: usize,
    ) -> Result<Vec<JobRecord>, StoreError> {
        let guard = self.state.lock().await;
        Ok(guard
            .jobs
            .values()
            .rev()
            .filter(|job| state.is_none_or(|s| job.state == s))
            .take(limit)
            .cloned()
            .collect())
    }

    async fn counts(&self) -> Result<JobCounts, StoreError> {
        let state = self.state.lock().await;
        let mut counts = JobCounts::default();
        for job in state.jobs.values() {
            counts.add(job.state, 1);
        }
        Ok(counts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const LEASE: Duration = Duration::from_secs(30);

    fn kinds(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test]
    async fn test_create_claim() {
        let store = MemoryJobStore::new();
        let payload = json!({ "foo": "bar" });

        let created = store
            .create("test_job", payload.clone(), &JobOptions::default())
            .await
            .unwrap();
        assert_eq!(created.state, JobState::Pending);
        assert_eq!(created.attempts, 0);
        assert_eq!(created.max_attempts, DEFAULT_MAX_ATTEMPTS);

        let job = store
            .claim(&kinds(&["test_job"]), LEASE)
            .await
            .unwrap()
            .expect("Should have job");
        assert_eq!(job.id, created.id);
        assert_eq!(job.payload, payload);
        assert_eq!(job.state, JobState::Active);
        assert_eq!(job.attempts, 1);
        assert!(job.lease_expires_at.is_some());

        // Nothing left
        let empty = store.claim(&kinds(&["test_job"]), LEASE).await.unwrap();
        assert!(empty.is_none());
    }

    #[tokio::test]
    async fn test_ids_are_monotonic() {
        let store = MemoryJobStore::new();
        let a = store.create("k", json!({}), &JobOptions::default()).await.unwrap();
        let b = store.create("k", json!({}), &JobOptions::default()).await.unwrap();
        assert!(b.id > a.id);
    }

    #[tokio::test]
    async fn test_claim_respects_kind_filter() {
        let store = MemoryJobStore::new();
        store.create("video", json!({}), &JobOptions::default()).await.unwrap();
        let email = store.create("email", json!({}), &JobOptions::default()).await.unwrap();

        let job = store.claim(&kinds(&["email"]), LEASE).await.unwrap().unwrap();
        assert_eq!(job.id, email.id);
        assert!(store.claim(&kinds(&["email"]), LEASE).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_delayed_job() {
        let store = MemoryJobStore::new();

        let id = store
            .create("delayed", json!({}), &JobOptions::delayed(Duration::from_millis(200)))
            .await
            .unwrap()
            .id;

        assert!(store.claim(&kinds(&["delayed"]), LEASE).await.unwrap().is_none());

        tokio::time::sleep(Duration::from_millis(250)).await;

        let job = store
            .claim(&kinds(&["delayed"]), LEASE)
            .await
            .unwrap()
            .expect("Should have delayed job");
        assert_eq!(job.id, id);
    }

    #[tokio::test]
    async fn test_fail_reschedules_then_fails_terminally() {
        let store = MemoryJobStore::new();
        let backoff = BackoffStrategy::Constant { millis: 0 };
        let id = store
            .create("k", json!({}), &JobOptions::default().with_max_attempts(2))
            .await
            .unwrap()
            .id;

        store.claim(&kinds(&["k"]), LEASE).await.unwrap().unwrap();
        let job = store.fail(id, 1, "boom", &backoff).await.unwrap();
        assert_eq!(job.state, JobState::Delayed);
        assert_eq!(job.last_error.as_deref(), Some("boom"));

        store.claim(&kinds(&["k"]), LEASE).await.unwrap().unwrap();
        let job = store.fail(id, 2, "boom again", &backoff).await.unwrap();
        assert_eq!(job.state, JobState::Failed);
        assert_eq!(job.attempts, 2);
        assert!(job.finished_at.is_some());

        assert!(store.claim(&kinds(&["k"]), LEASE).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_terminal_transitions_are_rejected() {
        let store = MemoryJobStore::new();
        let id = store.create("k", json!({}), &JobOptions::default()).await.unwrap().id;

        // Not claimed yet
        assert!(matches!(
            store.complete(id, 0).await,
            Err(StoreError::InvalidTransition { state: JobState::Pending, .. })
        ));

        store.claim(&kinds(&["k"]), LEASE).await.unwrap().unwrap();
        let done = store.complete(id, 1).await.unwrap();

        let again = store.complete(id, 1).await;
        assert!(matches!(
            again,
            Err(StoreError::InvalidTransition { state: JobState::Completed, .. })
        ));
        let failed = store
            .fail(id, 1, "late", &BackoffStrategy::default())
            .await;
        assert!(matches!(failed, Err(StoreError::InvalidTransition { .. })));

        // Record untouched
        assert_eq!(store.get(id).await.unwrap().unwrap(), done);
        assert!(matches!(store.complete(999, 1).await, Err(StoreError::NotFound(999))));
    }

    #[tokio::test]
    async fn test_recover_expired_leases() {
        let store = MemoryJobStore::new();
        let retried = store.create("k", json!({}), &JobOptions::default()).await.unwrap().id;
        let exhausted = store
            .create("k", json!({}), &JobOptions::default().with_max_attempts(1))
            .await
            .unwrap()
            .id;

        store.claim(&kinds(&["k"]), Duration::ZERO).await.unwrap().unwrap();
        store.claim(&kinds(&["k"]), Duration::ZERO).await.unwrap().unwrap();

        assert_eq!(store.recover_expired_leases().await.unwrap(), 2);

        let job = store.get(retried).await.unwrap().unwrap();
        assert_eq!(job.state, JobState::Delayed);
        assert_eq!(job.last_error.as_deref(), Some(LEASE_EXPIRED));

        let job = store.get(exhausted).await.unwrap().unwrap();
        assert_eq!(job.state, JobState::Failed);
        assert_eq!(job.attempts, 1);

        // Live leases are left alone
        let id = store.claim(&kinds(&["k"]), LEASE).await.unwrap().unwrap().id;
        assert_eq!(id, retried);
        assert_eq!(store.recover_expired_leases().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_stale_holder_cannot_finish_redelivered_job() {
        let store = MemoryJobStore::new();
        let id = store.create("k", json!({}), &JobOptions::default()).await.unwrap().id;

        // Worker A's lease runs out and the job goes to worker B
        let a = store.claim(&kinds(&["k"]), Duration::ZERO).await.unwrap().unwrap();
        assert_eq!(store.recover_expired_leases().await.unwrap(), 1);
        let b = store.claim(&kinds(&["k"]), LEASE).await.unwrap().unwrap();
        assert_eq!((a.attempts, b.attempts), (1, 2));

        for stale in [
            store.fail_terminal(id, a.attempts, "late").await,
            store.fail(id, a.attempts, "late", &BackoffStrategy::default()).await,
            store.complete(id, a.attempts).await,
        ] {
            assert!(matches!(
                stale,
                Err(StoreError::InvalidTransition { state: JobState::Active, .. })
            ));
        }
        assert!(store.heartbeat(id, a.attempts, LEASE).await.is_err());

        let done = store.complete(id, b.attempts).await.unwrap();
        assert_eq!(done.state, JobState::Completed);
        assert_eq!(done.attempts, 2);
    }

    #[tokio::test]
    async fn test_retry_and_prune() {
        let store = MemoryJobStore::new();
        let id = store.create("k", json!({}), &JobOptions::default()).await.unwrap().id;

        assert!(matches!(
            store.retry(id).await,
            Err(StoreError::InvalidTransition { .. })
        ));

        store.claim(&kinds(&["k"]), LEASE).await.unwrap().unwrap();
        store.fail_terminal(id, 1, "bad recipient").await.unwrap();

        let job = store.retry(id).await.unwrap();
        assert_eq!(job.state, JobState::Pending);
        assert_eq!(job.attempts, 0);

        store.claim(&kinds(&["k"]), LEASE).await.unwrap().unwrap();
        store.complete(id, 1).await.unwrap();

        let pruned = store
            .prune_completed(Utc::now() + chrono::Duration::seconds(1))
            .await
            .unwrap();
        assert_eq!(pruned, 1);
        assert!(store.get(id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_counts_and_list() {
        let store = MemoryJobStore::new();
        for _ in 0..3 {
            store.create("k", json!({}), &JobOptions::default()).await.unwrap();
        }
        store.claim(&kinds(&["k"]), LEASE).await.unwrap().unwrap();

        let counts = store.counts().await.unwrap();
        assert_eq!(counts.pending, 2);
        assert_eq!(counts.active, 1);
        assert_eq!(counts.total(), 3);

        let pending = store.list(Some(JobState::Pending), 10).await.unwrap();
        assert_eq!(pending.len(), 2);
        assert!(pending[0].id > pending[1].id);
    }
}
