//! Worker pool: claims jobs, runs handlers and routes outcomes back to the store

use futures::future::join_all;
use std::any::Any;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval, interval_at, sleep, Instant, MissedTickBehavior};
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::backend::StoreError;
use crate::config::WorkerConfig;
use crate::error::JobFailure;
use crate::job::{earlier, JobRecord, JobState, KindConfig};
use crate::manager::{JobEvent, JobOutcome, KindQueue, QueueManager};
use crate::registry::{JobContext, RegisteredHandler};

const MIN_PERIOD: Duration = Duration::from_millis(1);

/// One claim-execute-route cycle, shared by every slot of the pool
#[derive(Debug, Clone)]
pub struct Dispatcher {
    manager: Arc<QueueManager>,
    config: WorkerConfig,
}

impl Dispatcher {
    pub fn new(manager: Arc<QueueManager>, config: WorkerConfig) -> Self {
        Self { manager, config }
    }

    pub fn config(&self) -> &WorkerConfig {
        &self.config
    }

    /// Claim one eligible job of the given kinds, run it and record the outcome.
    ///
    /// Returns `Ok(None)` when nothing is eligible. Handler failures never
    /// surface here; only a failed claim does. If the outcome cannot be
    /// written back, the job is returned still `Active` and its lease is left
    /// to expire.
    pub async fn run_next(&self, kinds: &[String]) -> Result<Option<JobRecord>, StoreError> {
        let Some(job) = self.manager.store().claim(kinds, self.config.lease).await? else {
            return Ok(None);
        };
        debug!(job.id = job.id, job.kind = %job.kind, attempt = job.attempts, "Claimed job");

        let config = self.manager.kind_config(&job.kind);
        let result = match self.manager.registry().resolve(&job.kind) {
            Some(handler) => self.invoke(&job, handler, &config).await,
            None => Err(JobFailure::UnhandledKind(job.kind.clone())),
        };

        Ok(Some(self.route(job, result, &config).await))
    }

    /// Run the handler in its own task, renewing the lease while it runs
    async fn invoke(
        &self,
        job: &JobRecord,
        handler: RegisteredHandler,
        config: &KindConfig,
    ) -> Result<(), JobFailure> {
        let ctx = JobContext {
            id: job.id,
            kind: job.kind.clone(),
            attempt: job.attempts,
            max_attempts: job.max_attempts,
        };
        let mut task = tokio::spawn(handler.invoke(job.payload.clone(), ctx));

        let period = self.config.heartbeat_interval.max(MIN_PERIOD);
        let mut heartbeat = interval_at(Instant::now() + period, period);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let timeout = config.timeout;
        let deadline = sleep(timeout.unwrap_or_default());
        tokio::pin!(deadline);

        loop {
            tokio::select! {
                joined = &mut task => {
                    return match joined {
                        Ok(result) => result.map_err(JobFailure::from),
                        Err(e) if e.is_panic() => Err(JobFailure::Panicked(panic_message(e.into_panic()))),
                        Err(e) => Err(JobFailure::Transient(e.to_string())),
                    };
                }
                _ = heartbeat.tick() => {
                    if let Err(e) = self.manager.store().heartbeat(job.id, job.attempts, self.config.lease).await {
                        warn!(job.id = job.id, error = %e, "Failed to renew job lease");
                    }
                }
                _ = &mut deadline, if timeout.is_some() => {
                    // Best effort: a handler blocked outside an await point keeps running
                    task.abort();
                    return Err(JobFailure::TimedOut(timeout.unwrap_or_default()));
                }
            }
        }
    }

    async fn route(
        &self,
        job: JobRecord,
        result: Result<(), JobFailure>,
        config: &KindConfig,
    ) -> JobRecord {
        let store = self.manager.store();
        let written = match &result {
            Ok(()) => store.complete(job.id, job.attempts).await,
            Err(failure) if failure.is_retryable() => {
                store
                    .fail(job.id, job.attempts, &failure.to_string(), &config.backoff)
                    .await
            }
            Err(failure) => {
                store
                    .fail_terminal(job.id, job.attempts, &failure.to_string())
                    .await
            }
        };

        let record = match written {
            Ok(record) => record,
            Err(e) => {
                error!(
                    job.id = job.id,
                    job.kind = %job.kind,
                    attempt = job.attempts,
                    error = %e,
                    "Failed to record job outcome, leaving lease to expire"
                );
                return job;
            }
        };

        let error = record.last_error.clone().unwrap_or_default();
        let outcome = match record.state {
            JobState::Completed => JobOutcome::Completed,
            JobState::Delayed => JobOutcome::Retrying {
                next_run_at: record.next_run_at,
                error,
            },
            _ => JobOutcome::Failed { error },
        };

        match &outcome {
            JobOutcome::Completed => info!(
                job.id = record.id,
                job.kind = %record.kind,
                attempt = record.attempts,
                outcome = outcome.label(),
                "Job finished"
            ),
            JobOutcome::Retrying { next_run_at, error } => warn!(
                job.id = record.id,
                job.kind = %record.kind,
                attempt = record.attempts,
                outcome = outcome.label(),
                next_run_at = %next_run_at,
                error = %error,
                "Job finished"
            ),
            JobOutcome::Failed { error } => error!(
                job.id = record.id,
                job.kind = %record.kind,
                attempt = record.attempts,
                outcome = outcome.label(),
                error = %error,
                "Job finished"
            ),
        }

        self.manager.publish(JobEvent {
            id: record.id,
            kind: record.kind.clone(),
            attempt: record.attempts,
            outcome,
        });
        record
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        msg.to_string()
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

/// Runs `concurrency` slots per registered kind plus lease and retention
/// housekeeping.
pub struct WorkerPool {
    manager: Arc<QueueManager>,
    config: WorkerConfig,
}

impl WorkerPool {
    pub fn new(manager: Arc<QueueManager>, config: WorkerConfig) -> Self {
        Self { manager, config }
    }

    pub fn dispatcher(&self) -> Dispatcher {
        Dispatcher::new(self.manager.clone(), self.config.clone())
    }

    /// Spawn all slots and housekeeping tasks on the current runtime.
    ///
    /// Kinds and their concurrency are read once here; handlers registered
    /// later are not served by this pool.
    pub fn start(&self) -> WorkerPoolHandle {
        let (shutdown, stop) = watch::channel(false);
        let dispatcher = Arc::new(self.dispatcher());
        let mut tasks = Vec::new();

        let kinds = self.manager.registry().kinds();
        for kind in &kinds {
            let queue = self.manager.queue(kind);
            for slot in 0..queue.config().concurrency {
                let span = info_span!("worker", worker.name = %format!("{kind}-{slot}"));
                tasks.push(tokio::spawn(
                    run_slot(dispatcher.clone(), kind.clone(), queue.clone(), stop.clone())
                        .instrument(span),
                ));
            }
        }
        let slots = tasks.len();

        tasks.push(tokio::spawn(
            run_housekeeping(self.manager.clone(), self.config.clone(), stop)
                .instrument(info_span!("worker", worker.name = "housekeeping")),
        ));

        info!(kinds = ?kinds, slots, "Worker pool started");
        WorkerPoolHandle { shutdown, tasks }
    }
}

impl std::fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPool")
            .field("config", &self.config)
            .finish()
    }
}

/// Controls a started pool. Dropping it also stops the pool, without waiting.
#[derive(Debug)]
pub struct WorkerPoolHandle {
    shutdown: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

impl WorkerPoolHandle {
    /// Stop claiming, let in-flight handlers finish, then join every task
    pub async fn shutdown(self) {
        info!("Shutting down worker pool");
        // Err only means every task already exited
        let _ = self.shutdown.send(true);

        for joined in join_all(self.tasks).await {
            if let Err(e) = joined {
                error!(error = %e, "Worker task ended abnormally");
            }
        }
        info!("Worker pool stopped");
    }
}

async fn run_slot(
    dispatcher: Arc<Dispatcher>,
    kind: String,
    queue: Arc<KindQueue>,
    mut stop: watch::Receiver<bool>,
) {
    let config = dispatcher.config().clone();
    let kinds = [kind];
    let mut store_backoff = config.poll_interval.max(MIN_PERIOD);
    debug!("Worker slot started");

    while !*stop.borrow() {
        match dispatcher.run_next(&kinds).await {
            Ok(Some(_)) => {
                store_backoff = config.poll_interval.max(MIN_PERIOD);
            }
            Ok(None) => {
                store_backoff = config.poll_interval.max(MIN_PERIOD);
                let wait = config.poll_interval + config.jitter.mul_f64(rand::random::<f64>());
                tokio::select! {
                    _ = queue.notify.notified() => {}
                    _ = sleep(wait) => {}
                    _ = stop.changed() => break,
                }
            }
            Err(e) => {
                error!(
                    error = %e,
                    retry_in_ms = store_backoff.as_millis() as u64,
                    "Failed to claim job, pausing"
                );
                tokio::select! {
                    _ = sleep(store_backoff) => {}
                    _ = stop.changed() => break,
                }
                store_backoff = (store_backoff * 2).min(config.max_store_backoff.max(MIN_PERIOD));
            }
        }
    }

    debug!("Worker slot stopped");
}

/// Lease sweep (immediately, then every `sweep_interval`) and retention pruning
async fn run_housekeeping(
    manager: Arc<QueueManager>,
    config: WorkerConfig,
    mut stop: watch::Receiver<bool>,
) {
    let mut ticker = interval(config.sweep_interval.max(MIN_PERIOD));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = stop.changed() => break,
        }

        match manager.store().recover_expired_leases().await {
            Ok(0) => {}
            Ok(recovered) => {
                info!(recovered, "Recovered jobs with expired leases");
                manager.wake_all();
            }
            Err(e) => error!(error = %e, "Lease sweep failed"),
        }

        if let Some(retention) = config.retention {
            let before = earlier(chrono::Utc::now(), retention);
            match manager.store().prune_completed(before).await {
                Ok(0) => {}
                Ok(pruned) => info!(pruned, "Pruned completed jobs"),
                Err(e) => error!(error = %e, "Retention pruning failed"),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::HandlerError;
    use crate::job::JobOptions;
    use crate::memory::MemoryJobStore;
    use serde_json::{json, Value};

    fn dispatcher() -> (Arc<QueueManager>, Dispatcher) {
        let manager = Arc::new(QueueManager::new(Arc::new(MemoryJobStore::new())));
        let dispatcher = Dispatcher::new(manager.clone(), WorkerConfig::default());
        (manager, dispatcher)
    }

    #[test]
    fn test_panic_message() {
        assert_eq!(panic_message(Box::new("boom")), "boom");
        assert_eq!(panic_message(Box::new(String::from("bang"))), "bang");
        assert_eq!(panic_message(Box::new(7_u8)), "unknown panic payload");
    }

    #[tokio::test]
    async fn test_run_next_idle() {
        let (_, dispatcher) = dispatcher();
        assert!(dispatcher.run_next(&["k".to_string()]).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_run_next_completes_and_publishes() {
        let (manager, dispatcher) = dispatcher();
        manager.register_fn("k", |_: Value, _ctx| async { Ok::<(), HandlerError>(()) });
        let mut events = manager.subscribe();
        let id = manager.enqueue("k", json!({}), JobOptions::default()).await.unwrap();

        let job = dispatcher.run_next(&["k".to_string()]).await.unwrap().unwrap();
        assert_eq!(job.id, id);
        assert_eq!(job.state, JobState::Completed);
        assert!(job.lease_expires_at.is_none());

        let event = events.recv().await.unwrap();
        assert_eq!(event.id, id);
        assert_eq!(event.attempt, 1);
        assert_eq!(event.outcome, JobOutcome::Completed);
    }

    #[tokio::test]
    async fn test_terminal_error_skips_remaining_attempts() {
        let (manager, dispatcher) = dispatcher();
        manager.register_fn("k", |_: Value, _ctx| async {
            Err::<(), _>(HandlerError::terminal("invalid recipient"))
        });
        manager.enqueue("k", json!({}), JobOptions::default()).await.unwrap();

        let job = dispatcher.run_next(&["k".to_string()]).await.unwrap().unwrap();
        assert_eq!(job.state, JobState::Failed);
        assert_eq!(job.attempts, 1);
        assert_eq!(job.last_error.as_deref(), Some("Terminal: invalid recipient"));
    }
}
