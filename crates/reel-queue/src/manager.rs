//! Queue manager: the context object shared by producers and the worker pool

use chrono::{DateTime, Utc};
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, PoisonError, RwLock};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, Notify};
use tracing::{debug, info};

use crate::admin::{ensure_is_admin, AdminError, AdminOps, Principal};
use crate::backend::{JobStore, StoreError};
use crate::error::{HandlerError, QueueError};
use crate::job::{JobId, JobOptions, JobRecord, KindConfig};
use crate::registry::{HandlerRegistry, JobContext, JobHandler, JobPayload, TypedPayload};

const EVENT_CAPACITY: usize = 1024;

/// Result of one dispatch attempt
#[derive(Debug, Clone, PartialEq)]
pub enum JobOutcome {
    Completed,
    /// Failed, will run again at `next_run_at`
    Retrying {
        next_run_at: DateTime<Utc>,
        error: String,
    },
    /// Failed for good
    Failed { error: String },
}

impl JobOutcome {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Retrying { .. })
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::Completed => "completed",
            Self::Retrying { .. } => "retrying",
            Self::Failed { .. } => "failed",
        }
    }
}

/// Published after every dispatch attempt
#[derive(Debug, Clone, PartialEq)]
pub struct JobEvent {
    pub id: JobId,
    pub kind: String,
    pub attempt: u32,
    pub outcome: JobOutcome,
}

/// Per-kind settings plus the signal idle workers park on
#[derive(Debug, Default)]
pub(crate) struct KindQueue {
    config: RwLock<KindConfig>,
    pub(crate) notify: Notify,
}

impl KindQueue {
    pub(crate) fn config(&self) -> KindConfig {
        self.config
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

/// Handle to one submitted job; resolves once the job is terminal.
///
/// The subscription is taken before the job is persisted, so no event can
/// be missed. Dropping the ticket cancels it.
pub struct JobTicket {
    id: JobId,
    events: broadcast::Receiver<JobEvent>,
    store: Arc<dyn JobStore>,
}

impl JobTicket {
    pub fn id(&self) -> JobId {
        self.id
    }

    /// Wait for the job to reach `Completed` or `Failed`.
    ///
    /// Fails with [`QueueError::Closed`] if the [`QueueManager`] is dropped
    /// while the job is still pending or running.
    pub async fn wait(mut self) -> Result<JobRecord, QueueError> {
        loop {
            match self.events.recv().await {
                Ok(event) if event.id == self.id && event.outcome.is_terminal() => break,
                Ok(_) => continue,
                Err(RecvError::Lagged(skipped)) => {
                    debug!(job.id = self.id, skipped, "Job ticket lagged, checking store");
                    if let Some(job) = self.terminal_record().await? {
                        return Ok(job);
                    }
                }
                Err(RecvError::Closed) => {
                    return self
                        .terminal_record()
                        .await?
                        .ok_or(QueueError::Closed(self.id));
                }
            }
        }

        self.store
            .get(self.id)
            .await?
            .ok_or(QueueError::Store(StoreError::NotFound(self.id)))
    }

    async fn terminal_record(&self) -> Result<Option<JobRecord>, StoreError> {
        Ok(self
            .store
            .get(self.id)
            .await?
            .filter(|job| job.state.is_terminal()))
    }
}

impl std::fmt::Debug for JobTicket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobTicket").field("id", &self.id).finish()
    }
}

/// Owns the store, the handler registry and per-kind queue settings.
///
/// Construct one at process start and share it by `Arc` with producers and
/// the [`WorkerPool`](crate::worker::WorkerPool).
pub struct QueueManager {
    store: Arc<dyn JobStore>,
    registry: HandlerRegistry,
    queues: RwLock<HashMap<String, Arc<KindQueue>>>,
    events: broadcast::Sender<JobEvent>,
}

impl QueueManager {
    pub fn new(store: Arc<dyn JobStore>) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            store,
            registry: HandlerRegistry::new(),
            queues: RwLock::new(HashMap::new()),
            events,
        }
    }

    pub fn store(&self) -> &Arc<dyn JobStore> {
        &self.store
    }

    pub fn registry(&self) -> &HandlerRegistry {
        &self.registry
    }

    /// Register the handler for a kind. Must happen before the pool starts.
    pub fn register<H: JobHandler>(&self, kind: impl Into<String>, handler: H) {
        let kind = kind.into();
        self.queue(&kind);
        self.registry.register(kind, handler);
    }

    /// Register a closure as the handler for a kind
    pub fn register_fn<P, F, Fut>(&self, kind: impl Into<String>, f: F)
    where
        P: JobPayload,
        F: Fn(P, JobContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
    {
        let kind = kind.into();
        self.queue(&kind);
        self.registry.register_fn(kind, f);
    }

    /// Set concurrency, retry ceiling, backoff and timeout for a kind
    pub fn configure(&self, kind: &str, config: KindConfig) {
        let queue = self.queue(kind);
        *queue.config.write().unwrap_or_else(PoisonError::into_inner) = config;
    }

    pub fn kind_config(&self, kind: &str) -> KindConfig {
        self.queue(kind).config()
    }

    pub(crate) fn queue(&self, kind: &str) -> Arc<KindQueue> {
        if let Some(queue) = self
            .queues
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(kind)
        {
            return queue.clone();
        }

        self.queues
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(kind.to_string())
            .or_default()
            .clone()
    }

    /// Wake every parked slot of every kind
    pub(crate) fn wake_all(&self) {
        for queue in self
            .queues
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
        {
            queue.notify.notify_waiters();
        }
    }

    /// Validate, persist and signal an idle worker. Returns the new job's id.
    pub async fn enqueue(
        &self,
        kind: &str,
        payload: Value,
        options: JobOptions,
    ) -> Result<JobId, QueueError> {
        Ok(self.create(kind, payload, options).await?.id)
    }

    /// Enqueue a typed payload under its own kind
    pub async fn enqueue_payload<P: TypedPayload>(
        &self,
        payload: &P,
        options: JobOptions,
    ) -> Result<JobId, QueueError> {
        let value = serde_json::to_value(payload).map_err(StoreError::from)?;
        self.enqueue(P::KIND, value, options).await
    }

    /// Enqueue and get a ticket that resolves when the job is terminal
    pub async fn enqueue_tracked(
        &self,
        kind: &str,
        payload: Value,
        options: JobOptions,
    ) -> Result<JobTicket, QueueError> {
        let events = self.events.subscribe();
        let job = self.create(kind, payload, options).await?;
        Ok(JobTicket {
            id: job.id,
            events,
            store: self.store.clone(),
        })
    }

    async fn create(
        &self,
        kind: &str,
        payload: Value,
        mut options: JobOptions,
    ) -> Result<JobRecord, QueueError> {
        self.registry.validate(kind, &payload)?;

        let queue = self.queue(kind);
        if options.max_attempts.is_none() {
            options.max_attempts = Some(queue.config().max_attempts);
        }

        let job = self.store.create(kind, payload, &options).await?;
        info!(
            job.id = job.id,
            job.kind = %job.kind,
            next_run_at = %job.next_run_at,
            "Enqueued job"
        );

        queue.notify.notify_one();
        Ok(job)
    }

    /// Subscribe to dispatch outcomes; dropping the receiver unsubscribes
    pub fn subscribe(&self) -> broadcast::Receiver<JobEvent> {
        self.events.subscribe()
    }

    pub(crate) fn publish(&self, event: JobEvent) {
        // No subscribers is fine
        let _ = self.events.send(event);
    }

    pub async fn get(&self, id: JobId) -> Result<Option<JobRecord>, QueueError> {
        Ok(self.store.get(id).await?)
    }

    /// Privileged operations, available only to admins
    pub fn admin<P: Principal + ?Sized>(&self, principal: &P) -> Result<AdminOps<'_>, AdminError> {
        ensure_is_admin(principal)?;
        Ok(AdminOps::new(self))
    }
}

impl std::fmt::Debug for QueueManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueueManager")
            .field("registry", &self.registry)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryJobStore;
    use serde::{Deserialize, Serialize};
    use serde_json::json;

    #[derive(Debug, Serialize, Deserialize)]
    struct Ping {
        n: u32,
    }

    impl JobPayload for Ping {}

    impl TypedPayload for Ping {
        const KIND: &'static str = "ping";
    }

    fn manager() -> QueueManager {
        QueueManager::new(Arc::new(MemoryJobStore::new()))
    }

    #[tokio::test]
    async fn test_unregistered_kind_is_rejected_without_persisting() {
        let manager = manager();

        let err = manager
            .enqueue("unknown-kind", json!({}), JobOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, QueueError::Validation(_)));
        assert_eq!(manager.store().counts().await.unwrap().total(), 0);
    }

    #[tokio::test]
    async fn test_bad_payload_is_rejected() {
        let manager = manager();
        manager.register_fn("ping", |_: Ping, _ctx| async { Ok::<(), HandlerError>(()) });

        let err = manager
            .enqueue("ping", json!({"n": "not a number"}), JobOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, QueueError::Validation(_)));
        assert_eq!(manager.store().counts().await.unwrap().total(), 0);
    }

    #[tokio::test]
    async fn test_kind_config_sets_attempt_ceiling() {
        let manager = manager();
        manager.register_fn("ping", |_: Ping, _ctx| async { Ok::<(), HandlerError>(()) });
        manager.configure("ping", KindConfig::default().with_max_attempts(3));

        let id = manager
            .enqueue_payload(&Ping { n: 1 }, JobOptions::default())
            .await
            .unwrap();
        let job = manager.get(id).await.unwrap().unwrap();
        assert_eq!(job.kind, "ping");
        assert_eq!(job.max_attempts, 3);

        // Per-job override wins
        let id = manager
            .enqueue_payload(&Ping { n: 2 }, JobOptions::default().with_max_attempts(9))
            .await
            .unwrap();
        assert_eq!(manager.get(id).await.unwrap().unwrap().max_attempts, 9);
    }

    #[tokio::test]
    async fn test_enqueue_signals_idle_worker() {
        let manager = manager();
        manager.register_fn("ping", |_: Ping, _ctx| async { Ok::<(), HandlerError>(()) });
        let queue = manager.queue("ping");

        manager
            .enqueue_payload(&Ping { n: 1 }, JobOptions::default())
            .await
            .unwrap();

        // notify_one stores a permit when nobody is parked yet
        tokio::time::timeout(std::time::Duration::from_millis(100), queue.notify.notified())
            .await
            .expect("worker should have been signalled");
    }

    #[tokio::test]
    async fn test_ticket_fails_when_manager_is_dropped() {
        let manager = manager();
        manager.register_fn("ping", |_: Ping, _ctx| async { Ok::<(), HandlerError>(()) });

        let ticket = manager
            .enqueue_tracked("ping", json!({"n": 1}), JobOptions::default())
            .await
            .unwrap();
        let id = ticket.id();
        drop(manager);

        let err = ticket.wait().await.unwrap_err();
        assert!(matches!(err, QueueError::Closed(closed) if closed == id));
    }

    #[tokio::test]
    async fn test_subscribers_receive_events() {
        let manager = manager();
        let mut events = manager.subscribe();

        let event = JobEvent {
            id: 1,
            kind: "ping".into(),
            attempt: 1,
            outcome: JobOutcome::Completed,
        };
        manager.publish(event.clone());

        assert_eq!(events.recv().await.unwrap(), event);
    }
}
