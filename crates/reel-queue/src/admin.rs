//! Admin guard for privileged queue operations
//!
//! Authentication happens upstream; this module only checks that an
//! already-resolved principal is an administrator.

use chrono::Utc;
use std::time::Duration;
use tracing::info;

use crate::error::QueueError;
use crate::job::{earlier, JobId, JobRecord, JobState};
use crate::manager::QueueManager;

/// An authenticated caller
pub trait Principal {
    fn name(&self) -> &str;
    fn is_admin(&self) -> bool;
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AdminError {
    #[error("Forbidden: {0} is not an administrator")]
    Forbidden(String),
}

impl AdminError {
    /// HTTP status a transport layer should answer with
    pub fn status_code(&self) -> u16 {
        match self {
            Self::Forbidden(_) => 403,
        }
    }
}

/// Allow admins, deny everyone else
pub fn ensure_is_admin<P: Principal + ?Sized>(principal: &P) -> Result<(), AdminError> {
    if !principal.is_admin() {
        info!(
            principal = principal.name(),
            "A non admin user is trying to access admin content"
        );
        return Err(AdminError::Forbidden(principal.name().to_string()));
    }
    Ok(())
}

/// Operations unlocked by [`QueueManager::admin`]
#[derive(Debug)]
pub struct AdminOps<'a> {
    manager: &'a QueueManager,
}

impl<'a> AdminOps<'a> {
    pub(crate) fn new(manager: &'a QueueManager) -> Self {
        Self { manager }
    }

    /// Give a failed job a fresh attempt budget and wake its workers
    pub async fn retry(&self, id: JobId) -> Result<JobRecord, QueueError> {
        let job = self.manager.store().retry(id).await?;
        info!(job.id = id, job.kind = %job.kind, "Job retry forced by admin");
        self.manager.queue(&job.kind).notify.notify_one();
        Ok(job)
    }

    pub async fn failed_jobs(&self, limit: usize) -> Result<Vec<JobRecord>, QueueError> {
        Ok(self
            .manager
            .store()
            .list(Some(JobState::Failed), limit)
            .await?)
    }

    /// Delete completed jobs older than `older_than`
    pub async fn prune_completed(&self, older_than: Duration) -> Result<u64, QueueError> {
        let before = earlier(Utc::now(), older_than);
        Ok(self.manager.store().prune_completed(before).await?)
    }
}
