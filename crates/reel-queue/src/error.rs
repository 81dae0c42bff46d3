//! Error types for producers, handlers and dispatch

use std::fmt::Display;
use std::time::Duration;

use crate::backend::StoreError;
use crate::job::JobId;

/// Errors surfaced synchronously to producers
#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    /// Unknown kind or malformed payload; nothing was persisted
    #[error("Validation error: {0}")]
    Validation(String),
    #[error(transparent)]
    Store(#[from] StoreError),
    /// The queue manager went away before the tracked job finished
    #[error("Queue manager closed before job {0} finished")]
    Closed(JobId),
}

/// Failure reported by a job handler
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum HandlerError {
    /// Recoverable; retried with backoff until attempts run out
    #[error("{0}")]
    Transient(String),
    /// Never retried, even if attempts remain
    #[error("{0}")]
    Terminal(String),
}

impl HandlerError {
    pub fn transient(error: impl Display) -> Self {
        Self::Transient(error.to_string())
    }

    pub fn terminal(error: impl Display) -> Self {
        Self::Terminal(error.to_string())
    }
}

impl From<anyhow::Error> for HandlerError {
    fn from(error: anyhow::Error) -> Self {
        Self::Transient(format!("{error:#}"))
    }
}

/// Why a dispatch attempt did not complete; rendered into `last_error`
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum JobFailure {
    #[error("No handler registered for kind `{0}`")]
    UnhandledKind(String),
    #[error("{0}")]
    Transient(String),
    #[error("Terminal: {0}")]
    Terminal(String),
    #[error("Timed out after {0:?}")]
    TimedOut(Duration),
    #[error("Handler panicked: {0}")]
    Panicked(String),
}

impl JobFailure {
    /// Whether the job may run again if attempts remain
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Transient(_) | Self::TimedOut(_) | Self::Panicked(_)
        )
    }
}

impl From<HandlerError> for JobFailure {
    fn from(error: HandlerError) -> Self {
        match error {
            HandlerError::Transient(msg) => Self::Transient(msg),
            HandlerError::Terminal(msg) => Self::Terminal(msg),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_failure_retryability() {
        assert!(JobFailure::from(HandlerError::transient("smtp down")).is_retryable());
        assert!(JobFailure::TimedOut(Duration::from_secs(1)).is_retryable());
        assert!(JobFailure::Panicked("oops".into()).is_retryable());
        assert!(!JobFailure::from(HandlerError::terminal("bad address")).is_retryable());
        assert!(!JobFailure::UnhandledKind("ghost".into()).is_retryable());
    }

    #[test]
    fn test_anyhow_is_transient() {
        let error: HandlerError = anyhow::anyhow!("connection reset").into();
        assert_eq!(error, HandlerError::Transient("connection reset".into()));
    }
}
