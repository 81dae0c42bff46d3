//! Job definitions

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// Job Identifier, assigned monotonically by the store
pub type JobId = i64;

/// Attempt ceiling used when neither the job nor its kind configures one
pub const DEFAULT_MAX_ATTEMPTS: u32 = 5;

/// Job State
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    /// Waiting in queue
    Pending,
    /// Claimed by exactly one worker
    Active,
    /// Successfully completed
    Completed,
    /// Permanently failed, retained for inspection
    Failed,
    /// Waiting for a retry after a failed attempt
    Delayed,
}

impl JobState {
    pub const ALL: [JobState; 5] = [
        JobState::Pending,
        JobState::Active,
        JobState::Completed,
        JobState::Failed,
        JobState::Delayed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Active => "active",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Delayed => "delayed",
        }
    }

    /// Completed and Failed jobs never run again (unless an admin retries them)
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    /// States a job can be claimed from once `next_run_at` has passed
    pub fn is_eligible(&self) -> bool {
        matches!(self, Self::Pending | Self::Delayed)
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, thiserror::Error)]
#[error("unknown job state: {0}")]
pub struct ParseJobStateError(String);

impl FromStr for JobState {
    type Err = ParseJobStateError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "active" => Ok(Self::Active),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "delayed" => Ok(Self::Delayed),
            other => Err(ParseJobStateError(other.to_string())),
        }
    }
}

/// Retry backoff strategy
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum BackoffStrategy {
    Constant {
        millis: u64,
    },
    /// `initial * multiplier^attempts`, capped at `max_millis`
    Exponential {
        initial_millis: u64,
        multiplier: f64,
        max_millis: u64,
    },
}

impl Default for BackoffStrategy {
    fn default() -> Self {
        Self::Exponential {
            initial_millis: 1_000,
            multiplier: 2.0,
            max_millis: 60 * 60 * 1_000,
        }
    }
}

impl BackoffStrategy {
    pub fn constant(delay: Duration) -> Self {
        Self::Constant {
            millis: delay.as_millis() as u64,
        }
    }

    pub fn exponential(initial: Duration, max: Duration) -> Self {
        Self::Exponential {
            initial_millis: initial.as_millis() as u64,
            multiplier: 2.0,
            max_millis: max.as_millis() as u64,
        }
    }

    /// Delay before the next run, given the number of attempts made so far
    pub fn delay(&self, attempts: u32) -> Duration {
        match self {
            Self::Constant { millis } => Duration::from_millis(*millis),
            Self::Exponential {
                initial_millis,
                multiplier,
                max_millis,
            } => {
                let exponent = attempts.min(i32::MAX as u32) as i32;
                let millis = *initial_millis as f64 * multiplier.powi(exponent);
                // NaN and overflow both saturate to the cap
                let millis = if millis.is_finite() {
                    millis.min(*max_millis as f64) as u64
                } else {
                    *max_millis
                };
                Duration::from_millis(millis)
            }
        }
    }
}

/// Per-job submission options
#[derive(Debug, Clone, Default)]
pub struct JobOptions {
    /// Delay before the job first becomes eligible
    pub delay: Option<Duration>,
    /// Overrides the kind's attempt ceiling
    pub max_attempts: Option<u32>,
}

impl JobOptions {
    pub fn delayed(delay: Duration) -> Self {
        Self {
            delay: Some(delay),
            ..Default::default()
        }
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = Some(max_attempts);
        self
    }
}

/// Per-kind processing settings
#[derive(Debug, Clone)]
pub struct KindConfig {
    /// Maximum concurrently active jobs of this kind in one pool
    pub concurrency: usize,
    pub max_attempts: u32,
    pub backoff: BackoffStrategy,
    /// Upper bound on one handler invocation
    pub timeout: Option<Duration>,
}

impl Default for KindConfig {
    fn default() -> Self {
        Self {
            concurrency: 1,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            backoff: BackoffStrategy::default(),
            timeout: None,
        }
    }
}

impl KindConfig {
    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    pub fn with_backoff(mut self, backoff: BackoffStrategy) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// A persisted job record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRecord {
    pub id: JobId,
    pub kind: String,
    pub payload: serde_json::Value,
    pub state: JobState,
    pub attempts: u32,
    pub max_attempts: u32,
    pub created_at: DateTime<Utc>,
    pub next_run_at: DateTime<Utc>,
    pub last_error: Option<String>,
    /// Set while Active; a worker renews it with heartbeats
    pub lease_expires_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl JobRecord {
    pub fn is_eligible_at(&self, now: DateTime<Utc>) -> bool {
        self.state.is_eligible() && self.next_run_at <= now
    }

    pub fn has_attempts_left(&self) -> bool {
        self.attempts < self.max_attempts
    }
}

/// Counts of jobs per state
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct JobCounts {
    pub pending: u64,
    pub active: u64,
    pub delayed: u64,
    pub completed: u64,
    pub failed: u64,
}

impl JobCounts {
    pub fn add(&mut self, state: JobState, n: u64) {
        match state {
            JobState::Pending => self.pending += n,
            JobState::Active => self.active += n,
            JobState::Delayed => self.delayed += n,
            JobState::Completed => self.completed += n,
            JobState::Failed => self.failed += n,
        }
    }

    pub fn total(&self) -> u64 {
        self.pending + self.active + self.delayed + self.completed + self.failed
    }
}

fn chrono_duration(d: Duration) -> chrono::Duration {
    chrono::Duration::from_std(d).unwrap_or(chrono::Duration::MAX)
}

/// `at + d`, saturating at the latest representable time
pub(crate) fn later(at: DateTime<Utc>, d: Duration) -> DateTime<Utc> {
    at.checked_add_signed(chrono_duration(d))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// `at - d`, saturating at the earliest representable time
pub(crate) fn earlier(at: DateTime<Utc>, d: Duration) -> DateTime<Utc> {
    at.checked_sub_signed(chrono_duration(d))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}
