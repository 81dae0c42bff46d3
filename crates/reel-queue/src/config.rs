//! Worker pool configuration

use std::env;
use std::str::FromStr;
use std::time::Duration;

/// Timing knobs for the worker pool.
///
/// Per-kind settings (concurrency, attempts, backoff, timeout) live in
/// [`KindConfig`](crate::job::KindConfig); this struct covers the pool itself.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerConfig {
    /// Upper bound on how long an idle slot parks before re-polling
    pub poll_interval: Duration,
    /// Random extra wait added to each park, so idle slots spread out
    pub jitter: Duration,
    /// Lease granted on claim; a job whose lease runs out is re-delivered
    pub lease: Duration,
    pub heartbeat_interval: Duration,
    /// How often expired leases are swept back into the eligible set
    pub sweep_interval: Duration,
    /// Completed jobs older than this are pruned. `None` keeps them forever.
    pub retention: Option<Duration>,
    /// Ceiling for the pause after store errors
    pub max_store_backoff: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(1),
            jitter: Duration::from_millis(250),
            lease: Duration::from_secs(60),
            heartbeat_interval: Duration::from_secs(15),
            sweep_interval: Duration::from_secs(30),
            retention: Some(Duration::from_secs(7 * 24 * 60 * 60)),
            max_store_backoff: Duration::from_secs(30),
        }
    }
}

impl WorkerConfig {
    /// Load from `REEL_*` environment variables, falling back to defaults
    pub fn from_env() -> Self {
        Self::from_vars(|key| env::var(key).ok())
    }

    fn from_vars(var: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        let parse = |key: &str| var(key).and_then(|v| u64::from_str(v.trim()).ok());

        Self {
            poll_interval: parse("REEL_POLL_INTERVAL_MS")
                .map(Duration::from_millis)
                .unwrap_or(defaults.poll_interval),
            jitter: parse("REEL_POLL_JITTER_MS")
                .map(Duration::from_millis)
                .unwrap_or(defaults.jitter),
            lease: parse("REEL_LEASE_SECS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.lease),
            heartbeat_interval: parse("REEL_HEARTBEAT_SECS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.heartbeat_interval),
            sweep_interval: parse("REEL_SWEEP_INTERVAL_SECS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.sweep_interval),
            // 0 disables pruning
            retention: match parse("REEL_RETENTION_SECS") {
                Some(0) => None,
                Some(secs) => Some(Duration::from_secs(secs)),
                None => defaults.retention,
            },
            max_store_backoff: parse("REEL_MAX_STORE_BACKOFF_SECS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.max_store_backoff),
        }
    }
}
