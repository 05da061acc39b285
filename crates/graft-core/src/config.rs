//! Engine configuration from the environment.
//!
//! Every knob has a `GRAFT_`-prefixed environment variable and a default
//! matching the documented contract. A malformed value is a configuration
//! error (exit code 3), not a silent fallback.

use std::env;
use std::time::Duration;

use anyhow::{Context, Result};

/// Process exit codes.
pub mod exit {
    /// Clean shutdown.
    pub const OK: i32 = 0;
    /// Unrecoverable store error at startup.
    pub const STORE: i32 = 1;
    /// Unrecoverable fabric error at startup.
    pub const FABRIC: i32 = 2;
    /// Configuration error.
    pub const CONFIG: i32 = 3;
}

/// Shared engine tuning, read once at startup.
#[derive(Debug, Clone)]
pub struct CoreConfig {
    /// Per-task wall-clock deadline.
    pub task_timeout: Duration,
    /// Initial claim lease; heartbeats renew at a third of this.
    pub claim_lease: Duration,
    /// Reaper threshold before a task fails instead of re-dispatching.
    pub max_retries: i32,
    /// Bound on nested corrections per workflow.
    pub max_correction_depth: i32,
    /// Dispatch/supervision loop base interval.
    pub polling_interval: Duration,
    /// Max tasks per ready-tasks batch.
    pub dispatch_batch: i64,
    /// Fabric redeliveries before dead-lettering.
    pub dead_letter_after: i32,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            task_timeout: Duration::from_secs(300),
            claim_lease: Duration::from_secs(60),
            max_retries: 3,
            max_correction_depth: 3,
            polling_interval: Duration::from_millis(200),
            dispatch_batch: 32,
            dead_letter_after: 5,
        }
    }
}

impl CoreConfig {
    /// Build a config from the environment, falling back to defaults.
    pub fn from_env() -> Result<Self> {
        let defaults = Self::default();
        Ok(Self {
            task_timeout: secs_var("GRAFT_TASK_TIMEOUT", defaults.task_timeout)?,
            claim_lease: secs_var("GRAFT_CLAIM_LEASE", defaults.claim_lease)?,
            max_retries: int_var("GRAFT_MAX_RETRIES", defaults.max_retries)?,
            max_correction_depth: int_var(
                "GRAFT_MAX_CORRECTION_DEPTH",
                defaults.max_correction_depth,
            )?,
            polling_interval: millis_var("GRAFT_POLLING_INTERVAL", defaults.polling_interval)?,
            dispatch_batch: int_var("GRAFT_DISPATCH_BATCH", defaults.dispatch_batch)?,
            dead_letter_after: int_var("GRAFT_DEAD_LETTER_AFTER", defaults.dead_letter_after)?,
        })
    }

    /// Heartbeat renewal period: a third of the claim lease.
    pub fn heartbeat_interval(&self) -> Duration {
        self.claim_lease / 3
    }
}

fn secs_var(name: &str, default: Duration) -> Result<Duration> {
    match env::var(name) {
        Ok(raw) => {
            let secs: u64 = raw
                .parse()
                .with_context(|| format!("{name} must be an integer number of seconds, got {raw:?}"))?;
            Ok(Duration::from_secs(secs))
        }
        Err(_) => Ok(default),
    }
}

fn millis_var(name: &str, default: Duration) -> Result<Duration> {
    match env::var(name) {
        Ok(raw) => {
            let ms: u64 = raw
                .parse()
                .with_context(|| format!("{name} must be an integer number of milliseconds, got {raw:?}"))?;
            Ok(Duration::from_millis(ms))
        }
        Err(_) => Ok(default),
    }
}

fn int_var<T>(name: &str, default: T) -> Result<T>
where
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match env::var(name) {
        Ok(raw) => raw
            .parse()
            .with_context(|| format!("{name} must be an integer, got {raw:?}")),
        Err(_) => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_contract() {
        let cfg = CoreConfig::default();
        assert_eq!(cfg.task_timeout, Duration::from_secs(300));
        assert_eq!(cfg.claim_lease, Duration::from_secs(60));
        assert_eq!(cfg.max_retries, 3);
        assert_eq!(cfg.max_correction_depth, 3);
        assert_eq!(cfg.polling_interval, Duration::from_millis(200));
        assert_eq!(cfg.dispatch_batch, 32);
        assert_eq!(cfg.dead_letter_after, 5);
    }

    #[test]
    fn heartbeat_is_a_third_of_lease() {
        let cfg = CoreConfig::default();
        assert_eq!(cfg.heartbeat_interval(), Duration::from_secs(20));
    }
}
