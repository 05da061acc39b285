//! Observable executor metrics.

use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

/// Coarse executor lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutorStatus {
    Idle,
    Polling,
    Executing,
    Error,
    Shutdown,
}

/// Counters and a moving average, shared across worker tasks.
#[derive(Debug)]
pub struct ExecutorMetrics {
    processed: AtomicU64,
    succeeded: AtomicU64,
    failed: AtomicU64,
    state: Mutex<MetricsState>,
}

#[derive(Debug)]
struct MetricsState {
    avg_duration_ms: f64,
    status: ExecutorStatus,
}

/// Point-in-time copy of the metrics.
#[derive(Debug, Clone, PartialEq)]
pub struct MetricsSnapshot {
    pub processed: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub avg_duration_ms: f64,
    pub status: ExecutorStatus,
}

impl ExecutorMetrics {
    pub fn new() -> Self {
        Self {
            processed: AtomicU64::new(0),
            succeeded: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            state: Mutex::new(MetricsState {
                avg_duration_ms: 0.0,
                status: ExecutorStatus::Idle,
            }),
        }
    }

    /// Record one completed execution. The average is an exponential
    /// moving average with a 0.2 weight on the newest sample.
    pub fn record(&self, success: bool, duration_ms: u64) {
        self.processed.fetch_add(1, Ordering::Relaxed);
        if success {
            self.succeeded.fetch_add(1, Ordering::Relaxed);
        } else {
            self.failed.fetch_add(1, Ordering::Relaxed);
        }

        let mut state = self.state.lock().unwrap();
        if state.avg_duration_ms == 0.0 {
            state.avg_duration_ms = duration_ms as f64;
        } else {
            state.avg_duration_ms = 0.8 * state.avg_duration_ms + 0.2 * duration_ms as f64;
        }
    }

    pub fn set_status(&self, status: ExecutorStatus) {
        self.state.lock().unwrap().status = status;
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let state = self.state.lock().unwrap();
        MetricsSnapshot {
            processed: self.processed.load(Ordering::Relaxed),
            succeeded: self.succeeded.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            avg_duration_ms: state.avg_duration_ms,
            status: state.status,
        }
    }
}

impl Default for ExecutorMetrics {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_track_outcomes() {
        let metrics = ExecutorMetrics::new();
        metrics.record(true, 100);
        metrics.record(false, 300);

        let snap = metrics.snapshot();
        assert_eq!(snap.processed, 2);
        assert_eq!(snap.succeeded, 1);
        assert_eq!(snap.failed, 1);
    }

    #[test]
    fn moving_average_seeds_then_blends() {
        let metrics = ExecutorMetrics::new();
        metrics.record(true, 100);
        assert_eq!(metrics.snapshot().avg_duration_ms, 100.0);

        metrics.record(true, 200);
        let avg = metrics.snapshot().avg_duration_ms;
        assert!((avg - 120.0).abs() < 1e-9);
    }

    #[test]
    fn status_transitions() {
        let metrics = ExecutorMetrics::new();
        assert_eq!(metrics.snapshot().status, ExecutorStatus::Idle);
        metrics.set_status(ExecutorStatus::Executing);
        assert_eq!(metrics.snapshot().status, ExecutorStatus::Executing);
    }
}
