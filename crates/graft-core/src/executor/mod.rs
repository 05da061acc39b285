//! The executor runtime: poll, claim, execute, report.
//!
//! Consumes dispatch queues for its advertised capabilities, claims each
//! task atomically in the store, runs the matching handler under a
//! wall-clock deadline while a heartbeat renews the claim lease, and
//! reports the outcome before acknowledging the fabric message. A task's
//! handler may run more than once across the pool (after a reap), but at
//! most one report ever lands: the claim token guards it.

pub mod metrics;

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use sqlx::PgPool;
use tokio::sync::{Mutex, Semaphore, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use graft_db::StoreError;
use graft_db::queries::tasks::{self as task_db, ReportOutcome};
use graft_fabric::envelope::{DispatchEnvelope, ResultEnvelope, ResultError};
use graft_fabric::routing::{capability_key, dispatch_key, dispatch_queue, result_key};
use graft_fabric::{Delivery, Fabric};

use crate::config::CoreConfig;
use crate::handler::{ExecutionContext, HandlerFailure, HandlerRegistry};

pub use metrics::{ExecutorMetrics, ExecutorStatus, MetricsSnapshot};

/// Per-executor configuration.
#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    /// Stable identity advertised in claims and result envelopes.
    pub executor_id: String,
    /// Capability tags this executor consumes dispatches for.
    pub capabilities: Vec<String>,
    pub task_timeout: Duration,
    pub claim_lease: Duration,
    pub poll_interval: Duration,
    /// Concurrent in-flight tasks.
    pub max_concurrent: usize,
    /// Bounded store-retry attempts before a message is abandoned to the
    /// reaper.
    pub store_retry_limit: u32,
}

impl ExecutorConfig {
    pub fn from_core(
        core: &CoreConfig,
        executor_id: impl Into<String>,
        capabilities: Vec<String>,
    ) -> Self {
        Self {
            executor_id: executor_id.into(),
            capabilities,
            task_timeout: core.task_timeout,
            claim_lease: core.claim_lease,
            poll_interval: core.polling_interval,
            max_concurrent: 4,
            store_retry_limit: 8,
        }
    }
}

/// Completion signal from a spawned worker back to the consume loop.
struct WorkerDone {
    task_id: Uuid,
}

/// The executor process.
pub struct Executor {
    pool: PgPool,
    fabric: Arc<dyn Fabric>,
    registry: Arc<HandlerRegistry>,
    config: ExecutorConfig,
    metrics: Arc<ExecutorMetrics>,
    in_flight: Arc<Mutex<HashSet<Uuid>>>,
}

impl Executor {
    pub fn new(
        pool: PgPool,
        fabric: Arc<dyn Fabric>,
        registry: Arc<HandlerRegistry>,
        config: ExecutorConfig,
    ) -> Self {
        Self {
            pool,
            fabric,
            registry,
            config,
            metrics: Arc::new(ExecutorMetrics::new()),
            in_flight: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    pub fn metrics(&self) -> Arc<ExecutorMetrics> {
        Arc::clone(&self.metrics)
    }

    /// Consume dispatches until cancelled, then drain in-flight work.
    pub async fn run(&self, cancel: CancellationToken) -> Result<()> {
        let queues: Vec<String> = self
            .config
            .capabilities
            .iter()
            .map(|cap| dispatch_queue(cap))
            .collect();

        for (queue, cap) in queues.iter().zip(&self.config.capabilities) {
            self.fabric
                .declare_queue(queue, &[dispatch_key(cap), capability_key(cap)])
                .await
                .with_context(|| format!("failed to declare dispatch queue {queue}"))?;
        }

        info!(
            executor_id = %self.config.executor_id,
            capabilities = ?self.config.capabilities,
            "executor started"
        );

        let semaphore = Arc::new(Semaphore::new(self.config.max_concurrent));
        let (tx, mut rx) = mpsc::channel::<WorkerDone>(self.config.max_concurrent * 2);
        let mut in_flight_count: usize = 0;
        let mut queue_cursor = 0usize;
        let mut backoff = Duration::from_millis(100);

        loop {
            if cancel.is_cancelled() {
                break;
            }

            // Drain completions (non-blocking).
            while let Ok(done) = rx.try_recv() {
                in_flight_count -= 1;
                debug!(task_id = %done.task_id, "worker finished");
            }

            self.metrics.set_status(ExecutorStatus::Polling);

            // Round-robin across capability queues.
            let mut delivery = None;
            for _ in 0..queues.len() {
                let queue = &queues[queue_cursor];
                queue_cursor = (queue_cursor + 1) % queues.len();
                match self.fabric.consume(queue).await {
                    Ok(Some(found)) => {
                        delivery = Some(found);
                        backoff = Duration::from_millis(100);
                        break;
                    }
                    Ok(None) => {}
                    Err(e) => {
                        warn!(queue = %queue, error = %e, "fabric consume failed, backing off");
                        self.metrics.set_status(ExecutorStatus::Error);
                        sleep_or_cancel(backoff, &cancel).await;
                        backoff = (backoff * 2).min(Duration::from_secs(30));
                    }
                }
            }

            let Some(delivery) = delivery else {
                if in_flight_count == 0 {
                    self.metrics.set_status(ExecutorStatus::Idle);
                }
                sleep_or_cancel(self.config.poll_interval, &cancel).await;
                continue;
            };

            let envelope: DispatchEnvelope = match serde_json::from_value(delivery.payload.clone())
            {
                Ok(envelope) => envelope,
                Err(e) => {
                    warn!(
                        message_id = delivery.message_id,
                        error = %e,
                        "malformed dispatch envelope, discarding"
                    );
                    let _ = self.fabric.ack(&delivery).await;
                    continue;
                }
            };

            // Local duplicate: this executor is already running the task
            // (the same dispatch arrived via a second capability key).
            {
                let mut in_flight = self.in_flight.lock().await;
                if !in_flight.insert(envelope.task_id) {
                    debug!(task_id = %envelope.task_id, "duplicate delivery rejected locally");
                    let _ = self.fabric.nack(&delivery).await;
                    continue;
                }
            }

            let permit = match Arc::clone(&semaphore).acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => break,
            };
            in_flight_count += 1;
            self.metrics.set_status(ExecutorStatus::Executing);

            let worker = Worker {
                pool: self.pool.clone(),
                fabric: Arc::clone(&self.fabric),
                registry: Arc::clone(&self.registry),
                config: self.config.clone(),
                metrics: Arc::clone(&self.metrics),
            };
            let in_flight = Arc::clone(&self.in_flight);
            let tx = tx.clone();
            let task_id = envelope.task_id;

            tokio::spawn(async move {
                worker.process(envelope, delivery).await;
                in_flight.lock().await.remove(&task_id);
                drop(permit);
                let _ = tx.send(WorkerDone { task_id }).await;
            });
        }

        // Graceful shutdown: no new consumption; let in-flight reports
        // finish. The drain deadline covers a full execution plus slack.
        info!(
            executor_id = %self.config.executor_id,
            in_flight = in_flight_count,
            "executor shutting down, draining in-flight tasks"
        );
        let drain_deadline =
            tokio::time::Instant::now() + self.config.task_timeout + Duration::from_secs(10);
        while in_flight_count > 0 {
            match tokio::time::timeout_at(drain_deadline, rx.recv()).await {
                Ok(Some(_)) => in_flight_count -= 1,
                _ => break,
            }
        }
        if in_flight_count > 0 {
            warn!(
                remaining = in_flight_count,
                "drain deadline expired; the reaper will recover abandoned claims"
            );
        }

        self.metrics.set_status(ExecutorStatus::Shutdown);
        info!(executor_id = %self.config.executor_id, "executor stopped");
        Ok(())
    }
}

/// Everything one spawned worker needs to take a dispatch to completion.
struct Worker {
    pool: PgPool,
    fabric: Arc<dyn Fabric>,
    registry: Arc<HandlerRegistry>,
    config: ExecutorConfig,
    metrics: Arc<ExecutorMetrics>,
}

impl Worker {
    /// Claim, execute, report, acknowledge. Never panics the runtime; all
    /// failure paths settle the delivery one way or the other.
    async fn process(&self, envelope: DispatchEnvelope, delivery: Delivery) {
        let task_id = envelope.task_id;

        // Claim. Conflict means another executor owns the task; the
        // message is done.
        let claim_token = match self.claim_with_backoff(task_id).await {
            ClaimResult::Claimed(token) => token,
            ClaimResult::Conflict => {
                debug!(task_id = %task_id, "claim conflict, acknowledging");
                let _ = self.fabric.ack(&delivery).await;
                return;
            }
            ClaimResult::Abandoned => {
                // Store stayed unreachable; leave the message for another
                // consumer and let the reaper recover any claim state.
                let _ = self.fabric.nack(&delivery).await;
                return;
            }
        };

        let started = tokio::time::Instant::now();

        // Resolve a handler: typed lookup, then predicate fallback.
        let Some(handler) = self
            .registry
            .resolve(&envelope.executor_type, &envelope.parameters)
        else {
            warn!(task_id = %task_id, executor_type = %envelope.executor_type, "no handler");
            let failure = HandlerFailure::new(
                "NoHandler",
                format!("no handler for executor type {:?}", envelope.executor_type),
            );
            self.settle(
                &envelope,
                &delivery,
                &claim_token,
                Err(failure),
                started.elapsed(),
            )
            .await;
            return;
        };

        // Execute under deadline, with the heartbeat renewing the lease.
        let handler_cancel = CancellationToken::new();
        let renewal_lost = Arc::new(AtomicBool::new(false));
        let heartbeat_stop = CancellationToken::new();
        let heartbeat = tokio::spawn(heartbeat_loop(
            self.pool.clone(),
            task_id,
            claim_token.clone(),
            self.config.claim_lease,
            handler_cancel.clone(),
            heartbeat_stop.clone(),
            Arc::clone(&renewal_lost),
        ));

        let ctx = ExecutionContext {
            task_id,
            workflow_id: envelope.workflow_id,
            executor_type: envelope.executor_type.clone(),
            parameters: envelope.parameters.clone(),
            start_time: Utc::now(),
            upstream_results: None,
            cancel: handler_cancel.clone(),
        };

        let outcome = match tokio::time::timeout(self.config.task_timeout, handler.execute(&ctx))
            .await
        {
            Ok(result) => result,
            Err(_) => {
                handler_cancel.cancel();
                Err(HandlerFailure::new(
                    "Timeout",
                    format!(
                        "handler exceeded the {}s deadline",
                        self.config.task_timeout.as_secs()
                    ),
                ))
            }
        };

        heartbeat_stop.cancel();
        let _ = heartbeat.await;

        if renewal_lost.load(Ordering::SeqCst) {
            // The claim is gone; the reaper owns the task now. Reporting
            // would be rejected as stale, so do not report at all.
            warn!(task_id = %task_id, "claim renewal lost, suppressing report");
            let _ = self.fabric.nack(&delivery).await;
            return;
        }

        self.settle(&envelope, &delivery, &claim_token, outcome, started.elapsed())
            .await;
    }

    /// Report the outcome under the claim token, publish the result
    /// envelope, and acknowledge the message. Ack happens only after a
    /// successful report; a stale claim acknowledges without reporting.
    async fn settle(
        &self,
        envelope: &DispatchEnvelope,
        delivery: &Delivery,
        claim_token: &str,
        outcome: Result<serde_json::Value, HandlerFailure>,
        elapsed: Duration,
    ) {
        let task_id = envelope.task_id;
        let duration_ms = elapsed.as_millis() as i64;
        let success = outcome.is_ok();

        let (report_outcome, payload, result_envelope) = match outcome {
            Ok(data) => (
                ReportOutcome::Ok,
                data.clone(),
                ResultEnvelope::ok(
                    task_id,
                    envelope.workflow_id,
                    data,
                    &self.config.executor_id,
                    duration_ms,
                ),
            ),
            Err(failure) => {
                let mut error = ResultError {
                    error_type: failure.error_type.clone(),
                    error_message: failure.error_message.clone(),
                    context: failure.context.clone(),
                    details: None,
                };
                if failure.error_type == "Timeout" {
                    error.details = Some(serde_json::json!({
                        "limit_seconds": self.config.task_timeout.as_secs(),
                    }));
                }
                let payload = serde_json::to_value(&error).unwrap_or_default();
                (
                    ReportOutcome::Error,
                    payload,
                    ResultEnvelope::error(
                        task_id,
                        envelope.workflow_id,
                        error,
                        &self.config.executor_id,
                        duration_ms,
                    ),
                )
            }
        };

        // Report with bounded backoff; store unavailability is transient.
        let mut attempts = 0;
        loop {
            match task_db::report(
                &self.pool,
                task_id,
                claim_token,
                report_outcome,
                &payload,
                duration_ms,
            )
            .await
            {
                Ok(()) => break,
                Err(StoreError::StaleClaim { .. }) => {
                    // Another invocation's report won (or the reaper did).
                    debug!(task_id = %task_id, "stale claim at report, acknowledging");
                    let _ = self.fabric.ack(delivery).await;
                    return;
                }
                Err(e) => {
                    attempts += 1;
                    if attempts >= self.config.store_retry_limit {
                        warn!(task_id = %task_id, error = %e, "report abandoned after retries");
                        let _ = self.fabric.nack(delivery).await;
                        return;
                    }
                    let backoff = Duration::from_millis(100 * 2u64.pow(attempts.min(6)));
                    warn!(task_id = %task_id, error = %e, "report failed, retrying");
                    tokio::time::sleep(backoff).await;
                }
            }
        }

        self.metrics.record(success, duration_ms as u64);

        // Publish the result for the evaluator, then acknowledge.
        let key = result_key(&envelope.executor_type);
        let payload = match serde_json::to_value(&result_envelope) {
            Ok(payload) => payload,
            Err(e) => {
                warn!(task_id = %task_id, error = %e, "result envelope serialization failed");
                let _ = self.fabric.ack(delivery).await;
                return;
            }
        };
        let mut attempts = 0;
        loop {
            match self.fabric.publish(&key, &payload).await {
                Ok(()) => break,
                Err(e) => {
                    attempts += 1;
                    if attempts >= self.config.store_retry_limit {
                        // The report is durable; supervision synthesizes
                        // the evaluation if this envelope never lands.
                        warn!(task_id = %task_id, error = %e, "result publish abandoned");
                        break;
                    }
                    tokio::time::sleep(Duration::from_millis(100 * 2u64.pow(attempts.min(6))))
                        .await;
                }
            }
        }

        if let Err(e) = self.fabric.ack(delivery).await {
            warn!(task_id = %task_id, error = %e, "ack failed; duplicate delivery is harmless");
        }
    }

    async fn claim_with_backoff(&self, task_id: Uuid) -> ClaimResult {
        let mut attempts = 0;
        loop {
            match task_db::claim(
                &self.pool,
                task_id,
                &self.config.executor_id,
                self.config.claim_lease.as_secs_f64(),
            )
            .await
            {
                Ok(token) => return ClaimResult::Claimed(token),
                Err(StoreError::Conflict { .. }) => return ClaimResult::Conflict,
                Err(e) => {
                    attempts += 1;
                    if attempts >= self.config.store_retry_limit {
                        warn!(task_id = %task_id, error = %e, "claim abandoned after retries");
                        return ClaimResult::Abandoned;
                    }
                    tokio::time::sleep(Duration::from_millis(100 * 2u64.pow(attempts.min(6))))
                        .await;
                }
            }
        }
    }
}

enum ClaimResult {
    Claimed(String),
    Conflict,
    Abandoned,
}

/// Renew the claim at a third of the lease until stopped.
///
/// A stale renewal means the reaper won the race: the handler is
/// cancelled, `renewal_lost` is raised, and the worker suppresses its
/// report.
async fn heartbeat_loop(
    pool: PgPool,
    task_id: Uuid,
    claim_token: String,
    lease: Duration,
    handler_cancel: CancellationToken,
    stop: CancellationToken,
    renewal_lost: Arc<AtomicBool>,
) {
    let period = lease / 3;
    loop {
        tokio::select! {
            _ = tokio::time::sleep(period) => {}
            _ = stop.cancelled() => return,
        }

        match task_db::renew_claim(&pool, task_id, &claim_token, lease.as_secs_f64()).await {
            Ok(()) => {
                debug!(task_id = %task_id, "claim renewed");
            }
            Err(StoreError::StaleClaim { .. }) => {
                renewal_lost.store(true, Ordering::SeqCst);
                handler_cancel.cancel();
                return;
            }
            Err(e) => {
                // Transient; the next tick retries. The lease outlives two
                // missed renewals.
                warn!(task_id = %task_id, error = %e, "claim renewal errored");
            }
        }
    }
}

async fn sleep_or_cancel(duration: Duration, cancel: &CancellationToken) {
    tokio::select! {
        _ = tokio::time::sleep(duration) => {}
        _ = cancel.cancelled() => {}
    }
}
