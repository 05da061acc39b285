//! The evaluator: an idempotent judge over executor results.
//!
//! Consumes the results queue, validates each outcome per task class,
//! computes a reward scalar, and persists feedback, reward, and an
//! experience record in one conditional transaction. Replayed envelopes
//! and replica evaluators are safe: the store applies an evaluation at
//! most once per task.

pub mod reward;
pub mod validators;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use serde_json::{Value, json};
use sqlx::PgPool;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use graft_db::models::{Task, TaskStatus};
use graft_db::queries::experiences::{self, Evaluation};
use graft_db::queries::{tasks as task_db, workflows as workflow_db};
use graft_fabric::envelope::ResultEnvelope;
use graft_fabric::routing::{RESULTS_PATTERN, RESULTS_QUEUE};
use graft_fabric::Fabric;

use reward::compute_reward;
use validators::validate;

/// Evaluator tuning.
#[derive(Debug, Clone)]
pub struct EvaluatorConfig {
    /// Substrings that make stderr output acceptable for `code_executor`
    /// results.
    pub stderr_whitelist: Vec<String>,
    /// Sleep between polls when the results queue is empty.
    pub poll_interval: Duration,
}

impl Default for EvaluatorConfig {
    fn default() -> Self {
        Self {
            stderr_whitelist: Vec::new(),
            poll_interval: Duration::from_millis(200),
        }
    }
}

/// The evaluator process.
pub struct Evaluator {
    pool: PgPool,
    fabric: Arc<dyn Fabric>,
    config: EvaluatorConfig,
}

impl Evaluator {
    pub fn new(pool: PgPool, fabric: Arc<dyn Fabric>, config: EvaluatorConfig) -> Self {
        Self {
            pool,
            fabric,
            config,
        }
    }

    /// Consume and evaluate results until cancelled.
    pub async fn run(&self, cancel: CancellationToken) -> Result<()> {
        self.fabric
            .declare_queue(RESULTS_QUEUE, &[RESULTS_PATTERN.to_string()])
            .await
            .context("failed to declare results queue")?;

        info!("evaluator started");
        let mut backoff = Duration::from_millis(100);

        while !cancel.is_cancelled() {
            let delivery = match self.fabric.consume(RESULTS_QUEUE).await {
                Ok(delivery) => {
                    backoff = Duration::from_millis(100);
                    delivery
                }
                Err(e) => {
                    warn!(error = %e, "fabric consume failed, backing off");
                    sleep_or_cancel(backoff, &cancel).await;
                    backoff = (backoff * 2).min(Duration::from_secs(30));
                    continue;
                }
            };

            let Some(delivery) = delivery else {
                sleep_or_cancel(self.config.poll_interval, &cancel).await;
                continue;
            };

            let envelope: ResultEnvelope = match serde_json::from_value(delivery.payload.clone()) {
                Ok(envelope) => envelope,
                Err(e) => {
                    warn!(
                        message_id = delivery.message_id,
                        error = %e,
                        "malformed result envelope, discarding"
                    );
                    let _ = self.fabric.ack(&delivery).await;
                    continue;
                }
            };

            match self.evaluate_envelope(&envelope).await {
                Ok(applied) => {
                    if applied {
                        debug!(task_id = %envelope.task_id, "evaluation applied");
                    } else {
                        debug!(task_id = %envelope.task_id, "duplicate result dropped");
                    }
                    if let Err(e) = self.fabric.ack(&delivery).await {
                        warn!(error = %e, "ack failed; envelope will be redelivered");
                    }
                }
                Err(e) => {
                    // Transient store trouble: leave the envelope for
                    // redelivery and back off.
                    warn!(task_id = %envelope.task_id, error = %e, "evaluation failed, will retry");
                    let _ = self.fabric.nack(&delivery).await;
                    sleep_or_cancel(backoff, &cancel).await;
                    backoff = (backoff * 2).min(Duration::from_secs(30));
                }
            }
        }

        info!("evaluator stopped");
        Ok(())
    }

    /// Evaluate a result envelope. The envelope only identifies the task;
    /// the durable row reported by the executor is the evidence.
    pub async fn evaluate_envelope(&self, envelope: &ResultEnvelope) -> Result<bool> {
        let Some(task) = task_db::get_task(&self.pool, envelope.task_id).await? else {
            // Unknown task: stale envelope for a deleted workflow.
            return Ok(false);
        };
        evaluate_task(&self.pool, &task, &self.config).await
    }
}

/// Evaluate a task from its durable state.
///
/// Also called by the supervision loop to synthesize evaluations for
/// terminal tasks whose result envelope never arrived (reaped claims,
/// executor crash between report and publish). Returns `true` when this
/// call recorded the evaluation.
pub async fn evaluate_task(
    pool: &PgPool,
    task: &Task,
    config: &EvaluatorConfig,
) -> Result<bool> {
    // Idempotency: only unevaluated terminal outcomes are scored.
    if task.feedback_notes.is_some() {
        return Ok(false);
    }
    let outcome_ok = match task.status {
        TaskStatus::Succeeded => true,
        TaskStatus::Failed => false,
        _ => return Ok(false),
    };

    // Validators only inspect `ok` outcomes; reported failures keep their
    // executor error. Each arm carries its own evidence, so the feedback
    // shape follows directly from the verdict.
    let verdict = if outcome_ok {
        Some(
            validate(
                &task.executor_type,
                &task.parameters,
                task.result_payload.as_ref(),
                &config.stderr_whitelist,
            )
            .await,
        )
    } else {
        None
    };

    let (success, validation_rejected, feedback) = match &verdict {
        Some(verdict) if verdict.passed => (true, false, success_feedback(task, verdict)),
        Some(verdict) => (false, true, rejection_feedback(verdict)),
        None => (false, false, failure_feedback(task)),
    };
    let reward = compute_reward(success, task.retries, validation_rejected);
    let status = if success {
        TaskStatus::Succeeded
    } else {
        TaskStatus::Failed
    };

    let (state_snapshot, action_snapshot) = build_snapshots(pool, task).await?;

    let applied = experiences::record_evaluation(
        pool,
        task.task_id,
        &Evaluation {
            status,
            reward,
            feedback,
            state_snapshot,
            action_snapshot,
        },
    )
    .await?;

    if applied {
        info!(
            task_id = %task.task_id,
            workflow_id = %task.workflow_id,
            status = %status,
            reward = reward as f64,
            "task evaluated"
        );
    }
    Ok(applied)
}

/// Feedback for a validated success.
fn success_feedback(task: &Task, verdict: &validators::Verdict) -> Value {
    json!({
        "status": "success",
        "notes": format!("validated by {}", verdict.validator),
        "data": task.result_payload,
    })
}

/// Feedback when a validator overturns an executor's `ok`.
fn rejection_feedback(verdict: &validators::Verdict) -> Value {
    json!({
        "status": "failed",
        "error_type": "ValidationFailure",
        "validator": verdict.validator,
        "reason": verdict.reason,
    })
}

/// Feedback for an executor-reported failure: surface the structured
/// error from the report, or synthesize a lease-expiry error when no
/// report exists.
fn failure_feedback(task: &Task) -> Value {
    match &task.result_payload {
        Some(payload) => {
            let error_type = payload
                .get("error_type")
                .and_then(|t| t.as_str())
                .unwrap_or("HandlerError");
            let mut feedback = json!({
                "status": "failed",
                "error_type": error_type,
                "error_message": payload.get("error_message").cloned().unwrap_or(Value::Null),
            });
            if let Some(context) = payload.get("context") {
                feedback["traceback"] = context.clone();
            }
            if let Some(details) = payload.get("details") {
                feedback["details"] = details.clone();
            }
            // Deadline overruns surface their limit directly.
            if error_type == "Timeout" {
                if let Some(limit) = payload.pointer("/details/limit_seconds") {
                    feedback["limit_seconds"] = limit.clone();
                }
            }
            feedback
        }
        None => json!({
            "status": "failed",
            "error_type": "LeaseExpired",
            "error_message": "claim lease expired with retries exhausted; no report received",
        }),
    }
}

/// Capture the state and action snapshots for the experience record.
async fn build_snapshots(pool: &PgPool, task: &Task) -> Result<(Value, Value)> {
    let prompt = workflow_db::get_workflow(pool, task.workflow_id)
        .await?
        .map(|w| w.prompt)
        .unwrap_or_default();

    let dep_ids = task_db::get_task_dependencies(pool, task.task_id).await?;
    let mut dependency_outcomes = Vec::with_capacity(dep_ids.len());
    for dep_id in dep_ids {
        if let Some(dep) = task_db::get_task(pool, dep_id).await? {
            dependency_outcomes.push(json!({
                "task_id": dep.task_id,
                "description": dep.description,
                "status": dep.status,
            }));
        }
    }

    let state = json!({
        "prompt": prompt,
        "description": task.description,
        "dependency_outcomes": dependency_outcomes,
        "retries": task.retries,
        "correction_generation": task.correction_generation,
    });
    let action = json!({
        "executor_type": task.executor_type,
        "parameters": task.parameters,
    });
    Ok((state, action))
}

async fn sleep_or_cancel(duration: Duration, cancel: &CancellationToken) {
    tokio::select! {
        _ = tokio::time::sleep(duration) => {}
        _ = cancel.cancelled() => {}
    }
}
