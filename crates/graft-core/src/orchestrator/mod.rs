//! The orchestrator: workflow admission, dispatch, and supervision.
//!
//! Three cooperating activities over distinct slices of state:
//!
//! - **Admission** creates a workflow, consults the planner oracle, and
//!   persists the initial DAG.
//! - **The dispatch loop** publishes ready tasks to the fabric.
//! - **The supervision loop** reaps expired claims, backfills missing
//!   evaluations, drives correction surgery for failures, and finalizes
//!   workflows at rest.
//!
//! Replicas are safe: every transition is conditional in the store, and a
//! lost race is a logged no-op.

pub mod correction;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use sqlx::PgPool;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use graft_db::StoreError;
use graft_db::models::{NewTask, Task, TaskStatus};
use graft_db::queries::{tasks as task_db, workflows as workflow_db};
use graft_fabric::Fabric;
use graft_fabric::envelope::DispatchEnvelope;
use graft_fabric::routing::{capability_key, dispatch_key};

use crate::config::CoreConfig;
use crate::evaluator::{self, EvaluatorConfig};
use crate::oracle::{Planner, validate_plan};

/// Orchestrator tuning.
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    pub polling_interval: Duration,
    pub dispatch_batch: i64,
    pub max_retries: i32,
    pub max_correction_depth: i32,
    /// Executor types the orchestrator accepts from the oracle. Empty
    /// accepts anything.
    pub known_executor_types: Vec<String>,
    /// Silence before a terminal task's evaluation is synthesized from
    /// durable state.
    pub evaluation_grace: Duration,
    /// Silence before a dispatched-but-unclaimed task's envelope is
    /// republished.
    pub redispatch_grace: Duration,
}

impl OrchestratorConfig {
    pub fn from_core(core: &CoreConfig) -> Self {
        Self {
            polling_interval: core.polling_interval,
            dispatch_batch: core.dispatch_batch,
            max_retries: core.max_retries,
            max_correction_depth: core.max_correction_depth,
            known_executor_types: vec![
                "code_executor".into(),
                "file_writer".into(),
                "api_caller".into(),
                "generic".into(),
            ],
            evaluation_grace: core.claim_lease,
            redispatch_grace: core.claim_lease,
        }
    }
}

/// The orchestrator process.
pub struct Orchestrator {
    pool: PgPool,
    fabric: Arc<dyn Fabric>,
    planner: Arc<dyn Planner>,
    config: OrchestratorConfig,
    /// Used when the supervision loop synthesizes evaluations.
    evaluator_config: EvaluatorConfig,
}

impl Orchestrator {
    pub fn new(
        pool: PgPool,
        fabric: Arc<dyn Fabric>,
        planner: Arc<dyn Planner>,
        config: OrchestratorConfig,
        evaluator_config: EvaluatorConfig,
    ) -> Self {
        Self {
            pool,
            fabric,
            planner,
            config,
            evaluator_config,
        }
    }

    // -----------------------------------------------------------------
    // Admission
    // -----------------------------------------------------------------

    /// Accept a workflow request: persist the workflow, consult the
    /// oracle, and insert the initial DAG. An oracle failure or invalid
    /// plan fails the workflow without tasks; the workflow id is returned
    /// either way so callers can inspect the outcome.
    pub async fn submit(&self, prompt: &str) -> Result<Uuid> {
        let workflow = workflow_db::create_workflow(&self.pool, prompt).await?;
        let workflow_id = workflow.workflow_id;
        info!(workflow_id = %workflow_id, "workflow admitted");

        let planned = match self.planner.plan_initial(prompt).await {
            Ok(planned) => planned,
            Err(e) => {
                warn!(workflow_id = %workflow_id, error = %e, "initial planning failed");
                workflow_db::fail_workflow(&self.pool, workflow_id).await?;
                return Ok(workflow_id);
            }
        };

        if let Err(e) = validate_plan(&planned, &self.config.known_executor_types) {
            warn!(workflow_id = %workflow_id, error = %e, "initial plan rejected");
            workflow_db::fail_workflow(&self.pool, workflow_id).await?;
            return Ok(workflow_id);
        }

        let new_tasks = materialize_plan(&planned);
        match task_db::insert_tasks(&self.pool, workflow_id, &new_tasks).await {
            Ok(tasks) => {
                info!(
                    workflow_id = %workflow_id,
                    task_count = tasks.len(),
                    "initial DAG persisted"
                );
            }
            Err(e @ (StoreError::CycleDetected(_) | StoreError::DanglingDependency { .. })) => {
                warn!(workflow_id = %workflow_id, error = %e, "initial DAG rejected by store");
                workflow_db::fail_workflow(&self.pool, workflow_id).await?;
            }
            Err(e) => return Err(e).context("failed to persist initial DAG"),
        }

        Ok(workflow_id)
    }

    // -----------------------------------------------------------------
    // Dispatch loop
    // -----------------------------------------------------------------

    /// One dispatch pass: publish every ready task. Returns how many were
    /// dispatched.
    pub async fn dispatch_once(&self) -> Result<usize> {
        let ready = task_db::ready_tasks(&self.pool, self.config.dispatch_batch).await?;
        let mut dispatched = 0;

        for task in ready {
            let seq = task_db::next_dispatch_seq(&self.pool).await?;
            match task_db::mark_dispatched(&self.pool, task.task_id, seq).await {
                Ok(()) => {}
                Err(StoreError::Conflict { .. }) => {
                    // Another replica got here first.
                    debug!(task_id = %task.task_id, "dispatch conflict, skipping");
                    continue;
                }
                Err(e) => return Err(e).context("failed to mark task dispatched"),
            }

            self.publish_dispatch(&task, seq).await?;
            dispatched += 1;
            debug!(task_id = %task.task_id, seq, "task dispatched");
        }

        Ok(dispatched)
    }

    /// Run the dispatch loop until cancelled.
    pub async fn run_dispatch_loop(&self, cancel: CancellationToken) -> Result<()> {
        info!("dispatch loop started");
        let mut backoff = self.config.polling_interval;
        while !cancel.is_cancelled() {
            match self.dispatch_once().await {
                Ok(count) => {
                    backoff = self.config.polling_interval;
                    if count > 0 {
                        // Keep draining while there is work.
                        continue;
                    }
                }
                Err(e) => {
                    warn!(error = %e, "dispatch pass failed, backing off");
                    backoff = (backoff * 2).min(Duration::from_secs(30));
                }
            }
            sleep_or_cancel(backoff, &cancel).await;
        }
        info!("dispatch loop stopped");
        Ok(())
    }

    /// Publish a dispatch envelope for a task.
    ///
    /// The envelope lands on `task.<executor_type>` and on
    /// `task.cap.<capability>` for every required capability beyond the
    /// executor type itself (executor queues bind both forms).
    async fn publish_dispatch(&self, task: &Task, dispatch_seq: i64) -> Result<()> {
        let capabilities = capabilities_for(task);
        let envelope = DispatchEnvelope {
            task_id: task.task_id,
            workflow_id: task.workflow_id,
            executor_type: task.executor_type.clone(),
            parameters: task.parameters.clone(),
            capabilities: capabilities.clone(),
            dispatch_seq,
        };
        let payload = serde_json::to_value(&envelope)?;

        self.fabric
            .publish(&dispatch_key(&task.executor_type), &payload)
            .await
            .context("failed to publish dispatch envelope")?;
        for capability in &capabilities {
            if capability != &task.executor_type {
                self.fabric
                    .publish(&capability_key(capability), &payload)
                    .await
                    .context("failed to publish capability dispatch")?;
            }
        }
        Ok(())
    }

    // -----------------------------------------------------------------
    // Supervision loop
    // -----------------------------------------------------------------

    /// One supervision pass: reap, backfill evaluations, correct
    /// failures, republish lost dispatches, finalize resting workflows.
    pub async fn supervise_once(&self) -> Result<()> {
        // 1. Reap expired claims. Flips back to `dispatched` get their
        //    envelope republished; flips to `failed` reach correction via
        //    the synthesized evaluation below.
        let reaped =
            task_db::reap_expired_claims(&self.pool, Utc::now(), self.config.max_retries).await?;
        for reaped_task in &reaped {
            info!(
                task_id = %reaped_task.task_id,
                status = %reaped_task.status,
                retries = reaped_task.retries,
                "expired claim reaped"
            );
            if reaped_task.status == TaskStatus::Dispatched {
                if let Some(task) = task_db::get_task(&self.pool, reaped_task.task_id).await? {
                    let seq = task.dispatch_seq.unwrap_or_default();
                    self.publish_dispatch(&task, seq).await?;
                }
            }
        }

        // 2. Backfill evaluations for terminal tasks whose envelope never
        //    arrived (idempotent against a late envelope).
        let unevaluated = task_db::unevaluated_terminal_tasks(
            &self.pool,
            self.config.evaluation_grace.as_secs_f64(),
        )
        .await?;
        for task in &unevaluated {
            if evaluator::evaluate_task(&self.pool, task, &self.evaluator_config).await? {
                info!(task_id = %task.task_id, "evaluation synthesized from durable state");
            }
        }

        // 3. Correct evaluated failures.
        let failures = task_db::failed_tasks_ready_for_correction(&self.pool).await?;
        for failed in failures {
            self.handle_failed_task(&failed).await?;
        }

        // 4. Republish dispatches nobody claimed.
        let stale = task_db::stale_dispatched_tasks(
            &self.pool,
            self.config.redispatch_grace.as_secs_f64(),
        )
        .await?;
        for task in &stale {
            let seq = task.dispatch_seq.unwrap_or_default();
            warn!(task_id = %task.task_id, "republishing unclaimed dispatch");
            self.publish_dispatch(task, seq).await?;
        }

        // 5. Finalize workflows whose tasks have all come to rest.
        let ready = workflow_db::workflows_ready_to_finalize(&self.pool).await?;
        for workflow_id in ready {
            match workflow_db::finalize_workflow(&self.pool, workflow_id).await {
                Ok(workflow) => {
                    info!(
                        workflow_id = %workflow_id,
                        final_status = %workflow.final_status,
                        total_reward = workflow.total_reward as f64,
                        "workflow finalized"
                    );
                }
                Err(StoreError::InvariantViolation(detail)) => {
                    // Lost a race with a replica or a late dispatch.
                    debug!(workflow_id = %workflow_id, detail = %detail, "finalize skipped");
                }
                Err(e) => return Err(e).context("failed to finalize workflow"),
            }
        }

        Ok(())
    }

    /// Run the supervision loop until cancelled.
    pub async fn run_supervision_loop(&self, cancel: CancellationToken) -> Result<()> {
        info!("supervision loop started");
        let mut backoff = self.config.polling_interval;
        while !cancel.is_cancelled() {
            match self.supervise_once().await {
                Ok(()) => backoff = self.config.polling_interval,
                Err(e) => {
                    warn!(error = %e, "supervision pass failed, backing off");
                    backoff = (backoff * 2).min(Duration::from_secs(30));
                }
            }
            sleep_or_cancel(backoff, &cancel).await;
        }
        info!("supervision loop stopped");
        Ok(())
    }

    /// Run both loops until cancelled.
    pub async fn run(&self, cancel: CancellationToken) -> Result<()> {
        let (dispatch, supervision) = tokio::join!(
            self.run_dispatch_loop(cancel.clone()),
            self.run_supervision_loop(cancel.clone()),
        );
        dispatch?;
        supervision?;
        Ok(())
    }
}

/// Allocate ids for a validated plan and resolve local-index dependencies.
fn materialize_plan(planned: &[crate::oracle::PlannedTask]) -> Vec<NewTask> {
    let ids: Vec<Uuid> = planned.iter().map(|_| Uuid::new_v4()).collect();
    planned
        .iter()
        .enumerate()
        .map(|(i, task)| NewTask {
            task_id: ids[i],
            description: task.description.clone(),
            executor_type: task.executor_type.clone(),
            parameters: task.parameters.clone(),
            dependencies: task.dependencies.iter().map(|&dep| ids[dep]).collect(),
            task_order: i as i32,
        })
        .collect()
}

/// Required capabilities for a task: an explicit `capabilities` array in
/// the parameters, or the executor type alone.
fn capabilities_for(task: &Task) -> Vec<String> {
    task.parameters
        .get("capabilities")
        .and_then(|caps| caps.as_array())
        .map(|caps| {
            caps.iter()
                .filter_map(|c| c.as_str().map(str::to_owned))
                .collect()
        })
        .filter(|caps: &Vec<String>| !caps.is_empty())
        .unwrap_or_else(|| vec![task.executor_type.clone()])
}

async fn sleep_or_cancel(duration: Duration, cancel: &CancellationToken) {
    tokio::select! {
        _ = tokio::time::sleep(duration) => {}
        _ = cancel.cancelled() => {}
    }
}
