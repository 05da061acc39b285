//! Failure correction: context gathering, oracle consultation, and DAG
//! surgery.
//!
//! Correction depth is bounded, and the oracle is not trusted: the
//! proposed plan is validated locally, the retry task must be recognized
//! as a genuine retry of the failure, and a failure that repeats
//! identically ends the workflow instead of looping.

use anyhow::{Context, Result};
use tracing::{info, warn};
use uuid::Uuid;

use graft_db::StoreError;
use graft_db::models::{NewTask, Task};
use graft_db::queries::{tasks as task_db, workflows as workflow_db};

use crate::oracle::{
    CompletedSibling, CorrectionContext, CorrectionPlan, is_retry_of, validate_plan,
};

use super::Orchestrator;

impl Orchestrator {
    /// Drive one failed task through the correction pipeline.
    ///
    /// Terminal outcomes (depth exhausted, repeated failure, oracle
    /// refusal, invalid plan, surgery rejection) fail the workflow;
    /// transient store errors propagate so the supervision loop retries.
    pub(crate) async fn handle_failed_task(&self, failed: &Task) -> Result<()> {
        let workflow_id = failed.workflow_id;

        // Bound nested corrections.
        if failed.correction_generation >= self.config.max_correction_depth {
            warn!(
                workflow_id = %workflow_id,
                task_id = %failed.task_id,
                generation = failed.correction_generation,
                "correction depth exhausted, failing workflow"
            );
            workflow_db::fail_workflow(&self.pool, workflow_id).await?;
            return Ok(());
        }

        // A retry that failed exactly like the failure it was meant to
        // repair will not be corrected again.
        if self.repeats_parent_failure(failed).await? {
            warn!(
                workflow_id = %workflow_id,
                task_id = %failed.task_id,
                "identical failure repeated, refusing further correction"
            );
            workflow_db::fail_workflow(&self.pool, workflow_id).await?;
            return Ok(());
        }

        let context = self.gather_context(failed).await?;

        let plan = match self.planner.plan_correction(&context).await {
            Ok(plan) => plan,
            Err(e) => {
                warn!(
                    workflow_id = %workflow_id,
                    task_id = %failed.task_id,
                    error = %e,
                    "correction planning failed, failing workflow"
                );
                workflow_db::fail_workflow(&self.pool, workflow_id).await?;
                return Ok(());
            }
        };

        if let Err(e) = self.validate_correction(&plan, failed) {
            warn!(
                workflow_id = %workflow_id,
                task_id = %failed.task_id,
                error = %e,
                "correction plan rejected, failing workflow"
            );
            workflow_db::fail_workflow(&self.pool, workflow_id).await?;
            return Ok(());
        }

        let (corrective_tasks, retry_task) = materialize_correction(&plan, failed);

        match task_db::surgery(
            &self.pool,
            workflow_id,
            failed.task_id,
            &corrective_tasks,
            &retry_task,
        )
        .await
        {
            Ok(inserted) => {
                info!(
                    workflow_id = %workflow_id,
                    failed_task_id = %failed.task_id,
                    corrective_count = corrective_tasks.len(),
                    generation = failed.correction_generation + 1,
                    "correction spliced in"
                );
                debug_assert_eq!(inserted.len(), corrective_tasks.len() + 1);
                Ok(())
            }
            Err(e @ (StoreError::CycleDetected(_) | StoreError::InvariantViolation(_))) => {
                warn!(
                    workflow_id = %workflow_id,
                    failed_task_id = %failed.task_id,
                    error = %e,
                    "surgery rejected, failing workflow"
                );
                workflow_db::fail_workflow(&self.pool, workflow_id).await?;
                Ok(())
            }
            Err(e) => Err(e).context("surgery failed"),
        }
    }

    /// Whether this failed task is a retry that reproduced its parent's
    /// failure exactly: same parameters, same error type, twice in a row.
    async fn repeats_parent_failure(&self, failed: &Task) -> Result<bool> {
        let Some(parent_id) = failed.parent_task_id else {
            return Ok(false);
        };
        let Some(parent) = task_db::get_task(&self.pool, parent_id).await? else {
            return Ok(false);
        };

        Ok(failed.parameters == parent.parameters
            && error_type_of(failed) == error_type_of(&parent)
            && error_type_of(failed).is_some())
    }

    /// Assemble the oracle's view of the failure.
    async fn gather_context(&self, failed: &Task) -> Result<CorrectionContext> {
        let prompt = workflow_db::get_workflow(&self.pool, failed.workflow_id)
            .await?
            .map(|w| w.prompt)
            .unwrap_or_default();

        let succeeded = task_db::succeeded_tasks(&self.pool, failed.workflow_id)
            .await?
            .into_iter()
            .map(|task| CompletedSibling {
                description: task.description,
                executor_type: task.executor_type,
                result: task.result_payload,
            })
            .collect();

        Ok(CorrectionContext {
            prompt,
            failed_description: failed.description.clone(),
            failed_executor_type: failed.executor_type.clone(),
            failed_parameters: failed.parameters.clone(),
            error: failed.feedback_notes.clone().unwrap_or_default(),
            succeeded,
            correction_generation: failed.correction_generation,
        })
    }

    /// Local checks on a proposed correction before it touches the store.
    fn validate_correction(&self, plan: &CorrectionPlan, failed: &Task) -> Result<()> {
        if !plan.corrective_tasks.is_empty() {
            validate_plan(&plan.corrective_tasks, &self.config.known_executor_types)
                .context("corrective sub-DAG invalid")?;
        }

        let known = &self.config.known_executor_types;
        if !known.is_empty() && !known.iter().any(|t| t == &plan.retry_task.executor_type) {
            anyhow::bail!(
                "retry task has unrecognized executor type {:?}",
                plan.retry_task.executor_type
            );
        }

        if !is_retry_of(&plan.retry_task, failed) {
            anyhow::bail!("proposed retry task is not a retry of the failed task");
        }

        Ok(())
    }
}

/// Allocate ids for a correction plan. Corrective dependencies are local
/// indices into the corrective list; the retry task's dependencies are
/// computed by surgery (the corrective sub-DAG's terminal nodes).
fn materialize_correction(plan: &CorrectionPlan, failed: &Task) -> (Vec<NewTask>, NewTask) {
    let ids: Vec<Uuid> = plan.corrective_tasks.iter().map(|_| Uuid::new_v4()).collect();

    let corrective_tasks = plan
        .corrective_tasks
        .iter()
        .enumerate()
        .map(|(i, task)| NewTask {
            task_id: ids[i],
            description: task.description.clone(),
            executor_type: task.executor_type.clone(),
            parameters: task.parameters.clone(),
            dependencies: task.dependencies.iter().map(|&dep| ids[dep]).collect(),
            task_order: failed.task_order,
        })
        .collect();

    let retry_task = NewTask {
        task_id: Uuid::new_v4(),
        description: plan.retry_task.description.clone(),
        executor_type: plan.retry_task.executor_type.clone(),
        parameters: plan.retry_task.parameters.clone(),
        dependencies: Vec::new(),
        task_order: failed.task_order,
    };

    (corrective_tasks, retry_task)
}

/// The structured error type recorded in a task's feedback, if any.
fn error_type_of(task: &Task) -> Option<String> {
    task.feedback_notes
        .as_ref()
        .and_then(|notes| notes.get("error_type"))
        .and_then(|t| t.as_str())
        .map(str::to_owned)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::oracle::PlannedTask;
    use chrono::Utc;
    use graft_db::models::TaskStatus;
    use serde_json::json;

    fn failed_task(parameters: serde_json::Value, error_type: &str) -> Task {
        let now = Utc::now();
        Task {
            task_id: Uuid::new_v4(),
            workflow_id: Uuid::new_v4(),
            parent_task_id: None,
            description: "import data".into(),
            executor_type: "code_executor".into(),
            parameters,
            status: TaskStatus::Failed,
            task_order: 2,
            correction_generation: 0,
            retries: 0,
            reward: -1.0,
            feedback_notes: Some(json!({"status": "failed", "error_type": error_type})),
            result_payload: None,
            duration_ms: None,
            dispatch_seq: None,
            claim_token: None,
            claimed_by: None,
            claim_expires_at: None,
            created_at: now,
            last_update_at: now,
        }
    }

    #[test]
    fn materialize_correction_inherits_order_and_wires_indices() {
        let failed = failed_task(json!({"code": "import foo"}), "ModuleNotFoundError");
        let plan = CorrectionPlan {
            corrective_tasks: vec![
                PlannedTask {
                    description: "install foo".into(),
                    executor_type: "code_executor".into(),
                    parameters: json!({"code": "pip install foo"}),
                    dependencies: vec![],
                },
                PlannedTask {
                    description: "verify install".into(),
                    executor_type: "code_executor".into(),
                    parameters: json!({"code": "import foo"}),
                    dependencies: vec![0],
                },
            ],
            retry_task: PlannedTask {
                description: "retry: import data".into(),
                executor_type: "code_executor".into(),
                parameters: json!({"code": "import foo"}),
                dependencies: vec![],
            },
        };

        let (correctives, retry) = materialize_correction(&plan, &failed);
        assert_eq!(correctives.len(), 2);
        assert_eq!(correctives[1].dependencies, vec![correctives[0].task_id]);
        assert_eq!(correctives[0].task_order, failed.task_order);
        assert_eq!(retry.task_order, failed.task_order);
        assert!(retry.dependencies.is_empty());
    }

    #[test]
    fn error_type_read_from_feedback() {
        let task = failed_task(json!({}), "Timeout");
        assert_eq!(error_type_of(&task), Some("Timeout".to_string()));
    }
}
