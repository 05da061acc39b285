//! Database query functions for the `workflows` table, including
//! finalization and cancellation (both multi-row transactions).

use sqlx::PgPool;
use uuid::Uuid;

use crate::error::{StoreError, StoreResult};
use crate::models::{Workflow, WorkflowStatus};

/// Create a workflow for a user prompt. Starts in `in_progress`.
pub async fn create_workflow(pool: &PgPool, prompt: &str) -> StoreResult<Workflow> {
    let workflow = sqlx::query_as::<_, Workflow>(
        "INSERT INTO workflows (prompt) VALUES ($1) RETURNING *",
    )
    .bind(prompt)
    .fetch_one(pool)
    .await?;

    Ok(workflow)
}

/// Fetch a single workflow by ID.
pub async fn get_workflow(pool: &PgPool, id: Uuid) -> StoreResult<Option<Workflow>> {
    let workflow =
        sqlx::query_as::<_, Workflow>("SELECT * FROM workflows WHERE workflow_id = $1")
            .bind(id)
            .fetch_optional(pool)
            .await?;

    Ok(workflow)
}

/// List all workflows, newest first.
pub async fn list_workflows(pool: &PgPool) -> StoreResult<Vec<Workflow>> {
    let workflows =
        sqlx::query_as::<_, Workflow>("SELECT * FROM workflows ORDER BY created_at DESC")
            .fetch_all(pool)
            .await?;

    Ok(workflows)
}

/// Add a task's reward into the workflow's running total.
///
/// Used by the evaluator's per-task transaction; [`finalize_workflow`]
/// recomputes the exact sum at the end.
pub async fn add_reward(
    tx: &mut sqlx::PgConnection,
    workflow_id: Uuid,
    reward: f32,
) -> StoreResult<()> {
    sqlx::query(
        "UPDATE workflows SET total_reward = total_reward + $1 WHERE workflow_id = $2",
    )
    .bind(reward)
    .bind(workflow_id)
    .execute(tx)
    .await?;

    Ok(())
}

/// Workflows that are still `in_progress` but whose tasks have all come to
/// rest: no task is pending, dispatched, in progress, or failed, every
/// succeeded task has been evaluated, and at least one task exists. These
/// are ready for [`finalize_workflow`].
///
/// Failed tasks keep a workflow out of this set: they are either awaiting
/// evaluation, awaiting correction, or the supervision loop fails the
/// workflow explicitly. Unevaluated succeeded tasks also block
/// finalization so rewards and experience records land before the total
/// is computed; the supervision loop synthesizes any evaluation whose
/// envelope was lost.
pub async fn workflows_ready_to_finalize(pool: &PgPool) -> StoreResult<Vec<Uuid>> {
    let rows: Vec<(Uuid,)> = sqlx::query_as(
        "SELECT w.workflow_id \
         FROM workflows w \
         WHERE w.final_status = 'in_progress' \
           AND EXISTS (SELECT 1 FROM tasks t WHERE t.workflow_id = w.workflow_id) \
           AND NOT EXISTS ( \
               SELECT 1 FROM tasks t \
               WHERE t.workflow_id = w.workflow_id \
                 AND (t.status IN ('pending', 'dispatched', 'in_progress', 'failed') \
                      OR (t.status = 'succeeded' AND t.feedback_notes IS NULL)) \
           )",
    )
    .fetch_all(pool)
    .await?;

    Ok(rows.into_iter().map(|(id,)| id).collect())
}

/// Finalize a workflow: compute `final_status` and the exact `total_reward`.
///
/// Allowed only when every task is terminal or paused. The final status is
/// `failed` when any task ended `failed`, otherwise `succeeded`. The total
/// reward is recomputed as the sum over terminal tasks (succeeded, failed,
/// cancelled); paused rows carry audit history only.
pub async fn finalize_workflow(pool: &PgPool, workflow_id: Uuid) -> StoreResult<Workflow> {
    let mut tx = pool.begin().await?;

    let live: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM tasks \
         WHERE workflow_id = $1 AND status IN ('pending', 'dispatched', 'in_progress')",
    )
    .bind(workflow_id)
    .fetch_one(&mut *tx)
    .await?;

    if live > 0 {
        return Err(StoreError::InvariantViolation(format!(
            "cannot finalize workflow {workflow_id}: {live} tasks still live"
        )));
    }

    let failed: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM tasks WHERE workflow_id = $1 AND status = 'failed'",
    )
    .bind(workflow_id)
    .fetch_one(&mut *tx)
    .await?;

    let total: f32 = sqlx::query_scalar(
        "SELECT COALESCE(SUM(reward), 0)::real FROM tasks \
         WHERE workflow_id = $1 AND status IN ('succeeded', 'failed', 'cancelled')",
    )
    .bind(workflow_id)
    .fetch_one(&mut *tx)
    .await?;

    let final_status = if failed > 0 {
        WorkflowStatus::Failed
    } else {
        WorkflowStatus::Succeeded
    };

    let workflow = sqlx::query_as::<_, Workflow>(
        "UPDATE workflows \
         SET final_status = $1, total_reward = $2, finalized_at = NOW() \
         WHERE workflow_id = $3 AND final_status = 'in_progress' \
         RETURNING *",
    )
    .bind(final_status)
    .bind(total)
    .bind(workflow_id)
    .fetch_optional(&mut *tx)
    .await?
    .ok_or_else(|| {
        StoreError::InvariantViolation(format!(
            "workflow {workflow_id} is not in_progress or does not exist"
        ))
    })?;

    tx.commit().await?;
    Ok(workflow)
}

/// Fail a workflow outright: cancel every live task and mark the workflow
/// `failed`.
///
/// Used when admission, the planner oracle, or surgery fails; sibling
/// branches that were still running are cancelled rather than left to
/// finish into a dead workflow.
pub async fn fail_workflow(pool: &PgPool, workflow_id: Uuid) -> StoreResult<()> {
    terminate_workflow(pool, workflow_id, WorkflowStatus::Failed).await
}

/// Cancel a workflow explicitly: cancel every live task and mark the
/// workflow `cancelled`. Paused rows are preserved for audit.
pub async fn cancel_workflow(pool: &PgPool, workflow_id: Uuid) -> StoreResult<()> {
    terminate_workflow(pool, workflow_id, WorkflowStatus::Cancelled).await
}

async fn terminate_workflow(
    pool: &PgPool,
    workflow_id: Uuid,
    final_status: WorkflowStatus,
) -> StoreResult<()> {
    let mut tx = pool.begin().await?;

    let updated = sqlx::query(
        "UPDATE workflows \
         SET final_status = $1, finalized_at = NOW() \
         WHERE workflow_id = $2 AND final_status = 'in_progress'",
    )
    .bind(final_status)
    .bind(workflow_id)
    .execute(&mut *tx)
    .await?;

    if updated.rows_affected() == 0 {
        return Err(StoreError::InvariantViolation(format!(
            "workflow {workflow_id} is not in_progress or does not exist"
        )));
    }

    sqlx::query(
        "UPDATE tasks \
         SET status = 'cancelled', \
             claim_token = NULL, claimed_by = NULL, claim_expires_at = NULL, \
             last_update_at = NOW() \
         WHERE workflow_id = $1 AND status IN ('pending', 'dispatched', 'in_progress')",
    )
    .bind(workflow_id)
    .execute(&mut *tx)
    .await?;

    // Lock in the reward total for whatever did reach a terminal state.
    sqlx::query(
        "UPDATE workflows \
         SET total_reward = ( \
             SELECT COALESCE(SUM(reward), 0)::real FROM tasks \
             WHERE workflow_id = $1 AND status IN ('succeeded', 'failed', 'cancelled') \
         ) \
         WHERE workflow_id = $1",
    )
    .bind(workflow_id)
    .execute(&mut *tx)
    .await?;

    tx.commit().await?;
    Ok(())
}
