//! Evaluation recording and the append-only experience log.
//!
//! `record_evaluation` is the evaluator's single write path: one
//! transaction that finalizes a task's outcome, bumps the workflow's
//! running reward total, and appends the experience record. The write is
//! conditional on `feedback_notes IS NULL`, so a replayed result envelope
//! is a no-op after the first successful processing.

use sqlx::PgPool;
use uuid::Uuid;

use crate::error::StoreResult;
use crate::models::{Experience, TaskStatus};
use crate::queries::workflows;

/// The evaluator's verdict for a task, ready to persist.
#[derive(Debug, Clone)]
pub struct Evaluation {
    /// Final status: `Succeeded` or `Failed` (a validator may overturn an
    /// executor's `ok` into `Failed`).
    pub status: TaskStatus,
    pub reward: f32,
    pub feedback: serde_json::Value,
    pub state_snapshot: serde_json::Value,
    pub action_snapshot: serde_json::Value,
}

/// Persist an evaluation exactly once.
///
/// Returns `true` when this call applied the evaluation, `false` when the
/// task was already evaluated (or does not exist) and nothing changed.
pub async fn record_evaluation(
    pool: &PgPool,
    task_id: Uuid,
    evaluation: &Evaluation,
) -> StoreResult<bool> {
    debug_assert!(matches!(
        evaluation.status,
        TaskStatus::Succeeded | TaskStatus::Failed
    ));

    let mut tx = pool.begin().await?;

    let row: Option<(Uuid,)> = sqlx::query_as(
        "UPDATE tasks \
         SET status = $1, reward = $2, feedback_notes = $3, last_update_at = NOW() \
         WHERE task_id = $4 \
           AND feedback_notes IS NULL \
           AND status IN ('succeeded', 'failed') \
         RETURNING workflow_id",
    )
    .bind(evaluation.status)
    .bind(evaluation.reward)
    .bind(&evaluation.feedback)
    .bind(task_id)
    .fetch_optional(&mut *tx)
    .await?;

    let Some((workflow_id,)) = row else {
        // Idempotent redelivery, or the task vanished; either way, drop.
        return Ok(false);
    };

    workflows::add_reward(&mut tx, workflow_id, evaluation.reward).await?;

    insert_experience(
        &mut tx,
        &NewExperience {
            workflow_id,
            task_id,
            state_snapshot: evaluation.state_snapshot.clone(),
            action_snapshot: evaluation.action_snapshot.clone(),
            reward: evaluation.reward,
        },
    )
    .await?;

    tx.commit().await?;
    Ok(true)
}

/// An experience record ready to append.
#[derive(Debug, Clone)]
pub struct NewExperience {
    pub workflow_id: Uuid,
    pub task_id: Uuid,
    pub state_snapshot: serde_json::Value,
    pub action_snapshot: serde_json::Value,
    pub reward: f32,
}

/// Append an experience record. Append-only: a record already present for
/// the task is left untouched.
pub async fn write_experience(pool: &PgPool, record: &NewExperience) -> StoreResult<()> {
    let mut conn = pool.acquire().await?;
    insert_experience(&mut conn, record).await
}

async fn insert_experience(
    conn: &mut sqlx::PgConnection,
    record: &NewExperience,
) -> StoreResult<()> {
    sqlx::query(
        "INSERT INTO experiences (workflow_id, task_id, state_snapshot, action_snapshot, reward) \
         VALUES ($1, $2, $3, $4, $5) \
         ON CONFLICT (task_id) DO NOTHING",
    )
    .bind(record.workflow_id)
    .bind(record.task_id)
    .bind(&record.state_snapshot)
    .bind(&record.action_snapshot)
    .bind(record.reward)
    .execute(conn)
    .await?;

    Ok(())
}

/// List a workflow's experience records, oldest first.
pub async fn list_for_workflow(pool: &PgPool, workflow_id: Uuid) -> StoreResult<Vec<Experience>> {
    let records = sqlx::query_as::<_, Experience>(
        "SELECT * FROM experiences WHERE workflow_id = $1 ORDER BY recorded_at",
    )
    .bind(workflow_id)
    .fetch_all(pool)
    .await?;

    Ok(records)
}

/// Fetch the experience record for a task, if one has been written.
pub async fn get_for_task(pool: &PgPool, task_id: Uuid) -> StoreResult<Option<Experience>> {
    let record =
        sqlx::query_as::<_, Experience>("SELECT * FROM experiences WHERE task_id = $1")
            .bind(task_id)
            .fetch_optional(pool)
            .await?;

    Ok(record)
}
