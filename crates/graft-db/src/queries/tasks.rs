//! Database query functions for the `tasks` and `task_dependencies` tables.
//!
//! `ready_tasks` and `claim` together form the scheduling kernel; both are
//! safe under concurrent orchestrator and executor activity because every
//! transition is an optimistic conditional UPDATE. `surgery` is the one
//! multi-statement graph mutation and re-verifies acyclicity on the
//! post-image before committing.

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};
use sqlx::{PgConnection, PgPool};
use uuid::Uuid;

use crate::dag;
use crate::error::{StoreError, StoreResult};
use crate::models::{NewTask, Task, TaskStatus};

/// Outcome reported by an executor for a completed handler run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReportOutcome {
    Ok,
    Error,
}

impl ReportOutcome {
    fn as_status(self) -> TaskStatus {
        match self {
            Self::Ok => TaskStatus::Succeeded,
            Self::Error => TaskStatus::Failed,
        }
    }
}

/// A task touched by [`reap_expired_claims`].
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct ReapedTask {
    pub task_id: Uuid,
    pub workflow_id: Uuid,
    pub status: TaskStatus,
    pub retries: i32,
}

// ---------------------------------------------------------------------------
// Insert and fetch
// ---------------------------------------------------------------------------

/// Bulk-insert the tasks of a plan into a workflow.
///
/// Verifies dependency integrity before commit: every edge must point at a
/// task in the same workflow (`DanglingDependency`) and the combined graph
/// of existing and new tasks must stay acyclic (`CycleDetected`).
pub async fn insert_tasks(
    pool: &PgPool,
    workflow_id: Uuid,
    new_tasks: &[NewTask],
) -> StoreResult<Vec<Task>> {
    let mut tx = pool.begin().await?;
    let inserted = insert_tasks_in_tx(&mut tx, workflow_id, new_tasks, 0, None, 0).await?;
    verify_acyclic_in_tx(&mut tx, workflow_id).await?;
    tx.commit().await?;
    Ok(inserted)
}

/// Shared insert body used by [`insert_tasks`] and [`surgery`].
///
/// Validates edges against the union of existing workflow tasks and the
/// batch itself, then inserts rows and edges. Does NOT run the acyclicity
/// check; callers do that once on the final post-image.
async fn insert_tasks_in_tx(
    tx: &mut PgConnection,
    workflow_id: Uuid,
    new_tasks: &[NewTask],
    correction_generation: i32,
    parent_task_id: Option<Uuid>,
    retries: i32,
) -> StoreResult<Vec<Task>> {
    let existing: Vec<(Uuid,)> =
        sqlx::query_as("SELECT task_id FROM tasks WHERE workflow_id = $1")
            .bind(workflow_id)
            .fetch_all(&mut *tx)
            .await?;

    let mut nodes: HashSet<Uuid> = existing.into_iter().map(|(id,)| id).collect();
    for task in new_tasks {
        nodes.insert(task.task_id);
    }

    let new_edges: Vec<(Uuid, Uuid)> = new_tasks
        .iter()
        .flat_map(|t| t.dependencies.iter().map(|d| (t.task_id, *d)))
        .collect();
    dag::check_edges(&nodes, &new_edges)?;

    let mut inserted = Vec::with_capacity(new_tasks.len());
    for task in new_tasks {
        let row = sqlx::query_as::<_, Task>(
            "INSERT INTO tasks (task_id, workflow_id, parent_task_id, description, \
                                executor_type, parameters, task_order, \
                                correction_generation, retries) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9) \
             RETURNING *",
        )
        .bind(task.task_id)
        .bind(workflow_id)
        .bind(parent_task_id)
        .bind(&task.description)
        .bind(&task.executor_type)
        .bind(&task.parameters)
        .bind(task.task_order)
        .bind(correction_generation)
        .bind(retries)
        .fetch_one(&mut *tx)
        .await?;
        inserted.push(row);
    }

    for (task_id, depends_on) in &new_edges {
        sqlx::query(
            "INSERT INTO task_dependencies (task_id, depends_on) VALUES ($1, $2) \
             ON CONFLICT DO NOTHING",
        )
        .bind(task_id)
        .bind(depends_on)
        .execute(&mut *tx)
        .await?;
    }

    Ok(inserted)
}

/// Re-verify acyclicity over a workflow's full dependency graph inside a
/// transaction. Cancelled tasks are excluded per the acyclicity property.
async fn verify_acyclic_in_tx(tx: &mut PgConnection, workflow_id: Uuid) -> StoreResult<()> {
    let node_rows: Vec<(Uuid,)> = sqlx::query_as(
        "SELECT task_id FROM tasks WHERE workflow_id = $1 AND status != 'cancelled'",
    )
    .bind(workflow_id)
    .fetch_all(&mut *tx)
    .await?;
    let nodes: HashSet<Uuid> = node_rows.into_iter().map(|(id,)| id).collect();

    let edge_rows: Vec<(Uuid, Uuid)> = sqlx::query_as(
        "SELECT td.task_id, td.depends_on \
         FROM task_dependencies td \
         JOIN tasks t ON t.task_id = td.task_id \
         WHERE t.workflow_id = $1",
    )
    .bind(workflow_id)
    .fetch_all(&mut *tx)
    .await?;

    dag::ensure_acyclic(&nodes, &edge_rows)
}

/// Fetch a single task by ID.
pub async fn get_task(pool: &PgPool, id: Uuid) -> StoreResult<Option<Task>> {
    let task = sqlx::query_as::<_, Task>("SELECT * FROM tasks WHERE task_id = $1")
        .bind(id)
        .fetch_optional(pool)
        .await?;

    Ok(task)
}

/// List all tasks for a workflow in `task_order`, then creation order.
pub async fn list_tasks_for_workflow(pool: &PgPool, workflow_id: Uuid) -> StoreResult<Vec<Task>> {
    let tasks = sqlx::query_as::<_, Task>(
        "SELECT * FROM tasks WHERE workflow_id = $1 ORDER BY task_order, created_at",
    )
    .bind(workflow_id)
    .fetch_all(pool)
    .await?;

    Ok(tasks)
}

/// Get the IDs of all tasks that a given task depends on.
pub async fn get_task_dependencies(pool: &PgPool, task_id: Uuid) -> StoreResult<Vec<Uuid>> {
    let rows: Vec<(Uuid,)> =
        sqlx::query_as("SELECT depends_on FROM task_dependencies WHERE task_id = $1")
            .bind(task_id)
            .fetch_all(pool)
            .await?;

    Ok(rows.into_iter().map(|(id,)| id).collect())
}

/// Dependency edges for an entire workflow, as a task -> dependencies map.
pub async fn dependency_map(
    pool: &PgPool,
    workflow_id: Uuid,
) -> StoreResult<HashMap<Uuid, Vec<Uuid>>> {
    let rows: Vec<(Uuid, Uuid)> = sqlx::query_as(
        "SELECT td.task_id, td.depends_on \
         FROM task_dependencies td \
         JOIN tasks t ON t.task_id = td.task_id \
         WHERE t.workflow_id = $1",
    )
    .bind(workflow_id)
    .fetch_all(pool)
    .await?;

    let mut map: HashMap<Uuid, Vec<Uuid>> = HashMap::new();
    for (task_id, dep) in rows {
        map.entry(task_id).or_default().push(dep);
    }
    Ok(map)
}

// ---------------------------------------------------------------------------
// Scheduling kernel
// ---------------------------------------------------------------------------

/// Tasks eligible for dispatch: `pending`, every dependency `succeeded`,
/// workflow still live. Ordered by `(workflow_id, task_order)`, bounded by
/// `limit`.
pub async fn ready_tasks(pool: &PgPool, limit: i64) -> StoreResult<Vec<Task>> {
    let tasks = sqlx::query_as::<_, Task>(
        "SELECT t.* \
         FROM tasks t \
         JOIN workflows w ON w.workflow_id = t.workflow_id \
         WHERE t.status = 'pending' \
           AND w.final_status = 'in_progress' \
           AND NOT EXISTS ( \
               SELECT 1 FROM task_dependencies td \
               JOIN tasks dep ON dep.task_id = td.depends_on \
               WHERE td.task_id = t.task_id AND dep.status != 'succeeded' \
           ) \
         ORDER BY t.workflow_id, t.task_order \
         LIMIT $1",
    )
    .bind(limit)
    .fetch_all(pool)
    .await?;

    Ok(tasks)
}

/// Allocate the next value of the global dispatch sequence.
pub async fn next_dispatch_seq(pool: &PgPool) -> StoreResult<i64> {
    let seq: i64 = sqlx::query_scalar("SELECT nextval('dispatch_seq')")
        .fetch_one(pool)
        .await?;
    Ok(seq)
}

/// Transition `pending -> dispatched`, recording the dispatch sequence.
///
/// Returns `Conflict` when the task is no longer pending (another
/// orchestrator replica handled it, or the workflow was cancelled).
pub async fn mark_dispatched(pool: &PgPool, task_id: Uuid, dispatch_seq: i64) -> StoreResult<()> {
    let result = sqlx::query(
        "UPDATE tasks \
         SET status = 'dispatched', dispatch_seq = $1, last_update_at = NOW() \
         WHERE task_id = $2 AND status = 'pending'",
    )
    .bind(dispatch_seq)
    .bind(task_id)
    .execute(pool)
    .await?;

    if result.rows_affected() == 0 {
        return Err(StoreError::Conflict {
            task_id,
            detail: "not pending at dispatch".into(),
        });
    }

    Ok(())
}

/// Atomically claim a dispatched task for an executor.
///
/// Transitions `dispatched -> in_progress` and records a fresh claim token,
/// the claimer, and the lease expiry. Returns the token, or `Conflict` when
/// the task is not currently `dispatched` (someone else owns it, or it was
/// never published).
pub async fn claim(
    pool: &PgPool,
    task_id: Uuid,
    executor_id: &str,
    lease_secs: f64,
) -> StoreResult<String> {
    let token = new_claim_token();

    let result = sqlx::query(
        "UPDATE tasks \
         SET status = 'in_progress', \
             claim_token = $1, \
             claimed_by = $2, \
             claim_expires_at = NOW() + make_interval(secs => $3), \
             last_update_at = NOW() \
         WHERE task_id = $4 AND status = 'dispatched'",
    )
    .bind(&token)
    .bind(executor_id)
    .bind(lease_secs)
    .bind(task_id)
    .execute(pool)
    .await?;

    if result.rows_affected() == 0 {
        return Err(StoreError::Conflict {
            task_id,
            detail: "not dispatched at claim".into(),
        });
    }

    Ok(token)
}

/// Extend a live claim's lease (executor heartbeat).
///
/// Returns `StaleClaim` when the token no longer matches or the lease has
/// already expired; the reaper won that race and the executor must cancel
/// its handler.
pub async fn renew_claim(
    pool: &PgPool,
    task_id: Uuid,
    claim_token: &str,
    lease_secs: f64,
) -> StoreResult<()> {
    let result = sqlx::query(
        "UPDATE tasks \
         SET claim_expires_at = NOW() + make_interval(secs => $1), \
             last_update_at = NOW() \
         WHERE task_id = $2 AND status = 'in_progress' \
           AND claim_token = $3 AND claim_expires_at > NOW()",
    )
    .bind(lease_secs)
    .bind(task_id)
    .bind(claim_token)
    .execute(pool)
    .await?;

    if result.rows_affected() == 0 {
        return Err(StoreError::StaleClaim { task_id });
    }

    Ok(())
}

/// Report a handler outcome under the claim token.
///
/// Verifies the token still matches and the lease has not expired, then
/// transitions `in_progress -> succeeded|failed`, stores the raw payload,
/// and clears the claim. At most one report per task ever succeeds; every
/// other attempt observes `StaleClaim`.
pub async fn report(
    pool: &PgPool,
    task_id: Uuid,
    claim_token: &str,
    outcome: ReportOutcome,
    payload: &serde_json::Value,
    duration_ms: i64,
) -> StoreResult<()> {
    let result = sqlx::query(
        "UPDATE tasks \
         SET status = $1, \
             result_payload = $2, \
             duration_ms = $3, \
             claim_token = NULL, claimed_by = NULL, claim_expires_at = NULL, \
             last_update_at = NOW() \
         WHERE task_id = $4 AND status = 'in_progress' \
           AND claim_token = $5 AND claim_expires_at > NOW()",
    )
    .bind(outcome.as_status())
    .bind(payload)
    .bind(duration_ms)
    .bind(task_id)
    .bind(claim_token)
    .execute(pool)
    .await?;

    if result.rows_affected() == 0 {
        return Err(StoreError::StaleClaim { task_id });
    }

    Ok(())
}

/// Recover tasks whose claim lease has expired.
///
/// Expired claims flip back to `dispatched` with `retries + 1` so the task
/// can be re-claimed, or to `failed` when the retry budget is exhausted.
/// Either way the claim is cleared. Returns the affected tasks.
///
/// The conditional predicate (`claim_expires_at <= now`) makes the race
/// with heartbeat renewal safe: either renewal pushed the expiry out first
/// or the reaper clears the claim and the renewal observes `StaleClaim`.
pub async fn reap_expired_claims(
    pool: &PgPool,
    now: DateTime<Utc>,
    max_retries: i32,
) -> StoreResult<Vec<ReapedTask>> {
    let mut tx = pool.begin().await?;

    let exhausted = sqlx::query_as::<_, ReapedTask>(
        "UPDATE tasks \
         SET status = 'failed', \
             claim_token = NULL, claimed_by = NULL, claim_expires_at = NULL, \
             last_update_at = NOW() \
         WHERE status = 'in_progress' AND claim_expires_at <= $1 AND retries >= $2 \
         RETURNING task_id, workflow_id, status, retries",
    )
    .bind(now)
    .bind(max_retries)
    .fetch_all(&mut *tx)
    .await?;

    let redispatched = sqlx::query_as::<_, ReapedTask>(
        "UPDATE tasks \
         SET status = 'dispatched', \
             retries = retries + 1, \
             claim_token = NULL, claimed_by = NULL, claim_expires_at = NULL, \
             last_update_at = NOW() \
         WHERE status = 'in_progress' AND claim_expires_at <= $1 AND retries < $2 \
         RETURNING task_id, workflow_id, status, retries",
    )
    .bind(now)
    .bind(max_retries)
    .fetch_all(&mut *tx)
    .await?;

    tx.commit().await?;

    let mut reaped = exhausted;
    reaped.extend(redispatched);
    Ok(reaped)
}

// ---------------------------------------------------------------------------
// DAG surgery
// ---------------------------------------------------------------------------

/// Splice a correction into a running workflow, atomically.
///
/// In one transaction: verifies the failed task is `failed`, inserts the
/// corrective tasks at `correction_generation + 1` with
/// `parent_task_id = failed_task_id`, inserts the retry task depending on
/// the terminal nodes of the corrective sub-DAG, rewires every dependant of
/// the failed task onto the retry task, pauses the failed task, and
/// re-verifies acyclicity on the post-image before commit.
///
/// Returns the inserted tasks (correctives first, retry last).
pub async fn surgery(
    pool: &PgPool,
    workflow_id: Uuid,
    failed_task_id: Uuid,
    corrective_tasks: &[NewTask],
    retry_task: &NewTask,
) -> StoreResult<Vec<Task>> {
    // Corrective tasks may depend on each other and on succeeded
    // predecessors, never on the task they are repairing: that edge would
    // be rewired onto the retry task and close a cycle.
    for corrective in corrective_tasks {
        if corrective.dependencies.contains(&failed_task_id) {
            return Err(StoreError::InvariantViolation(format!(
                "corrective task {} depends on the failed task it repairs",
                corrective.task_id
            )));
        }
    }

    let mut tx = pool.begin().await?;

    let failed = sqlx::query_as::<_, Task>(
        "SELECT * FROM tasks WHERE task_id = $1 AND workflow_id = $2 FOR UPDATE",
    )
    .bind(failed_task_id)
    .bind(workflow_id)
    .fetch_optional(&mut *tx)
    .await?
    .ok_or(StoreError::NotFound {
        entity: "task",
        id: failed_task_id,
    })?;

    if failed.status != TaskStatus::Failed {
        return Err(StoreError::InvariantViolation(format!(
            "surgery target {} has status {}, expected failed",
            failed_task_id, failed.status
        )));
    }

    let generation = failed.correction_generation + 1;

    let mut inserted = insert_tasks_in_tx(
        &mut tx,
        workflow_id,
        corrective_tasks,
        generation,
        Some(failed_task_id),
        0,
    )
    .await?;

    // Terminal nodes of the corrective sub-DAG: correctives no other
    // corrective depends on. The retry task gates on all of them. With no
    // correctives the retry inherits the failed task's own dependencies.
    let depended_on: HashSet<Uuid> = corrective_tasks
        .iter()
        .flat_map(|t| t.dependencies.iter().copied())
        .collect();
    let mut retry_deps: Vec<Uuid> = corrective_tasks
        .iter()
        .map(|t| t.task_id)
        .filter(|id| !depended_on.contains(id))
        .collect();
    if retry_deps.is_empty() {
        let rows: Vec<(Uuid,)> =
            sqlx::query_as("SELECT depends_on FROM task_dependencies WHERE task_id = $1")
                .bind(failed_task_id)
                .fetch_all(&mut *tx)
                .await?;
        retry_deps = rows.into_iter().map(|(id,)| id).collect();
    }

    let retry = NewTask {
        dependencies: retry_deps,
        ..retry_task.clone()
    };
    let retry_rows = insert_tasks_in_tx(
        &mut tx,
        workflow_id,
        std::slice::from_ref(&retry),
        generation,
        Some(failed_task_id),
        failed.retries + 1,
    )
    .await?;

    // Rewire: every task that depended on the failed task now waits on the
    // retry task instead.
    sqlx::query("UPDATE task_dependencies SET depends_on = $1 WHERE depends_on = $2")
        .bind(retry.task_id)
        .bind(failed_task_id)
        .execute(&mut *tx)
        .await?;

    // Pause the failed task; the row stays for audit.
    sqlx::query(
        "UPDATE tasks SET status = 'paused', last_update_at = NOW() \
         WHERE task_id = $1 AND status = 'failed'",
    )
    .bind(failed_task_id)
    .execute(&mut *tx)
    .await?;

    verify_acyclic_in_tx(&mut tx, workflow_id).await?;

    tx.commit().await?;

    inserted.extend(retry_rows);
    Ok(inserted)
}

// ---------------------------------------------------------------------------
// Supervision queries
// ---------------------------------------------------------------------------

/// Failed tasks whose evaluation has landed and whose workflow is still
/// live; these are the correction candidates, oldest failure first.
pub async fn failed_tasks_ready_for_correction(pool: &PgPool) -> StoreResult<Vec<Task>> {
    let tasks = sqlx::query_as::<_, Task>(
        "SELECT t.* \
         FROM tasks t \
         JOIN workflows w ON w.workflow_id = t.workflow_id \
         WHERE t.status = 'failed' \
           AND t.feedback_notes IS NOT NULL \
           AND w.final_status = 'in_progress' \
         ORDER BY t.last_update_at",
    )
    .fetch_all(pool)
    .await?;

    Ok(tasks)
}

/// Terminal tasks whose evaluation never landed: reaped claims with the
/// retry budget exhausted (no report at all) or an executor crash between
/// report and result publish. After `grace_secs` of silence the
/// supervision loop synthesizes their evaluation from the durable row so
/// feedback, reward, and experience exist for every terminal task.
pub async fn unevaluated_terminal_tasks(
    pool: &PgPool,
    grace_secs: f64,
) -> StoreResult<Vec<Task>> {
    let tasks = sqlx::query_as::<_, Task>(
        "SELECT t.* \
         FROM tasks t \
         JOIN workflows w ON w.workflow_id = t.workflow_id \
         WHERE t.status IN ('succeeded', 'failed') \
           AND t.feedback_notes IS NULL \
           AND t.last_update_at <= NOW() - make_interval(secs => $1) \
           AND w.final_status = 'in_progress'",
    )
    .bind(grace_secs)
    .fetch_all(pool)
    .await?;

    Ok(tasks)
}

/// Dispatched tasks nobody has claimed for `grace_secs`; their fabric
/// message was likely lost or dead-lettered. The supervision loop
/// republishes their dispatch envelope (same `dispatch_seq`, so consumers
/// deduplicate).
pub async fn stale_dispatched_tasks(pool: &PgPool, grace_secs: f64) -> StoreResult<Vec<Task>> {
    let tasks = sqlx::query_as::<_, Task>(
        "SELECT t.* \
         FROM tasks t \
         JOIN workflows w ON w.workflow_id = t.workflow_id \
         WHERE t.status = 'dispatched' \
           AND t.last_update_at <= NOW() - make_interval(secs => $1) \
           AND w.final_status = 'in_progress'",
    )
    .bind(grace_secs)
    .fetch_all(pool)
    .await?;

    Ok(tasks)
}

/// Succeeded tasks of a workflow in original topological order; the
/// correction context sends these to the planner as prior outcomes.
pub async fn succeeded_tasks(pool: &PgPool, workflow_id: Uuid) -> StoreResult<Vec<Task>> {
    let tasks = sqlx::query_as::<_, Task>(
        "SELECT * FROM tasks \
         WHERE workflow_id = $1 AND status = 'succeeded' \
         ORDER BY task_order, created_at",
    )
    .bind(workflow_id)
    .fetch_all(pool)
    .await?;

    Ok(tasks)
}

/// Generate an opaque claim token.
fn new_claim_token() -> String {
    let bytes: [u8; 16] = rand::random();
    hex::encode(bytes)
}
