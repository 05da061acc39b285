//! Integration tests for the task store: workflow CRUD, the scheduling
//! kernel (ready/dispatch/claim/report), reaping, evaluation recording,
//! and finalization.
//!
//! Each test creates a unique temporary database, runs migrations, and
//! drops it on completion so tests are fully isolated.

use chrono::Utc;
use serde_json::json;
use sqlx::PgPool;
use uuid::Uuid;

use graft_db::StoreError;
use graft_db::models::{NewTask, TaskStatus, WorkflowStatus};
use graft_db::queries::experiences::{self, Evaluation};
use graft_db::queries::tasks::{self, ReportOutcome};
use graft_db::queries::workflows;
use graft_test_utils::{create_test_db, drop_test_db};

// ===========================================================================
// Helpers
// ===========================================================================

fn new_task(description: &str, dependencies: Vec<Uuid>, task_order: i32) -> NewTask {
    NewTask {
        task_id: Uuid::new_v4(),
        description: description.to_string(),
        executor_type: "generic".to_string(),
        parameters: json!({}),
        dependencies,
        task_order,
    }
}

/// Drive a pending task through dispatch and claim, returning the token.
async fn dispatch_and_claim(pool: &PgPool, task_id: Uuid, lease_secs: f64) -> String {
    let seq = tasks::next_dispatch_seq(pool).await.unwrap();
    tasks::mark_dispatched(pool, task_id, seq).await.unwrap();
    tasks::claim(pool, task_id, "exec-test", lease_secs)
        .await
        .unwrap()
}

/// Drive a pending task all the way to a reported outcome.
async fn complete_task(pool: &PgPool, task_id: Uuid, outcome: ReportOutcome) {
    let token = dispatch_and_claim(pool, task_id, 60.0).await;
    tasks::report(pool, task_id, &token, outcome, &json!({"done": true}), 5)
        .await
        .unwrap();
}

// ===========================================================================
// Workflow CRUD
// ===========================================================================

#[tokio::test]
async fn create_and_get_workflow() {
    let (pool, db_name) = create_test_db().await;

    let workflow = workflows::create_workflow(&pool, "write hello to stdout")
        .await
        .unwrap();
    assert_eq!(workflow.final_status, WorkflowStatus::InProgress);
    assert_eq!(workflow.total_reward, 0.0);
    assert!(workflow.finalized_at.is_none());

    let fetched = workflows::get_workflow(&pool, workflow.workflow_id)
        .await
        .unwrap()
        .expect("workflow should exist");
    assert_eq!(fetched.prompt, "write hello to stdout");

    pool.close().await;
    drop_test_db(&db_name).await;
}

// ===========================================================================
// Task insertion and dependency integrity
// ===========================================================================

#[tokio::test]
async fn insert_tasks_with_dependencies() {
    let (pool, db_name) = create_test_db().await;
    let workflow = workflows::create_workflow(&pool, "p").await.unwrap();

    let a = new_task("a", vec![], 0);
    let b = new_task("b", vec![a.task_id], 1);
    let inserted = tasks::insert_tasks(&pool, workflow.workflow_id, &[a.clone(), b.clone()])
        .await
        .unwrap();
    assert_eq!(inserted.len(), 2);
    assert!(inserted.iter().all(|t| t.status == TaskStatus::Pending));
    assert!(inserted.iter().all(|t| t.correction_generation == 0));

    let deps = tasks::get_task_dependencies(&pool, b.task_id).await.unwrap();
    assert_eq!(deps, vec![a.task_id]);

    pool.close().await;
    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn insert_tasks_rejects_dangling_dependency() {
    let (pool, db_name) = create_test_db().await;
    let workflow = workflows::create_workflow(&pool, "p").await.unwrap();

    let orphan_dep = Uuid::new_v4();
    let task = new_task("a", vec![orphan_dep], 0);
    let err = tasks::insert_tasks(&pool, workflow.workflow_id, &[task])
        .await
        .unwrap_err();
    assert!(matches!(err, StoreError::DanglingDependency { .. }));

    pool.close().await;
    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn insert_tasks_rejects_cycle() {
    let (pool, db_name) = create_test_db().await;
    let workflow = workflows::create_workflow(&pool, "p").await.unwrap();

    let mut a = new_task("a", vec![], 0);
    let b = new_task("b", vec![a.task_id], 1);
    a.dependencies = vec![b.task_id];
    let err = tasks::insert_tasks(&pool, workflow.workflow_id, &[a, b])
        .await
        .unwrap_err();
    assert!(matches!(err, StoreError::CycleDetected(_)));

    pool.close().await;
    drop_test_db(&db_name).await;
}

// ===========================================================================
// Scheduling kernel
// ===========================================================================

#[tokio::test]
async fn ready_tasks_respect_dependencies() {
    let (pool, db_name) = create_test_db().await;
    let workflow = workflows::create_workflow(&pool, "p").await.unwrap();

    let a = new_task("a", vec![], 0);
    let b = new_task("b", vec![a.task_id], 1);
    tasks::insert_tasks(&pool, workflow.workflow_id, &[a.clone(), b.clone()])
        .await
        .unwrap();

    // Only the root is ready.
    let ready = tasks::ready_tasks(&pool, 10).await.unwrap();
    assert_eq!(ready.len(), 1);
    assert_eq!(ready[0].task_id, a.task_id);

    // Completing the root makes its dependant ready.
    complete_task(&pool, a.task_id, ReportOutcome::Ok).await;
    let ready = tasks::ready_tasks(&pool, 10).await.unwrap();
    assert_eq!(ready.len(), 1);
    assert_eq!(ready[0].task_id, b.task_id);

    pool.close().await;
    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn mark_dispatched_is_exclusive() {
    let (pool, db_name) = create_test_db().await;
    let workflow = workflows::create_workflow(&pool, "p").await.unwrap();
    let a = new_task("a", vec![], 0);
    tasks::insert_tasks(&pool, workflow.workflow_id, &[a.clone()])
        .await
        .unwrap();

    let seq = tasks::next_dispatch_seq(&pool).await.unwrap();
    tasks::mark_dispatched(&pool, a.task_id, seq).await.unwrap();

    // A second dispatch attempt (replica race) conflicts.
    let seq2 = tasks::next_dispatch_seq(&pool).await.unwrap();
    assert!(seq2 > seq);
    let err = tasks::mark_dispatched(&pool, a.task_id, seq2)
        .await
        .unwrap_err();
    assert!(err.is_conflict());

    pool.close().await;
    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn claim_is_exclusive_and_sets_lease() {
    let (pool, db_name) = create_test_db().await;
    let workflow = workflows::create_workflow(&pool, "p").await.unwrap();
    let a = new_task("a", vec![], 0);
    tasks::insert_tasks(&pool, workflow.workflow_id, &[a.clone()])
        .await
        .unwrap();

    let seq = tasks::next_dispatch_seq(&pool).await.unwrap();
    tasks::mark_dispatched(&pool, a.task_id, seq).await.unwrap();

    let token = tasks::claim(&pool, a.task_id, "exec-1", 60.0).await.unwrap();
    assert!(!token.is_empty());

    let task = tasks::get_task(&pool, a.task_id).await.unwrap().unwrap();
    assert_eq!(task.status, TaskStatus::InProgress);
    assert_eq!(task.claimed_by.as_deref(), Some("exec-1"));
    assert!(task.has_live_claim(Utc::now()));

    // Another executor loses the race.
    let err = tasks::claim(&pool, a.task_id, "exec-2", 60.0)
        .await
        .unwrap_err();
    assert!(err.is_conflict());

    pool.close().await;
    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn report_guarded_by_claim_token() {
    let (pool, db_name) = create_test_db().await;
    let workflow = workflows::create_workflow(&pool, "p").await.unwrap();
    let a = new_task("a", vec![], 0);
    tasks::insert_tasks(&pool, workflow.workflow_id, &[a.clone()])
        .await
        .unwrap();

    let token = dispatch_and_claim(&pool, a.task_id, 60.0).await;

    // Wrong token is rejected.
    let err = tasks::report(
        &pool,
        a.task_id,
        "not-the-token",
        ReportOutcome::Ok,
        &json!({}),
        1,
    )
    .await
    .unwrap_err();
    assert!(err.is_stale_claim());

    // Right token lands exactly once.
    tasks::report(&pool, a.task_id, &token, ReportOutcome::Ok, &json!({"out": 1}), 7)
        .await
        .unwrap();
    let task = tasks::get_task(&pool, a.task_id).await.unwrap().unwrap();
    assert_eq!(task.status, TaskStatus::Succeeded);
    assert!(task.claim_token.is_none());
    assert_eq!(task.duration_ms, Some(7));

    // A replayed report observes a stale claim.
    let err = tasks::report(&pool, a.task_id, &token, ReportOutcome::Ok, &json!({}), 1)
        .await
        .unwrap_err();
    assert!(err.is_stale_claim());

    pool.close().await;
    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn renew_claim_extends_lease_and_rejects_stale_tokens() {
    let (pool, db_name) = create_test_db().await;
    let workflow = workflows::create_workflow(&pool, "p").await.unwrap();
    let a = new_task("a", vec![], 0);
    tasks::insert_tasks(&pool, workflow.workflow_id, &[a.clone()])
        .await
        .unwrap();

    let token = dispatch_and_claim(&pool, a.task_id, 60.0).await;
    let before = tasks::get_task(&pool, a.task_id)
        .await
        .unwrap()
        .unwrap()
        .claim_expires_at
        .unwrap();

    tasks::renew_claim(&pool, a.task_id, &token, 120.0).await.unwrap();
    let after = tasks::get_task(&pool, a.task_id)
        .await
        .unwrap()
        .unwrap()
        .claim_expires_at
        .unwrap();
    assert!(after > before);

    let err = tasks::renew_claim(&pool, a.task_id, "bogus", 60.0)
        .await
        .unwrap_err();
    assert!(err.is_stale_claim());

    pool.close().await;
    drop_test_db(&db_name).await;
}

// ===========================================================================
// Reaping
// ===========================================================================

#[tokio::test]
async fn reap_redispatches_expired_claim_and_increments_retries() {
    let (pool, db_name) = create_test_db().await;
    let workflow = workflows::create_workflow(&pool, "p").await.unwrap();
    let a = new_task("a", vec![], 0);
    tasks::insert_tasks(&pool, workflow.workflow_id, &[a.clone()])
        .await
        .unwrap();

    let token = dispatch_and_claim(&pool, a.task_id, 60.0).await;

    // Nothing to reap while the lease is live.
    let reaped = tasks::reap_expired_claims(&pool, Utc::now(), 3).await.unwrap();
    assert!(reaped.is_empty());

    // Pretend the lease elapsed: reap as of a time past the expiry.
    let future = Utc::now() + chrono::Duration::seconds(120);
    let reaped = tasks::reap_expired_claims(&pool, future, 3).await.unwrap();
    assert_eq!(reaped.len(), 1);
    assert_eq!(reaped[0].status, TaskStatus::Dispatched);
    assert_eq!(reaped[0].retries, 1);

    let task = tasks::get_task(&pool, a.task_id).await.unwrap().unwrap();
    assert_eq!(task.status, TaskStatus::Dispatched);
    assert!(task.claim_token.is_none());

    // The dead executor's report is now stale (P3).
    let err = tasks::report(&pool, a.task_id, &token, ReportOutcome::Ok, &json!({}), 1)
        .await
        .unwrap_err();
    assert!(err.is_stale_claim());

    pool.close().await;
    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn reap_fails_task_when_retries_exhausted() {
    let (pool, db_name) = create_test_db().await;
    let workflow = workflows::create_workflow(&pool, "p").await.unwrap();
    let a = new_task("a", vec![], 0);
    tasks::insert_tasks(&pool, workflow.workflow_id, &[a.clone()])
        .await
        .unwrap();

    // Three reap cycles exhaust the budget of 3; each flips the task back
    // to dispatched with retries incremented once.
    dispatch_and_claim(&pool, a.task_id, 60.0).await;
    for expected_retries in 1..=3 {
        let future = Utc::now() + chrono::Duration::seconds(120);
        let reaped = tasks::reap_expired_claims(&pool, future, 3).await.unwrap();
        assert_eq!(reaped.len(), 1);
        assert_eq!(reaped[0].status, TaskStatus::Dispatched);
        assert_eq!(reaped[0].retries, expected_retries);
        tasks::claim(&pool, a.task_id, "exec-x", 60.0).await.unwrap();
    }

    // One more expired claim and the budget is gone.
    let future = Utc::now() + chrono::Duration::seconds(120);
    let reaped = tasks::reap_expired_claims(&pool, future, 3).await.unwrap();
    assert_eq!(reaped.len(), 1);
    assert_eq!(reaped[0].status, TaskStatus::Failed);
    assert_eq!(reaped[0].retries, 3);

    pool.close().await;
    drop_test_db(&db_name).await;
}

// ===========================================================================
// Evaluation recording
// ===========================================================================

#[tokio::test]
async fn record_evaluation_applies_exactly_once() {
    let (pool, db_name) = create_test_db().await;
    let workflow = workflows::create_workflow(&pool, "p").await.unwrap();
    let a = new_task("a", vec![], 0);
    tasks::insert_tasks(&pool, workflow.workflow_id, &[a.clone()])
        .await
        .unwrap();
    complete_task(&pool, a.task_id, ReportOutcome::Ok).await;

    let evaluation = Evaluation {
        status: TaskStatus::Succeeded,
        reward: 1.0,
        feedback: json!({"status": "success", "notes": "validated"}),
        state_snapshot: json!({"prompt": "p"}),
        action_snapshot: json!({"executor_type": "generic"}),
    };

    let applied = experiences::record_evaluation(&pool, a.task_id, &evaluation)
        .await
        .unwrap();
    assert!(applied);

    // A redelivered result changes nothing (P8).
    let applied_again = experiences::record_evaluation(&pool, a.task_id, &evaluation)
        .await
        .unwrap();
    assert!(!applied_again);

    let task = tasks::get_task(&pool, a.task_id).await.unwrap().unwrap();
    assert_eq!(task.reward, 1.0);
    assert!(task.feedback_notes.is_some());

    let refreshed = workflows::get_workflow(&pool, workflow.workflow_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(refreshed.total_reward, 1.0);

    let experience = experiences::get_for_task(&pool, a.task_id)
        .await
        .unwrap()
        .expect("experience should be written");
    assert_eq!(experience.reward, 1.0);
    assert_eq!(
        experiences::list_for_workflow(&pool, workflow.workflow_id)
            .await
            .unwrap()
            .len(),
        1
    );

    pool.close().await;
    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn evaluation_can_overturn_reported_success() {
    let (pool, db_name) = create_test_db().await;
    let workflow = workflows::create_workflow(&pool, "p").await.unwrap();
    let a = new_task("a", vec![], 0);
    tasks::insert_tasks(&pool, workflow.workflow_id, &[a.clone()])
        .await
        .unwrap();
    complete_task(&pool, a.task_id, ReportOutcome::Ok).await;

    // Validator rejected the ok outcome.
    let applied = experiences::record_evaluation(
        &pool,
        a.task_id,
        &Evaluation {
            status: TaskStatus::Failed,
            reward: -1.5,
            feedback: json!({
                "status": "failed",
                "error_type": "ValidationFailure",
                "validator": "file_writer",
                "reason": "declared file missing",
            }),
            state_snapshot: json!({}),
            action_snapshot: json!({}),
        },
    )
    .await
    .unwrap();
    assert!(applied);

    let task = tasks::get_task(&pool, a.task_id).await.unwrap().unwrap();
    assert_eq!(task.status, TaskStatus::Failed);
    assert_eq!(task.reward, -1.5);

    pool.close().await;
    drop_test_db(&db_name).await;
}

// ===========================================================================
// Finalization and cancellation
// ===========================================================================

#[tokio::test]
async fn finalize_requires_rest_and_computes_totals() {
    let (pool, db_name) = create_test_db().await;
    let workflow = workflows::create_workflow(&pool, "p").await.unwrap();
    let a = new_task("a", vec![], 0);
    let b = new_task("b", vec![], 1);
    tasks::insert_tasks(&pool, workflow.workflow_id, &[a.clone(), b.clone()])
        .await
        .unwrap();

    // Live tasks block finalization.
    let err = workflows::finalize_workflow(&pool, workflow.workflow_id)
        .await
        .unwrap_err();
    assert!(matches!(err, StoreError::InvariantViolation(_)));

    for task in [&a, &b] {
        complete_task(&pool, task.task_id, ReportOutcome::Ok).await;
        experiences::record_evaluation(
            &pool,
            task.task_id,
            &Evaluation {
                status: TaskStatus::Succeeded,
                reward: 1.0,
                feedback: json!({"status": "success"}),
                state_snapshot: json!({}),
                action_snapshot: json!({}),
            },
        )
        .await
        .unwrap();
    }

    let ready = workflows::workflows_ready_to_finalize(&pool).await.unwrap();
    assert_eq!(ready, vec![workflow.workflow_id]);

    let finalized = workflows::finalize_workflow(&pool, workflow.workflow_id)
        .await
        .unwrap();
    assert_eq!(finalized.final_status, WorkflowStatus::Succeeded);
    assert_eq!(finalized.total_reward, 2.0);
    assert!(finalized.finalized_at.is_some());

    // Terminal workflows are never finalized twice.
    let err = workflows::finalize_workflow(&pool, workflow.workflow_id)
        .await
        .unwrap_err();
    assert!(matches!(err, StoreError::InvariantViolation(_)));

    pool.close().await;
    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn unevaluated_success_blocks_finalization() {
    let (pool, db_name) = create_test_db().await;
    let workflow = workflows::create_workflow(&pool, "p").await.unwrap();
    let a = new_task("a", vec![], 0);
    tasks::insert_tasks(&pool, workflow.workflow_id, &[a.clone()])
        .await
        .unwrap();
    complete_task(&pool, a.task_id, ReportOutcome::Ok).await;

    // Reported but not yet evaluated: not ready.
    let ready = workflows::workflows_ready_to_finalize(&pool).await.unwrap();
    assert!(ready.is_empty());

    pool.close().await;
    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn cancel_workflow_cancels_live_tasks() {
    let (pool, db_name) = create_test_db().await;
    let workflow = workflows::create_workflow(&pool, "p").await.unwrap();
    let a = new_task("a", vec![], 0);
    let b = new_task("b", vec![a.task_id], 1);
    tasks::insert_tasks(&pool, workflow.workflow_id, &[a.clone(), b.clone()])
        .await
        .unwrap();
    dispatch_and_claim(&pool, a.task_id, 60.0).await;

    workflows::cancel_workflow(&pool, workflow.workflow_id)
        .await
        .unwrap();

    let refreshed = workflows::get_workflow(&pool, workflow.workflow_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(refreshed.final_status, WorkflowStatus::Cancelled);

    for task_id in [a.task_id, b.task_id] {
        let task = tasks::get_task(&pool, task_id).await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Cancelled);
        assert!(task.claim_token.is_none());
    }

    // Cancelled workflows no longer feed the dispatcher.
    assert!(tasks::ready_tasks(&pool, 10).await.unwrap().is_empty());

    pool.close().await;
    drop_test_db(&db_name).await;
}
