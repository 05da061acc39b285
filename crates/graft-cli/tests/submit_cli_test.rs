//! Integration tests for the submission surface the CLI and HTTP API sit
//! on: admission, status queries, and cancellation.
//!
//! Each test creates an isolated temporary database and drops it on
//! completion.

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;

use graft_core::evaluator::EvaluatorConfig;
use graft_core::oracle::{PlannedTask, Planner, ScriptedPlanner};
use graft_core::orchestrator::{Orchestrator, OrchestratorConfig};
use graft_db::models::{TaskStatus, WorkflowStatus};
use graft_db::queries::{tasks as task_db, workflows as workflow_db};
use graft_fabric::Fabric;
use graft_fabric::pg::{FabricConfig, PgFabric};
use graft_test_utils::{create_test_db, drop_test_db};

fn orchestrator(pool: sqlx::PgPool, planner: Arc<ScriptedPlanner>) -> Orchestrator {
    let fabric: Arc<dyn Fabric> = Arc::new(PgFabric::new(pool.clone(), FabricConfig::default()));
    Orchestrator::new(
        pool,
        fabric,
        planner as Arc<dyn Planner>,
        OrchestratorConfig {
            polling_interval: Duration::from_millis(50),
            dispatch_batch: 32,
            max_retries: 3,
            max_correction_depth: 3,
            known_executor_types: vec!["generic".into(), "file_writer".into()],
            evaluation_grace: Duration::from_secs(20),
            redispatch_grace: Duration::from_secs(20),
        },
        EvaluatorConfig::default(),
    )
}

#[tokio::test]
async fn submit_persists_prompt_and_dag() {
    let (pool, db_name) = create_test_db().await;
    let planner = Arc::new(ScriptedPlanner::new());
    planner.push_initial(vec![
        PlannedTask {
            description: "fetch".into(),
            executor_type: "generic".into(),
            parameters: json!({"step": 1}),
            dependencies: vec![],
        },
        PlannedTask {
            description: "summarize".into(),
            executor_type: "generic".into(),
            parameters: json!({"step": 2}),
            dependencies: vec![0],
        },
    ]);

    let orchestrator = orchestrator(pool.clone(), planner);
    let workflow_id = orchestrator.submit("fetch and summarize").await.unwrap();

    let workflow = workflow_db::get_workflow(&pool, workflow_id)
        .await
        .unwrap()
        .expect("workflow exists");
    assert_eq!(workflow.prompt, "fetch and summarize");
    assert_eq!(workflow.final_status, WorkflowStatus::InProgress);

    let tasks = task_db::list_tasks_for_workflow(&pool, workflow_id).await.unwrap();
    assert_eq!(tasks.len(), 2);
    assert!(tasks.iter().all(|t| t.status == TaskStatus::Pending));

    // The dependency survived the local-index translation.
    let summarize = tasks.iter().find(|t| t.description == "summarize").unwrap();
    let deps = task_db::get_task_dependencies(&pool, summarize.task_id)
        .await
        .unwrap();
    let fetch = tasks.iter().find(|t| t.description == "fetch").unwrap();
    assert_eq!(deps, vec![fetch.task_id]);

    pool.close().await;
    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn submit_rejects_unknown_executor_types() {
    let (pool, db_name) = create_test_db().await;
    let planner = Arc::new(ScriptedPlanner::new());
    planner.push_initial(vec![PlannedTask {
        description: "teleport".into(),
        executor_type: "teleporter".into(),
        parameters: json!({}),
        dependencies: vec![],
    }]);

    let orchestrator = orchestrator(pool.clone(), planner);
    let workflow_id = orchestrator.submit("teleport the data").await.unwrap();

    // The workflow exists but was failed at admission, with no tasks.
    let workflow = workflow_db::get_workflow(&pool, workflow_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(workflow.final_status, WorkflowStatus::Failed);
    assert!(
        task_db::list_tasks_for_workflow(&pool, workflow_id)
            .await
            .unwrap()
            .is_empty()
    );

    pool.close().await;
    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn status_listing_shows_submitted_workflows() {
    let (pool, db_name) = create_test_db().await;
    let planner = Arc::new(ScriptedPlanner::new());
    for _ in 0..2 {
        planner.push_initial(vec![PlannedTask {
            description: "t".into(),
            executor_type: "generic".into(),
            parameters: json!({}),
            dependencies: vec![],
        }]);
    }

    let orchestrator = orchestrator(pool.clone(), planner);
    let first = orchestrator.submit("first").await.unwrap();
    let second = orchestrator.submit("second").await.unwrap();

    let workflows = workflow_db::list_workflows(&pool).await.unwrap();
    assert_eq!(workflows.len(), 2);
    // Newest first.
    assert_eq!(workflows[0].workflow_id, second);
    assert_eq!(workflows[1].workflow_id, first);

    pool.close().await;
    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn cancel_stops_a_live_workflow() {
    let (pool, db_name) = create_test_db().await;
    let planner = Arc::new(ScriptedPlanner::new());
    planner.push_initial(vec![PlannedTask {
        description: "t".into(),
        executor_type: "generic".into(),
        parameters: json!({}),
        dependencies: vec![],
    }]);

    let orchestrator = orchestrator(pool.clone(), planner);
    let workflow_id = orchestrator.submit("cancel me").await.unwrap();

    workflow_db::cancel_workflow(&pool, workflow_id).await.unwrap();

    let workflow = workflow_db::get_workflow(&pool, workflow_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(workflow.final_status, WorkflowStatus::Cancelled);
    let tasks = task_db::list_tasks_for_workflow(&pool, workflow_id).await.unwrap();
    assert!(tasks.iter().all(|t| t.status == TaskStatus::Cancelled));

    // Cancelling twice is an error: the workflow is already terminal.
    assert!(workflow_db::cancel_workflow(&pool, workflow_id).await.is_err());

    pool.close().await;
    drop_test_db(&db_name).await;
}
