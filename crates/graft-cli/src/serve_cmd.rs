//! The `graft serve` command: HTTP submission and status surface.
//!
//! `POST /api/workflows` submits a prompt; `GET /api/workflows/{id}`
//! returns the workflow with its tasks and their dependencies.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Result;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use tower_http::cors::CorsLayer;
use uuid::Uuid;

use graft_core::orchestrator::Orchestrator;
use graft_db::models::{Experience, Task, Workflow};
use graft_db::queries::{experiences as experience_db, tasks as task_db, workflows as workflow_db};

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

pub struct AppError {
    status: StatusCode,
    message: String,
}

impl AppError {
    pub fn not_found(msg: impl Into<String>) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            message: msg.into(),
        }
    }

    pub fn bad_request(msg: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: msg.into(),
        }
    }

    pub fn internal(err: anyhow::Error) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: format!("{err:#}"),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> axum::response::Response {
        let body = serde_json::json!({ "error": self.message });
        (self.status, Json(body)).into_response()
    }
}

impl From<graft_db::StoreError> for AppError {
    fn from(err: graft_db::StoreError) -> Self {
        Self::internal(err.into())
    }
}

// ---------------------------------------------------------------------------
// Request / response types
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct SubmitRequest {
    pub prompt: String,
}

#[derive(Debug, Serialize)]
pub struct SubmitResponse {
    pub workflow_id: Uuid,
}

#[derive(Debug, Serialize)]
pub struct TaskResponse {
    #[serde(flatten)]
    pub task: Task,
    pub dependencies: Vec<Uuid>,
}

#[derive(Debug, Serialize)]
pub struct WorkflowDetailResponse {
    #[serde(flatten)]
    pub workflow: Workflow,
    pub tasks: Vec<TaskResponse>,
}

#[derive(Debug, Serialize)]
pub struct TaskDetailResponse {
    #[serde(flatten)]
    pub task: Task,
    pub dependencies: Vec<Uuid>,
    pub experience: Option<Experience>,
}

// ---------------------------------------------------------------------------
// State and router
// ---------------------------------------------------------------------------

pub struct ServeState {
    pub pool: PgPool,
    pub orchestrator: Arc<Orchestrator>,
}

pub fn build_router(state: Arc<ServeState>) -> Router {
    Router::new()
        .route("/api/workflows", post(submit_workflow).get(list_workflows))
        .route("/api/workflows/{id}", get(get_workflow_detail))
        .route("/api/tasks/{id}", get(get_task_detail))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

async fn submit_workflow(
    State(state): State<Arc<ServeState>>,
    Json(request): Json<SubmitRequest>,
) -> Result<impl IntoResponse, AppError> {
    if request.prompt.trim().is_empty() {
        return Err(AppError::bad_request("prompt must not be empty"));
    }

    let workflow_id = state
        .orchestrator
        .submit(&request.prompt)
        .await
        .map_err(AppError::internal)?;

    Ok((StatusCode::CREATED, Json(SubmitResponse { workflow_id })))
}

async fn list_workflows(
    State(state): State<Arc<ServeState>>,
) -> Result<Json<Vec<Workflow>>, AppError> {
    let workflows = workflow_db::list_workflows(&state.pool).await?;
    Ok(Json(workflows))
}

async fn get_workflow_detail(
    State(state): State<Arc<ServeState>>,
    Path(id): Path<Uuid>,
) -> Result<Json<WorkflowDetailResponse>, AppError> {
    let workflow = workflow_db::get_workflow(&state.pool, id)
        .await?
        .ok_or_else(|| AppError::not_found(format!("workflow {id} not found")))?;

    let tasks = task_db::list_tasks_for_workflow(&state.pool, id).await?;
    let mut dependency_map = task_db::dependency_map(&state.pool, id).await?;

    let tasks = tasks
        .into_iter()
        .map(|task| {
            let dependencies = dependency_map.remove(&task.task_id).unwrap_or_default();
            TaskResponse { task, dependencies }
        })
        .collect();

    Ok(Json(WorkflowDetailResponse { workflow, tasks }))
}

async fn get_task_detail(
    State(state): State<Arc<ServeState>>,
    Path(id): Path<Uuid>,
) -> Result<Json<TaskDetailResponse>, AppError> {
    let task = task_db::get_task(&state.pool, id)
        .await?
        .ok_or_else(|| AppError::not_found(format!("task {id} not found")))?;

    let dependencies = task_db::get_task_dependencies(&state.pool, id).await?;
    let experience = experience_db::get_for_task(&state.pool, id).await?;

    Ok(Json(TaskDetailResponse {
        task,
        dependencies,
        experience,
    }))
}

// ---------------------------------------------------------------------------
// Entry point
// ---------------------------------------------------------------------------

pub async fn run_serve(state: Arc<ServeState>, bind: &str, port: u16) -> Result<()> {
    let app = build_router(state);
    let addr: SocketAddr = format!("{bind}:{port}").parse()?;
    tracing::info!("graft serve listening on http://{addr}");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    tracing::info!("graft serve shut down");
    Ok(())
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
