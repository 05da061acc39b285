//! The planner oracle interface.
//!
//! The oracle proposes an initial DAG for a prompt and a corrective
//! sub-DAG for a failure. It is side-effect-free from the engine's view;
//! retries, caching, and rate limiting live behind the trait. An oracle
//! failure is terminal for the current workflow -- the engine never
//! retries the oracle itself.

pub mod http;
pub mod scripted;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use graft_db::models::Task;

pub use http::HttpPlanner;
pub use scripted::ScriptedPlanner;

/// A proposed task. Dependencies reference sibling tasks in the same plan
/// by index; the orchestrator allocates ids when it persists the plan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlannedTask {
    pub description: String,
    pub executor_type: String,
    pub parameters: serde_json::Value,
    #[serde(default)]
    pub dependencies: Vec<usize>,
}

/// Everything the oracle sees when asked to repair a failure.
#[derive(Debug, Clone, Serialize)]
pub struct CorrectionContext {
    /// The workflow's original prompt.
    pub prompt: String,
    /// Description of the failed task.
    pub failed_description: String,
    pub failed_executor_type: String,
    pub failed_parameters: serde_json::Value,
    /// Structured error from the failed task's evaluation.
    pub error: serde_json::Value,
    /// Previously succeeded sibling tasks, in topological order.
    pub succeeded: Vec<CompletedSibling>,
    pub correction_generation: i32,
}

/// A succeeded predecessor summarized for the correction context.
#[derive(Debug, Clone, Serialize)]
pub struct CompletedSibling {
    pub description: String,
    pub executor_type: String,
    pub result: Option<serde_json::Value>,
}

/// A corrective sub-DAG plus the retry of the failed task.
///
/// The retry task's dependencies are ignored: surgery wires it to the
/// terminal nodes of the corrective sub-DAG.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CorrectionPlan {
    pub corrective_tasks: Vec<PlannedTask>,
    pub retry_task: PlannedTask,
}

/// Oracle failures. Both are terminal for the workflow being planned.
#[derive(Debug, Error)]
pub enum PlanError {
    /// The oracle could not be reached or refused to answer.
    #[error("planner oracle unavailable: {0}")]
    Unavailable(String),

    /// The oracle answered with something unusable.
    #[error("planner oracle returned an invalid plan: {0}")]
    Invalid(String),
}

/// Produces initial DAGs and correction plans. Opaque to the engine.
#[async_trait]
pub trait Planner: Send + Sync {
    /// Propose a DAG of tasks for a user prompt.
    async fn plan_initial(&self, prompt: &str) -> Result<Vec<PlannedTask>, PlanError>;

    /// Propose a corrective sub-DAG and a retry for a failed task.
    async fn plan_correction(
        &self,
        context: &CorrectionContext,
    ) -> Result<CorrectionPlan, PlanError>;
}

/// Key under which the oracle is permitted to rewrite retry parameters.
///
/// A retry is recognized as such when its executor type matches the failed
/// task and its parameters are equal after removing this key from both
/// sides; everything else must round-trip unchanged.
pub const ADJUSTED_KEY: &str = "adjusted";

/// Check that a proposed retry task is semantically the retry of `failed`.
pub fn is_retry_of(retry: &PlannedTask, failed: &Task) -> bool {
    if retry.executor_type != failed.executor_type {
        return false;
    }
    strip_adjusted(&retry.parameters) == strip_adjusted(&failed.parameters)
}

fn strip_adjusted(params: &serde_json::Value) -> serde_json::Value {
    match params {
        serde_json::Value::Object(map) => {
            let mut clean = map.clone();
            clean.remove(ADJUSTED_KEY);
            serde_json::Value::Object(clean)
        }
        other => other.clone(),
    }
}

/// Validate a proposed plan before it touches the store: every executor
/// type is recognized, dependency indices are in range, and the sub-DAG is
/// acyclic. An empty `known_types` slice accepts any executor type.
pub fn validate_plan(tasks: &[PlannedTask], known_types: &[String]) -> Result<(), PlanError> {
    if tasks.is_empty() {
        return Err(PlanError::Invalid("plan contains no tasks".into()));
    }

    for (i, task) in tasks.iter().enumerate() {
        if !known_types.is_empty() && !known_types.iter().any(|t| t == &task.executor_type) {
            return Err(PlanError::Invalid(format!(
                "task {i} has unrecognized executor type {:?}",
                task.executor_type
            )));
        }
        for &dep in &task.dependencies {
            if dep >= tasks.len() {
                return Err(PlanError::Invalid(format!(
                    "task {i} depends on out-of-range index {dep}"
                )));
            }
            if dep == i {
                return Err(PlanError::Invalid(format!("task {i} depends on itself")));
            }
        }
    }

    // Kahn's algorithm over plan indices.
    let n = tasks.len();
    let mut in_degree = vec![0usize; n];
    let mut adj: Vec<Vec<usize>> = vec![vec![]; n];
    for (i, task) in tasks.iter().enumerate() {
        for &dep in &task.dependencies {
            adj[dep].push(i);
            in_degree[i] += 1;
        }
    }
    let mut queue: std::collections::VecDeque<usize> = in_degree
        .iter()
        .enumerate()
        .filter(|(_, d)| **d == 0)
        .map(|(i, _)| i)
        .collect();
    let mut sorted = 0usize;
    while let Some(node) = queue.pop_front() {
        sorted += 1;
        for &next in &adj[node] {
            in_degree[next] -= 1;
            if in_degree[next] == 0 {
                queue.push_back(next);
            }
        }
    }
    if sorted != n {
        return Err(PlanError::Invalid(
            "proposed plan contains a dependency cycle".into(),
        ));
    }

    Ok(())
}
