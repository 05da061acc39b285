use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Enums
// ---------------------------------------------------------------------------

/// Final status of a workflow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum WorkflowStatus {
    InProgress,
    Succeeded,
    Failed,
    Cancelled,
}

impl WorkflowStatus {
    /// Whether the workflow has reached a terminal status.
    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::InProgress)
    }
}

impl fmt::Display for WorkflowStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::InProgress => "in_progress",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

impl FromStr for WorkflowStatus {
    type Err = WorkflowStatusParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "in_progress" => Ok(Self::InProgress),
            "succeeded" => Ok(Self::Succeeded),
            "failed" => Ok(Self::Failed),
            "cancelled" => Ok(Self::Cancelled),
            other => Err(WorkflowStatusParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`WorkflowStatus`] string.
#[derive(Debug, Clone)]
pub struct WorkflowStatusParseError(pub String);

impl fmt::Display for WorkflowStatusParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid workflow status: {:?}", self.0)
    }
}

impl std::error::Error for WorkflowStatusParseError {}

// ---------------------------------------------------------------------------

/// Status of a task in the DAG.
///
/// `pending` means not yet eligible or eligible-but-unpublished,
/// `dispatched` means published to the fabric, `in_progress` means an
/// executor holds a live claim. `paused` is the audit state a failed task
/// enters when a correction is spliced in over it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Dispatched,
    InProgress,
    Succeeded,
    Failed,
    Paused,
    Cancelled,
}

impl TaskStatus {
    /// Whether the task can no longer change outcome.
    ///
    /// `paused` is excluded: it is preserved for audit but is not counted
    /// as a terminal outcome (it carries no weight at finalization).
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Cancelled)
    }

    /// Whether the task still occupies the scheduler (pending, dispatched,
    /// or claimed).
    pub fn is_live(self) -> bool {
        matches!(self, Self::Pending | Self::Dispatched | Self::InProgress)
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Dispatched => "dispatched",
            Self::InProgress => "in_progress",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Paused => "paused",
            Self::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

impl FromStr for TaskStatus {
    type Err = TaskStatusParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "dispatched" => Ok(Self::Dispatched),
            "in_progress" => Ok(Self::InProgress),
            "succeeded" => Ok(Self::Succeeded),
            "failed" => Ok(Self::Failed),
            "paused" => Ok(Self::Paused),
            "cancelled" => Ok(Self::Cancelled),
            other => Err(TaskStatusParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`TaskStatus`] string.
#[derive(Debug, Clone)]
pub struct TaskStatusParseError(pub String);

impl fmt::Display for TaskStatusParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid task status: {:?}", self.0)
    }
}

impl std::error::Error for TaskStatusParseError {}

// ---------------------------------------------------------------------------
// Row structs
// ---------------------------------------------------------------------------

/// A workflow -- one per user request.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Workflow {
    pub workflow_id: Uuid,
    pub prompt: String,
    pub final_status: WorkflowStatus,
    pub total_reward: f32,
    pub created_at: DateTime<Utc>,
    pub finalized_at: Option<DateTime<Utc>>,
}

/// A task -- a node in a workflow's DAG.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Task {
    pub task_id: Uuid,
    pub workflow_id: Uuid,
    /// The failed task this row corrects or retries, when part of a
    /// correction; `None` for original-plan tasks.
    pub parent_task_id: Option<Uuid>,
    pub description: String,
    pub executor_type: String,
    pub parameters: serde_json::Value,
    pub status: TaskStatus,
    /// Topological index from the original plan; corrections inherit the
    /// order of the task they repair.
    pub task_order: i32,
    pub correction_generation: i32,
    pub retries: i32,
    pub reward: f32,
    /// Structured evaluation feedback; written exactly once per terminal
    /// transition, `None` until the task has been evaluated.
    pub feedback_notes: Option<serde_json::Value>,
    /// Raw payload from the executor's report (data on ok, error on error).
    pub result_payload: Option<serde_json::Value>,
    pub duration_ms: Option<i64>,
    pub dispatch_seq: Option<i64>,
    pub claim_token: Option<String>,
    pub claimed_by: Option<String>,
    pub claim_expires_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub last_update_at: DateTime<Utc>,
}

impl Task {
    /// Whether a live claim currently guards this task.
    pub fn has_live_claim(&self, now: DateTime<Utc>) -> bool {
        self.claim_token.is_some() && self.claim_expires_at.is_some_and(|exp| exp > now)
    }
}

/// An edge in the task dependency DAG: `task_id` depends on `depends_on`.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct TaskDependency {
    pub task_id: Uuid,
    pub depends_on: Uuid,
}

/// An append-only experience record, one per terminal task.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Experience {
    pub experience_id: Uuid,
    pub workflow_id: Uuid,
    pub task_id: Uuid,
    pub state_snapshot: serde_json::Value,
    pub action_snapshot: serde_json::Value,
    pub reward: f32,
    pub recorded_at: DateTime<Utc>,
}

/// Input for a bulk task insert or a surgery splice.
///
/// `task_id` is allocated by the caller so that `dependencies` can reference
/// sibling tasks in the same batch by id.
#[derive(Debug, Clone)]
pub struct NewTask {
    pub task_id: Uuid,
    pub description: String,
    pub executor_type: String,
    pub parameters: serde_json::Value,
    pub dependencies: Vec<Uuid>,
    pub task_order: i32,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
