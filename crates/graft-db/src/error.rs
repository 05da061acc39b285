//! Typed store errors.
//!
//! Callers branch on `Conflict` and `StaleClaim` for control flow (lost
//! claim races, duplicate deliveries); the remaining variants are
//! programming or integrity failures that surface to the workflow.

use thiserror::Error;
use uuid::Uuid;

/// Errors returned by task store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// An optimistic state transition found the row in a different state
    /// than expected (claim lost, already dispatched, reaped meanwhile).
    #[error("conflict on task {task_id}: {detail}")]
    Conflict { task_id: Uuid, detail: String },

    /// A report or renewal presented a claim token that no longer matches
    /// the stored claim, or whose lease has expired.
    #[error("stale claim on task {task_id}")]
    StaleClaim { task_id: Uuid },

    /// The dependency relation would contain a cycle.
    #[error("dependency cycle detected involving tasks: {0}")]
    CycleDetected(String),

    /// A dependency edge references a task that does not exist in the
    /// workflow.
    #[error("task {task} depends on unknown task {dependency}")]
    DanglingDependency { task: Uuid, dependency: Uuid },

    /// A transition would violate a store invariant (e.g. surgery on a
    /// task that is not failed, finalizing a workflow with live tasks).
    #[error("invariant violation: {0}")]
    InvariantViolation(String),

    /// The referenced row does not exist.
    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: Uuid },

    #[error(transparent)]
    Db(#[from] sqlx::Error),
}

impl StoreError {
    /// `true` when the error is a benign lost race rather than a failure.
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict { .. })
    }

    pub fn is_stale_claim(&self) -> bool {
        matches!(self, Self::StaleClaim { .. })
    }
}

/// Convenience alias used throughout the query modules.
pub type StoreResult<T> = Result<T, StoreError>;
