//! The `Handler` trait -- the adapter interface for task execution.
//!
//! Each concrete handler implements one or more executor types. The trait
//! is intentionally object-safe so handlers can be stored as
//! `Arc<dyn Handler>` in the [`registry::HandlerRegistry`].

pub mod builtin;
pub mod registry;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

pub use registry::HandlerRegistry;

/// Everything a handler receives for one execution.
#[derive(Debug, Clone)]
pub struct ExecutionContext {
    pub task_id: Uuid,
    pub workflow_id: Uuid,
    pub executor_type: String,
    pub parameters: serde_json::Value,
    pub start_time: DateTime<Utc>,
    /// Results of upstream dependencies, when the dispatcher chose to
    /// include them.
    pub upstream_results: Option<serde_json::Value>,
    /// Cooperative cancellation: fires on deadline or lost claim.
    /// Handlers must observe it and return promptly.
    pub cancel: CancellationToken,
}

/// A captured handler failure, ready for a result envelope.
#[derive(Debug, Clone)]
pub struct HandlerFailure {
    /// Error class name (e.g. `IoError`, `NoHandler`, `Timeout`).
    pub error_type: String,
    pub error_message: String,
    /// Stack or context string when one is available.
    pub context: Option<String>,
}

impl HandlerFailure {
    pub fn new(error_type: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            error_type: error_type.into(),
            error_message: message.into(),
            context: None,
        }
    }

    pub fn with_context(mut self, context: impl Into<String>) -> Self {
        self.context = Some(context.into());
        self
    }
}

impl From<anyhow::Error> for HandlerFailure {
    fn from(err: anyhow::Error) -> Self {
        Self {
            error_type: "HandlerError".into(),
            error_message: err.to_string(),
            context: Some(format!("{err:#}")),
        }
    }
}

/// Adapter interface for executing tasks.
///
/// # Object Safety
///
/// This trait is object-safe: every method either returns a concrete type
/// or is async via `async_trait`. Handlers are stored as
/// `Arc<dyn Handler>` in the registry.
#[async_trait]
pub trait Handler: Send + Sync {
    /// Executor types this handler serves directly.
    fn types(&self) -> Vec<String>;

    /// Whether this handler can take a task it is not registered for by
    /// type. Used as the registry's linear fallback. The default accepts
    /// exactly the advertised types.
    fn accepts(&self, executor_type: &str, _parameters: &serde_json::Value) -> bool {
        self.types().iter().any(|t| t == executor_type)
    }

    /// Execute the task. Must observe `ctx.cancel` and return promptly
    /// when it fires.
    async fn execute(&self, ctx: &ExecutionContext) -> Result<serde_json::Value, HandlerFailure>;
}

// Compile-time assertion: Handler must be object-safe.
const _: () = {
    fn _assert_object_safe(_: &dyn Handler) {}
};
