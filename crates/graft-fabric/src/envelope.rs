//! Wire envelopes: JSON, UTF-8, no trailing data.
//!
//! Envelopes are in-flight only. The store remains authoritative; a lost
//! or duplicated envelope is tolerated because every consumer transition
//! is conditional on store state.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A task published for execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DispatchEnvelope {
    pub task_id: Uuid,
    pub workflow_id: Uuid,
    pub executor_type: String,
    pub parameters: serde_json::Value,
    /// Capability tags required to run this task; executors bind to the
    /// per-capability routing keys they advertise.
    pub capabilities: Vec<String>,
    /// Globally monotonic dispatch counter; stable across redeliveries of
    /// the same dispatch.
    pub dispatch_seq: i64,
}

/// Executor outcome for a result envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Ok,
    Error,
}

/// Structured error carried on failed executions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultError {
    pub error_type: String,
    pub error_message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

/// A raw execution result reported by an executor.
///
/// Exactly one of `data` (on `ok`) or `error` (on `error`) is present.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultEnvelope {
    pub task_id: Uuid,
    pub workflow_id: Uuid,
    pub outcome: Outcome,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ResultError>,
    pub executor_id: String,
    pub duration_ms: i64,
}

impl ResultEnvelope {
    pub fn ok(
        task_id: Uuid,
        workflow_id: Uuid,
        data: serde_json::Value,
        executor_id: &str,
        duration_ms: i64,
    ) -> Self {
        Self {
            task_id,
            workflow_id,
            outcome: Outcome::Ok,
            data: Some(data),
            error: None,
            executor_id: executor_id.to_owned(),
            duration_ms,
        }
    }

    pub fn error(
        task_id: Uuid,
        workflow_id: Uuid,
        error: ResultError,
        executor_id: &str,
        duration_ms: i64,
    ) -> Self {
        Self {
            task_id,
            workflow_id,
            outcome: Outcome::Error,
            data: None,
            error: Some(error),
            executor_id: executor_id.to_owned(),
            duration_ms,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dispatch_envelope_wire_shape() {
        let env = DispatchEnvelope {
            task_id: Uuid::new_v4(),
            workflow_id: Uuid::new_v4(),
            executor_type: "code_executor".into(),
            parameters: serde_json::json!({"code": "print('hello')"}),
            capabilities: vec!["code_executor".into()],
            dispatch_seq: 7,
        };

        let value = serde_json::to_value(&env).unwrap();
        assert_eq!(value["executor_type"], "code_executor");
        assert_eq!(value["dispatch_seq"], 7);
        assert!(value["capabilities"].is_array());

        let back: DispatchEnvelope = serde_json::from_value(value).unwrap();
        assert_eq!(back, env);
    }

    #[test]
    fn result_envelope_ok_omits_error() {
        let env = ResultEnvelope::ok(
            Uuid::new_v4(),
            Uuid::new_v4(),
            serde_json::json!({"stdout": "hello"}),
            "exec-1",
            42,
        );
        let value = serde_json::to_value(&env).unwrap();
        assert_eq!(value["outcome"], "ok");
        assert!(value.get("error").is_none());
        assert_eq!(value["duration_ms"], 42);
    }

    #[test]
    fn result_envelope_error_carries_structured_error() {
        let env = ResultEnvelope::error(
            Uuid::new_v4(),
            Uuid::new_v4(),
            ResultError {
                error_type: "Timeout".into(),
                error_message: "handler exceeded 300s".into(),
                context: None,
                details: None,
            },
            "exec-2",
            300_000,
        );
        let value = serde_json::to_value(&env).unwrap();
        assert_eq!(value["outcome"], "error");
        assert_eq!(value["error"]["error_type"], "Timeout");
        assert!(value.get("data").is_none());
    }
}
