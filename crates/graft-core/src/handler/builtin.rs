//! Built-in handlers for the standard executor types.
//!
//! `code_executor` shells out to an interpreter, `file_writer` writes
//! files, `api_caller` performs HTTP requests, `generic` echoes its
//! parameters. Each observes the context's cancellation token.

use async_trait::async_trait;
use serde_json::{Value, json};
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::debug;

use super::{ExecutionContext, Handler, HandlerFailure};

// ---------------------------------------------------------------------------
// code_executor
// ---------------------------------------------------------------------------

/// Runs `parameters.code` through an interpreter subprocess.
///
/// Parameters: `code` (required), `interpreter` (optional, defaults to
/// `python3`). The result carries `status`, `stdout`, `stderr`, and
/// `exit_code` for the evaluator's validator.
pub struct CodeExecutorHandler {
    default_interpreter: String,
}

impl CodeExecutorHandler {
    pub fn new() -> Self {
        Self {
            default_interpreter: "python3".to_string(),
        }
    }

    pub fn with_interpreter(interpreter: impl Into<String>) -> Self {
        Self {
            default_interpreter: interpreter.into(),
        }
    }
}

impl Default for CodeExecutorHandler {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Handler for CodeExecutorHandler {
    fn types(&self) -> Vec<String> {
        vec!["code_executor".into()]
    }

    async fn execute(&self, ctx: &ExecutionContext) -> Result<Value, HandlerFailure> {
        let code = ctx
            .parameters
            .get("code")
            .and_then(|c| c.as_str())
            .ok_or_else(|| HandlerFailure::new("BadParameters", "missing string parameter: code"))?;
        let interpreter = ctx
            .parameters
            .get("interpreter")
            .and_then(|i| i.as_str())
            .unwrap_or(&self.default_interpreter);

        let mut child = Command::new(interpreter)
            .arg("-")
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                HandlerFailure::new("SpawnError", format!("failed to spawn {interpreter}: {e}"))
            })?;

        let Some(mut stdin) = child.stdin.take() else {
            return Err(HandlerFailure::new("IoError", "child stdin unavailable"));
        };
        stdin.write_all(code.as_bytes()).await.map_err(|e| {
            HandlerFailure::new("IoError", format!("failed to write code to stdin: {e}"))
        })?;
        drop(stdin);

        let output = tokio::select! {
            output = child.wait_with_output() => output.map_err(|e| {
                HandlerFailure::new("IoError", format!("failed to collect output: {e}"))
            })?,
            _ = ctx.cancel.cancelled() => {
                // kill_on_drop reaps the child when the handle drops.
                return Err(HandlerFailure::new("Cancelled", "execution cancelled"));
            }
        };

        let exit_code = output.status.code().unwrap_or(-1);
        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        let stderr = String::from_utf8_lossy(&output.stderr).into_owned();
        debug!(task_id = %ctx.task_id, exit_code, "code execution finished");

        if output.status.success() {
            Ok(json!({
                "status": "success",
                "stdout": stdout,
                "stderr": stderr,
                "exit_code": exit_code,
            }))
        } else {
            Err(HandlerFailure::new(
                "NonZeroExit",
                format!("{interpreter} exited with code {exit_code}"),
            )
            .with_context(stderr))
        }
    }
}

// ---------------------------------------------------------------------------
// file_writer
// ---------------------------------------------------------------------------

/// Writes `parameters.content` to `parameters.path`.
///
/// Parent directories are created as needed. The result reports the path
/// and byte count so the validator can verify the write independently.
pub struct FileWriterHandler;

#[async_trait]
impl Handler for FileWriterHandler {
    fn types(&self) -> Vec<String> {
        vec!["file_writer".into()]
    }

    async fn execute(&self, ctx: &ExecutionContext) -> Result<Value, HandlerFailure> {
        let path = ctx
            .parameters
            .get("path")
            .and_then(|p| p.as_str())
            .ok_or_else(|| HandlerFailure::new("BadParameters", "missing string parameter: path"))?;
        let content = ctx
            .parameters
            .get("content")
            .and_then(|c| c.as_str())
            .unwrap_or("");

        if let Some(parent) = std::path::Path::new(path).parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await.map_err(|e| {
                    HandlerFailure::new("IoError", format!("failed to create {}: {e}", parent.display()))
                })?;
            }
        }

        tokio::fs::write(path, content).await.map_err(|e| {
            HandlerFailure::new("IoError", format!("failed to write {path}: {e}"))
        })?;

        Ok(json!({
            "path": path,
            "bytes_written": content.len(),
        }))
    }
}

// ---------------------------------------------------------------------------
// api_caller
// ---------------------------------------------------------------------------

/// Performs an HTTP request described by the parameters.
///
/// Parameters: `url` (required), `method` (optional, default GET), `body`
/// (optional JSON). The result reports `status_code` and a bounded body
/// excerpt.
pub struct ApiCallerHandler {
    client: reqwest::Client,
    /// Response bodies are truncated to this many bytes in the result.
    max_body_bytes: usize,
}

impl ApiCallerHandler {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
            max_body_bytes: 16 * 1024,
        }
    }
}

impl Default for ApiCallerHandler {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Handler for ApiCallerHandler {
    fn types(&self) -> Vec<String> {
        vec!["api_caller".into()]
    }

    async fn execute(&self, ctx: &ExecutionContext) -> Result<Value, HandlerFailure> {
        let url = ctx
            .parameters
            .get("url")
            .and_then(|u| u.as_str())
            .ok_or_else(|| HandlerFailure::new("BadParameters", "missing string parameter: url"))?;
        let method = ctx
            .parameters
            .get("method")
            .and_then(|m| m.as_str())
            .unwrap_or("GET")
            .to_uppercase();

        let method = reqwest::Method::from_bytes(method.as_bytes())
            .map_err(|_| HandlerFailure::new("BadParameters", format!("invalid method {method:?}")))?;

        let mut request = self.client.request(method, url);
        if let Some(body) = ctx.parameters.get("body") {
            request = request.json(body);
        }

        let response = tokio::select! {
            response = request.send() => response.map_err(|e| {
                HandlerFailure::new("RequestError", format!("request to {url} failed: {e}"))
            })?,
            _ = ctx.cancel.cancelled() => {
                return Err(HandlerFailure::new("Cancelled", "execution cancelled"));
            }
        };

        let status_code = response.status().as_u16();
        let body = response.text().await.unwrap_or_default();
        let mut end = body.len().min(self.max_body_bytes);
        while !body.is_char_boundary(end) {
            end -= 1;
        }

        Ok(json!({
            "status_code": status_code,
            "body": &body[..end],
        }))
    }
}

// ---------------------------------------------------------------------------
// generic
// ---------------------------------------------------------------------------

/// Echoes its parameters back. The default no-op executor type.
pub struct GenericHandler;

#[async_trait]
impl Handler for GenericHandler {
    fn types(&self) -> Vec<String> {
        vec!["generic".into()]
    }

    async fn execute(&self, ctx: &ExecutionContext) -> Result<Value, HandlerFailure> {
        Ok(json!({ "echo": ctx.parameters }))
    }
}

/// Registry preloaded with every built-in handler.
pub fn builtin_registry() -> super::HandlerRegistry {
    let mut registry = super::HandlerRegistry::new();
    registry.register(CodeExecutorHandler::new());
    registry.register(FileWriterHandler);
    registry.register(ApiCallerHandler::new());
    registry.register(GenericHandler);
    registry
}
