//! Per-executor-type result validators.
//!
//! A validator inspects an `ok` outcome and may reject it: an executor
//! that claims success is not trusted when the evidence says otherwise.
//! Custom executor types fall back to trusting the reported outcome.

use serde_json::Value;

/// A validator's judgement of an `ok` outcome.
#[derive(Debug, Clone)]
pub struct Verdict {
    pub passed: bool,
    /// Name of the validator that produced this verdict.
    pub validator: &'static str,
    /// Populated when the verdict is a rejection.
    pub reason: Option<String>,
}

impl Verdict {
    fn pass(validator: &'static str) -> Self {
        Self {
            passed: true,
            validator,
            reason: None,
        }
    }

    fn reject(validator: &'static str, reason: impl Into<String>) -> Self {
        Self {
            passed: false,
            validator,
            reason: Some(reason.into()),
        }
    }
}

/// Validate an `ok` result for a task.
///
/// `parameters` are the task's parameters; `data` is the executor's result
/// payload. `stderr_whitelist` holds substrings that make stderr output
/// acceptable for `code_executor` results.
pub async fn validate(
    executor_type: &str,
    parameters: &Value,
    data: Option<&Value>,
    stderr_whitelist: &[String],
) -> Verdict {
    match executor_type {
        "code_executor" => validate_code(data, stderr_whitelist),
        "file_writer" => validate_file(parameters, data).await,
        "api_caller" => validate_api(data),
        _ => Verdict::pass("outcome"),
    }
}

fn validate_code(data: Option<&Value>, stderr_whitelist: &[String]) -> Verdict {
    let Some(data) = data else {
        return Verdict::reject("code_executor", "result carries no data");
    };

    let status = data.get("status").and_then(|s| s.as_str()).unwrap_or("");
    if status != "success" {
        return Verdict::reject("code_executor", format!("handler status was {status:?}"));
    }

    let stderr = data.get("stderr").and_then(|s| s.as_str()).unwrap_or("");
    if stderr.trim().is_empty() {
        return Verdict::pass("code_executor");
    }
    if stderr_whitelist.iter().any(|allowed| stderr.contains(allowed)) {
        return Verdict::pass("code_executor");
    }

    Verdict::reject(
        "code_executor",
        format!("stderr not empty and not whitelisted: {}", truncate(stderr, 500)),
    )
}

async fn validate_file(parameters: &Value, data: Option<&Value>) -> Verdict {
    // The declared path may come from the parameters or the result.
    let path = parameters
        .get("path")
        .or_else(|| data.and_then(|d| d.get("path")))
        .and_then(|p| p.as_str());

    let Some(path) = path else {
        return Verdict::reject("file_writer", "no file path declared");
    };

    let contents = match tokio::fs::read(path).await {
        Ok(contents) => contents,
        Err(e) => {
            return Verdict::reject("file_writer", format!("declared file {path} unreadable: {e}"));
        }
    };

    if let Some(expected) = parameters.get("expected_content").and_then(|c| c.as_str()) {
        if contents != expected.as_bytes() {
            return Verdict::reject(
                "file_writer",
                format!("content of {path} does not match expected_content"),
            );
        }
    }

    Verdict::pass("file_writer")
}

fn validate_api(data: Option<&Value>) -> Verdict {
    let status_code = data
        .and_then(|d| d.get("status_code"))
        .and_then(|s| s.as_i64());

    match status_code {
        Some(code) if (200..300).contains(&code) => Verdict::pass("api_caller"),
        Some(code) => Verdict::reject("api_caller", format!("http status {code}")),
        None => Verdict::reject("api_caller", "result carries no status_code"),
    }
}

fn truncate(s: &str, max: usize) -> &str {
    let mut end = s.len().min(max);
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}
