//! Topic routing keys and binding patterns.
//!
//! Keys are dot-separated segments. Binding patterns follow AMQP topic
//! semantics: `*` matches exactly one segment, `#` matches zero or more.

/// Queue consumed by evaluators; bound to `result.#`.
pub const RESULTS_QUEUE: &str = "results";

/// Binding pattern that captures every result key.
pub const RESULTS_PATTERN: &str = "result.#";

/// Routing key for dispatching a task of the given executor type.
pub fn dispatch_key(executor_type: &str) -> String {
    format!("task.{executor_type}")
}

/// Additional routing key published per required capability.
pub fn capability_key(capability: &str) -> String {
    format!("task.cap.{capability}")
}

/// Routing key for a result envelope.
pub fn result_key(executor_type: &str) -> String {
    format!("result.{executor_type}")
}

/// Shared work queue for executors of a given type. Every executor
/// instance advertising the type consumes from the same queue, so
/// dispatches are load-balanced across the pool.
pub fn dispatch_queue(executor_type: &str) -> String {
    format!("task.{executor_type}")
}

/// Match a routing key against a binding pattern.
pub fn pattern_matches(pattern: &str, key: &str) -> bool {
    let pat: Vec<&str> = pattern.split('.').collect();
    let segs: Vec<&str> = key.split('.').collect();
    matches_from(&pat, &segs)
}

fn matches_from(pattern: &[&str], segments: &[&str]) -> bool {
    match pattern.split_first() {
        None => segments.is_empty(),
        Some((&"#", rest)) => {
            // `#` absorbs zero or more segments.
            (0..=segments.len()).any(|skip| matches_from(rest, &segments[skip..]))
        }
        Some((&"*", rest)) => match segments.split_first() {
            Some((_, seg_rest)) => matches_from(rest, seg_rest),
            None => false,
        },
        Some((literal, rest)) => match segments.split_first() {
            Some((seg, seg_rest)) if seg == literal => matches_from(rest, seg_rest),
            _ => false,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn literal_match() {
        assert!(pattern_matches("task.code_executor", "task.code_executor"));
        assert!(!pattern_matches("task.code_executor", "task.file_writer"));
    }

    #[test]
    fn star_matches_one_segment() {
        assert!(pattern_matches("task.*", "task.code_executor"));
        assert!(!pattern_matches("task.*", "task.cap.python"));
        assert!(!pattern_matches("task.*", "task"));
    }

    #[test]
    fn hash_matches_zero_or_more() {
        assert!(pattern_matches("result.#", "result.code_executor"));
        assert!(pattern_matches("result.#", "result"));
        assert!(pattern_matches("#", "anything.at.all"));
        assert!(!pattern_matches("result.#", "task.code_executor"));
    }

    #[test]
    fn hash_in_middle() {
        assert!(pattern_matches("task.#.done", "task.a.b.done"));
        assert!(pattern_matches("task.#.done", "task.done"));
        assert!(!pattern_matches("task.#.done", "task.a.b"));
    }

    #[test]
    fn key_helpers_compose() {
        assert_eq!(dispatch_key("file_writer"), "task.file_writer");
        assert_eq!(capability_key("python"), "task.cap.python");
        assert_eq!(result_key("api_caller"), "result.api_caller");
        assert!(pattern_matches(RESULTS_PATTERN, &result_key("generic")));
    }
}
