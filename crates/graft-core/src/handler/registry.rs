//! Handler registry -- a tagged collection of available handlers.
//!
//! Resolution is two-phase: a typed map lookup first, then a linear scan
//! over handlers whose `accepts` predicate claims the
//! `(executor_type, parameters)` pair. No inheritance, one interface.

use std::collections::HashMap;
use std::sync::Arc;

use super::Handler;

/// A collection of registered [`Handler`]s, keyed by executor type.
#[derive(Default, Clone)]
pub struct HandlerRegistry {
    handlers: Vec<Arc<dyn Handler>>,
    by_type: HashMap<String, usize>,
}

impl HandlerRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler under every executor type it advertises.
    ///
    /// A later registration for the same type shadows the earlier one.
    pub fn register(&mut self, handler: impl Handler + 'static) {
        let handler: Arc<dyn Handler> = Arc::new(handler);
        let idx = self.handlers.len();
        for executor_type in handler.types() {
            self.by_type.insert(executor_type, idx);
        }
        self.handlers.push(handler);
    }

    /// Resolve a handler for a task: typed lookup first, then the first
    /// handler whose `accepts` predicate matches.
    pub fn resolve(
        &self,
        executor_type: &str,
        parameters: &serde_json::Value,
    ) -> Option<Arc<dyn Handler>> {
        if let Some(&idx) = self.by_type.get(executor_type) {
            return Some(Arc::clone(&self.handlers[idx]));
        }
        self.handlers
            .iter()
            .find(|h| h.accepts(executor_type, parameters))
            .cloned()
    }

    /// Executor types with a direct registration, sorted.
    pub fn registered_types(&self) -> Vec<String> {
        let mut types: Vec<String> = self.by_type.keys().cloned().collect();
        types.sort();
        types
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

impl std::fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("types", &self.registered_types())
            .finish()
    }
}
