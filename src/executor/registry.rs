//! Task Handler Registry
//!
//! Maps each `TaskKind` to the async closure that implements it. Handlers are
//! registered at startup; the worker pool refuses to start while any kind is
//! left without one.

use super::types::*;

use dashmap::DashMap;
use serde_json::Value;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

/// Type alias for a thread-safe, asynchronous task handler function.
/// It takes the decoded request and resolves to the task's JSON result.
pub type TaskHandlerFn = Arc<
    dyn Fn(TaskRequest) -> Pin<Box<dyn Future<Output = Result<Value, TaskError>> + Send>>
        + Send
        + Sync,
>;

/// Registry holding the mapping between task kinds and their implementation.
pub struct TaskHandlerRegistry {
    handlers: DashMap<TaskKind, TaskHandlerFn>,
}

impl TaskHandlerRegistry {
    /// Creates a new, empty registry.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Registers the handler for `kind`, replacing any previous one.
    pub fn register<F, Fut>(&self, kind: TaskKind, handler: F)
    where
        F: Fn(TaskRequest) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, TaskError>> + Send + 'static,
    {
        // Box::pin erases the concrete future type so every handler fits one map.
        let handler_fn: TaskHandlerFn = Arc::new(move |request: TaskRequest| {
            Box::pin(handler(request))
                as Pin<Box<dyn Future<Output = Result<Value, TaskError>> + Send>>
        });

        self.handlers.insert(kind, handler_fn);

        tracing::info!("Registered task handler: {}", kind);
    }

    /// Runs the handler registered for the request's kind.
    pub async fn execute(&self, request: TaskRequest) -> Result<Value, TaskError> {
        let kind = request.kind();

        // Clone the Arc out so the shard lock is not held across the await.
        let handler_fn = self
            .handlers
            .get(&kind)
            .map(|entry| entry.value().clone())
            .ok_or(TaskError::NoHandler(kind))?;

        tracing::debug!("Executing task with handler '{}'", kind);
        handler_fn(request).await
    }

    /// Kinds that still lack a handler.
    pub fn missing_kinds(&self) -> Vec<TaskKind> {
        TaskKind::ALL
            .into_iter()
            .filter(|kind| !self.handlers.contains_key(kind))
            .collect()
    }

    pub fn has_handler(&self, kind: TaskKind) -> bool {
        self.handlers.contains_key(&kind)
    }

    pub fn handler_count(&self) -> usize {
        self.handlers.len()
    }
}

impl Default for TaskHandlerRegistry {
    fn default() -> Self {
        Self {
            handlers: DashMap::new(),
        }
    }
}
