use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use thiserror::Error;

/// Unique identifier for a submitted task.
///
/// Wrapper around a UUID string. Generated by the dispatcher at submission time
/// and used as the key of the task's entry in the Result Store.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(transparent)]
pub struct TaskId(pub String);

impl TaskId {
    /// Generates a new random UUID v4-based TaskId.
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// The task bodies a worker knows how to run.
///
/// Every variant must have a handler in the `TaskHandlerRegistry` before the
/// worker pool is allowed to start.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    /// Incremental order statistics aggregation.
    CalculateOrderStats,
}

impl TaskKind {
    pub const ALL: [TaskKind; 1] = [TaskKind::CalculateOrderStats];

    /// Wire name used in task messages.
    pub const fn name(self) -> &'static str {
        match self {
            TaskKind::CalculateOrderStats => "calculate_order_stats",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.name() == name)
    }
}

impl fmt::Display for TaskKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A task invocation decoded from its wire form, with arguments validated
/// against the fixed schema of its kind.
#[derive(Debug, Clone, PartialEq)]
pub enum TaskRequest {
    CalculateOrderStats,
}

impl TaskRequest {
    /// Decodes `(name, args)` as carried by a broker message.
    pub fn decode(name: &str, args: &[Value]) -> Result<Self, TaskError> {
        let kind =
            TaskKind::from_name(name).ok_or_else(|| TaskError::UnknownTask(name.to_string()))?;

        match kind {
            TaskKind::CalculateOrderStats => {
                if !args.is_empty() {
                    return Err(TaskError::InvalidArguments {
                        task: kind.name().to_string(),
                        reason: format!("expected no arguments, got {}", args.len()),
                    });
                }
                Ok(TaskRequest::CalculateOrderStats)
            }
        }
    }

    pub fn kind(&self) -> TaskKind {
        match self {
            TaskRequest::CalculateOrderStats => TaskKind::CalculateOrderStats,
        }
    }

    /// Positional arguments in wire form.
    pub fn args(&self) -> Vec<Value> {
        match self {
            TaskRequest::CalculateOrderStats => Vec::new(),
        }
    }
}

/// Faults raised while resolving or running a task body.
///
/// All of these end up as a `FAILURE` record in the Result Store; none of them
/// stop the worker loop.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum TaskError {
    #[error("unknown task: {0}")]
    UnknownTask(String),

    #[error("invalid arguments for {task}: {reason}")]
    InvalidArguments { task: String, reason: String },

    #[error("no handler registered for {0}")]
    NoHandler(TaskKind),

    #[error("task execution failed: {0}")]
    Execution(String),

    #[error("task panicked: {0}")]
    Panicked(String),
}
