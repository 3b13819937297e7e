use crate::error::StoreError;
use crate::executor::types::TaskId;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Lifecycle state of a task as seen by pollers.
///
/// Serializes as `{"status": "PENDING"}`, `{"status": "SUCCESS", "result": ...}`
/// or `{"status": "FAILURE", "error": "..."}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskState {
    /// Published, not yet claimed. Also reported for unknown ids.
    Pending,
    /// Claimed by a worker.
    Started,
    Success { result: Value },
    Failure { error: String },
}

impl TaskState {
    /// Position in the lifecycle. Terminal states share the highest rank.
    pub fn rank(&self) -> u8 {
        match self {
            TaskState::Pending => 0,
            TaskState::Started => 1,
            TaskState::Success { .. } | TaskState::Failure { .. } => 2,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.rank() == 2
    }

    pub fn label(&self) -> &'static str {
        match self {
            TaskState::Pending => "PENDING",
            TaskState::Started => "STARTED",
            TaskState::Success { .. } => "SUCCESS",
            TaskState::Failure { .. } => "FAILURE",
        }
    }

    /// Whether a stored state may be overwritten by `next`.
    ///
    /// Forward moves are allowed, `STARTED -> STARTED` is allowed for
    /// redelivery, and terminal states never change.
    pub fn can_transition_to(&self, next: &TaskState) -> bool {
        if self.is_terminal() {
            return false;
        }
        match (self, next) {
            (TaskState::Started, TaskState::Started) => true,
            _ => next.rank() > self.rank(),
        }
    }
}

/// The Result Store entry for one task id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskRecord {
    pub task_id: TaskId,
    pub name: String,
    #[serde(flatten)]
    pub state: TaskState,
    /// Number of times a worker recorded `STARTED`.
    #[serde(default)]
    pub attempts: u32,
    pub updated_at: DateTime<Utc>,
}

/// Shared status table keyed by task id.
#[async_trait]
pub trait ResultStore: Send + Sync {
    async fn get(&self, task_id: &TaskId) -> Result<Option<TaskRecord>, StoreError>;

    /// Writes `next` if the stored state allows it.
    ///
    /// Returns `Ok(false)` when the transition was refused (for example the
    /// task already finished), which is not an error.
    async fn transition(
        &self,
        task_id: &TaskId,
        name: &str,
        next: TaskState,
    ) -> Result<bool, StoreError>;
}
