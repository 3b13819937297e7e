//! Task Dispatcher
//!
//! Producer side of the task system: publishes task messages and answers polls.

use super::types::*;
use crate::broker::types::{Broker, BrokerError, TaskMessage};
use crate::error::StoreError;
use crate::results::types::{ResultStore, TaskState};

use serde_json::Value;
use std::sync::Arc;

pub struct TaskDispatcher {
    broker: Arc<dyn Broker>,
    results: Arc<dyn ResultStore>,
}

impl TaskDispatcher {
    pub fn new(broker: Arc<dyn Broker>, results: Arc<dyn ResultStore>) -> Arc<Self> {
        Arc::new(Self { broker, results })
    }

    /// Publishes `{id, name, args}` and returns the fresh id without waiting
    /// for any worker.
    ///
    /// If the broker is unreachable no id is issued and nothing is recorded.
    pub async fn submit(&self, name: &str, args: Vec<Value>) -> Result<TaskId, BrokerError> {
        let message = TaskMessage::new(name, args);
        let task_id = message.id.clone();

        self.broker.publish(message).await?;

        // A worker may already have moved the task on; the store then refuses this write.
        if let Err(e) = self
            .results
            .transition(&task_id, name, TaskState::Pending)
            .await
        {
            tracing::warn!("Task {} published but PENDING not recorded: {}", task_id, e);
        }

        tracing::info!("Task submitted successfully: {} ({})", task_id, name);
        Ok(task_id)
    }

    pub async fn submit_request(&self, request: &TaskRequest) -> Result<TaskId, BrokerError> {
        self.submit(request.kind().name(), request.args()).await
    }

    /// Current state of a task. Unknown ids read as `PENDING`.
    pub async fn poll(&self, task_id: &TaskId) -> Result<TaskState, StoreError> {
        let record = self.results.get(task_id).await?;
        Ok(record.map_or(TaskState::Pending, |record| record.state))
    }
}
