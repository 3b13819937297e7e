//! Worker Pool Implementation
//!
//! Spawns workers that block on the broker, run the named task body and record
//! each status transition in the Result Store.
//!
//! ## Responsibilities
//! - **Consuming**: One blocking `receive` per worker; no busy polling.
//! - **Lease Management**: A sidecar task extends the delivery's visibility deadline
//!   while the body runs, and a reaper hands expired deliveries back to the queue.
//! - **Containment**: Errors and panics in task bodies become `FAILURE` records and
//!   never take a worker down.

use super::registry::TaskHandlerRegistry;
use super::types::*;
use crate::broker::types::{Broker, Delivery};
use crate::results::types::{ResultStore, TaskState};

use anyhow::Result;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

/// Upper bound for the pause after a failed `receive`.
const MAX_RECEIVE_BACKOFF: Duration = Duration::from_secs(5);

/// The engine that drives task execution.
pub struct TaskExecutor {
    broker: Arc<dyn Broker>,
    results: Arc<dyn ResultStore>,
    handlers: Arc<TaskHandlerRegistry>,
    /// Number of concurrent worker loops.
    worker_count: usize,
}

impl TaskExecutor {
    pub fn new(
        broker: Arc<dyn Broker>,
        results: Arc<dyn ResultStore>,
        handlers: Arc<TaskHandlerRegistry>,
        worker_count: usize,
    ) -> Arc<Self> {
        Arc::new(Self {
            broker,
            results,
            handlers,
            worker_count,
        })
    }

    /// Spawns the workers and the redelivery reaper, then returns immediately.
    ///
    /// Fails if some task kind has no registered handler.
    pub fn start(self: Arc<Self>) -> Result<Vec<JoinHandle<()>>> {
        let missing = self.handlers.missing_kinds();
        if !missing.is_empty() {
            anyhow::bail!("no handler registered for task kinds {:?}", missing);
        }

        tracing::info!("Starting {} task workers", self.worker_count);

        let mut handles = Vec::with_capacity(self.worker_count + 1);
        for worker_id in 0..self.worker_count {
            let executor = self.clone();
            handles.push(tokio::spawn(async move {
                executor.worker_loop(worker_id).await;
            }));
        }

        let executor = self.clone();
        handles.push(tokio::spawn(async move {
            executor.reaper_loop().await;
        }));

        tracing::info!("Task executor started with {} workers", self.worker_count);
        Ok(handles)
    }

    /// The main loop for a single worker.
    async fn worker_loop(&self, worker_id: usize) {
        tracing::info!("Worker {} started", worker_id);
        let mut backoff = Duration::from_millis(100);

        loop {
            match self.broker.receive().await {
                Ok(delivery) => {
                    backoff = Duration::from_millis(100);
                    tracing::info!(
                        "Worker {} received task {} (handler: {}, attempt {})",
                        worker_id,
                        delivery.message.id,
                        delivery.message.name,
                        delivery.attempt
                    );
                    self.process(delivery).await;
                }
                Err(e) => {
                    tracing::warn!("Worker {} failed to receive: {}", worker_id, e);
                    let jitter = rand::random::<u64>() % 50;
                    tokio::time::sleep(backoff + Duration::from_millis(jitter)).await;
                    backoff = (backoff * 2).min(MAX_RECEIVE_BACKOFF);
                }
            }
        }
    }

    /// Periodically returns deliveries whose visibility deadline passed.
    async fn reaper_loop(&self) {
        let period = (self.broker.visibility_timeout() / 2).max(Duration::from_millis(100));
        let mut interval = tokio::time::interval(period);

        loop {
            interval.tick().await;
            match self.broker.requeue_expired().await {
                Ok(0) => {}
                Ok(n) => tracing::warn!("Requeued {} expired deliveries", n),
                Err(e) => tracing::warn!("Failed to requeue expired deliveries: {}", e),
            }
        }
    }

    /// Handles one delivery from claim to ack.
    ///
    /// 1. Records `STARTED`. A task that already finished is acked and skipped.
    /// 2. Decodes and runs the body under a visibility lease.
    /// 3. Records the terminal state, then acks.
    ///
    /// If the Result Store cannot be written the delivery is left unacked so the
    /// broker redelivers it later.
    pub async fn process(&self, delivery: Delivery) {
        let task_id = delivery.message.id.clone();
        let name = delivery.message.name.clone();

        match self
            .results
            .transition(&task_id, &name, TaskState::Started)
            .await
        {
            Ok(true) => {}
            Ok(false) => {
                tracing::info!("Task {} already finished, dropping redelivery", task_id);
                self.ack(&delivery).await;
                return;
            }
            Err(e) => {
                tracing::error!("Cannot record STARTED for task {}: {}", task_id, e);
                return;
            }
        }

        let state = match TaskRequest::decode(&name, &delivery.message.args) {
            Ok(request) => self.execute_with_lease(&delivery, request).await,
            Err(e) => TaskState::Failure {
                error: e.to_string(),
            },
        };

        match self.results.transition(&task_id, &name, state).await {
            Ok(true) => tracing::info!("Task {} finished", task_id),
            Ok(false) => {
                tracing::warn!("Task {} was finished by another attempt first", task_id)
            }
            Err(e) => {
                tracing::error!("Failed to record outcome of task {}: {}", task_id, e);
                return;
            }
        }

        self.ack(&delivery).await;
    }

    async fn ack(&self, delivery: &Delivery) {
        if let Err(e) = self.broker.ack(delivery).await {
            tracing::warn!("Failed to ack task {}: {}", delivery.message.id, e);
        }
    }

    /// Runs the body while a sidecar keeps the delivery invisible to other workers.
    async fn execute_with_lease(&self, delivery: &Delivery, request: TaskRequest) -> TaskState {
        let renewal_handle = self.spawn_lease_renewal(delivery);

        // The body runs on its own task so a panic surfaces as a JoinError here.
        let handlers = self.handlers.clone();
        let outcome = tokio::spawn(async move { handlers.execute(request).await }).await;

        renewal_handle.abort();

        match outcome {
            Ok(Ok(result)) => TaskState::Success { result },
            Ok(Err(e)) => {
                tracing::error!("Task {} failed: {}", delivery.message.id, e);
                TaskState::Failure {
                    error: e.to_string(),
                }
            }
            Err(join_error) => {
                let error = TaskError::Panicked(panic_message(join_error));
                tracing::error!("Task {} failed: {}", delivery.message.id, error);
                TaskState::Failure {
                    error: error.to_string(),
                }
            }
        }
    }

    /// Extends the visibility deadline every third of the timeout.
    fn spawn_lease_renewal(&self, delivery: &Delivery) -> JoinHandle<()> {
        let broker = self.broker.clone();
        let delivery = delivery.clone();
        let period = (broker.visibility_timeout() / 3).max(Duration::from_millis(10));

        tokio::spawn(async move {
            loop {
                tokio::time::sleep(period).await;

                match broker.extend(&delivery).await {
                    Ok(_) => {
                        tracing::trace!("Renewed lease for task {}", delivery.message.id);
                    }
                    Err(_) => {
                        // Acked, or already handed to someone else.
                        tracing::trace!(
                            "Task {} no longer needs lease renewal",
                            delivery.message.id
                        );
                        break;
                    }
                }
            }
        })
    }
}

fn panic_message(join_error: tokio::task::JoinError) -> String {
    if !join_error.is_panic() {
        return join_error.to_string();
    }
    let payload = join_error.into_panic();
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
