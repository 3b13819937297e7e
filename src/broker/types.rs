use crate::executor::types::TaskId;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;
use thiserror::Error;

/// Name of the single routing class every task is published to.
pub const DEFAULT_QUEUE: &str = "default";

/// A task as it travels through the broker: `{id, name, args}`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TaskMessage {
    pub id: TaskId,
    pub name: String,
    #[serde(default)]
    pub args: Vec<Value>,
    pub published_at: DateTime<Utc>,
}

impl TaskMessage {
    /// Builds a message for a fresh task id.
    pub fn new(name: &str, args: Vec<Value>) -> Self {
        Self {
            id: TaskId::new(),
            name: name.to_string(),
            args,
            published_at: Utc::now(),
        }
    }
}

/// Broker-side wrapper around a message.
///
/// `delivery_id` is regenerated on every (re)delivery so that two copies of
/// the same task message never share a receipt.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Envelope {
    pub delivery_id: String,
    pub attempt: u32,
    pub message: TaskMessage,
}

impl Envelope {
    pub fn first(message: TaskMessage) -> Self {
        Self {
            delivery_id: uuid::Uuid::new_v4().to_string(),
            attempt: 1,
            message,
        }
    }

    /// The envelope to put back on the queue after a missed deadline.
    pub fn redelivery(&self) -> Self {
        Self {
            delivery_id: uuid::Uuid::new_v4().to_string(),
            attempt: self.attempt + 1,
            message: self.message.clone(),
        }
    }
}

/// A message handed to a worker, together with the receipt needed to ack it.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub message: TaskMessage,
    pub receipt: String,
    /// 1 on first delivery, incremented on every redelivery.
    pub attempt: u32,
}

#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("broker unavailable: {0}")]
    Unavailable(String),

    #[error("malformed task message: {0}")]
    Codec(#[from] serde_json::Error),

    #[error("delivery {0} is no longer in flight")]
    UnknownDelivery(String),
}

/// At-least-once message channel between producers and workers.
#[async_trait]
pub trait Broker: Send + Sync {
    /// Enqueues a message. Never waits for a worker.
    async fn publish(&self, message: TaskMessage) -> Result<(), BrokerError>;

    /// Blocks until a message is available and marks it in flight.
    async fn receive(&self) -> Result<Delivery, BrokerError>;

    /// Removes an in-flight message permanently. Acking twice is not an error.
    async fn ack(&self, delivery: &Delivery) -> Result<(), BrokerError>;

    /// Pushes the visibility deadline of an in-flight message forward.
    async fn extend(&self, delivery: &Delivery) -> Result<(), BrokerError>;

    /// Moves every in-flight message past its deadline back onto the queue.
    /// Returns how many were requeued.
    async fn requeue_expired(&self) -> Result<usize, BrokerError>;

    fn visibility_timeout(&self) -> Duration;
}
