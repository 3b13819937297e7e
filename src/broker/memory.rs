//! In-Process Broker
//!
//! A FIFO queue plus an in-flight table, shared by every worker of one process.
//! Receivers park on a `Notify` instead of polling.

use super::types::*;

use async_trait::async_trait;
use dashmap::DashMap;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::{Mutex, Notify};
use tokio::time::Instant;

struct InFlight {
    envelope: Envelope,
    deadline: Instant,
}

pub struct MemoryBroker {
    /// Messages waiting for a worker, oldest first.
    ready: Mutex<VecDeque<Envelope>>,
    /// Delivered but not yet acked. Keyed by receipt.
    in_flight: DashMap<String, InFlight>,
    available: Notify,
    online: AtomicBool,
    visibility_timeout: Duration,
}

impl MemoryBroker {
    pub fn new(visibility_timeout: Duration) -> Self {
        Self {
            ready: Mutex::new(VecDeque::new()),
            in_flight: DashMap::new(),
            available: Notify::new(),
            online: AtomicBool::new(true),
            visibility_timeout,
        }
    }

    /// Simulates losing (or regaining) the broker connection.
    pub fn set_online(&self, online: bool) {
        self.online.store(online, Ordering::SeqCst);
        if online {
            self.available.notify_waiters();
        }
    }

    pub async fn ready_len(&self) -> usize {
        self.ready.lock().await.len()
    }

    pub fn in_flight_len(&self) -> usize {
        self.in_flight.len()
    }

    fn ensure_online(&self) -> Result<(), BrokerError> {
        if self.online.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(BrokerError::Unavailable("in-process broker is offline".to_string()))
        }
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    async fn publish(&self, message: TaskMessage) -> Result<(), BrokerError> {
        self.ensure_online()?;

        tracing::debug!("Publishing task {} ({})", message.id, message.name);
        self.ready.lock().await.push_back(Envelope::first(message));
        self.available.notify_one();
        Ok(())
    }

    async fn receive(&self) -> Result<Delivery, BrokerError> {
        loop {
            self.ensure_online()?;

            // Register interest before checking the queue so a publish in between is not lost.
            let notified = self.available.notified();

            if let Some(envelope) = self.ready.lock().await.pop_front() {
                let delivery = Delivery {
                    message: envelope.message.clone(),
                    receipt: envelope.delivery_id.clone(),
                    attempt: envelope.attempt,
                };
                self.in_flight.insert(
                    envelope.delivery_id.clone(),
                    InFlight {
                        envelope,
                        deadline: Instant::now() + self.visibility_timeout,
                    },
                );
                return Ok(delivery);
            }

            notified.await;
        }
    }

    async fn ack(&self, delivery: &Delivery) -> Result<(), BrokerError> {
        if self.in_flight.remove(&delivery.receipt).is_none() {
            tracing::debug!(
                "Ack for task {} ignored, receipt already gone",
                delivery.message.id
            );
        }
        Ok(())
    }

    async fn extend(&self, delivery: &Delivery) -> Result<(), BrokerError> {
        match self.in_flight.get_mut(&delivery.receipt) {
            Some(mut entry) => {
                entry.deadline = Instant::now() + self.visibility_timeout;
                Ok(())
            }
            None => Err(BrokerError::UnknownDelivery(delivery.receipt.clone())),
        }
    }

    async fn requeue_expired(&self) -> Result<usize, BrokerError> {
        let now = Instant::now();
        let expired: Vec<String> = self
            .in_flight
            .iter()
            .filter(|entry| entry.value().deadline <= now)
            .map(|entry| entry.key().clone())
            .collect();

        let mut requeued = 0;
        for receipt in expired {
            // Re-check under the shard lock; an ack may have raced us.
            if let Some((_, in_flight)) = self
                .in_flight
                .remove_if(&receipt, |_, entry| entry.deadline <= now)
            {
                let envelope = in_flight.envelope.redelivery();
                tracing::warn!(
                    "Task {} missed its visibility deadline, redelivering (attempt {})",
                    envelope.message.id,
                    envelope.attempt
                );
                self.ready.lock().await.push_front(envelope);
                self.available.notify_one();
                requeued += 1;
            }
        }

        Ok(requeued)
    }

    fn visibility_timeout(&self) -> Duration {
        self.visibility_timeout
    }
}
