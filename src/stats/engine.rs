//! Aggregation Engine
//!
//! The body of the `calculate_order_stats` task.

use super::lock::SingleFlight;
use super::store::OrderStore;
use super::types::*;
use crate::error::StoreError;
use crate::executor::registry::TaskHandlerRegistry;
use crate::executor::types::{TaskError, TaskKind};

use chrono::Duration;
use std::sync::Arc;

/// Lock key shared by every run of the aggregation, wherever it executes.
pub const STATS_LOCK_KEY: &str = TaskKind::CalculateOrderStats.name();

const DEFAULT_MAX_ATTEMPTS: u32 = 3;

pub struct StatsEngine {
    store: Arc<dyn OrderStore>,
    lock: Arc<dyn SingleFlight>,
    /// Compare-and-swap attempts before giving up with `DuplicateExecution`.
    max_attempts: u32,
}

impl StatsEngine {
    pub fn new(store: Arc<dyn OrderStore>, lock: Arc<dyn SingleFlight>) -> Self {
        Self {
            store,
            lock,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
        }
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    /// Registers this engine as the handler for `calculate_order_stats`.
    pub fn register(self: Arc<Self>, registry: &TaskHandlerRegistry) {
        registry.register(TaskKind::CalculateOrderStats, move |_request| {
            let engine = self.clone();
            async move {
                let checkpoint = engine
                    .run()
                    .await
                    .map_err(|e| TaskError::Execution(e.to_string()))?;
                serde_json::to_value(checkpoint.totals)
                    .map_err(|e| TaskError::Execution(e.to_string()))
            }
        });
    }

    /// Runs one aggregation under the single-flight lock.
    ///
    /// Either a new checkpoint is appended and returned, or nothing is written.
    pub async fn run(&self) -> Result<StatsCheckpoint, StatsError> {
        let token = self.lock.acquire(STATS_LOCK_KEY).await?;
        let outcome = self.run_with_retries().await;

        if let Err(e) = self.lock.release(token).await {
            tracing::warn!("Failed to release {} lock: {}", STATS_LOCK_KEY, e);
        }

        outcome
    }

    async fn run_with_retries(&self) -> Result<StatsCheckpoint, StatsError> {
        for attempt in 1..=self.max_attempts {
            match self.aggregate_once().await {
                Ok(checkpoint) => return Ok(checkpoint),
                Err(StatsError::Store(StoreError::Conflict { expected, found })) => {
                    tracing::warn!(
                        "Checkpoint head moved from {:?} to {:?} (attempt {}/{}), recomputing",
                        expected,
                        found,
                        attempt,
                        self.max_attempts
                    );
                }
                Err(e) => return Err(e),
            }
        }

        Err(StatsError::DuplicateExecution {
            attempts: self.max_attempts,
        })
    }

    /// One read-compute-append pass without the lock.
    ///
    /// The append is conditional on the checkpoint read at the start still being
    /// the latest, so a concurrent pass makes this one fail with a conflict
    /// instead of double counting.
    pub async fn aggregate_once(&self) -> Result<StatsCheckpoint, StatsError> {
        let prior = self.store.latest_checkpoint().await?;
        let watermark = prior.as_ref().map(StatsCheckpoint::watermark);

        // Orders landing after the cutoff belong to the next run. The cutoff is
        // read from the store because that clock stamps the orders.
        let now = self.store.now().await?;
        let cutoff = watermark.map_or(now, |w| w.max(now));

        let orders = self.store.orders_between(watermark, cutoff).await?;
        let delta = StatsDelta::from_orders(&orders);

        let base = prior.as_ref().map(|c| c.totals).unwrap_or_default();
        // Strictly after the parent, so "latest by created_at" has one answer.
        let created_at = prior.as_ref().map_or(now, |c| {
            now.max(c.created_at + Duration::microseconds(1))
        });

        let checkpoint = StatsCheckpoint {
            id: uuid::Uuid::new_v4().to_string(),
            totals: base.apply(&delta),
            created_at,
            updated_at: cutoff,
        };

        self.store
            .append_checkpoint(prior.as_ref().map(|c| c.id.as_str()), &checkpoint)
            .await?;

        tracing::info!(
            "Order stats checkpoint {}: +{} orders, +{} units, +{:.2} amount -> {} / {} / {:.2}",
            checkpoint.id,
            delta.orders,
            delta.units,
            delta.amount,
            checkpoint.totals.total_orders,
            checkpoint.totals.total_units,
            checkpoint.totals.total_amount
        );

        Ok(checkpoint)
    }
}
