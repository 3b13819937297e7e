//! Durable Store
//!
//! Source tables (orders and their items) plus the append-only checkpoint log.

use super::types::*;
use crate::error::StoreError;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::{Mutex, RwLock};

/// Access to orders and the checkpoint log.
#[async_trait]
pub trait OrderStore: Send + Sync {
    /// Current time on the clock that stamps `Order.created_at`.
    async fn now(&self) -> Result<DateTime<Utc>, StoreError>;

    /// The checkpoint with the most recent `created_at`, if any.
    async fn latest_checkpoint(&self) -> Result<Option<StatsCheckpoint>, StoreError>;

    /// Orders with `after < created_at <= up_to`, items included.
    /// `after = None` means no lower bound.
    async fn orders_between(
        &self,
        after: Option<DateTime<Utc>>,
        up_to: DateTime<Utc>,
    ) -> Result<Vec<Order>, StoreError>;

    /// Appends `checkpoint` if the current latest checkpoint is still `parent`.
    ///
    /// Fails with `StoreError::Conflict` otherwise; nothing is written then.
    async fn append_checkpoint(
        &self,
        parent: Option<&str>,
        checkpoint: &StatsCheckpoint,
    ) -> Result<(), StoreError>;
}

/// In-process Durable Store.
pub struct MemoryOrderStore {
    orders: RwLock<Vec<Order>>,
    checkpoints: Mutex<Vec<StatsCheckpoint>>,
    online: AtomicBool,
    /// Offset of this store's clock from the host clock.
    clock_skew: Duration,
}

impl MemoryOrderStore {
    pub fn new() -> Self {
        Self {
            orders: RwLock::new(Vec::new()),
            checkpoints: Mutex::new(Vec::new()),
            online: AtomicBool::new(true),
            clock_skew: Duration::zero(),
        }
    }

    /// A store whose clock runs `skew` ahead of the host (behind if negative).
    pub fn with_clock_skew(mut self, skew: Duration) -> Self {
        self.clock_skew = skew;
        self
    }

    /// Plays the external order-management process.
    pub async fn insert_order(&self, order: Order) {
        self.orders.write().await.push(order);
    }

    /// Seeds the log, bypassing the compare-and-swap.
    pub async fn seed_checkpoint(&self, checkpoint: StatsCheckpoint) {
        self.checkpoints.lock().await.push(checkpoint);
    }

    /// Snapshot of the whole log in append order.
    pub async fn checkpoints(&self) -> Vec<StatsCheckpoint> {
        self.checkpoints.lock().await.clone()
    }

    pub fn set_online(&self, online: bool) {
        self.online.store(online, Ordering::SeqCst);
    }

    fn ensure_online(&self) -> Result<(), StoreError> {
        if self.online.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(StoreError::Unavailable("in-process order store is offline".to_string()))
        }
    }
}

impl Default for MemoryOrderStore {
    fn default() -> Self {
        Self::new()
    }
}

/// Latest by `created_at`; ties go to the later append.
fn latest_of(checkpoints: &[StatsCheckpoint]) -> Option<&StatsCheckpoint> {
    checkpoints
        .iter()
        .enumerate()
        .max_by_key(|(index, checkpoint)| (checkpoint.created_at, *index))
        .map(|(_, checkpoint)| checkpoint)
}

#[async_trait]
impl OrderStore for MemoryOrderStore {
    async fn now(&self) -> Result<DateTime<Utc>, StoreError> {
        self.ensure_online()?;
        Ok(Utc::now() + self.clock_skew)
    }

    async fn latest_checkpoint(&self) -> Result<Option<StatsCheckpoint>, StoreError> {
        self.ensure_online()?;
        let checkpoints = self.checkpoints.lock().await;
        Ok(latest_of(&checkpoints).cloned())
    }

    async fn orders_between(
        &self,
        after: Option<DateTime<Utc>>,
        up_to: DateTime<Utc>,
    ) -> Result<Vec<Order>, StoreError> {
        self.ensure_online()?;
        let orders = self.orders.read().await;
        Ok(orders
            .iter()
            .filter(|order| after.map_or(true, |after| order.created_at > after))
            .filter(|order| order.created_at <= up_to)
            .cloned()
            .collect())
    }

    async fn append_checkpoint(
        &self,
        parent: Option<&str>,
        checkpoint: &StatsCheckpoint,
    ) -> Result<(), StoreError> {
        self.ensure_online()?;
        let mut checkpoints = self.checkpoints.lock().await;

        let head = latest_of(&checkpoints).map(|c| c.id.clone());
        if head.as_deref() != parent {
            return Err(StoreError::Conflict {
                expected: parent.map(str::to_string),
                found: head,
            });
        }

        checkpoints.push(checkpoint.clone());
        Ok(())
    }
}
