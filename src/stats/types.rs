use crate::error::StoreError;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// A line of an order. Read-only from this crate's point of view.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderItem {
    pub id: String,
    pub order_id: String,
    pub quantity: u64,
}

/// An order with its items loaded eagerly.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Order {
    pub id: String,
    /// Missing totals count as zero.
    pub total: Option<f64>,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub items: Vec<OrderItem>,
}

impl Order {
    pub fn units(&self) -> u64 {
        self.items.iter().map(|item| item.quantity).sum()
    }
}

/// Accumulated counters. Also the result payload of `calculate_order_stats`.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderTotals {
    pub total_orders: u64,
    pub total_units: u64,
    pub total_amount: f64,
}

impl OrderTotals {
    /// Element-wise `self + delta`.
    pub fn apply(&self, delta: &StatsDelta) -> Self {
        Self {
            total_orders: self.total_orders.saturating_add(delta.orders),
            total_units: self.total_units.saturating_add(delta.units),
            total_amount: self.total_amount + delta.amount,
        }
    }
}

/// Contribution of the orders found after the watermark.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct StatsDelta {
    pub orders: u64,
    pub units: u64,
    pub amount: f64,
}

impl StatsDelta {
    pub fn from_orders(orders: &[Order]) -> Self {
        orders.iter().fold(Self::default(), |acc, order| Self {
            orders: acc.orders + 1,
            units: acc.units.saturating_add(order.units()),
            amount: acc.amount + order.total.unwrap_or(0.0),
        })
    }

    pub fn is_empty(&self) -> bool {
        self.orders == 0
    }
}

/// One immutable entry of the aggregate log.
///
/// `updated_at` is the watermark: every order created at or before it is
/// included in the totals. It is written once, at creation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatsCheckpoint {
    pub id: String,
    #[serde(flatten)]
    pub totals: OrderTotals,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl StatsCheckpoint {
    pub fn watermark(&self) -> DateTime<Utc> {
        self.updated_at
    }
}

#[derive(Debug, Error)]
pub enum StatsError {
    #[error(transparent)]
    Store(#[from] StoreError),

    /// Another run kept appending between our read and our write.
    #[error("checkpoint log moved during {attempts} attempts, refusing to double count")]
    DuplicateExecution { attempts: u32 },
}
