//! Postgres-backed Durable Store.
//!
//! Reads the order-management schema (`"Order"`, `"OrderItem"`) and appends to
//! `"OrderStats"`. Timestamp columns are `timestamp without time zone` holding UTC.

use super::store::OrderStore;
use super::types::*;
use crate::error::StoreError;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDateTime, Utc};
use sqlx::{postgres::PgPoolOptions, PgPool};
use std::collections::HashMap;

const CHECKPOINT_TABLE: &str = "OrderStats";

type CheckpointRow = (String, i32, i32, f64, NaiveDateTime, NaiveDateTime);

pub struct PostgresOrderStore {
    pool: PgPool,
}

impl PostgresOrderStore {
    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .connect(database_url)
            .await
            .map_err(|e| StoreError::unavailable("postgres connect", e))?;

        tracing::info!("Connected to Postgres order store");
        Ok(Self { pool })
    }

    pub fn with_pool(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn map_db_err(context: &str) -> impl Fn(sqlx::Error) -> StoreError + '_ {
    move |e| StoreError::unavailable(context, e)
}

fn corrupt(key: &str, reason: impl std::fmt::Display) -> StoreError {
    StoreError::Corrupt {
        key: key.to_string(),
        reason: reason.to_string(),
    }
}

fn checkpoint_from_row(row: CheckpointRow) -> Result<StatsCheckpoint, StoreError> {
    let (id, orders, units, amount, created_at, updated_at) = row;
    Ok(StatsCheckpoint {
        totals: OrderTotals {
            total_orders: u64::try_from(orders).map_err(|e| corrupt(&id, e))?,
            total_units: u64::try_from(units).map_err(|e| corrupt(&id, e))?,
            total_amount: amount,
        },
        created_at: created_at.and_utc(),
        updated_at: updated_at.and_utc(),
        id,
    })
}

#[async_trait]
impl OrderStore for PostgresOrderStore {
    async fn now(&self) -> Result<DateTime<Utc>, StoreError> {
        let now: NaiveDateTime = sqlx::query_scalar("SELECT clock_timestamp() AT TIME ZONE 'UTC'")
            .fetch_one(&self.pool)
            .await
            .map_err(map_db_err("read clock"))?;
        Ok(now.and_utc())
    }

    async fn latest_checkpoint(&self) -> Result<Option<StatsCheckpoint>, StoreError> {
        let row: Option<CheckpointRow> = sqlx::query_as(
            r#"SELECT id, "totalOrders", "totalUnits", "totalAmount", "createdAt", "updatedAt"
               FROM "OrderStats"
               ORDER BY "createdAt" DESC, id DESC
               LIMIT 1"#,
        )
        .fetch_optional(&self.pool)
        .await
        .map_err(map_db_err("latest checkpoint"))?;

        row.map(checkpoint_from_row).transpose()
    }

    async fn orders_between(
        &self,
        after: Option<DateTime<Utc>>,
        up_to: DateTime<Utc>,
    ) -> Result<Vec<Order>, StoreError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(map_db_err("begin scan"))?;

        // Orders and items come from the same snapshot so count and sums agree.
        sqlx::query("SET TRANSACTION ISOLATION LEVEL REPEATABLE READ")
            .execute(&mut *tx)
            .await
            .map_err(map_db_err("set isolation"))?;

        let order_rows: Vec<(String, Option<f64>, NaiveDateTime)> = sqlx::query_as(
            r#"SELECT id, total, "createdAt"
               FROM "Order"
               WHERE ($1::timestamp IS NULL OR "createdAt" > $1)
                 AND "createdAt" <= $2
               ORDER BY "createdAt""#,
        )
        .bind(after.map(|t| t.naive_utc()))
        .bind(up_to.naive_utc())
        .fetch_all(&mut *tx)
        .await
        .map_err(map_db_err("scan orders"))?;

        let ids: Vec<String> = order_rows.iter().map(|(id, _, _)| id.clone()).collect();
        let item_rows: Vec<(String, String, i32)> = if ids.is_empty() {
            Vec::new()
        } else {
            sqlx::query_as(
                r#"SELECT id, "orderId", quantity
                   FROM "OrderItem"
                   WHERE "orderId" = ANY($1)"#,
            )
            .bind(&ids)
            .fetch_all(&mut *tx)
            .await
            .map_err(map_db_err("scan order items"))?
        };

        tx.commit().await.map_err(map_db_err("end scan"))?;

        let mut items_by_order: HashMap<String, Vec<OrderItem>> = HashMap::new();
        for (id, order_id, quantity) in item_rows {
            let quantity = u64::try_from(quantity).map_err(|e| corrupt(&id, e))?;
            items_by_order
                .entry(order_id.clone())
                .or_default()
                .push(OrderItem {
                    id,
                    order_id,
                    quantity,
                });
        }

        Ok(order_rows
            .into_iter()
            .map(|(id, total, created_at)| Order {
                items: items_by_order.remove(&id).unwrap_or_default(),
                id,
                total,
                created_at: created_at.and_utc(),
            })
            .collect())
    }

    async fn append_checkpoint(
        &self,
        parent: Option<&str>,
        checkpoint: &StatsCheckpoint,
    ) -> Result<(), StoreError> {
        let orders = i32::try_from(checkpoint.totals.total_orders)
            .map_err(|e| corrupt(&checkpoint.id, e))?;
        let units = i32::try_from(checkpoint.totals.total_units)
            .map_err(|e| corrupt(&checkpoint.id, e))?;

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(map_db_err("begin append"))?;

        // Serialize appenders across processes for the rest of the transaction.
        sqlx::query("SELECT pg_advisory_xact_lock(hashtext($1))")
            .bind(CHECKPOINT_TABLE)
            .execute(&mut *tx)
            .await
            .map_err(map_db_err("advisory lock"))?;

        let head: Option<String> = sqlx::query_scalar(
            r#"SELECT id FROM "OrderStats" ORDER BY "createdAt" DESC, id DESC LIMIT 1"#,
        )
        .fetch_optional(&mut *tx)
        .await
        .map_err(map_db_err("read head"))?;

        if head.as_deref() != parent {
            return Err(StoreError::Conflict {
                expected: parent.map(str::to_string),
                found: head,
            });
        }

        sqlx::query(
            r#"INSERT INTO "OrderStats"
               (id, "totalOrders", "totalUnits", "totalAmount", "createdAt", "updatedAt")
               VALUES ($1, $2, $3, $4, $5, $6)"#,
        )
        .bind(&checkpoint.id)
        .bind(orders)
        .bind(units)
        .bind(checkpoint.totals.total_amount)
        .bind(checkpoint.created_at.naive_utc())
        .bind(checkpoint.updated_at.naive_utc())
        .execute(&mut *tx)
        .await
        .map_err(map_db_err("insert checkpoint"))?;

        tx.commit().await.map_err(map_db_err("commit append"))?;
        Ok(())
    }
}
