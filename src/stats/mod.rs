//! Order Statistics Module
//!
//! Incremental aggregation of order totals over an append-only checkpoint log.
//!
//! ## Algorithm
//! 1. **Watermark**: The latest `StatsCheckpoint` (by `created_at`) carries the totals
//!    so far and the timestamp up to which orders were counted.
//! 2. **Delta**: Only orders created after that watermark (and up to a cutoff taken
//!    before the scan) are read, with their items.
//! 3. **Append**: A new checkpoint with `prior + delta` is appended. Checkpoints are
//!    never updated in place.
//!
//! ## Concurrency
//! Two overlapping runs that read the same watermark would count the same orders
//! twice. Runs are therefore serialized twice over: a single-flight lock keyed on
//! the task name covers the read-compute-append sequence, and the append itself is
//! a compare-and-swap on the parent checkpoint id.
//!
//! ## Submodules
//! - **`types`**: Orders, checkpoints, totals and deltas.
//! - **`store`**: The `OrderStore` trait (Durable Store) and its in-process backend.
//! - **`postgres`**: `sqlx` backend for the production schema (feature `postgres`).
//! - **`lock`**: Single-flight locks, in-process and Redis-backed.
//! - **`engine`**: The `calculate_order_stats` task body.

pub mod engine;
pub mod lock;
#[cfg(feature = "postgres")]
pub mod postgres;
pub mod store;
pub mod types;
