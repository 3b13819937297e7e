//! Order Statistics Task Worker Library
//!
//! Background task infrastructure plus the incremental order statistics job it runs.
//! The binary (`main.rs`) wires these modules to concrete backends.
//!
//! ## Modules
//! - **`executor`**: Task submission, polling and the worker pool that consumes the broker.
//! - **`broker`**: At-least-once message delivery with visibility timeouts.
//! - **`results`**: Per-task status records with monotonic transitions.
//! - **`stats`**: Orders, checkpoints and the watermark-based aggregation engine.
//! - **`scheduler`**: The periodic `calculate_order_stats` trigger.
//! - **`config`**: Command-line and environment configuration.

pub mod broker;
pub mod config;
pub mod error;
pub mod executor;
pub mod results;
pub mod scheduler;
pub mod stats;
