//! Task Execution Module
//!
//! Producer and consumer halves of the asynchronous task system.
//!
//! ## Flow
//! 1. **Submission**: The `TaskDispatcher` publishes `{id, name, args}` to the broker,
//!    records `PENDING` and hands the id back to the caller immediately.
//! 2. **Execution**: Worker loops in the `TaskExecutor` block on the broker, record
//!    `STARTED`, run the registered body and record `SUCCESS` or `FAILURE`.
//! 3. **Leasing**: A delivery stays invisible while its lease is renewed. If the worker
//!    dies the lease expires and the message is redelivered (at-least-once semantics).
//!
//! ## Submodules
//! - **`types`**: Task ids, the closed set of task kinds and decoded requests.
//! - **`registry`**: Maps each task kind to the Rust code that implements it.
//! - **`dispatcher`**: Submit and poll.
//! - **`executor`**: The worker pool and the delivery lifecycle (claim -> run -> ack).
//! - **`protocol`** / **`handlers`**: The HTTP surface over the dispatcher.

pub mod types;
pub mod protocol;
pub mod handlers;
pub mod dispatcher;
pub mod executor;
pub mod registry;

#[cfg(test)]
mod tests;
