//! Result Store Module
//!
//! Holds the status of every task by id, shared between the dispatcher (which
//! records `PENDING` and answers polls) and the workers (which record `STARTED`
//! and the terminal outcome).
//!
//! Writes go through a monotonic transition function,
//! `PENDING -> STARTED -> {SUCCESS, FAILURE}`, so a redelivered message can never
//! roll a finished task back. The only repeatable step is `STARTED -> STARTED`,
//! which a redelivery after a worker crash needs.
//!
//! ## Submodules
//! - **`types`**: `TaskState`, `TaskRecord` and the `ResultStore` trait.
//! - **`memory`**: DashMap-backed store.
//! - **`redis`**: Redis hashes with a Lua-enforced transition (feature `redis`).

pub mod memory;
#[cfg(feature = "redis")]
pub mod redis;
pub mod types;
