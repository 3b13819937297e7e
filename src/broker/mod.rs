//! Task Broker Module
//!
//! The ordered, at-least-once channel between the dispatcher and the worker pool.
//!
//! ## Delivery Model
//! 1. **Publish**: The dispatcher pushes a `TaskMessage` onto the queue and returns immediately.
//! 2. **Receive**: A worker blocks until a message is available. The message moves to an
//!    in-flight set with a visibility deadline; it is not handed to other workers meanwhile.
//! 3. **Extend**: While the task body runs, the worker keeps pushing the deadline forward.
//! 4. **Ack**: After the terminal status is written, the worker removes the message for good.
//! 5. **Redelivery**: Messages whose deadline passed (worker crash, hang) are moved back
//!    to the queue by `requeue_expired`, with the attempt counter incremented.
//!
//! ## Submodules
//! - **`types`**: Message envelope, delivery handle, `Broker` trait and `BrokerError`.
//! - **`memory`**: In-process broker for single-process deployments and tests.
//! - **`redis`**: Reliable-queue broker on Redis lists (feature `redis`).

pub mod memory;
#[cfg(feature = "redis")]
pub mod redis;
pub mod types;
