//! Periodic Trigger
//!
//! Submits `calculate_order_stats` on a fixed period. The single-flight lock in
//! the engine keeps overlapping triggers from double counting, so the loop does
//! not wait for a previous run to finish.

use crate::executor::dispatcher::TaskDispatcher;
use crate::executor::types::TaskRequest;

use std::sync::Arc;
use std::time::Duration;
use tokio::time::{interval_at, Instant, MissedTickBehavior};

/// Runs forever. The first submission happens one `period` after the call.
pub async fn run_periodic(dispatcher: Arc<TaskDispatcher>, period: Duration) {
    let mut interval = interval_at(Instant::now() + period, period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

    tracing::info!("Scheduling order stats every {:?}", period);

    loop {
        interval.tick().await;

        match dispatcher
            .submit_request(&TaskRequest::CalculateOrderStats)
            .await
        {
            Ok(task_id) => tracing::info!("Scheduled order stats run {}", task_id),
            Err(e) => tracing::error!("Failed to schedule order stats run: {}", e),
        }
    }
}
