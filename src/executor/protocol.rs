//! HTTP Protocol Definitions
//!
//! Request and response bodies of the submit/poll surface, plus the endpoint paths.

use super::types::*;
use crate::results::types::TaskState;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const ENDPOINT_SUBMIT_TASK: &str = "/tasks";
pub const ENDPOINT_TASK_STATUS: &str = "/tasks/:id";
pub const ENDPOINT_SUBMIT_STATS: &str = "/calculate-stats";
pub const ENDPOINT_STATS_STATUS: &str = "/calculate-stats/:id";
pub const ENDPOINT_LATEST_STATS: &str = "/stats";

#[derive(Debug, Serialize, Deserialize)]
pub struct SubmitTaskRequest {
    pub name: String,
    #[serde(default)]
    pub args: Vec<Value>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SubmitTaskResponse {
    pub task_id: TaskId,
}

/// `{task_id, status, result?, error?}`
#[derive(Debug, Serialize, Deserialize)]
pub struct TaskStatusResponse {
    pub task_id: TaskId,
    #[serde(flatten)]
    pub state: TaskState,
}

/// Latest checkpoint as served to dashboards.
#[derive(Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct StatsResponse {
    pub total_orders: u64,
    pub total_units: u64,
    pub total_amount: f64,
    pub last_updated: Option<DateTime<Utc>>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
}
