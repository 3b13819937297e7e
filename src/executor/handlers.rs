use super::dispatcher::TaskDispatcher;
use super::protocol::*;
use super::types::*;
use crate::broker::types::BrokerError;
use crate::stats::store::OrderStore;

use axum::routing::{get, post};
use axum::{extract::Path, http::StatusCode, Extension, Json, Router};
use std::sync::Arc;

type ApiError = (StatusCode, Json<ErrorResponse>);

fn api_error(status: StatusCode, error: impl ToString) -> ApiError {
    (
        status,
        Json(ErrorResponse {
            error: error.to_string(),
        }),
    )
}

fn submit_error(e: BrokerError) -> ApiError {
    tracing::error!("Failed to submit task: {}", e);
    match e {
        BrokerError::Unavailable(_) => api_error(StatusCode::SERVICE_UNAVAILABLE, e),
        _ => api_error(StatusCode::INTERNAL_SERVER_ERROR, e),
    }
}

/// Builds the submit/poll router over a dispatcher and the order store.
pub fn router(dispatcher: Arc<TaskDispatcher>, store: Arc<dyn OrderStore>) -> Router {
    Router::new()
        .route(ENDPOINT_SUBMIT_TASK, post(handle_submit_task))
        .route(ENDPOINT_TASK_STATUS, get(handle_get_task_status))
        .route(ENDPOINT_SUBMIT_STATS, post(handle_submit_stats))
        .route(ENDPOINT_STATS_STATUS, get(handle_get_task_status))
        .route(ENDPOINT_LATEST_STATS, get(handle_latest_stats))
        .layer(Extension(dispatcher))
        .layer(Extension(store))
}

pub async fn handle_submit_task(
    Extension(dispatcher): Extension<Arc<TaskDispatcher>>,
    Json(req): Json<SubmitTaskRequest>,
) -> Result<(StatusCode, Json<SubmitTaskResponse>), ApiError> {
    let task_id = dispatcher
        .submit(&req.name, req.args)
        .await
        .map_err(submit_error)?;

    Ok((StatusCode::ACCEPTED, Json(SubmitTaskResponse { task_id })))
}

pub async fn handle_submit_stats(
    Extension(dispatcher): Extension<Arc<TaskDispatcher>>,
) -> Result<(StatusCode, Json<SubmitTaskResponse>), ApiError> {
    let task_id = dispatcher
        .submit_request(&TaskRequest::CalculateOrderStats)
        .await
        .map_err(submit_error)?;

    Ok((StatusCode::ACCEPTED, Json(SubmitTaskResponse { task_id })))
}

pub async fn handle_get_task_status(
    Extension(dispatcher): Extension<Arc<TaskDispatcher>>,
    Path(task_id_str): Path<String>,
) -> Result<(StatusCode, Json<TaskStatusResponse>), ApiError> {
    let task_id = TaskId(task_id_str);

    match dispatcher.poll(&task_id).await {
        Ok(state) => {
            tracing::debug!("Task status query: {} -> {}", task_id, state.label());
            Ok((StatusCode::OK, Json(TaskStatusResponse { task_id, state })))
        }
        Err(e) => {
            tracing::error!("Failed to poll task {}: {}", task_id, e);
            Err(api_error(StatusCode::SERVICE_UNAVAILABLE, e))
        }
    }
}

pub async fn handle_latest_stats(
    Extension(store): Extension<Arc<dyn OrderStore>>,
) -> Result<(StatusCode, Json<StatsResponse>), ApiError> {
    let latest = store.latest_checkpoint().await.map_err(|e| {
        tracing::error!("Failed to fetch order stats: {}", e);
        api_error(StatusCode::SERVICE_UNAVAILABLE, e)
    })?;

    let body = match latest {
        Some(checkpoint) => StatsResponse {
            total_orders: checkpoint.totals.total_orders,
            total_units: checkpoint.totals.total_units,
            total_amount: checkpoint.totals.total_amount,
            last_updated: Some(checkpoint.updated_at),
        },
        None => StatsResponse {
            total_orders: 0,
            total_units: 0,
            total_amount: 0.0,
            last_updated: None,
        },
    };

    Ok((StatusCode::OK, Json(body)))
}
