//! Alert event log.

use axum::{
    extract::{Query, State},
    Json,
};
use serde::{Deserialize, Serialize};

use super::{database_error, ApiError, ApiState};
use crate::pipeline::types::AlertEvent;

#[derive(Debug, Deserialize)]
pub struct AlertHistoryQuery {
    pub limit: Option<i64>,
}

#[derive(Debug, Serialize)]
pub struct AlertHistoryResponse {
    pub total: i64,
    pub items: Vec<AlertEvent>,
}

/// `GET /alerts/history`: newest first.
///
/// Query params:
/// - `limit`: max items to return (default 20, clamped to 1..=100)
pub async fn get_alert_history(
    State(state): State<ApiState>,
    Query(params): Query<AlertHistoryQuery>,
) -> Result<Json<AlertHistoryResponse>, ApiError> {
    let limit = params.limit.unwrap_or(20).clamp(1, 100);
    let repo = state.pipeline.repository();

    let (items, total) = tokio::try_join!(repo.query_alert_history(limit), repo.count_alert_events())
        .map_err(database_error)?;

    Ok(Json(AlertHistoryResponse { total, items }))
}
