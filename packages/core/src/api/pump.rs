//! Pump state, operator commands and the pump audit log.

use axum::{
    extract::{Path, Query, State},
    Json,
};
use serde::{Deserialize, Serialize};

use super::{database_error, pipeline_error, ApiError, ApiState};
use crate::pipeline::types::{PumpCommand, PumpHistoryEntry, PumpState};

const DEFAULT_HISTORY_LIMIT: i64 = 50;

#[derive(Debug, Deserialize)]
pub struct HistoryQuery {
    pub limit: Option<i64>,
}

#[derive(Debug, Serialize)]
pub struct PumpHistoryResponse {
    pub device_id: String,
    pub items: Vec<PumpHistoryEntry>,
}

/// `GET /devices/:device_id/pump`: current state; unknown devices report
/// the initial off/auto state.
pub async fn get_pump(
    State(state): State<ApiState>,
    Path(device_id): Path<String>,
) -> Result<Json<PumpState>, ApiError> {
    let pump = state
        .pipeline
        .pump_state(&device_id)
        .await
        .map_err(pipeline_error)?;
    Ok(Json(pump))
}

/// `POST /devices/:device_id/pump`: `{ "mode": "manual", "status": "on" }`.
///
/// The command is queued on the device's worker so it is ordered with
/// automatic decisions; the response is the resulting state.
pub async fn post_pump_command(
    State(state): State<ApiState>,
    Path(device_id): Path<String>,
    Json(command): Json<PumpCommand>,
) -> Result<Json<PumpState>, ApiError> {
    let pump = state
        .pipeline
        .submit_command(&device_id, command)
        .await
        .map_err(pipeline_error)?;
    Ok(Json(pump))
}

/// `GET /devices/:device_id/pump/history?limit=`: newest first.
pub async fn pump_history(
    State(state): State<ApiState>,
    Path(device_id): Path<String>,
    Query(params): Query<HistoryQuery>,
) -> Result<Json<PumpHistoryResponse>, ApiError> {
    let limit = params.limit.unwrap_or(DEFAULT_HISTORY_LIMIT);
    let items = state
        .pipeline
        .repository()
        .pump_history(&device_id, limit)
        .await
        .map_err(database_error)?;

    Ok(Json(PumpHistoryResponse { device_id, items }))
}
