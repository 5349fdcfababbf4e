use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use chrono::{NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use super::{database_error, error_response, ApiError, ApiState};
use crate::pipeline::types::{DailyUsage, Reading, ReadingKind};

#[derive(Debug, Deserialize)]
pub struct LatestQuery {
    pub kind: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct UsageHistoryQuery {
    pub days: Option<i64>,
}

#[derive(Debug, Serialize)]
pub struct UsageHistoryResponse {
    pub device_id: String,
    pub days: u32,
    pub items: Vec<DailyUsage>,
}

#[derive(Debug, Serialize)]
pub struct UsageResponse {
    pub device_id: String,
    pub date: NaiveDate,
    pub usage_ml: f64,
}

/// `GET /devices/:device_id/readings/latest?kind=water_level`
///
/// `kind` defaults to `water_level`.
pub async fn latest_reading(
    State(state): State<ApiState>,
    Path(device_id): Path<String>,
    Query(params): Query<LatestQuery>,
) -> Result<Json<Reading>, ApiError> {
    let kind = match params.kind.as_deref() {
        None => ReadingKind::WaterLevel,
        Some(raw) => raw
            .parse::<ReadingKind>()
            .map_err(|e| error_response(StatusCode::BAD_REQUEST, e))?,
    };

    state
        .pipeline
        .repository()
        .latest_reading(&device_id, kind)
        .await
        .map_err(database_error)?
        .map(Json)
        .ok_or_else(|| {
            error_response(
                StatusCode::NOT_FOUND,
                format!("No {} reading for device {}", kind.as_str(), device_id),
            )
        })
}

/// `GET /devices/:device_id/usage/today`: millilitres dispensed today (UTC).
pub async fn usage_today(
    State(state): State<ApiState>,
    Path(device_id): Path<String>,
) -> Result<Json<UsageResponse>, ApiError> {
    let date = Utc::now().date_naive();
    let usage_ml = state
        .pipeline
        .repository()
        .water_usage_on(&device_id, date)
        .await
        .map_err(database_error)?;

    Ok(Json(UsageResponse {
        device_id,
        date,
        usage_ml,
    }))
}

/// `GET /devices/:device_id/usage/history?days=7`
///
/// Daily totals, newest first; `days` defaults to 7, clamped to 1..=90.
pub async fn usage_history(
    State(state): State<ApiState>,
    Path(device_id): Path<String>,
    Query(params): Query<UsageHistoryQuery>,
) -> Result<Json<UsageHistoryResponse>, ApiError> {
    let days = params.days.unwrap_or(7).clamp(1, 90) as u32;
    let items = state
        .pipeline
        .repository()
        .water_usage_history(&device_id, days)
        .await
        .map_err(database_error)?;

    Ok(Json(UsageHistoryResponse {
        device_id,
        days,
        items,
    }))
}
