use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use serde::Deserialize;

use super::{error_response, pipeline_error, ApiError, ApiState};
use crate::pipeline::types::ThresholdConfig;

#[derive(Debug, Deserialize)]
pub struct ThresholdUpdate {
    pub upper_bound: f64,
    pub lower_bound: f64,
}

/// `GET /devices/:device_id/thresholds`
pub async fn get_thresholds(
    State(state): State<ApiState>,
    Path(device_id): Path<String>,
) -> Result<Json<ThresholdConfig>, ApiError> {
    state
        .pipeline
        .thresholds()
        .get(&device_id)
        .await
        .map_err(pipeline_error)?
        .map(Json)
        .ok_or_else(|| {
            error_response(
                StatusCode::NOT_FOUND,
                format!("No threshold configuration for device {}", device_id),
            )
        })
}

/// `PUT /devices/:device_id/thresholds`: replace both bounds.
pub async fn put_thresholds(
    State(state): State<ApiState>,
    Path(device_id): Path<String>,
    Json(body): Json<ThresholdUpdate>,
) -> Result<Json<ThresholdConfig>, ApiError> {
    let config = state
        .pipeline
        .thresholds()
        .update(&device_id, body.upper_bound, body.lower_bound)
        .await
        .map_err(pipeline_error)?;

    Ok(Json(config))
}
