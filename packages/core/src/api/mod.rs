//! Operator HTTP API.
//!
//! Routes:
//! - `GET  /health`
//! - `GET  /metrics`
//! - `GET  /devices/:device_id/thresholds`, `PUT` to replace them
//! - `GET  /devices/:device_id/pump`, `POST` an operator command
//! - `GET  /devices/:device_id/pump/history?limit=`
//! - `GET  /devices/:device_id/readings/latest?kind=`
//! - `GET  /devices/:device_id/usage/today`
//! - `GET  /alerts/history?limit=`

pub mod alerts;
pub mod health;
pub mod pump;
pub mod readings;
pub mod thresholds;

use std::sync::Arc;

use axum::{
    http::StatusCode,
    routing::get,
    Json, Router,
};
use serde_json::json;
use tower_http::cors::CorsLayer;

use crate::metrics::AppMetrics;
use crate::pipeline::{Pipeline, PipelineError};

/// Shared state for every route.
#[derive(Clone)]
pub struct ApiState {
    pub pipeline: Arc<Pipeline>,
    pub metrics: Arc<AppMetrics>,
}

/// Error body returned by every handler: `{ "error": "..." }`.
pub type ApiError = (StatusCode, Json<serde_json::Value>);

pub fn error_response(status: StatusCode, message: impl Into<String>) -> ApiError {
    (status, Json(json!({ "error": message.into() })))
}

/// HTTP status for a pipeline failure.
pub fn pipeline_error(err: PipelineError) -> ApiError {
    let status = match &err {
        PipelineError::MalformedPayload(_) | PipelineError::InvalidBounds { .. } => {
            StatusCode::BAD_REQUEST
        }
        PipelineError::MissingConfiguration { .. } => StatusCode::NOT_FOUND,
        PipelineError::TransportDisconnected { .. } | PipelineError::ShuttingDown => {
            StatusCode::SERVICE_UNAVAILABLE
        }
        PipelineError::DownstreamUnavailable { .. } => StatusCode::INTERNAL_SERVER_ERROR,
    };
    error_response(status, err.to_string())
}

pub fn database_error(err: sqlx::Error) -> ApiError {
    tracing::error!(error = %err, "Database query failed");
    error_response(StatusCode::INTERNAL_SERVER_ERROR, err.to_string())
}

/// Assemble the full router (used by `main.rs` and the integration tests).
pub fn router(state: ApiState) -> Router {
    Router::new()
        .route("/health", get(health::health))
        .route("/metrics", get(health::metrics))
        .route(
            "/devices/:device_id/thresholds",
            get(thresholds::get_thresholds).put(thresholds::put_thresholds),
        )
        .route(
            "/devices/:device_id/pump",
            get(pump::get_pump).post(pump::post_pump_command),
        )
        .route("/devices/:device_id/pump/history", get(pump::pump_history))
        .route("/devices/:device_id/readings/latest", get(readings::latest_reading))
        .route("/devices/:device_id/usage/today", get(readings::usage_today))
        .route("/devices/:device_id/usage/history", get(readings::usage_history))
        .route("/alerts/history", get(alerts::get_alert_history))
        .layer(CorsLayer::permissive())
        .with_state(state)
}
