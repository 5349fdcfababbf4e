//! Error types for pipeline operations

use thiserror::Error;

use crate::transport::TransportError;

/// Errors that can occur while handling telemetry or operator commands
#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("Malformed payload: {0}")]
    MalformedPayload(#[from] ValidationError),

    #[error("No threshold configuration for device {device_id}")]
    MissingConfiguration { device_id: String },

    #[error("Invalid bounds: upper bound {upper} must be greater than lower bound {lower}")]
    InvalidBounds { upper: f64, lower: f64 },

    #[error("Transport disconnected: {message}")]
    TransportDisconnected { message: String },

    #[error("Downstream unavailable: {message}")]
    DownstreamUnavailable { message: String },

    #[error("Pipeline is shutting down")]
    ShuttingDown,
}

/// Payload validation failures raised by the normalizer
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ValidationError {
    #[error("payload is not valid JSON: {message}")]
    InvalidJson { message: String },

    #[error("payload must be a JSON object")]
    NotAnObject,

    #[error("missing required field `{field}`")]
    MissingField { field: &'static str },

    #[error("invalid field `{field}`: {reason}")]
    InvalidField { field: &'static str, reason: String },

    #[error("payload must contain at least one of: {fields}")]
    MissingAnyOf { fields: &'static str },
}

impl PipelineError {
    pub fn missing_configuration(device_id: impl Into<String>) -> Self {
        Self::MissingConfiguration { device_id: device_id.into() }
    }

    pub fn downstream(message: impl std::fmt::Display) -> Self {
        Self::DownstreamUnavailable { message: message.to_string() }
    }

    /// Short label used for the dropped-message counter.
    pub fn reason(&self) -> &'static str {
        match self {
            PipelineError::MalformedPayload(_) => "malformed",
            PipelineError::MissingConfiguration { .. } => "missing_configuration",
            PipelineError::InvalidBounds { .. } => "invalid_bounds",
            PipelineError::TransportDisconnected { .. } => "transport_disconnected",
            PipelineError::DownstreamUnavailable { .. } => "downstream_unavailable",
            PipelineError::ShuttingDown => "shutting_down",
        }
    }
}

impl From<TransportError> for PipelineError {
    fn from(err: TransportError) -> Self {
        match err {
            TransportError::Disconnected | TransportError::Connect { .. } => {
                Self::TransportDisconnected { message: err.to_string() }
            }
            other => Self::downstream(other),
        }
    }
}

impl ValidationError {
    pub fn invalid(field: &'static str, reason: impl Into<String>) -> Self {
        Self::InvalidField { field, reason: reason.into() }
    }

    pub fn missing(field: &'static str) -> Self {
        Self::MissingField { field }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lost_broker_maps_to_transport_disconnected() {
        let err = PipelineError::from(TransportError::Disconnected);
        assert_eq!(err.reason(), "transport_disconnected");

        let err = PipelineError::from(TransportError::Publish {
            message: "queue full".into(),
        });
        assert_eq!(err.reason(), "downstream_unavailable");
    }

    #[test]
    fn validation_error_names_the_field() {
        let err = PipelineError::from(ValidationError::missing("level"));
        assert_eq!(err.reason(), "malformed");
        assert!(err.to_string().contains("`level`"));
    }
}
