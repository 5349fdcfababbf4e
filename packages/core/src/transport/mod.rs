//! Broker transport.
//!
//! [`CommandPublisher`] is the outbound seam used by the decision engine and
//! the threshold store. [`mqtt::MqttTransport`] implements it over rumqttc;
//! [`mock::RecordingPublisher`] captures messages in memory for tests.

pub mod backoff;
pub mod mock;
pub mod mqtt;

use async_trait::async_trait;
use thiserror::Error;

use crate::pipeline::types::{PumpCommandMessage, ThresholdMessage};

pub use backoff::Backoff;
pub use mock::RecordingPublisher;
pub use mqtt::{MqttEventLoop, MqttSettings, MqttTransport};

/// Placeholder substituted with the device id in publish topic templates.
pub const DEVICE_ID_PLACEHOLDER: &str = "{device_id}";

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("Invalid broker URL: {0}")]
    InvalidBrokerUrl(String),

    #[error("Failed to connect to broker: {message}")]
    Connect { message: String },

    #[error("Broker connection is down")]
    Disconnected,

    #[error("Publish failed: {message}")]
    Publish { message: String },

    #[error("Failed to encode payload: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Outbound messages to field devices.
#[async_trait]
pub trait CommandPublisher: Send + Sync {
    /// Publish a pump command (retained, at-least-once).
    async fn publish_pump_command(&self, message: &PumpCommandMessage) -> Result<(), TransportError>;

    /// Publish a device's water level bounds (retained, at-least-once).
    async fn publish_thresholds(&self, message: &ThresholdMessage) -> Result<(), TransportError>;
}

/// Substitute `{device_id}` in a topic template.
pub fn render_topic(template: &str, device_id: &str) -> String {
    template.replace(DEVICE_ID_PLACEHOLDER, device_id)
}
