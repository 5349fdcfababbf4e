use std::sync::Arc;

use chrono::Utc;

use crate::pipeline::error::PipelineError;
use crate::pipeline::types::{ThresholdConfig, ThresholdMessage};
use crate::repository::TelemetryRepository;
use crate::transport::CommandPublisher;

/// Per-device water level bounds: validated writes, persisted, then
/// published (retained) so devices pick them up on reconnect.
pub struct ThresholdStore {
    repository: Arc<TelemetryRepository>,
    publisher: Arc<dyn CommandPublisher>,
}

impl ThresholdStore {
    pub fn new(repository: Arc<TelemetryRepository>, publisher: Arc<dyn CommandPublisher>) -> Self {
        Self {
            repository,
            publisher,
        }
    }

    pub async fn get(&self, device_id: &str) -> Result<Option<ThresholdConfig>, PipelineError> {
        self.repository
            .get_threshold(device_id)
            .await
            .map_err(PipelineError::downstream)
    }

    /// Replace the bounds for `device_id`. Rejects `upper <= lower` and
    /// non-finite values without touching the stored config.
    pub async fn update(
        &self,
        device_id: &str,
        upper_bound: f64,
        lower_bound: f64,
    ) -> Result<ThresholdConfig, PipelineError> {
        if !upper_bound.is_finite() || !lower_bound.is_finite() || upper_bound <= lower_bound {
            return Err(PipelineError::InvalidBounds {
                upper: upper_bound,
                lower: lower_bound,
            });
        }

        let config = ThresholdConfig {
            device_id: device_id.to_string(),
            upper_bound,
            lower_bound,
            updated_at: Utc::now(),
        };

        self.repository
            .upsert_threshold(&config)
            .await
            .map_err(PipelineError::downstream)?;

        tracing::info!(device_id, upper_bound, lower_bound, "Threshold configuration updated");

        if let Err(e) = self
            .publisher
            .publish_thresholds(&ThresholdMessage::from(&config))
            .await
        {
            tracing::warn!(device_id, error = %e, "Failed to publish threshold configuration");
        }

        Ok(config)
    }
}
