//! Pump decision engine.
//!
//! [`decide`] is the pure hysteresis rule. [`PumpController`] applies it to
//! stored state and is the only code path that mutates a device's
//! [`PumpState`]; it is always called from that device's worker, so calls
//! for one device never overlap.

use std::sync::Arc;

use chrono::Utc;

use crate::alerts::AlertPublisher;
use crate::metrics::AppMetrics;
use crate::pipeline::error::PipelineError;
use crate::pipeline::queue::DeviceTask;
use crate::pipeline::types::{
    Alert, PumpAck, PumpCommand, PumpCommandMessage, PumpMode, PumpState, PumpStatus, Reading,
    ThresholdConfig, TransitionSource,
};
use crate::repository::TelemetryRepository;
use crate::transport::CommandPublisher;

/// Hysteresis rule for automatic mode.
///
/// Below the lower bound the pump runs, at or above the upper bound it
/// stops, and in between it keeps whatever it was doing.
pub fn decide(level: f64, bounds: &ThresholdConfig, current: PumpStatus) -> PumpStatus {
    if level < bounds.lower_bound {
        PumpStatus::On
    } else if level >= bounds.upper_bound {
        PumpStatus::Off
    } else {
        current
    }
}

pub struct PumpController {
    repository: Arc<TelemetryRepository>,
    publisher: Arc<dyn CommandPublisher>,
    alerts: Arc<AlertPublisher>,
    metrics: Arc<AppMetrics>,
}

impl PumpController {
    pub fn new(
        repository: Arc<TelemetryRepository>,
        publisher: Arc<dyn CommandPublisher>,
        alerts: Arc<AlertPublisher>,
        metrics: Arc<AppMetrics>,
    ) -> Self {
        Self {
            repository,
            publisher,
            alerts,
            metrics,
        }
    }

    /// Run one queued task for `device_id`. Errors are logged here; command
    /// results go back through the task's reply channel.
    pub async fn handle(&self, device_id: &str, task: DeviceTask) {
        match task {
            DeviceTask::Level(reading) => {
                if let Err(e) = self.apply_level(&reading).await {
                    self.metrics
                        .messages_dropped_total
                        .with_label_values(&[e.reason()])
                        .inc();
                    match e {
                        PipelineError::MissingConfiguration { .. } => tracing::warn!(
                            device_id,
                            "No threshold configuration, skipping automatic control"
                        ),
                        other => tracing::error!(device_id, error = %other, "Automatic decision failed"),
                    }
                }
            }
            DeviceTask::Command { command, reply } => {
                let result = self.apply_command(device_id, &command).await;
                if let Err(e) = &result {
                    tracing::error!(device_id, error = %e, "Operator command failed");
                }
                if let Some(reply) = reply {
                    let _ = reply.send(result);
                }
            }
            DeviceTask::Ack(ack) => {
                if let Err(e) = self.apply_ack(&ack).await {
                    tracing::error!(device_id, error = %e, "Failed to apply pump acknowledgement");
                }
            }
        }
    }

    /// Evaluate a water level reading. Returns the new state when the pump
    /// was switched.
    pub async fn apply_level(&self, reading: &Reading) -> Result<Option<PumpState>, PipelineError> {
        let device_id = reading.device_id.as_str();

        let bounds = self
            .repository
            .get_threshold(device_id)
            .await
            .map_err(PipelineError::downstream)?
            .ok_or_else(|| PipelineError::missing_configuration(device_id))?;

        if reading.value < bounds.lower_bound {
            self.alerts.raise(Alert::level_low(device_id));
        }

        let current = self.current_state(device_id).await?;
        if current.mode == PumpMode::Manual {
            tracing::debug!(device_id, level = reading.value, "Manual mode, automatic control skipped");
            return Ok(None);
        }

        let next = decide(reading.value, &bounds, current.status);
        if next == current.status {
            return Ok(None);
        }

        let state = PumpState {
            device_id: device_id.to_string(),
            status: next,
            mode: PumpMode::Auto,
            updated_at: Utc::now(),
        };
        self.commit(&state, TransitionSource::Automatic).await?;

        tracing::info!(
            device_id,
            level = reading.value,
            lower = bounds.lower_bound,
            upper = bounds.upper_bound,
            "Pump switched {} automatically",
            next
        );

        if next == PumpStatus::On {
            self.alerts.raise(Alert::pump_auto_on(device_id));
        }

        Ok(Some(state))
    }

    /// Apply an operator command. The status defaults to the current one,
    /// so a bare mode change keeps the pump as it is.
    pub async fn apply_command(
        &self,
        device_id: &str,
        command: &PumpCommand,
    ) -> Result<PumpState, PipelineError> {
        let current = self.current_state(device_id).await?;

        let state = PumpState {
            device_id: device_id.to_string(),
            status: command.status.unwrap_or(current.status),
            mode: command.mode,
            updated_at: Utc::now(),
        };
        self.commit(&state, TransitionSource::Operator).await?;

        tracing::info!(device_id, status = %state.status, mode = %state.mode, "Operator command applied");
        Ok(state)
    }

    /// Reconcile with a device-reported state. Reports made before the
    /// current state was recorded are ignored; the operator-owned mode is
    /// kept. The new state is stamped with the receive time, never the
    /// device clock.
    pub async fn apply_ack(&self, ack: &PumpAck) -> Result<Option<PumpState>, PipelineError> {
        let device_id = ack.device_id.as_str();
        let current = self.current_state(device_id).await?;

        if ack.reported_at() < current.updated_at {
            tracing::info!(
                device_id,
                reported_at = %ack.timestamp,
                state_at = %current.updated_at,
                "Stale pump acknowledgement ignored"
            );
            return Ok(None);
        }

        if ack.status == current.status {
            return Ok(None);
        }

        let state = PumpState {
            device_id: device_id.to_string(),
            status: ack.status,
            mode: current.mode,
            updated_at: ack.received_at,
        };

        self.repository
            .record_pump_transition(&state, TransitionSource::Device)
            .await
            .map_err(PipelineError::downstream)?;
        self.metrics
            .pump_transitions_total
            .with_label_values(&[TransitionSource::Device.as_str()])
            .inc();

        tracing::info!(device_id, status = %state.status, "Pump state reported by device");
        Ok(Some(state))
    }

    /// Stored state, or the initial off/auto state for unknown devices.
    pub async fn current_state(&self, device_id: &str) -> Result<PumpState, PipelineError> {
        Ok(self
            .repository
            .latest_pump_state(device_id)
            .await
            .map_err(PipelineError::downstream)?
            .unwrap_or_else(|| PumpState::initial(device_id)))
    }

    /// Persist a transition and tell the device. A failed publish is logged;
    /// the retained command is re-sent on the next transition.
    async fn commit(&self, state: &PumpState, source: TransitionSource) -> Result<(), PipelineError> {
        self.repository
            .record_pump_transition(state, source)
            .await
            .map_err(PipelineError::downstream)?;

        self.metrics
            .pump_transitions_total
            .with_label_values(&[source.as_str()])
            .inc();

        if let Err(e) = self
            .publisher
            .publish_pump_command(&PumpCommandMessage::from(state))
            .await
        {
            let err = PipelineError::from(e);
            tracing::warn!(
                device_id = %state.device_id,
                reason = err.reason(),
                error = %err,
                "Failed to publish pump command"
            );
        }

        Ok(())
    }
}
