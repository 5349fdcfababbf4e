//! Message Router
//!
//! Classifies inbound topics, runs the normalizer and hands the results
//! on: readings and water usage are persisted on spawned tasks, level
//! readings and pump acks are queued for the device's decision worker.
//! [`Router::dispatch`] never awaits, so one slow device or a slow store
//! cannot stall the broker loop. In-flight writes are capped; past the cap
//! new writes are dropped and counted instead of piling up in memory.

use std::sync::Arc;

use chrono::Utc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio_util::task::TaskTracker;

use crate::alerts::AlertPublisher;
use crate::metrics::AppMetrics;
use crate::pipeline::error::PipelineError;
use crate::pipeline::normalizer::{
    normalize_pump_ack, normalize_sensor, normalize_water_telemetry, parse_payload,
};
use crate::pipeline::queue::DeviceTask;
use crate::pipeline::types::{Alert, Reading, ReadingKind};
use crate::pipeline::worker::DeviceWorkers;
use crate::repository::TelemetryRepository;

pub const DEFAULT_TELEMETRY_TOPIC: &str = "livestock/data";
pub const DEFAULT_SENSOR_TOPIC: &str = "livestock/sensor/data";
pub const DEFAULT_CONFIG_REQUEST_TOPIC: &str = "livestock/device/+/request-config";
pub const DEFAULT_PUMP_ACK_TOPIC: &str = "livestock/pump/status";
pub const DEFAULT_PUMP_COMMAND_TOPIC: &str = "livestock/pump/command";
pub const DEFAULT_THRESHOLDS_TOPIC: &str = "livestock/config/water-bounds";

pub const DEFAULT_MAX_PENDING_WRITES: usize = 1024;

/// Topic names. Inbound entries are MQTT filters and may use `+` / `#`;
/// outbound entries may contain a `{device_id}` placeholder.
#[derive(Debug, Clone, PartialEq)]
pub struct Topics {
    pub telemetry: String,
    pub sensor: String,
    pub config_request: String,
    pub pump_ack: String,
    pub pump_command: String,
    pub thresholds: String,
}

impl Default for Topics {
    fn default() -> Self {
        Self {
            telemetry: DEFAULT_TELEMETRY_TOPIC.to_string(),
            sensor: DEFAULT_SENSOR_TOPIC.to_string(),
            config_request: DEFAULT_CONFIG_REQUEST_TOPIC.to_string(),
            pump_ack: DEFAULT_PUMP_ACK_TOPIC.to_string(),
            pump_command: DEFAULT_PUMP_COMMAND_TOPIC.to_string(),
            thresholds: DEFAULT_THRESHOLDS_TOPIC.to_string(),
        }
    }
}

impl Topics {
    /// Filters to subscribe to.
    pub fn subscriptions(&self) -> Vec<String> {
        vec![
            self.telemetry.clone(),
            self.sensor.clone(),
            self.config_request.clone(),
            self.pump_ack.clone(),
        ]
    }

    pub fn classify(&self, topic: &str) -> Route {
        if topic_matches(&self.telemetry, topic) {
            Route::Telemetry
        } else if topic_matches(&self.sensor, topic) {
            Route::Sensor
        } else if topic_matches(&self.pump_ack, topic) {
            Route::PumpAck
        } else if topic_matches(&self.config_request, topic) {
            Route::ConfigRequest {
                device_id: wildcard_segment(&self.config_request, topic),
            }
        } else {
            Route::Unknown
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Route {
    Telemetry,
    Sensor,
    ConfigRequest { device_id: Option<String> },
    PumpAck,
    Unknown,
}

impl Route {
    /// Label for the received-messages counter.
    pub fn label(&self) -> &'static str {
        match self {
            Route::Telemetry => "telemetry",
            Route::Sensor => "sensor",
            Route::ConfigRequest { .. } => "config_request",
            Route::PumpAck => "pump_ack",
            Route::Unknown => "unknown",
        }
    }
}

/// MQTT filter matching: `+` matches one level, a trailing `#` matches the
/// rest (including nothing).
pub fn topic_matches(filter: &str, topic: &str) -> bool {
    let mut filter_levels = filter.split('/');
    let mut topic_levels = topic.split('/');

    loop {
        match (filter_levels.next(), topic_levels.next()) {
            (Some("#"), _) => return true,
            (Some("+"), Some(_)) => {}
            (Some(f), Some(t)) if f == t => {}
            (None, None) => return true,
            _ => return false,
        }
    }
}

/// Value of the first `+` level of `filter` within `topic`.
fn wildcard_segment(filter: &str, topic: &str) -> Option<String> {
    filter
        .split('/')
        .zip(topic.split('/'))
        .find(|(f, _)| *f == "+")
        .map(|(_, t)| t.to_string())
        .filter(|t| !t.is_empty())
}

pub struct Router {
    topics: Topics,
    default_device_id: String,
    temperature_high_c: f64,
    repository: Arc<TelemetryRepository>,
    workers: Arc<DeviceWorkers>,
    alerts: Arc<AlertPublisher>,
    tracker: TaskTracker,
    writes: Arc<Semaphore>,
    metrics: Arc<AppMetrics>,
}

impl Router {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        topics: Topics,
        default_device_id: String,
        temperature_high_c: f64,
        repository: Arc<TelemetryRepository>,
        workers: Arc<DeviceWorkers>,
        alerts: Arc<AlertPublisher>,
        tracker: TaskTracker,
        max_pending_writes: usize,
        metrics: Arc<AppMetrics>,
    ) -> Self {
        Self {
            topics,
            default_device_id,
            temperature_high_c,
            repository,
            workers,
            alerts,
            tracker,
            writes: Arc::new(Semaphore::new(max_pending_writes)),
            metrics,
        }
    }

    /// Route one inbound message. Failures are logged and counted as
    /// dropped here; the result is returned for callers that care.
    pub fn dispatch(&self, topic: &str, payload: &[u8]) -> Result<Route, PipelineError> {
        let route = self.topics.classify(topic);
        self.metrics
            .messages_received_total
            .with_label_values(&[route.label()])
            .inc();

        match self.route(&route, payload) {
            Ok(()) => Ok(route),
            Err(e) => {
                self.metrics
                    .messages_dropped_total
                    .with_label_values(&[e.reason()])
                    .inc();
                tracing::warn!(topic, error = %e, "Dropped message");
                Err(e)
            }
        }
    }

    fn route(&self, route: &Route, payload: &[u8]) -> Result<(), PipelineError> {
        match route {
            Route::Telemetry => self.on_telemetry(payload),
            Route::Sensor => self.on_sensor(payload),
            Route::PumpAck => self.on_pump_ack(payload),
            Route::ConfigRequest { device_id } => {
                let device_id = device_id.as_deref().unwrap_or(&self.default_device_id);
                tracing::info!(device_id, "Configuration request acknowledged");
                Ok(())
            }
            Route::Unknown => {
                self.metrics
                    .messages_dropped_total
                    .with_label_values(&["unknown_topic"])
                    .inc();
                tracing::debug!("Message on unrouted topic ignored");
                Ok(())
            }
        }
    }

    fn on_telemetry(&self, payload: &[u8]) -> Result<(), PipelineError> {
        let payload = parse_payload(payload)?;
        let telemetry = normalize_water_telemetry(
            &payload,
            &self.default_device_id,
            self.temperature_high_c,
            Utc::now(),
        )?;

        let device_id = telemetry.level.device_id.clone();
        tracing::debug!(
            device_id = %device_id,
            level = telemetry.level.value,
            pump = telemetry.reported_pump.as_deref().unwrap_or("-"),
            "Telemetry received"
        );

        self.persist(telemetry.level.clone());
        if let Some(volume) = telemetry.volume_litres {
            self.record_usage(device_id.clone(), volume);
        }
        if let Some(temperature) = telemetry.temperature {
            self.on_temperature(temperature);
        }

        self.workers.submit(&device_id, DeviceTask::Level(telemetry.level))
    }

    fn on_sensor(&self, payload: &[u8]) -> Result<(), PipelineError> {
        let payload = parse_payload(payload)?;
        let readings = normalize_sensor(
            &payload,
            &self.default_device_id,
            self.temperature_high_c,
            Utc::now(),
        )?;

        for reading in readings {
            match reading.kind {
                ReadingKind::Temperature => self.on_temperature(reading),
                _ => self.persist(reading),
            }
        }
        Ok(())
    }

    fn on_pump_ack(&self, payload: &[u8]) -> Result<(), PipelineError> {
        let payload = parse_payload(payload)?;
        let ack = normalize_pump_ack(&payload, &self.default_device_id, Utc::now())?;
        let device_id = ack.device_id.clone();
        self.workers.submit(&device_id, DeviceTask::Ack(ack))
    }

    fn on_temperature(&self, reading: Reading) {
        if reading.value >= self.temperature_high_c {
            self.alerts.raise(Alert::temperature_high(&reading.device_id));
        }
        self.persist(reading);
    }

    /// Reserve a write slot; `None` when the store is already that far behind.
    fn write_permit(&self, device_id: &str, what: &'static str) -> Option<OwnedSemaphorePermit> {
        match Arc::clone(&self.writes).try_acquire_owned() {
            Ok(permit) => Some(permit),
            Err(_) => {
                self.metrics
                    .messages_dropped_total
                    .with_label_values(&["persistence_backlog"])
                    .inc();
                tracing::warn!(device_id, what, "Write backlog full, discarding");
                None
            }
        }
    }

    fn persist(&self, reading: Reading) {
        let Some(permit) = self.write_permit(&reading.device_id, reading.kind.as_str()) else {
            return;
        };
        let repository = Arc::clone(&self.repository);
        let metrics = Arc::clone(&self.metrics);

        self.tracker.spawn(async move {
            let _permit = permit;
            match repository.insert_reading(&reading).await {
                Ok(_) => metrics.readings_stored_total.inc(),
                Err(e) => {
                    metrics
                        .messages_dropped_total
                        .with_label_values(&["downstream_unavailable"])
                        .inc();
                    tracing::error!(
                        device_id = %reading.device_id,
                        kind = reading.kind.as_str(),
                        error = %e,
                        "Failed to store reading"
                    );
                }
            }
        });
    }

    /// Accumulate dispensed volume (litres) as millilitres for today (UTC).
    fn record_usage(&self, device_id: String, volume_litres: f64) {
        let Some(permit) = self.write_permit(&device_id, "water_usage") else {
            return;
        };
        let repository = Arc::clone(&self.repository);
        let usage_ml = volume_litres * 1000.0;
        let today = Utc::now().date_naive();

        self.tracker.spawn(async move {
            let _permit = permit;
            match repository.add_water_usage(&device_id, today, usage_ml).await {
                Ok(total) => tracing::debug!(device_id = %device_id, total_ml = total, "Water usage recorded"),
                Err(e) => tracing::error!(device_id = %device_id, error = %e, "Failed to record water usage"),
            }
        });
    }
}
