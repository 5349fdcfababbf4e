//! Telemetry Pipeline
//!
//! Turns inbound broker messages into stored readings, pump decisions and
//! alerts. [`Pipeline`] owns the router, the per-device workers, the
//! threshold store and the task tracker every background task runs on.
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//! use livestock_telemetry::alerts::LogNotifier;
//! use livestock_telemetry::db::create_pool;
//! use livestock_telemetry::metrics::AppMetrics;
//! use livestock_telemetry::pipeline::{Pipeline, PipelineSettings};
//! use livestock_telemetry::pipeline::router::Topics;
//! use livestock_telemetry::repository::TelemetryRepository;
//! use livestock_telemetry::transport::RecordingPublisher;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let pool = create_pool("sqlite::memory:").await?;
//! let pipeline = Pipeline::new(
//!     Arc::new(TelemetryRepository::new(pool)),
//!     Arc::new(RecordingPublisher::new()),
//!     Arc::new(LogNotifier),
//!     Topics::default(),
//!     PipelineSettings::default(),
//!     Arc::new(AppMetrics::new()?),
//! );
//!
//! pipeline.dispatch("livestock/data", br#"{"level": 25, "status": "low"}"#)?;
//! pipeline.shutdown(Duration::from_secs(5)).await;
//! # Ok(())
//! # }
//! ```

pub mod engine;
pub mod error;
pub mod normalizer;
pub mod queue;
pub mod router;
pub mod thresholds;
pub mod types;
pub mod worker;


use std::sync::Arc;
use std::time::Duration;

use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::alerts::{AlertNotifier, AlertPublisher, NotificationDebouncer};
use crate::metrics::AppMetrics;
use crate::repository::TelemetryRepository;
use crate::transport::mqtt::MessageHandler;
use crate::transport::CommandPublisher;

pub use engine::{decide, PumpController};
pub use error::{PipelineError, ValidationError};
pub use queue::DeviceTask;
pub use router::{Route, Router, Topics};
pub use thresholds::ThresholdStore;
pub use worker::DeviceWorkers;

use types::{PumpCommand, PumpState};

/// Runtime knobs for the pipeline.
#[derive(Debug, Clone)]
pub struct PipelineSettings {
    /// Used when a payload carries no device id.
    pub default_device_id: String,
    /// Temperature at or above which readings are `high` and alert.
    pub temperature_high_c: f64,
    /// Pending tasks per device before automatic decisions are evicted.
    pub queue_capacity: usize,
    /// Minimum interval between two identical alerts.
    pub debounce_window: Duration,
    /// Quiet period after which a device's worker is released.
    pub worker_idle_timeout: Duration,
    /// Store writes allowed in flight before new ones are dropped.
    pub max_pending_writes: usize,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            default_device_id: "1".to_string(),
            temperature_high_c: normalizer::DEFAULT_TEMPERATURE_HIGH_C,
            queue_capacity: queue::DEFAULT_CAPACITY,
            debounce_window: crate::alerts::debounce::DEFAULT_WINDOW,
            worker_idle_timeout: worker::DEFAULT_IDLE_TIMEOUT,
            max_pending_writes: router::DEFAULT_MAX_PENDING_WRITES,
        }
    }
}

pub struct Pipeline {
    router: Router,
    workers: Arc<DeviceWorkers>,
    controller: Arc<PumpController>,
    thresholds: ThresholdStore,
    repository: Arc<TelemetryRepository>,
    tracker: TaskTracker,
    intake: CancellationToken,
}

impl Pipeline {
    pub fn new(
        repository: Arc<TelemetryRepository>,
        publisher: Arc<dyn CommandPublisher>,
        notifier: Arc<dyn AlertNotifier>,
        topics: Topics,
        settings: PipelineSettings,
        metrics: Arc<AppMetrics>,
    ) -> Self {
        let tracker = TaskTracker::new();

        let alerts = Arc::new(AlertPublisher::new(
            Arc::clone(&repository),
            notifier,
            NotificationDebouncer::new(settings.debounce_window),
            tracker.clone(),
            Arc::clone(&metrics),
        ));

        let controller = Arc::new(PumpController::new(
            Arc::clone(&repository),
            Arc::clone(&publisher),
            Arc::clone(&alerts),
            Arc::clone(&metrics),
        ));

        let workers = Arc::new(DeviceWorkers::new(
            Arc::clone(&controller),
            settings.queue_capacity,
            settings.worker_idle_timeout,
            tracker.clone(),
            Arc::clone(&metrics),
        ));

        let router = Router::new(
            topics,
            settings.default_device_id,
            settings.temperature_high_c,
            Arc::clone(&repository),
            Arc::clone(&workers),
            alerts,
            tracker.clone(),
            settings.max_pending_writes,
            metrics,
        );

        Self {
            router,
            workers,
            controller,
            thresholds: ThresholdStore::new(Arc::clone(&repository), publisher),
            repository,
            tracker,
            intake: CancellationToken::new(),
        }
    }

    /// Route one inbound message. See [`Router::dispatch`].
    pub fn dispatch(&self, topic: &str, payload: &[u8]) -> Result<Route, PipelineError> {
        if self.intake.is_cancelled() {
            return Err(PipelineError::ShuttingDown);
        }
        self.router.dispatch(topic, payload)
    }

    /// Queue an operator command on the device's worker and wait for the
    /// resulting state.
    pub async fn submit_command(
        &self,
        device_id: &str,
        command: PumpCommand,
    ) -> Result<PumpState, PipelineError> {
        let (reply, result) = oneshot::channel();
        self.workers.submit(
            device_id,
            DeviceTask::Command {
                command,
                reply: Some(reply),
            },
        )?;
        result.await.map_err(|_| PipelineError::ShuttingDown)?
    }

    /// Current pump state (initial off/auto for unknown devices).
    pub async fn pump_state(&self, device_id: &str) -> Result<PumpState, PipelineError> {
        self.controller.current_state(device_id).await
    }

    pub fn thresholds(&self) -> &ThresholdStore {
        &self.thresholds
    }

    pub fn repository(&self) -> &Arc<TelemetryRepository> {
        &self.repository
    }

    /// Token cancelled once intake stops; the transport watches it.
    pub fn intake_token(&self) -> CancellationToken {
        self.intake.clone()
    }

    pub fn is_accepting(&self) -> bool {
        !self.intake.is_cancelled()
    }

    /// Stop intake, let workers finish queued work and wait for every
    /// background task, at most `timeout`. Returns false on timeout.
    pub async fn shutdown(&self, timeout: Duration) -> bool {
        self.intake.cancel();
        self.workers.close();
        self.tracker.close();

        match tokio::time::timeout(timeout, self.tracker.wait()).await {
            Ok(()) => {
                tracing::info!("Pipeline drained");
                true
            }
            Err(_) => {
                tracing::warn!(
                    pending = self.tracker.len(),
                    "Pipeline drain timed out after {}s",
                    timeout.as_secs()
                );
                false
            }
        }
    }
}

impl MessageHandler for Pipeline {
    fn handle_message(&self, topic: &str, payload: &[u8]) {
        // Errors are already logged and counted by the router.
        let _ = self.dispatch(topic, payload);
    }
}
