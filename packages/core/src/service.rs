//! Service lifecycle.
//!
//! [`TelemetryService::start`] connects to the broker, builds the pipeline
//! and spawns the transport loop. [`TelemetryService::shutdown`] stops
//! intake, drains in-flight per-device work within the configured timeout
//! and only then closes the broker connection, so commands produced while
//! draining are still published.

use std::sync::Arc;
use std::time::Duration;

use sqlx::SqlitePool;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::alerts::{AlertNotifier, LogNotifier, WebhookNotifier};
use crate::config::Config;
use crate::error::AppError;
use crate::metrics::AppMetrics;
use crate::pipeline::Pipeline;
use crate::repository::TelemetryRepository;
use crate::transport::mqtt::MessageHandler;
use crate::transport::MqttTransport;

pub struct TelemetryService {
    pipeline: Arc<Pipeline>,
    transport: MqttTransport,
    close: CancellationToken,
    transport_task: JoinHandle<()>,
    drain_timeout: Duration,
}

impl TelemetryService {
    /// Connect and start consuming. Fails if the broker is unreachable.
    pub async fn start(
        config: &Config,
        pool: SqlitePool,
        metrics: Arc<AppMetrics>,
    ) -> Result<Self, AppError> {
        let repository = Arc::new(TelemetryRepository::new(pool));

        let (transport, event_loop) = MqttTransport::connect(
            &config.mqtt_settings(),
            config.topics.clone(),
            Arc::clone(&metrics),
        )
        .await?;

        let notifier: Arc<dyn AlertNotifier> = match &config.webhook_url {
            Some(url) => {
                tracing::info!(url = %url, "Alerts will be delivered to webhook");
                Arc::new(WebhookNotifier::new(url.clone()))
            }
            None => {
                tracing::info!("No ALERT_WEBHOOK_URL set, alerts are only logged");
                Arc::new(LogNotifier)
            }
        };

        let pipeline = Arc::new(Pipeline::new(
            repository,
            Arc::new(transport.clone()),
            notifier,
            config.topics.clone(),
            config.pipeline_settings(),
            metrics,
        ));

        let close = CancellationToken::new();
        let handler: Arc<dyn MessageHandler> = pipeline.clone();
        let transport_task = tokio::spawn(event_loop.run(
            handler,
            pipeline.intake_token(),
            close.clone(),
        ));

        tracing::info!("Telemetry service started");

        Ok(Self {
            pipeline,
            transport,
            close,
            transport_task,
            drain_timeout: config.shutdown_drain(),
        })
    }

    pub fn pipeline(&self) -> Arc<Pipeline> {
        Arc::clone(&self.pipeline)
    }

    /// Returns false if the drain timed out.
    pub async fn shutdown(self) -> bool {
        tracing::info!("Stopping telemetry intake");
        let drained = self.pipeline.shutdown(self.drain_timeout).await;

        if !self.transport.is_connected() {
            tracing::warn!("Broker is not connected, commands issued while draining may not be delivered");
        }

        self.close.cancel();
        if let Err(e) = self.transport_task.await {
            tracing::error!("Transport task ended abnormally: {}", e);
        }

        tracing::info!("Telemetry service stopped");
        drained
    }
}
