use std::sync::Arc;

use chrono::Utc;
use tokio_util::task::TaskTracker;

use crate::alerts::debounce::NotificationDebouncer;
use crate::alerts::webhook::AlertNotifier;
use crate::metrics::AppMetrics;
use crate::pipeline::types::{Alert, AlertEvent};
use crate::repository::TelemetryRepository;

/// Debounces alerts, hands survivors to the notifier, and logs every
/// emitted alert to the store.
///
/// Delivery runs on the shared task tracker so the caller (a decision
/// worker or the router) never waits on the notification service.
pub struct AlertPublisher {
    repository: Arc<TelemetryRepository>,
    notifier: Arc<dyn AlertNotifier>,
    debouncer: NotificationDebouncer,
    tracker: TaskTracker,
    metrics: Arc<AppMetrics>,
}

impl AlertPublisher {
    pub fn new(
        repository: Arc<TelemetryRepository>,
        notifier: Arc<dyn AlertNotifier>,
        debouncer: NotificationDebouncer,
        tracker: TaskTracker,
        metrics: Arc<AppMetrics>,
    ) -> Self {
        Self {
            repository,
            notifier,
            debouncer,
            tracker,
            metrics,
        }
    }

    /// Raise an alert. Returns false when the debouncer suppressed it.
    pub fn raise(self: &Arc<Self>, alert: Alert) -> bool {
        if !self.debouncer.should_emit(&alert.key()) {
            self.metrics.alerts_suppressed_total.inc();
            tracing::debug!(alert_type = %alert.alert_type, "Alert suppressed by debounce window");
            return false;
        }

        self.metrics.alerts_emitted_total.inc();

        let this = Arc::clone(self);
        self.tracker.spawn(async move {
            this.deliver(alert).await;
        });
        true
    }

    /// Send one notification and log the outcome. Delivery is not retried.
    pub async fn deliver(&self, alert: Alert) -> AlertEvent {
        let delivered = match self
            .notifier
            .notify(&alert.title, &alert.message, alert.alert_type)
            .await
        {
            Ok(()) => {
                tracing::info!(
                    alert_type = %alert.alert_type,
                    notifier = self.notifier.name(),
                    "Alert delivered: {}",
                    alert.message
                );
                true
            }
            Err(e) => {
                self.metrics.alert_delivery_failures_total.inc();
                tracing::warn!(
                    alert_type = %alert.alert_type,
                    notifier = self.notifier.name(),
                    "Alert delivery failed: {}",
                    e
                );
                false
            }
        };

        let mut event = AlertEvent {
            id: None,
            alert_key: alert.key(),
            title: alert.title,
            message: alert.message,
            alert_type: alert.alert_type,
            delivered,
            created_at: Utc::now(),
        };

        match self.repository.log_alert_event(&event).await {
            Ok(id) => event.id = Some(id),
            Err(e) => tracing::error!("Failed to log alert event: {}", e),
        }

        event
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;

    use crate::alerts::webhook::NotifyError;
    use crate::db::create_pool;
    use crate::pipeline::types::AlertType;

    #[derive(Default)]
    struct CountingNotifier {
        calls: AtomicUsize,
        fail: bool,
    }

    #[async_trait]
    impl AlertNotifier for CountingNotifier {
        async fn notify(&self, _title: &str, _message: &str, _alert_type: AlertType) -> Result<(), NotifyError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                Err(NotifyError::Status { status: 500 })
            } else {
                Ok(())
            }
        }

        fn name(&self) -> &str {
            "counting"
        }
    }

    async fn publisher(notifier: Arc<CountingNotifier>) -> (Arc<AlertPublisher>, Arc<TelemetryRepository>, TaskTracker) {
        let pool = create_pool("sqlite::memory:").await.unwrap();
        let repository = Arc::new(TelemetryRepository::new(pool));
        let tracker = TaskTracker::new();
        let publisher = Arc::new(AlertPublisher::new(
            Arc::clone(&repository),
            notifier,
            NotificationDebouncer::default(),
            tracker.clone(),
            Arc::new(AppMetrics::new().unwrap()),
        ));
        (publisher, repository, tracker)
    }

    #[tokio::test]
    async fn repeated_alert_is_delivered_once_within_window() {
        let notifier = Arc::new(CountingNotifier::default());
        let (publisher, repository, tracker) = publisher(Arc::clone(&notifier)).await;

        assert!(publisher.raise(Alert::level_low("1")));
        assert!(!publisher.raise(Alert::level_low("1")));

        tracker.close();
        tracker.wait().await;

        assert_eq!(notifier.calls.load(Ordering::SeqCst), 1);
        assert_eq!(repository.count_alert_events().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn different_devices_are_not_debounced_together() {
        let notifier = Arc::new(CountingNotifier::default());
        let (publisher, _repository, tracker) = publisher(Arc::clone(&notifier)).await;

        assert!(publisher.raise(Alert::level_low("1")));
        assert!(publisher.raise(Alert::level_low("2")));

        tracker.close();
        tracker.wait().await;
        assert_eq!(notifier.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn failed_delivery_is_logged_as_undelivered() {
        let notifier = Arc::new(CountingNotifier {
            calls: AtomicUsize::new(0),
            fail: true,
        });
        let (publisher, repository, _tracker) = publisher(Arc::clone(&notifier)).await;

        let event = publisher.deliver(Alert::temperature_high("1")).await;
        assert!(!event.delivered);
        assert!(event.id.is_some());

        let history = repository.query_alert_history(10).await.unwrap();
        assert_eq!(history.len(), 1);
        assert!(!history[0].delivered);
        assert_eq!(history[0].alert_type, AlertType::TemperatureHigh);
    }

    #[tokio::test]
    async fn successful_delivery_is_logged_as_delivered() {
        let notifier = Arc::new(CountingNotifier::default());
        let (publisher, _repository, _tracker) = publisher(notifier).await;

        let event = publisher.deliver(Alert::pump_auto_on("7")).await;
        assert!(event.delivered);
        assert_eq!(event.alert_key, Alert::pump_auto_on("7").key());
    }
}
