//! Alert notification delivery.
//!
//! [`AlertNotifier`] is the seam to the external notification service.
//! [`WebhookNotifier`] POSTs a JSON body to a configured URL;
//! [`LogNotifier`] is used when no URL is configured and only writes a log
//! line. Delivery is attempted exactly once: callers log failures and move on.

use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use reqwest::Client;
use serde::Serialize;
use thiserror::Error;

use crate::pipeline::types::{format_timestamp, AlertType};

/// Upper bound on a single webhook round trip.
const WEBHOOK_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Error, Debug)]
pub enum NotifyError {
    #[error("Webhook request failed: {message}")]
    Request { message: String },

    #[error("Webhook returned HTTP {status}")]
    Status { status: u16 },
}

/// External notification collaborator.
#[async_trait]
pub trait AlertNotifier: Send + Sync {
    async fn notify(&self, title: &str, message: &str, alert_type: AlertType) -> Result<(), NotifyError>;

    /// Name of this notifier for logging.
    fn name(&self) -> &str;
}

#[derive(Debug, Serialize)]
struct WebhookBody<'a> {
    title: &'a str,
    message: &'a str,
    #[serde(rename = "type")]
    alert_type: &'a str,
    sent_at: String,
}

/// Delivers alerts as an HTTP POST.
#[derive(Clone)]
pub struct WebhookNotifier {
    url: String,
    http: Client,
}

impl WebhookNotifier {
    pub fn new(url: impl Into<String>) -> Self {
        let http = Client::builder()
            .timeout(WEBHOOK_TIMEOUT)
            .build()
            .unwrap_or_else(|_| Client::new());

        Self {
            url: url.into(),
            http,
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl AlertNotifier for WebhookNotifier {
    async fn notify(&self, title: &str, message: &str, alert_type: AlertType) -> Result<(), NotifyError> {
        let body = WebhookBody {
            title,
            message,
            alert_type: alert_type.as_str(),
            sent_at: format_timestamp(Utc::now()),
        };

        let response = self
            .http
            .post(&self.url)
            .json(&body)
            .send()
            .await
            .map_err(|e| NotifyError::Request { message: e.to_string() })?;

        if !response.status().is_success() {
            return Err(NotifyError::Status {
                status: response.status().as_u16(),
            });
        }

        Ok(())
    }

    fn name(&self) -> &str {
        "webhook"
    }
}

/// Fallback notifier that only logs.
#[derive(Debug, Default, Clone)]
pub struct LogNotifier;

#[async_trait]
impl AlertNotifier for LogNotifier {
    async fn notify(&self, title: &str, message: &str, alert_type: AlertType) -> Result<(), NotifyError> {
        tracing::info!(alert_type = %alert_type, title, "ALERT: {}", message);
        Ok(())
    }

    fn name(&self) -> &str {
        "log"
    }
}
