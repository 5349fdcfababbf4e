//! MQTT transport over rumqttc.
//!
//! [`MqttTransport::connect`] waits for the first ConnAck and fails if the
//! broker cannot be reached; everything after that is handled by
//! [`MqttEventLoop::run`], which reconnects with jittered backoff and
//! re-subscribes on every accepted ConnAck. A refused ConnAck counts as a
//! failed connection.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rumqttc::{
    AsyncClient, ConnAck, ConnectReturnCode, Event, EventLoop, MqttOptions, Outgoing, Packet, QoS,
    Transport,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn};

use crate::metrics::AppMetrics;
use crate::pipeline::router::Topics;
use crate::pipeline::types::{PumpCommandMessage, ThresholdMessage};
use crate::transport::backoff::Backoff;
use crate::transport::{render_topic, CommandPublisher, TransportError};

const DEFAULT_PORT: u16 = 1883;
const DEFAULT_TLS_PORT: u16 = 8883;
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const DISCONNECT_TIMEOUT: Duration = Duration::from_secs(2);
const REQUEST_CHANNEL_CAPACITY: usize = 256;

/// Receives every inbound publish while intake is open.
pub trait MessageHandler: Send + Sync {
    fn handle_message(&self, topic: &str, payload: &[u8]);
}

/// Connection settings for the broker.
#[derive(Debug, Clone)]
pub struct MqttSettings {
    pub broker_url: String,
    pub client_id: String,
    pub username: Option<String>,
    pub password: Option<String>,
    pub keep_alive: Duration,
    pub reconnect_base: Duration,
    pub reconnect_max: Duration,
}

/// Publishing half of the broker connection.
#[derive(Clone)]
pub struct MqttTransport {
    client: AsyncClient,
    topics: Topics,
    connected: Arc<AtomicBool>,
}

/// Receiving half. Must be driven by [`run`](MqttEventLoop::run) for
/// publishes to leave the process.
pub struct MqttEventLoop {
    client: AsyncClient,
    eventloop: EventLoop,
    subscriptions: Vec<String>,
    connected: Arc<AtomicBool>,
    backoff: Backoff,
    metrics: Arc<AppMetrics>,
}

impl MqttTransport {
    /// Connect, wait for the broker's ConnAck and subscribe to all inbound
    /// topics.
    pub async fn connect(
        settings: &MqttSettings,
        topics: Topics,
        metrics: Arc<AppMetrics>,
    ) -> Result<(Self, MqttEventLoop), TransportError> {
        let (host, port, tls) = parse_broker_url(&settings.broker_url)?;

        let mut options = MqttOptions::new(&settings.client_id, host.clone(), port);
        options.set_keep_alive(settings.keep_alive);
        options.set_clean_session(true);
        if let Some(username) = &settings.username {
            options.set_credentials(username, settings.password.clone().unwrap_or_default());
        }
        if tls {
            options.set_transport(Transport::tls_with_default_config());
        }

        let (client, mut eventloop) = AsyncClient::new(options, REQUEST_CHANNEL_CAPACITY);

        info!(host = %host, port, tls, client_id = %settings.client_id, "Connecting to MQTT broker");

        match tokio::time::timeout(CONNECT_TIMEOUT, wait_for_connack(&mut eventloop)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => return Err(e),
            Err(_) => {
                return Err(TransportError::Connect {
                    message: format!("no ConnAck within {}s", CONNECT_TIMEOUT.as_secs()),
                })
            }
        }

        let connected = Arc::new(AtomicBool::new(true));
        let mut event_loop = MqttEventLoop {
            client: client.clone(),
            eventloop,
            subscriptions: topics.subscriptions(),
            connected: Arc::clone(&connected),
            backoff: Backoff::new(settings.reconnect_base, settings.reconnect_max),
            metrics,
        };
        event_loop.subscribe_all();

        info!("Connected to MQTT broker");

        Ok((
            Self {
                client,
                topics,
                connected,
            },
            event_loop,
        ))
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn publish_retained(&self, topic: String, payload: Vec<u8>) -> Result<(), TransportError> {
        if !self.is_connected() {
            return Err(TransportError::Disconnected);
        }
        self.client
            .try_publish(topic, QoS::AtLeastOnce, true, payload)
            .map_err(|e| TransportError::Publish { message: e.to_string() })
    }
}

#[async_trait]
impl CommandPublisher for MqttTransport {
    async fn publish_pump_command(&self, message: &PumpCommandMessage) -> Result<(), TransportError> {
        let topic = render_topic(&self.topics.pump_command, &message.device_id);
        let payload = serde_json::to_vec(message)?;
        self.publish_retained(topic, payload)
    }

    async fn publish_thresholds(&self, message: &ThresholdMessage) -> Result<(), TransportError> {
        let topic = render_topic(&self.topics.thresholds, &message.device_id);
        let payload = serde_json::to_vec(message)?;
        self.publish_retained(topic, payload)
    }
}

impl MqttEventLoop {
    /// Drive the connection until `close` is cancelled.
    ///
    /// Inbound publishes are handed to `handler` only while `intake` is not
    /// cancelled; after that the loop keeps running so queued outbound
    /// publishes still reach the broker.
    pub async fn run(
        mut self,
        handler: Arc<dyn MessageHandler>,
        intake: CancellationToken,
        close: CancellationToken,
    ) {
        loop {
            tokio::select! {
                _ = close.cancelled() => break,
                event = self.eventloop.poll() => match event {
                    Ok(Event::Incoming(Packet::Publish(publish))) => {
                        if intake.is_cancelled() {
                            debug!(topic = %publish.topic, "Intake stopped, ignoring message");
                            continue;
                        }
                        let span = info_span!(
                            "mqtt_message",
                            topic = %publish.topic,
                            payload_size = publish.payload.len(),
                        );
                        span.in_scope(|| handler.handle_message(&publish.topic, &publish.payload));
                    }
                    Ok(Event::Incoming(Packet::ConnAck(ack))) => match check_connack(&ack) {
                        Ok(()) => {
                            self.connected.store(true, Ordering::SeqCst);
                            self.backoff.reset();
                            self.subscribe_all();
                            info!("Reconnected to MQTT broker");
                        }
                        Err(e) => {
                            if !self.back_off(&e.to_string(), &close).await {
                                break;
                            }
                        }
                    },
                    Ok(Event::Incoming(Packet::SubAck(_))) => {
                        debug!("Subscription acknowledged");
                    }
                    Ok(_) => {}
                    Err(e) => {
                        if !self.back_off(&e.to_string(), &close).await {
                            break;
                        }
                    }
                }
            }
        }

        self.disconnect().await;
    }

    /// Mark the link down and sleep before the next attempt. Returns false
    /// when `close` fired while waiting.
    async fn back_off(&mut self, error: &str, close: &CancellationToken) -> bool {
        self.connected.store(false, Ordering::SeqCst);
        self.metrics.transport_reconnects_total.inc();
        let delay = self.backoff.next_delay();
        warn!(
            error,
            attempt = self.backoff.attempt(),
            delay_ms = delay.as_millis() as u64,
            "MQTT connection lost, reconnecting"
        );
        tokio::select! {
            _ = close.cancelled() => false,
            _ = tokio::time::sleep(delay) => true,
        }
    }

    fn subscribe_all(&mut self) {
        for topic in &self.subscriptions {
            match self.client.try_subscribe(topic.as_str(), QoS::AtLeastOnce) {
                Ok(()) => info!(topic = %topic, "Subscribed"),
                Err(e) => warn!(topic = %topic, error = %e, "Failed to subscribe"),
            }
        }
    }

    async fn disconnect(&mut self) {
        self.connected.store(false, Ordering::SeqCst);
        if let Err(e) = self.client.try_disconnect() {
            debug!(error = %e, "Disconnect request not queued");
            return;
        }

        let flush = async {
            loop {
                match self.eventloop.poll().await {
                    Ok(Event::Outgoing(Outgoing::Disconnect)) | Err(_) => break,
                    Ok(_) => {}
                }
            }
        };

        if tokio::time::timeout(DISCONNECT_TIMEOUT, flush).await.is_err() {
            warn!("Timed out waiting for MQTT disconnect");
        } else {
            info!("Disconnected from MQTT broker");
        }
    }
}

async fn wait_for_connack(eventloop: &mut EventLoop) -> Result<(), TransportError> {
    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Packet::ConnAck(ack))) => return check_connack(&ack),
            Ok(_) => {}
            Err(e) => return Err(TransportError::Connect { message: e.to_string() }),
        }
    }
}

fn check_connack(ack: &ConnAck) -> Result<(), TransportError> {
    if ack.code == ConnectReturnCode::Success {
        return Ok(());
    }
    Err(TransportError::Connect {
        message: format!("broker refused connection: {:?}", ack.code),
    })
}

/// Parse `mqtt://host:port`, `tcp://host:port`, `mqtts://host:port` or
/// `host:port`. Returns host, port and whether TLS is required.
pub fn parse_broker_url(url: &str) -> Result<(String, u16, bool), TransportError> {
    let trimmed = url.trim().trim_end_matches('/');

    let (rest, tls) = if let Some(rest) = trimmed.strip_prefix("mqtts://") {
        (rest, true)
    } else if let Some(rest) = trimmed.strip_prefix("ssl://") {
        (rest, true)
    } else if let Some(rest) = trimmed.strip_prefix("mqtt://") {
        (rest, false)
    } else if let Some(rest) = trimmed.strip_prefix("tcp://") {
        (rest, false)
    } else {
        (trimmed, false)
    };

    let default_port = if tls { DEFAULT_TLS_PORT } else { DEFAULT_PORT };

    let parts: Vec<&str> = rest.split(':').collect();
    match parts.as_slice() {
        [host] if !host.is_empty() => Ok((host.to_string(), default_port, tls)),
        [host, port] if !host.is_empty() => {
            let port = port
                .parse::<u16>()
                .map_err(|_| TransportError::InvalidBrokerUrl(format!("invalid port in '{}'", url)))?;
            Ok((host.to_string(), port, tls))
        }
        _ => Err(TransportError::InvalidBrokerUrl(url.to_string())),
    }
}
