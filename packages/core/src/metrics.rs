//! Prometheus metrics registry for the telemetry pipeline.
//!
//! [`AppMetrics`] owns all registered metrics and the [`Registry`] they
//! belong to. Construct it once at startup, wrap in `Arc`, and pass it
//! to the pipeline, the transport and the HTTP router.
//!
//! Exposed at `GET /metrics` in Prometheus text exposition format
//! (`text/plain; version=0.0.4`).

use prometheus::{Counter, CounterVec, Gauge, Opts, Registry};

/// All application-level Prometheus metrics.
pub struct AppMetrics {
    /// Inbound broker messages, labelled by route.
    pub messages_received_total: CounterVec,
    /// Inbound messages that were discarded, labelled by reason.
    pub messages_dropped_total: CounterVec,
    /// Readings successfully written to the store.
    pub readings_stored_total: Counter,
    /// Recorded pump transitions, labelled by source.
    pub pump_transitions_total: CounterVec,
    /// Pending automatic decision tasks evicted by backpressure.
    pub decision_tasks_evicted_total: Counter,
    /// Alerts that passed the debouncer.
    pub alerts_emitted_total: Counter,
    /// Alerts suppressed by the debouncer.
    pub alerts_suppressed_total: Counter,
    /// Alerts whose notification delivery failed.
    pub alert_delivery_failures_total: Counter,
    /// Broker reconnect attempts.
    pub transport_reconnects_total: Counter,
    /// Devices with a live decision worker.
    pub active_devices: Gauge,
    /// The registry that owns all of the above metrics.
    pub registry: Registry,
}

impl AppMetrics {
    /// Create and register all metrics.
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let messages_received_total = CounterVec::new(
            Opts::new(
                "livestock_telemetry_messages_received_total",
                "Inbound broker messages by route",
            ),
            &["route"],
        )?;

        let messages_dropped_total = CounterVec::new(
            Opts::new(
                "livestock_telemetry_messages_dropped_total",
                "Inbound broker messages dropped by reason",
            ),
            &["reason"],
        )?;

        let readings_stored_total = Counter::with_opts(Opts::new(
            "livestock_telemetry_readings_stored_total",
            "Readings written to the store",
        ))?;

        let pump_transitions_total = CounterVec::new(
            Opts::new(
                "livestock_telemetry_pump_transitions_total",
                "Recorded pump transitions by source",
            ),
            &["source"],
        )?;

        let decision_tasks_evicted_total = Counter::with_opts(Opts::new(
            "livestock_telemetry_decision_tasks_evicted_total",
            "Pending automatic decisions evicted by backpressure",
        ))?;

        let alerts_emitted_total = Counter::with_opts(Opts::new(
            "livestock_telemetry_alerts_emitted_total",
            "Alerts that passed the debouncer",
        ))?;

        let alerts_suppressed_total = Counter::with_opts(Opts::new(
            "livestock_telemetry_alerts_suppressed_total",
            "Alerts suppressed by the debouncer",
        ))?;

        let alert_delivery_failures_total = Counter::with_opts(Opts::new(
            "livestock_telemetry_alert_delivery_failures_total",
            "Alert notifications that failed to deliver",
        ))?;

        let transport_reconnects_total = Counter::with_opts(Opts::new(
            "livestock_telemetry_transport_reconnects_total",
            "Broker reconnect attempts",
        ))?;

        let active_devices = Gauge::with_opts(Opts::new(
            "livestock_telemetry_active_devices",
            "Devices with a live decision worker",
        ))?;

        registry.register(Box::new(messages_received_total.clone()))?;
        registry.register(Box::new(messages_dropped_total.clone()))?;
        registry.register(Box::new(readings_stored_total.clone()))?;
        registry.register(Box::new(pump_transitions_total.clone()))?;
        registry.register(Box::new(decision_tasks_evicted_total.clone()))?;
        registry.register(Box::new(alerts_emitted_total.clone()))?;
        registry.register(Box::new(alerts_suppressed_total.clone()))?;
        registry.register(Box::new(alert_delivery_failures_total.clone()))?;
        registry.register(Box::new(transport_reconnects_total.clone()))?;
        registry.register(Box::new(active_devices.clone()))?;

        Ok(Self {
            messages_received_total,
            messages_dropped_total,
            readings_stored_total,
            pump_transitions_total,
            decision_tasks_evicted_total,
            alerts_emitted_total,
            alerts_suppressed_total,
            alert_delivery_failures_total,
            transport_reconnects_total,
            active_devices,
            registry,
        })
    }

    /// Render all metrics as Prometheus text format (for the `/metrics` endpoint).
    pub fn render(&self) -> Result<String, prometheus::Error> {
        use prometheus::Encoder;
        let encoder = prometheus::TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buf = Vec::new();
        encoder.encode(&metric_families, &mut buf)?;
        Ok(String::from_utf8(buf).unwrap_or_default())
    }
}
