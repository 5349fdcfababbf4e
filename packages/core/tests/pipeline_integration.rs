//! End-to-end pipeline tests: raw broker payloads in, stored state out.

use std::sync::Arc;
use std::time::Duration;

use chrono::{Duration as ChronoDuration, Utc};

use livestock_telemetry::{
    alerts::LogNotifier,
    db,
    metrics::AppMetrics,
    pipeline::{
        router::Topics,
        types::{PumpCommand, PumpMode, PumpStatus, ReadingKind, TransitionSource},
        Pipeline, PipelineSettings,
    },
    repository::TelemetryRepository,
    transport::RecordingPublisher,
};

struct Harness {
    pipeline: Arc<Pipeline>,
    repository: Arc<TelemetryRepository>,
    publisher: Arc<RecordingPublisher>,
    metrics: Arc<AppMetrics>,
}

async fn harness(settings: PipelineSettings) -> Harness {
    let pool = db::create_pool("sqlite::memory:").await.unwrap();
    let repository = Arc::new(TelemetryRepository::new(pool));
    let publisher = Arc::new(RecordingPublisher::new());
    let metrics = Arc::new(AppMetrics::new().unwrap());
    let pipeline = Arc::new(Pipeline::new(
        Arc::clone(&repository),
        publisher.clone(),
        Arc::new(LogNotifier),
        Topics::default(),
        settings,
        Arc::clone(&metrics),
    ));
    Harness {
        pipeline,
        repository,
        publisher,
        metrics,
    }
}

fn telemetry(device_id: &str, level: f64) -> Vec<u8> {
    format!(
        r#"{{"device_id": "{}", "level": {}, "status": "ok"}}"#,
        device_id, level
    )
    .into_bytes()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn devices_are_controlled_independently_under_concurrency() {
    let h = harness(PipelineSettings::default()).await;
    let devices: Vec<String> = (0..8).map(|i| format!("pen-{}", i)).collect();

    for device in &devices {
        h.pipeline.thresholds().update(device, 80.0, 20.0).await.unwrap();
    }

    let mut handles = Vec::new();
    for device in devices.clone() {
        let pipeline = Arc::clone(&h.pipeline);
        handles.push(tokio::spawn(async move {
            for level in [10.0, 50.0, 90.0, 15.0] {
                pipeline.dispatch("livestock/data", &telemetry(&device, level)).unwrap();
            }
        }));
    }
    for handle in handles {
        handle.await.unwrap();
    }

    assert!(h.pipeline.shutdown(Duration::from_secs(10)).await);

    for device in &devices {
        let history = h.repository.pump_history(device, 10).await.unwrap();
        let statuses: Vec<PumpStatus> = history.iter().rev().map(|e| e.status).collect();
        assert_eq!(statuses, vec![PumpStatus::On, PumpStatus::Off, PumpStatus::On], "device {}", device);
        assert_eq!(
            h.repository.count_readings(device, ReadingKind::WaterLevel).await.unwrap(),
            4
        );
    }
    assert_eq!(h.publisher.commands().len(), devices.len() * 3);
}

#[tokio::test]
async fn operator_switch_back_to_auto_resumes_control() {
    let h = harness(PipelineSettings::default()).await;
    h.pipeline.thresholds().update("1", 95.0, 30.0).await.unwrap();

    h.pipeline
        .submit_command(
            "1",
            PumpCommand {
                mode: PumpMode::Manual,
                status: Some(PumpStatus::Off),
            },
        )
        .await
        .unwrap();
    h.pipeline.dispatch("livestock/data", &telemetry("1", 10.0)).unwrap();

    h.pipeline
        .submit_command(
            "1",
            PumpCommand {
                mode: PumpMode::Auto,
                status: None,
            },
        )
        .await
        .unwrap();
    h.pipeline.dispatch("livestock/data", &telemetry("1", 10.0)).unwrap();

    assert!(h.pipeline.shutdown(Duration::from_secs(5)).await);

    let history = h.repository.pump_history("1", 10).await.unwrap();
    let sources: Vec<TransitionSource> = history.iter().rev().map(|e| e.source).collect();
    assert_eq!(
        sources,
        vec![
            TransitionSource::Operator,
            TransitionSource::Operator,
            TransitionSource::Automatic
        ]
    );
    assert_eq!(history[0].status, PumpStatus::On);
}

#[tokio::test]
async fn pump_ack_reconciles_state_and_stale_ack_is_ignored() {
    let h = harness(PipelineSettings::default()).await;

    let fresh = format!(
        r#"{{"status": "ON", "mode": "auto", "timestamp": "{}"}}"#,
        Utc::now().to_rfc3339()
    );
    h.pipeline.dispatch("livestock/pump/status", fresh.as_bytes()).unwrap();

    let stale = format!(
        r#"{{"status": "off", "mode": "auto", "timestamp": "{}"}}"#,
        (Utc::now() - ChronoDuration::hours(1)).to_rfc3339()
    );
    h.pipeline.dispatch("livestock/pump/status", stale.as_bytes()).unwrap();

    assert!(h.pipeline.shutdown(Duration::from_secs(5)).await);

    let state = h.repository.latest_pump_state("1").await.unwrap().unwrap();
    assert_eq!(state.status, PumpStatus::On);
    assert_eq!(h.repository.pump_history("1", 10).await.unwrap().len(), 1);
    assert!(h.publisher.commands().is_empty());
}

#[tokio::test]
async fn device_with_fast_clock_is_still_reconciled() {
    let h = harness(PipelineSettings::default()).await;

    let ahead = format!(
        r#"{{"status": "on", "mode": "auto", "timestamp": "{}"}}"#,
        (Utc::now() + ChronoDuration::hours(3)).to_rfc3339()
    );
    h.pipeline.dispatch("livestock/pump/status", ahead.as_bytes()).unwrap();

    // Compact offset, as some device firmware sends it.
    let corrected = format!(
        r#"{{"status": "off", "mode": "auto", "timestamp": "{}"}}"#,
        (Utc::now() + ChronoDuration::seconds(1)).format("%Y-%m-%dT%H:%M:%S%z")
    );
    h.pipeline.dispatch("livestock/pump/status", corrected.as_bytes()).unwrap();

    assert!(h.pipeline.shutdown(Duration::from_secs(5)).await);

    let state = h.repository.latest_pump_state("1").await.unwrap().unwrap();
    assert_eq!(state.status, PumpStatus::Off);
    assert!(state.updated_at <= Utc::now());
    assert_eq!(h.repository.pump_history("1", 10).await.unwrap().len(), 2);
}

#[tokio::test]
async fn malformed_messages_are_counted_as_dropped() {
    let h = harness(PipelineSettings::default()).await;

    assert!(h.pipeline.dispatch("livestock/data", b"{oops").is_err());
    assert!(h.pipeline.dispatch("livestock/sensor/data", br#"{"humidity": 140}"#).is_err());
    assert!(h.pipeline.shutdown(Duration::from_secs(5)).await);

    let dropped = h
        .metrics
        .messages_dropped_total
        .with_label_values(&["malformed"])
        .get();
    assert!((dropped - 2.0).abs() < f64::EPSILON);
    assert_eq!(
        h.repository.count_readings("1", ReadingKind::Humidity).await.unwrap(),
        0
    );
}

#[tokio::test]
async fn disconnected_transport_does_not_block_decisions() {
    let h = harness(PipelineSettings::default()).await;
    h.publisher.set_disconnected(true);
    h.pipeline.thresholds().update("1", 95.0, 30.0).await.unwrap();

    h.pipeline.dispatch("livestock/data", &telemetry("1", 5.0)).unwrap();
    assert!(h.pipeline.shutdown(Duration::from_secs(5)).await);

    let state = h.repository.latest_pump_state("1").await.unwrap().unwrap();
    assert_eq!(state.status, PumpStatus::On);
    assert!(h.publisher.commands().is_empty());
}

#[tokio::test]
async fn custom_default_device_id_is_used_for_bare_payloads() {
    let settings = PipelineSettings {
        default_device_id: "trough-A".to_string(),
        ..PipelineSettings::default()
    };
    let h = harness(settings).await;

    h.pipeline
        .dispatch("livestock/data", br#"{"level": 70, "status": "ok"}"#)
        .unwrap();
    assert!(h.pipeline.shutdown(Duration::from_secs(5)).await);

    assert_eq!(
        h.repository.count_readings("trough-A", ReadingKind::WaterLevel).await.unwrap(),
        1
    );
}

#[tokio::test]
async fn writes_beyond_backlog_are_dropped_and_counted() {
    let settings = PipelineSettings {
        max_pending_writes: 2,
        ..PipelineSettings::default()
    };
    let h = harness(settings).await;

    // Current-thread runtime: nothing spawned runs until we await, so all
    // five writes compete for the two slots.
    for humidity in [40, 41, 42, 43, 44] {
        let payload = format!(r#"{{"humidity": {}}}"#, humidity);
        h.pipeline.dispatch("livestock/sensor/data", payload.as_bytes()).unwrap();
    }
    assert!(h.pipeline.shutdown(Duration::from_secs(5)).await);

    assert_eq!(
        h.repository.count_readings("1", ReadingKind::Humidity).await.unwrap(),
        2
    );
    let dropped = h
        .metrics
        .messages_dropped_total
        .with_label_values(&["persistence_backlog"])
        .get();
    assert!((dropped - 3.0).abs() < f64::EPSILON);
}
