//! Telemetry Normalizer
//!
//! Pure functions that turn topic-specific JSON payloads into typed
//! readings. Nothing here touches the database or the broker, so every
//! validation rule is covered by plain unit tests.

use chrono::{DateTime, Utc};
use serde_json::{Map, Value};

use crate::pipeline::error::ValidationError;
use crate::pipeline::types::{parse_iso8601, PumpAck, Reading, ReadingKind};

/// Readings at or above this temperature are labelled `high`.
pub const DEFAULT_TEMPERATURE_HIGH_C: f64 = 38.0;
/// Readings below this temperature are labelled `low`.
pub const TEMPERATURE_LOW_C: f64 = 25.0;

/// Everything extracted from one telemetry-data message.
#[derive(Debug, Clone, PartialEq)]
pub struct WaterTelemetry {
    pub level: Reading,
    /// Volume dispensed since the last report, in litres.
    pub volume_litres: Option<f64>,
    /// Pump state as seen by the device, informational only.
    pub reported_pump: Option<String>,
    pub temperature: Option<Reading>,
}

/// Parse raw bytes into a JSON object.
pub fn parse_payload(payload: &[u8]) -> Result<Map<String, Value>, ValidationError> {
    let value: Value = serde_json::from_slice(payload).map_err(|e| ValidationError::InvalidJson {
        message: e.to_string(),
    })?;

    match value {
        Value::Object(map) => Ok(map),
        _ => Err(ValidationError::NotAnObject),
    }
}

/// Normalize a telemetry-data payload. Requires `level` and `status`.
pub fn normalize_water_telemetry(
    payload: &Map<String, Value>,
    fallback_device: &str,
    temperature_high_c: f64,
    received_at: DateTime<Utc>,
) -> Result<WaterTelemetry, ValidationError> {
    let device_id = device_id(payload, fallback_device)?;

    let level = required_number(payload, "level")?;
    let status = required_string(payload, "status")?;

    let volume_litres = optional_number(payload, "volume")?;
    if let Some(volume) = volume_litres {
        if volume < 0.0 {
            return Err(ValidationError::invalid("volume", "must not be negative"));
        }
    }

    let reported_pump = optional_string(payload, "pump")?;

    let temperature = optional_number(payload, "temperature")?
        .map(|t| temperature_reading(&device_id, t, temperature_high_c, received_at));

    Ok(WaterTelemetry {
        level: Reading {
            device_id,
            kind: ReadingKind::WaterLevel,
            value: level,
            status: Some(status),
            recorded_at: received_at,
        },
        volume_litres,
        reported_pump,
        temperature,
    })
}

/// Normalize a sensor-data payload. At least one of `temperature` or
/// `humidity` must be present; each present field becomes its own reading.
pub fn normalize_sensor(
    payload: &Map<String, Value>,
    fallback_device: &str,
    temperature_high_c: f64,
    received_at: DateTime<Utc>,
) -> Result<Vec<Reading>, ValidationError> {
    let device_id = device_id(payload, fallback_device)?;

    let temperature = optional_number(payload, "temperature")?;
    let humidity = optional_number(payload, "humidity")?;

    if temperature.is_none() && humidity.is_none() {
        return Err(ValidationError::MissingAnyOf {
            fields: "temperature, humidity",
        });
    }

    let mut readings = Vec::with_capacity(2);

    if let Some(t) = temperature {
        readings.push(temperature_reading(&device_id, t, temperature_high_c, received_at));
    }

    if let Some(h) = humidity {
        if !(0.0..=100.0).contains(&h) {
            return Err(ValidationError::invalid("humidity", "must be between 0 and 100"));
        }
        readings.push(Reading {
            device_id: device_id.clone(),
            kind: ReadingKind::Humidity,
            value: h,
            status: None,
            recorded_at: received_at,
        });
    }

    Ok(readings)
}

/// Normalize a pump-status-ack payload. Requires `status`, `mode` and an
/// ISO-8601 `timestamp`; a timestamp without an offset is read as UTC.
pub fn normalize_pump_ack(
    payload: &Map<String, Value>,
    fallback_device: &str,
    received_at: DateTime<Utc>,
) -> Result<PumpAck, ValidationError> {
    let device_id = device_id(payload, fallback_device)?;

    let status = required_string(payload, "status")?
        .parse()
        .map_err(|e: String| ValidationError::invalid("status", e))?;

    let mode = required_string(payload, "mode")?
        .parse()
        .map_err(|e: String| ValidationError::invalid("mode", e))?;

    let raw_ts = required_string(payload, "timestamp")?;
    let timestamp = parse_iso8601(&raw_ts).ok_or_else(|| {
        ValidationError::invalid(
            "timestamp",
            format!("'{}' is not a supported ISO-8601 date-time", raw_ts),
        )
    })?;

    Ok(PumpAck {
        device_id,
        status,
        mode,
        timestamp,
        received_at,
    })
}

/// Status label for a temperature value.
pub fn classify_temperature(celsius: f64, high_c: f64) -> &'static str {
    if celsius >= high_c {
        "high"
    } else if celsius < TEMPERATURE_LOW_C {
        "low"
    } else {
        "normal"
    }
}

fn temperature_reading(
    device_id: &str,
    celsius: f64,
    high_c: f64,
    recorded_at: DateTime<Utc>,
) -> Reading {
    Reading {
        device_id: device_id.to_string(),
        kind: ReadingKind::Temperature,
        value: celsius,
        status: Some(classify_temperature(celsius, high_c).to_string()),
        recorded_at,
    }
}

/// `device_id` may be a string or an integer; absent means the fallback.
fn device_id(payload: &Map<String, Value>, fallback: &str) -> Result<String, ValidationError> {
    match payload.get("device_id") {
        None | Some(Value::Null) => Ok(fallback.to_string()),
        Some(Value::String(s)) if !s.trim().is_empty() => Ok(s.trim().to_string()),
        Some(Value::Number(n)) if n.is_u64() || n.is_i64() => Ok(n.to_string()),
        Some(_) => Err(ValidationError::invalid(
            "device_id",
            "must be a non-empty string or an integer",
        )),
    }
}

fn required_number(payload: &Map<String, Value>, field: &'static str) -> Result<f64, ValidationError> {
    optional_number(payload, field)?.ok_or_else(|| ValidationError::missing(field))
}

fn optional_number(
    payload: &Map<String, Value>,
    field: &'static str,
) -> Result<Option<f64>, ValidationError> {
    match payload.get(field) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Number(n)) => match n.as_f64() {
            Some(v) if v.is_finite() => Ok(Some(v)),
            _ => Err(ValidationError::invalid(field, "must be a finite number")),
        },
        Some(other) => Err(ValidationError::invalid(
            field,
            format!("expected a number, got {}", json_type(other)),
        )),
    }
}

fn required_string(payload: &Map<String, Value>, field: &'static str) -> Result<String, ValidationError> {
    optional_string(payload, field)?.ok_or_else(|| ValidationError::missing(field))
}

fn optional_string(
    payload: &Map<String, Value>,
    field: &'static str,
) -> Result<Option<String>, ValidationError> {
    match payload.get(field) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) if s.trim().is_empty() => {
            Err(ValidationError::invalid(field, "must not be empty"))
        }
        Some(Value::String(s)) => Ok(Some(s.trim().to_string())),
        Some(other) => Err(ValidationError::invalid(
            field,
            format!("expected a string, got {}", json_type(other)),
        )),
    }
}

fn json_type(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
