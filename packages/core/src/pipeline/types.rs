//! Core data types for the telemetry pipeline

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, NaiveDate, NaiveDateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

/// Kind of measurement carried by a [`Reading`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReadingKind {
    WaterLevel,
    Temperature,
    Humidity,
}

impl ReadingKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReadingKind::WaterLevel => "water_level",
            ReadingKind::Temperature => "temperature",
            ReadingKind::Humidity => "humidity",
        }
    }
}

impl FromStr for ReadingKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "water_level" => Ok(ReadingKind::WaterLevel),
            "temperature" => Ok(ReadingKind::Temperature),
            "humidity" => Ok(ReadingKind::Humidity),
            other => Err(format!("unknown reading kind '{}'", other)),
        }
    }
}

/// A single normalized measurement from a field device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reading {
    pub device_id: String,
    pub kind: ReadingKind,
    pub value: f64,
    /// Status label, either reported by the device or derived on ingest.
    pub status: Option<String>,
    pub recorded_at: DateTime<Utc>,
}

/// Pump actuation status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PumpStatus {
    On,
    Off,
}

impl PumpStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PumpStatus::On => "on",
            PumpStatus::Off => "off",
        }
    }
}

impl fmt::Display for PumpStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PumpStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "on" => Ok(PumpStatus::On),
            "off" => Ok(PumpStatus::Off),
            other => Err(format!("expected 'on' or 'off', got '{}'", other)),
        }
    }
}

/// Who is in charge of the pump.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PumpMode {
    Auto,
    Manual,
}

impl PumpMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            PumpMode::Auto => "auto",
            PumpMode::Manual => "manual",
        }
    }
}

impl fmt::Display for PumpMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PumpMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "auto" => Ok(PumpMode::Auto),
            "manual" => Ok(PumpMode::Manual),
            other => Err(format!("expected 'auto' or 'manual', got '{}'", other)),
        }
    }
}

/// Current recorded pump state for one device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PumpState {
    pub device_id: String,
    pub status: PumpStatus,
    pub mode: PumpMode,
    pub updated_at: DateTime<Utc>,
}

impl PumpState {
    /// State assumed for a device that has never reported or been commanded.
    pub fn initial(device_id: impl Into<String>) -> Self {
        Self {
            device_id: device_id.into(),
            status: PumpStatus::Off,
            mode: PumpMode::Auto,
            updated_at: DateTime::<Utc>::MIN_UTC,
        }
    }
}

/// What caused a pump transition. Stored alongside every history row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransitionSource {
    Automatic,
    Operator,
    Device,
}

impl TransitionSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransitionSource::Automatic => "automatic",
            TransitionSource::Operator => "operator",
            TransitionSource::Device => "device",
        }
    }
}

impl FromStr for TransitionSource {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "automatic" => Ok(TransitionSource::Automatic),
            "operator" => Ok(TransitionSource::Operator),
            "device" => Ok(TransitionSource::Device),
            other => Err(format!("unknown transition source '{}'", other)),
        }
    }
}

/// One row of the append-only pump audit log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PumpHistoryEntry {
    pub id: i64,
    pub device_id: String,
    pub status: PumpStatus,
    pub mode: PumpMode,
    pub source: TransitionSource,
    pub recorded_at: DateTime<Utc>,
}

/// Per-device water level bounds.
/// Water dispensed on one UTC calendar day.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DailyUsage {
    pub date: NaiveDate,
    pub usage_ml: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThresholdConfig {
    pub device_id: String,
    pub upper_bound: f64,
    pub lower_bound: f64,
    pub updated_at: DateTime<Utc>,
}

/// Operator request to change the pump.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PumpCommand {
    pub mode: PumpMode,
    #[serde(default)]
    pub status: Option<PumpStatus>,
}

/// A device reporting its own actuation.
#[derive(Debug, Clone, PartialEq)]
pub struct PumpAck {
    pub device_id: String,
    pub status: PumpStatus,
    pub mode: PumpMode,
    /// Device clock. Only used for ordering, never stored as state time.
    pub timestamp: DateTime<Utc>,
    /// Server clock at ingest.
    pub received_at: DateTime<Utc>,
}

impl PumpAck {
    /// Device time capped at receive time, so a device clock running ahead
    /// cannot make later reports look stale.
    pub fn reported_at(&self) -> DateTime<Utc> {
        self.timestamp.min(self.received_at)
    }
}

/// Payload published on the pump command topic.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PumpCommandMessage {
    pub device_id: String,
    pub status: PumpStatus,
    pub mode: PumpMode,
    pub timestamp: String,
}

impl From<&PumpState> for PumpCommandMessage {
    fn from(state: &PumpState) -> Self {
        Self {
            device_id: state.device_id.clone(),
            status: state.status,
            mode: state.mode,
            timestamp: format_timestamp(state.updated_at),
        }
    }
}

/// Payload published (retained) on the threshold config topic.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThresholdMessage {
    pub device_id: String,
    pub upper_bound: f64,
    pub lower_bound: f64,
}

impl From<&ThresholdConfig> for ThresholdMessage {
    fn from(config: &ThresholdConfig) -> Self {
        Self {
            device_id: config.device_id.clone(),
            upper_bound: config.upper_bound,
            lower_bound: config.lower_bound,
        }
    }
}

/// Closed set of alert kinds raised by the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AlertType {
    #[serde(rename = "temp-high")]
    TemperatureHigh,
    #[serde(rename = "level-low")]
    LevelLow,
    #[serde(rename = "pump-auto-on")]
    PumpAutoOn,
}

impl AlertType {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlertType::TemperatureHigh => "temp-high",
            AlertType::LevelLow => "level-low",
            AlertType::PumpAutoOn => "pump-auto-on",
        }
    }
}

impl fmt::Display for AlertType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AlertType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "temp-high" => Ok(AlertType::TemperatureHigh),
            "level-low" => Ok(AlertType::LevelLow),
            "pump-auto-on" => Ok(AlertType::PumpAutoOn),
            other => Err(format!("unknown alert type '{}'", other)),
        }
    }
}

/// An operator alert before it reaches the debouncer.
#[derive(Debug, Clone, PartialEq)]
pub struct Alert {
    pub alert_type: AlertType,
    pub title: String,
    pub message: String,
}

impl Alert {
    pub fn temperature_high(device_id: &str) -> Self {
        Self {
            alert_type: AlertType::TemperatureHigh,
            title: "High temperature".to_string(),
            message: format!("Temperature on device {} reached the high limit", device_id),
        }
    }

    pub fn level_low(device_id: &str) -> Self {
        Self {
            alert_type: AlertType::LevelLow,
            title: "Low water level".to_string(),
            message: format!("Water level on device {} is below the lower bound", device_id),
        }
    }

    pub fn pump_auto_on(device_id: &str) -> Self {
        Self {
            alert_type: AlertType::PumpAutoOn,
            title: "Pump started automatically".to_string(),
            message: format!("Pump on device {} was switched on automatically", device_id),
        }
    }

    /// Dedupe identity: type and message together.
    pub fn key(&self) -> String {
        format!("{}|{}", self.alert_type.as_str(), self.message)
    }
}

/// A persisted alert.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlertEvent {
    pub id: Option<i64>,
    pub alert_key: String,
    pub title: String,
    pub message: String,
    pub alert_type: AlertType,
    pub delivered: bool,
    pub created_at: DateTime<Utc>,
}

/// Fixed-width RFC 3339 so stored timestamps sort lexically.
pub fn format_timestamp(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Inverse of [`format_timestamp`]; accepts any RFC 3339 offset.
pub fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .ok()
        .map(|ts| ts.with_timezone(&Utc))
}

const ISO_OFFSET_FORMATS: &[&str] = &[
    "%Y-%m-%dT%H:%M:%S%.f%z",
    "%Y-%m-%d %H:%M:%S%.f%z",
    "%Y%m%dT%H%M%S%.f%z",
];

const ISO_LOCAL_FORMATS: &[&str] = &[
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y%m%dT%H%M%S%.f",
];

/// Device-supplied ISO-8601 timestamps: RFC 3339, `±hhmm` offsets, the
/// basic `YYYYMMDDThhmmss` form and timestamps without an offset, which
/// are taken as UTC.
pub fn parse_iso8601(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();

    if let Some(ts) = parse_timestamp(raw) {
        return Some(ts);
    }

    for format in ISO_OFFSET_FORMATS {
        if let Ok(ts) = DateTime::parse_from_str(raw, format) {
            return Some(ts.with_timezone(&Utc));
        }
    }

    let local = raw
        .strip_suffix('Z')
        .or_else(|| raw.strip_suffix('z'))
        .unwrap_or(raw);
    ISO_LOCAL_FORMATS
        .iter()
        .find_map(|format| NaiveDateTime::parse_from_str(local, format).ok())
        .map(|naive| naive.and_utc())
}
