use std::env;
use std::str::FromStr;
use std::time::Duration;

use rand::Rng;

use crate::cli::Cli;
use crate::pipeline::router::Topics;
use crate::pipeline::PipelineSettings;
use crate::transport::MqttSettings;

const DEFAULT_DATABASE_URL: &str = "sqlite://livestock.db";
const DEFAULT_API_PORT: u16 = 5000;
const DEFAULT_DEBOUNCE_SECONDS: u64 = 600;
const DEFAULT_TEMPERATURE_HIGH_CELSIUS: f64 = 38.0;
const DEFAULT_DEVICE_ID: &str = "1";
const DEFAULT_QUEUE_CAPACITY: usize = 32;
const DEFAULT_WORKER_IDLE_SECONDS: u64 = 300;
const DEFAULT_MAX_PENDING_WRITES: usize = 1024;
const DEFAULT_SHUTDOWN_DRAIN_SECONDS: u64 = 10;
const DEFAULT_RECONNECT_BASE_MS: u64 = 500;
const DEFAULT_RECONNECT_MAX_SECONDS: u64 = 30;
const MQTT_KEEP_ALIVE: Duration = Duration::from_secs(30);

#[derive(Clone)]
pub struct Config {
    pub broker_url: String,
    pub mqtt_client_id: String,
    pub mqtt_username: Option<String>,
    pub mqtt_password: Option<String>,
    pub topics: Topics,
    pub database_url: String,
    pub api_port: u16,
    pub webhook_url: Option<String>,
    pub debounce_seconds: u64,
    pub temperature_high_celsius: f64,
    pub default_device_id: String,
    pub queue_capacity: usize,
    pub worker_idle_seconds: u64,
    pub max_pending_writes: usize,
    pub shutdown_drain_seconds: u64,
    pub reconnect_base_ms: u64,
    pub reconnect_max_seconds: u64,
}

impl std::fmt::Debug for Config {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Config")
            .field("broker_url", &self.broker_url)
            .field("mqtt_client_id", &self.mqtt_client_id)
            .field("mqtt_username", &self.mqtt_username)
            .field("mqtt_password", &self.mqtt_password.as_ref().map(|_| "***"))
            .field("topics", &self.topics)
            .field("database_url", &self.database_url)
            .field("api_port", &self.api_port)
            .field("webhook_url", &self.webhook_url)
            .field("debounce_seconds", &self.debounce_seconds)
            .field("temperature_high_celsius", &self.temperature_high_celsius)
            .field("default_device_id", &self.default_device_id)
            .field("queue_capacity", &self.queue_capacity)
            .field("worker_idle_seconds", &self.worker_idle_seconds)
            .field("max_pending_writes", &self.max_pending_writes)
            .field("shutdown_drain_seconds", &self.shutdown_drain_seconds)
            .finish()
    }
}

impl Config {
    /// Environment plus CLI overrides. `--broker-url` satisfies the
    /// required broker setting on its own.
    pub fn load(cli: &Cli) -> Result<Self, String> {
        Self::from_lookup(|key| match (key, &cli.broker_url) {
            ("MQTT_BROKER_URL", Some(url)) => Some(url.clone()),
            _ => env::var(key).ok(),
        })?
        .with_cli(cli)
    }

    /// Build from any key lookup; `load` passes the process environment.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, String>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        let broker_url = get("MQTT_BROKER_URL").ok_or("MQTT_BROKER_URL is required")?;

        let mqtt_client_id = get("MQTT_CLIENT_ID").unwrap_or_else(|| {
            format!("livestock-telemetry-{:08x}", rand::thread_rng().gen::<u32>())
        });

        let defaults = Topics::default();
        let topics = Topics {
            telemetry: get("MQTT_TOPIC_TELEMETRY").unwrap_or(defaults.telemetry),
            sensor: get("MQTT_TOPIC_SENSOR").unwrap_or(defaults.sensor),
            config_request: get("MQTT_TOPIC_CONFIG_REQUEST").unwrap_or(defaults.config_request),
            pump_ack: get("MQTT_TOPIC_PUMP_ACK").unwrap_or(defaults.pump_ack),
            pump_command: get("MQTT_TOPIC_PUMP_COMMAND").unwrap_or(defaults.pump_command),
            thresholds: get("MQTT_TOPIC_THRESHOLDS").unwrap_or(defaults.thresholds),
        };

        let config = Self {
            broker_url,
            mqtt_client_id,
            mqtt_username: get("MQTT_USERNAME"),
            mqtt_password: get("MQTT_PASSWORD"),
            topics,
            database_url: get("DATABASE_URL").unwrap_or_else(|| DEFAULT_DATABASE_URL.to_string()),
            api_port: parse_or(&get, "API_PORT", DEFAULT_API_PORT)?,
            webhook_url: get("ALERT_WEBHOOK_URL"),
            debounce_seconds: parse_or(&get, "ALERT_DEBOUNCE_SECONDS", DEFAULT_DEBOUNCE_SECONDS)?,
            temperature_high_celsius: parse_or(
                &get,
                "TEMPERATURE_HIGH_CELSIUS",
                DEFAULT_TEMPERATURE_HIGH_CELSIUS,
            )?,
            default_device_id: get("DEFAULT_DEVICE_ID").unwrap_or_else(|| DEFAULT_DEVICE_ID.to_string()),
            queue_capacity: parse_or(&get, "DEVICE_QUEUE_CAPACITY", DEFAULT_QUEUE_CAPACITY)?,
            worker_idle_seconds: parse_or(&get, "WORKER_IDLE_SECONDS", DEFAULT_WORKER_IDLE_SECONDS)?,
            max_pending_writes: parse_or(&get, "MAX_PENDING_WRITES", DEFAULT_MAX_PENDING_WRITES)?,
            shutdown_drain_seconds: parse_or(
                &get,
                "SHUTDOWN_DRAIN_SECONDS",
                DEFAULT_SHUTDOWN_DRAIN_SECONDS,
            )?,
            reconnect_base_ms: parse_or(&get, "RECONNECT_BASE_MS", DEFAULT_RECONNECT_BASE_MS)?,
            reconnect_max_seconds: parse_or(
                &get,
                "RECONNECT_MAX_SECONDS",
                DEFAULT_RECONNECT_MAX_SECONDS,
            )?,
        };

        config.validate()?;
        Ok(config)
    }

    /// Apply CLI overrides on top of the environment.
    pub fn with_cli(mut self, cli: &Cli) -> Result<Self, String> {
        if let Some(url) = &cli.broker_url {
            self.broker_url = url.clone();
        }
        if let Some(url) = &cli.database_url {
            self.database_url = url.clone();
        }
        if let Some(port) = cli.port {
            self.api_port = port;
        }
        if let Some(url) = &cli.webhook_url {
            self.webhook_url = Some(url.clone());
        }
        if let Some(seconds) = cli.debounce_seconds {
            self.debounce_seconds = seconds;
        }
        self.validate()?;
        Ok(self)
    }

    fn validate(&self) -> Result<(), String> {
        if !self.temperature_high_celsius.is_finite() {
            return Err("TEMPERATURE_HIGH_CELSIUS must be a finite number".to_string());
        }
        if self.queue_capacity == 0 {
            return Err("DEVICE_QUEUE_CAPACITY must be at least 1".to_string());
        }
        if self.worker_idle_seconds == 0 {
            return Err("WORKER_IDLE_SECONDS must be at least 1".to_string());
        }
        if self.max_pending_writes == 0 {
            return Err("MAX_PENDING_WRITES must be at least 1".to_string());
        }
        if self.reconnect_base_ms == 0 {
            return Err("RECONNECT_BASE_MS must be at least 1".to_string());
        }
        if self.reconnect_max_seconds.saturating_mul(1000) < self.reconnect_base_ms {
            return Err("RECONNECT_MAX_SECONDS must not be shorter than RECONNECT_BASE_MS".to_string());
        }
        if let Some(url) = &self.webhook_url {
            if !url.starts_with("http://") && !url.starts_with("https://") {
                return Err(format!("Invalid ALERT_WEBHOOK_URL: {}", url));
            }
        }
        Ok(())
    }

    pub fn mqtt_settings(&self) -> MqttSettings {
        MqttSettings {
            broker_url: self.broker_url.clone(),
            client_id: self.mqtt_client_id.clone(),
            username: self.mqtt_username.clone(),
            password: self.mqtt_password.clone(),
            keep_alive: MQTT_KEEP_ALIVE,
            reconnect_base: Duration::from_millis(self.reconnect_base_ms),
            reconnect_max: Duration::from_secs(self.reconnect_max_seconds),
        }
    }

    pub fn pipeline_settings(&self) -> PipelineSettings {
        PipelineSettings {
            default_device_id: self.default_device_id.clone(),
            temperature_high_c: self.temperature_high_celsius,
            queue_capacity: self.queue_capacity,
            debounce_window: Duration::from_secs(self.debounce_seconds),
            worker_idle_timeout: Duration::from_secs(self.worker_idle_seconds),
            max_pending_writes: self.max_pending_writes,
        }
    }

    pub fn shutdown_drain(&self) -> Duration {
        Duration::from_secs(self.shutdown_drain_seconds)
    }
}

fn parse_or<T, G>(get: &G, key: &str, default: T) -> Result<T, String>
where
    T: FromStr,
    G: Fn(&str) -> Option<String>,
{
    match get(key) {
        Some(raw) => raw
            .parse::<T>()
            .map_err(|_| format!("{} must be a valid number, got '{}'", key, raw)),
        None => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn broker_url_is_required() {
        let err = Config::from_lookup(lookup(&[])).unwrap_err();
        assert!(err.contains("MQTT_BROKER_URL"));
    }

    #[test]
    fn defaults_apply_when_only_broker_is_set() {
        let config = Config::from_lookup(lookup(&[("MQTT_BROKER_URL", "mqtt://localhost")])).unwrap();
        assert_eq!(config.api_port, 5000);
        assert_eq!(config.debounce_seconds, 600);
        assert_eq!(config.temperature_high_celsius, 38.0);
        assert_eq!(config.default_device_id, "1");
        assert_eq!(config.queue_capacity, 32);
        assert_eq!(config.pipeline_settings().worker_idle_timeout, Duration::from_secs(300));
        assert_eq!(config.max_pending_writes, 1024);
        assert_eq!(config.topics, Topics::default());
        assert!(config.webhook_url.is_none());
        assert!(config.mqtt_client_id.starts_with("livestock-telemetry-"));
    }

    #[test]
    fn invalid_number_is_rejected() {
        let err = Config::from_lookup(lookup(&[
            ("MQTT_BROKER_URL", "mqtt://localhost"),
            ("API_PORT", "not-a-port"),
        ]))
        .unwrap_err();
        assert!(err.contains("API_PORT"));
    }

    #[test]
    fn zero_queue_capacity_is_rejected() {
        assert!(Config::from_lookup(lookup(&[
            ("MQTT_BROKER_URL", "mqtt://localhost"),
            ("DEVICE_QUEUE_CAPACITY", "0"),
        ]))
        .is_err());
    }

    #[test]
    fn zero_write_backlog_is_rejected() {
        let err = Config::from_lookup(lookup(&[
            ("MQTT_BROKER_URL", "mqtt://localhost"),
            ("MAX_PENDING_WRITES", "0"),
        ]))
        .unwrap_err();
        assert!(err.contains("MAX_PENDING_WRITES"));
    }

    #[test]
    fn topic_overrides_are_read() {
        let config = Config::from_lookup(lookup(&[
            ("MQTT_BROKER_URL", "mqtt://localhost"),
            ("MQTT_TOPIC_PUMP_COMMAND", "farm/{device_id}/pump"),
        ]))
        .unwrap();
        assert_eq!(config.topics.pump_command, "farm/{device_id}/pump");
        assert_eq!(config.topics.telemetry, "livestock/data");
    }

    #[test]
    fn cli_flags_override_environment() {
        let config = Config::from_lookup(lookup(&[
            ("MQTT_BROKER_URL", "mqtt://from-env"),
            ("API_PORT", "8080"),
        ]))
        .unwrap();

        let cli = Cli {
            broker_url: Some("mqtt://from-cli".to_string()),
            port: Some(9090),
            debounce_seconds: Some(60),
            ..Cli::default()
        };
        let config = config.with_cli(&cli).unwrap();

        assert_eq!(config.broker_url, "mqtt://from-cli");
        assert_eq!(config.api_port, 9090);
        assert_eq!(config.pipeline_settings().debounce_window, Duration::from_secs(60));
    }

    #[test]
    fn bad_webhook_url_is_rejected() {
        assert!(Config::from_lookup(lookup(&[
            ("MQTT_BROKER_URL", "mqtt://localhost"),
            ("ALERT_WEBHOOK_URL", "ftp://nope"),
        ]))
        .is_err());
    }

    #[test]
    fn debug_output_hides_password() {
        let config = Config::from_lookup(lookup(&[
            ("MQTT_BROKER_URL", "mqtt://localhost"),
            ("MQTT_PASSWORD", "hunter2"),
        ]))
        .unwrap();
        assert!(!format!("{:?}", config).contains("hunter2"));
    }
}
