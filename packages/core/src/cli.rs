use clap::Parser;

/// Livestock telemetry CLI arguments. Flags override environment variables.
#[derive(Debug, Default, Parser)]
#[command(
    name = "livestock-telemetry",
    version,
    about = "Livestock water and climate telemetry with automatic pump control"
)]
pub struct Cli {
    /// MQTT broker URL (mqtt://, tcp:// or mqtts://)
    #[arg(long)]
    pub broker_url: Option<String>,

    /// SQLite database URL
    #[arg(long)]
    pub database_url: Option<String>,

    /// HTTP API port
    #[arg(long)]
    pub port: Option<u16>,

    /// Alert webhook URL
    #[arg(long)]
    pub webhook_url: Option<String>,

    /// Minimum seconds between two identical alerts
    #[arg(long)]
    pub debounce_seconds: Option<u64>,
}
