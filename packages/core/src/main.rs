use std::sync::Arc;

use clap::Parser;
use dotenvy::dotenv;
use tokio::net::TcpListener;

use livestock_telemetry::api::{self, ApiState};
use livestock_telemetry::cli::Cli;
use livestock_telemetry::config::Config;
use livestock_telemetry::db::create_pool;
use livestock_telemetry::error::AppError;
use livestock_telemetry::logging::init_logging;
use livestock_telemetry::metrics::AppMetrics;
use livestock_telemetry::service::TelemetryService;

#[tokio::main]
async fn main() {
    dotenv().ok();
    init_logging();

    let cli = Cli::parse();

    let config = Config::load(&cli)
        .map_err(AppError::Config)
        .unwrap_or_else(|err| {
            tracing::error!("{}", err);
            std::process::exit(1);
        });

    if let Err(err) = run(config).await {
        tracing::error!("{}", err);
        std::process::exit(1);
    }
}

async fn run(config: Config) -> Result<(), AppError> {
    tracing::info!("Service starting with config: {:?}", config);

    let pool = create_pool(&config.database_url).await?;
    let metrics = Arc::new(AppMetrics::new()?);

    let service = TelemetryService::start(&config, pool, Arc::clone(&metrics)).await?;

    let app = api::router(ApiState {
        pipeline: service.pipeline(),
        metrics,
    });

    let listener = TcpListener::bind(("0.0.0.0", config.api_port)).await?;
    tracing::info!("HTTP API listening on {}", listener.local_addr()?);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("Shutdown signal received");
    if !service.shutdown().await {
        tracing::warn!("Some in-flight work was abandoned at shutdown");
    }

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to listen for Ctrl+C: {}", e);
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
