use thiserror::Error;

use crate::transport::TransportError;

/// Unified startup / process-level error.
///
/// Pipeline operations have their own taxonomy in
/// [`PipelineError`](crate::pipeline::PipelineError); this one covers what
/// can stop the service from starting or running.
#[derive(Error, Debug)]
pub enum AppError {
    #[error("Config error: {0}")]
    Config(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Metrics error: {0}")]
    Metrics(#[from] prometheus::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
