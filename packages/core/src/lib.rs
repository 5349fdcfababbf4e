// Library root, exposes internal modules for integration tests in `tests/`.
// Production entry point remains `src/main.rs`.

pub mod alerts;
pub mod api;
pub mod db;
pub mod error;
pub mod metrics;
pub mod pipeline;
pub mod repository;
pub mod service;
pub mod transport;

// Only the binary needs these; they are public so `main.rs` can reach them
// through the library.
pub mod cli;
pub mod config;
pub mod logging;
