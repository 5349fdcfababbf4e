//! SQLite connection pool and schema bootstrap.
//!
//! `create_pool("sqlite::memory:")` gives every test its own throwaway
//! database; in-memory pools are pinned to a single connection that is never
//! recycled, otherwise each new connection would see an empty schema.

use std::str::FromStr;

use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::SqlitePool;

const SCHEMA: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS readings (
        id          INTEGER PRIMARY KEY AUTOINCREMENT,
        device_id   TEXT    NOT NULL,
        kind        TEXT    NOT NULL,
        value       REAL    NOT NULL,
        status      TEXT,
        recorded_at TEXT    NOT NULL
    )",
    "CREATE INDEX IF NOT EXISTS idx_readings_device_kind ON readings (device_id, kind, id)",
    "CREATE TABLE IF NOT EXISTS thresholds (
        device_id   TEXT PRIMARY KEY,
        upper_bound REAL NOT NULL,
        lower_bound REAL NOT NULL,
        updated_at  TEXT NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS pump_states (
        device_id  TEXT PRIMARY KEY,
        status     TEXT NOT NULL,
        mode       TEXT NOT NULL,
        updated_at TEXT NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS pump_history (
        id          INTEGER PRIMARY KEY AUTOINCREMENT,
        device_id   TEXT NOT NULL,
        status      TEXT NOT NULL,
        mode        TEXT NOT NULL,
        source      TEXT NOT NULL,
        recorded_at TEXT NOT NULL
    )",
    "CREATE INDEX IF NOT EXISTS idx_pump_history_device ON pump_history (device_id, id)",
    "CREATE TABLE IF NOT EXISTS alert_events (
        id         INTEGER PRIMARY KEY AUTOINCREMENT,
        alert_key  TEXT    NOT NULL,
        title      TEXT    NOT NULL,
        message    TEXT    NOT NULL,
        alert_type TEXT    NOT NULL,
        delivered  INTEGER NOT NULL DEFAULT 0,
        created_at TEXT    NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS water_usage (
        device_id  TEXT NOT NULL,
        usage_date TEXT NOT NULL,
        usage_ml   REAL NOT NULL,
        PRIMARY KEY (device_id, usage_date)
    )",
];

/// Open a pool for `database_url` and make sure all tables exist.
pub async fn create_pool(database_url: &str) -> Result<SqlitePool, sqlx::Error> {
    let options = SqliteConnectOptions::from_str(database_url)?.create_if_missing(true);

    let pool = if database_url.contains(":memory:") {
        SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?
    } else {
        SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?
    };

    for statement in SCHEMA {
        sqlx::query(statement).execute(&pool).await?;
    }

    Ok(pool)
}
