//! Database repository for telemetry, pump and alert persistence.
//!
//! All SQLite read/write logic lives here. Readings, pump history and alert
//! events are append-only; thresholds, current pump state and daily water
//! usage are keyed rows updated in place.
//!
//! Pump transitions go through [`TelemetryRepository::record_pump_transition`],
//! which updates the current state and appends the history row in a single
//! transaction so the two never disagree.

use chrono::{DateTime, NaiveDate, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};

use crate::pipeline::types::{
    format_timestamp, parse_timestamp, AlertEvent, DailyUsage, PumpHistoryEntry, PumpState, Reading,
    ReadingKind, ThresholdConfig, TransitionSource,
};

/// Repository for reading and writing pipeline data to SQLite.
pub struct TelemetryRepository {
    pool: SqlitePool,
}

impl TelemetryRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    // ---- Readings ----

    /// Append a reading. Duplicates are stored as separate rows.
    pub async fn insert_reading(&self, reading: &Reading) -> Result<i64, sqlx::Error> {
        let result = sqlx::query(
            "INSERT INTO readings (device_id, kind, value, status, recorded_at)
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(&reading.device_id)
        .bind(reading.kind.as_str())
        .bind(reading.value)
        .bind(&reading.status)
        .bind(format_timestamp(reading.recorded_at))
        .execute(&self.pool)
        .await?;

        Ok(result.last_insert_rowid())
    }

    /// Most recently stored reading of `kind` for a device.
    pub async fn latest_reading(
        &self,
        device_id: &str,
        kind: ReadingKind,
    ) -> Result<Option<Reading>, sqlx::Error> {
        let row = sqlx::query(
            "SELECT device_id, kind, value, status, recorded_at
             FROM readings
             WHERE device_id = ? AND kind = ?
             ORDER BY id DESC
             LIMIT 1",
        )
        .bind(device_id)
        .bind(kind.as_str())
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.and_then(|row| reading_from_row(&row)))
    }

    /// Number of stored readings of `kind` for a device.
    pub async fn count_readings(&self, device_id: &str, kind: ReadingKind) -> Result<i64, sqlx::Error> {
        let row = sqlx::query("SELECT COUNT(*) AS cnt FROM readings WHERE device_id = ? AND kind = ?")
            .bind(device_id)
            .bind(kind.as_str())
            .fetch_one(&self.pool)
            .await?;

        Ok(row.try_get("cnt").unwrap_or(0))
    }

    // ---- Thresholds ----

    pub async fn get_threshold(&self, device_id: &str) -> Result<Option<ThresholdConfig>, sqlx::Error> {
        let row = sqlx::query(
            "SELECT device_id, upper_bound, lower_bound, updated_at
             FROM thresholds WHERE device_id = ?",
        )
        .bind(device_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.and_then(|row| {
            let updated_at: String = row.try_get("updated_at").ok()?;
            Some(ThresholdConfig {
                device_id: row.try_get("device_id").ok()?,
                upper_bound: row.try_get("upper_bound").ok()?,
                lower_bound: row.try_get("lower_bound").ok()?,
                updated_at: parse_timestamp(&updated_at)?,
            })
        }))
    }

    /// Insert or overwrite the bounds for a device.
    pub async fn upsert_threshold(&self, config: &ThresholdConfig) -> Result<(), sqlx::Error> {
        sqlx::query(
            "INSERT INTO thresholds (device_id, upper_bound, lower_bound, updated_at)
             VALUES (?, ?, ?, ?)
             ON CONFLICT(device_id) DO UPDATE SET
                upper_bound = excluded.upper_bound,
                lower_bound = excluded.lower_bound,
                updated_at  = excluded.updated_at",
        )
        .bind(&config.device_id)
        .bind(config.upper_bound)
        .bind(config.lower_bound)
        .bind(format_timestamp(config.updated_at))
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    // ---- Pump state ----

    pub async fn latest_pump_state(&self, device_id: &str) -> Result<Option<PumpState>, sqlx::Error> {
        let row = sqlx::query(
            "SELECT device_id, status, mode, updated_at FROM pump_states WHERE device_id = ?",
        )
        .bind(device_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.and_then(|row| {
            let status: String = row.try_get("status").ok()?;
            let mode: String = row.try_get("mode").ok()?;
            let updated_at: String = row.try_get("updated_at").ok()?;
            Some(PumpState {
                device_id: row.try_get("device_id").ok()?,
                status: status.parse().ok()?,
                mode: mode.parse().ok()?,
                updated_at: parse_timestamp(&updated_at)?,
            })
        }))
    }

    /// Make `state` the current state and append it to the history log.
    pub async fn record_pump_transition(
        &self,
        state: &PumpState,
        source: TransitionSource,
    ) -> Result<(), sqlx::Error> {
        let updated_at = format_timestamp(state.updated_at);
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            "INSERT INTO pump_states (device_id, status, mode, updated_at)
             VALUES (?, ?, ?, ?)
             ON CONFLICT(device_id) DO UPDATE SET
                status     = excluded.status,
                mode       = excluded.mode,
                updated_at = excluded.updated_at",
        )
        .bind(&state.device_id)
        .bind(state.status.as_str())
        .bind(state.mode.as_str())
        .bind(&updated_at)
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            "INSERT INTO pump_history (device_id, status, mode, source, recorded_at)
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(&state.device_id)
        .bind(state.status.as_str())
        .bind(state.mode.as_str())
        .bind(source.as_str())
        .bind(&updated_at)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    /// Newest-first pump history for a device. `limit` is clamped to 1..=500.
    pub async fn pump_history(
        &self,
        device_id: &str,
        limit: i64,
    ) -> Result<Vec<PumpHistoryEntry>, sqlx::Error> {
        let limit = limit.clamp(1, 500);

        let rows = sqlx::query(
            "SELECT id, device_id, status, mode, source, recorded_at
             FROM pump_history
             WHERE device_id = ?
             ORDER BY id DESC
             LIMIT ?",
        )
        .bind(device_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        let entries = rows
            .into_iter()
            .filter_map(|row| {
                let status: String = row.try_get("status").ok()?;
                let mode: String = row.try_get("mode").ok()?;
                let source: String = row.try_get("source").ok()?;
                let recorded_at: String = row.try_get("recorded_at").ok()?;

                Some(PumpHistoryEntry {
                    id: row.try_get("id").ok()?,
                    device_id: row.try_get("device_id").ok()?,
                    status: status.parse().ok()?,
                    mode: mode.parse().ok()?,
                    source: source.parse().ok()?,
                    recorded_at: parse_timestamp(&recorded_at)?,
                })
            })
            .collect();

        Ok(entries)
    }

    // ---- Alert event logging ----

    /// Log an emitted alert (delivered or not). Returns the new row id.
    pub async fn log_alert_event(&self, event: &AlertEvent) -> Result<i64, sqlx::Error> {
        let delivered_int: i64 = if event.delivered { 1 } else { 0 };

        let result = sqlx::query(
            "INSERT INTO alert_events (alert_key, title, message, alert_type, delivered, created_at)
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(&event.alert_key)
        .bind(&event.title)
        .bind(&event.message)
        .bind(event.alert_type.as_str())
        .bind(delivered_int)
        .bind(format_timestamp(event.created_at))
        .execute(&self.pool)
        .await?;

        Ok(result.last_insert_rowid())
    }

    /// Newest-first alert history. `limit` is clamped to 100.
    pub async fn query_alert_history(&self, limit: i64) -> Result<Vec<AlertEvent>, sqlx::Error> {
        let limit = limit.clamp(1, 100);

        let rows = sqlx::query(
            "SELECT id, alert_key, title, message, alert_type, delivered, created_at
             FROM alert_events
             ORDER BY id DESC
             LIMIT ?",
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        let events = rows
            .into_iter()
            .filter_map(|row| {
                let alert_type: String = row.try_get("alert_type").ok()?;
                let delivered: i64 = row.try_get("delivered").ok()?;
                let created_at: String = row.try_get("created_at").ok()?;

                Some(AlertEvent {
                    id: Some(row.try_get("id").ok()?),
                    alert_key: row.try_get("alert_key").ok()?,
                    title: row.try_get("title").ok()?,
                    message: row.try_get("message").ok()?,
                    alert_type: alert_type.parse().ok()?,
                    delivered: delivered != 0,
                    created_at: parse_timestamp(&created_at)?,
                })
            })
            .collect();

        Ok(events)
    }

    pub async fn count_alert_events(&self) -> Result<i64, sqlx::Error> {
        let row = sqlx::query("SELECT COUNT(*) AS cnt FROM alert_events")
            .fetch_one(&self.pool)
            .await?;

        Ok(row.try_get("cnt").unwrap_or(0))
    }

    // ---- Water usage ----

    /// Add `usage_ml` to the device's running total for `date`.
    /// Returns the new daily total.
    pub async fn add_water_usage(
        &self,
        device_id: &str,
        date: NaiveDate,
        usage_ml: f64,
    ) -> Result<f64, sqlx::Error> {
        let day = date.format("%Y-%m-%d").to_string();

        sqlx::query(
            "INSERT INTO water_usage (device_id, usage_date, usage_ml)
             VALUES (?, ?, ?)
             ON CONFLICT(device_id, usage_date) DO UPDATE SET
                usage_ml = water_usage.usage_ml + excluded.usage_ml",
        )
        .bind(device_id)
        .bind(&day)
        .bind(usage_ml)
        .execute(&self.pool)
        .await?;

        self.water_usage_on(device_id, date).await
    }

    /// Total millilitres recorded for a device on `date` (0 when none).
    pub async fn water_usage_on(&self, device_id: &str, date: NaiveDate) -> Result<f64, sqlx::Error> {
        let row = sqlx::query(
            "SELECT usage_ml FROM water_usage WHERE device_id = ? AND usage_date = ?",
        )
        .bind(device_id)
        .bind(date.format("%Y-%m-%d").to_string())
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.and_then(|r| r.try_get::<f64, _>("usage_ml").ok()).unwrap_or(0.0))
    }

    /// Per-day totals for the last `days` UTC days including today, newest
    /// first. Days without recorded usage are absent.
    pub async fn water_usage_history(
        &self,
        device_id: &str,
        days: u32,
    ) -> Result<Vec<DailyUsage>, sqlx::Error> {
        let today = Utc::now().date_naive();
        let since = today - chrono::Duration::days(i64::from(days.max(1)) - 1);

        let rows = sqlx::query(
            "SELECT usage_date, usage_ml FROM water_usage
             WHERE device_id = ? AND usage_date >= ? AND usage_date <= ?
             ORDER BY usage_date DESC",
        )
        .bind(device_id)
        .bind(since.format("%Y-%m-%d").to_string())
        .bind(today.format("%Y-%m-%d").to_string())
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.iter().filter_map(usage_from_row).collect())
    }
}

fn usage_from_row(row: &SqliteRow) -> Option<DailyUsage> {
    let date: String = row.try_get("usage_date").ok()?;
    Some(DailyUsage {
        date: NaiveDate::parse_from_str(&date, "%Y-%m-%d").ok()?,
        usage_ml: row.try_get("usage_ml").ok()?,
    })
}

fn reading_from_row(row: &SqliteRow) -> Option<Reading> {
    let kind: String = row.try_get("kind").ok()?;
    let recorded_at: String = row.try_get("recorded_at").ok()?;
    let recorded_at: DateTime<Utc> = parse_timestamp(&recorded_at)?;

    Some(Reading {
        device_id: row.try_get("device_id").ok()?,
        kind: kind.parse().ok()?,
        value: row.try_get("value").ok()?,
        status: row.try_get("status").ok()?,
        recorded_at,
    })
}
