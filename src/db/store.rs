//! SQLite database store implementation.

use chrono::{DateTime, NaiveDateTime, Utc};
use regex::Regex;
use rusqlite::{params, Connection, OptionalExtension, Result as SqlResult};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard, OnceLock};
use thiserror::Error;

use super::models::*;
use crate::metrics::{
    metric_name, CyclePoint, MetricKind, MetricPoint, CANARY_DIMENSION, METRIC_NAMESPACE,
    URL_DIMENSION,
};

const DB_TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.9f";

/// Database error types.
#[derive(Error, Debug)]
pub enum DbError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("Migration error: {0}")]
    Migration(String),
    #[error("invalid table name: {0:?}")]
    InvalidTable(String),
    #[error("database lock poisoned")]
    Poisoned,
}

/// Thread-safe database store.
#[derive(Clone)]
pub struct Store {
    conn: Arc<Mutex<Connection>>,
}

impl Store {
    /// Create a new store with the given database path.
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self, DbError> {
        let conn = Connection::open(path)?;
        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        store.init()?;
        Ok(store)
    }

    /// Initialize the database with migrations.
    fn init(&self) -> Result<(), DbError> {
        let conn = self.conn()?;
        conn.execute_batch(include_str!("../../migrations/000001_init.up.sql"))
            .map_err(|e| DbError::Migration(format!("Migration 1 failed: {}", e)))?;
        Ok(())
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>, DbError> {
        self.conn.lock().map_err(|_| DbError::Poisoned)
    }

    // --- Metric history ---

    /// Persist closed windows, one row per metric. Re-writing a window replaces it.
    pub fn add_metric_points(&self, points: &[MetricPoint]) -> Result<(), DbError> {
        if points.is_empty() {
            return Ok(());
        }

        let conn = self.conn()?;
        let tx = conn.unchecked_transaction()?;

        {
            let mut stmt = tx.prepare(
                "INSERT INTO metric_points (metric_name, namespace, url_name, dimension_name, window_start, window_end, value, sample_count)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
                 ON CONFLICT(metric_name, window_start) DO UPDATE SET
                 window_end=excluded.window_end, value=excluded.value, sample_count=excluded.sample_count"
            )?;

            for p in points {
                for kind in [MetricKind::Availability, MetricKind::Latency] {
                    let Some(value) = p.value(kind) else {
                        continue;
                    };
                    stmt.execute(params![
                        metric_name(&p.url_name, kind),
                        METRIC_NAMESPACE,
                        p.url_name,
                        URL_DIMENSION,
                        format_db_time(p.window_start),
                        format_db_time(p.window_end),
                        value,
                        p.sample_count,
                    ])?;
                }
            }
        }

        tx.commit()?;
        Ok(())
    }

    /// Persist closed cycle-duration windows as `TimeToProcess` rows under the canary name.
    pub fn add_cycle_points(&self, canary_name: &str, points: &[CyclePoint]) -> Result<(), DbError> {
        if points.is_empty() {
            return Ok(());
        }

        let conn = self.conn()?;
        let tx = conn.unchecked_transaction()?;

        {
            let mut stmt = tx.prepare(
                "INSERT INTO metric_points (metric_name, namespace, url_name, dimension_name, window_start, window_end, value, sample_count)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
                 ON CONFLICT(metric_name, window_start) DO UPDATE SET
                 window_end=excluded.window_end, value=excluded.value, sample_count=excluded.sample_count"
            )?;

            for p in points {
                stmt.execute(params![
                    MetricKind::TimeToProcess.as_str(),
                    METRIC_NAMESPACE,
                    canary_name,
                    CANARY_DIMENSION,
                    format_db_time(p.window_start),
                    format_db_time(p.window_end),
                    p.avg_duration_ms,
                    p.cycle_count,
                ])?;
            }
        }

        tx.commit()?;
        Ok(())
    }

    /// Get metric rows for a URL within `[start, end)`, oldest first.
    pub fn get_metric_rows(
        &self,
        url_name: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<MetricRow>, DbError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT namespace, metric_name, url_name, window_start, window_end, value, sample_count, dimension_name
             FROM metric_points
             WHERE url_name = ?1 AND window_start >= ?2 AND window_start < ?3
             ORDER BY window_start ASC, metric_name ASC"
        )?;

        let rows = stmt
            .query_map(
                params![url_name, format_db_time(start), format_db_time(end)],
                |row| {
                    let start_str: String = row.get(3)?;
                    let end_str: String = row.get(4)?;
                    let url_name: String = row.get(2)?;
                    let dimension: String = row.get(7)?;
                    Ok(MetricRow {
                        namespace: row.get(0)?,
                        metric_name: row.get(1)?,
                        dimensions: BTreeMap::from([(dimension, url_name.clone())]),
                        url_name,
                        window_start: parse_db_time(&start_str).unwrap_or_else(Utc::now),
                        window_end: parse_db_time(&end_str).unwrap_or_else(Utc::now),
                        value: row.get(5)?,
                        sample_count: row.get(6)?,
                    })
                },
            )?
            .collect::<SqlResult<Vec<_>>>()?;

        Ok(rows)
    }

    /// Delete metric rows whose window started before the cutoff.
    pub fn delete_metric_rows_before(&self, cutoff: DateTime<Utc>) -> Result<usize, DbError> {
        let conn = self.conn()?;
        let deleted = conn.execute(
            "DELETE FROM metric_points WHERE window_start < ?1",
            params![format_db_time(cutoff)],
        )?;
        Ok(deleted)
    }

    // --- Alarm records ---

    /// Create the alarm record table if it does not exist yet.
    pub fn ensure_alarm_table(&self, table: &str) -> Result<(), DbError> {
        let table = checked_table(table)?;
        let conn = self.conn()?;
        conn.execute_batch(&format!(
            "CREATE TABLE IF NOT EXISTS \"{}\" (
                alarm_name TEXT PRIMARY KEY,
                state_change TEXT,
                reason TEXT,
                timestamp TEXT
            )",
            table
        ))?;
        Ok(())
    }

    /// Insert or replace the record for `record.alarm_name`.
    pub fn upsert_alarm_record(&self, table: &str, record: &AlarmRecord) -> Result<(), DbError> {
        let table = checked_table(table)?;
        let conn = self.conn()?;
        conn.execute(
            &format!(
                "INSERT INTO \"{}\" (alarm_name, state_change, reason, timestamp)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(alarm_name) DO UPDATE SET
                 state_change=excluded.state_change, reason=excluded.reason, timestamp=excluded.timestamp",
                table
            ),
            params![
                record.alarm_name,
                record.state_change,
                record.reason,
                record.timestamp,
            ],
        )?;
        Ok(())
    }

    /// Get the record for one alarm name.
    pub fn get_alarm_record(&self, table: &str, alarm_name: &str) -> Result<Option<AlarmRecord>, DbError> {
        let table = checked_table(table)?;
        let conn = self.conn()?;
        let record = conn
            .query_row(
                &format!(
                    "SELECT alarm_name, state_change, reason, timestamp FROM \"{}\" WHERE alarm_name = ?1",
                    table
                ),
                params![alarm_name],
                row_to_record,
            )
            .optional()?;
        Ok(record)
    }

    /// Get every alarm record, ordered by name.
    pub fn list_alarm_records(&self, table: &str) -> Result<Vec<AlarmRecord>, DbError> {
        let table = checked_table(table)?;
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT alarm_name, state_change, reason, timestamp FROM \"{}\" ORDER BY alarm_name ASC",
            table
        ))?;

        let records = stmt
            .query_map([], row_to_record)?
            .collect::<SqlResult<Vec<_>>>()?;
        Ok(records)
    }

    /// Get database size in bytes.
    pub fn get_db_size_bytes(&self) -> Result<i64, DbError> {
        let conn = self.conn()?;
        let page_count: i64 = conn.query_row("PRAGMA page_count", [], |r| r.get(0))?;
        let page_size: i64 = conn.query_row("PRAGMA page_size", [], |r| r.get(0))?;
        Ok(page_count * page_size)
    }
}

fn row_to_record(row: &rusqlite::Row<'_>) -> SqlResult<AlarmRecord> {
    Ok(AlarmRecord {
        alarm_name: row.get(0)?,
        state_change: row.get(1)?,
        reason: row.get(2)?,
        timestamp: row.get(3)?,
    })
}

/// Table names are interpolated into SQL, so only plain identifiers pass.
pub fn checked_table(table: &str) -> Result<&str, DbError> {
    static RE: OnceLock<Regex> = OnceLock::new();
    let re = RE.get_or_init(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_]{0,127}$").unwrap());
    if re.is_match(table) && !table.to_ascii_lowercase().starts_with("sqlite_") {
        Ok(table)
    } else {
        Err(DbError::InvalidTable(table.to_string()))
    }
}

fn format_db_time(dt: DateTime<Utc>) -> String {
    dt.format(DB_TIME_FORMAT).to_string()
}

/// Parse a datetime string from the database.
fn parse_db_time(s: &str) -> Option<DateTime<Utc>> {
    let formats = [DB_TIME_FORMAT, "%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%d %H:%M:%S"];

    for fmt in &formats {
        if let Ok(dt) = NaiveDateTime::parse_from_str(s, fmt) {
            return Some(DateTime::from_naive_utc_and_offset(dt, Utc));
        }
    }

    DateTime::parse_from_rfc3339(s)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}
