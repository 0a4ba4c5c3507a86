//! CheckpointStore — durable unit-of-work progress tracking.
//!
//! One SQLite file with two tables: per-(exchange, symbol, timeframe, year,
//! month, day) fetch progress, and a per-series aggregate metadata cache.
//! All writes are atomically committed upserts, so the store is crash-safe;
//! it is not safe for multiple concurrent writers targeting the same tuple
//! (an unsupported scenario, not engineered against).
//!
//! Absence of a progress row means the unit is pending. Month-level records
//! use a day sentinel of 0; daily-fallback bookkeeping uses the actual day.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use std::collections::HashSet;
use std::path::Path;
use std::sync::Mutex;
use thiserror::Error;

use crate::domain::Timeframe;

/// Terminal status of a fetched unit. Pending units have no row at all.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnitStatus {
    Completed,
    Failed,
}

impl UnitStatus {
    fn as_str(self) -> &'static str {
        match self {
            UnitStatus::Completed => "completed",
            UnitStatus::Failed => "failed",
        }
    }
}

/// Cached aggregate summary for one (exchange, symbol, timeframe) series.
#[derive(Debug, Clone, PartialEq)]
pub struct SeriesMeta {
    pub earliest: DateTime<Utc>,
    pub latest: DateTime<Utc>,
    pub rows_total: u64,
}

/// Filter for [`CheckpointStore::reset`]. Unset fields match everything.
#[derive(Debug, Clone, Default)]
pub struct ResetFilter {
    pub exchange: Option<String>,
    pub symbol: Option<String>,
    pub timeframe: Option<Timeframe>,
    pub year: Option<i32>,
    pub month: Option<u32>,
}

#[derive(Debug, Error)]
pub enum CheckpointError {
    #[error("checkpoint db error: {0}")]
    Sqlite(#[from] rusqlite::Error),
}

/// SQLite-backed progress tracker. One instance per fetch session.
pub struct CheckpointStore {
    conn: Mutex<Connection>,
}

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS fetch_progress (
    exchange      TEXT    NOT NULL,
    symbol        TEXT    NOT NULL,
    timeframe     TEXT    NOT NULL,
    year          INTEGER NOT NULL,
    month         INTEGER NOT NULL,
    day           INTEGER NOT NULL DEFAULT 0,
    status        TEXT    NOT NULL,
    rows_count    INTEGER NOT NULL DEFAULT 0,
    checksum      TEXT,
    error_message TEXT,
    created_at    INTEGER NOT NULL,
    updated_at    INTEGER NOT NULL,
    PRIMARY KEY (exchange, symbol, timeframe, year, month, day)
);

CREATE TABLE IF NOT EXISTS series_meta (
    exchange    TEXT    NOT NULL,
    symbol      TEXT    NOT NULL,
    timeframe   TEXT    NOT NULL,
    earliest_ts INTEGER NOT NULL,
    latest_ts   INTEGER NOT NULL,
    rows_total  INTEGER NOT NULL,
    updated_at  INTEGER NOT NULL,
    PRIMARY KEY (exchange, symbol, timeframe)
);
";

impl CheckpointStore {
    /// Open (creating if needed) the checkpoint database at `path`.
    pub fn open(path: &Path) -> Result<Self, CheckpointError> {
        if let Some(parent) = path.parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        let conn = Connection::open(path)?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// In-memory store for tests.
    pub fn open_in_memory() -> Result<Self, CheckpointError> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Record a unit as completed, with its row count and optional archive checksum.
    #[allow(clippy::too_many_arguments)]
    pub fn mark_completed(
        &self,
        exchange: &str,
        symbol: &str,
        timeframe: Timeframe,
        year: i32,
        month: u32,
        day: Option<u32>,
        rows_count: u64,
        checksum: Option<&str>,
    ) -> Result<(), CheckpointError> {
        self.upsert(
            exchange,
            symbol,
            timeframe,
            year,
            month,
            day,
            UnitStatus::Completed,
            rows_count,
            checksum,
            None,
        )
    }

    /// Record a unit as failed with the last error text.
    #[allow(clippy::too_many_arguments)]
    pub fn mark_failed(
        &self,
        exchange: &str,
        symbol: &str,
        timeframe: Timeframe,
        year: i32,
        month: u32,
        day: Option<u32>,
        error_message: &str,
    ) -> Result<(), CheckpointError> {
        self.upsert(
            exchange,
            symbol,
            timeframe,
            year,
            month,
            day,
            UnitStatus::Failed,
            0,
            None,
            Some(error_message),
        )
    }

    /// Return a unit to pending by deleting its record (absence = pending).
    pub fn mark_pending(
        &self,
        exchange: &str,
        symbol: &str,
        timeframe: Timeframe,
        year: i32,
        month: u32,
        day: Option<u32>,
    ) -> Result<(), CheckpointError> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "DELETE FROM fetch_progress
             WHERE exchange = ?1 AND symbol = ?2 AND timeframe = ?3
               AND year = ?4 AND month = ?5 AND day = ?6",
            params![
                exchange,
                symbol,
                timeframe.to_string(),
                year,
                month,
                day.unwrap_or(0)
            ],
        )?;
        Ok(())
    }

    pub fn is_completed(
        &self,
        exchange: &str,
        symbol: &str,
        timeframe: Timeframe,
        year: i32,
        month: u32,
        day: Option<u32>,
    ) -> Result<bool, CheckpointError> {
        let conn = self.conn.lock().unwrap();
        let status: Option<String> = conn
            .query_row(
                "SELECT status FROM fetch_progress
                 WHERE exchange = ?1 AND symbol = ?2 AND timeframe = ?3
                   AND year = ?4 AND month = ?5 AND day = ?6",
                params![
                    exchange,
                    symbol,
                    timeframe.to_string(),
                    year,
                    month,
                    day.unwrap_or(0)
                ],
                |row| row.get(0),
            )
            .optional()?;
        Ok(status.as_deref() == Some("completed"))
    }

    /// Months in `[from, to]` (inclusive, `(year, month)` pairs) that have no
    /// completed month-level record, in calendar order.
    pub fn pending_periods(
        &self,
        exchange: &str,
        symbol: &str,
        timeframe: Timeframe,
        from: (i32, u32),
        to: (i32, u32),
    ) -> Result<Vec<(i32, u32)>, CheckpointError> {
        let completed: HashSet<(i32, u32)> = {
            let conn = self.conn.lock().unwrap();
            let mut stmt = conn.prepare(
                "SELECT year, month FROM fetch_progress
                 WHERE exchange = ?1 AND symbol = ?2 AND timeframe = ?3
                   AND day = 0 AND status = 'completed'",
            )?;
            let rows = stmt.query_map(params![exchange, symbol, timeframe.to_string()], |row| {
                Ok((row.get::<_, i32>(0)?, row.get::<_, u32>(1)?))
            })?;
            rows.collect::<Result<_, _>>()?
        };

        Ok(month_range(from, to)
            .into_iter()
            .filter(|period| !completed.contains(period))
            .collect())
    }

    /// Incrementally merge aggregate metadata for a series:
    /// min(earliest), max(latest), sum(rows).
    pub fn update_metadata(
        &self,
        exchange: &str,
        symbol: &str,
        timeframe: Timeframe,
        earliest: DateTime<Utc>,
        latest: DateTime<Utc>,
        rows_delta: u64,
    ) -> Result<(), CheckpointError> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO series_meta
                 (exchange, symbol, timeframe, earliest_ts, latest_ts, rows_total, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
             ON CONFLICT (exchange, symbol, timeframe) DO UPDATE SET
                 earliest_ts = MIN(earliest_ts, excluded.earliest_ts),
                 latest_ts   = MAX(latest_ts, excluded.latest_ts),
                 rows_total  = rows_total + excluded.rows_total,
                 updated_at  = excluded.updated_at",
            params![
                exchange,
                symbol,
                timeframe.to_string(),
                earliest.timestamp_millis(),
                latest.timestamp_millis(),
                rows_delta as i64,
                Utc::now().timestamp_millis()
            ],
        )?;
        Ok(())
    }

    pub fn get_metadata(
        &self,
        exchange: &str,
        symbol: &str,
        timeframe: Timeframe,
    ) -> Result<Option<SeriesMeta>, CheckpointError> {
        let conn = self.conn.lock().unwrap();
        let meta = conn
            .query_row(
                "SELECT earliest_ts, latest_ts, rows_total FROM series_meta
                 WHERE exchange = ?1 AND symbol = ?2 AND timeframe = ?3",
                params![exchange, symbol, timeframe.to_string()],
                |row| {
                    Ok((
                        row.get::<_, i64>(0)?,
                        row.get::<_, i64>(1)?,
                        row.get::<_, i64>(2)?,
                    ))
                },
            )
            .optional()?;

        Ok(meta.and_then(|(earliest, latest, rows)| {
            Some(SeriesMeta {
                earliest: DateTime::from_timestamp_millis(earliest)?,
                latest: DateTime::from_timestamp_millis(latest)?,
                rows_total: rows.max(0) as u64,
            })
        }))
    }

    /// Delete progress rows matching the filter, forcing re-download on the
    /// next run. Returns the number of rows removed.
    pub fn reset(&self, filter: &ResetFilter) -> Result<usize, CheckpointError> {
        let mut clauses: Vec<String> = Vec::new();
        let mut values: Vec<Box<dyn rusqlite::types::ToSql>> = Vec::new();

        if let Some(exchange) = &filter.exchange {
            values.push(Box::new(exchange.clone()));
            clauses.push(format!("exchange = ?{}", values.len()));
        }
        if let Some(symbol) = &filter.symbol {
            values.push(Box::new(symbol.clone()));
            clauses.push(format!("symbol = ?{}", values.len()));
        }
        if let Some(timeframe) = filter.timeframe {
            values.push(Box::new(timeframe.to_string()));
            clauses.push(format!("timeframe = ?{}", values.len()));
        }
        if let Some(year) = filter.year {
            values.push(Box::new(year));
            clauses.push(format!("year = ?{}", values.len()));
        }
        if let Some(month) = filter.month {
            values.push(Box::new(month));
            clauses.push(format!("month = ?{}", values.len()));
        }

        let sql = if clauses.is_empty() {
            "DELETE FROM fetch_progress".to_string()
        } else {
            format!("DELETE FROM fetch_progress WHERE {}", clauses.join(" AND "))
        };

        let conn = self.conn.lock().unwrap();
        let params: Vec<&dyn rusqlite::types::ToSql> = values.iter().map(|v| v.as_ref()).collect();
        Ok(conn.execute(&sql, params.as_slice())?)
    }

    #[allow(clippy::too_many_arguments)]
    fn upsert(
        &self,
        exchange: &str,
        symbol: &str,
        timeframe: Timeframe,
        year: i32,
        month: u32,
        day: Option<u32>,
        status: UnitStatus,
        rows_count: u64,
        checksum: Option<&str>,
        error_message: Option<&str>,
    ) -> Result<(), CheckpointError> {
        let now = Utc::now().timestamp_millis();
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO fetch_progress
                 (exchange, symbol, timeframe, year, month, day,
                  status, rows_count, checksum, error_message, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?11)
             ON CONFLICT (exchange, symbol, timeframe, year, month, day) DO UPDATE SET
                 status        = excluded.status,
                 rows_count    = excluded.rows_count,
                 checksum      = excluded.checksum,
                 error_message = excluded.error_message,
                 updated_at    = excluded.updated_at",
            params![
                exchange,
                symbol,
                timeframe.to_string(),
                year,
                month,
                day.unwrap_or(0),
                status.as_str(),
                rows_count as i64,
                checksum,
                error_message,
                now
            ],
        )?;
        Ok(())
    }
}

/// Inclusive calendar-month range from `(year, month)` to `(year, month)`.
pub fn month_range(from: (i32, u32), to: (i32, u32)) -> Vec<(i32, u32)> {
    let (mut year, mut month) = from;
    let mut months = Vec::new();
    while (year, month) <= to {
        months.push((year, month));
        month += 1;
        if month > 12 {
            month = 1;
            year += 1;
        }
    }
    months
}
