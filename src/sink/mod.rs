//! Delivery of accepted readings to the relational store.
//!
//! The engine's contract with the sink is deliberately thin: one
//! execute-insert per reading, parameters in a fixed order, failures logged
//! by the caller and never allowed to abort a polling or reconciliation
//! cycle. [`ReadingSink`] is the seam; [`SqlSink`] is the production
//! implementation, running the configured `query_insert` statement against a
//! SQLite database. Tests substitute their own recording sinks.

use std::sync::{Arc, Mutex};

use rusqlite::{params, Connection};
use thiserror::Error;

use crate::config::DeviceConfig;
use crate::meter::Reading;

/// Fifth insert parameter, a fixed quality/source marker inherited from the
/// downstream schema.
const QUALITY_CODE: i64 = 192;

#[derive(Debug, Error)]
pub enum SinkError {
    #[error("sink write failed: {0}")]
    Sql(#[from] rusqlite::Error),

    #[error("sink worker failed: {0}")]
    Worker(#[from] tokio::task::JoinError),
}

/// Anything that can persist one reading for one device.
pub trait ReadingSink: Send + Sync {
    fn insert(&self, device: &DeviceConfig, reading: &Reading) -> Result<(), SinkError>;
}

/// Run one insert on Tokio's blocking pool. `insert` does synchronous I/O,
/// so awaiting it directly would tie up a runtime worker thread.
pub async fn insert_blocking(
    sink: &Arc<dyn ReadingSink>,
    device: &DeviceConfig,
    reading: &Reading,
) -> Result<(), SinkError> {
    let sink = Arc::clone(sink);
    let device = device.clone();
    let reading = reading.clone();
    tokio::task::spawn_blocking(move || sink.insert(&device, &reading)).await?
}

/// SQLite-backed sink executing the configured insert statement with the
/// parameters `(name, id_measuring, q1, timestamp, 192, NULL)`.
pub struct SqlSink {
    conn: Mutex<Connection>,
    query_insert: String,
}

impl SqlSink {
    /// Open (or create) the database at `path`. `":memory:"` works for tests.
    pub fn open(path: &str, query_insert: String) -> Result<Self, SinkError> {
        let conn = Connection::open(path)?;
        Ok(Self {
            conn: Mutex::new(conn),
            query_insert,
        })
    }
}

impl ReadingSink for SqlSink {
    fn insert(&self, device: &DeviceConfig, reading: &Reading) -> Result<(), SinkError> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        conn.execute(
            &self.query_insert,
            params![
                device.name,
                device.id_measuring,
                reading.q1 as f64,
                reading.sink_timestamp(),
                QUALITY_CODE,
                Option::<String>::None,
            ],
        )?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    fn device() -> DeviceConfig {
        DeviceConfig {
            name: "boiler-1".into(),
            port: 5001,
            id_measuring: 17,
            current_data: "CUR1".into(),
            last_hour_archive: "LHA1".into(),
            backwards_archive: "BWA1".into(),
            forward_archive: String::new(),
        }
    }

    #[test]
    fn insert_runs_configured_statement() {
        let sink = SqlSink::open(
            ":memory:",
            "INSERT INTO readings (name, id_measuring, q1, stamp, quality, note) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)"
                .into(),
        )
        .unwrap();
        sink.conn
            .lock()
            .unwrap()
            .execute(
                "CREATE TABLE readings (name TEXT, id_measuring INTEGER, q1 REAL, \
                 stamp TEXT, quality INTEGER, note TEXT)",
                [],
            )
            .unwrap();

        let reading = Reading {
            timestamp: Utc.with_ymd_and_hms(2026, 8, 27, 3, 0, 0).unwrap(),
            q1: 42.5,
        };
        sink.insert(&device(), &reading).unwrap();

        let conn = sink.conn.lock().unwrap();
        let (name, stamp, quality): (String, String, i64) = conn
            .query_row(
                "SELECT name, stamp, quality FROM readings",
                [],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .unwrap();
        assert_eq!(name, "boiler-1");
        assert_eq!(stamp, "2026-08-27 03:00:00");
        assert_eq!(quality, 192);
    }

    #[tokio::test]
    async fn insert_blocking_writes_through_the_worker_pool() {
        let sink = SqlSink::open(
            ":memory:",
            "INSERT INTO readings (name, id_measuring, q1, stamp, quality, note) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)"
                .into(),
        )
        .unwrap();
        sink.conn
            .lock()
            .unwrap()
            .execute(
                "CREATE TABLE readings (name TEXT, id_measuring INTEGER, q1 REAL, \
                 stamp TEXT, quality INTEGER, note TEXT)",
                [],
            )
            .unwrap();
        let sql = Arc::new(sink);
        let sink: Arc<dyn ReadingSink> = sql.clone();

        let reading = Reading {
            timestamp: Utc.with_ymd_and_hms(2026, 8, 27, 4, 0, 0).unwrap(),
            q1: 7.25,
        };
        insert_blocking(&sink, &device(), &reading).await.unwrap();

        let conn = sql.conn.lock().unwrap();
        let q1: f64 = conn
            .query_row("SELECT q1 FROM readings", [], |row| row.get(0))
            .unwrap();
        assert_eq!(q1, 7.25);
    }
}
