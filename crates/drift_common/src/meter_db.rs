//! Meter Database - SQLite-backed three-phase power readings
//!
//! The meter data gatherer owns this database and appends one row per
//! measurement. The monitor only reads it:
//! - the most recent N rows (newest first) to build model windows
//! - the single most recent row as the realized value after a prediction
//!
//! Schema:
//! - meter_data: time, l1_p, l2_p, l3_p

use crate::error::MonitorResult;
use crate::types::Reading;
use rusqlite::types::Value;
use rusqlite::{params, Connection, OpenFlags, Row};
use std::path::Path;

/// SQLite-backed meter store
pub struct MeterDb {
    conn: Connection,
}

impl MeterDb {
    /// Open an existing database without write access (daemon use)
    pub fn open_readonly<P: AsRef<Path>>(path: P) -> MonitorResult<Self> {
        let conn = Connection::open_with_flags(
            path.as_ref(),
            OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )?;
        Ok(Self { conn })
    }

    /// Open or create at a specific path (tests and local simulation)
    pub fn open_at<P: AsRef<Path>>(path: P) -> MonitorResult<Self> {
        let conn = Connection::open(path.as_ref())?;

        // WAL lets the gatherer keep writing while we read
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;

        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS meter_data (
                time TEXT NOT NULL,
                l1_p REAL NOT NULL,
                l2_p REAL NOT NULL,
                l3_p REAL NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_meter_time ON meter_data(time);
            "#,
        )?;

        Ok(Self { conn })
    }

    /// Record one reading
    pub fn record_reading(&self, reading: &Reading) -> MonitorResult<()> {
        self.conn.execute(
            "INSERT INTO meter_data (time, l1_p, l2_p, l3_p) VALUES (?1, ?2, ?3, ?4)",
            params![reading.time, reading.l1_p, reading.l2_p, reading.l3_p],
        )?;
        Ok(())
    }

    /// Record a batch of readings in one transaction
    pub fn record_readings(&mut self, readings: &[Reading]) -> MonitorResult<()> {
        let tx = self.conn.transaction()?;
        {
            let mut stmt = tx.prepare(
                "INSERT INTO meter_data (time, l1_p, l2_p, l3_p) VALUES (?1, ?2, ?3, ?4)",
            )?;

            for r in readings {
                stmt.execute(params![r.time, r.l1_p, r.l2_p, r.l3_p])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    /// Most recent `limit` readings, newest first
    pub fn recent_readings(&self, limit: usize) -> MonitorResult<Vec<Reading>> {
        let mut stmt = self.conn.prepare(
            r#"
            SELECT time, l1_p, l2_p, l3_p
            FROM meter_data
            ORDER BY time DESC
            LIMIT ?1
            "#,
        )?;

        let rows = stmt
            .query_map(params![limit as i64], row_to_reading)?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(rows)
    }

    /// The single most recent reading, if any
    pub fn latest_reading(&self) -> MonitorResult<Option<Reading>> {
        Ok(self.recent_readings(1)?.into_iter().next())
    }

}

fn row_to_reading(row: &Row<'_>) -> rusqlite::Result<Reading> {
    Ok(Reading {
        time: value_to_string(row.get(0)?),
        l1_p: row.get(1)?,
        l2_p: row.get(2)?,
        l3_p: row.get(3)?,
    })
}

// The gatherer has stored the time column both as text and as epoch numbers.
fn value_to_string(value: Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::Integer(i) => i.to_string(),
        Value::Real(f) => f.to_string(),
        Value::Text(s) => s,
        Value::Blob(b) => String::from_utf8_lossy(&b).into_owned(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    fn test_db() -> (NamedTempFile, MeterDb) {
        let tmp = NamedTempFile::new().unwrap();
        let db = MeterDb::open_at(tmp.path()).unwrap();
        (tmp, db)
    }

    fn reading(i: usize) -> Reading {
        Reading::new(format!("2024-01-01T00:{:02}:00", i), i as f64, 1.0, 0.5)
    }

    #[test]
    fn test_recent_readings_newest_first() {
        let (_tmp, mut db) = test_db();
        let rows: Vec<_> = (0..15).map(reading).collect();
        db.record_readings(&rows).unwrap();

        let recent = db.recent_readings(10).unwrap();
        assert_eq!(recent.len(), 10);
        assert_eq!(recent[0].time, "2024-01-01T00:14:00");
        assert_eq!(recent[9].time, "2024-01-01T00:05:00");
        assert_eq!(recent[0].aggregate(), 15.5);
    }

    #[test]
    fn test_short_store_returns_what_it_has() {
        let (_tmp, db) = test_db();
        db.record_reading(&reading(1)).unwrap();
        db.record_reading(&reading(2)).unwrap();

        let recent = db.recent_readings(10).unwrap();
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].time, "2024-01-01T00:02:00");
    }

    #[test]
    fn test_latest_reading() {
        let (_tmp, db) = test_db();
        assert_eq!(db.latest_reading().unwrap(), None);

        db.record_reading(&reading(3)).unwrap();
        db.record_reading(&reading(7)).unwrap();

        let latest = db.latest_reading().unwrap().unwrap();
        assert_eq!(latest.time, "2024-01-01T00:07:00");
    }

    #[test]
    fn test_readonly_open_reads_existing_rows() {
        let (tmp, db) = test_db();
        db.record_reading(&reading(4)).unwrap();
        drop(db);

        let ro = MeterDb::open_readonly(tmp.path()).unwrap();
        assert_eq!(ro.recent_readings(10).unwrap().len(), 1);
        assert!(ro.record_reading(&reading(5)).is_err());
    }

    #[test]
    fn test_integer_time_column() {
        let (_tmp, db) = test_db();
        db.conn
            .execute(
                "INSERT INTO meter_data (time, l1_p, l2_p, l3_p) VALUES (?1, 1.0, 1.0, 1.0)",
                params![1_700_000_000i64],
            )
            .unwrap();

        let latest = db.latest_reading().unwrap().unwrap();
        assert_eq!(latest.time, "1700000000");
        assert_eq!(latest.aggregate(), 3.0);
    }

    #[test]
    fn test_missing_database_is_store_error() {
        let dir = tempfile::TempDir::new().unwrap();
        let err = MeterDb::open_readonly(dir.path().join("absent.db")).err().unwrap();
        assert!(err.is_transient());
    }
}
