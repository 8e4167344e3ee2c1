//! Window Source - where the monitor reads meter readings from
//!
//! Production uses `SqliteWindowSource`, which opens the gatherer's database
//! read-only for every query. Test code uses `FakeWindowSource` with
//! scripted responses and call counters.

use async_trait::async_trait;
use drift_common::{MeterDb, MonitorError, MonitorResult, Reading};
use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::Mutex;

// ============================================================================
// Window Source Trait
// ============================================================================

/// Read-only view of the telemetry store
#[async_trait]
pub trait WindowSource: Send + Sync {
    /// Most recent `limit` readings, newest first
    async fn recent_readings(&self, limit: usize) -> MonitorResult<Vec<Reading>>;

    /// The single most recent reading
    async fn latest_reading(&self) -> MonitorResult<Option<Reading>>;
}

// ============================================================================
// SQLite Window Source (Production)
// ============================================================================

/// Reads the meter database written by the data gatherer
pub struct SqliteWindowSource {
    db_path: PathBuf,
}

impl SqliteWindowSource {
    pub fn new(db_path: impl Into<PathBuf>) -> Self {
        Self {
            db_path: db_path.into(),
        }
    }

    async fn with_db<T, F>(&self, f: F) -> MonitorResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&MeterDb) -> MonitorResult<T> + Send + 'static,
    {
        let path = self.db_path.clone();
        tokio::task::spawn_blocking(move || {
            let db = MeterDb::open_readonly(&path)?;
            f(&db)
        })
        .await
        .map_err(|e| MonitorError::Store(format!("store task failed: {}", e)))?
    }
}

#[async_trait]
impl WindowSource for SqliteWindowSource {
    async fn recent_readings(&self, limit: usize) -> MonitorResult<Vec<Reading>> {
        self.with_db(move |db| db.recent_readings(limit)).await
    }

    async fn latest_reading(&self) -> MonitorResult<Option<Reading>> {
        self.with_db(|db| db.latest_reading()).await
    }
}

// ============================================================================
// Fake Window Source (Testing)
// ============================================================================

/// Scripted answer for one call
#[derive(Debug, Clone)]
pub enum FakeRead<T> {
    Rows(T),
    Fail(String),
}

/// In-memory window source
///
/// Scripted responses are consumed first; afterwards every call is answered
/// from the backing rows.
///
/// ```rust,ignore
/// let source = FakeWindowSource::steady(10, 1.0);
/// source.push_recent(FakeRead::Rows(vec![]));   // first read: empty store
/// source.push_latest(FakeRead::Fail("locked".into()));
/// ```
pub struct FakeWindowSource {
    /// Backing rows, newest first
    rows: Mutex<Vec<Reading>>,
    recent_script: Mutex<VecDeque<FakeRead<Vec<Reading>>>>,
    latest_script: Mutex<VecDeque<FakeRead<Option<Reading>>>>,
    recent_calls: Mutex<usize>,
    latest_calls: Mutex<usize>,
}

impl FakeWindowSource {
    /// Source backed by `rows` (newest first)
    pub fn new(rows: Vec<Reading>) -> Self {
        Self {
            rows: Mutex::new(rows),
            recent_script: Mutex::new(VecDeque::new()),
            latest_script: Mutex::new(VecDeque::new()),
            recent_calls: Mutex::new(0),
            latest_calls: Mutex::new(0),
        }
    }

    /// `count` identical rows whose aggregate is `aggregate`
    pub fn steady(count: usize, aggregate: f64) -> Self {
        let rows = (0..count)
            .map(|i| Reading::new(format!("t{:04}", count - i), aggregate, 0.0, 0.0))
            .collect();
        Self::new(rows)
    }

    /// Queue an answer for the next `recent_readings` call
    pub fn push_recent(&self, read: FakeRead<Vec<Reading>>) {
        self.recent_script.lock().unwrap().push_back(read);
    }

    /// Queue an answer for the next `latest_reading` call
    pub fn push_latest(&self, read: FakeRead<Option<Reading>>) {
        self.latest_script.lock().unwrap().push_back(read);
    }

    /// Append a new newest row
    pub fn insert_newest(&self, reading: Reading) {
        self.rows.lock().unwrap().insert(0, reading);
    }

    pub fn recent_calls(&self) -> usize {
        *self.recent_calls.lock().unwrap()
    }

    pub fn latest_calls(&self) -> usize {
        *self.latest_calls.lock().unwrap()
    }
}

#[async_trait]
impl WindowSource for FakeWindowSource {
    async fn recent_readings(&self, limit: usize) -> MonitorResult<Vec<Reading>> {
        *self.recent_calls.lock().unwrap() += 1;

        if let Some(read) = self.recent_script.lock().unwrap().pop_front() {
            return match read {
                FakeRead::Rows(rows) => Ok(rows.into_iter().take(limit).collect()),
                FakeRead::Fail(msg) => Err(MonitorError::Store(msg)),
            };
        }

        Ok(self.rows.lock().unwrap().iter().take(limit).cloned().collect())
    }

    async fn latest_reading(&self) -> MonitorResult<Option<Reading>> {
        *self.latest_calls.lock().unwrap() += 1;

        if let Some(read) = self.latest_script.lock().unwrap().pop_front() {
            return match read {
                FakeRead::Rows(row) => Ok(row),
                FakeRead::Fail(msg) => Err(MonitorError::Store(msg)),
            };
        }

        Ok(self.rows.lock().unwrap().first().cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    #[tokio::test]
    async fn test_sqlite_source_reads_gatherer_db() {
        let tmp = NamedTempFile::new().unwrap();
        {
            let mut db = MeterDb::open_at(tmp.path()).unwrap();
            let rows: Vec<_> = (0..12)
                .map(|i| Reading::new(format!("2024-05-01T10:{:02}:00", i), 1.0, 2.0, i as f64))
                .collect();
            db.record_readings(&rows).unwrap();
        }

        let source = SqliteWindowSource::new(tmp.path());
        let recent = source.recent_readings(10).await.unwrap();
        assert_eq!(recent.len(), 10);
        assert_eq!(recent[0].l3_p, 11.0);

        let latest = source.latest_reading().await.unwrap().unwrap();
        assert_eq!(latest.aggregate(), 14.0);
    }

    #[tokio::test]
    async fn test_sqlite_source_missing_db_is_transient() {
        let dir = tempfile::TempDir::new().unwrap();
        let source = SqliteWindowSource::new(dir.path().join("none.db"));
        let err = source.recent_readings(10).await.unwrap_err();
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn test_fake_script_then_rows() {
        let source = FakeWindowSource::steady(10, 2.0);
        source.push_recent(FakeRead::Rows(vec![]));
        source.push_recent(FakeRead::Fail("busy".to_string()));

        assert!(source.recent_readings(10).await.unwrap().is_empty());
        assert!(source.recent_readings(10).await.is_err());
        assert_eq!(source.recent_readings(10).await.unwrap().len(), 10);
        assert_eq!(source.recent_calls(), 3);

        source.insert_newest(Reading::new("t9999", 5.0, 0.0, 0.0));
        let latest = source.latest_reading().await.unwrap().unwrap();
        assert_eq!(latest.aggregate(), 5.0);
        assert_eq!(source.latest_calls(), 1);
    }
}
