//! Evidence Builder - drift-time snapshot for remote retraining
//!
//! On drift, the monitor samples the store `sample_count` times. Each sample
//! reads a fresh window of `window_size` readings and reduces it to the sum
//! of its aggregates. The result is written as a one-column CSV that the
//! upload transport references by path.

use crate::shutdown::Shutdown;
use crate::window_source::WindowSource;
use drift_common::config::EvidenceConfig;
use drift_common::{EvidenceSnapshot, MonitorError, MonitorResult, Window};
use std::path::Path;
use std::time::Duration;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

#[derive(Debug, Clone)]
pub struct EvidenceBuilder {
    sample_count: usize,
    window_size: usize,
    column: String,
    /// Wait after a short or failed read before trying again
    retry_backoff: Duration,
    /// Wait between two accepted samples
    sample_interval: Duration,
}

impl EvidenceBuilder {
    pub fn new(sample_count: usize, window_size: usize, retry_backoff: Duration) -> Self {
        Self {
            sample_count,
            window_size,
            column: "target".to_string(),
            retry_backoff,
            sample_interval: Duration::ZERO,
        }
    }

    pub fn from_config(
        config: &EvidenceConfig,
        window_size: usize,
        retry_backoff: Duration,
    ) -> Self {
        Self {
            sample_count: config.sample_count,
            window_size,
            column: config.column.clone(),
            retry_backoff,
            sample_interval: Duration::from_millis(config.sample_interval_ms),
        }
    }

    /// Collect exactly `sample_count` window sums.
    ///
    /// Short windows and store errors are not counted; the read is retried
    /// after `retry_backoff`. Only shutdown ends the collection early.
    pub async fn build(
        &self,
        source: &dyn WindowSource,
        shutdown: &Shutdown,
    ) -> MonitorResult<EvidenceSnapshot> {
        let mut values = Vec::with_capacity(self.sample_count);
        let mut retries = 0usize;

        while values.len() < self.sample_count {
            match source.recent_readings(self.window_size).await {
                Ok(rows) if rows.len() >= self.window_size => {
                    let window = Window::from_newest_first(&rows[..self.window_size]);
                    values.push(window.sum());

                    if !self.sample_interval.is_zero() && values.len() < self.sample_count {
                        shutdown.sleep(self.sample_interval).await?;
                    }
                }
                Ok(rows) => {
                    retries += 1;
                    debug!(
                        "Evidence sample {} skipped: {} of {} readings available",
                        values.len(),
                        rows.len(),
                        self.window_size
                    );
                    shutdown.sleep(self.retry_backoff).await?;
                }
                Err(e) if e.is_transient() => {
                    retries += 1;
                    warn!("Evidence sample {} read failed: {}", values.len(), e);
                    shutdown.sleep(self.retry_backoff).await?;
                }
                Err(e) => return Err(e),
            }
        }

        info!(
            "Evidence snapshot built: {} samples ({} retries)",
            values.len(),
            retries
        );
        Ok(EvidenceSnapshot { values })
    }

    /// Write `snapshot` as a labeled one-column CSV.
    ///
    /// The file is written next to `path` and renamed into place, so the
    /// uploader never sees a half-written snapshot.
    pub async fn write_csv(&self, snapshot: &EvidenceSnapshot, path: &Path) -> MonitorResult<()> {
        if snapshot.is_empty() {
            return Err(MonitorError::Evidence("refusing to write an empty snapshot".to_string()));
        }

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).await?;
            }
        }

        let mut csv = String::with_capacity(16 * (snapshot.len() + 1));
        csv.push_str(&self.column);
        csv.push('\n');
        for value in &snapshot.values {
            csv.push_str(&format!("{:.6}\n", value));
        }

        let tmp_path = path.with_extension("csv.partial");
        let mut file = fs::File::create(&tmp_path).await?;
        file.write_all(csv.as_bytes()).await?;
        file.sync_all().await?;
        drop(file);
        fs::rename(&tmp_path, path).await?;

        debug!("Wrote {} evidence rows to {}", snapshot.len(), path.display());
        Ok(())
    }
}
