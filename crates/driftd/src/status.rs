//! Status persistence
//!
//! The control loop rewrites a small JSON snapshot of where it is after
//! every scoring cycle and every drift-response phase. `driftd status`
//! reads it back.

use crate::orchestrator::OrchestratorStats;
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use drift_common::{DriftVerdict, OrchestratorState, UploadOutcome};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::fs::{create_dir_all, OpenOptions};
use tokio::io::AsyncWriteExt;
use tracing::debug;

/// Last drift decision. Non-finite values are stored as `null`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VerdictRecord {
    pub drifted: bool,
    pub predicted: Option<f64>,
    pub actual: Option<f64>,
    pub absolute_error: Option<f64>,
    pub at: DateTime<Utc>,
}

fn finite(value: f64) -> Option<f64> {
    value.is_finite().then_some(value)
}

impl VerdictRecord {
    pub fn from_verdict(verdict: &DriftVerdict, at: DateTime<Utc>) -> Self {
        let (drifted, predicted, actual, absolute_error) = match *verdict {
            DriftVerdict::Ok {
                predicted,
                actual,
                absolute_error,
            } => (false, predicted, actual, absolute_error),
            DriftVerdict::Drifted {
                predicted,
                actual,
                absolute_error,
            } => (true, predicted, actual, absolute_error),
        };
        Self {
            drifted,
            predicted: finite(predicted),
            actual: finite(actual),
            absolute_error: finite(absolute_error),
            at,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UploadRecord {
    pub outcome: UploadOutcome,
    pub at: DateTime<Utc>,
}

/// Snapshot written to `daemon.status_file`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MonitorStatus {
    pub state: OrchestratorState,
    pub stats: OrchestratorStats,
    pub last_verdict: Option<VerdictRecord>,
    pub last_upload: Option<UploadRecord>,
    pub model_path: PathBuf,
    pub updated_at: DateTime<Utc>,
}

impl MonitorStatus {
    pub fn new(model_path: &Path) -> Self {
        Self {
            state: OrchestratorState::LoadingModel,
            stats: OrchestratorStats::default(),
            last_verdict: None,
            last_upload: None,
            model_path: model_path.to_path_buf(),
            updated_at: Utc::now(),
        }
    }

    /// Human-readable summary for `driftd status`
    pub fn summary(&self) -> String {
        let mut out = String::new();
        out.push_str(&format!("State:        {}\n", self.state));
        out.push_str(&format!("Model:        {}\n", self.model_path.display()));
        out.push_str(&format!(
            "Updated:      {}\n",
            self.updated_at.format("%Y-%m-%d %H:%M:%S UTC")
        ));
        out.push_str(&format!(
            "Cycles:       {} scored, {} skipped, {} waits for data\n",
            self.stats.cycles_scored, self.stats.skipped_cycles, self.stats.insufficient_data_waits
        ));
        out.push_str(&format!(
            "Drift:        {} events, {} model reloads\n",
            self.stats.drift_events, self.stats.model_reloads
        ));
        out.push_str(&format!(
            "Uploads:      {} succeeded, {} failed\n",
            self.stats.uploads_succeeded, self.stats.uploads_failed
        ));

        if let Some(v) = &self.last_verdict {
            let show =
                |x: Option<f64>| x.map_or_else(|| "NaN".to_string(), |x| format!("{:.6}", x));
            out.push_str(&format!(
                "Last verdict: {} (predicted {}, actual {}, error {})\n",
                if v.drifted { "drifted" } else { "ok" },
                show(v.predicted),
                show(v.actual),
                show(v.absolute_error)
            ));
        }
        if let Some(u) = &self.last_upload {
            match &u.outcome {
                UploadOutcome::Success => out.push_str("Last upload:  success\n"),
                UploadOutcome::Failure(reason) => {
                    out.push_str(&format!("Last upload:  failed ({})\n", reason))
                }
            }
        }
        out
    }
}

/// Load a status snapshot; `None` if the daemon has not written one yet
pub async fn load_status(path: &Path) -> Result<Option<MonitorStatus>> {
    let contents = match tokio::fs::read_to_string(path).await {
        Ok(contents) => contents,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => {
            return Err(e).with_context(|| format!("Failed to read status file {}", path.display()))
        }
    };

    let status: MonitorStatus =
        serde_json::from_str(&contents).context("Failed to parse status JSON")?;
    Ok(Some(status))
}

/// Save a status snapshot, replacing the previous one atomically
pub async fn save_status(path: &Path, status: &MonitorStatus) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            create_dir_all(parent)
                .await
                .context("Failed to create status directory")?;
        }
    }

    let json = serde_json::to_string_pretty(status).context("Failed to serialize status")?;
    let tmp_path = path.with_extension("json.tmp");

    let mut file = OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .open(&tmp_path)
        .await
        .context("Failed to open status file for writing")?;
    file.write_all(json.as_bytes())
        .await
        .context("Failed to write status file")?;
    file.sync_all().await.context("Failed to sync status file")?;
    drop(file);

    tokio::fs::rename(&tmp_path, path)
        .await
        .context("Failed to move status file into place")?;

    debug!("Saved monitor status ({})", status.state);
    Ok(())
}
