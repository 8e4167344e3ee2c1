//! Core data model shared by the daemon and its collaborators.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::SystemTime;

/// One row of the meter store: three phase powers at a point in time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reading {
    pub time: String,
    pub l1_p: f64,
    pub l2_p: f64,
    pub l3_p: f64,
}

impl Reading {
    pub fn new(time: impl Into<String>, l1_p: f64, l2_p: f64, l3_p: f64) -> Self {
        Self {
            time: time.into(),
            l1_p,
            l2_p,
            l3_p,
        }
    }

    /// Total power across the three phases.
    pub fn aggregate(&self) -> f64 {
        self.l1_p + self.l2_p + self.l3_p
    }
}

/// Model input: aggregate samples ordered oldest-first.
#[derive(Debug, Clone, PartialEq)]
pub struct Window {
    samples: Vec<f64>,
}

impl Window {
    pub fn new(samples: Vec<f64>) -> Self {
        Self { samples }
    }

    /// Build a window from store rows, which arrive newest-first.
    pub fn from_newest_first(readings: &[Reading]) -> Self {
        Self {
            samples: readings.iter().rev().map(Reading::aggregate).collect(),
        }
    }

    pub fn samples(&self) -> &[f64] {
        &self.samples
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn sum(&self) -> f64 {
        self.samples.iter().sum()
    }
}

/// A scored window. Consumed by the detector right away, never stored.
#[derive(Debug, Clone)]
pub struct Prediction {
    pub value: f64,
    pub window: Window,
}

/// Outcome of comparing a prediction with the value that materialized.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "verdict", rename_all = "snake_case")]
pub enum DriftVerdict {
    Ok {
        predicted: f64,
        actual: f64,
        absolute_error: f64,
    },
    Drifted {
        predicted: f64,
        actual: f64,
        absolute_error: f64,
    },
}

impl DriftVerdict {
    pub fn is_drifted(&self) -> bool {
        matches!(self, DriftVerdict::Drifted { .. })
    }

    pub fn absolute_error(&self) -> f64 {
        match self {
            DriftVerdict::Ok { absolute_error, .. }
            | DriftVerdict::Drifted { absolute_error, .. } => *absolute_error,
        }
    }
}

/// Bounded dataset captured at drift time for remote retraining.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EvidenceSnapshot {
    pub values: Vec<f64>,
}

impl EvidenceSnapshot {
    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

/// Describes one evidence transfer to the destination store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadTask {
    /// Source location as a `file:` URL.
    pub input_url: String,
    pub bucket: String,
    pub key: String,
}

impl UploadTask {
    pub fn from_local_path(path: &std::path::Path, bucket: &str, key: &str) -> Self {
        Self {
            input_url: format!("file:{}", path.display()),
            bucket: bucket.to_string(),
            key: key.to_string(),
        }
    }

    /// Local path behind a `file:` URL, if that is what this task points at.
    pub fn local_path(&self) -> Option<PathBuf> {
        self.input_url
            .strip_prefix("file://")
            .or_else(|| self.input_url.strip_prefix("file:"))
            .map(PathBuf::from)
    }
}

/// Upload status reported on the status channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum UploadStatus {
    InProgress,
    Success,
    Failure,
    Canceled,
}

impl UploadStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, UploadStatus::InProgress)
    }
}

/// One entry of the status channel, positioned by its sequence number.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusEvent {
    pub sequence_number: u64,
    pub outcome: UploadStatus,
    pub message: String,
}

/// What an upload attempt ultimately reports to the control loop.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", content = "reason", rename_all = "snake_case")]
pub enum UploadOutcome {
    Success,
    Failure(String),
}

impl UploadOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, UploadOutcome::Success)
    }
}

/// The model file and the modification time it had when last observed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelArtifact {
    pub path: PathBuf,
    pub modified: Option<SystemTime>,
}

/// Where the control loop currently is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrchestratorState {
    LoadingModel,
    Scoring,
    BuildingEvidence,
    Uploading,
    AwaitingNewModel,
    Stopped,
}

impl std::fmt::Display for OrchestratorState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            OrchestratorState::LoadingModel => "loading_model",
            OrchestratorState::Scoring => "scoring",
            OrchestratorState::BuildingEvidence => "building_evidence",
            OrchestratorState::Uploading => "uploading",
            OrchestratorState::AwaitingNewModel => "awaiting_new_model",
            OrchestratorState::Stopped => "stopped",
        };
        f.write_str(name)
    }
}
