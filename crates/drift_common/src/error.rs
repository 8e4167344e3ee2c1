//! Error types for the drift monitor.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum MonitorError {
    #[error("Window length mismatch: model expects {expected} samples, got {actual}")]
    WindowLength { expected: usize, actual: usize },

    #[error("Observed value is not a finite number: {0}")]
    NonFiniteActual(f64),

    #[error("Meter store error: {0}")]
    Store(String),

    #[error("Model error: {0}")]
    Model(String),

    #[error("Evidence error: {0}")]
    Evidence(String),

    #[error("Operation cancelled by shutdown")]
    Cancelled,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl MonitorError {
    /// Errors the control loop retries with its fixed backoff instead of aborting.
    pub fn is_transient(&self) -> bool {
        matches!(self, MonitorError::Store(_) | MonitorError::Io(_))
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, MonitorError::Cancelled)
    }
}

impl From<rusqlite::Error> for MonitorError {
    fn from(e: rusqlite::Error) -> Self {
        MonitorError::Store(e.to_string())
    }
}

pub type MonitorResult<T> = Result<T, MonitorError>;
