//! Monitor Configuration
//!
//! Settings for the drift monitor daemon.
//! Config file: explicit `--config` path, `$DRIFTD_CONFIG`, or /etc/driftd/config.toml.
//! Every field defaults to the reference deployment, so an empty file is valid.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// System-wide config file path
pub const SYSTEM_CONFIG_PATH: &str = "/etc/driftd/config.toml";

/// Environment variable naming an alternative config file
pub const CONFIG_ENV_VAR: &str = "DRIFTD_CONFIG";

/// Meter store settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// SQLite database written by the meter data gatherer
    #[serde(default = "default_db_path")]
    pub db_path: PathBuf,
}

fn default_db_path() -> PathBuf {
    PathBuf::from("/home/sens/sens_docker/clemap_db/data_gathering.db")
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
        }
    }
}

/// Model artifact settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    /// Model file, replaced in place by the retraining pipeline
    #[serde(default = "default_model_path")]
    pub path: PathBuf,
}

fn default_model_path() -> PathBuf {
    PathBuf::from("/tmp/model.json")
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            path: default_model_path(),
        }
    }
}

/// Drift decision settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DriftConfig {
    /// Largest tolerated absolute error (inclusive)
    #[serde(default = "default_threshold")]
    pub threshold: f64,

    /// Number of readings per model input window
    #[serde(default = "default_window_size")]
    pub window_size: usize,
}

fn default_threshold() -> f64 {
    0.05
}

fn default_window_size() -> usize {
    10
}

impl Default for DriftConfig {
    fn default() -> Self {
        Self {
            threshold: default_threshold(),
            window_size: default_window_size(),
        }
    }
}

/// Evidence snapshot settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvidenceConfig {
    /// Number of aggregated samples per snapshot
    #[serde(default = "default_sample_count")]
    pub sample_count: usize,

    /// CSV file handed to the upload transport
    #[serde(default = "default_evidence_path")]
    pub output_path: PathBuf,

    /// Header of the single CSV column
    #[serde(default = "default_column")]
    pub column: String,

    /// Pause between two samples (0 = back to back)
    #[serde(default)]
    pub sample_interval_ms: u64,
}

fn default_sample_count() -> usize {
    100
}

fn default_evidence_path() -> PathBuf {
    PathBuf::from("/tmp/Clemap_train.csv")
}

fn default_column() -> String {
    "target".to_string()
}

impl Default for EvidenceConfig {
    fn default() -> Self {
        Self {
            sample_count: default_sample_count(),
            output_path: default_evidence_path(),
            column: default_column(),
            sample_interval_ms: 0,
        }
    }
}

/// Upload transport settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadConfig {
    /// Data channel receiving export tasks
    #[serde(default = "default_data_stream")]
    pub data_stream: String,

    /// Status channel receiving export outcomes
    #[serde(default = "default_status_stream")]
    pub status_stream: String,

    /// Destination bucket
    #[serde(default = "default_bucket")]
    pub bucket: String,

    /// Destination key inside the bucket
    #[serde(default = "default_key")]
    pub key: String,

    /// Per-read timeout on the status channel
    #[serde(default = "default_read_timeout")]
    pub read_timeout_ms: u64,

    /// Pause between status reads that produced no terminal event
    #[serde(default = "default_poll_backoff")]
    pub poll_backoff_ms: u64,

    /// Capacity of each local stream before the oldest message is overwritten
    #[serde(default = "default_stream_max_messages")]
    pub stream_max_messages: usize,

    /// Directory the local stream manager exports buckets into
    #[serde(default = "default_export_root")]
    pub export_root: PathBuf,
}

fn default_data_stream() -> String {
    "SomeStream".to_string()
}

fn default_status_stream() -> String {
    "SomeStatusStreamName".to_string()
}

fn default_bucket() -> String {
    "clemapbucket".to_string()
}

fn default_key() -> String {
    "data/Clemap_train.csv".to_string()
}

fn default_read_timeout() -> u64 {
    1_000
}

fn default_poll_backoff() -> u64 {
    5_000
}

fn default_stream_max_messages() -> usize {
    1_024
}

fn default_export_root() -> PathBuf {
    PathBuf::from("/var/lib/driftd/export")
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            data_stream: default_data_stream(),
            status_stream: default_status_stream(),
            bucket: default_bucket(),
            key: default_key(),
            read_timeout_ms: default_read_timeout(),
            poll_backoff_ms: default_poll_backoff(),
            stream_max_messages: default_stream_max_messages(),
            export_root: default_export_root(),
        }
    }
}

/// Control loop cadence
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimingConfig {
    /// Wait between scoring and reading the realized value, and between cycles
    #[serde(default = "default_observation_interval")]
    pub observation_interval_ms: u64,

    /// Wait when the store holds fewer readings than a window needs
    #[serde(default = "default_insufficient_data_backoff")]
    pub insufficient_data_backoff_ms: u64,

    /// Model file modification poll cadence
    #[serde(default = "default_model_poll_interval")]
    pub model_poll_interval_ms: u64,
}

fn default_observation_interval() -> u64 {
    60_000
}

fn default_insufficient_data_backoff() -> u64 {
    5_000
}

fn default_model_poll_interval() -> u64 {
    5_000
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            observation_interval_ms: default_observation_interval(),
            insufficient_data_backoff_ms: default_insufficient_data_backoff(),
            model_poll_interval_ms: default_model_poll_interval(),
        }
    }
}

impl TimingConfig {
    pub fn observation_interval(&self) -> Duration {
        Duration::from_millis(self.observation_interval_ms)
    }

    pub fn insufficient_data_backoff(&self) -> Duration {
        Duration::from_millis(self.insufficient_data_backoff_ms)
    }

    pub fn model_poll_interval(&self) -> Duration {
        Duration::from_millis(self.model_poll_interval_ms)
    }
}

/// Process-level settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonConfig {
    /// Log filter used when RUST_LOG is not set
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// JSON status snapshot rewritten as the loop progresses
    #[serde(default)]
    pub status_file: Option<PathBuf>,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            status_file: None,
        }
    }
}

/// Full monitor configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MonitorConfig {
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub model: ModelConfig,
    #[serde(default)]
    pub drift: DriftConfig,
    #[serde(default)]
    pub evidence: EvidenceConfig,
    #[serde(default)]
    pub upload: UploadConfig,
    #[serde(default)]
    pub timing: TimingConfig,
    #[serde(default)]
    pub daemon: DaemonConfig,
}

impl MonitorConfig {
    /// Load configuration
    ///
    /// Priority:
    /// 1. Explicit path (must exist)
    /// 2. $DRIFTD_CONFIG (must exist when set)
    /// 3. /etc/driftd/config.toml (optional)
    /// 4. Defaults
    pub fn load(explicit: Option<&Path>) -> Result<Self> {
        Self::load_located(explicit).map(|(config, _)| config)
    }

    /// Like `load`, also returning the file the settings came from
    /// (`None` when running on defaults)
    pub fn load_located(explicit: Option<&Path>) -> Result<(Self, Option<PathBuf>)> {
        match Self::locate(explicit) {
            Some(path) => Ok((Self::load_from_path(&path)?, Some(path))),
            None => {
                let config = Self::default();
                config.validate()?;
                Ok((config, None))
            }
        }
    }

    /// Resolve which config file applies, in `load` priority order
    pub fn locate(explicit: Option<&Path>) -> Option<PathBuf> {
        if let Some(path) = explicit {
            return Some(path.to_path_buf());
        }

        if let Ok(env_path) = std::env::var(CONFIG_ENV_VAR) {
            return Some(PathBuf::from(env_path));
        }

        let system_path = Path::new(SYSTEM_CONFIG_PATH);
        system_path.exists().then(|| system_path.to_path_buf())
    }

    /// Load and validate a specific file
    pub fn load_from_path(path: &Path) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        let config: MonitorConfig = toml::from_str(&contents)
            .with_context(|| format!("Failed to parse {}", path.display()))?;
        config
            .validate()
            .with_context(|| format!("Invalid configuration in {}", path.display()))?;
        Ok(config)
    }

    /// Write configuration as TOML
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)
                    .with_context(|| format!("Failed to create directory {}", parent.display()))?;
            }
        }

        let toml_string =
            toml::to_string_pretty(self).context("Failed to serialize configuration")?;

        fs::write(path, toml_string)
            .with_context(|| format!("Failed to write {}", path.display()))?;

        Ok(())
    }

    /// Reject settings the control loop cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.drift.window_size == 0 {
            anyhow::bail!("drift.window_size must be at least 1");
        }
        if !self.drift.threshold.is_finite() || self.drift.threshold < 0.0 {
            anyhow::bail!(
                "drift.threshold must be a finite, non-negative number (got {})",
                self.drift.threshold
            );
        }
        if self.evidence.sample_count == 0 {
            anyhow::bail!("evidence.sample_count must be at least 1");
        }
        if self.evidence.column.trim().is_empty() {
            anyhow::bail!("evidence.column must not be empty");
        }
        for (name, value) in [
            ("upload.data_stream", &self.upload.data_stream),
            ("upload.status_stream", &self.upload.status_stream),
            ("upload.bucket", &self.upload.bucket),
            ("upload.key", &self.upload.key),
        ] {
            if value.trim().is_empty() {
                anyhow::bail!("{} must not be empty", name);
            }
        }
        if self.upload.data_stream == self.upload.status_stream {
            anyhow::bail!("upload.data_stream and upload.status_stream must differ");
        }
        if self.upload.stream_max_messages == 0 {
            anyhow::bail!("upload.stream_max_messages must be at least 1");
        }
        Ok(())
    }
}
