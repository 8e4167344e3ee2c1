//! Orchestrator - the drift monitoring control loop
//!
//! ```text
//! LOADING_MODEL ──► SCORING ──ok──► SCORING
//!       ▲              │
//!       │              └─drift─► BUILDING_EVIDENCE ─► UPLOADING
//!       │                                                 │
//!       └──────────────── AWAITING_NEW_MODEL ◄────────────┘
//! ```
//!
//! One sequential loop: no overlapping cycles, at most one upload at a
//! time. Every wait goes through `Shutdown::sleep`, so a shutdown request
//! ends the loop at its next suspension point.

use crate::detector::DriftDetector;
use crate::evidence::EvidenceBuilder;
use crate::predictor::{Model, ModelLoader};
use crate::shutdown::Shutdown;
use crate::status::{save_status, MonitorStatus, UploadRecord, VerdictRecord};
use crate::transport::{StreamConnector, UploadSettings, UploadTransport};
use crate::watcher::{ArtifactClock, ModelWatcher};
use crate::window_source::WindowSource;
use chrono::Utc;
use drift_common::{
    DriftVerdict, MonitorConfig, MonitorError, MonitorResult, OrchestratorState, Prediction,
    UploadOutcome, Window,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Counters kept across the life of the loop
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrchestratorStats {
    pub cycles_scored: u64,
    pub drift_events: u64,
    pub uploads_succeeded: u64,
    pub uploads_failed: u64,
    pub model_reloads: u64,
    pub insufficient_data_waits: u64,
    pub skipped_cycles: u64,
}

/// External collaborators, created by the caller and owned by the loop
pub struct Collaborators {
    pub source: Arc<dyn WindowSource>,
    pub loader: Arc<dyn ModelLoader>,
    pub connector: Arc<dyn StreamConnector>,
    pub clock: Arc<dyn ArtifactClock>,
}

/// Result of one pass through SCORING
enum Cycle {
    /// Not enough data yet; does not use up a scoring slot
    Wait,
    /// The realized value was unusable
    Skipped,
    Scored(DriftVerdict),
}

pub struct Orchestrator {
    config: MonitorConfig,
    source: Arc<dyn WindowSource>,
    loader: Arc<dyn ModelLoader>,
    detector: DriftDetector,
    evidence: EvidenceBuilder,
    transport: UploadTransport,
    watcher: ModelWatcher,
    shutdown: Shutdown,
    model: Option<Box<dyn Model>>,
    state: OrchestratorState,
    stats: OrchestratorStats,
    status: MonitorStatus,
}

impl Orchestrator {
    pub fn new(config: MonitorConfig, parts: Collaborators, shutdown: Shutdown) -> Self {
        let window_size = config.drift.window_size;
        let detector = DriftDetector::new(config.drift.threshold);
        let evidence = EvidenceBuilder::from_config(
            &config.evidence,
            window_size,
            config.timing.insufficient_data_backoff(),
        );
        let transport = UploadTransport::new(
            parts.connector,
            UploadSettings::from_config(&config.upload),
            shutdown.clone(),
        );
        let watcher = ModelWatcher::new(
            parts.clock,
            config.timing.model_poll_interval(),
            shutdown.clone(),
        );
        let status = MonitorStatus::new(&config.model.path);

        Self {
            config,
            source: parts.source,
            loader: parts.loader,
            detector,
            evidence,
            transport,
            watcher,
            shutdown,
            model: None,
            state: OrchestratorState::LoadingModel,
            stats: OrchestratorStats::default(),
            status,
        }
    }

    pub fn state(&self) -> OrchestratorState {
        self.state
    }

    pub fn stats(&self) -> &OrchestratorStats {
        &self.stats
    }

    /// Run until shutdown
    ///
    /// Fails only if the model cannot be loaded at startup or a non-retryable
    /// error escapes a cycle.
    pub async fn run(&mut self) -> MonitorResult<OrchestratorStats> {
        self.run_until(None).await
    }

    /// Run until `cycles` cycles have completed (scored or skipped), or shutdown
    pub async fn run_cycles(&mut self, cycles: u64) -> MonitorResult<OrchestratorStats> {
        self.run_until(Some(cycles)).await
    }

    async fn run_until(&mut self, limit: Option<u64>) -> MonitorResult<OrchestratorStats> {
        if self.model.is_none() {
            self.enter(OrchestratorState::LoadingModel).await;
            // No recovery path if the artifact never yields a model
            let model = self.load_model().await.map_err(|e| {
                error!("Initial model load failed: {}", e);
                e
            })?;
            self.model = Some(model);
            info!("Model loaded from {}", self.config.model.path.display());
        }

        let result = self.control_loop(limit).await;
        self.enter(OrchestratorState::Stopped).await;

        match result {
            Ok(()) => Ok(self.stats.clone()),
            Err(MonitorError::Cancelled) => {
                info!("Control loop stopped by shutdown");
                Ok(self.stats.clone())
            }
            Err(e) => {
                error!("Control loop aborted: {}", e);
                Err(e)
            }
        }
    }

    async fn control_loop(&mut self, limit: Option<u64>) -> MonitorResult<()> {
        let mut completed = 0u64;

        while limit.map_or(true, |n| completed < n) {
            self.enter(OrchestratorState::Scoring).await;

            match self.score_cycle().await? {
                Cycle::Wait => {
                    self.stats.insufficient_data_waits += 1;
                    self.shutdown
                        .sleep(self.config.timing.insufficient_data_backoff())
                        .await?;
                    continue;
                }
                Cycle::Skipped => {
                    self.stats.skipped_cycles += 1;
                    completed += 1;
                }
                Cycle::Scored(verdict) if verdict.is_drifted() => {
                    completed += 1;
                    self.respond_to_drift(&verdict).await?;
                    self.persist().await;
                    continue;
                }
                Cycle::Scored(_) => completed += 1,
            }

            self.persist().await;
            if limit.map_or(true, |n| completed < n) {
                self.shutdown
                    .sleep(self.config.timing.observation_interval())
                    .await?;
            }
        }

        Ok(())
    }

    /// Predict from the latest window, wait for the next value, and judge it
    async fn score_cycle(&mut self) -> MonitorResult<Cycle> {
        let window_size = self.config.drift.window_size;

        let rows = match self.source.recent_readings(window_size).await {
            Ok(rows) => rows,
            Err(e) if e.is_transient() => {
                warn!("Meter store unavailable: {}", e);
                return Ok(Cycle::Wait);
            }
            Err(e) => return Err(e),
        };
        if rows.len() < window_size {
            debug!("Not enough data: {} of {} readings", rows.len(), window_size);
            return Ok(Cycle::Wait);
        }

        let window = Window::from_newest_first(&rows[..window_size]);
        let model = self
            .model
            .as_ref()
            .ok_or_else(|| MonitorError::Model("no model loaded".to_string()))?;
        let prediction = Prediction {
            value: model.predict(&window)?,
            window,
        };
        debug!(
            "Predicted {} from {} readings ending at {}",
            prediction.value,
            prediction.window.len(),
            rows[0].time
        );

        // Give the next real value time to materialize
        self.shutdown
            .sleep(self.config.timing.observation_interval())
            .await?;

        let actual = match self.source.latest_reading().await {
            Ok(Some(reading)) => reading.aggregate(),
            Ok(None) => {
                debug!("No realized value yet");
                return Ok(Cycle::Wait);
            }
            Err(e) if e.is_transient() => {
                warn!("Meter store unavailable: {}", e);
                return Ok(Cycle::Wait);
            }
            Err(e) => return Err(e),
        };

        let verdict = match self.detector.judge(&prediction, actual) {
            Ok(verdict) => verdict,
            Err(MonitorError::NonFiniteActual(value)) => {
                warn!("Skipping cycle: realized value {} is not a finite number", value);
                return Ok(Cycle::Skipped);
            }
            Err(e) => return Err(e),
        };

        self.stats.cycles_scored += 1;
        self.status.last_verdict = Some(VerdictRecord::from_verdict(&verdict, Utc::now()));
        let predicted = prediction.value;
        match verdict {
            DriftVerdict::Ok { absolute_error, .. } => {
                info!(predicted, actual, absolute_error, "Prediction ok");
            }
            DriftVerdict::Drifted { absolute_error, .. } => {
                warn!(
                    predicted,
                    actual,
                    absolute_error,
                    threshold = self.detector.threshold(),
                    "Model drift detected"
                );
            }
        }

        Ok(Cycle::Scored(verdict))
    }

    /// Evidence, upload, wait for the retrained model, reload
    ///
    /// The new model is awaited whatever the upload outcome.
    async fn respond_to_drift(&mut self, verdict: &DriftVerdict) -> MonitorResult<()> {
        self.stats.drift_events += 1;
        debug!("Responding to drift (error {})", verdict.absolute_error());

        self.enter(OrchestratorState::BuildingEvidence).await;
        let snapshot = self.evidence.build(self.source.as_ref(), &self.shutdown).await?;
        let evidence_path = self.config.evidence.output_path.clone();
        let written = self.evidence.write_csv(&snapshot, &evidence_path).await;

        let model_path = self.config.model.path.clone();
        let before = self.watcher.snapshot(&model_path).await;

        self.enter(OrchestratorState::Uploading).await;
        let outcome = match written {
            Ok(()) => {
                self.transport
                    .upload(&evidence_path, &self.config.upload.bucket, &self.config.upload.key)
                    .await
            }
            Err(e) => {
                error!("Cannot write evidence to {}: {}", evidence_path.display(), e);
                UploadOutcome::Failure(e.to_string())
            }
        };

        match &outcome {
            UploadOutcome::Success => self.stats.uploads_succeeded += 1,
            UploadOutcome::Failure(reason) => {
                self.stats.uploads_failed += 1;
                warn!("Evidence upload failed: {}", reason);
            }
        }
        self.status.last_upload = Some(UploadRecord {
            outcome,
            at: Utc::now(),
        });
        if self.shutdown.is_cancelled() {
            return Err(MonitorError::Cancelled);
        }

        self.enter(OrchestratorState::AwaitingNewModel).await;
        info!("Waiting for a retrained model at {}", model_path.display());
        self.watcher
            .wait_for_update(&model_path, before.modified)
            .await?;

        self.enter(OrchestratorState::LoadingModel).await;
        self.reload_model().await
    }

    /// Reload after a change; an unusable artifact is retried at the poll interval
    async fn reload_model(&mut self) -> MonitorResult<()> {
        loop {
            match self.load_model().await {
                Ok(model) => {
                    self.model = Some(model);
                    self.stats.model_reloads += 1;
                    info!("Reloaded model from {}", self.config.model.path.display());
                    return Ok(());
                }
                Err(e) => {
                    warn!("Model reload failed, retrying: {}", e);
                    self.shutdown
                        .sleep(self.config.timing.model_poll_interval())
                        .await?;
                }
            }
        }
    }

    async fn load_model(&self) -> MonitorResult<Box<dyn Model>> {
        let loader = Arc::clone(&self.loader);
        let path = self.config.model.path.clone();
        let model = tokio::task::spawn_blocking(move || loader.load(&path))
            .await
            .map_err(|e| MonitorError::Model(format!("model load task failed: {}", e)))??;

        let window_size = self.config.drift.window_size;
        if model.input_len() != window_size {
            return Err(MonitorError::Model(format!(
                "model expects {} inputs but the window size is {}",
                model.input_len(),
                window_size
            )));
        }
        Ok(model)
    }

    async fn enter(&mut self, state: OrchestratorState) {
        if self.state != state {
            debug!("Orchestrator: {} -> {}", self.state, state);
            self.state = state;
            if state != OrchestratorState::Scoring {
                self.persist().await;
            }
        }
    }

    async fn persist(&mut self) {
        let Some(path) = self.config.daemon.status_file.clone() else {
            return;
        };
        self.status.state = self.state;
        self.status.stats = self.stats.clone();
        self.status.updated_at = Utc::now();

        if let Err(e) = save_status(&path, &self.status).await {
            warn!("Failed to write status file {}: {:#}", path.display(), e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::predictor::FakeModelLoader;
    use crate::transport::fake::{FakeStatusRead, FakeStreamConnector};
    use crate::watcher::FakeArtifactClock;
    use crate::window_source::{FakeRead, FakeWindowSource};
    use drift_common::{Reading, UploadStatus};
    use std::time::Duration;
    use tempfile::TempDir;

    fn fast_config(dir: &TempDir) -> MonitorConfig {
        let mut config = MonitorConfig::default();
        config.evidence.output_path = dir.path().join("Clemap_train.csv");
        config.timing.observation_interval_ms = 1;
        config.timing.insufficient_data_backoff_ms = 1;
        config.timing.model_poll_interval_ms = 1;
        config.upload.read_timeout_ms = 5;
        config.upload.poll_backoff_ms = 1;
        config.evidence.sample_count = 5;
        config
    }

    struct Harness {
        dir: TempDir,
        source: Arc<FakeWindowSource>,
        loader: Arc<FakeModelLoader>,
        streams: FakeStreamConnector,
        clock: Arc<FakeArtifactClock>,
    }

    impl Harness {
        fn new(source: FakeWindowSource, loader: FakeModelLoader) -> Self {
            Self {
                dir: TempDir::new().unwrap(),
                source: Arc::new(source),
                loader: Arc::new(loader),
                streams: FakeStreamConnector::new(),
                clock: Arc::new(FakeArtifactClock::replaced_after(2)),
            }
        }

        fn config(&self) -> MonitorConfig {
            fast_config(&self.dir)
        }

        fn orchestrator(
            &self,
            config: MonitorConfig,
        ) -> (crate::shutdown::ShutdownHandle, Orchestrator) {
            let (handle, shutdown) = Shutdown::new();
            let parts = Collaborators {
                source: self.source.clone(),
                loader: self.loader.clone(),
                connector: Arc::new(self.streams.clone()),
                clock: self.clock.clone(),
            };
            (handle, Orchestrator::new(config, parts, shutdown))
        }
    }

    fn mean(w: &Window) -> f64 {
        w.sum() / w.len() as f64
    }

    #[tokio::test]
    async fn test_steady_cycles_never_upload() {
        let h = Harness::new(FakeWindowSource::steady(10, 2.0), FakeModelLoader::new(10, mean));
        let (_handle, mut orch) = h.orchestrator(h.config());

        let stats = orch.run_cycles(5).await.unwrap();
        assert_eq!(stats.cycles_scored, 5);
        assert_eq!(stats.drift_events, 0);
        assert_eq!(h.streams.connect_count(), 0);
        assert_eq!(h.loader.load_count(), 1);
        assert_eq!(orch.state(), OrchestratorState::Stopped);
    }

    #[tokio::test]
    async fn test_upload_failure_still_waits_for_new_model() {
        let h = Harness::new(
            FakeWindowSource::steady(10, 2.0),
            FakeModelLoader::new(10, |_| f64::NAN).then_load(mean),
        );
        h.streams.reveal(FakeStatusRead::events(&[(
            UploadStatus::Failure,
            "disk full",
        )]));
        let (_handle, mut orch) = h.orchestrator(h.config());

        let stats = orch.run_cycles(2).await.unwrap();
        assert_eq!(stats.drift_events, 1);
        assert_eq!(stats.uploads_failed, 1);
        assert_eq!(stats.model_reloads, 1);
        assert_eq!(stats.cycles_scored, 2);
        assert_eq!(h.loader.load_count(), 2);
        assert!(h.streams.is_closed());
    }

    #[tokio::test]
    async fn test_reload_retries_unusable_artifact() {
        let h = Harness::new(
            FakeWindowSource::steady(10, 2.0),
            FakeModelLoader::new(10, |_| 100.0)
                .then_load(mean)
                .fail_reload("truncated artifact"),
        );
        h.streams
            .reveal(FakeStatusRead::events(&[(UploadStatus::Success, "")]));
        let (_handle, mut orch) = h.orchestrator(h.config());

        let stats = orch.run_cycles(2).await.unwrap();
        assert_eq!(stats.uploads_succeeded, 1);
        assert_eq!(stats.model_reloads, 1);
        assert_eq!(h.loader.failed_load_count(), 1);
        assert_eq!(h.loader.load_count(), 2);
    }

    #[tokio::test]
    async fn test_initial_load_failure_is_fatal() {
        let h = Harness::new(
            FakeWindowSource::steady(10, 2.0),
            FakeModelLoader::new(10, mean).fail_next_load("no such file"),
        );
        let (_handle, mut orch) = h.orchestrator(h.config());

        assert!(matches!(orch.run_cycles(1).await, Err(MonitorError::Model(_))));
        assert_eq!(h.source.recent_calls(), 0);
    }

    #[tokio::test]
    async fn test_input_length_mismatch_is_fatal() {
        let h = Harness::new(FakeWindowSource::steady(10, 2.0), FakeModelLoader::new(5, mean));
        let (_handle, mut orch) = h.orchestrator(h.config());

        let err = orch.run_cycles(1).await.unwrap_err();
        assert!(err.to_string().contains("5 inputs"));
    }

    #[tokio::test]
    async fn test_store_errors_wait_without_scoring() {
        let source = FakeWindowSource::steady(10, 2.0);
        source.push_recent(FakeRead::Fail("database is locked".to_string()));
        source.push_latest(FakeRead::Rows(None));
        let h = Harness::new(source, FakeModelLoader::new(10, mean));
        let (_handle, mut orch) = h.orchestrator(h.config());

        let stats = orch.run_cycles(1).await.unwrap();
        assert_eq!(stats.insufficient_data_waits, 2);
        assert_eq!(stats.cycles_scored, 1);
    }

    #[tokio::test]
    async fn test_shutdown_while_awaiting_model() {
        let mut h = Harness::new(
            FakeWindowSource::steady(10, 2.0),
            FakeModelLoader::new(10, |_| f64::NAN),
        );
        h.clock = Arc::new(FakeArtifactClock::frozen());
        h.streams
            .reveal(FakeStatusRead::events(&[(UploadStatus::Success, "")]));
        let (handle, mut orch) = h.orchestrator(h.config());

        let task = tokio::spawn(async move {
            let stats = orch.run().await;
            (stats, orch.state())
        });
        tokio::time::sleep(Duration::from_millis(50)).await;
        handle.trigger();

        let (stats, state) = task.await.unwrap();
        let stats = stats.unwrap();
        assert_eq!(stats.uploads_succeeded, 1);
        assert_eq!(stats.model_reloads, 0);
        assert_eq!(state, OrchestratorState::Stopped);
    }

    #[tokio::test]
    async fn test_status_file_tracks_progress() {
        let source = FakeWindowSource::steady(10, 2.0);
        source.push_latest(FakeRead::Rows(Some(Reading::new("t", f64::NAN, 0.0, 0.0))));
        let h = Harness::new(source, FakeModelLoader::new(10, mean));
        let status_path = h.dir.path().join("status.json");
        let mut config = h.config();
        config.daemon.status_file = Some(status_path.clone());
        let (_handle, mut orch) = h.orchestrator(config);

        orch.run_cycles(3).await.unwrap();

        let status = crate::status::load_status(&status_path).await.unwrap().unwrap();
        assert_eq!(status.state, OrchestratorState::Stopped);
        assert_eq!(status.stats.skipped_cycles, 1);
        assert_eq!(status.stats.cycles_scored, 2);
        assert!(!status.last_verdict.unwrap().drifted);
    }

    #[tokio::test]
    async fn test_status_file_records_reload_before_next_cycle() {
        // Enough rows for the drift cycle and the evidence, then an empty store
        let source = FakeWindowSource::new(Vec::new());
        let rows: Vec<Reading> = (0..10)
            .map(|i| Reading::new(format!("t{}", i), 2.0, 0.0, 0.0))
            .collect();
        for _ in 0..6 {
            source.push_recent(FakeRead::Rows(rows.clone()));
        }
        source.push_latest(FakeRead::Rows(Some(rows[0].clone())));

        let h = Harness::new(source, FakeModelLoader::new(10, |_| f64::NAN).then_load(mean));
        h.streams
            .reveal(FakeStatusRead::events(&[(UploadStatus::Success, "")]));
        let status_path = h.dir.path().join("status.json");
        let mut config = h.config();
        config.daemon.status_file = Some(status_path.clone());
        config.timing.insufficient_data_backoff_ms = 60_000;
        let (handle, mut orch) = h.orchestrator(config);
        let task = tokio::spawn(async move { orch.run().await });

        // The loop is now parked on the empty store
        let mut reloads = 0;
        for _ in 0..400 {
            if let Ok(Some(status)) = crate::status::load_status(&status_path).await {
                reloads = status.stats.model_reloads;
                if reloads == 1 {
                    break;
                }
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        handle.trigger();
        task.await.unwrap().unwrap();

        assert_eq!(reloads, 1);
    }
}
