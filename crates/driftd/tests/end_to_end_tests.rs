//! End-to-end drift response against real backends
//!
//! SQLite meter store, JSON model artifact, filesystem mtime watching and
//! the local stream manager. A background task plays the retraining
//! pipeline: it waits for the exported evidence and then replaces the model.

use drift_common::{MeterDb, MonitorConfig, OrchestratorState, Reading};
use driftd::predictor::LinearModel;
use driftd::shutdown::Shutdown;
use driftd::status::load_status;
use driftd::transport::{LocalStreamConnector, LocalStreamManager};
use driftd::watcher::FsArtifactClock;
use driftd::window_source::SqliteWindowSource;
use driftd::{Collaborators, Orchestrator};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tempfile::TempDir;

fn seed_store(path: &Path, count: usize) {
    let mut db = MeterDb::open_at(path).unwrap();
    let rows: Vec<Reading> = (0..count)
        .map(|i| Reading::new(format!("2024-05-01T10:{:02}:00", i), 0.5, 0.25, 0.25))
        .collect();
    db.record_readings(&rows).unwrap();
}

fn write_model(path: &Path, model: &LinearModel, modified: SystemTime) {
    std::fs::write(path, serde_json::to_string(model).unwrap()).unwrap();
    let file = std::fs::OpenOptions::new().write(true).open(path).unwrap();
    file.set_modified(modified).unwrap();
}

fn test_config(dir: &TempDir) -> MonitorConfig {
    let mut config = MonitorConfig::default();
    config.store.db_path = dir.path().join("data_gathering.db");
    config.model.path = dir.path().join("model.json");
    config.evidence.output_path = dir.path().join("Clemap_train.csv");
    config.evidence.sample_count = 20;
    config.upload.export_root = dir.path().join("export");
    config.upload.read_timeout_ms = 200;
    config.upload.poll_backoff_ms = 5;
    config.timing.observation_interval_ms = 5;
    config.timing.insufficient_data_backoff_ms = 5;
    config.timing.model_poll_interval_ms = 5;
    config.daemon.status_file = Some(dir.path().join("status.json"));
    config
}

fn exported_path(config: &MonitorConfig) -> PathBuf {
    config
        .upload
        .export_root
        .join(&config.upload.bucket)
        .join(&config.upload.key)
}

#[tokio::test]
async fn test_drift_upload_and_reload() {
    let dir = TempDir::new().unwrap();
    let config = test_config(&dir);
    seed_store(&config.store.db_path, 20);

    // Every reading aggregates to 1.0, so a window sums to 10.0
    let stale = LinearModel {
        input_len: 10,
        weights: vec![0.0; 10],
        bias: 50.0,
    };
    let retrained = LinearModel {
        input_len: 10,
        weights: vec![0.1; 10],
        bias: 0.0,
    };
    let deployed_at = SystemTime::now() - Duration::from_secs(3600);
    write_model(&config.model.path, &stale, deployed_at);

    // Retraining pipeline: replace the model once the evidence arrives
    let exported = exported_path(&config);
    let model_path = config.model.path.clone();
    let pipeline = tokio::spawn(async move {
        while !exported.exists() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        write_model(&model_path, &retrained, SystemTime::now());
    });

    let (_handle, shutdown) = Shutdown::new();
    let parts = Collaborators {
        source: Arc::new(SqliteWindowSource::new(&config.store.db_path)),
        loader: Arc::new(driftd::predictor::JsonModelLoader),
        connector: Arc::new(LocalStreamConnector::new(LocalStreamManager::new(
            &config.upload.export_root,
        ))),
        clock: Arc::new(FsArtifactClock),
    };
    let mut orchestrator = Orchestrator::new(config.clone(), parts, shutdown);

    let stats = tokio::time::timeout(Duration::from_secs(30), orchestrator.run_cycles(2))
        .await
        .expect("control loop finished")
        .unwrap();
    pipeline.await.unwrap();

    assert_eq!(stats.cycles_scored, 2);
    assert_eq!(stats.drift_events, 1);
    assert_eq!(stats.uploads_succeeded, 1);
    assert_eq!(stats.model_reloads, 1);

    let csv = std::fs::read_to_string(exported_path(&config)).unwrap();
    let mut lines = csv.lines();
    assert_eq!(lines.next(), Some("target"));
    let values: Vec<&str> = lines.collect();
    assert_eq!(values.len(), 20);
    assert!(values.iter().all(|v| *v == "10.000000"));

    let status = load_status(config.daemon.status_file.as_deref().unwrap())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(status.state, OrchestratorState::Stopped);
    assert!(status.last_upload.unwrap().outcome.is_success());
    assert!(!status.last_verdict.unwrap().drifted);
}

#[tokio::test]
async fn test_waits_for_store_to_fill() {
    let dir = TempDir::new().unwrap();
    let mut config = test_config(&dir);
    config.daemon.status_file = None;
    seed_store(&config.store.db_path, 4);

    let model = LinearModel {
        input_len: 10,
        weights: vec![0.1; 10],
        bias: 0.0,
    };
    write_model(&config.model.path, &model, SystemTime::now());

    // The gatherer keeps writing while the monitor waits
    let db_path = config.store.db_path.clone();
    let gatherer = tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(30)).await;
        let db = MeterDb::open_at(&db_path).unwrap();
        for i in 4..12 {
            db.record_reading(&Reading::new(format!("2024-05-01T10:{:02}:00", i), 0.5, 0.25, 0.25))
                .unwrap();
        }
    });

    let (_handle, shutdown) = Shutdown::new();
    let parts = Collaborators {
        source: Arc::new(SqliteWindowSource::new(&config.store.db_path)),
        loader: Arc::new(driftd::predictor::JsonModelLoader),
        connector: Arc::new(LocalStreamConnector::new(LocalStreamManager::new(
            &config.upload.export_root,
        ))),
        clock: Arc::new(FsArtifactClock),
    };
    let mut orchestrator = Orchestrator::new(config, parts, shutdown);

    let stats = tokio::time::timeout(Duration::from_secs(30), orchestrator.run_cycles(1))
        .await
        .expect("control loop finished")
        .unwrap();
    gatherer.await.unwrap();

    assert!(stats.insufficient_data_waits >= 1);
    assert_eq!(stats.cycles_scored, 1);
    assert_eq!(stats.drift_events, 0);
}

#[tokio::test]
async fn test_missing_model_aborts_startup() {
    let dir = TempDir::new().unwrap();
    let config = test_config(&dir);
    seed_store(&config.store.db_path, 20);

    let (_handle, shutdown) = Shutdown::new();
    let parts = Collaborators {
        source: Arc::new(SqliteWindowSource::new(&config.store.db_path)),
        loader: Arc::new(driftd::predictor::JsonModelLoader),
        connector: Arc::new(LocalStreamConnector::new(LocalStreamManager::new(
            &config.upload.export_root,
        ))),
        clock: Arc::new(FsArtifactClock),
    };
    let mut orchestrator = Orchestrator::new(config, parts, shutdown);

    assert!(orchestrator.run_cycles(1).await.is_err());
}
