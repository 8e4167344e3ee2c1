//! Model Watcher - waits for the retraining pipeline to replace the model
//!
//! Polls the artifact's modification time; there is no push notification
//! and no timeout. A missing or unreadable artifact counts as "not yet
//! changed", since the pipeline may be halfway through replacing it.

use crate::shutdown::Shutdown;
use async_trait::async_trait;
use drift_common::{ModelArtifact, MonitorResult};
use std::io::ErrorKind;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::{debug, info, warn};

/// Reads an artifact's modification time
#[async_trait]
pub trait ArtifactClock: Send + Sync {
    /// `None` when the artifact is absent or its metadata cannot be read
    async fn modified(&self, path: &Path) -> Option<SystemTime>;
}

/// Filesystem metadata
#[derive(Debug, Default, Clone)]
pub struct FsArtifactClock;

#[async_trait]
impl ArtifactClock for FsArtifactClock {
    async fn modified(&self, path: &Path) -> Option<SystemTime> {
        match tokio::fs::metadata(path).await.and_then(|m| m.modified()) {
            Ok(time) => Some(time),
            Err(e) if e.kind() == ErrorKind::NotFound => None,
            Err(e) => {
                warn!("Cannot read modification time of {}: {}", path.display(), e);
                None
            }
        }
    }
}

pub struct ModelWatcher {
    clock: Arc<dyn ArtifactClock>,
    poll_interval: Duration,
    shutdown: Shutdown,
}

impl ModelWatcher {
    pub fn new(clock: Arc<dyn ArtifactClock>, poll_interval: Duration, shutdown: Shutdown) -> Self {
        Self {
            clock,
            poll_interval,
            shutdown,
        }
    }

    /// Current state of the artifact at `path`
    pub async fn snapshot(&self, path: &Path) -> ModelArtifact {
        ModelArtifact {
            path: path.to_path_buf(),
            modified: self.clock.modified(path).await,
        }
    }

    /// Block until the modification time of `path` differs from `previous`.
    ///
    /// Returns the number of polls it took. Only shutdown ends the wait early.
    pub async fn wait_for_update(
        &self,
        path: &Path,
        previous: Option<SystemTime>,
    ) -> MonitorResult<u32> {
        let mut polls = 0u32;

        loop {
            polls += 1;
            let current = self.clock.modified(path).await;
            if current.is_some() && current != previous {
                info!("Model artifact {} changed after {} polls", path.display(), polls);
                return Ok(polls);
            }

            debug!(polls, "Model artifact {} unchanged", path.display());
            self.shutdown.sleep(self.poll_interval).await?;
        }
    }
}

// ============================================================================
// Fake Artifact Clock (Testing)
// ============================================================================

#[derive(Default)]
struct FakeClockState {
    version: u64,
    reads_of_version: u32,
    reads: u32,
}

/// Simulates an artifact the retraining pipeline keeps replacing
///
/// Each version is seen by `stable_reads` reads; the next read sees a newer
/// modification time.
pub struct FakeArtifactClock {
    stable_reads: Option<u32>,
    state: Mutex<FakeClockState>,
}

impl FakeArtifactClock {
    /// Replaced once the current version has been read `stable_reads` times
    pub fn replaced_after(stable_reads: u32) -> Self {
        Self {
            stable_reads: Some(stable_reads.max(1)),
            state: Mutex::new(FakeClockState::default()),
        }
    }

    /// Never replaced
    pub fn frozen() -> Self {
        Self {
            stable_reads: None,
            state: Mutex::new(FakeClockState::default()),
        }
    }

    /// Total `modified` calls
    pub fn reads(&self) -> u32 {
        self.state.lock().unwrap().reads
    }

    /// Modification time of `version`
    pub fn time_of(version: u64) -> SystemTime {
        UNIX_EPOCH + Duration::from_secs(1_700_000_000 + version)
    }
}

#[async_trait]
impl ArtifactClock for FakeArtifactClock {
    async fn modified(&self, _path: &Path) -> Option<SystemTime> {
        let mut state = self.state.lock().unwrap();
        state.reads += 1;
        if let Some(stable) = self.stable_reads {
            if state.reads_of_version >= stable {
                state.version += 1;
                state.reads_of_version = 0;
            }
        }
        state.reads_of_version += 1;
        Some(Self::time_of(state.version))
    }
}
