//! Upload Transport - submit evidence and wait for the export outcome
//!
//! One upload runs this state machine over a freshly connected client:
//!
//! ```text
//! INIT ──► CHANNELS_READY ──► TASK_SUBMITTED ──► POLLING ──► DONE_SUCCESS
//!                                                   │  ▲
//!                                                   │  └─ InProgress / no terminal event
//!                                                   └────► DONE_FAILURE
//! ```
//!
//! - INIT deletes any old data and status streams ("not found" is fine)
//! - CHANNELS_READY creates the status stream, then the exporting data stream
//! - TASK_SUBMITTED appends the `UploadTask`
//! - POLLING reads the status stream from a cursor that only moves forward
//!
//! Transport-level read failures are retried after the poll backoff. Every
//! other failure ends the upload. The client is closed on every exit path.

use super::stream::{
    DeleteOutcome, MessageStreamDefinition, ReadMessagesOptions, ScopedClient, StatusMessage,
    StreamConnector, StreamError,
};
use crate::shutdown::Shutdown;
use drift_common::config::UploadConfig;
use drift_common::{UploadOutcome, UploadStatus, UploadTask};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, error, info, warn};

#[derive(Error, Debug)]
enum UploadError {
    #[error(transparent)]
    Stream(#[from] StreamError),

    #[error("cannot encode upload task: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("cancelled")]
    Cancelled,
}

/// Protocol position of an upload attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UploadState {
    Init,
    ChannelsReady,
    TaskSubmitted,
    Polling { cursor: u64 },
    DoneSuccess,
    DoneFailure(String),
}

/// Stream names and cadence for the protocol
#[derive(Debug, Clone)]
pub struct UploadSettings {
    pub data_stream: String,
    pub status_stream: String,
    pub read_timeout: Duration,
    pub poll_backoff: Duration,
    pub max_messages: Option<usize>,
}

impl UploadSettings {
    pub fn from_config(config: &UploadConfig) -> Self {
        Self {
            data_stream: config.data_stream.clone(),
            status_stream: config.status_stream.clone(),
            read_timeout: Duration::from_millis(config.read_timeout_ms),
            poll_backoff: Duration::from_millis(config.poll_backoff_ms),
            max_messages: Some(config.stream_max_messages),
        }
    }
}

pub struct UploadTransport {
    connector: Arc<dyn StreamConnector>,
    settings: UploadSettings,
    shutdown: Shutdown,
}

impl UploadTransport {
    pub fn new(
        connector: Arc<dyn StreamConnector>,
        settings: UploadSettings,
        shutdown: Shutdown,
    ) -> Self {
        Self {
            connector,
            settings,
            shutdown,
        }
    }

    /// Upload the file at `source` to `bucket`/`key` and wait for the outcome.
    pub async fn upload(&self, source: &Path, bucket: &str, key: &str) -> UploadOutcome {
        let task = UploadTask::from_local_path(source, bucket, key);
        self.upload_task(&task).await
    }

    pub async fn upload_task(&self, task: &UploadTask) -> UploadOutcome {
        let client = match self.connector.connect().await {
            Ok(inner) => ScopedClient::new(inner),
            Err(e) => {
                error!("Cannot connect to stream service: {}", e);
                return UploadOutcome::Failure(e.to_string());
            }
        };

        let result = self.drive(&client, task).await;
        drop(client);

        match result {
            Ok(UploadState::DoneSuccess) => {
                info!(
                    "Successfully uploaded file at {} to {}/{}",
                    task.input_url, task.bucket, task.key
                );
                UploadOutcome::Success
            }
            Ok(UploadState::DoneFailure(reason)) => {
                warn!("Unable to upload file at {}: {}", task.input_url, reason);
                UploadOutcome::Failure(reason)
            }
            Ok(other) => {
                // drive only returns terminal states
                error!("Upload stopped in non-terminal state {:?}", other);
                UploadOutcome::Failure(format!("upload stopped in state {:?}", other))
            }
            Err(UploadError::Cancelled) => {
                info!("Upload of {} cancelled by shutdown", task.input_url);
                UploadOutcome::Failure("cancelled".to_string())
            }
            Err(e) => {
                error!("Upload of {} aborted: {}", task.input_url, e);
                UploadOutcome::Failure(e.to_string())
            }
        }
    }

    async fn drive(
        &self,
        client: &ScopedClient,
        task: &UploadTask,
    ) -> Result<UploadState, UploadError> {
        let mut state = UploadState::Init;

        loop {
            debug!("Upload state: {:?}", state);
            state = match state {
                UploadState::Init => {
                    self.reset_stream(client, &self.settings.status_stream).await?;
                    self.reset_stream(client, &self.settings.data_stream).await?;
                    UploadState::ChannelsReady
                }
                UploadState::ChannelsReady => {
                    self.create_streams(client).await?;
                    UploadState::TaskSubmitted
                }
                UploadState::TaskSubmitted => {
                    let payload = serde_json::to_vec(task)?;
                    let seq = client
                        .append_message(&self.settings.data_stream, &payload)
                        .await?;
                    info!(
                        "Appended upload task to stream {} with sequence number {}",
                        self.settings.data_stream, seq
                    );
                    UploadState::Polling { cursor: 0 }
                }
                UploadState::Polling { cursor } => self.poll_once(client, cursor).await?,
                done @ (UploadState::DoneSuccess | UploadState::DoneFailure(_)) => return Ok(done),
            };
        }
    }

    async fn reset_stream(&self, client: &ScopedClient, name: &str) -> Result<(), UploadError> {
        match client.delete_message_stream(name).await? {
            DeleteOutcome::Deleted => debug!("Deleted existing stream {}", name),
            DeleteOutcome::NotFound => debug!("Stream {} did not exist", name),
        }
        Ok(())
    }

    async fn create_streams(&self, client: &ScopedClient) -> Result<(), UploadError> {
        // The status stream must exist before an export definition points at it
        let mut status = MessageStreamDefinition::overwrite_oldest(&self.settings.status_stream);
        let mut data = MessageStreamDefinition::overwrite_oldest(&self.settings.data_stream)
            .exporting_to(&self.settings.status_stream);
        if let Some(max) = self.settings.max_messages {
            status = status.with_max_messages(max);
            data = data.with_max_messages(max);
        }

        client.create_message_stream(&status).await?;
        client.create_message_stream(&data).await?;
        Ok(())
    }

    /// One read of the status stream plus the backoff if nothing was terminal.
    async fn poll_once(
        &self,
        client: &ScopedClient,
        cursor: u64,
    ) -> Result<UploadState, UploadError> {
        let options = ReadMessagesOptions::from_cursor(cursor, self.settings.read_timeout);
        let mut next_cursor = cursor;

        match client
            .read_messages(&self.settings.status_stream, &options)
            .await
        {
            Ok(messages) => {
                for message in &messages {
                    if message.sequence_number < next_cursor {
                        continue;
                    }
                    let event = StatusMessage::decode(message)?;
                    if event.outcome.is_terminal() {
                        return Ok(match event.outcome {
                            UploadStatus::Success => UploadState::DoneSuccess,
                            _ => UploadState::DoneFailure(event.message),
                        });
                    }
                    info!(
                        "File upload is in progress (status sequence {})",
                        event.sequence_number
                    );
                    next_cursor = event.sequence_number + 1;
                }
            }
            Err(e) if e.is_transport_level() => {
                warn!(cursor, "Status read failed, retrying: {}", e);
            }
            Err(e) => return Err(e.into()),
        }

        self.shutdown
            .sleep(self.settings.poll_backoff)
            .await
            .map_err(|_| UploadError::Cancelled)?;
        Ok(UploadState::Polling { cursor: next_cursor })
    }
}
