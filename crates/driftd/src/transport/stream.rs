//! Stream Client Abstraction
//!
//! The upload protocol talks to a stream service through named message
//! streams:
//! - a data stream whose export definition turns every appended
//!   `UploadTask` into a transfer to the destination store
//! - a status stream on which the exporter reports transfer progress
//!
//! This module defines the client seam (`StreamClient`, `StreamConnector`),
//! the stream definitions and the status payload format. `ScopedClient`
//! closes its client on drop, so every exit path releases the connection.

use async_trait::async_trait;
use drift_common::{StatusEvent, UploadStatus, UploadTask};
use serde::{Deserialize, Serialize};
use std::ops::Deref;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

// ============================================================================
// Errors
// ============================================================================

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StreamError {
    #[error("Stream not found: {0}")]
    NotFound(String),

    #[error("Stream transport error: {0}")]
    Transport(String),

    #[error("Read timed out: {0}")]
    ReadTimeout(String),

    #[error("Stream protocol error: {0}")]
    Protocol(String),

    #[error("Stream client is closed")]
    Closed,
}

impl StreamError {
    /// Failures of the connection itself; the status poll retries these.
    pub fn is_transport_level(&self) -> bool {
        matches!(self, StreamError::Transport(_) | StreamError::ReadTimeout(_))
    }
}

/// Result of deleting a stream that may or may not exist
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeleteOutcome {
    Deleted,
    NotFound,
}

// ============================================================================
// Stream definitions
// ============================================================================

/// What a full stream does with new messages
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StrategyOnFull {
    OverwriteOldestData,
    RejectNewData,
}

/// Verbosity of export status reporting
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum StatusLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

/// Where an exporter reports task statuses
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusConfig {
    pub status_level: StatusLevel,
    pub status_stream_name: String,
}

/// Export of appended `UploadTask`s to the destination store
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExportDefinition {
    pub identifier: String,
    pub status_config: Option<StatusConfig>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageStreamDefinition {
    pub name: String,
    pub strategy_on_full: StrategyOnFull,
    pub max_messages: Option<usize>,
    pub export_definition: Option<ExportDefinition>,
}

impl MessageStreamDefinition {
    /// Plain stream that drops its oldest message when full
    pub fn overwrite_oldest(name: &str) -> Self {
        Self {
            name: name.to_string(),
            strategy_on_full: StrategyOnFull::OverwriteOldestData,
            max_messages: None,
            export_definition: None,
        }
    }

    pub fn with_max_messages(mut self, max_messages: usize) -> Self {
        self.max_messages = Some(max_messages);
        self
    }

    /// Export appended tasks, reporting every status to `status_stream`
    pub fn exporting_to(mut self, status_stream: &str) -> Self {
        self.export_definition = Some(ExportDefinition {
            identifier: format!("S3TaskExecutor{}", self.name),
            status_config: Some(StatusConfig {
                status_level: StatusLevel::Info,
                status_stream_name: status_stream.to_string(),
            }),
        });
        self
    }
}

// ============================================================================
// Messages
// ============================================================================

/// Options for one status read
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadMessagesOptions {
    pub desired_start_sequence_number: u64,
    pub min_message_count: usize,
    pub max_message_count: Option<usize>,
    pub read_timeout: Duration,
}

impl ReadMessagesOptions {
    pub fn from_cursor(cursor: u64, read_timeout: Duration) -> Self {
        Self {
            desired_start_sequence_number: cursor,
            min_message_count: 1,
            max_message_count: None,
            read_timeout,
        }
    }
}

/// A message as stored in a stream
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub stream_name: String,
    pub sequence_number: u64,
    pub ingest_time_ms: i64,
    pub payload: Vec<u8>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventType {
    S3Task,
}

/// Which task a status message is about
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusContext {
    pub s3_export_task_definition: Option<UploadTask>,
    pub export_identifier: Option<String>,
    pub stream_name: Option<String>,
    pub sequence_number: Option<u64>,
}

/// Payload of a status stream message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusMessage {
    pub event_type: EventType,
    pub status_level: StatusLevel,
    pub status: UploadStatus,
    #[serde(default)]
    pub status_context: Option<StatusContext>,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub timestamp_epoch_ms: i64,
}

impl StatusMessage {
    pub fn new(status: UploadStatus, message: &str) -> Self {
        Self {
            event_type: EventType::S3Task,
            status_level: match status {
                UploadStatus::Failure => StatusLevel::Error,
                UploadStatus::Canceled => StatusLevel::Warn,
                _ => StatusLevel::Info,
            },
            status,
            status_context: None,
            message: message.to_string(),
            timestamp_epoch_ms: chrono::Utc::now().timestamp_millis(),
        }
    }

    pub fn with_context(mut self, context: StatusContext) -> Self {
        self.status_context = Some(context);
        self
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, StreamError> {
        serde_json::to_vec(self).map_err(|e| StreamError::Protocol(e.to_string()))
    }

    /// Decode a status stream message into a positioned event
    pub fn decode(message: &Message) -> Result<StatusEvent, StreamError> {
        let status: StatusMessage = serde_json::from_slice(&message.payload).map_err(|e| {
            StreamError::Protocol(format!(
                "undecodable status at sequence {}: {}",
                message.sequence_number, e
            ))
        })?;
        Ok(StatusEvent {
            sequence_number: message.sequence_number,
            outcome: status.status,
            message: status.message,
        })
    }
}

// ============================================================================
// Client traits
// ============================================================================

/// Connection to a stream service
#[async_trait]
pub trait StreamClient: Send + Sync {
    /// Delete a stream; a missing stream is `DeleteOutcome::NotFound`, not an error
    async fn delete_message_stream(&self, name: &str) -> Result<DeleteOutcome, StreamError>;

    async fn create_message_stream(
        &self,
        definition: &MessageStreamDefinition,
    ) -> Result<(), StreamError>;

    /// Append a payload, returning its sequence number
    async fn append_message(&self, stream: &str, payload: &[u8]) -> Result<u64, StreamError>;

    /// Read messages starting at `options.desired_start_sequence_number`
    ///
    /// Waits up to `read_timeout` for `min_message_count` messages and fails
    /// with `StreamError::ReadTimeout` if they do not arrive.
    async fn read_messages(
        &self,
        stream: &str,
        options: &ReadMessagesOptions,
    ) -> Result<Vec<Message>, StreamError>;

    /// Release the connection. Later calls fail with `StreamError::Closed`.
    fn close(&self);
}

/// Opens stream clients
#[async_trait]
pub trait StreamConnector: Send + Sync {
    async fn connect(&self) -> Result<Box<dyn StreamClient>, StreamError>;
}

/// Owns a client for one upload attempt and closes it when dropped
pub struct ScopedClient {
    inner: Box<dyn StreamClient>,
}

impl ScopedClient {
    pub fn new(inner: Box<dyn StreamClient>) -> Self {
        Self { inner }
    }
}

impl Deref for ScopedClient {
    type Target = dyn StreamClient;

    fn deref(&self) -> &Self::Target {
        self.inner.as_ref()
    }
}

impl Drop for ScopedClient {
    fn drop(&mut self) {
        self.inner.close();
        debug!("Stream client closed");
    }
}
