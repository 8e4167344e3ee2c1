//! Fake stream service for protocol tests.
//!
//! Records every client call and serves a scripted status stream: each read
//! first applies the next queued `FakeStatusRead`, then answers from the
//! accumulated status log like a real stream would.

use super::stream::{
    DeleteOutcome, Message, MessageStreamDefinition, ReadMessagesOptions, StatusMessage,
    StreamClient, StreamConnector, StreamError,
};
use async_trait::async_trait;
use drift_common::{UploadStatus, UploadTask};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

/// What happens to the status stream on the next read
#[derive(Debug, Clone)]
pub enum FakeStatusRead {
    /// Append these statuses, then answer the read
    Events(Vec<(UploadStatus, String)>),
    /// Append an arbitrary payload, then answer the read
    Raw(Vec<u8>),
    /// Fail this read
    Error(StreamError),
    /// Append nothing, then answer the read
    Nothing,
}

impl FakeStatusRead {
    pub fn events(events: &[(UploadStatus, &str)]) -> Self {
        FakeStatusRead::Events(
            events
                .iter()
                .map(|(status, msg)| (*status, msg.to_string()))
                .collect(),
        )
    }
}

#[derive(Default)]
struct FakeState {
    calls: Vec<String>,
    read_starts: Vec<u64>,
    created: Vec<MessageStreamDefinition>,
    appended: Vec<UploadTask>,
    status_log: Vec<Vec<u8>>,
    reveals: VecDeque<FakeStatusRead>,
    connect_error: Option<StreamError>,
    delete_error: Option<StreamError>,
    streams_missing: bool,
    connects: usize,
    closed: bool,
}

/// Cloneable handle; clones share the same recorded state
#[derive(Clone, Default)]
pub struct FakeStreamConnector {
    state: Arc<Mutex<FakeState>>,
}

impl FakeStreamConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a status-stream step for the next read
    pub fn reveal(&self, read: FakeStatusRead) {
        self.state.lock().unwrap().reveals.push_back(read);
    }

    pub fn fail_connect(&self, err: StreamError) {
        self.state.lock().unwrap().connect_error = Some(err);
    }

    /// Fail the next delete call
    pub fn fail_delete(&self, err: StreamError) {
        self.state.lock().unwrap().delete_error = Some(err);
    }

    /// Report both streams as absent when deleted
    pub fn mark_streams_missing(&self) {
        self.state.lock().unwrap().streams_missing = true;
    }

    pub fn calls(&self) -> Vec<String> {
        self.state.lock().unwrap().calls.clone()
    }

    /// Start sequence number of every status read, in order
    pub fn read_starts(&self) -> Vec<u64> {
        self.state.lock().unwrap().read_starts.clone()
    }

    pub fn created_streams(&self) -> Vec<MessageStreamDefinition> {
        self.state.lock().unwrap().created.clone()
    }

    pub fn appended_tasks(&self) -> Vec<UploadTask> {
        self.state.lock().unwrap().appended.clone()
    }

    pub fn connect_count(&self) -> usize {
        self.state.lock().unwrap().connects
    }

    /// Whether the last client handed out has been closed
    pub fn is_closed(&self) -> bool {
        self.state.lock().unwrap().closed
    }
}

#[async_trait]
impl StreamConnector for FakeStreamConnector {
    async fn connect(&self) -> Result<Box<dyn StreamClient>, StreamError> {
        let mut state = self.state.lock().unwrap();
        if let Some(err) = state.connect_error.clone() {
            return Err(err);
        }
        state.connects += 1;
        state.closed = false;
        Ok(Box::new(FakeStreamClient {
            state: Arc::clone(&self.state),
        }))
    }
}

struct FakeStreamClient {
    state: Arc<Mutex<FakeState>>,
}

#[async_trait]
impl StreamClient for FakeStreamClient {
    async fn delete_message_stream(&self, name: &str) -> Result<DeleteOutcome, StreamError> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(format!("delete:{}", name));
        if let Some(err) = state.delete_error.take() {
            return Err(err);
        }
        if state.streams_missing {
            return Ok(DeleteOutcome::NotFound);
        }
        Ok(DeleteOutcome::Deleted)
    }

    async fn create_message_stream(
        &self,
        definition: &MessageStreamDefinition,
    ) -> Result<(), StreamError> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(format!("create:{}", definition.name));
        state.created.push(definition.clone());
        Ok(())
    }

    async fn append_message(&self, stream: &str, payload: &[u8]) -> Result<u64, StreamError> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(format!("append:{}", stream));
        let task: UploadTask =
            serde_json::from_slice(payload).map_err(|e| StreamError::Protocol(e.to_string()))?;
        state.appended.push(task);
        Ok(state.appended.len() as u64 - 1)
    }

    async fn read_messages(
        &self,
        stream: &str,
        options: &ReadMessagesOptions,
    ) -> Result<Vec<Message>, StreamError> {
        let mut state = self.state.lock().unwrap();
        let start = options.desired_start_sequence_number;
        state
            .calls
            .push(format!("read:{}@{}", stream, start));
        state.read_starts.push(start);

        match state.reveals.pop_front() {
            Some(FakeStatusRead::Events(events)) => {
                for (status, msg) in events {
                    let payload = StatusMessage::new(status, &msg).to_bytes()?;
                    state.status_log.push(payload);
                }
            }
            Some(FakeStatusRead::Raw(payload)) => state.status_log.push(payload),
            Some(FakeStatusRead::Error(err)) => return Err(err),
            Some(FakeStatusRead::Nothing) | None => {}
        }

        let messages: Vec<Message> = state
            .status_log
            .iter()
            .enumerate()
            .skip(start as usize)
            .map(|(seq, payload)| Message {
                stream_name: stream.to_string(),
                sequence_number: seq as u64,
                ingest_time_ms: 0,
                payload: payload.clone(),
            })
            .collect();

        if messages.len() < options.min_message_count {
            return Err(StreamError::ReadTimeout(format!(
                "no status at or after sequence {}",
                start
            )));
        }
        Ok(messages)
    }

    fn close(&self) {
        let mut state = self.state.lock().unwrap();
        state.calls.push("close".to_string());
        state.closed = true;
    }
}
