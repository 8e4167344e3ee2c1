//! Local Stream Manager
//!
//! In-process stream service for devices without a remote stream daemon, and
//! for end-to-end tests. It implements the same contract the upload
//! transport relies on:
//! - bounded streams with overwrite-oldest (or reject-new) on full
//! - per-stream sequence numbers, restarting at 0 when a stream is recreated
//! - export-on-append: an `UploadTask` appended to an exporting stream is
//!   copied to `<export_root>/<bucket>/<key>`, with `InProgress` and then
//!   `Success`/`Failure` reported on the configured status stream

use super::stream::{
    DeleteOutcome, Message, MessageStreamDefinition, ReadMessagesOptions, StatusContext,
    StatusMessage, StrategyOnFull, StreamClient, StreamConnector, StreamError,
};
use async_trait::async_trait;
use drift_common::{UploadStatus, UploadTask};
use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::Notify;
use tracing::{debug, info, warn};

/// Capacity used when a definition does not set one
pub const DEFAULT_MAX_MESSAGES: usize = 1_024;

struct LocalStream {
    definition: MessageStreamDefinition,
    messages: VecDeque<Message>,
    next_sequence: u64,
}

impl LocalStream {
    fn new(definition: MessageStreamDefinition) -> Self {
        Self {
            definition,
            messages: VecDeque::new(),
            next_sequence: 0,
        }
    }

    fn push(&mut self, payload: Vec<u8>) -> Result<u64, StreamError> {
        let capacity = self.definition.max_messages.unwrap_or(DEFAULT_MAX_MESSAGES);
        if self.messages.len() >= capacity {
            match self.definition.strategy_on_full {
                StrategyOnFull::OverwriteOldestData => {
                    self.messages.pop_front();
                }
                StrategyOnFull::RejectNewData => {
                    return Err(StreamError::Protocol(format!(
                        "stream {} is full",
                        self.definition.name
                    )));
                }
            }
        }

        let sequence_number = self.next_sequence;
        self.next_sequence += 1;
        self.messages.push_back(Message {
            stream_name: self.definition.name.clone(),
            sequence_number,
            ingest_time_ms: chrono::Utc::now().timestamp_millis(),
            payload,
        });
        Ok(sequence_number)
    }
}

#[derive(Default)]
struct Streams {
    by_name: HashMap<String, LocalStream>,
}

/// Shared stream service; clones refer to the same streams
#[derive(Clone)]
pub struct LocalStreamManager {
    streams: Arc<Mutex<Streams>>,
    appended: Arc<Notify>,
    export_root: PathBuf,
}

impl LocalStreamManager {
    pub fn new(export_root: impl Into<PathBuf>) -> Self {
        Self {
            streams: Arc::new(Mutex::new(Streams::default())),
            appended: Arc::new(Notify::new()),
            export_root: export_root.into(),
        }
    }

    /// Names of the streams that currently exist
    pub fn stream_names(&self) -> Vec<String> {
        let streams = self.lock();
        let mut names: Vec<String> = streams.by_name.keys().cloned().collect();
        names.sort();
        names
    }

    /// Number of retained messages in `stream`
    pub fn message_count(&self, stream: &str) -> Option<usize> {
        self.lock().by_name.get(stream).map(|s| s.messages.len())
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Streams> {
        // A panic while holding the lock leaves plain data behind; keep serving it
        self.streams.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn delete(&self, name: &str) -> DeleteOutcome {
        match self.lock().by_name.remove(name) {
            Some(_) => DeleteOutcome::Deleted,
            None => DeleteOutcome::NotFound,
        }
    }

    fn create(&self, definition: &MessageStreamDefinition) -> Result<(), StreamError> {
        let mut streams = self.lock();
        if streams.by_name.contains_key(&definition.name) {
            return Err(StreamError::Protocol(format!(
                "stream {} already exists",
                definition.name
            )));
        }
        if let Some(status) = definition
            .export_definition
            .as_ref()
            .and_then(|e| e.status_config.as_ref())
        {
            if !streams.by_name.contains_key(&status.status_stream_name) {
                return Err(StreamError::NotFound(status.status_stream_name.clone()));
            }
        }
        streams
            .by_name
            .insert(definition.name.clone(), LocalStream::new(definition.clone()));
        debug!("Created local stream {}", definition.name);
        Ok(())
    }

    fn append(&self, stream: &str, payload: Vec<u8>) -> Result<u64, StreamError> {
        let (sequence_number, export) = {
            let mut streams = self.lock();
            let target = streams
                .by_name
                .get_mut(stream)
                .ok_or_else(|| StreamError::NotFound(stream.to_string()))?;

            let export = match &target.definition.export_definition {
                Some(export) => {
                    let task: UploadTask = serde_json::from_slice(&payload).map_err(|e| {
                        StreamError::Protocol(format!("not an upload task: {}", e))
                    })?;
                    let status_stream = export
                        .status_config
                        .as_ref()
                        .map(|s| s.status_stream_name.clone());
                    Some((task, export.identifier.clone(), status_stream))
                }
                None => None,
            };

            (target.push(payload)?, export)
        };
        self.appended.notify_waiters();

        if let Some((task, identifier, status_stream)) = export {
            let manager = self.clone();
            let context = StatusContext {
                s3_export_task_definition: Some(task.clone()),
                export_identifier: Some(identifier),
                stream_name: Some(stream.to_string()),
                sequence_number: Some(sequence_number),
            };
            tokio::spawn(async move {
                manager.export(task, context, status_stream).await;
            });
        }

        Ok(sequence_number)
    }

    async fn export(
        &self,
        task: UploadTask,
        context: StatusContext,
        status_stream: Option<String>,
    ) {
        self.report(status_stream.as_deref(), UploadStatus::InProgress, "", &context);

        match self.copy_to_bucket(&task).await {
            Ok(dest) => {
                info!("Exported {} to {}", task.input_url, dest.display());
                self.report(status_stream.as_deref(), UploadStatus::Success, "", &context);
            }
            Err(reason) => {
                warn!("Export of {} failed: {}", task.input_url, reason);
                self.report(status_stream.as_deref(), UploadStatus::Failure, &reason, &context);
            }
        }
    }

    async fn copy_to_bucket(&self, task: &UploadTask) -> Result<PathBuf, String> {
        let source = task
            .local_path()
            .ok_or_else(|| format!("unsupported input url {}", task.input_url))?;
        if task.key.split('/').any(|part| part == "..") {
            return Err(format!("invalid key {}", task.key));
        }

        let dest = self.export_root.join(&task.bucket).join(&task.key);
        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| e.to_string())?;
        }
        tokio::fs::copy(&source, &dest)
            .await
            .map_err(|e| format!("{}: {}", source.display(), e))?;
        Ok(dest)
    }

    fn report(
        &self,
        status_stream: Option<&str>,
        status: UploadStatus,
        message: &str,
        context: &StatusContext,
    ) {
        let Some(stream) = status_stream else {
            return;
        };
        let payload = match StatusMessage::new(status, message)
            .with_context(context.clone())
            .to_bytes()
        {
            Ok(payload) => payload,
            Err(e) => {
                warn!("Cannot encode export status: {}", e);
                return;
            }
        };
        let pushed = {
            let mut streams = self.lock();
            match streams.by_name.get_mut(stream) {
                Some(target) => target.push(payload),
                None => Err(StreamError::NotFound(stream.to_string())),
            }
        };
        match pushed {
            Ok(_) => self.appended.notify_waiters(),
            Err(e) => warn!("Dropping {:?} status for stream {}: {}", status, stream, e),
        }
    }

    fn collect(
        &self,
        stream: &str,
        options: &ReadMessagesOptions,
    ) -> Result<Vec<Message>, StreamError> {
        let streams = self.lock();
        let source = streams
            .by_name
            .get(stream)
            .ok_or_else(|| StreamError::NotFound(stream.to_string()))?;
        let limit = options.max_message_count.unwrap_or(usize::MAX);
        Ok(source
            .messages
            .iter()
            .filter(|m| m.sequence_number >= options.desired_start_sequence_number)
            .take(limit)
            .cloned()
            .collect())
    }

    async fn read(
        &self,
        stream: &str,
        options: &ReadMessagesOptions,
    ) -> Result<Vec<Message>, StreamError> {
        let deadline = tokio::time::Instant::now() + options.read_timeout;

        loop {
            // Register for wakeups before looking, so an append in between is not missed
            let notified = self.appended.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let messages = self.collect(stream, options)?;
            if messages.len() >= options.min_message_count {
                return Ok(messages);
            }

            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Err(StreamError::ReadTimeout(format!(
                    "{} message(s) from sequence {} not available within {:?}",
                    options.min_message_count,
                    options.desired_start_sequence_number,
                    options.read_timeout
                )));
            }
        }
    }
}

/// Hands out clients bound to one `LocalStreamManager`
#[derive(Clone)]
pub struct LocalStreamConnector {
    manager: LocalStreamManager,
}

impl LocalStreamConnector {
    pub fn new(manager: LocalStreamManager) -> Self {
        Self { manager }
    }
}

#[async_trait]
impl StreamConnector for LocalStreamConnector {
    async fn connect(&self) -> Result<Box<dyn StreamClient>, StreamError> {
        Ok(Box::new(LocalStreamClient {
            manager: self.manager.clone(),
            closed: AtomicBool::new(false),
        }))
    }
}

struct LocalStreamClient {
    manager: LocalStreamManager,
    closed: AtomicBool,
}

impl LocalStreamClient {
    fn ensure_open(&self) -> Result<(), StreamError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(StreamError::Closed);
        }
        Ok(())
    }
}

#[async_trait]
impl StreamClient for LocalStreamClient {
    async fn delete_message_stream(&self, name: &str) -> Result<DeleteOutcome, StreamError> {
        self.ensure_open()?;
        Ok(self.manager.delete(name))
    }

    async fn create_message_stream(
        &self,
        definition: &MessageStreamDefinition,
    ) -> Result<(), StreamError> {
        self.ensure_open()?;
        self.manager.create(definition)
    }

    async fn append_message(&self, stream: &str, payload: &[u8]) -> Result<u64, StreamError> {
        self.ensure_open()?;
        self.manager.append(stream, payload.to_vec())
    }

    async fn read_messages(
        &self,
        stream: &str,
        options: &ReadMessagesOptions,
    ) -> Result<Vec<Message>, StreamError> {
        self.ensure_open()?;
        self.manager.read(stream, options).await
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tempfile::TempDir;

    async fn client(manager: &LocalStreamManager) -> Box<dyn StreamClient> {
        LocalStreamConnector::new(manager.clone()).connect().await.unwrap()
    }

    #[tokio::test]
    async fn test_delete_missing_stream_is_not_found() {
        let dir = TempDir::new().unwrap();
        let manager = LocalStreamManager::new(dir.path());
        let c = client(&manager).await;

        assert_eq!(c.delete_message_stream("absent").await.unwrap(), DeleteOutcome::NotFound);
        c.create_message_stream(&MessageStreamDefinition::overwrite_oldest("s"))
            .await
            .unwrap();
        assert_eq!(c.delete_message_stream("s").await.unwrap(), DeleteOutcome::Deleted);
    }

    #[tokio::test]
    async fn test_overwrite_oldest_keeps_sequence_numbers() {
        let dir = TempDir::new().unwrap();
        let manager = LocalStreamManager::new(dir.path());
        let c = client(&manager).await;
        let definition = MessageStreamDefinition::overwrite_oldest("s").with_max_messages(3);
        c.create_message_stream(&definition).await.unwrap();

        for i in 0..5u8 {
            assert_eq!(c.append_message("s", &[i]).await.unwrap(), i as u64);
        }
        assert_eq!(manager.message_count("s"), Some(3));

        let read = c
            .read_messages("s", &ReadMessagesOptions::from_cursor(0, Duration::from_millis(10)))
            .await
            .unwrap();
        let seqs: Vec<u64> = read.iter().map(|m| m.sequence_number).collect();
        assert_eq!(seqs, vec![2, 3, 4]);
    }

    #[tokio::test]
    async fn test_recreated_stream_restarts_at_zero() {
        let dir = TempDir::new().unwrap();
        let manager = LocalStreamManager::new(dir.path());
        let c = client(&manager).await;
        let def = MessageStreamDefinition::overwrite_oldest("s");

        c.create_message_stream(&def).await.unwrap();
        c.append_message("s", b"a").await.unwrap();
        c.append_message("s", b"b").await.unwrap();
        c.delete_message_stream("s").await.unwrap();
        c.create_message_stream(&def).await.unwrap();
        assert_eq!(c.append_message("s", b"c").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_read_timeout_when_nothing_new() {
        let dir = TempDir::new().unwrap();
        let manager = LocalStreamManager::new(dir.path());
        let c = client(&manager).await;
        c.create_message_stream(&MessageStreamDefinition::overwrite_oldest("s"))
            .await
            .unwrap();

        let err = c
            .read_messages("s", &ReadMessagesOptions::from_cursor(0, Duration::from_millis(20)))
            .await
            .unwrap_err();
        assert!(matches!(err, StreamError::ReadTimeout(_)));
        assert!(err.is_transport_level());
    }

    #[tokio::test]
    async fn test_export_copies_file_and_reports_status() {
        let dir = TempDir::new().unwrap();
        let source = dir.path().join("Clemap_train.csv");
        std::fs::write(&source, "target\n1.000000\n").unwrap();
        let manager = LocalStreamManager::new(dir.path().join("export"));
        let c = client(&manager).await;

        c.create_message_stream(&MessageStreamDefinition::overwrite_oldest("status"))
            .await
            .unwrap();
        let data = MessageStreamDefinition::overwrite_oldest("data").exporting_to("status");
        c.create_message_stream(&data).await.unwrap();

        let task = UploadTask::from_local_path(&source, "clemapbucket", "data/Clemap_train.csv");
        c.append_message("data", &serde_json::to_vec(&task).unwrap())
            .await
            .unwrap();

        let mut events = Vec::new();
        let mut cursor = 0;
        while events.len() < 2 {
            let options = ReadMessagesOptions::from_cursor(cursor, Duration::from_secs(5));
            let read = c.read_messages("status", &options).await.unwrap();
            for m in read {
                cursor = m.sequence_number + 1;
                events.push(StatusMessage::decode(&m).unwrap().outcome);
            }
        }
        assert_eq!(events, vec![UploadStatus::InProgress, UploadStatus::Success]);

        let exported = dir.path().join("export/clemapbucket/data/Clemap_train.csv");
        assert_eq!(std::fs::read_to_string(exported).unwrap(), "target\n1.000000\n");
    }

    #[tokio::test]
    async fn test_export_of_missing_file_reports_failure() {
        let dir = TempDir::new().unwrap();
        let manager = LocalStreamManager::new(dir.path().join("export"));
        let c = client(&manager).await;
        c.create_message_stream(&MessageStreamDefinition::overwrite_oldest("status"))
            .await
            .unwrap();
        let data = MessageStreamDefinition::overwrite_oldest("data").exporting_to("status");
        c.create_message_stream(&data).await.unwrap();

        let task = UploadTask::from_local_path(&dir.path().join("missing.csv"), "b", "k.csv");
        c.append_message("data", &serde_json::to_vec(&task).unwrap())
            .await
            .unwrap();

        let read = c
            .read_messages(
                "status",
                &ReadMessagesOptions {
                    desired_start_sequence_number: 1,
                    min_message_count: 1,
                    max_message_count: None,
                    read_timeout: Duration::from_secs(5),
                },
            )
            .await
            .unwrap();
        let event = StatusMessage::decode(&read[0]).unwrap();
        assert_eq!(event.outcome, UploadStatus::Failure);
        assert!(event.message.contains("missing.csv"));
    }

    #[tokio::test]
    async fn test_export_requires_existing_status_stream() {
        let dir = TempDir::new().unwrap();
        let manager = LocalStreamManager::new(dir.path());
        let c = client(&manager).await;

        let data = MessageStreamDefinition::overwrite_oldest("data").exporting_to("status");
        let err = c.create_message_stream(&data).await.unwrap_err();
        assert!(matches!(err, StreamError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_closed_client_rejects_calls() {
        let dir = TempDir::new().unwrap();
        let manager = LocalStreamManager::new(dir.path());
        let c = client(&manager).await;
        c.close();

        assert_eq!(
            c.delete_message_stream("s").await.unwrap_err(),
            StreamError::Closed
        );
    }
}
