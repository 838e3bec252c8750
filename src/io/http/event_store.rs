//! Event storage for SSE resumption
//!
//! Every message the server pushes on a session's event stream is appended
//! here first and gets a per-session sequence id, which doubles as the SSE
//! `id` field. A reconnecting client presents the last id it saw and
//! receives exactly the events after it.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

use crate::config::EventStoreBackend;
use crate::error::{McpError, McpResult};

/// One stored event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventRecord {
    pub session_id: String,
    pub sequence_id: u64,
    pub payload: String,
    pub recorded_at: DateTime<Utc>,
}

/// Pluggable event backend
#[async_trait]
pub trait EventStore: Send + Sync {
    /// Store a payload and return its sequence id (strictly increasing per session, starting at 1)
    async fn append(&self, session_id: &str, payload: String) -> McpResult<u64>;

    /// Events with a sequence id strictly greater than `after`, in order
    ///
    /// Fails with `StreamLost` when some of those events are no longer retained.
    async fn since(&self, session_id: &str, after: u64) -> McpResult<Vec<EventRecord>>;

    /// Every event still held for a session, oldest first
    async fn retained(&self, session_id: &str) -> McpResult<Vec<EventRecord>>;

    /// Drop all events of a session
    async fn remove_session(&self, session_id: &str) -> McpResult<()>;
}

/// Build the backend selected by configuration
pub fn create_event_store(backend: &EventStoreBackend) -> Arc<dyn EventStore> {
    match backend {
        EventStoreBackend::Memory {
            max_events_per_session,
        } => Arc::new(MemoryEventStore::new(*max_events_per_session)),
        EventStoreBackend::File { directory } => Arc::new(FileEventStore::new(directory.clone())),
    }
}

// ============================================================================
// Memory Backend
// ============================================================================

#[derive(Debug, Default)]
struct SessionLog {
    last_sequence: u64,
    events: VecDeque<EventRecord>,
}

/// Bounded in-memory store; oldest events are dropped past the cap
#[derive(Debug)]
pub struct MemoryEventStore {
    sessions: DashMap<String, Arc<Mutex<SessionLog>>>,
    max_events_per_session: usize,
}

impl MemoryEventStore {
    pub fn new(max_events_per_session: usize) -> Self {
        Self {
            sessions: DashMap::new(),
            max_events_per_session: max_events_per_session.max(1),
        }
    }

    fn log(&self, session_id: &str) -> Arc<Mutex<SessionLog>> {
        self.sessions
            .entry(session_id.to_string())
            .or_default()
            .value()
            .clone()
    }
}

#[async_trait]
impl EventStore for MemoryEventStore {
    async fn append(&self, session_id: &str, payload: String) -> McpResult<u64> {
        let log = self.log(session_id);
        let mut log = log.lock();
        log.last_sequence += 1;
        let sequence_id = log.last_sequence;
        log.events.push_back(EventRecord {
            session_id: session_id.to_string(),
            sequence_id,
            payload,
            recorded_at: Utc::now(),
        });
        while log.events.len() > self.max_events_per_session {
            log.events.pop_front();
        }
        Ok(sequence_id)
    }

    async fn since(&self, session_id: &str, after: u64) -> McpResult<Vec<EventRecord>> {
        let Some(log) = self.sessions.get(session_id).map(|entry| entry.value().clone()) else {
            return Ok(Vec::new());
        };
        let log = log.lock();
        if let Some(oldest) = log.events.front()
            && oldest.sequence_id > after.saturating_add(1)
        {
            return Err(McpError::StreamLost(format!(
                "events {}..{} of session {session_id} are no longer retained",
                after.saturating_add(1),
                oldest.sequence_id - 1
            )));
        }
        Ok(log
            .events
            .iter()
            .filter(|event| event.sequence_id > after)
            .cloned()
            .collect())
    }

    async fn retained(&self, session_id: &str) -> McpResult<Vec<EventRecord>> {
        Ok(self
            .sessions
            .get(session_id)
            .map(|entry| entry.value().lock().events.iter().cloned().collect())
            .unwrap_or_default())
    }

    async fn remove_session(&self, session_id: &str) -> McpResult<()> {
        self.sessions.remove(session_id);
        Ok(())
    }
}

// ============================================================================
// File Backend
// ============================================================================

/// Append-only JSON lines, one file per session: `<dir>/<session>.jsonl`
#[derive(Debug)]
pub struct FileEventStore {
    directory: PathBuf,
    /// Last sequence id per session; the async lock serializes appends
    sequences: DashMap<String, Arc<tokio::sync::Mutex<Option<u64>>>>,
}

impl FileEventStore {
    pub fn new(directory: impl Into<PathBuf>) -> Self {
        Self {
            directory: directory.into(),
            sequences: DashMap::new(),
        }
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }

    fn path_for(&self, session_id: &str) -> McpResult<PathBuf> {
        let valid = !session_id.is_empty()
            && session_id
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
        if !valid {
            return Err(McpError::validation(format!(
                "session id '{session_id}' cannot be used as a file name"
            )));
        }
        Ok(self.directory.join(format!("{session_id}.jsonl")))
    }

    async fn read_all(path: &Path) -> McpResult<Vec<EventRecord>> {
        let content = match tokio::fs::read_to_string(path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => {
                return Err(McpError::system(format!(
                    "failed to read {}: {e}",
                    path.display()
                )));
            }
        };

        let mut events = Vec::new();
        for (index, line) in content.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<EventRecord>(line) {
                Ok(event) => events.push(event),
                Err(e) => warn!(
                    path = %path.display(),
                    line = index + 1,
                    "Skipping corrupt event record: {}",
                    e
                ),
            }
        }
        Ok(events)
    }
}

#[async_trait]
impl EventStore for FileEventStore {
    async fn append(&self, session_id: &str, payload: String) -> McpResult<u64> {
        let path = self.path_for(session_id)?;
        let slot = self
            .sequences
            .entry(session_id.to_string())
            .or_default()
            .value()
            .clone();
        let mut last = slot.lock().await;

        let previous = match *last {
            Some(previous) => previous,
            // first append since startup: continue after whatever is on disk
            None => Self::read_all(&path)
                .await?
                .last()
                .map(|event| event.sequence_id)
                .unwrap_or(0),
        };
        let sequence_id = previous + 1;

        let record = EventRecord {
            session_id: session_id.to_string(),
            sequence_id,
            payload,
            recorded_at: Utc::now(),
        };
        let mut line = serde_json::to_string(&record)?;
        line.push('\n');

        tokio::fs::create_dir_all(&self.directory)
            .await
            .map_err(|e| McpError::system(format!("failed to create event directory: {e}")))?;
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
            .map_err(|e| McpError::system(format!("failed to open {}: {e}", path.display())))?;
        file.write_all(line.as_bytes())
            .await
            .map_err(|e| McpError::system(format!("failed to append event: {e}")))?;
        file.flush()
            .await
            .map_err(|e| McpError::system(format!("failed to flush event: {e}")))?;

        *last = Some(sequence_id);
        debug!(session_id, sequence_id, "Event appended");
        Ok(sequence_id)
    }

    async fn since(&self, session_id: &str, after: u64) -> McpResult<Vec<EventRecord>> {
        let path = self.path_for(session_id)?;
        let events = Self::read_all(&path).await?;
        Ok(events
            .into_iter()
            .filter(|event| event.sequence_id > after)
            .collect())
    }

    async fn retained(&self, session_id: &str) -> McpResult<Vec<EventRecord>> {
        let path = self.path_for(session_id)?;
        Self::read_all(&path).await
    }

    async fn remove_session(&self, session_id: &str) -> McpResult<()> {
        let path = self.path_for(session_id)?;
        self.sequences.remove(session_id);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(McpError::system(format!(
                "failed to remove {}: {e}",
                path.display()
            ))),
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    async fn append_ten(store: &dyn EventStore, session: &str) {
        for n in 1..=10u64 {
            let seq = store.append(session, format!("event-{n}")).await.unwrap();
            assert_eq!(seq, n);
        }
    }

    fn payloads(events: &[EventRecord]) -> Vec<&str> {
        events.iter().map(|e| e.payload.as_str()).collect()
    }

    #[tokio::test]
    async fn test_memory_replay_after_last_seen() {
        let store = MemoryEventStore::new(100);
        append_ten(&store, "s1").await;

        let replay = store.since("s1", 4).await.unwrap();
        let ids: Vec<u64> = replay.iter().map(|e| e.sequence_id).collect();
        assert_eq!(ids, vec![5, 6, 7, 8, 9, 10]);
        assert_eq!(payloads(&replay)[0], "event-5");

        assert!(store.since("s1", 10).await.unwrap().is_empty());
        assert!(store.since("unknown", 0).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_memory_sessions_are_independent() {
        let store = MemoryEventStore::new(100);
        assert_eq!(store.append("a", "x".into()).await.unwrap(), 1);
        assert_eq!(store.append("b", "y".into()).await.unwrap(), 1);
        assert_eq!(store.append("a", "z".into()).await.unwrap(), 2);

        store.remove_session("a").await.unwrap();
        assert!(store.since("a", 0).await.unwrap().is_empty());
        assert_eq!(store.since("b", 0).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_memory_retention_reports_gap() {
        let store = MemoryEventStore::new(3);
        append_ten(&store, "s").await;

        assert_eq!(store.since("s", 7).await.unwrap().len(), 3);
        let err = store.since("s", 2).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Transport);
        assert!(matches!(err, McpError::StreamLost(_)));

        let kept: Vec<u64> = store
            .retained("s")
            .await
            .unwrap()
            .iter()
            .map(|e| e.sequence_id)
            .collect();
        assert_eq!(kept, vec![8, 9, 10]);
        assert!(store.retained("unknown").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_memory_concurrent_appends_unique_sequences() {
        let store = Arc::new(MemoryEventStore::new(1000));
        let mut handles = Vec::new();
        for worker in 0..8 {
            let store = Arc::clone(&store);
            handles.push(tokio::spawn(async move {
                let mut seqs = Vec::new();
                for n in 0..25 {
                    seqs.push(store.append("shared", format!("{worker}-{n}")).await.unwrap());
                }
                seqs
            }));
        }
        let mut all = Vec::new();
        for handle in handles {
            all.extend(handle.await.unwrap());
        }
        all.sort_unstable();
        assert_eq!(all, (1..=200).collect::<Vec<u64>>());
    }

    #[tokio::test]
    async fn test_file_replay_and_restart() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileEventStore::new(dir.path());
        append_ten(&store, "sess-1").await;
        assert!(dir.path().join("sess-1.jsonl").exists());

        let replay = store.since("sess-1", 4).await.unwrap();
        assert_eq!(
            payloads(&replay),
            vec!["event-5", "event-6", "event-7", "event-8", "event-9", "event-10"]
        );

        assert_eq!(store.retained("sess-1").await.unwrap().len(), 10);

        // a fresh instance continues the sequence found on disk
        let reopened = FileEventStore::new(dir.path());
        assert_eq!(reopened.append("sess-1", "event-11".into()).await.unwrap(), 11);

        reopened.remove_session("sess-1").await.unwrap();
        assert!(reopened.since("sess-1", 0).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_file_rejects_path_like_session_ids() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileEventStore::new(dir.path());
        let err = store.append("../escape", "x".into()).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);
    }

    #[tokio::test]
    async fn test_create_from_backend() {
        let store = create_event_store(&EventStoreBackend::default());
        assert_eq!(store.append("s", "p".into()).await.unwrap(), 1);
    }
}
