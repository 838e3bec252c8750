//! Server-side session registry
//!
//! Maps session ids to metadata and expires them after a period of
//! inactivity. HTTP requests are stateless between calls, so sessions end by
//! TTL (or an explicit terminate), never by connection close.

use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::error::{McpError, McpResult};
use crate::protocol::methods::Implementation;
use crate::server::auth::AuthInfo;
use crate::session::id::generate_session_id;

/// Data bound to a session at `initialize`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionMetadata {
    pub protocol_version: Option<String>,
    pub client_info: Option<Implementation>,
    pub client_capabilities: Option<Value>,
    pub auth: Option<AuthInfo>,
    /// Set once `notifications/initialized` has been received
    #[serde(default)]
    pub initialized: bool,
    /// Router-owned values
    #[serde(default)]
    pub extra: Map<String, Value>,
}

/// Read-only view of a session
#[derive(Debug, Clone)]
pub struct SessionInfo {
    pub session_id: String,
    pub created_at: DateTime<Utc>,
    pub idle_for: Duration,
    pub metadata: SessionMetadata,
}

#[async_trait]
pub trait ServerSessionStore: Send + Sync {
    /// Allocate a fresh id; atomic create-if-absent
    async fn create(&self) -> McpResult<String>;

    /// Known and not expired
    async fn is_valid(&self, session_id: &str) -> bool;

    /// Heartbeat; fails with `InvalidSession` or `SessionExpired`
    async fn update_activity(&self, session_id: &str) -> McpResult<()>;

    async fn set_metadata(&self, session_id: &str, metadata: SessionMetadata) -> McpResult<()>;

    async fn get_metadata(&self, session_id: &str) -> McpResult<SessionMetadata>;

    /// `true` if the session existed
    async fn terminate(&self, session_id: &str) -> bool;

    async fn list_active(&self) -> Vec<String>;

    /// Remove expired sessions and return their ids
    async fn purge_expired(&self) -> Vec<String>;
}

// ============================================================================
// In-Memory Store
// ============================================================================

#[derive(Debug)]
struct SessionEntry {
    created_at: DateTime<Utc>,
    last_activity: Instant,
    metadata: SessionMetadata,
}

impl SessionEntry {
    fn is_expired(&self, ttl: Duration) -> bool {
        self.last_activity.elapsed() > ttl
    }
}

/// Process-local store with inactivity TTL
///
/// Suitable for a single server process; deployments with several workers
/// need a backend shared between them.
#[derive(Debug)]
pub struct InMemorySessionStore {
    sessions: DashMap<String, SessionEntry>,
    ttl: Duration,
}

impl InMemorySessionStore {
    pub fn new(ttl: Duration) -> Self {
        Self {
            sessions: DashMap::new(),
            ttl,
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub fn info(&self, session_id: &str) -> Option<SessionInfo> {
        self.sessions
            .get(session_id)
            .filter(|entry| !entry.is_expired(self.ttl))
            .map(|entry| SessionInfo {
                session_id: session_id.to_string(),
                created_at: entry.created_at,
                idle_for: entry.last_activity.elapsed(),
                metadata: entry.metadata.clone(),
            })
    }

    /// Periodically purge expired sessions until the store is dropped
    pub fn spawn_reaper(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let store: Weak<Self> = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(store) = store.upgrade() else {
                    break;
                };
                let purged = store.purge_expired().await;
                if !purged.is_empty() {
                    info!(count = purged.len(), "Expired sessions purged");
                }
            }
        })
    }

    fn check(&self, session_id: &str) -> McpResult<()> {
        let expired = match self.sessions.get(session_id) {
            None => return Err(McpError::InvalidSession(session_id.to_string())),
            Some(entry) => entry.is_expired(self.ttl),
        };
        if expired {
            self.sessions
                .remove_if(session_id, |_, entry| entry.is_expired(self.ttl));
            return Err(McpError::SessionExpired(session_id.to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl ServerSessionStore for InMemorySessionStore {
    async fn create(&self) -> McpResult<String> {
        for _ in 0..8 {
            let session_id = generate_session_id();
            if let Entry::Vacant(slot) = self.sessions.entry(session_id.clone()) {
                slot.insert(SessionEntry {
                    created_at: Utc::now(),
                    last_activity: Instant::now(),
                    metadata: SessionMetadata::default(),
                });
                debug!(session_id = %session_id, "Session created");
                return Ok(session_id);
            }
        }
        Err(McpError::system("could not allocate a unique session id"))
    }

    async fn is_valid(&self, session_id: &str) -> bool {
        self.check(session_id).is_ok()
    }

    async fn update_activity(&self, session_id: &str) -> McpResult<()> {
        self.check(session_id)?;
        match self.sessions.get_mut(session_id) {
            Some(mut entry) => {
                entry.last_activity = Instant::now();
                Ok(())
            }
            None => Err(McpError::InvalidSession(session_id.to_string())),
        }
    }

    async fn set_metadata(&self, session_id: &str, metadata: SessionMetadata) -> McpResult<()> {
        self.check(session_id)?;
        match self.sessions.get_mut(session_id) {
            Some(mut entry) => {
                entry.metadata = metadata;
                Ok(())
            }
            None => Err(McpError::InvalidSession(session_id.to_string())),
        }
    }

    async fn get_metadata(&self, session_id: &str) -> McpResult<SessionMetadata> {
        self.check(session_id)?;
        self.sessions
            .get(session_id)
            .map(|entry| entry.metadata.clone())
            .ok_or_else(|| McpError::InvalidSession(session_id.to_string()))
    }

    async fn terminate(&self, session_id: &str) -> bool {
        let removed = self.sessions.remove(session_id).is_some();
        if removed {
            debug!(session_id, "Session terminated");
        }
        removed
    }

    async fn list_active(&self) -> Vec<String> {
        self.sessions
            .iter()
            .filter(|entry| !entry.is_expired(self.ttl))
            .map(|entry| entry.key().clone())
            .collect()
    }

    async fn purge_expired(&self) -> Vec<String> {
        let expired: Vec<String> = self
            .sessions
            .iter()
            .filter(|entry| entry.is_expired(self.ttl))
            .map(|entry| entry.key().clone())
            .collect();
        for session_id in &expired {
            self.sessions
                .remove_if(session_id, |_, entry| entry.is_expired(self.ttl));
        }
        expired
    }
}

// ============================================================================
// Tests
// ============================================================================
