//! Process-wide table of live sessions
//!
//! The registry indexes sessions and their last-activity timestamps; it does
//! not own their lifecycle. Sessions are torn down by their own close paths
//! and removed here afterwards.

use dashmap::mapref::entry::Entry as MapEntry;
use dashmap::DashMap;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

use crate::metrics::{global_metrics, Metrics};
use crate::session::StreamSession;
use crate::{Error, Result};

/// Shared handle to a registered session
pub type SessionHandle = Arc<StreamSession>;

struct Entry {
    session: SessionHandle,
    last_activity: Instant,
}

/// Listing row for one registered session
#[derive(Debug, Clone, Serialize)]
pub struct SessionSummary {
    pub id: String,
    pub state: String,
    pub idle_seconds: u64,
}

/// Registry of active sessions
pub struct SessionRegistry {
    sessions: DashMap<String, Entry>,
    accepting: AtomicBool,
    metrics: Arc<Metrics>,
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::with_metrics(global_metrics())
    }

    pub fn with_metrics(metrics: Arc<Metrics>) -> Self {
        Self {
            sessions: DashMap::new(),
            accepting: AtomicBool::new(true),
            metrics,
        }
    }

    /// Register a session under its id
    pub fn register(&self, session: impl Into<SessionHandle>) -> Result<SessionHandle> {
        if !self.accepting.load(Ordering::SeqCst) {
            return Err(Error::ShuttingDown);
        }

        let session = session.into();
        let id = session.id().to_string();
        match self.sessions.entry(id.clone()) {
            MapEntry::Occupied(_) => return Err(Error::DuplicateSession(id)),
            MapEntry::Vacant(slot) => {
                slot.insert(Entry {
                    session: session.clone(),
                    last_activity: Instant::now(),
                });
            }
        }

        // A drain that started between the check and the insert may already
        // have taken its snapshot.
        if !self.accepting.load(Ordering::SeqCst) {
            self.sessions.remove(&id);
            return Err(Error::ShuttingDown);
        }

        self.metrics.session_created();
        tracing::info!(session_id = %id, active = self.sessions.len(), "Session registered");
        Ok(session)
    }

    pub fn lookup(&self, id: &str) -> Option<SessionHandle> {
        self.sessions.get(id).map(|entry| entry.session.clone())
    }

    /// Ids of every registered session
    pub fn list_active(&self) -> Vec<String> {
        self.sessions.iter().map(|entry| entry.key().clone()).collect()
    }

    /// Handles of every registered session
    pub fn sessions(&self) -> Vec<SessionHandle> {
        self.sessions
            .iter()
            .map(|entry| entry.session.clone())
            .collect()
    }

    /// Record activity; each touch moves the timestamp strictly forward
    pub fn touch(&self, id: &str) -> Result<Instant> {
        let mut entry = self
            .sessions
            .get_mut(id)
            .ok_or_else(|| Error::SessionNotFound(id.to_string()))?;

        let now = Instant::now();
        entry.last_activity = if now > entry.last_activity {
            now
        } else {
            entry.last_activity + Duration::from_nanos(1)
        };
        Ok(entry.last_activity)
    }

    pub fn last_activity(&self, id: &str) -> Option<Instant> {
        self.sessions.get(id).map(|entry| entry.last_activity)
    }

    /// Drop a session from the table; removing an absent id is a no-op
    pub fn remove(&self, id: &str) -> Option<SessionHandle> {
        let removed = self.sessions.remove(id).map(|(_, entry)| entry.session);
        if removed.is_some() {
            tracing::debug!(session_id = %id, active = self.sessions.len(), "Session removed");
        }
        removed
    }

    /// Drop `session` only if it is still the one registered under its id
    ///
    /// A caller that reconnects under the same id gets a new session; late
    /// cleanup of the old one must not deregister it.
    pub fn remove_session(&self, session: &SessionHandle) -> bool {
        let removed = self
            .sessions
            .remove_if(session.id(), |_, entry| Arc::ptr_eq(&entry.session, session))
            .is_some();
        if removed {
            tracing::debug!(session_id = %session.id(), active = self.sessions.len(), "Session removed");
        }
        removed
    }

    /// Sessions idle for longer than `threshold`
    pub fn idle_sessions(&self, threshold: Duration) -> Vec<SessionHandle> {
        let now = Instant::now();
        self.sessions
            .iter()
            .filter(|entry| now.saturating_duration_since(entry.last_activity) > threshold)
            .map(|entry| entry.session.clone())
            .collect()
    }

    /// Whether `id` is still registered and idle for longer than `threshold`
    pub fn is_idle(&self, id: &str, threshold: Duration) -> bool {
        self.last_activity(id)
            .is_some_and(|last| Instant::now().saturating_duration_since(last) > threshold)
    }

    /// Stop admitting sessions; registered ones are unaffected
    pub fn close_admission(&self) {
        if self.accepting.swap(false, Ordering::SeqCst) {
            tracing::info!(active = self.sessions.len(), "Session admission closed");
        }
    }

    pub fn is_accepting(&self) -> bool {
        self.accepting.load(Ordering::SeqCst)
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    pub fn snapshot(&self) -> Vec<SessionSummary> {
        let now = Instant::now();
        let mut rows: Vec<SessionSummary> = self
            .sessions
            .iter()
            .map(|entry| SessionSummary {
                id: entry.key().clone(),
                state: entry.session.state().to_string(),
                idle_seconds: now.saturating_duration_since(entry.last_activity).as_secs(),
            })
            .collect();
        rows.sort_by(|a, b| a.id.cmp(&b.id));
        rows
    }

    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.metrics
    }
}
