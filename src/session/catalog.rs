//! Registry of live sessions

use super::Session;
use crate::types::SessionId;
use dashmap::DashMap;
use std::sync::Arc;
use tracing::debug;

/// Exactly one [`Session`] per live session id
#[derive(Default)]
pub struct SessionCatalog {
    sessions: DashMap<SessionId, Arc<Session>>,
}

impl SessionCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// The session for `session_id`, created on first use
    pub fn get_or_create(&self, session_id: SessionId) -> Arc<Session> {
        self.sessions
            .entry(session_id)
            .or_insert_with(|| {
                debug!(session = %session_id, "registered session");
                Arc::new(Session::new(session_id))
            })
            .clone()
    }

    pub fn get(&self, session_id: &SessionId) -> Option<Arc<Session>> {
        self.sessions.get(session_id).map(|s| s.clone())
    }

    /// Evict a session; handles still held by callers stay usable
    pub fn remove(&self, session_id: &SessionId) -> Option<Arc<Session>> {
        self.sessions.remove(session_id).map(|(_, s)| s)
    }

    /// Invalidate one session's cache; false if it is not registered
    pub fn invalidate(&self, session_id: &SessionId) -> bool {
        match self.sessions.get(session_id) {
            Some(session) => {
                session.invalidate();
                true
            }
            None => false,
        }
    }

    pub fn invalidate_all(&self) {
        for entry in self.sessions.iter() {
            entry.value().invalidate();
        }
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}
