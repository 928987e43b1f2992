//! Session registry: captured events accumulated between "start recording"
//! and "finalize".
//!
//! Constructed explicitly and shared as `Arc<SessionStore>`. The IPC server
//! handles connections concurrently, so per-session mutation goes through a
//! mutex. A session being finalized is marked so a second finalize (or a late
//! event) cannot race the running pipeline.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracery_core::models::CapturedEvent;
use tracery_core::SessionError;

#[derive(Debug, Clone)]
pub struct SessionState {
    pub session_id: String,
    pub started_at: DateTime<Utc>,
    pub events: Vec<CapturedEvent>,
    pub finalizing: bool,
}

impl SessionState {
    fn new(session_id: &str) -> Self {
        Self {
            session_id: session_id.to_string(),
            started_at: Utc::now(),
            events: Vec::new(),
            finalizing: false,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SessionStats {
    pub active_sessions: usize,
    pub total_events: usize,
    pub finalizing_sessions: usize,
}

#[derive(Debug, Default)]
pub struct SessionStore {
    sessions: Mutex<HashMap<String, SessionState>>,
}

impl SessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, SessionState>> {
        // A panic while holding the lock leaves plain data behind; keep serving.
        self.sessions.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Start (or restart) recording. Any events of an earlier recording under
    /// the same id are dropped unless that session is currently finalizing.
    pub fn start(&self, session_id: &str) -> Result<(), SessionError> {
        let mut sessions = self.lock();
        if sessions.get(session_id).is_some_and(|s| s.finalizing) {
            return Err(SessionError::AlreadyFinalizing(session_id.to_string()));
        }
        sessions.insert(session_id.to_string(), SessionState::new(session_id));
        tracing::info!(session_id = %session_id, "Recording started");
        Ok(())
    }

    /// Create empty state on first use; returns the current event count.
    pub fn get_or_create(&self, session_id: &str) -> usize {
        let mut sessions = self.lock();
        sessions
            .entry(session_id.to_string())
            .or_insert_with(|| SessionState::new(session_id))
            .events
            .len()
    }

    /// Append an event, creating the session if needed. Returns the new event count.
    pub fn add_event(&self, session_id: &str, event: CapturedEvent) -> Result<usize, SessionError> {
        let mut sessions = self.lock();
        let state = sessions
            .entry(session_id.to_string())
            .or_insert_with(|| SessionState::new(session_id));
        if state.finalizing {
            return Err(SessionError::AlreadyFinalizing(session_id.to_string()));
        }
        state.events.push(event);
        Ok(state.events.len())
    }

    pub fn get(&self, session_id: &str) -> Option<SessionState> {
        self.lock().get(session_id).cloned()
    }

    /// Reclaim a session's memory. Returns whether it existed.
    pub fn delete(&self, session_id: &str) -> bool {
        self.lock().remove(session_id).is_some()
    }

    pub fn clear(&self) {
        self.lock().clear();
    }

    pub fn stats(&self) -> SessionStats {
        let sessions = self.lock();
        SessionStats {
            active_sessions: sessions.len(),
            total_events: sessions.values().map(|s| s.events.len()).sum(),
            finalizing_sessions: sessions.values().filter(|s| s.finalizing).count(),
        }
    }

    /// Mark the session as finalizing and hand out a snapshot of its events.
    pub fn begin_finalize(&self, session_id: &str) -> Result<Vec<CapturedEvent>, SessionError> {
        let mut sessions = self.lock();
        let state = sessions
            .get_mut(session_id)
            .ok_or_else(|| SessionError::NotFound(session_id.to_string()))?;
        if state.finalizing {
            return Err(SessionError::AlreadyFinalizing(session_id.to_string()));
        }
        state.finalizing = true;
        Ok(state.events.clone())
    }

    /// Undo `begin_finalize` after a failed run so the caller may retry.
    pub fn abort_finalize(&self, session_id: &str) {
        if let Some(state) = self.lock().get_mut(session_id) {
            state.finalizing = false;
        }
    }
}
