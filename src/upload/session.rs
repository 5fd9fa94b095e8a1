//! Merge Tracker
//!
//! In-process record of which sessions are merging and how their last
//! merge ended. Sessions themselves live only in the chunk ledger; this
//! only adds the transient states the ledger cannot express.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;

use super::types::{SessionState, UploadError};

#[derive(Debug, Clone, Copy)]
struct Entry {
    state: SessionState,
    updated_at: DateTime<Utc>,
}

/// Tracks merge state per session
#[derive(Clone, Default)]
pub struct MergeTracker {
    sessions: Arc<Mutex<HashMap<String, Entry>>>,
}

impl MergeTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark a session as merging.
    ///
    /// Fails if a merge for the session is already running. The returned
    /// guard marks the session `Failed` unless `finish` is called first.
    pub fn begin_merge(&self, session_id: &str) -> Result<MergeGuard, UploadError> {
        let mut sessions = self.sessions.lock();
        if let Some(entry) = sessions.get(session_id) {
            if entry.state == SessionState::Merging {
                return Err(UploadError::MergeInProgress(session_id.to_string()));
            }
        }
        sessions.insert(
            session_id.to_string(),
            Entry {
                state: SessionState::Merging,
                updated_at: Utc::now(),
            },
        );

        Ok(MergeGuard {
            tracker: self.clone(),
            session_id: session_id.to_string(),
            finished: false,
        })
    }

    /// Current state; sessions never merged are `Collecting`
    pub fn state(&self, session_id: &str) -> SessionState {
        self.sessions
            .lock()
            .get(session_id)
            .map(|e| e.state)
            .unwrap_or(SessionState::Collecting)
    }

    /// Forget terminal states last updated before `cutoff`. Returns how many were dropped.
    pub fn prune(&self, cutoff: DateTime<Utc>) -> usize {
        let mut sessions = self.sessions.lock();
        let before = sessions.len();
        sessions.retain(|_, e| e.state == SessionState::Merging || e.updated_at >= cutoff);
        before - sessions.len()
    }

    fn set(&self, session_id: &str, state: SessionState) {
        self.sessions.lock().insert(
            session_id.to_string(),
            Entry {
                state,
                updated_at: Utc::now(),
            },
        );
    }
}

/// Held for the duration of one merge
pub struct MergeGuard {
    tracker: MergeTracker,
    session_id: String,
    finished: bool,
}

impl MergeGuard {
    /// Record the outcome of the merge
    pub fn finish(mut self, state: SessionState) {
        self.tracker.set(&self.session_id, state);
        self.finished = true;
    }
}

impl Drop for MergeGuard {
    fn drop(&mut self) {
        // Early return, cancellation or timeout
        if !self.finished {
            self.tracker.set(&self.session_id, SessionState::Failed);
        }
    }
}
