//! Durable session and call-tracking records.
//!
//! Layout under `.conductor/state/`:
//! - `sessions/<session-id>.json`
//! - `trackers/<root-id>.json`
//!
//! Every write is atomic (temp file + rename), so a crash leaves either the
//! previous or the next record, never a torn one.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

use anyhow::{Context, Result};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::debug;

use crate::core::loop_guard::CallTrackingRecord;
use crate::core::session::Session;
use crate::core::types::SessionId;

/// Storage for session and tracker records.
pub trait StateStore: Send + Sync {
    fn save_session(&self, session: &Session) -> Result<()>;
    fn load_session(&self, id: SessionId) -> Result<Option<Session>>;
    /// All sessions, oldest first.
    fn list_sessions(&self) -> Result<Vec<Session>>;
    fn save_record(&self, record: &CallTrackingRecord) -> Result<()>;
    fn load_record(&self, root: SessionId) -> Result<Option<CallTrackingRecord>>;
}

/// JSON files under a state directory.
#[derive(Debug, Clone)]
pub struct FileStateStore {
    sessions_dir: PathBuf,
    trackers_dir: PathBuf,
}

impl FileStateStore {
    pub fn new(state_dir: &Path) -> Self {
        Self {
            sessions_dir: state_dir.join("sessions"),
            trackers_dir: state_dir.join("trackers"),
        }
    }

    fn session_path(&self, id: SessionId) -> PathBuf {
        self.sessions_dir.join(format!("{id}.json"))
    }

    fn record_path(&self, root: SessionId) -> PathBuf {
        self.trackers_dir.join(format!("{root}.json"))
    }
}

impl StateStore for FileStateStore {
    fn save_session(&self, session: &Session) -> Result<()> {
        let path = self.session_path(session.id);
        debug!(path = %path.display(), state = session.state.as_str(), "writing session");
        write_json(&path, session)
    }

    fn load_session(&self, id: SessionId) -> Result<Option<Session>> {
        read_json(&self.session_path(id))
    }

    fn list_sessions(&self) -> Result<Vec<Session>> {
        if !self.sessions_dir.exists() {
            return Ok(Vec::new());
        }
        let entries = fs::read_dir(&self.sessions_dir)
            .with_context(|| format!("read directory {}", self.sessions_dir.display()))?;
        let mut sessions = Vec::new();
        for entry in entries {
            let path = entry?.path();
            if path.extension().is_some_and(|ext| ext == "json")
                && let Some(session) = read_json::<Session>(&path)?
            {
                sessions.push(session);
            }
        }
        sessions.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(sessions)
    }

    fn save_record(&self, record: &CallTrackingRecord) -> Result<()> {
        let path = self.record_path(record.root);
        debug!(
            path = %path.display(),
            total_calls = record.total_calls,
            closed = record.closed,
            "writing call tracking record"
        );
        write_json(&path, record)
    }

    fn load_record(&self, root: SessionId) -> Result<Option<CallTrackingRecord>> {
        read_json(&self.record_path(root))
    }
}

fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let mut buf = serde_json::to_string_pretty(value)?;
    buf.push('\n');
    super::write_atomic(path, &buf)
}

fn read_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>> {
    if !path.exists() {
        return Ok(None);
    }
    let contents =
        fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let value =
        serde_json::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    Ok(Some(value))
}

/// In-memory store for tests and ephemeral runs.
#[derive(Debug, Default)]
pub struct MemoryStateStore {
    sessions: Mutex<HashMap<SessionId, Session>>,
    records: Mutex<HashMap<SessionId, CallTrackingRecord>>,
}

impl MemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl StateStore for MemoryStateStore {
    fn save_session(&self, session: &Session) -> Result<()> {
        self.sessions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(session.id, session.clone());
        Ok(())
    }

    fn load_session(&self, id: SessionId) -> Result<Option<Session>> {
        Ok(self
            .sessions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&id)
            .cloned())
    }

    fn list_sessions(&self) -> Result<Vec<Session>> {
        let mut sessions: Vec<Session> = self
            .sessions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect();
        sessions.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(sessions)
    }

    fn save_record(&self, record: &CallTrackingRecord) -> Result<()> {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(record.root, record.clone());
        Ok(())
    }

    fn load_record(&self, root: SessionId) -> Result<Option<CallTrackingRecord>> {
        Ok(self
            .records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&root)
            .cloned())
    }
}
