//! Live session registry backed by the state store.
//!
//! Every mutation is persisted before it becomes visible. Terminal states are
//! set exactly once: `finish` on an already-closed session is a no-op, so the
//! spawner, the lifecycle sweep and cancellation can race without
//! overwriting each other.
//!
//! Each session has its own lock, held across its write, so sessions persist
//! independently. Only open sessions stay in memory; a closed session is
//! dropped from the live map once written and reloaded from the store when
//! it is touched again.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use tracing::debug;

use crate::core::session::Session;
use crate::core::types::{SessionId, SessionState};
use crate::error::{ConductorError, Result};
use crate::io::store::StateStore;

type Slot = Arc<Mutex<Session>>;

pub struct SessionRegistry {
    live: Mutex<HashMap<SessionId, Slot>>,
    store: Arc<dyn StateStore>,
}

impl SessionRegistry {
    pub fn new(store: Arc<dyn StateStore>) -> Self {
        Self {
            live: Mutex::new(HashMap::new()),
            store,
        }
    }

    pub fn open(&self, session: Session) -> Result<()> {
        self.store
            .save_session(&session)
            .map_err(ConductorError::storage)?;
        debug!(session = %session.id, agent = %session.agent_type, "session opened");
        self.live
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(session.id, Arc::new(Mutex::new(session)));
        Ok(())
    }

    /// Apply `f` to a copy, persist it, then publish it.
    pub fn update<T>(
        &self,
        id: SessionId,
        f: impl FnOnce(&mut Session) -> Result<T>,
    ) -> Result<T> {
        let slot = self.slot(id)?;
        let mut current = slot.lock().unwrap_or_else(PoisonError::into_inner);
        if !self.is_current(id, &slot) {
            // Evicted while we waited; the store holds the newer state.
            drop(current);
            return self.update(id, f);
        }
        let mut next = current.clone();
        let outcome = f(&mut next).and_then(|value| {
            next.touch();
            self.store
                .save_session(&next)
                .map_err(ConductorError::storage)?;
            *current = next;
            Ok(value)
        });
        if current.state.is_closed() {
            self.evict(id, &slot);
        }
        outcome
    }

    pub fn transition(&self, id: SessionId, to: SessionState) -> Result<()> {
        self.update(id, |session| {
            session.transition(to).map_err(|err| {
                ConductorError::InvalidRequest(format!("session {id}: {err}"))
            })
        })
    }

    /// Move an open session into terminal state `to`, recording `error`.
    ///
    /// Returns `false` without touching the session when it is already closed.
    pub fn finish(&self, id: SessionId, to: SessionState, error: Option<String>) -> Result<bool> {
        self.finish_with(id, to, error, |_| {})
    }

    /// Like [`finish`](Self::finish), recording extra fields in the same write.
    pub fn finish_with(
        &self,
        id: SessionId,
        to: SessionState,
        error: Option<String>,
        record: impl FnOnce(&mut Session),
    ) -> Result<bool> {
        self.update(id, |session| {
            if session.state.is_closed() {
                return Ok(false);
            }
            session.transition(to).map_err(|err| {
                ConductorError::InvalidRequest(format!("session {id}: {err}"))
            })?;
            if error.is_some() {
                session.error = error;
            }
            record(session);
            debug!(session = %id, state = to.as_str(), "session finished");
            Ok(true)
        })
    }

    pub fn get(&self, id: SessionId) -> Result<Session> {
        let slot = self
            .live
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&id)
            .cloned();
        if let Some(slot) = slot {
            return Ok(slot.lock().unwrap_or_else(PoisonError::into_inner).clone());
        }
        self.load(id)
    }

    pub fn state(&self, id: SessionId) -> Option<SessionState> {
        self.get(id).ok().map(|session| session.state)
    }

    /// Sessions currently held in memory.
    pub fn live(&self) -> usize {
        self.live.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    fn slot(&self, id: SessionId) -> Result<Slot> {
        let mut live = self.live.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(slot) = live.get(&id) {
            return Ok(slot.clone());
        }
        let slot = Arc::new(Mutex::new(self.load(id)?));
        live.insert(id, slot.clone());
        Ok(slot)
    }

    fn is_current(&self, id: SessionId, slot: &Slot) -> bool {
        self.live
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&id)
            .is_some_and(|current| Arc::ptr_eq(current, slot))
    }

    fn evict(&self, id: SessionId, slot: &Slot) {
        let mut live = self.live.lock().unwrap_or_else(PoisonError::into_inner);
        if live.get(&id).is_some_and(|current| Arc::ptr_eq(current, slot)) {
            live.remove(&id);
        }
    }

    fn load(&self, id: SessionId) -> Result<Session> {
        self.store
            .load_session(id)
            .map_err(ConductorError::storage)?
            .ok_or_else(|| ConductorError::InvalidRequest(format!("unknown session {id}")))
    }
}
