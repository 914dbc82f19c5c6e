//! Shared, durable call tracking across every root session tree.
//!
//! Records are loaded lazily from the state store and every mutation is
//! persisted before it is published. One mutex serializes all admissions, so
//! concurrent siblings can never both take the last unit of a budget. A closed
//! tree with nothing open is dropped from memory; the store keeps it.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use tracing::{debug, warn};

use crate::core::fingerprint::TaskFingerprint;
use crate::core::loop_guard::{Admission, CallTrackingRecord, LoopGuardError, LoopLimits};
use crate::core::types::{SessionId, TaskRequest};
use crate::error::{ConductorError, Result};
use crate::io::store::StateStore;

pub struct CallTracker {
    limits: LoopLimits,
    records: Mutex<HashMap<SessionId, CallTrackingRecord>>,
    store: Arc<dyn StateStore>,
}

impl CallTracker {
    pub fn new(limits: LoopLimits, store: Arc<dyn StateStore>) -> Self {
        Self {
            limits,
            records: Mutex::new(HashMap::new()),
            store,
        }
    }

    pub fn limits(&self) -> LoopLimits {
        self.limits
    }

    /// Admit `session` for `request`, or refuse before any counter moves.
    pub fn admit(
        &self,
        request: &TaskRequest,
        session: SessionId,
        fingerprint: &TaskFingerprint,
    ) -> Result<Admission> {
        let root = request.context.root;
        let limits = self.limits;
        let outcome = self.mutate(root, |record| {
            record.admit(
                &limits,
                session,
                request.context.parent,
                request.context.depth,
                fingerprint,
            )
        })?;

        match outcome {
            Ok(admission) => {
                debug!(
                    %root,
                    %session,
                    depth = admission.depth,
                    call = admission.call_number,
                    remaining = admission.remaining_budget,
                    "spawn admitted"
                );
                Ok(admission)
            }
            Err(LoopGuardError::Exceeded { limit, used, cap }) => {
                warn!(%root, %session, %limit, used, cap, "loop limit exceeded");
                Err(ConductorError::LoopLimitExceeded { limit, used, cap })
            }
            Err(err @ LoopGuardError::UnknownParent(_)) => {
                Err(ConductorError::InvalidRequest(err.to_string()))
            }
        }
    }

    /// Clear the open marker for a finished session.
    pub fn session_closed(&self, root: SessionId, session: SessionId) -> Result<()> {
        self.mutate(root, |record| {
            record.release(session);
        })
    }

    pub fn refinements_remaining(
        &self,
        root: SessionId,
        fingerprint: &TaskFingerprint,
    ) -> Result<u32> {
        let limits = self.limits;
        self.read(root, |record| {
            record.refinements_remaining(&limits, fingerprint)
        })
    }

    /// Trees currently held in memory.
    pub fn cached(&self) -> usize {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// End the tree's lifetime; later admissions are refused.
    pub fn close_root(&self, root: SessionId) -> Result<()> {
        self.mutate(root, |record| {
            record.closed = true;
        })
    }

    pub fn snapshot(&self, root: SessionId) -> Result<CallTrackingRecord> {
        self.read(root, Clone::clone)
    }

    fn read<T>(&self, root: SessionId, f: impl FnOnce(&CallTrackingRecord) -> T) -> Result<T> {
        let mut records = self.records.lock().unwrap_or_else(PoisonError::into_inner);
        let value = f(self.load(&mut records, root)?);
        evict_if_finished(&mut records, root);
        Ok(value)
    }

    fn mutate<T>(
        &self,
        root: SessionId,
        f: impl FnOnce(&mut CallTrackingRecord) -> T,
    ) -> Result<T> {
        let mut records = self.records.lock().unwrap_or_else(PoisonError::into_inner);
        let mut next = self.load(&mut records, root)?.clone();
        let value = f(&mut next);
        if Some(&next) != records.get(&root) {
            self.store
                .save_record(&next)
                .map_err(ConductorError::storage)?;
            records.insert(root, next);
        }
        evict_if_finished(&mut records, root);
        Ok(value)
    }

    fn load<'a>(
        &self,
        records: &'a mut HashMap<SessionId, CallTrackingRecord>,
        root: SessionId,
    ) -> Result<&'a CallTrackingRecord> {
        if !records.contains_key(&root) {
            let record = self
                .store
                .load_record(root)
                .map_err(ConductorError::storage)?
                .unwrap_or_else(|| CallTrackingRecord::new(root));
            records.insert(root, record);
        }
        records
            .get(&root)
            .ok_or_else(|| ConductorError::Storage(format!("tracking record {root} vanished")))
    }
}

fn evict_if_finished(records: &mut HashMap<SessionId, CallTrackingRecord>, root: SessionId) {
    if records
        .get(&root)
        .is_some_and(|record| record.closed && record.open.is_empty())
    {
        records.remove(&root);
    }
}
