//! Loop-guard budgets for one root session tree.
//!
//! Three independent caps apply per root:
//! - total delegation calls,
//! - recursion depth (grows only on self-delegation),
//! - spawns per task fingerprint (`1 + max_refinements`).
//!
//! `admit` checks every cap before mutating anything, so a refused spawn
//! leaves the record untouched.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::core::fingerprint::TaskFingerprint;
use crate::core::types::{LoopLimit, SessionId};

/// Configurable budgets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoopLimits {
    pub max_calls: u32,
    pub max_depth: u32,
    pub max_refinements: u32,
}

impl Default for LoopLimits {
    fn default() -> Self {
        Self {
            max_calls: 20,
            max_depth: 2,
            max_refinements: 2,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LoopGuardError {
    #[error("{limit} limit reached ({used} of {cap})")]
    Exceeded {
        limit: LoopLimit,
        used: u32,
        cap: u32,
    },
    #[error("parent session {0} is not part of this session tree")]
    UnknownParent(SessionId),
}

/// Granted spawn, as seen by the new session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Admission {
    pub depth: u32,
    /// 1-based position of this spawn within the root's call budget.
    pub call_number: u32,
    pub remaining_budget: u32,
    /// How many times this fingerprint has now been spawned (1 = original).
    pub fingerprint_spawns: u32,
}

/// Persisted counters for one root session tree.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallTrackingRecord {
    pub root: SessionId,
    pub total_calls: u32,
    pub max_depth_reached: u32,
    pub fingerprints: BTreeMap<TaskFingerprint, u32>,
    /// Authoritative depth of every admitted session.
    pub lineage: BTreeMap<SessionId, u32>,
    pub open: BTreeSet<SessionId>,
    pub closed: bool,
}

impl CallTrackingRecord {
    pub fn new(root: SessionId) -> Self {
        Self {
            root,
            total_calls: 0,
            max_depth_reached: 0,
            fingerprints: BTreeMap::new(),
            lineage: BTreeMap::new(),
            open: BTreeSet::new(),
            closed: false,
        }
    }

    /// Depth a new session would run at.
    ///
    /// With a parent, the depth comes from the recorded lineage; a caller can
    /// claim a deeper context but never a shallower one.
    pub fn depth_for(
        &self,
        parent: Option<SessionId>,
        claimed: u32,
    ) -> Result<u32, LoopGuardError> {
        let derived = match parent {
            None => 0,
            Some(parent) => {
                let parent_depth = self
                    .lineage
                    .get(&parent)
                    .ok_or(LoopGuardError::UnknownParent(parent))?;
                parent_depth + 1
            }
        };
        Ok(derived.max(claimed))
    }

    /// Check every cap and, only if all pass, record the spawn.
    pub fn admit(
        &mut self,
        limits: &LoopLimits,
        session: SessionId,
        parent: Option<SessionId>,
        claimed_depth: u32,
        fingerprint: &TaskFingerprint,
    ) -> Result<Admission, LoopGuardError> {
        if self.closed {
            return Err(LoopGuardError::Exceeded {
                limit: LoopLimit::RootClosed,
                used: self.total_calls,
                cap: self.total_calls,
            });
        }

        let depth = self.depth_for(parent, claimed_depth)?;
        if depth > limits.max_depth {
            return Err(LoopGuardError::Exceeded {
                limit: LoopLimit::Depth,
                used: depth,
                cap: limits.max_depth,
            });
        }

        if self.total_calls >= limits.max_calls {
            return Err(LoopGuardError::Exceeded {
                limit: LoopLimit::Calls,
                used: self.total_calls + 1,
                cap: limits.max_calls,
            });
        }

        let spawns = self.fingerprints.get(fingerprint).copied().unwrap_or(0);
        let refinements_used = spawns.saturating_sub(1);
        if spawns > 0 && refinements_used >= limits.max_refinements {
            return Err(LoopGuardError::Exceeded {
                limit: LoopLimit::Refinements,
                used: refinements_used + 1,
                cap: limits.max_refinements,
            });
        }

        self.total_calls += 1;
        self.max_depth_reached = self.max_depth_reached.max(depth);
        self.fingerprints.insert(fingerprint.clone(), spawns + 1);
        self.lineage.insert(session, depth);
        self.open.insert(session);

        Ok(Admission {
            depth,
            call_number: self.total_calls,
            remaining_budget: self.remaining_calls(limits),
            fingerprint_spawns: spawns + 1,
        })
    }

    /// Mark a session as no longer holding the tree open. Idempotent.
    pub fn release(&mut self, session: SessionId) -> bool {
        self.open.remove(&session)
    }

    pub fn remaining_calls(&self, limits: &LoopLimits) -> u32 {
        limits.max_calls.saturating_sub(self.total_calls)
    }

    /// Refinement spawns still allowed for `fingerprint`.
    pub fn refinements_remaining(&self, limits: &LoopLimits, fingerprint: &TaskFingerprint) -> u32 {
        let spawns = self.fingerprints.get(fingerprint).copied().unwrap_or(0);
        limits
            .max_refinements
            .saturating_sub(spawns.saturating_sub(1))
    }
}
