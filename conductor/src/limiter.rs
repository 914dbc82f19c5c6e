//! Bounded admission gate for running sessions.
//!
//! Permits are keyed by session id so any holder (the spawner on exit, the
//! lifecycle sweep on timeout) can release a session's slot, and releasing
//! twice is harmless.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::debug;

use crate::core::types::{AdmissionPolicy, SessionId};
use crate::error::{ConductorError, Result};

#[derive(Debug)]
pub struct ConcurrencyLimiter {
    limit: usize,
    policy: AdmissionPolicy,
    semaphore: Arc<Semaphore>,
    held: Mutex<HashMap<SessionId, OwnedSemaphorePermit>>,
}

impl ConcurrencyLimiter {
    pub fn new(limit: usize, policy: AdmissionPolicy) -> Self {
        Self {
            limit,
            policy,
            semaphore: Arc::new(Semaphore::new(limit)),
            held: Mutex::new(HashMap::new()),
        }
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    pub fn policy(&self) -> AdmissionPolicy {
        self.policy
    }

    /// Take a slot for `session`, waiting or failing per the admission policy.
    pub async fn acquire(&self, session: SessionId) -> Result<()> {
        let permit = match self.policy {
            AdmissionPolicy::Block => self
                .semaphore
                .clone()
                .acquire_owned()
                .await
                .map_err(|_| ConductorError::ConcurrencyRejected { limit: self.limit })?,
            AdmissionPolicy::Reject => self
                .semaphore
                .clone()
                .try_acquire_owned()
                .map_err(|_| ConductorError::ConcurrencyRejected { limit: self.limit })?,
        };
        self.held
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(session, permit);
        debug!(%session, running = self.running(), limit = self.limit, "slot acquired");
        Ok(())
    }

    /// Return `session`'s slot. Returns `false` when it held none.
    pub fn release(&self, session: SessionId) -> bool {
        let permit = self
            .held
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&session);
        let released = permit.is_some();
        drop(permit);
        if released {
            debug!(%session, running = self.running(), "slot released");
        }
        released
    }

    pub fn holds(&self, session: SessionId) -> bool {
        self.held
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(&session)
    }

    /// Sessions currently holding a slot.
    pub fn running(&self) -> usize {
        self.held
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn available(&self) -> usize {
        self.semaphore.available_permits()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn reject_policy_fails_fast_when_full() {
        let limiter = ConcurrencyLimiter::new(1, AdmissionPolicy::Reject);
        let first = SessionId::new();
        limiter.acquire(first).await.expect("first slot");
        let err = limiter.acquire(SessionId::new()).await.unwrap_err();
        assert!(matches!(err, ConductorError::ConcurrencyRejected { limit: 1 }));

        assert!(limiter.release(first));
        assert!(!limiter.release(first));
        limiter.acquire(SessionId::new()).await.expect("slot after release");
    }

    #[tokio::test]
    async fn block_policy_waits_for_release() {
        let limiter = Arc::new(ConcurrencyLimiter::new(1, AdmissionPolicy::Block));
        let first = SessionId::new();
        limiter.acquire(first).await.expect("first slot");

        let waiter = {
            let limiter = limiter.clone();
            tokio::spawn(async move { limiter.acquire(SessionId::new()).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());
        assert_eq!(limiter.running(), 1);

        limiter.release(first);
        waiter
            .await
            .expect("join")
            .expect("second slot after release");
        assert_eq!(limiter.running(), 1);
        assert_eq!(limiter.available(), 0);
    }
}
