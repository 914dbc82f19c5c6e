//! Session deadlines, the periodic sweep and cancellation.
//!
//! Each open session is registered with a wall-clock deadline and a
//! cancellation token. Stopping a session (deadline passed or cancelled)
//! cancels its token, releases its slot, moves it to a terminal state and
//! notifies the call tracker. Lineage is remembered after a session closes so
//! cancelling an ancestor also refuses descendants spawned later; it is
//! forgotten once the root is closed and nothing under it is watched.
//!
//! Sessions left `Created` or `Running` by a previous process are closed by
//! [`LifecycleManager::recover`] when the conductor opens.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::core::session::Session;
use crate::core::types::{SessionId, SessionState};
use crate::error::ConductorError;
use crate::limiter::ConcurrencyLimiter;
use crate::sessions::SessionRegistry;
use crate::tracker::CallTracker;

/// Why the lifecycle manager stopped a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    TimedOut,
    Cancelled,
}

/// Handle given to the spawner for one registered session.
#[derive(Debug, Clone)]
pub struct SessionWatch {
    pub token: CancellationToken,
    pub deadline: Instant,
}

#[derive(Debug)]
struct Watched {
    root: SessionId,
    deadline: Instant,
    token: CancellationToken,
}

#[derive(Debug, Clone, Copy)]
struct Lineage {
    root: SessionId,
    parent: Option<SessionId>,
}

#[derive(Debug, Default)]
struct State {
    watched: HashMap<SessionId, Watched>,
    lineage: HashMap<SessionId, Lineage>,
    cancelled: HashSet<SessionId>,
    cancelled_roots: HashSet<SessionId>,
    stopped: HashMap<SessionId, StopReason>,
    closed_roots: HashSet<SessionId>,
}

impl State {
    fn is_cancelled(&self, id: SessionId) -> bool {
        let mut cursor = Some(id);
        while let Some(current) = cursor {
            if self.cancelled.contains(&current) {
                return true;
            }
            let Some(lineage) = self.lineage.get(&current) else {
                return self.cancelled_roots.contains(&current);
            };
            if self.cancelled_roots.contains(&lineage.root) {
                return true;
            }
            cursor = lineage.parent;
        }
        false
    }

    /// Drop everything remembered about `root` once it is closed and idle.
    fn prune(&mut self, root: SessionId) {
        if !self.closed_roots.contains(&root)
            || self.watched.values().any(|watched| watched.root == root)
        {
            return;
        }
        let tree: Vec<SessionId> = self
            .lineage
            .iter()
            .filter(|(_, lineage)| lineage.root == root)
            .map(|(id, _)| *id)
            .collect();
        for id in &tree {
            self.lineage.remove(id);
            self.cancelled.remove(id);
            self.stopped.remove(id);
        }
        self.cancelled.remove(&root);
        self.cancelled_roots.remove(&root);
        self.closed_roots.remove(&root);
        debug!(%root, sessions = tree.len(), "root forgotten");
    }
}

pub struct LifecycleManager {
    registry: Arc<SessionRegistry>,
    limiter: Arc<ConcurrencyLimiter>,
    tracker: Arc<CallTracker>,
    session_timeout: Duration,
    state: Mutex<State>,
}

impl LifecycleManager {
    pub fn new(
        registry: Arc<SessionRegistry>,
        limiter: Arc<ConcurrencyLimiter>,
        tracker: Arc<CallTracker>,
        session_timeout: Duration,
    ) -> Self {
        Self {
            registry,
            limiter,
            tracker,
            session_timeout,
            state: Mutex::new(State::default()),
        }
    }

    /// Start watching `session`. The token is already cancelled when an
    /// ancestor or the root was cancelled.
    pub fn register(&self, session: &Session) -> SessionWatch {
        let deadline = Instant::now() + self.session_timeout;
        let token = CancellationToken::new();
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.lineage.insert(
            session.id,
            Lineage {
                root: session.root,
                parent: session.parent,
            },
        );
        if state.is_cancelled(session.id) {
            token.cancel();
            state.stopped.insert(session.id, StopReason::Cancelled);
        }
        state.watched.insert(
            session.id,
            Watched {
                root: session.root,
                deadline,
                token: token.clone(),
            },
        );
        debug!(session = %session.id, timeout_ms = self.session_timeout.as_millis() as u64, "session registered");
        SessionWatch { token, deadline }
    }

    /// Stop watching a session the spawner has finished with.
    pub fn deregister(&self, id: SessionId) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(watched) = state.watched.remove(&id) {
            state.prune(watched.root);
        }
    }

    /// The tree under `root` is finished: forget it once nothing is watched.
    pub fn close_root(&self, root: SessionId) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.closed_roots.insert(root);
        state.prune(root);
    }

    /// Close sessions a previous process left open. Returns how many.
    ///
    /// `Running` sessions become `TimedOut`, `Created` ones `Failed`; either
    /// way the call tracker stops counting them as open.
    #[instrument(skip_all, fields(sessions = sessions.len()))]
    pub fn recover(&self, sessions: &[Session]) -> usize {
        let mut recovered = 0;
        for session in sessions.iter().filter(|session| !session.state.is_closed()) {
            let to = match session.state {
                SessionState::Running => SessionState::TimedOut,
                _ => SessionState::Failed,
            };
            match self.registry.finish(
                session.id,
                to,
                Some("abandoned by a previous process".to_string()),
            ) {
                Ok(true) => recovered += 1,
                Ok(false) => {}
                Err(err) => warn!(session = %session.id, error = %err, "failed to recover session"),
            }
            if let Err(err) = self.tracker.session_closed(session.root, session.id) {
                warn!(session = %session.id, error = %err, "failed to notify call tracker");
            }
        }
        if recovered > 0 {
            info!(recovered, "closed sessions abandoned by a previous process");
        }
        recovered
    }

    /// Time out every session past its deadline. Returns the expired ids.
    #[instrument(skip_all)]
    pub fn sweep(&self) -> Vec<SessionId> {
        let now = Instant::now();
        let expired: Vec<SessionId> = {
            let state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
            state
                .watched
                .iter()
                .filter(|(_, watched)| watched.deadline <= now)
                .map(|(id, _)| *id)
                .collect()
        };
        for id in &expired {
            self.stop(*id, StopReason::TimedOut);
        }
        if !expired.is_empty() {
            info!(expired = expired.len(), "sweep timed out sessions");
        }
        expired
    }

    /// Cancel `id` and every open descendant. Returns how many were stopped.
    pub fn cancel_session(&self, id: SessionId) -> usize {
        let targets: Vec<SessionId> = {
            let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
            state.cancelled.insert(id);
            state
                .watched
                .keys()
                .copied()
                .filter(|candidate| state.is_cancelled(*candidate))
                .collect()
        };
        for target in &targets {
            self.stop(*target, StopReason::Cancelled);
        }
        info!(session = %id, stopped = targets.len(), "session cancelled");
        targets.len()
    }

    /// Cancel every open session under `root` and refuse new ones.
    pub fn cancel_root(&self, root: SessionId) -> usize {
        let targets: Vec<SessionId> = {
            let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
            state.cancelled_roots.insert(root);
            state
                .watched
                .iter()
                .filter(|(_, watched)| watched.root == root)
                .map(|(id, _)| *id)
                .collect()
        };
        for target in &targets {
            self.stop(*target, StopReason::Cancelled);
        }
        info!(%root, stopped = targets.len(), "root cancelled");
        targets.len()
    }

    /// Whether `id` or any of its ancestors (or its root) was cancelled.
    pub fn is_cancelled(&self, id: SessionId) -> bool {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_cancelled(id)
    }

    /// Error describing why `id` was stopped; `Cancelled` when unknown.
    pub fn stop_error(&self, id: SessionId) -> ConductorError {
        let reason = self
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .stopped
            .get(&id)
            .copied();
        match reason {
            Some(StopReason::TimedOut) => ConductorError::SessionTimedOut(id),
            Some(StopReason::Cancelled) | None => ConductorError::Cancelled(id),
        }
    }

    /// Entries of every kind held in memory, watched sessions included.
    pub fn retained(&self) -> usize {
        let state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.watched.len()
            + state.lineage.len()
            + state.cancelled.len()
            + state.cancelled_roots.len()
            + state.stopped.len()
            + state.closed_roots.len()
    }

    pub fn watching(&self) -> usize {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .watched
            .len()
    }

    fn stop(&self, id: SessionId, reason: StopReason) {
        let watched = {
            let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
            let watched = state.watched.remove(&id);
            if let Some(watched) = &watched {
                state.stopped.insert(id, reason);
                state.prune(watched.root);
            }
            watched
        };
        let Some(watched) = watched else {
            return;
        };

        watched.token.cancel();
        self.limiter.release(id);
        let (to, message) = match reason {
            StopReason::TimedOut => (SessionState::TimedOut, "session deadline exceeded"),
            StopReason::Cancelled => (SessionState::Cancelled, "session cancelled"),
        };
        match self.registry.finish(id, to, Some(message.to_string())) {
            Ok(true) => debug!(session = %id, state = to.as_str(), "session stopped"),
            Ok(false) => {}
            Err(err) => warn!(session = %id, error = %err, "failed to record stopped session"),
        }
        if let Err(err) = self.tracker.session_closed(watched.root, id) {
            warn!(session = %id, error = %err, "failed to notify call tracker");
        }
    }
}

/// Run `sweep` every `interval` until `shutdown` is cancelled.
pub fn spawn_sweeper(
    lifecycle: Arc<LifecycleManager>,
    interval: Duration,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                () = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    lifecycle.sweep();
                }
            }
        }
        debug!("sweeper stopped");
    })
}
