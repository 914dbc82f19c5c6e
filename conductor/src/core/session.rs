//! Session records and the session state machine.
//!
//! ```text
//! Created ─┬─> Running ─┬─> Completed ──> AwaitingValidation ─┬─> Accepted
//!          │            ├─> Failed                            ├─> RefinementRequested
//!          │            ├─> TimedOut                          └─> Rejected
//!          │            └─> Cancelled
//!          └─> Terminated | Failed | TimedOut | Cancelled
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::core::fingerprint::TaskFingerprint;
use crate::core::types::{Message, SessionId, SessionState, TaskRequest, ToolScope};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid session transition {from:?} -> {to:?}")]
pub struct TransitionError {
    pub from: SessionState,
    pub to: SessionState,
}

/// One bounded execution of a spawned agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub id: SessionId,
    pub agent_type: String,
    pub root: SessionId,
    pub parent: Option<SessionId>,
    pub depth: u32,
    pub scope: ToolScope,
    pub fingerprint: TaskFingerprint,
    pub state: SessionState,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub transcript: Vec<Message>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Session {
    /// Open a new session in `Created` for `request`.
    pub fn open(id: SessionId, request: &TaskRequest, fingerprint: TaskFingerprint) -> Self {
        let now = Utc::now();
        Self {
            id,
            agent_type: request.agent_type.clone(),
            root: request.context.root,
            parent: request.context.parent,
            depth: request.context.depth,
            scope: request.context.scope,
            fingerprint,
            state: SessionState::Created,
            created_at: now,
            updated_at: now,
            transcript: Vec::new(),
            output: None,
            error: None,
        }
    }

    pub fn transition(&mut self, to: SessionState) -> Result<(), TransitionError> {
        if !can_transition(self.state, to) {
            return Err(TransitionError {
                from: self.state,
                to,
            });
        }
        self.state = to;
        self.touch();
        Ok(())
    }

    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}

/// Allowed edges of the session state machine.
pub fn can_transition(from: SessionState, to: SessionState) -> bool {
    use SessionState as S;
    matches!(
        (from, to),
        (
            S::Created,
            S::Running | S::Terminated | S::Failed | S::TimedOut | S::Cancelled
        ) | (
            S::Running,
            S::Completed | S::Failed | S::TimedOut | S::Cancelled
        ) | (S::Completed, S::AwaitingValidation)
            | (
                S::AwaitingValidation,
                S::Accepted | S::RefinementRequested | S::Rejected
            )
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::ExecutionContext;

    fn session() -> Session {
        let request = TaskRequest::new("reviewer", "review", ExecutionContext::root(20));
        let fingerprint = TaskFingerprint::of(&request);
        Session::open(SessionId::new(), &request, fingerprint)
    }

    #[test]
    fn happy_path_reaches_accepted() {
        let mut s = session();
        for state in [
            SessionState::Running,
            SessionState::Completed,
            SessionState::AwaitingValidation,
            SessionState::Accepted,
        ] {
            s.transition(state).expect("transition");
        }
        assert_eq!(s.state, SessionState::Accepted);
    }

    #[test]
    fn loop_limit_terminates_from_created() {
        let mut s = session();
        s.transition(SessionState::Terminated).expect("terminate");
        assert!(s.state.is_closed());
    }

    #[test]
    fn terminal_states_do_not_transition_again() {
        let mut s = session();
        s.transition(SessionState::Running).expect("run");
        s.transition(SessionState::TimedOut).expect("time out");
        let err = s.transition(SessionState::Completed).unwrap_err();
        assert_eq!(err.from, SessionState::TimedOut);
        assert_eq!(err.to, SessionState::Completed);
    }

    #[test]
    fn validation_requires_completion() {
        let mut s = session();
        s.transition(SessionState::Running).expect("run");
        s.transition(SessionState::Failed).expect("fail");
        assert!(s.transition(SessionState::AwaitingValidation).is_err());
    }
}
