//! Structured error taxonomy for orchestration requests.
//!
//! Every per-request failure is returned to the caller as a [`ConductorError`]
//! value so a coordinating caller can decide to retry, refine, or abandon.
//! Only [`ConductorError::Configuration`] is fatal, and only at startup.

use serde_json::{Value, json};
use thiserror::Error;

use crate::core::types::{LoopLimit, SessionId, ValidationVerdict};

/// Main error type for conductor operations.
#[derive(Debug, Clone, Error)]
pub enum ConductorError {
    /// One or more agent specifications are malformed. Lists every failure.
    #[error("invalid agent specifications:\n- {}", .0.join("\n- "))]
    Configuration(Vec<String>),

    /// Lookup of an unknown agent type.
    #[error("unknown agent type '{0}'")]
    NotFound(String),

    /// The request does not match the agent's input schema or lineage rules.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// A loop-guard budget would be exceeded by this spawn.
    #[error("loop limit exceeded: {limit} ({used} of {cap} used)")]
    LoopLimitExceeded { limit: LoopLimit, used: u32, cap: u32 },

    /// Admission policy is `reject` and every slot is taken.
    #[error("all {limit} concurrency slots are in use")]
    ConcurrencyRejected { limit: usize },

    /// Transport failure or timeout, after the automatic retry.
    #[error("completion service failed after {attempts} attempts: {message}")]
    CompletionService { attempts: u32, message: String },

    /// The agent's response did not conform to its output schema twice.
    #[error("output schema violation: {}", .errors.join("; "))]
    OutputSchemaViolation { errors: Vec<String> },

    /// The quality validator rejected the session's output.
    #[error("validation rejected session {session}: {}", .verdict.summary())]
    ValidationRejected {
        session: SessionId,
        verdict: ValidationVerdict,
    },

    /// A memory proposal failed relatedness checks or could not be applied.
    #[error("memory operation rejected: {0}")]
    MemoryOperationRejected(String),

    /// The lifecycle sweep expired the session.
    #[error("session {0} exceeded its deadline")]
    SessionTimedOut(SessionId),

    /// The session (or one of its ancestors) was cancelled.
    #[error("session {0} was cancelled")]
    Cancelled(SessionId),

    /// Durable state could not be read or written.
    #[error("state storage failed: {0}")]
    Storage(String),
}

impl ConductorError {
    /// Wrap an `anyhow` failure from the storage layer.
    pub fn storage(err: anyhow::Error) -> Self {
        ConductorError::Storage(format!("{err:#}"))
    }

    /// Stable machine-readable identifier for the error kind.
    pub fn kind(&self) -> &'static str {
        match self {
            ConductorError::Configuration(_) => "configuration_error",
            ConductorError::NotFound(_) => "not_found",
            ConductorError::InvalidRequest(_) => "invalid_request",
            ConductorError::LoopLimitExceeded { .. } => "loop_limit_exceeded",
            ConductorError::ConcurrencyRejected { .. } => "concurrency_rejected",
            ConductorError::CompletionService { .. } => "completion_service_error",
            ConductorError::OutputSchemaViolation { .. } => "output_schema_violation",
            ConductorError::ValidationRejected { .. } => "validation_rejected",
            ConductorError::MemoryOperationRejected(_) => "memory_operation_rejected",
            ConductorError::SessionTimedOut(_) => "session_timed_out",
            ConductorError::Cancelled(_) => "cancelled",
            ConductorError::Storage(_) => "storage_error",
        }
    }

    /// Whether the error should stop the process rather than one request.
    pub fn is_fatal(&self) -> bool {
        matches!(self, ConductorError::Configuration(_))
    }

    /// Structured error body returned across the tool-invocation boundary.
    pub fn to_json(&self) -> Value {
        json!({
            "error": {
                "kind": self.kind(),
                "message": self.to_string(),
            }
        })
    }
}

/// Result type alias for conductor operations.
pub type Result<T> = std::result::Result<T, ConductorError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn configuration_error_lists_every_failure() {
        let err = ConductorError::Configuration(vec![
            "a.toml: missing id".to_string(),
            "b.json: bad template".to_string(),
        ]);
        let message = err.to_string();
        assert!(message.contains("a.toml: missing id"));
        assert!(message.contains("b.json: bad template"));
        assert!(err.is_fatal());
    }

    #[test]
    fn per_request_errors_are_not_fatal() {
        let err = ConductorError::LoopLimitExceeded {
            limit: LoopLimit::Depth,
            used: 3,
            cap: 2,
        };
        assert!(!err.is_fatal());
        assert_eq!(err.kind(), "loop_limit_exceeded");
    }

    #[test]
    fn json_body_carries_kind_and_message() {
        let err = ConductorError::ConcurrencyRejected { limit: 4 };
        let body = err.to_json();
        assert_eq!(body["error"]["kind"], "concurrency_rejected");
        assert_eq!(
            body["error"]["message"],
            "all 4 concurrency slots are in use"
        );
    }
}
