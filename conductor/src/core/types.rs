//! Shared deterministic types for the orchestration core.
//!
//! These types define stable contracts between components. They do no I/O and
//! serialize to stable JSON so session and tracker records stay diffable.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::core::fingerprint::TaskFingerprint;

/// Unique identifier of a session (and of a root session tree).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(Uuid);

impl SessionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for SessionId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

/// Which tool allowlist applies to an invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ToolScope {
    /// Agent spawned by another agent.
    Restricted,
    /// Agent invoked directly by the root caller.
    Full,
}

impl ToolScope {
    pub fn as_str(self) -> &'static str {
        match self {
            ToolScope::Restricted => "restricted",
            ToolScope::Full => "full",
        }
    }
}

/// Tool-access allowlist keyed by execution scope. `"*"` allows everything.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolAccess {
    pub restricted: Vec<String>,
    pub full: Vec<String>,
}

impl ToolAccess {
    pub fn for_scope(&self, scope: ToolScope) -> &[String] {
        match scope {
            ToolScope::Restricted => &self.restricted,
            ToolScope::Full => &self.full,
        }
    }

    pub fn allows(&self, scope: ToolScope, tool: &str) -> bool {
        self.for_scope(scope)
            .iter()
            .any(|allowed| allowed == "*" || allowed == tool)
    }
}

/// Declarative description of one agent type. Immutable after load.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Specification {
    pub id: String,
    /// Externally exposed operation name (registers one tool when present).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub operation: Option<String>,
    /// Prompt template, rendered against the task input.
    pub template: String,
    /// Ordered system instructions.
    pub instructions: Vec<String>,
    pub input_schema: Value,
    pub output_schema: Value,
    pub tools: ToolAccess,
}

impl Specification {
    /// Name other agents must hold in their allowlist to delegate to this one.
    pub fn tool_name(&self) -> &str {
        self.operation.as_deref().unwrap_or(&self.id)
    }
}

/// Explicit budget/lineage context threaded through every spawn.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionContext {
    /// Root session id of the delegation tree.
    pub root: SessionId,
    /// Session that is delegating, absent for the root caller.
    pub parent: Option<SessionId>,
    /// Recursion depth (0 for agents invoked by the root caller).
    pub depth: u32,
    /// Delegation calls left under `root`.
    pub remaining_budget: u32,
    pub scope: ToolScope,
}

impl ExecutionContext {
    /// Context for the root caller starting a new session tree.
    pub fn root(call_budget: u32) -> Self {
        Self {
            root: SessionId::new(),
            parent: None,
            depth: 0,
            remaining_budget: call_budget,
            scope: ToolScope::Full,
        }
    }

    /// Context for an agent delegating from `parent`, one level deeper.
    pub fn delegated_from(&self, parent: SessionId) -> Self {
        Self {
            root: self.root,
            parent: Some(parent),
            depth: self.depth + 1,
            remaining_budget: self.remaining_budget,
            scope: ToolScope::Restricted,
        }
    }

    pub fn is_delegated(&self) -> bool {
        self.parent.is_some()
    }
}

/// Expected JSON shape of a deliverable.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Shape {
    #[default]
    Any,
    String,
    Number,
    Boolean,
    Array,
    Object,
}

impl Shape {
    pub fn matches(self, value: &Value) -> bool {
        match self {
            Shape::Any => true,
            Shape::String => value.is_string(),
            Shape::Number => value.is_number(),
            Shape::Boolean => value.is_boolean(),
            Shape::Array => value.is_array(),
            Shape::Object => value.is_object(),
        }
    }

    pub fn of(value: &Value) -> &'static str {
        match value {
            Value::Null => "null",
            Value::Bool(_) => "boolean",
            Value::Number(_) => "number",
            Value::String(_) => "string",
            Value::Array(_) => "array",
            Value::Object(_) => "object",
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Shape::Any => "any",
            Shape::String => "string",
            Shape::Number => "number",
            Shape::Boolean => "boolean",
            Shape::Array => "array",
            Shape::Object => "object",
        }
    }
}

/// One expected deliverable in an agent's structured output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Deliverable {
    /// JSON pointer into the output (e.g. `/findings`).
    pub path: String,
    #[serde(default)]
    pub shape: Shape,
    #[serde(default)]
    pub non_empty: bool,
}

impl Deliverable {
    pub fn new(path: impl Into<String>, shape: Shape) -> Self {
        Self {
            path: path.into(),
            shape,
            non_empty: false,
        }
    }

    pub fn non_empty(mut self) -> Self {
        self.non_empty = true;
        self
    }
}

/// Present on refinement attempts only.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Refinement {
    /// Fingerprint of the original task, shared by every attempt.
    pub fingerprint: TaskFingerprint,
    /// 1 for the first refinement.
    pub attempt: u32,
    pub gaps: Vec<String>,
}

/// A request to perform one bounded unit of specialized work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskRequest {
    pub agent_type: String,
    pub description: String,
    #[serde(default)]
    pub input: Map<String, Value>,
    /// Declared subject, used for memory relatedness checks.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subject: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub deliverables: Vec<Deliverable>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refinement: Option<Refinement>,
    pub context: ExecutionContext,
}

impl TaskRequest {
    pub fn new(
        agent_type: impl Into<String>,
        description: impl Into<String>,
        context: ExecutionContext,
    ) -> Self {
        Self {
            agent_type: agent_type.into(),
            description: description.into(),
            input: Map::new(),
            subject: None,
            deliverables: Vec::new(),
            refinement: None,
            context,
        }
    }

    pub fn with_input(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.input.insert(key.into(), value.into());
        self
    }

    pub fn with_subject(mut self, subject: impl Into<String>) -> Self {
        self.subject = Some(subject.into());
        self
    }

    pub fn with_deliverable(mut self, deliverable: Deliverable) -> Self {
        self.deliverables.push(deliverable);
        self
    }
}

/// Self-delegation requested by an agent in its response envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Delegation {
    pub agent_type: String,
    pub description: String,
    #[serde(default)]
    pub input: Map<String, Value>,
    #[serde(default)]
    pub subject: Option<String>,
}

/// Speaker of a transcript message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

/// One message in a session transcript.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
}

impl Message {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }
}

/// Session lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Created,
    Running,
    Completed,
    Failed,
    TimedOut,
    /// Refused by the loop guard.
    Terminated,
    Cancelled,
    AwaitingValidation,
    Accepted,
    RefinementRequested,
    Rejected,
}

impl SessionState {
    /// True once the spawner is done with the session.
    pub fn is_closed(self) -> bool {
        !matches!(self, SessionState::Created | SessionState::Running)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            SessionState::Created => "created",
            SessionState::Running => "running",
            SessionState::Completed => "completed",
            SessionState::Failed => "failed",
            SessionState::TimedOut => "timed_out",
            SessionState::Terminated => "terminated",
            SessionState::Cancelled => "cancelled",
            SessionState::AwaitingValidation => "awaiting_validation",
            SessionState::Accepted => "accepted",
            SessionState::RefinementRequested => "refinement_requested",
            SessionState::Rejected => "rejected",
        }
    }
}

/// Which loop-guard budget refused a spawn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoopLimit {
    Calls,
    Depth,
    Refinements,
    /// The root session tree was closed.
    RootClosed,
}

impl fmt::Display for LoopLimit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            LoopLimit::Calls => "total calls",
            LoopLimit::Depth => "recursion depth",
            LoopLimit::Refinements => "refinement attempts",
            LoopLimit::RootClosed => "root session closed",
        };
        f.write_str(label)
    }
}

/// Admission behavior when every concurrency slot is taken.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AdmissionPolicy {
    /// Wait for a slot (backpressure).
    #[default]
    Block,
    /// Fail fast with `ConcurrencyRejected`.
    Reject,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Minor,
    Major,
    Critical,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Issue {
    pub severity: Severity,
    pub description: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Decision {
    Accept,
    Refine,
    Reject,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Confidence {
    Low,
    Medium,
    High,
}

/// Outcome of the quality validator. Immutable once produced.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationVerdict {
    pub decision: Decision,
    pub issues: Vec<Issue>,
    pub confidence: Confidence,
}

impl ValidationVerdict {
    /// Same issues, forced to `reject`, with the reason appended.
    pub fn into_rejection(self, reason: impl Into<String>) -> Self {
        let mut issues = self.issues;
        issues.push(Issue {
            severity: Severity::Critical,
            description: reason.into(),
        });
        Self {
            decision: Decision::Reject,
            issues,
            confidence: Confidence::Low,
        }
    }

    pub fn gaps(&self) -> Vec<String> {
        self.issues
            .iter()
            .map(|issue| issue.description.clone())
            .collect()
    }

    pub fn summary(&self) -> String {
        if self.issues.is_empty() {
            return "no issues".to_string();
        }
        self.gaps().join("; ")
    }
}

/// Declarative knowledge-base mutation proposed by an agent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum MemoryOperation {
    Create {
        entity: String,
        kind: String,
        #[serde(default)]
        observations: Vec<String>,
    },
    Append {
        entity: String,
        observations: Vec<String>,
    },
    Relate {
        from: String,
        relation: String,
        to: String,
    },
    Retract {
        entity: String,
    },
}

impl MemoryOperation {
    /// Entity the operation is about; relatedness is checked against it.
    pub fn subject(&self) -> &str {
        match self {
            MemoryOperation::Create { entity, .. }
            | MemoryOperation::Append { entity, .. }
            | MemoryOperation::Retract { entity } => entity,
            MemoryOperation::Relate { from, .. } => from,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            MemoryOperation::Create { .. } => "create",
            MemoryOperation::Append { .. } => "append",
            MemoryOperation::Relate { .. } => "relate",
            MemoryOperation::Retract { .. } => "retract",
        }
    }
}

/// A memory operation plus the lineage needed to validate it.
#[derive(Debug, Clone, PartialEq)]
pub struct MemoryOperationProposal {
    pub operation: MemoryOperation,
    pub session: SessionId,
    pub request: TaskRequest,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delegated_context_goes_one_level_deeper() {
        let root = ExecutionContext::root(20);
        let parent = SessionId::new();
        let child = root.delegated_from(parent);
        assert_eq!(child.root, root.root);
        assert_eq!(child.parent, Some(parent));
        assert_eq!(child.depth, 1);
        assert_eq!(child.scope, ToolScope::Restricted);
        assert!(child.is_delegated());
        assert!(!root.is_delegated());
    }

    #[test]
    fn wildcard_allowlist_allows_any_tool() {
        let access = ToolAccess {
            restricted: vec!["*".to_string()],
            full: vec!["search".to_string()],
        };
        assert!(access.allows(ToolScope::Restricted, "anything"));
        assert!(access.allows(ToolScope::Full, "search"));
        assert!(!access.allows(ToolScope::Full, "write"));
    }

    #[test]
    fn memory_operation_uses_tagged_json() {
        let op: MemoryOperation = serde_json::from_str(
            r#"{"op":"relate","from":"auth service","relation":"depends_on","to":"db"}"#,
        )
        .expect("parse");
        assert_eq!(op.subject(), "auth service");
        assert_eq!(op.label(), "relate");
    }

    #[test]
    fn session_id_round_trips_through_display() {
        let id = SessionId::new();
        let parsed: SessionId = id.to_string().parse().expect("parse");
        assert_eq!(parsed, id);
    }
}
