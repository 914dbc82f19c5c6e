//! Agent spawning: one bounded session per request.
//!
//! A spawn validates the request, opens a session, asks the call tracker for
//! admission, takes a concurrency slot, renders the instructions, calls the
//! completion service and checks the structured output. Whatever happens,
//! the slot is released and the session reaches a terminal state exactly
//! once. Delegations an agent asks for run after its own slot is released.

use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use futures::future::{BoxFuture, join_all};
use serde_json::Value;
use tracing::{debug, info, instrument, warn};

use crate::core::envelope::{AgentEnvelope, parse_envelope};
use crate::core::fingerprint::TaskFingerprint;
use crate::core::session::Session;
use crate::core::types::{
    Delegation, ExecutionContext, MemoryOperation, Message, SessionId, SessionState, TaskRequest,
};
use crate::error::{ConductorError, Result};
use crate::io::catalog::{AgentSpec, Catalog};
use crate::io::completion::{CompletionError, CompletionRequest, CompletionService};
use crate::io::prompt::{self, conform_instruction};
use crate::lifecycle::{LifecycleManager, SessionWatch};
use crate::limiter::ConcurrencyLimiter;
use crate::sessions::SessionRegistry;
use crate::tracker::CallTracker;

/// Completion attempts per call: the first try plus one automatic retry.
const COMPLETION_ATTEMPTS: u32 = 2;

/// Shared components every spawn consults.
#[derive(Clone)]
pub struct Runtime {
    pub catalog: Arc<Catalog>,
    pub principles: Arc<str>,
    pub sessions: Arc<SessionRegistry>,
    pub tracker: Arc<CallTracker>,
    pub limiter: Arc<ConcurrencyLimiter>,
    pub lifecycle: Arc<LifecycleManager>,
}

/// Successful spawn: the validated output plus everything it proposed.
#[derive(Debug, Clone)]
pub struct SpawnResult {
    pub session: SessionId,
    pub agent_type: String,
    /// The request as admitted (authoritative depth and remaining budget).
    pub request: TaskRequest,
    pub fingerprint: TaskFingerprint,
    pub output: Value,
    pub memory: Vec<MemoryOperation>,
    pub delegations: Vec<DelegationOutcome>,
}

impl SpawnResult {
    /// Context for work this session delegates.
    pub fn delegation_context(&self) -> ExecutionContext {
        self.request.context.delegated_from(self.session)
    }

    /// This result and every successful descendant, depth first.
    pub fn walk(&self) -> Vec<&SpawnResult> {
        let mut out = vec![self];
        for delegation in &self.delegations {
            if let Ok(child) = &delegation.result {
                out.extend(child.walk());
            }
        }
        out
    }
}

/// Outcome of one delegated spawn, success or structured error.
#[derive(Debug, Clone)]
pub struct DelegationOutcome {
    pub agent_type: String,
    pub description: String,
    pub result: std::result::Result<SpawnResult, ConductorError>,
}

impl DelegationOutcome {
    pub fn session(&self) -> Option<SessionId> {
        self.result.as_ref().ok().map(|result| result.session)
    }
}

pub struct AgentSpawner {
    runtime: Runtime,
    completion: Arc<dyn CompletionService>,
    request_timeout: Duration,
}

impl AgentSpawner {
    pub fn new(
        runtime: Runtime,
        completion: Arc<dyn CompletionService>,
        request_timeout: Duration,
    ) -> Self {
        Self {
            runtime,
            completion,
            request_timeout,
        }
    }

    pub fn runtime(&self) -> &Runtime {
        &self.runtime
    }

    /// Spawn a session of `agent_type` for `request`.
    pub fn spawn<'a>(
        &'a self,
        agent_type: &'a str,
        request: TaskRequest,
    ) -> BoxFuture<'a, Result<SpawnResult>> {
        async move { self.spawn_session(agent_type, request).await }.boxed()
    }

    #[instrument(skip_all, fields(agent = agent_type, root = %request.context.root, depth = request.context.depth))]
    async fn spawn_session(&self, agent_type: &str, request: TaskRequest) -> Result<SpawnResult> {
        let spec = self.resolve(agent_type, &request)?;
        let fingerprint = TaskFingerprint::of(&request);
        let id = SessionId::new();
        let rt = &self.runtime;

        rt.sessions
            .open(Session::open(id, &request, fingerprint.clone()))?;

        let admission = match rt.tracker.admit(&request, id, &fingerprint) {
            Ok(admission) => admission,
            Err(err) => {
                let state = terminal_state(&err);
                if let Err(record_err) = rt.sessions.finish(id, state, Some(err.to_string())) {
                    warn!(session = %id, error = %record_err, "failed to record refused session");
                }
                return Err(err);
            }
        };

        let mut cleanup = SessionCleanup {
            runtime: rt,
            id,
            root: request.context.root,
            done: false,
        };
        let mut request = request;
        request.context.depth = admission.depth;
        request.context.remaining_budget = admission.remaining_budget;
        let session = match rt.sessions.update(id, |session| {
            session.depth = admission.depth;
            Ok(session.clone())
        }) {
            Ok(session) => session,
            Err(err) => {
                warn!(session = %id, error = %err, "failed to record admission");
                cleanup.finish(SessionState::Failed, Some(err.to_string()), Vec::new(), None);
                return Err(err);
            }
        };

        let watch = rt.lifecycle.register(&session);

        let mut transcript = Vec::new();
        let outcome = self.execute(&spec, &request, id, &watch, &mut transcript).await;
        let envelope = match outcome {
            Ok(envelope) => envelope,
            Err(err) => {
                warn!(session = %id, kind = err.kind(), error = %err, "session failed");
                cleanup.finish(terminal_state(&err), Some(err.to_string()), transcript, None);
                return Err(err);
            }
        };

        let stopped = rt.lifecycle.stop_error(id);
        let completed = cleanup.finish(
            SessionState::Completed,
            None,
            transcript,
            Some(envelope.output.clone()),
        );
        if !completed {
            return Err(stopped);
        }
        info!(session = %id, memory = envelope.memory.len(), delegations = envelope.delegate.len(), "session completed");

        let AgentEnvelope {
            output,
            memory,
            delegate,
        } = envelope;
        let mut result = SpawnResult {
            session: id,
            agent_type: agent_type.to_string(),
            request,
            fingerprint,
            output,
            memory,
            delegations: Vec::new(),
        };
        if !delegate.is_empty() {
            result.delegations = self.run_delegations(&result, delegate).await;
        }
        Ok(result)
    }

    /// Step 1: lookup and request checks, before any state is created.
    fn resolve(&self, agent_type: &str, request: &TaskRequest) -> Result<Arc<AgentSpec>> {
        if request.agent_type != agent_type {
            return Err(ConductorError::InvalidRequest(format!(
                "request is for '{}' but was sent to '{agent_type}'",
                request.agent_type
            )));
        }
        let spec = self
            .runtime
            .catalog
            .get(agent_type)
            .map_err(|err| ConductorError::InvalidRequest(err.to_string()))?;

        let violations = spec.validate_input(&request.input);
        if !violations.is_empty() {
            return Err(ConductorError::InvalidRequest(format!(
                "input for '{agent_type}' does not match its schema: {}",
                violations.join("; ")
            )));
        }

        if let Some(parent) = request.context.parent {
            let parent_session = self.runtime.sessions.get(parent).map_err(|_| {
                ConductorError::InvalidRequest(format!("unknown parent session {parent}"))
            })?;
            if parent_session.root != request.context.root {
                return Err(ConductorError::InvalidRequest(format!(
                    "parent session {parent} belongs to a different root"
                )));
            }
            if self.runtime.lifecycle.is_cancelled(parent) {
                return Err(ConductorError::InvalidRequest(format!(
                    "parent session {parent} was cancelled"
                )));
            }
            let parent_spec = self
                .runtime
                .catalog
                .get(&parent_session.agent_type)
                .map_err(|err| ConductorError::InvalidRequest(err.to_string()))?;
            let tool = spec.spec.tool_name();
            if !parent_spec.spec.tools.allows(parent_session.scope, tool) {
                return Err(ConductorError::InvalidRequest(format!(
                    "'{}' may not delegate to '{tool}' in {} scope",
                    parent_session.agent_type,
                    parent_session.scope.as_str()
                )));
            }
        }
        Ok(spec)
    }

    /// Steps 3-5: slot, instructions, completion, output checks.
    async fn execute(
        &self,
        spec: &AgentSpec,
        request: &TaskRequest,
        id: SessionId,
        watch: &SessionWatch,
        transcript: &mut Vec<Message>,
    ) -> Result<AgentEnvelope> {
        let rt = &self.runtime;
        tokio::select! {
            biased;
            () = watch.token.cancelled() => return Err(rt.lifecycle.stop_error(id)),
            acquired = rt.limiter.acquire(id) => acquired?,
        }

        let payload = prompt::build(&spec.spec, request, &rt.principles)?;
        transcript.extend(payload.messages());
        rt.sessions
            .transition(id, SessionState::Running)
            .map_err(|err| self.stopped_or(id, watch, err))?;
        debug!(session = %id, prompt_bytes = payload.text.len(), "session running");

        let content = self.complete_with_retry(id, transcript, watch).await?;
        transcript.push(Message::assistant(content.clone()));
        let errors = match conform(spec, &content) {
            Ok(envelope) => return Ok(envelope),
            Err(errors) => errors,
        };

        warn!(session = %id, errors = errors.len(), "response did not conform, retrying once");
        transcript.push(Message::user(conform_instruction(&errors)));
        let content = self.complete_with_retry(id, transcript, watch).await?;
        transcript.push(Message::assistant(content.clone()));
        conform(spec, &content).map_err(|errors| ConductorError::OutputSchemaViolation { errors })
    }

    #[instrument(skip_all, fields(session = %id))]
    async fn complete_with_retry(
        &self,
        id: SessionId,
        transcript: &[Message],
        watch: &SessionWatch,
    ) -> Result<String> {
        let mut last_error = String::new();
        for attempt in 1..=COMPLETION_ATTEMPTS {
            let call = self.completion.complete(CompletionRequest {
                session: id,
                messages: transcript.to_vec(),
            });
            let outcome = tokio::select! {
                biased;
                () = watch.token.cancelled() => return Err(self.runtime.lifecycle.stop_error(id)),
                outcome = tokio::time::timeout(self.request_timeout, call) => outcome,
            };
            let err = match outcome {
                Ok(Ok(completion)) => return Ok(completion.content),
                Ok(Err(err)) => err,
                Err(_) => CompletionError::Timeout(self.request_timeout),
            };
            warn!(attempt, error = %err, "completion attempt failed");
            last_error = err.to_string();
            if !err.is_retryable() {
                return Err(ConductorError::CompletionService {
                    attempts: attempt,
                    message: last_error,
                });
            }
        }
        Err(ConductorError::CompletionService {
            attempts: COMPLETION_ATTEMPTS,
            message: last_error,
        })
    }

    async fn run_delegations(
        &self,
        parent: &SpawnResult,
        delegations: Vec<Delegation>,
    ) -> Vec<DelegationOutcome> {
        let context = parent.delegation_context();
        debug!(parent = %parent.session, count = delegations.len(), "running delegations");
        let spawns = delegations.into_iter().map(|delegation| {
            let request = TaskRequest {
                agent_type: delegation.agent_type.clone(),
                description: delegation.description.clone(),
                input: delegation.input,
                subject: delegation.subject,
                deliverables: Vec::new(),
                refinement: None,
                context: context.clone(),
            };
            async move {
                let agent_type = delegation.agent_type;
                let result = self.spawn(&agent_type, request).await;
                DelegationOutcome {
                    agent_type,
                    description: delegation.description,
                    result,
                }
            }
        });
        join_all(spawns).await
    }

    /// Prefer the lifecycle's reason when the session was stopped underneath us.
    fn stopped_or(&self, id: SessionId, watch: &SessionWatch, err: ConductorError) -> ConductorError {
        if watch.token.is_cancelled() {
            self.runtime.lifecycle.stop_error(id)
        } else {
            err
        }
    }
}

/// Parse the envelope and validate its output against the output schema.
fn conform(spec: &AgentSpec, content: &str) -> std::result::Result<AgentEnvelope, Vec<String>> {
    let envelope = parse_envelope(content)?;
    let violations = spec.validate_output(&envelope.output);
    if violations.is_empty() {
        Ok(envelope)
    } else {
        Err(violations)
    }
}

/// Terminal session state for a spawn error.
fn terminal_state(err: &ConductorError) -> SessionState {
    match err {
        ConductorError::LoopLimitExceeded { .. } => SessionState::Terminated,
        ConductorError::SessionTimedOut(_) => SessionState::TimedOut,
        ConductorError::Cancelled(_) => SessionState::Cancelled,
        _ => SessionState::Failed,
    }
}

/// Releases a session's resources exactly once, including when the spawn
/// future is dropped mid-flight.
struct SessionCleanup<'a> {
    runtime: &'a Runtime,
    id: SessionId,
    root: SessionId,
    done: bool,
}

impl SessionCleanup<'_> {
    /// Returns whether this call set the terminal state.
    fn finish(
        &mut self,
        state: SessionState,
        error: Option<String>,
        transcript: Vec<Message>,
        output: Option<Value>,
    ) -> bool {
        self.done = true;
        let rt = self.runtime;
        rt.limiter.release(self.id);
        rt.lifecycle.deregister(self.id);
        let finished = rt
            .sessions
            .finish_with(self.id, state, error, |session| {
                session.transcript = transcript;
                session.output = output;
            })
            .unwrap_or_else(|err| {
                warn!(session = %self.id, error = %err, "failed to record terminal state");
                false
            });
        if let Err(err) = rt.tracker.session_closed(self.root, self.id) {
            warn!(session = %self.id, error = %err, "failed to notify call tracker");
        }
        finished
    }
}

impl Drop for SessionCleanup<'_> {
    fn drop(&mut self) {
        if !self.done {
            debug!(session = %self.id, "spawn dropped before finishing");
            self.finish(
                SessionState::Cancelled,
                Some("spawn abandoned".to_string()),
                Vec::new(),
                None,
            );
        }
    }
}
