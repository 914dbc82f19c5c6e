//! Test-only helpers: a scripted completion service, spec builders and a
//! fully wired conductor over in-memory state.

use std::collections::VecDeque;
use std::fs;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Value, json};
use tempfile::TempDir;

use crate::conductor::{Conductor, ConductorParts, Timeouts};
use crate::core::loop_guard::CallTrackingRecord;
use crate::core::session::Session;
use crate::core::types::{AdmissionPolicy, ExecutionContext, SessionId, Specification, ToolAccess};
use crate::io::catalog::Catalog;
use crate::io::completion::{Completion, CompletionError, CompletionRequest, CompletionService};
use crate::io::config::ConductorConfig;
use crate::io::init::{ConductorPaths, InitOptions, init_conductor};
use crate::io::knowledge::KnowledgeGraph;
use crate::io::store::{MemoryStateStore, StateStore};
use crate::limiter::ConcurrencyLimiter;
use crate::review::Reviewer;
use crate::sessions::SessionRegistry;
use crate::spawner::AgentSpawner;

/// One scripted answer from [`ScriptedCompletion`].
#[derive(Debug, Clone)]
pub enum Reply {
    Content(String),
    /// Transport failure with this message.
    Error(String),
    /// Never answers; only a timeout or cancellation ends the call.
    Hang,
}

#[derive(Default)]
struct Script {
    replies: Mutex<VecDeque<Reply>>,
    fallback: Mutex<Option<String>>,
    requests: Mutex<Vec<CompletionRequest>>,
    delay: Mutex<Duration>,
    calls: AtomicUsize,
    in_flight: AtomicUsize,
    peak: AtomicUsize,
}

/// Completion service that answers from a queue, then from a fallback.
///
/// Clones share the same script, so a test can keep one handle and give
/// another to the conductor.
#[derive(Clone, Default)]
pub struct ScriptedCompletion {
    script: Arc<Script>,
}

impl ScriptedCompletion {
    pub fn new() -> Self {
        Self::default()
    }

    /// Answer every call with `content`.
    pub fn with_fallback(content: String) -> Self {
        let completion = Self::new();
        completion.set_fallback(content);
        completion
    }

    /// Wait `delay` before answering each call.
    pub fn with_delay(self, delay: Duration) -> Self {
        *self.script.delay.lock().unwrap_or_else(PoisonError::into_inner) = delay;
        self
    }

    pub fn push(&self, reply: Reply) {
        self.script
            .replies
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push_back(reply);
    }

    pub fn set_fallback(&self, content: String) {
        *self.script.fallback.lock().unwrap_or_else(PoisonError::into_inner) = Some(content);
    }

    pub fn calls(&self) -> usize {
        self.script.calls.load(Ordering::SeqCst)
    }

    /// Most calls that were ever in flight at once.
    pub fn peak_in_flight(&self) -> usize {
        self.script.peak.load(Ordering::SeqCst)
    }

    pub fn requests(&self) -> Vec<CompletionRequest> {
        self.script
            .requests
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn next_reply(&self) -> Reply {
        if let Some(reply) = self
            .script
            .replies
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop_front()
        {
            return reply;
        }
        match self
            .script
            .fallback
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
        {
            Some(content) => Reply::Content(content),
            None => Reply::Error("no scripted reply left".to_string()),
        }
    }
}

/// Decrements the in-flight count even when the call future is dropped.
struct InFlight<'a>(&'a Script);

impl<'a> InFlight<'a> {
    fn enter(script: &'a Script) -> Self {
        let now = script.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        script.peak.fetch_max(now, Ordering::SeqCst);
        Self(script)
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl CompletionService for ScriptedCompletion {
    async fn complete(&self, request: CompletionRequest) -> Result<Completion, CompletionError> {
        self.script.calls.fetch_add(1, Ordering::SeqCst);
        self.script
            .requests
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(request);
        let _guard = InFlight::enter(&self.script);

        let reply = self.next_reply();
        let delay = *self.script.delay.lock().unwrap_or_else(PoisonError::into_inner);
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        match reply {
            Reply::Content(content) => Ok(Completion { content }),
            Reply::Error(message) => Err(CompletionError::Transport(message)),
            Reply::Hang => futures::future::pending().await,
        }
    }
}

/// Response envelope carrying `output` and nothing else.
pub fn envelope(output: Value) -> String {
    json!({ "output": output }).to_string()
}

/// Agent that takes a `topic` and returns a `summary` (plus optional
/// `findings`). May delegate to anything.
pub fn spec(id: &str) -> Specification {
    Specification {
        id: id.to_string(),
        operation: None,
        template: format!("You are the {id} agent. Focus on {{{{ input.topic }}}}."),
        instructions: vec![
            "Read the task context.".to_string(),
            "Answer with the response envelope.".to_string(),
        ],
        input_schema: json!({
            "type": "object",
            "required": ["topic"],
            "properties": { "topic": { "type": "string" } }
        }),
        output_schema: json!({
            "type": "object",
            "required": ["summary"],
            "properties": {
                "summary": { "type": "string" },
                "findings": { "type": "array", "items": { "type": "string" } }
            }
        }),
        tools: ToolAccess {
            restricted: vec!["*".to_string()],
            full: vec!["*".to_string()],
        },
    }
}

/// In-memory store that fails one chosen session write.
struct FaultyStore {
    inner: Arc<MemoryStateStore>,
    fail_write: Option<usize>,
    writes: AtomicUsize,
}

impl StateStore for FaultyStore {
    fn save_session(&self, session: &Session) -> anyhow::Result<()> {
        let write = self.writes.fetch_add(1, Ordering::SeqCst) + 1;
        if self.fail_write == Some(write) {
            anyhow::bail!("injected failure on session write {write}");
        }
        self.inner.save_session(session)
    }

    fn load_session(&self, id: SessionId) -> anyhow::Result<Option<Session>> {
        self.inner.load_session(id)
    }

    fn list_sessions(&self) -> anyhow::Result<Vec<Session>> {
        self.inner.list_sessions()
    }

    fn save_record(&self, record: &CallTrackingRecord) -> anyhow::Result<()> {
        self.inner.save_record(record)
    }

    fn load_record(&self, root: SessionId) -> anyhow::Result<Option<CallTrackingRecord>> {
        self.inner.load_record(root)
    }
}

fn test_config() -> ConductorConfig {
    ConductorConfig {
        request_timeout_secs: 5,
        session_timeout_secs: 30,
        sweep_interval_ms: 20,
        ..ConductorConfig::default()
    }
}

/// A conductor over in-memory state and a scripted completion service.
pub struct TestRig {
    pub conductor: Conductor,
    pub spawner: Arc<AgentSpawner>,
    store: Arc<MemoryStateStore>,
}

impl TestRig {
    pub fn new(specs: Vec<Specification>, completion: ScriptedCompletion) -> Self {
        Self::builder().build(specs, completion)
    }

    pub fn builder() -> TestRigBuilder {
        let config = test_config();
        TestRigBuilder {
            timeouts: Timeouts::from_config(&config),
            config,
            fail_session_write: None,
        }
    }

    pub fn root_context(&self) -> ExecutionContext {
        self.conductor.new_root()
    }

    pub fn sessions(&self) -> &SessionRegistry {
        &self.spawner.runtime().sessions
    }

    pub fn limiter(&self) -> &ConcurrencyLimiter {
        &self.spawner.runtime().limiter
    }

    pub fn store(&self) -> &MemoryStateStore {
        &self.store
    }

    pub fn reviewer(&self) -> &Reviewer {
        self.conductor.reviewer()
    }
}

pub struct TestRigBuilder {
    config: ConductorConfig,
    timeouts: Timeouts,
    fail_session_write: Option<usize>,
}

impl TestRigBuilder {
    pub fn max_calls(mut self, max_calls: u32) -> Self {
        self.config.max_calls = max_calls;
        self
    }

    pub fn max_depth(mut self, max_depth: u32) -> Self {
        self.config.max_depth = max_depth;
        self
    }

    pub fn max_refinements(mut self, max_refinements: u32) -> Self {
        self.config.max_refinements = max_refinements;
        self
    }

    pub fn max_concurrent(mut self, max_concurrent: usize) -> Self {
        self.config.max_concurrent = max_concurrent;
        self
    }

    pub fn admission(mut self, admission: AdmissionPolicy) -> Self {
        self.config.admission = admission;
        self
    }

    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.timeouts.request = timeout;
        self
    }

    pub fn session_timeout(mut self, timeout: Duration) -> Self {
        self.timeouts.session = timeout;
        self
    }

    pub fn sweep_interval(mut self, interval: Duration) -> Self {
        self.timeouts.sweep_interval = interval;
        self
    }

    /// Make the `n`-th session write (1-based) fail.
    pub fn fail_session_write(mut self, n: usize) -> Self {
        self.fail_session_write = Some(n);
        self
    }

    /// Must be called from within a tokio runtime.
    pub fn build(self, specs: Vec<Specification>, completion: ScriptedCompletion) -> TestRig {
        let catalog = Catalog::from_specs(specs).expect("test specs should be valid");
        let store = Arc::new(MemoryStateStore::new());
        let conductor = Conductor::assemble(ConductorParts {
            config: self.config,
            timeouts: self.timeouts,
            catalog,
            principles: String::new(),
            store: Arc::new(FaultyStore {
                inner: store.clone(),
                fail_write: self.fail_session_write,
                writes: AtomicUsize::new(0),
            }),
            knowledge: Box::new(KnowledgeGraph::default()),
            completion: Arc::new(completion),
        });
        TestRig {
            spawner: conductor.spawner().clone(),
            conductor,
            store,
        }
    }
}

/// A temporary project with an initialized `.conductor/` directory.
pub struct TempWorkspace {
    pub dir: TempDir,
    pub paths: ConductorPaths,
}

impl TempWorkspace {
    /// Scaffold `.conductor/` and replace the sample agents with `specs`.
    pub fn with_specs(specs: &[Specification]) -> Self {
        let dir = tempfile::tempdir().expect("tempdir");
        let paths =
            init_conductor(dir.path(), &InitOptions { force: false }).expect("init conductor");
        for entry in fs::read_dir(&paths.agents_dir).expect("read agents dir") {
            fs::remove_file(entry.expect("agent entry").path()).expect("remove sample agent");
        }
        for spec in specs {
            let body = serde_json::to_string_pretty(spec).expect("serialize spec");
            fs::write(paths.agents_dir.join(format!("{}.json", spec.id)), body)
                .expect("write spec");
        }
        Self { dir, paths }
    }
}
