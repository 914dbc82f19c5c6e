//! The assembled orchestration core.
//!
//! [`Conductor`] owns one instance of every component and the background
//! tasks they need (the lifecycle sweeper and the memory writer). `run` is the
//! root caller's path: spawn, validate with refinement, then reconcile the
//! memory proposals of the accepted tree. Proposals that are not applied are
//! always reported back, whether the run succeeds or fails.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use serde::Serialize;
use serde_json::json;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::core::session::Session;
use crate::core::types::{ExecutionContext, SessionId, TaskRequest, ValidationVerdict};
use crate::error::{ConductorError, Result};
use crate::io::catalog::{Catalog, load_catalog};
use crate::io::completion::{CommandCompletionService, CompletionService};
use crate::io::config::{ConductorConfig, load_config};
use crate::io::init::ConductorPaths;
use crate::io::knowledge::{JsonKnowledgeBase, KnowledgeBase, KnowledgeGraph};
use crate::io::store::{FileStateStore, StateStore};
use crate::lifecycle::{LifecycleManager, spawn_sweeper};
use crate::limiter::ConcurrencyLimiter;
use crate::memory::{MemoryCoordinator, MemoryReport, proposals_of};
use crate::review::{ReviewFailure, Reviewer};
use crate::sessions::SessionRegistry;
use crate::spawner::{AgentSpawner, Runtime, SpawnResult};
use crate::tools::ToolRegistry;
use crate::tracker::CallTracker;

const SUPERSEDED: &str = "session superseded by refinement";

/// Timeouts in effect, normally taken from the config file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timeouts {
    pub request: Duration,
    pub session: Duration,
    pub sweep_interval: Duration,
}

impl Timeouts {
    pub fn from_config(config: &ConductorConfig) -> Self {
        Self {
            request: config.request_timeout(),
            session: config.session_timeout(),
            sweep_interval: config.sweep_interval(),
        }
    }
}

/// Everything [`Conductor::assemble`] wires together.
pub struct ConductorParts {
    pub config: ConductorConfig,
    pub timeouts: Timeouts,
    pub catalog: Catalog,
    pub principles: String,
    pub store: Arc<dyn StateStore>,
    pub knowledge: Box<dyn KnowledgeBase>,
    pub completion: Arc<dyn CompletionService>,
}

/// Result of a root-level run.
#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub result: SpawnResult,
    pub verdict: ValidationVerdict,
    /// Sessions replaced by refinement, oldest first.
    pub superseded: Vec<SessionId>,
    pub memory: MemoryReport,
}

impl RunOutcome {
    /// Summary suitable for printing or returning over a tool boundary.
    pub fn to_json(&self) -> serde_json::Value {
        #[derive(Serialize)]
        struct Delegated<'a> {
            agent_type: &'a str,
            session: Option<SessionId>,
            error: Option<serde_json::Value>,
        }
        let delegations: Vec<Delegated<'_>> = self
            .result
            .delegations
            .iter()
            .map(|d| Delegated {
                agent_type: &d.agent_type,
                session: d.session(),
                error: d.result.as_ref().err().map(|err| err.to_json()),
            })
            .collect();
        json!({
            "session": self.result.session,
            "root": self.result.request.context.root,
            "output": self.result.output,
            "confidence": self.verdict.confidence,
            "issues": self.verdict.issues,
            "superseded": self.superseded,
            "delegations": delegations,
            "memory": self.memory,
        })
    }
}

/// A run that ended without an accepted result.
#[derive(Debug, Clone, Error)]
#[error("{error}")]
pub struct RunFailure {
    pub error: ConductorError,
    /// Proposals made by every attempt, all reported as rejected.
    pub memory: MemoryReport,
}

impl RunFailure {
    /// The error body plus the memory report.
    pub fn to_json(&self) -> serde_json::Value {
        let mut body = self.error.to_json();
        body["memory"] = json!(self.memory);
        body
    }
}

impl From<ConductorError> for RunFailure {
    fn from(error: ConductorError) -> Self {
        Self {
            error,
            memory: MemoryReport::default(),
        }
    }
}

pub struct Conductor {
    config: ConductorConfig,
    store: Arc<dyn StateStore>,
    spawner: Arc<AgentSpawner>,
    reviewer: Reviewer,
    memory: MemoryCoordinator,
    tools: ToolRegistry,
    shutdown: CancellationToken,
    sweeper: JoinHandle<()>,
    writer: JoinHandle<()>,
}

impl Conductor {
    /// Load config, catalog, principles and durable state from `.conductor/`,
    /// talking to the configured completion command.
    pub fn open(paths: &ConductorPaths) -> anyhow::Result<Self> {
        let config = load_config(&paths.config_path)?;
        let completion = Arc::new(CommandCompletionService::new(
            config.completion.command.clone(),
            config.completion.output_limit_bytes,
        ));
        Self::open_with(paths, config, completion)
    }

    /// Like [`open`](Self::open) with an explicit config and completion service.
    pub fn open_with(
        paths: &ConductorPaths,
        config: ConductorConfig,
        completion: Arc<dyn CompletionService>,
    ) -> anyhow::Result<Self> {
        let catalog = load_catalog(&paths.agents_dir)?;
        let principles = paths.read_principles()?;
        let store: Arc<dyn StateStore> = Arc::new(FileStateStore::new(&paths.state_dir));
        let knowledge = JsonKnowledgeBase::open(&paths.knowledge_path)
            .with_context(|| format!("open knowledge base in {}", paths.state_dir.display()))?;
        let conductor = Self::assemble(ConductorParts {
            timeouts: Timeouts::from_config(&config),
            config,
            catalog,
            principles,
            store,
            knowledge: Box::new(knowledge),
            completion,
        });
        conductor
            .recover_abandoned()
            .with_context(|| format!("recover sessions in {}", paths.state_dir.display()))?;
        Ok(conductor)
    }

    /// Close every persisted session still `Created` or `Running`.
    ///
    /// Only sound while no other process works on the same state directory.
    pub fn recover_abandoned(&self) -> Result<usize> {
        let sessions = self.sessions()?;
        Ok(self.spawner.runtime().lifecycle.recover(&sessions))
    }

    /// Wire the components and start the background tasks.
    ///
    /// Must be called from within a tokio runtime.
    pub fn assemble(parts: ConductorParts) -> Self {
        let ConductorParts {
            config,
            timeouts,
            catalog,
            principles,
            store,
            knowledge,
            completion,
        } = parts;

        let sessions = Arc::new(SessionRegistry::new(store.clone()));
        let tracker = Arc::new(CallTracker::new(config.limits(), store.clone()));
        let limiter = Arc::new(ConcurrencyLimiter::new(config.max_concurrent, config.admission));
        let lifecycle = Arc::new(LifecycleManager::new(
            sessions.clone(),
            limiter.clone(),
            tracker.clone(),
            timeouts.session,
        ));
        let runtime = Runtime {
            catalog: Arc::new(catalog),
            principles: Arc::from(principles),
            sessions,
            tracker,
            limiter,
            lifecycle: lifecycle.clone(),
        };
        let spawner = Arc::new(AgentSpawner::new(runtime, completion, timeouts.request));
        let shutdown = CancellationToken::new();
        let sweeper = spawn_sweeper(lifecycle, timeouts.sweep_interval, shutdown.clone());
        let (memory, writer) = MemoryCoordinator::start(knowledge);

        debug!(
            agents = spawner.runtime().catalog.len(),
            max_concurrent = config.max_concurrent,
            "conductor assembled"
        );
        Self {
            reviewer: Reviewer::new(spawner.clone()),
            tools: ToolRegistry::new(spawner.clone()),
            config,
            store,
            spawner,
            memory,
            shutdown,
            sweeper,
            writer,
        }
    }

    pub fn config(&self) -> &ConductorConfig {
        &self.config
    }

    pub fn spawner(&self) -> &Arc<AgentSpawner> {
        &self.spawner
    }

    pub fn reviewer(&self) -> &Reviewer {
        &self.reviewer
    }

    pub fn memory(&self) -> &MemoryCoordinator {
        &self.memory
    }

    pub fn tools(&self) -> &ToolRegistry {
        &self.tools
    }

    pub fn catalog(&self) -> &Catalog {
        &self.spawner.runtime().catalog
    }

    /// Fresh root context with the configured call budget.
    pub fn new_root(&self) -> ExecutionContext {
        ExecutionContext::root(self.config.max_calls)
    }

    pub async fn spawn(&self, agent_type: &str, request: TaskRequest) -> Result<SpawnResult> {
        self.spawner.spawn(agent_type, request).await
    }

    /// Spawn, validate (refining as needed) and reconcile memory proposals.
    #[instrument(skip_all, fields(agent = agent_type, root = %request.context.root))]
    pub async fn run(
        &self,
        agent_type: &str,
        request: TaskRequest,
    ) -> std::result::Result<RunOutcome, RunFailure> {
        let result = self.spawner.spawn(agent_type, request).await?;
        let outcome = match self.reviewer.review(result).await {
            Ok(outcome) => outcome,
            Err(ReviewFailure { error, attempts }) => {
                let mut memory = MemoryReport::default();
                if let Some((last, earlier)) = attempts.split_last() {
                    memory = superseded_report(earlier);
                    let reason = format!("result not accepted: {}", error.kind());
                    memory.merge(MemoryCoordinator::discard(proposals_of(last), &reason));
                }
                warn!(
                    kind = error.kind(),
                    attempts = attempts.len(),
                    rejected = memory.rejected.len(),
                    "run ended without an accepted result"
                );
                return Err(RunFailure { error, memory });
            }
        };

        let mut memory = self.memory.reconcile(proposals_of(&outcome.result)).await;
        memory.merge(superseded_report(&outcome.superseded));
        info!(
            session = %outcome.result.session,
            applied = memory.applied.len(),
            rejected = memory.rejected.len(),
            "run finished"
        );
        Ok(RunOutcome {
            superseded: outcome.superseded.iter().map(|r| r.session).collect(),
            result: outcome.result,
            verdict: outcome.verdict,
            memory,
        })
    }

    /// Cancel `session` and everything it delegated. Returns sessions stopped.
    pub fn cancel_session(&self, session: SessionId) -> usize {
        self.spawner.runtime().lifecycle.cancel_session(session)
    }

    pub fn cancel_root(&self, root: SessionId) -> usize {
        self.spawner.runtime().lifecycle.cancel_root(root)
    }

    /// Refuse further spawns under `root` and let go of its bookkeeping.
    pub fn close_root(&self, root: SessionId) -> Result<()> {
        let rt = self.spawner.runtime();
        rt.tracker.close_root(root)?;
        rt.lifecycle.close_root(root);
        Ok(())
    }

    pub fn session(&self, id: SessionId) -> Result<Session> {
        self.spawner.runtime().sessions.get(id)
    }

    /// Every persisted session, oldest first.
    pub fn sessions(&self) -> Result<Vec<Session>> {
        self.store
            .list_sessions()
            .map_err(ConductorError::storage)
    }

    pub async fn knowledge(&self) -> Result<KnowledgeGraph> {
        self.memory.snapshot().await
    }

    /// Stop the background tasks and wait for them to finish.
    pub async fn shutdown(self) {
        self.shutdown.cancel();
        let Self {
            sweeper,
            writer,
            memory,
            ..
        } = self;
        drop(memory);
        if let Err(err) = sweeper.await {
            warn!(error = %err, "sweeper task ended abnormally");
        }
        if let Err(err) = writer.await {
            warn!(error = %err, "memory writer ended abnormally");
        }
        debug!("conductor stopped");
    }
}

/// Report the proposals of superseded attempts (and their delegations).
fn superseded_report(attempts: &[SpawnResult]) -> MemoryReport {
    let mut memory = MemoryReport::default();
    for attempt in attempts {
        memory.merge(MemoryCoordinator::discard(proposals_of(attempt), SUPERSEDED));
    }
    memory
}
