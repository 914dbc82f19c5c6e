//! Memory operation coordinator.
//!
//! Agents propose knowledge-base mutations in their response envelope. Each
//! proposal is checked for relatedness to the request that produced it, then
//! handed to a single writer task that owns the knowledge base. Every proposal
//! ends up either applied or reported back as rejected.

use serde::Serialize;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};

use crate::core::relatedness::check_related;
use crate::core::types::{MemoryOperation, MemoryOperationProposal, SessionId};
use crate::error::{ConductorError, Result};
use crate::io::knowledge::{KnowledgeBase, KnowledgeGraph};
use crate::spawner::SpawnResult;

const QUEUE_DEPTH: usize = 64;

enum Command {
    Apply {
        operation: MemoryOperation,
        source: SessionId,
        reply: oneshot::Sender<anyhow::Result<()>>,
    },
    Snapshot {
        reply: oneshot::Sender<KnowledgeGraph>,
    },
}

#[derive(Debug, Clone, Serialize)]
pub struct RejectedProposal {
    pub session: SessionId,
    pub operation: MemoryOperation,
    pub reason: String,
}

impl RejectedProposal {
    pub fn error(&self) -> ConductorError {
        ConductorError::MemoryOperationRejected(self.reason.clone())
    }
}

/// What happened to each proposal handed to [`MemoryCoordinator::reconcile`].
#[derive(Debug, Clone, Default, Serialize)]
pub struct MemoryReport {
    pub applied: Vec<MemoryOperation>,
    pub rejected: Vec<RejectedProposal>,
}

impl MemoryReport {
    pub fn total(&self) -> usize {
        self.applied.len() + self.rejected.len()
    }

    /// Fold `other` into this report.
    pub fn merge(&mut self, other: MemoryReport) {
        self.applied.extend(other.applied);
        self.rejected.extend(other.rejected);
    }

    fn reject(&mut self, proposal: MemoryOperationProposal, reason: String) {
        self.rejected.push(RejectedProposal {
            session: proposal.session,
            operation: proposal.operation,
            reason,
        });
    }
}

/// Collect the proposals of `result` and its successful descendants.
pub fn proposals_of(result: &SpawnResult) -> Vec<MemoryOperationProposal> {
    result
        .walk()
        .into_iter()
        .flat_map(|node| {
            node.memory.iter().map(|operation| MemoryOperationProposal {
                operation: operation.clone(),
                session: node.session,
                request: node.request.clone(),
            })
        })
        .collect()
}

/// Handle to the writer task. Cheap to clone.
#[derive(Clone)]
pub struct MemoryCoordinator {
    tx: mpsc::Sender<Command>,
}

impl MemoryCoordinator {
    /// Start the writer task that owns `knowledge`.
    ///
    /// The task exits once every handle is dropped.
    pub fn start(knowledge: Box<dyn KnowledgeBase>) -> (Self, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(QUEUE_DEPTH);
        let handle = tokio::spawn(run_writer(knowledge, rx));
        (Self { tx }, handle)
    }

    /// Check and apply one proposal.
    pub async fn submit(&self, proposal: &MemoryOperationProposal) -> Result<()> {
        check_related(&proposal.operation, &proposal.request)
            .map_err(ConductorError::MemoryOperationRejected)?;

        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Command::Apply {
                operation: proposal.operation.clone(),
                source: proposal.session,
                reply,
            })
            .await
            .map_err(|_| writer_gone())?;
        rx.await
            .map_err(|_| writer_gone())?
            .map_err(|err| ConductorError::MemoryOperationRejected(format!("{err:#}")))
    }

    /// Apply every proposal in order, reporting each one.
    #[instrument(skip_all, fields(proposals = proposals.len()))]
    pub async fn reconcile(&self, proposals: Vec<MemoryOperationProposal>) -> MemoryReport {
        let mut report = MemoryReport::default();
        for proposal in proposals {
            match self.submit(&proposal).await {
                Ok(()) => {
                    debug!(
                        session = %proposal.session,
                        op = proposal.operation.label(),
                        entity = proposal.operation.subject(),
                        "memory operation applied"
                    );
                    report.applied.push(proposal.operation);
                }
                Err(err) => {
                    warn!(
                        session = %proposal.session,
                        op = proposal.operation.label(),
                        error = %err,
                        "memory operation rejected"
                    );
                    let reason = match err {
                        ConductorError::MemoryOperationRejected(reason) => reason,
                        other => other.to_string(),
                    };
                    report.reject(proposal, reason);
                }
            }
        }
        info!(applied = report.applied.len(), rejected = report.rejected.len(), "memory reconciled");
        report
    }

    /// Report `proposals` as rejected without applying them.
    pub fn discard(proposals: Vec<MemoryOperationProposal>, reason: &str) -> MemoryReport {
        let mut report = MemoryReport::default();
        for proposal in proposals {
            report.reject(proposal, reason.to_string());
        }
        report
    }

    pub async fn snapshot(&self) -> Result<KnowledgeGraph> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Command::Snapshot { reply })
            .await
            .map_err(|_| writer_gone())?;
        rx.await.map_err(|_| writer_gone())
    }
}

async fn run_writer(mut knowledge: Box<dyn KnowledgeBase>, mut rx: mpsc::Receiver<Command>) {
    while let Some(command) = rx.recv().await {
        match command {
            Command::Apply {
                operation,
                source,
                reply,
            } => {
                let result = knowledge.apply(&operation, source);
                let _ = reply.send(result);
            }
            Command::Snapshot { reply } => {
                let _ = reply.send(knowledge.snapshot());
            }
        }
    }
    debug!("memory writer stopped");
}

fn writer_gone() -> ConductorError {
    ConductorError::Storage("memory writer is not running".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::{ExecutionContext, TaskRequest};

    fn proposal(operation: MemoryOperation) -> MemoryOperationProposal {
        MemoryOperationProposal {
            operation,
            session: SessionId::new(),
            request: TaskRequest::new("analyst", "Review the Auth Service", ExecutionContext::root(20))
                .with_input("target", "src/billing.rs"),
        }
    }

    fn create(entity: &str) -> MemoryOperation {
        MemoryOperation::Create {
            entity: entity.to_string(),
            kind: "component".to_string(),
            observations: vec!["reviewed".to_string()],
        }
    }

    #[tokio::test]
    async fn related_proposals_are_applied() {
        let (memory, _writer) = MemoryCoordinator::start(Box::new(KnowledgeGraph::default()));
        let report = memory
            .reconcile(vec![proposal(create("auth service")), proposal(create("billing"))])
            .await;
        assert_eq!(report.applied.len(), 2);
        assert!(report.rejected.is_empty());

        let graph = memory.snapshot().await.expect("snapshot");
        assert!(graph.entities.contains_key("auth service"));
        assert!(graph.entities.contains_key("billing"));
    }

    #[tokio::test]
    async fn unrelated_and_failing_proposals_are_reported() {
        let (memory, _writer) = MemoryCoordinator::start(Box::new(KnowledgeGraph::default()));
        let report = memory
            .reconcile(vec![
                proposal(create("payroll")),
                proposal(MemoryOperation::Append {
                    entity: "auth".to_string(),
                    observations: vec!["x".to_string()],
                }),
            ])
            .await;
        assert!(report.applied.is_empty());
        assert_eq!(report.total(), 2);
        assert!(report.rejected[0].reason.contains("unrelated"));
        assert_eq!(report.rejected[1].error().kind(), "memory_operation_rejected");

        let graph = memory.snapshot().await.expect("snapshot");
        assert!(graph.entities.is_empty());
    }

    #[tokio::test]
    async fn concurrent_submissions_are_serialized() {
        let (memory, _writer) = MemoryCoordinator::start(Box::new(KnowledgeGraph::default()));
        memory.submit(&proposal(create("auth"))).await.expect("create");
        let appends = (0..10).map(|i| {
            let memory = memory.clone();
            tokio::spawn(async move {
                memory
                    .submit(&proposal(MemoryOperation::Append {
                        entity: "auth".to_string(),
                        observations: vec![format!("note {i}")],
                    }))
                    .await
            })
        });
        for handle in futures::future::join_all(appends).await {
            handle.expect("join").expect("append");
        }
        let graph = memory.snapshot().await.expect("snapshot");
        assert_eq!(graph.entities["auth"].observations.len(), 11);
    }

    #[test]
    fn discard_reports_every_proposal() {
        let report = MemoryCoordinator::discard(
            vec![proposal(create("auth")), proposal(create("billing"))],
            "session superseded by refinement",
        );
        assert_eq!(report.rejected.len(), 2);
        assert!(report.applied.is_empty());
    }
}
