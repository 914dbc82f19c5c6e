//! Validation of root-level results, with bounded refinement.
//!
//! A completed root-level session is compared against its deliverables. A
//! `refine` verdict re-spawns the same task (same fingerprint, same depth)
//! with the gaps appended to the description, until the output is accepted,
//! rejected, or the tracker's refinement budget runs out.

use std::sync::Arc;

use tracing::{debug, info, instrument, warn};

use crate::core::quality::{deliverables_from_schema, evaluate};
use crate::core::types::{Decision, Refinement, SessionId, SessionState, ValidationVerdict};
use crate::error::{ConductorError, Result};
use crate::spawner::{AgentSpawner, SpawnResult};

/// Accepted result plus the attempts it replaced.
#[derive(Debug, Clone)]
pub struct ReviewOutcome {
    pub result: SpawnResult,
    pub verdict: ValidationVerdict,
    /// Earlier attempts superseded by refinement, oldest first.
    pub superseded: Vec<SpawnResult>,
}

/// A review that ended without an accepted result.
#[derive(Debug, Clone)]
pub struct ReviewFailure {
    pub error: ConductorError,
    /// Every attempt made, oldest first; the last one ended the review.
    pub attempts: Vec<SpawnResult>,
}

pub struct Reviewer {
    spawner: Arc<AgentSpawner>,
}

impl Reviewer {
    pub fn new(spawner: Arc<AgentSpawner>) -> Self {
        Self { spawner }
    }

    /// Validate `result`, refining while the verdict asks for it.
    ///
    /// Delegated sessions are validated by whoever delegated them, so they are
    /// refused here.
    #[instrument(skip_all, fields(session = %result.session, agent = %result.agent_type))]
    pub async fn review(
        &self,
        result: SpawnResult,
    ) -> std::result::Result<ReviewOutcome, ReviewFailure> {
        let mut current = result;
        let mut superseded = Vec::new();
        match self.settle(&mut current, &mut superseded).await {
            Ok(verdict) => Ok(ReviewOutcome {
                result: current,
                verdict,
                superseded,
            }),
            Err(error) => {
                superseded.push(current);
                Err(ReviewFailure {
                    error,
                    attempts: superseded,
                })
            }
        }
    }

    /// Run the accept/refine/reject loop on `current`, moving every replaced
    /// attempt into `superseded`.
    async fn settle(
        &self,
        current: &mut SpawnResult,
        superseded: &mut Vec<SpawnResult>,
    ) -> Result<ValidationVerdict> {
        if current.request.context.is_delegated() {
            return Err(ConductorError::InvalidRequest(format!(
                "session {} was delegated; only root-level sessions are validated",
                current.session
            )));
        }

        let rt = self.spawner.runtime();
        let spec = rt.catalog.get(&current.agent_type)?;
        let base_description = current.request.description.clone();

        loop {
            let id = current.session;
            let state = rt.sessions.get(id)?.state;
            let deliverables = if current.request.deliverables.is_empty() {
                deliverables_from_schema(&spec.spec.output_schema)
            } else {
                current.request.deliverables.clone()
            };
            let verdict = evaluate(state, Some(&current.output), &deliverables);
            debug!(
                session = %id,
                decision = ?verdict.decision,
                issues = verdict.issues.len(),
                "verdict"
            );
            if state == SessionState::Completed {
                rt.sessions.transition(id, SessionState::AwaitingValidation)?;
            }

            match verdict.decision {
                Decision::Accept => {
                    rt.sessions.transition(id, SessionState::Accepted)?;
                    info!(session = %id, refinements = superseded.len(), "result accepted");
                    return Ok(verdict);
                }
                Decision::Reject => return Err(self.reject(id, verdict)),
                Decision::Refine => {}
            }

            let remaining = rt
                .tracker
                .refinements_remaining(current.request.context.root, &current.fingerprint)?;
            if remaining == 0 {
                let verdict = verdict.into_rejection("refinement limit reached");
                return Err(self.reject(id, verdict));
            }

            let gaps = verdict.gaps();
            let mut request = current.request.clone();
            request.description = refined_description(&base_description, &gaps);
            request.refinement = Some(Refinement {
                fingerprint: current.fingerprint.clone(),
                attempt: u32::try_from(superseded.len() + 1).unwrap_or(u32::MAX),
                gaps,
            });

            match self.spawner.spawn(&current.agent_type, request).await {
                Ok(next) => {
                    rt.sessions.transition(id, SessionState::RefinementRequested)?;
                    debug!(previous = %id, next = %next.session, "refinement spawned");
                    superseded.push(std::mem::replace(current, next));
                }
                Err(ConductorError::LoopLimitExceeded { limit, .. }) => {
                    let verdict =
                        verdict.into_rejection(format!("refinement refused: {limit} limit reached"));
                    return Err(self.reject(id, verdict));
                }
                Err(err) => {
                    warn!(session = %id, error = %err, "refinement attempt failed");
                    rt.sessions.transition(id, SessionState::RefinementRequested)?;
                    return Err(err);
                }
            }
        }
    }

    fn reject(&self, id: SessionId, verdict: ValidationVerdict) -> ConductorError {
        if let Err(err) = self
            .spawner
            .runtime()
            .sessions
            .transition(id, SessionState::Rejected)
        {
            warn!(session = %id, error = %err, "failed to record rejection");
        }
        info!(session = %id, summary = %verdict.summary(), "result rejected");
        ConductorError::ValidationRejected {
            session: id,
            verdict,
        }
    }
}

fn refined_description(base: &str, gaps: &[String]) -> String {
    let mut text = format!("{base}\n\nAddress these gaps from the previous attempt:");
    for gap in gaps {
        text.push_str("\n- ");
        text.push_str(gap);
    }
    text
}
