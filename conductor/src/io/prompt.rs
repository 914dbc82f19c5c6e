//! Instruction payload builder for agent sessions.
//!
//! `build` is a pure function of the specification, the request and the
//! principles text: identical inputs render byte-identical payloads. The same
//! function backs the live spawner and the offline `preview` command.

use minijinja::{Environment, context};
use serde_json::{Value, json};

use crate::core::types::{Message, Specification, TaskRequest};
use crate::error::{ConductorError, Result};

const AGENT_TEMPLATE: &str = include_str!("prompts/agent.md");

/// Opening user turn sent after the system instructions.
pub const KICKOFF: &str = "Begin the task described in the Task Context. Respond with the JSON envelope only.";

/// Rendered system instructions for one session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstructionPayload {
    pub text: String,
}

impl InstructionPayload {
    /// Initial transcript: system instructions then the kickoff turn.
    pub fn messages(&self) -> Vec<Message> {
        vec![Message::system(self.text.clone()), Message::user(KICKOFF)]
    }
}

/// Template engine wrapper around minijinja.
struct PromptEngine {
    env: Environment<'static>,
}

impl PromptEngine {
    fn new() -> Self {
        let mut env = Environment::new();
        env.add_template("agent", AGENT_TEMPLATE)
            .expect("agent template should be valid");
        Self { env }
    }

    fn render_role(&self, spec: &Specification, request: &TaskRequest) -> Result<String> {
        self.env
            .render_str(
                &spec.template,
                context! {
                    input => &request.input,
                    description => &request.description,
                    subject => &request.subject,
                },
            )
            .map(|role| role.trim().to_string())
            .map_err(|err| {
                ConductorError::InvalidRequest(format!(
                    "render template for '{}': {err}",
                    spec.id
                ))
            })
    }

    fn render_agent(
        &self,
        spec: &Specification,
        request: &TaskRequest,
        principles: &str,
        role: &str,
    ) -> Result<String> {
        let template = self
            .env
            .get_template("agent")
            .expect("agent template should be registered");
        let refinement = request.refinement.as_ref();
        let task_context = json!({
            "agent_type": request.agent_type,
            "description": request.description,
            "subject": request.subject,
            "input": request.input,
            "depth": request.context.depth,
            "remaining_budget": request.context.remaining_budget,
            "scope": request.context.scope.as_str(),
            "refinement": refinement.map(|r| json!({"attempt": r.attempt, "gaps": r.gaps})),
        });

        template
            .render(context! {
                principles => (!principles.trim().is_empty()).then(|| principles.trim()),
                role => role,
                instructions => &spec.instructions,
                input_schema => pretty(&spec.input_schema),
                output_schema => pretty(&spec.output_schema),
                remaining_budget => request.context.remaining_budget,
                scope => request.context.scope.as_str(),
                tools => spec.tools.for_scope(request.context.scope),
                attempt => refinement.map(|r| r.attempt),
                gaps => refinement.map(|r| r.gaps.as_slice()).unwrap_or_default(),
                task_context => pretty(&task_context),
            })
            .map_err(|err| {
                ConductorError::InvalidRequest(format!(
                    "render instructions for '{}': {err}",
                    spec.id
                ))
            })
    }
}

fn pretty(value: &Value) -> String {
    serde_json::to_string_pretty(value).unwrap_or_else(|_| value.to_string())
}

/// Build the instruction payload for `request` against `spec`.
pub fn build(
    spec: &Specification,
    request: &TaskRequest,
    principles: &str,
) -> Result<InstructionPayload> {
    let engine = PromptEngine::new();
    let role = engine.render_role(spec, request)?;
    let text = engine.render_agent(spec, request, principles, &role)?;
    Ok(InstructionPayload { text })
}

/// Follow-up turn asking the agent to fix a non-conforming response.
pub fn conform_instruction(errors: &[String]) -> String {
    let mut text = String::from(
        "Your previous response did not conform to the response contract or the output schema.\n\nProblems:\n",
    );
    for error in errors {
        text.push_str("- ");
        text.push_str(error);
        text.push('\n');
    }
    text.push_str("\nReply again with a single JSON envelope that fixes every problem above.");
    text
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::fingerprint::TaskFingerprint;
    use crate::core::types::{ExecutionContext, Refinement, ToolAccess};

    fn spec() -> Specification {
        Specification {
            id: "reviewer".to_string(),
            operation: Some("review_code".to_string()),
            template: "Review {{ input.target }} ({{ description }})".to_string(),
            instructions: vec!["Read first.".to_string(), "Cite lines.".to_string()],
            input_schema: json!({"type": "object", "properties": {"target": {"type": "string"}}}),
            output_schema: json!({"type": "object", "required": ["summary"]}),
            tools: ToolAccess {
                restricted: vec!["search".to_string()],
                full: vec!["search".to_string(), "review_code".to_string()],
            },
        }
    }

    fn request() -> TaskRequest {
        TaskRequest::new("reviewer", "auth hardening", ExecutionContext::root(20))
            .with_input("target", "src/auth.rs")
            .with_input("notes", json!({"zeta": 1, "alpha": 2}))
    }

    /// Identical inputs render identical bytes.
    #[test]
    fn build_is_deterministic() {
        let a = build(&spec(), &request(), "Be precise.").expect("build");
        let b = build(&spec(), &request(), "Be precise.").expect("build");
        assert_eq!(a, b);
    }

    /// Sections appear in a fixed order.
    #[test]
    fn sections_are_ordered() {
        let text = build(&spec(), &request(), "Be precise.").expect("build").text;
        let order = [
            "# Core Principles",
            "# Role",
            "# Instructions",
            "# Input Schema",
            "# Output Schema",
            "# Response Contract",
            "# Tools (full scope)",
            "# Task Context",
        ];
        let positions: Vec<usize> = order
            .iter()
            .map(|heading| text.find(heading).expect(heading))
            .collect();
        let mut sorted = positions.clone();
        sorted.sort_unstable();
        assert_eq!(positions, sorted);
        assert!(text.contains("Review src/auth.rs (auth hardening)"));
        assert!(text.contains("1. Read first.\n2. Cite lines."));
        assert!(text.contains("- review_code"));
    }

    #[test]
    fn empty_principles_are_omitted() {
        let text = build(&spec(), &request(), "  \n").expect("build").text;
        assert!(!text.contains("# Core Principles"));
        assert!(text.starts_with("# Role"));
    }

    #[test]
    fn restricted_scope_lists_restricted_tools() {
        let mut request = request();
        request.context = request.context.delegated_from(crate::core::types::SessionId::new());
        let text = build(&spec(), &request, "").expect("build").text;
        assert!(text.contains("# Tools (restricted scope)"));
        assert!(!text.contains("- review_code"));
    }

    #[test]
    fn refinement_gaps_are_rendered() {
        let mut request = request();
        request.refinement = Some(Refinement {
            fingerprint: TaskFingerprint::of(&request),
            attempt: 1,
            gaps: vec!["missing deliverable '/summary'".to_string()],
        });
        let text = build(&spec(), &request, "").expect("build").text;
        assert!(text.contains("This is refinement attempt 1."));
        assert!(text.contains("- missing deliverable '/summary'"));
    }

    #[test]
    fn broken_template_is_invalid_request() {
        let mut spec = spec();
        spec.template = "{{ input.target | no_such_filter }}".to_string();
        let err = build(&spec, &request(), "").unwrap_err();
        assert_eq!(err.kind(), "invalid_request");
    }

    #[test]
    fn conform_instruction_lists_errors() {
        let text = conform_instruction(&["missing field `output`".to_string()]);
        assert!(text.contains("- missing field `output`\n"));
    }

    #[test]
    fn payload_messages_start_with_system() {
        let payload = build(&spec(), &request(), "").expect("build");
        let messages = payload.messages();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0], Message::system(payload.text.clone()));
        assert_eq!(messages[1].content, KICKOFF);
    }
}
