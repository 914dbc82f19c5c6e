//! Static quality assessment of a session's structured output.
//!
//! Compares the output against declared deliverables:
//! - missing (or null) deliverable is critical,
//! - wrong shape is major,
//! - an empty value is major when declared `non_empty`, minor otherwise.

use serde_json::Value;

use crate::core::types::{
    Confidence, Decision, Deliverable, Issue, SessionState, Severity, Shape, ValidationVerdict,
};

/// Produce a verdict for a session's final state and output.
///
/// Returns `reject` when the session never completed.
pub fn evaluate(
    state: SessionState,
    output: Option<&Value>,
    deliverables: &[Deliverable],
) -> ValidationVerdict {
    let output = match (state, output) {
        (SessionState::Completed | SessionState::AwaitingValidation, Some(output)) => output,
        _ => {
            return ValidationVerdict {
                decision: Decision::Reject,
                issues: vec![Issue {
                    severity: Severity::Critical,
                    description: format!(
                        "session ended in state '{}' without a completed output",
                        state.as_str()
                    ),
                }],
                confidence: Confidence::High,
            };
        }
    };

    let mut issues = Vec::new();
    for deliverable in deliverables {
        if let Some(issue) = check_deliverable(output, deliverable) {
            issues.push(issue);
        }
    }

    let worst = issues.iter().map(|issue| issue.severity).max();
    let (decision, confidence) = match worst {
        None => (Decision::Accept, Confidence::High),
        Some(Severity::Minor) => (Decision::Accept, Confidence::Medium),
        Some(_) => (Decision::Refine, Confidence::Low),
    };

    ValidationVerdict {
        decision,
        issues,
        confidence,
    }
}

fn check_deliverable(output: &Value, deliverable: &Deliverable) -> Option<Issue> {
    let value = match output.pointer(&deliverable.path) {
        None | Some(Value::Null) => {
            return Some(Issue {
                severity: Severity::Critical,
                description: format!("missing deliverable '{}'", deliverable.path),
            });
        }
        Some(value) => value,
    };

    if !deliverable.shape.matches(value) {
        return Some(Issue {
            severity: Severity::Major,
            description: format!(
                "deliverable '{}' should be {} but is {}",
                deliverable.path,
                deliverable.shape.as_str(),
                Shape::of(value)
            ),
        });
    }

    if is_empty(value) {
        let severity = if deliverable.non_empty {
            Severity::Major
        } else {
            Severity::Minor
        };
        return Some(Issue {
            severity,
            description: format!("deliverable '{}' is empty", deliverable.path),
        });
    }

    None
}

fn is_empty(value: &Value) -> bool {
    match value {
        Value::String(s) => s.trim().is_empty(),
        Value::Array(items) => items.is_empty(),
        Value::Object(map) => map.is_empty(),
        _ => false,
    }
}

/// Deliverables implied by an output schema's top-level `required` list.
pub fn deliverables_from_schema(schema: &Value) -> Vec<Deliverable> {
    let Some(required) = schema.get("required").and_then(Value::as_array) else {
        return Vec::new();
    };
    let properties = schema.get("properties");

    required
        .iter()
        .filter_map(Value::as_str)
        .map(|name| {
            let shape = properties
                .and_then(|props| props.get(name))
                .and_then(|prop| prop.get("type"))
                .and_then(Value::as_str)
                .map(shape_for_type)
                .unwrap_or_default();
            Deliverable::new(format!("/{}", escape_pointer(name)), shape)
        })
        .collect()
}

fn shape_for_type(ty: &str) -> Shape {
    match ty {
        "string" => Shape::String,
        "number" | "integer" => Shape::Number,
        "boolean" => Shape::Boolean,
        "array" => Shape::Array,
        "object" => Shape::Object,
        _ => Shape::Any,
    }
}

fn escape_pointer(segment: &str) -> String {
    segment.replace('~', "~0").replace('/', "~1")
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn deliverables() -> Vec<Deliverable> {
        vec![
            Deliverable::new("/summary", Shape::String).non_empty(),
            Deliverable::new("/findings", Shape::Array),
        ]
    }

    #[test]
    fn complete_output_is_accepted_with_high_confidence() {
        let output = json!({"summary": "ok", "findings": ["a"]});
        let verdict = evaluate(SessionState::Completed, Some(&output), &deliverables());
        assert_eq!(verdict.decision, Decision::Accept);
        assert_eq!(verdict.confidence, Confidence::High);
        assert!(verdict.issues.is_empty());
    }

    #[test]
    fn minor_gaps_still_accept() {
        let output = json!({"summary": "ok", "findings": []});
        let verdict = evaluate(SessionState::Completed, Some(&output), &deliverables());
        assert_eq!(verdict.decision, Decision::Accept);
        assert_eq!(verdict.confidence, Confidence::Medium);
        assert_eq!(verdict.issues[0].severity, Severity::Minor);
    }

    #[test]
    fn missing_deliverable_requests_refinement() {
        let output = json!({"summary": "ok"});
        let verdict = evaluate(SessionState::Completed, Some(&output), &deliverables());
        assert_eq!(verdict.decision, Decision::Refine);
        assert_eq!(verdict.confidence, Confidence::Low);
        assert_eq!(verdict.gaps(), vec!["missing deliverable '/findings'"]);
    }

    #[test]
    fn wrong_shape_is_major() {
        let output = json!({"summary": 3, "findings": []});
        let verdict = evaluate(SessionState::Completed, Some(&output), &deliverables());
        assert_eq!(verdict.decision, Decision::Refine);
        assert!(
            verdict
                .issues
                .iter()
                .any(|issue| issue.severity == Severity::Major
                    && issue.description == "deliverable '/summary' should be string but is number")
        );
    }

    #[test]
    fn failed_session_is_rejected() {
        let verdict = evaluate(SessionState::Failed, None, &deliverables());
        assert_eq!(verdict.decision, Decision::Reject);
    }

    #[test]
    fn schema_required_fields_become_deliverables() {
        let schema = json!({
            "type": "object",
            "required": ["summary", "score"],
            "properties": {
                "summary": {"type": "string"},
                "score": {"type": "integer"}
            }
        });
        assert_eq!(
            deliverables_from_schema(&schema),
            vec![
                Deliverable::new("/summary", Shape::String),
                Deliverable::new("/score", Shape::Number),
            ]
        );
    }
}
