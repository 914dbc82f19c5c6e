//! Relatedness check for proposed memory operations.
//!
//! A proposal is related when its subject entity names something the
//! originating request was about: the declared subject, the description, or
//! any string in the input (nested values included). Matching is on
//! normalized text, and the name must not run into a neighbouring word
//! character, so names like `.env` or `c++` still match.

use regex::Regex;
use serde_json::Value;

use crate::core::fingerprint::normalize_text;
use crate::core::types::{MemoryOperation, TaskRequest};

/// `Ok(())` when `operation` is related to `request`, otherwise the reason.
pub fn check_related(operation: &MemoryOperation, request: &TaskRequest) -> Result<(), String> {
    let subject = normalize_text(operation.subject());
    if subject.is_empty() {
        return Err(format!("{} proposal has an empty entity name", operation.label()));
    }

    if let Some(declared) = &request.subject
        && normalize_text(declared) == subject
    {
        return Ok(());
    }

    let pattern = format!(r"(?:^|\W){}(?:\W|$)", regex::escape(&subject));
    let matcher = Regex::new(&pattern).map_err(|err| err.to_string())?;

    let mut haystacks = Vec::new();
    if let Some(declared) = &request.subject {
        haystacks.push(normalize_text(declared));
    }
    haystacks.push(normalize_text(&request.description));
    for value in request.input.values() {
        collect_strings(value, &mut haystacks);
    }

    if haystacks.iter().any(|text| matcher.is_match(text)) {
        return Ok(());
    }

    Err(format!(
        "{} on '{}' is unrelated to the originating task",
        operation.label(),
        operation.subject()
    ))
}

fn collect_strings(value: &Value, out: &mut Vec<String>) {
    match value {
        Value::String(s) => out.push(normalize_text(s)),
        Value::Array(items) => {
            for item in items {
                collect_strings(item, out);
            }
        }
        Value::Object(map) => {
            for item in map.values() {
                collect_strings(item, out);
            }
        }
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::ExecutionContext;
    use serde_json::json;

    fn request() -> TaskRequest {
        TaskRequest::new(
            "reviewer",
            "Review the Auth Service for token leaks",
            ExecutionContext::root(20),
        )
        .with_input("files", json!(["src/session_store.rs"]))
    }

    fn create(entity: &str) -> MemoryOperation {
        MemoryOperation::Create {
            entity: entity.to_string(),
            kind: "component".to_string(),
            observations: Vec::new(),
        }
    }

    #[test]
    fn entity_named_in_description_is_related() {
        assert!(check_related(&create("auth  service"), &request()).is_ok());
    }

    #[test]
    fn entity_named_in_nested_input_is_related() {
        assert!(check_related(&create("src/session_store.rs"), &request()).is_ok());
    }

    #[test]
    fn unrelated_entity_is_rejected() {
        let err = check_related(&create("billing"), &request()).unwrap_err();
        assert_eq!(err, "create on 'billing' is unrelated to the originating task");
    }

    #[test]
    fn partial_word_does_not_count() {
        assert!(check_related(&create("auth serv"), &request()).is_err());
    }

    #[test]
    fn declared_subject_matches_exactly() {
        let request = request().with_subject("Payments Ledger");
        assert!(check_related(&create("payments ledger"), &request).is_ok());
    }

    #[test]
    fn relate_is_checked_against_its_source() {
        let op = MemoryOperation::Relate {
            from: "auth service".to_string(),
            relation: "depends_on".to_string(),
            to: "postgres".to_string(),
        };
        assert!(check_related(&op, &request()).is_ok());
    }

    #[test]
    fn names_with_symbols_at_the_edges_are_related() {
        let request = TaskRequest::new(
            "reviewer",
            "Check the .env file and the c++ bindings",
            ExecutionContext::root(20),
        );
        assert!(check_related(&create(".env"), &request).is_ok());
        assert!(check_related(&create("C++"), &request).is_ok());
        assert!(check_related(&create("nv file"), &request).is_err());
    }
}
