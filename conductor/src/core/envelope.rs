//! Agent response envelope parsing.
//!
//! Agents reply with a single JSON object:
//! `{"output": {...}, "memory": [...], "delegate": [...]}`. Only `output` is
//! required. A surrounding Markdown code fence is tolerated.

use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::core::types::{Delegation, MemoryOperation, Shape};

static FENCE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?s)^\s*```[A-Za-z0-9_-]*\s*\n(.*?)\n\s*```\s*$")
        .expect("fence regex should compile")
});

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AgentEnvelope {
    pub output: Value,
    #[serde(default)]
    pub memory: Vec<MemoryOperation>,
    #[serde(default)]
    pub delegate: Vec<Delegation>,
}

/// Parse a raw completion into an envelope.
///
/// Returns the list of structural errors on failure.
pub fn parse_envelope(text: &str) -> Result<AgentEnvelope, Vec<String>> {
    let body = match FENCE_RE.captures(text) {
        Some(captures) => captures.get(1).map_or(text, |m| m.as_str()),
        None => text,
    };
    let body = body.trim();
    if body.is_empty() {
        return Err(vec!["response was empty".to_string()]);
    }

    let value: Value = serde_json::from_str(body)
        .map_err(|err| vec![format!("response is not valid JSON: {err}")])?;
    if !value.is_object() {
        return Err(vec![format!(
            "response must be a JSON object, got {}",
            Shape::of(&value)
        )]);
    }

    serde_json::from_value(value).map_err(|err| vec![format!("invalid response envelope: {err}")])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_plain_envelope() {
        let envelope =
            parse_envelope(r#"{"output": {"summary": "done"}}"#).expect("plain envelope");
        assert_eq!(envelope.output["summary"], "done");
        assert!(envelope.memory.is_empty());
        assert!(envelope.delegate.is_empty());
    }

    #[test]
    fn strips_markdown_fence() {
        let text = "```json\n{\"output\": {\"summary\": \"x\"}, \"memory\": [{\"op\": \"retract\", \"entity\": \"a\"}]}\n```\n";
        let envelope = parse_envelope(text).expect("fenced envelope");
        assert_eq!(envelope.memory.len(), 1);
    }

    #[test]
    fn parses_delegations() {
        let text = r#"{"output": {}, "delegate": [{"agent_type": "tester", "description": "write tests"}]}"#;
        let envelope = parse_envelope(text).expect("delegations");
        assert_eq!(envelope.delegate[0].agent_type, "tester");
    }

    #[test]
    fn prose_is_a_structural_error() {
        let errors = parse_envelope("I think the answer is 4").unwrap_err();
        assert!(errors[0].starts_with("response is not valid JSON"));
    }

    #[test]
    fn missing_output_is_a_structural_error() {
        let errors = parse_envelope(r#"{"memory": []}"#).unwrap_err();
        assert!(errors[0].contains("missing field `output`"));
    }
}
