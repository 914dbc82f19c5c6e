//! Stable task fingerprints.
//!
//! A fingerprint identifies "the same unit of work" across sessions: agent
//! type, normalized description, and a digest of the input parameters.
//! Refinement attempts carry the original task's fingerprint forward.

use std::fmt;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};

use crate::core::types::TaskRequest;

static WHITESPACE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\s+").expect("whitespace regex should compile"));

/// Hex-encoded SHA-256 prefix identifying a task.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskFingerprint(String);

impl TaskFingerprint {
    pub fn compute(agent_type: &str, description: &str, input: &Map<String, Value>) -> Self {
        let context_digest = Sha256::digest(Value::Object(input.clone()).to_string().as_bytes());

        let mut hasher = Sha256::new();
        hasher.update(agent_type.as_bytes());
        hasher.update([0u8]);
        hasher.update(normalize_text(description).as_bytes());
        hasher.update([0u8]);
        hasher.update(context_digest);
        let result = hasher.finalize();
        Self(hex::encode(&result[..16]))
    }

    /// Fingerprint of a request; refinements reuse the original fingerprint.
    pub fn of(request: &TaskRequest) -> Self {
        match &request.refinement {
            Some(refinement) => refinement.fingerprint.clone(),
            None => Self::compute(&request.agent_type, &request.description, &request.input),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TaskFingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Lowercase and collapse runs of whitespace.
pub fn normalize_text(text: &str) -> String {
    WHITESPACE_RE
        .replace_all(text.trim(), " ")
        .to_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::{ExecutionContext, Refinement};

    #[test]
    fn whitespace_and_case_do_not_change_fingerprint() {
        let input = Map::new();
        let a = TaskFingerprint::compute("reviewer", "Review  the\nAuth module", &input);
        let b = TaskFingerprint::compute("reviewer", "review the auth module ", &input);
        assert_eq!(a, b);
    }

    #[test]
    fn agent_type_and_input_change_fingerprint() {
        let mut input = Map::new();
        let base = TaskFingerprint::compute("reviewer", "review", &input);
        assert_ne!(base, TaskFingerprint::compute("tester", "review", &input));

        input.insert("path".to_string(), Value::from("src/auth.rs"));
        assert_ne!(base, TaskFingerprint::compute("reviewer", "review", &input));
    }

    #[test]
    fn refinement_reuses_original_fingerprint() {
        let original = TaskRequest::new("reviewer", "review auth", ExecutionContext::root(20));
        let fingerprint = TaskFingerprint::of(&original);

        let mut refined = original.clone();
        refined.description = "review auth\n\nAddress: missing findings".to_string();
        refined.refinement = Some(Refinement {
            fingerprint: fingerprint.clone(),
            attempt: 1,
            gaps: vec!["missing findings".to_string()],
        });
        assert_eq!(TaskFingerprint::of(&refined), fingerprint);
    }

    #[test]
    fn fingerprint_is_32_hex_chars() {
        let fp = TaskFingerprint::compute("a", "b", &Map::new());
        assert_eq!(fp.as_str().len(), 32);
        assert!(fp.as_str().chars().all(|c| c.is_ascii_hexdigit()));
    }
}
