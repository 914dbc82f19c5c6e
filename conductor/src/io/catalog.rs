//! Agent specification loading and validation.
//!
//! Every `*.toml` / `*.json` file in the agents directory is one agent type.
//! Loading is all-or-nothing: any malformed document fails the whole catalog
//! with a [`ConductorError::Configuration`] listing every problem found.

use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::path::Path;
use std::sync::Arc;

use jsonschema::{Validator, validator_for};
use minijinja::Environment;
use serde_json::{Map, Value};
use tracing::{debug, info};

use crate::core::types::Specification;
use crate::error::{ConductorError, Result};

const SPECIFICATION_SCHEMA: &str = include_str!(concat!(
    env!("CARGO_MANIFEST_DIR"),
    "/schemas/specification.schema.json"
));

/// A specification with its input/output schemas compiled.
pub struct AgentSpec {
    pub spec: Specification,
    input: Validator,
    output: Validator,
}

impl fmt::Debug for AgentSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AgentSpec")
            .field("spec", &self.spec)
            .finish_non_exhaustive()
    }
}

impl AgentSpec {
    /// Compile `spec`, returning every semantic problem found.
    fn compile(spec: Specification) -> std::result::Result<Self, Vec<String>> {
        let mut errors = Vec::new();

        if let Err(err) = Environment::new().template_from_str(&spec.template) {
            errors.push(format!("template does not compile: {err}"));
        }
        let input = validator_for(&spec.input_schema)
            .map_err(|err| errors.push(format!("input_schema is not a valid JSON Schema: {err}")))
            .ok();
        let output = validator_for(&spec.output_schema)
            .map_err(|err| errors.push(format!("output_schema is not a valid JSON Schema: {err}")))
            .ok();

        match (input, output) {
            (Some(input), Some(output)) if errors.is_empty() => Ok(Self {
                spec,
                input,
                output,
            }),
            _ => Err(errors),
        }
    }

    /// Input-schema violations for `input` (empty when valid).
    pub fn validate_input(&self, input: &Map<String, Value>) -> Vec<String> {
        let instance = Value::Object(input.clone());
        self.input
            .iter_errors(&instance)
            .map(|err| err.to_string())
            .collect()
    }

    /// Output-schema violations for `output` (empty when valid).
    pub fn validate_output(&self, output: &Value) -> Vec<String> {
        self.output
            .iter_errors(output)
            .map(|err| err.to_string())
            .collect()
    }
}

/// Immutable set of agent types, keyed by id.
#[derive(Debug, Default)]
pub struct Catalog {
    agents: BTreeMap<String, Arc<AgentSpec>>,
}

impl Catalog {
    /// Build a catalog from in-memory specifications.
    pub fn from_specs(specs: impl IntoIterator<Item = Specification>) -> Result<Self> {
        let mut builder = CatalogBuilder::default();
        for spec in specs {
            let origin = spec.id.clone();
            builder.add(&origin, spec);
        }
        builder.finish()
    }

    pub fn get(&self, id: &str) -> Result<Arc<AgentSpec>> {
        self.agents
            .get(id)
            .cloned()
            .ok_or_else(|| ConductorError::NotFound(id.to_string()))
    }

    /// Agent types in id order.
    pub fn iter(&self) -> impl Iterator<Item = &Arc<AgentSpec>> {
        self.agents.values()
    }

    pub fn len(&self) -> usize {
        self.agents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.agents.is_empty()
    }
}

#[derive(Default)]
struct CatalogBuilder {
    agents: BTreeMap<String, Arc<AgentSpec>>,
    origins: BTreeMap<String, String>,
    operations: BTreeMap<String, String>,
    errors: Vec<String>,
}

impl CatalogBuilder {
    fn add(&mut self, origin: &str, spec: Specification) {
        if let Some(first) = self.origins.get(&spec.id) {
            self.errors.push(format!(
                "{origin}: duplicate agent id '{}' (already defined in {first})",
                spec.id
            ));
            return;
        }
        if let Some(operation) = &spec.operation {
            if let Some(first) = self.operations.get(operation) {
                self.errors.push(format!(
                    "{origin}: duplicate operation '{operation}' (already defined in {first})"
                ));
                return;
            }
            self.operations
                .insert(operation.clone(), origin.to_string());
        }
        self.origins.insert(spec.id.clone(), origin.to_string());

        let id = spec.id.clone();
        match AgentSpec::compile(spec) {
            Ok(agent) => {
                self.agents.insert(id, Arc::new(agent));
            }
            Err(errors) => self
                .errors
                .extend(errors.into_iter().map(|err| format!("{origin}: {err}"))),
        }
    }

    fn finish(self) -> Result<Catalog> {
        if !self.errors.is_empty() {
            return Err(ConductorError::Configuration(self.errors));
        }
        Ok(Catalog {
            agents: self.agents,
        })
    }
}

/// Load every specification document in `dir`, in file-name order.
pub fn load_catalog(dir: &Path) -> Result<Catalog> {
    debug!(dir = %dir.display(), "loading agent catalog");
    let document_schema: Value = serde_json::from_str(SPECIFICATION_SCHEMA).map_err(|err| {
        ConductorError::Configuration(vec![format!("embedded document schema: {err}")])
    })?;
    let document_validator = validator_for(&document_schema).map_err(|err| {
        ConductorError::Configuration(vec![format!("embedded document schema: {err}")])
    })?;

    let entries = fs::read_dir(dir).map_err(|err| {
        ConductorError::Configuration(vec![format!("read {}: {err}", dir.display())])
    })?;
    let mut files = Vec::new();
    for entry in entries {
        let path = entry
            .map_err(|err| {
                ConductorError::Configuration(vec![format!("read {}: {err}", dir.display())])
            })?
            .path();
        let is_document = path
            .extension()
            .and_then(|ext| ext.to_str())
            .is_some_and(|ext| ext == "toml" || ext == "json");
        if path.is_file() && is_document {
            files.push(path);
        }
    }
    files.sort();

    let mut builder = CatalogBuilder::default();
    for path in &files {
        let origin = path
            .file_name()
            .map_or_else(|| path.display().to_string(), |name| name.to_string_lossy().into_owned());
        let document = match read_document(path) {
            Ok(document) => document,
            Err(err) => {
                builder.errors.push(format!("{origin}: {err}"));
                continue;
            }
        };

        let violations: Vec<String> = document_validator
            .iter_errors(&document)
            .map(|err| format!("{origin}: {err}"))
            .collect();
        if !violations.is_empty() {
            builder.errors.extend(violations);
            continue;
        }

        match serde_json::from_value::<Specification>(document) {
            Ok(spec) => builder.add(&origin, spec),
            Err(err) => builder.errors.push(format!("{origin}: {err}")),
        }
    }

    let catalog = builder.finish()?;
    info!(
        dir = %dir.display(),
        agents = catalog.len(),
        "agent catalog loaded"
    );
    Ok(catalog)
}

fn read_document(path: &Path) -> std::result::Result<Value, String> {
    let contents = fs::read_to_string(path).map_err(|err| format!("read failed: {err}"))?;
    let is_toml = path.extension().is_some_and(|ext| ext == "toml");
    if is_toml {
        toml::from_str::<Value>(&contents).map_err(|err| format!("parse toml: {err}"))
    } else {
        serde_json::from_str::<Value>(&contents).map_err(|err| format!("parse json: {err}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const VALID_JSON: &str = r#"{
        "id": "tester",
        "template": "Test {{ input.target }}",
        "instructions": ["Write focused tests."],
        "input_schema": {"type": "object", "required": ["target"], "properties": {"target": {"type": "string"}}},
        "output_schema": {"type": "object", "required": ["summary"]},
        "tools": {"restricted": [], "full": ["*"]}
    }"#;

    fn write(dir: &Path, name: &str, contents: &str) {
        fs::write(dir.join(name), contents).expect("write spec");
    }

    #[test]
    fn loads_toml_and_json_documents() {
        let temp = tempfile::tempdir().expect("tempdir");
        write(temp.path(), "reviewer.toml", crate::io::init::SAMPLE_AGENT);
        write(temp.path(), "tester.json", VALID_JSON);
        write(temp.path(), "README.md", "ignored");

        let catalog = load_catalog(temp.path()).expect("catalog");
        assert_eq!(catalog.len(), 2);
        let reviewer = catalog.get("reviewer").expect("reviewer");
        assert_eq!(reviewer.spec.tool_name(), "review_code");
        let ids: Vec<&str> = catalog.iter().map(|a| a.spec.id.as_str()).collect();
        assert_eq!(ids, ["reviewer", "tester"]);
    }

    #[test]
    fn unknown_agent_is_not_found() {
        let catalog = Catalog::default();
        let err = catalog.get("ghost").unwrap_err();
        assert_eq!(err.kind(), "not_found");
    }

    /// Every malformed document is reported, not just the first.
    #[test]
    fn reports_every_failure() {
        let temp = tempfile::tempdir().expect("tempdir");
        write(temp.path(), "a_missing_id.json", r#"{"template": "x"}"#);
        write(
            temp.path(),
            "b_bad_template.json",
            &VALID_JSON
                .replace("\"tester\"", "\"broken\"")
                .replace("Test {{ input.target }}", "Test {{ input.target"),
        );
        write(temp.path(), "c_not_toml.toml", "id = [");
        write(temp.path(), "d_ok.json", VALID_JSON);

        let err = load_catalog(temp.path()).unwrap_err();
        let ConductorError::Configuration(errors) = err else {
            panic!("expected configuration error");
        };
        assert!(errors.iter().any(|e| e.starts_with("a_missing_id.json:")));
        assert!(
            errors
                .iter()
                .any(|e| e.starts_with("b_bad_template.json: template does not compile"))
        );
        assert!(errors.iter().any(|e| e.starts_with("c_not_toml.toml: parse toml")));
        assert!(!errors.iter().any(|e| e.starts_with("d_ok.json")));
    }

    #[test]
    fn duplicate_ids_are_rejected() {
        let temp = tempfile::tempdir().expect("tempdir");
        write(temp.path(), "one.json", VALID_JSON);
        write(temp.path(), "two.json", VALID_JSON);
        let err = load_catalog(temp.path()).unwrap_err();
        assert!(err.to_string().contains("two.json: duplicate agent id 'tester'"));
    }

    #[test]
    fn invalid_output_schema_is_rejected() {
        let spec = Specification {
            id: "bad".to_string(),
            operation: None,
            template: "x".to_string(),
            instructions: Vec::new(),
            input_schema: json!({"type": "object"}),
            output_schema: json!({"type": 12}),
            tools: crate::core::types::ToolAccess {
                restricted: Vec::new(),
                full: Vec::new(),
            },
        };
        let err = Catalog::from_specs([spec]).unwrap_err();
        assert!(err.to_string().contains("bad: output_schema is not a valid JSON Schema"));
    }

    #[test]
    fn compiled_schemas_validate_io() {
        let temp = tempfile::tempdir().expect("tempdir");
        write(temp.path(), "tester.json", VALID_JSON);
        let catalog = load_catalog(temp.path()).expect("catalog");
        let tester = catalog.get("tester").expect("tester");

        let mut input = Map::new();
        assert_eq!(tester.validate_input(&input).len(), 1);
        input.insert("target".to_string(), json!("src/lib.rs"));
        assert!(tester.validate_input(&input).is_empty());

        assert!(tester.validate_output(&json!({"summary": "ok"})).is_empty());
        assert!(!tester.validate_output(&json!({})).is_empty());
    }
}
