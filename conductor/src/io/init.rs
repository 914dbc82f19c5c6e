//! Initialization helpers for `.conductor/` scaffolding.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};

use super::config::{ConductorConfig, write_config};

/// All canonical paths within `.conductor/` for a project root.
#[derive(Debug, Clone)]
pub struct ConductorPaths {
    pub root: PathBuf,
    pub conductor_dir: PathBuf,
    pub config_path: PathBuf,
    pub agents_dir: PathBuf,
    pub principles_path: PathBuf,
    pub state_dir: PathBuf,
    pub knowledge_path: PathBuf,
    pub gitignore_path: PathBuf,
}

impl ConductorPaths {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        let conductor_dir = root.join(".conductor");
        let state_dir = conductor_dir.join("state");
        Self {
            root: root.clone(),
            conductor_dir: conductor_dir.clone(),
            config_path: conductor_dir.join("config.toml"),
            agents_dir: conductor_dir.join("agents"),
            principles_path: conductor_dir.join("principles.md"),
            knowledge_path: state_dir.join("knowledge.json"),
            gitignore_path: conductor_dir.join(".gitignore"),
            state_dir,
        }
    }

    /// Principles text, or empty when the file is absent.
    pub fn read_principles(&self) -> Result<String> {
        if !self.principles_path.exists() {
            return Ok(String::new());
        }
        fs::read_to_string(&self.principles_path)
            .with_context(|| format!("read {}", self.principles_path.display()))
    }
}

/// Options for `init_conductor`.
#[derive(Debug, Clone)]
pub struct InitOptions {
    /// If true, overwrite existing conductor-owned files.
    pub force: bool,
}

/// Create `.conductor/` scaffolding in `root`.
///
/// Fails if `.conductor/` already exists unless `options.force` is set.
pub fn init_conductor(root: &Path, options: &InitOptions) -> Result<ConductorPaths> {
    let paths = ConductorPaths::new(root);
    if paths.conductor_dir.exists() && !paths.conductor_dir.is_dir() {
        return Err(anyhow!(
            "conductor init: .conductor exists but is not a directory"
        ));
    }
    if paths.conductor_dir.exists() && !options.force {
        return Err(anyhow!(
            "conductor init: .conductor already exists (use --force to overwrite)"
        ));
    }

    create_dir(&paths.conductor_dir)?;
    create_dir(&paths.agents_dir)?;
    create_dir(&paths.state_dir)?;

    write_config(&paths.config_path, &ConductorConfig::default())?;
    write_file(&paths.principles_path, PRINCIPLES_PLACEHOLDER)?;
    write_file(&paths.agents_dir.join("reviewer.toml"), SAMPLE_AGENT)?;
    write_file(&paths.gitignore_path, CONDUCTOR_GITIGNORE)?;

    Ok(paths)
}

fn create_dir(path: &Path) -> Result<()> {
    fs::create_dir_all(path).with_context(|| format!("create directory {}", path.display()))
}

fn write_file(path: &Path, contents: &str) -> Result<()> {
    if let Some(parent) = path.parent() {
        create_dir(parent)?;
    }
    fs::write(path, contents).with_context(|| format!("write file {}", path.display()))
}

const PRINCIPLES_PLACEHOLDER: &str = "\
- Do only the task you were given.
- Report what you found, not what you assume.
";

const CONDUCTOR_GITIGNORE: &str = "state/\n";

pub(crate) const SAMPLE_AGENT: &str = r#"id = "reviewer"
operation = "review_code"
template = "Review {{ input.target }}. Focus: {{ description }}"
instructions = [
  "Read the target before commenting on it.",
  "Report concrete findings only, one per entry.",
]

[input_schema]
type = "object"
required = ["target"]

[input_schema.properties.target]
type = "string"

[output_schema]
type = "object"
required = ["summary", "findings"]

[output_schema.properties.summary]
type = "string"

[output_schema.properties.findings]
type = "array"
items = { type = "string" }

[tools]
restricted = []
full = ["review_code"]
"#;
