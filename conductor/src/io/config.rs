//! Conductor configuration stored under `.conductor/config.toml`.

use std::fs;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};

use crate::core::loop_guard::LoopLimits;
use crate::core::types::AdmissionPolicy;

/// Conductor configuration (TOML).
///
/// Edited by humans; missing fields fall back to the defaults below.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ConductorConfig {
    /// Delegation calls allowed under one root session.
    pub max_calls: u32,

    /// Maximum recursion depth for self-delegation (root caller's agents are depth 0).
    pub max_depth: u32,

    /// Refinement attempts allowed per task fingerprint.
    pub max_refinements: u32,

    /// Sessions allowed in `running` at once.
    pub max_concurrent: usize,

    /// What to do when every slot is taken.
    pub admission: AdmissionPolicy,

    /// Per-completion request timeout. One automatic retry follows a timeout.
    pub request_timeout_secs: u64,

    /// Wall-clock budget for a whole session, enforced by the sweep.
    pub session_timeout_secs: u64,

    pub sweep_interval_ms: u64,

    pub completion: CompletionConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct CompletionConfig {
    /// Command that reads a JSON transcript on stdin and prints the completion.
    pub command: Vec<String>,

    /// Reject completions larger than this many bytes.
    pub output_limit_bytes: usize,
}

impl Default for CompletionConfig {
    fn default() -> Self {
        Self {
            command: vec!["codex".to_string(), "exec".to_string(), "-".to_string()],
            output_limit_bytes: 1_000_000,
        }
    }
}

impl Default for ConductorConfig {
    fn default() -> Self {
        let limits = LoopLimits::default();
        Self {
            max_calls: limits.max_calls,
            max_depth: limits.max_depth,
            max_refinements: limits.max_refinements,
            max_concurrent: 4,
            admission: AdmissionPolicy::Block,
            request_timeout_secs: 120,
            session_timeout_secs: 15 * 60,
            sweep_interval_ms: 1000,
            completion: CompletionConfig::default(),
        }
    }
}

impl ConductorConfig {
    pub fn validate(&self) -> Result<()> {
        if self.max_calls == 0 {
            return Err(anyhow!("max_calls must be > 0"));
        }
        if self.max_concurrent == 0 {
            return Err(anyhow!("max_concurrent must be > 0"));
        }
        if self.request_timeout_secs == 0 {
            return Err(anyhow!("request_timeout_secs must be > 0"));
        }
        if self.session_timeout_secs == 0 {
            return Err(anyhow!("session_timeout_secs must be > 0"));
        }
        if self.sweep_interval_ms == 0 {
            return Err(anyhow!("sweep_interval_ms must be > 0"));
        }
        if self.completion.output_limit_bytes == 0 {
            return Err(anyhow!("completion.output_limit_bytes must be > 0"));
        }
        if self.completion.command.is_empty() || self.completion.command[0].trim().is_empty() {
            return Err(anyhow!("completion.command must be a non-empty array"));
        }
        Ok(())
    }

    pub fn limits(&self) -> LoopLimits {
        LoopLimits {
            max_calls: self.max_calls,
            max_depth: self.max_depth,
            max_refinements: self.max_refinements,
        }
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn session_timeout(&self) -> Duration {
        Duration::from_secs(self.session_timeout_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }
}

/// Load config from a TOML file.
///
/// If the file is missing, returns `ConductorConfig::default()`.
pub fn load_config(path: &Path) -> Result<ConductorConfig> {
    if !path.exists() {
        let cfg = ConductorConfig::default();
        cfg.validate()?;
        return Ok(cfg);
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let cfg: ConductorConfig =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    cfg.validate()
        .with_context(|| format!("validate {}", path.display()))?;
    Ok(cfg)
}

/// Atomically write config to disk (temp file + rename).
pub fn write_config(path: &Path, cfg: &ConductorConfig) -> Result<()> {
    cfg.validate()?;
    let mut buf = toml::to_string_pretty(cfg).context("serialize config toml")?;
    buf.push('\n');
    super::write_atomic(path, &buf)
}
