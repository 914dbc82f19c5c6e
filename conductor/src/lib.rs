//! Sub-agent orchestration core.
//!
//! Loads declarative agent specifications, spawns bounded agent sessions
//! against a completion service, guards against runaway delegation, validates
//! root-level results with bounded refinement, and reconciles the
//! knowledge-base mutations agents propose. The architecture keeps a strict
//! separation:
//!
//! - **[`core`]**: Pure, deterministic logic (loop guard, quality verdicts,
//!   relatedness, session state machine). No I/O, fully testable in isolation.
//! - **[`io`]**: Side-effecting operations (config, catalog loading, prompt
//!   rendering, the completion command, durable state, the knowledge base).
//!
//! Runtime modules ([`sessions`], [`tracker`], [`limiter`], [`lifecycle`],
//! [`spawner`], [`review`], [`memory`], [`tools`]) combine the two, and
//! [`conductor::Conductor`] wires them together.

pub mod conductor;
pub mod core;
pub mod error;
pub mod exit_codes;
pub mod io;
pub mod lifecycle;
pub mod limiter;
pub mod logging;
pub mod memory;
pub mod review;
pub mod sessions;
pub mod spawner;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
pub mod tools;
pub mod tracker;

pub use conductor::{Conductor, RunFailure, RunOutcome};
pub use error::{ConductorError, Result};
