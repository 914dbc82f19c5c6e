//! Deterministic, pure logic shared by the orchestration core.
//!
//! Core modules must be free of I/O side effects. They operate on in-memory
//! data structures and return deterministic outputs suitable for tests.

pub mod envelope;
pub mod fingerprint;
pub mod loop_guard;
pub mod quality;
pub mod relatedness;
pub mod session;
pub mod types;
