//! Stable exit codes for conductor CLI commands.

/// Command succeeded.
pub const OK: i32 = 0;
/// Configuration is invalid (bad specifications or config file). Process-fatal.
pub const INVALID: i32 = 1;
/// The request failed with a structured per-request error.
pub const REQUEST_FAILED: i32 = 2;
/// The request ran but its output was rejected by the quality validator.
pub const REJECTED: i32 = 3;
