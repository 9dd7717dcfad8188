//! Stable exit codes for superloop CLI commands and role processes.

/// Command succeeded, or the run paused cleanly (approval, stuck, max iterations, timeout).
pub const OK: i32 = 0;
/// Command failed due to invalid config, missing files or other internal errors.
pub const INVALID: i32 = 1;
/// A role process exited with a non-zero status.
pub const ROLE_FAILED: i32 = 2;
/// Reserved code recorded when a role exceeds its hard or inactivity timeout.
pub const TIMEOUT_SENTINEL: i32 = 124;
/// Reserved code recorded when a role hits a provider rate limit.
pub const RATE_LIMIT_SENTINEL: i32 = 125;
