//! Stable exit codes for `taskexec` commands.

/// The task produced an accepted output, or the task file checked out.
pub const OK: i32 = 0;
/// Invalid task file, missing agent, or another error before the run.
pub const INVALID: i32 = 1;
/// Every retry budget was spent; the run returned the failure sentinel.
pub const FAILED: i32 = 2;
