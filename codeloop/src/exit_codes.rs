//! Stable exit codes for `codeloop` commands.

/// Command succeeded; for `run`, the task's change passed the gate.
pub const OK: i32 = 0;
/// Invalid input, config or workspace, or any other error before the loop ran.
pub const INVALID: i32 = 1;
/// The iteration budget ran out without a passing change.
pub const EXHAUSTED: i32 = 2;
/// The task was aborted (busy branch, cancellation, unrecoverable error).
pub const ABORTED: i32 = 3;
