//! Stable exit codes for orchestrator CLI commands.

/// Command succeeded, or the run completed.
pub const OK: i32 = 0;
/// Invalid layout, config or documents, or any other error.
pub const INVALID: i32 = 1;
/// The run stopped in `needs_attention`; a human must look at it.
pub const NEEDS_ATTENTION: i32 = 2;
/// The run ended `failed` or `cancelled`, or hit its iteration limit.
pub const FAILED: i32 = 3;
