//! Stable exit codes for the harness CLI.

/// All phases passed and every artifact category was found.
pub const OK: i32 = 0;
/// Prerequisites unmet, setup failed, or the smoke test failed.
pub const SETUP_FAILED: i32 = 1;
/// The evaluation invocation exited non-zero (or timed out under the `fail` policy).
pub const EXECUTION_FAILED: i32 = 2;
/// At least one artifact category was missing from the tracking store.
pub const VERIFICATION_FAILED: i32 = 3;
/// The run was interrupted by a signal; cleanup ran from the signal handler.
pub const INTERRUPTED: i32 = 130;
