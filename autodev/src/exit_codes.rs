//! Stable exit codes for the `autodev` CLI.

/// Command completed and its result was printed.
pub const OK: i32 = 0;
/// Command failed (step error, halted workflow, invalid config or state).
pub const FAILURE: i32 = 1;
/// Input was not a recognized `/sc:` command.
pub const USAGE: i32 = 2;
