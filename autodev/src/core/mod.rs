//! Pure, deterministic workflow logic.
//!
//! Nothing in this module touches the filesystem, spawns processes, or reads
//! the clock implicitly; callers pass `now` where time matters.

pub mod args;
pub mod budget;
pub mod commit_msg;
pub mod context;
pub mod coverage;
pub mod gates;
pub mod halt;
pub mod plan;
pub mod reports;
pub mod rewrite;
pub mod state_machine;
pub mod types;
