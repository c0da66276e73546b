//! Autonomous development workflow orchestrator.
//!
//! A small state machine drives analyze → plan → improve → test → document →
//! git steps over a target repository, bounded by a consumption budget and
//! guarded by security approval gates. The crate follows a strict split:
//!
//! - **[`core`]**: Pure, deterministic logic (budget arithmetic, gate matching,
//!   state bookkeeping, coverage parsing). No I/O.
//! - **[`io`]**: Side-effecting adapters (filesystem, git, subprocesses,
//!   interactive approvals).
//! - **[`agents`]**: One agent per pipeline step, combining core logic with
//!   io adapters.
//!
//! [`orchestrator`] composes the agents into the workflow state machine and
//! [`command`] parses the `/sc:` command surface.

pub mod agents;
pub mod command;
pub mod core;
pub mod exit_codes;
pub mod io;
pub mod logging;
pub mod orchestrator;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
