//! Side-effecting adapters: filesystem, subprocesses, git, and approvals.

pub mod approval;
pub mod config;
pub mod git;
pub mod paths;
pub mod process;
pub mod store;
