//! Errors that halt the workflow.
//!
//! These are the only failures that move the orchestrator into `STOP`. They
//! are recognized by type anywhere in an `anyhow` error chain, so callers may
//! freely wrap them with context.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Why the budget refuses further work, in evaluation priority order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    MaxIterations,
    TimeLimit,
    FileLimit,
    DiffLimit,
    NoImprovement,
    HighFailureRate,
    InProgress,
}

impl StopReason {
    pub fn describe(self) -> &'static str {
        match self {
            StopReason::MaxIterations => "Maximum iterations reached",
            StopReason::TimeLimit => "Time limit exceeded",
            StopReason::FileLimit => "Changed files limit reached",
            StopReason::DiffLimit => "Diff size limit reached",
            StopReason::NoImprovement => "No improvement in consecutive cycles",
            StopReason::HighFailureRate => "Test failure rate too high",
            StopReason::InProgress => "In progress",
        }
    }
}

impl fmt::Display for StopReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.describe())
    }
}

/// The budget has no capacity left for the requested work.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BudgetExhaustedError {
    pub reason: StopReason,
}

impl fmt::Display for BudgetExhaustedError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "budget exhausted: {}", self.reason)
    }
}

impl std::error::Error for BudgetExhaustedError {}

/// A risky operation was not approved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SecurityRejectedError {
    /// Gate names that flagged the operation (sorted, de-duplicated).
    pub gates: Vec<String>,
    /// Operation text or plan objective that was rejected.
    pub subject: String,
}

impl fmt::Display for SecurityRejectedError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "security approval rejected for '{}' (gates: {})",
            self.subject,
            self.gates.join(", ")
        )
    }
}

impl std::error::Error for SecurityRejectedError {}

/// Return true when the error chain contains a workflow-halting error.
pub fn is_halt(err: &anyhow::Error) -> bool {
    err.chain()
        .any(|cause| cause.is::<BudgetExhaustedError>() || cause.is::<SecurityRejectedError>())
}
