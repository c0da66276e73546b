//! Shared deterministic types for workflow core logic.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Orchestrator workflow state.
///
/// `Idle` is the initial state; `Done` and `Stop` are terminal for a single
/// invocation, but the next command may re-enter the machine from any state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WorkflowState {
    Idle,
    Analyze,
    Plan,
    Improve,
    Test,
    Troubleshoot,
    Document,
    Git,
    Done,
    Stop,
}

impl WorkflowState {
    pub const ALL: [WorkflowState; 10] = [
        WorkflowState::Idle,
        WorkflowState::Analyze,
        WorkflowState::Plan,
        WorkflowState::Improve,
        WorkflowState::Test,
        WorkflowState::Troubleshoot,
        WorkflowState::Document,
        WorkflowState::Git,
        WorkflowState::Done,
        WorkflowState::Stop,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            WorkflowState::Idle => "IDLE",
            WorkflowState::Analyze => "ANALYZE",
            WorkflowState::Plan => "PLAN",
            WorkflowState::Improve => "IMPROVE",
            WorkflowState::Test => "TEST",
            WorkflowState::Troubleshoot => "TROUBLESHOOT",
            WorkflowState::Document => "DOCUMENT",
            WorkflowState::Git => "GIT",
            WorkflowState::Done => "DONE",
            WorkflowState::Stop => "STOP",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, WorkflowState::Done | WorkflowState::Stop)
    }

    /// States that indicate something went wrong during a session.
    pub fn is_error_state(self) -> bool {
        matches!(self, WorkflowState::Stop | WorkflowState::Troubleshoot)
    }
}

impl fmt::Display for WorkflowState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Severity attached to a security violation, ordered from least to most severe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RiskLevel {
    Safe,
    Medium,
    High,
    Critical,
}

impl RiskLevel {
    pub fn as_str(self) -> &'static str {
        match self {
            RiskLevel::Safe => "safe",
            RiskLevel::Medium => "medium",
            RiskLevel::High => "high",
            RiskLevel::Critical => "critical",
        }
    }
}

impl fmt::Display for RiskLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn workflow_state_serializes_as_upper_case() {
        let json = serde_json::to_string(&WorkflowState::Troubleshoot).expect("serialize");
        assert_eq!(json, "\"TROUBLESHOOT\"");
        let parsed: WorkflowState = serde_json::from_str("\"IDLE\"").expect("parse");
        assert_eq!(parsed, WorkflowState::Idle);
    }

    #[test]
    fn risk_levels_order_by_severity() {
        assert!(RiskLevel::Critical > RiskLevel::High);
        assert!(RiskLevel::High > RiskLevel::Medium);
        assert!(RiskLevel::Medium > RiskLevel::Safe);
    }
}
