//! Typed workflow context: one slot per step result.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::core::budget::BudgetStatus;
use crate::core::plan::ObjectivePlan;
use crate::core::reports::{
    AnalysisReport, DocumentReport, GitReport, ImproveReport, TestReport, TroubleshootReport,
};
use crate::core::types::WorkflowState;

/// Context slot names, serialized as the persisted JSON keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContextKey {
    Analysis,
    Plan,
    LastImprovement,
    LastTest,
    Documentation,
    LastGit,
    Troubleshoot,
    Budget,
}

impl ContextKey {
    pub fn as_str(self) -> &'static str {
        match self {
            ContextKey::Analysis => "analysis",
            ContextKey::Plan => "plan",
            ContextKey::LastImprovement => "last_improvement",
            ContextKey::LastTest => "last_test",
            ContextKey::Documentation => "documentation",
            ContextKey::LastGit => "last_git",
            ContextKey::Troubleshoot => "troubleshoot",
            ContextKey::Budget => "budget",
        }
    }
}

impl fmt::Display for ContextKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A step's result, tagged with the step that produced it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "step", rename_all = "snake_case")]
pub enum StepResult {
    Analysis(AnalysisReport),
    Plan(ObjectivePlan),
    Improvement(ImproveReport),
    Test(TestReport),
    Documentation(DocumentReport),
    Git(GitReport),
    Troubleshoot(TroubleshootReport),
    Budget(BudgetStatus),
}

impl StepResult {
    pub fn key(&self) -> ContextKey {
        match self {
            StepResult::Analysis(_) => ContextKey::Analysis,
            StepResult::Plan(_) => ContextKey::Plan,
            StepResult::Improvement(_) => ContextKey::LastImprovement,
            StepResult::Test(_) => ContextKey::LastTest,
            StepResult::Documentation(_) => ContextKey::Documentation,
            StepResult::Git(_) => ContextKey::LastGit,
            StepResult::Troubleshoot(_) => ContextKey::Troubleshoot,
            StepResult::Budget(_) => ContextKey::Budget,
        }
    }

    pub fn success(&self) -> bool {
        match self {
            StepResult::Analysis(r) => r.success,
            StepResult::Plan(_) => true,
            StepResult::Improvement(r) => r.success,
            StepResult::Test(r) => r.success,
            StepResult::Documentation(r) => r.success,
            StepResult::Git(r) => r.success,
            StepResult::Troubleshoot(r) => r.success,
            StepResult::Budget(r) => r.can_proceed,
        }
    }
}

/// The most recent error observed by the orchestrator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorRecord {
    pub message: String,
    pub state: WorkflowState,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Context {
    #[serde(default)]
    pub slots: BTreeMap<ContextKey, StepResult>,
    #[serde(default)]
    pub last_error: Option<ErrorRecord>,
    #[serde(default)]
    pub last_update: Option<DateTime<Utc>>,
}

impl Context {
    /// Replace the slots named by `patch`, leaving every other slot intact.
    ///
    /// Returns the updated keys in patch order.
    pub fn merge(&mut self, patch: Vec<StepResult>, now: DateTime<Utc>) -> Vec<ContextKey> {
        let mut updated = Vec::with_capacity(patch.len());
        for result in patch {
            let key = result.key();
            self.slots.insert(key, result);
            updated.push(key);
        }
        self.last_update = Some(now);
        updated
    }

    pub fn get(&self, key: ContextKey) -> Option<&StepResult> {
        self.slots.get(&key)
    }

    pub fn analysis(&self) -> Option<&AnalysisReport> {
        match self.get(ContextKey::Analysis) {
            Some(StepResult::Analysis(report)) => Some(report),
            _ => None,
        }
    }

    pub fn last_improvement(&self) -> Option<&ImproveReport> {
        match self.get(ContextKey::LastImprovement) {
            Some(StepResult::Improvement(report)) => Some(report),
            _ => None,
        }
    }

    pub fn last_test(&self) -> Option<&TestReport> {
        match self.get(ContextKey::LastTest) {
            Some(StepResult::Test(report)) => Some(report),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::plan::create_plan;
    use crate::core::reports::DocumentReport;

    fn docs(success: bool) -> StepResult {
        StepResult::Documentation(DocumentReport {
            success,
            changelog: None,
            readme_updated: false,
            api: None,
            created: Vec::new(),
        })
    }

    #[test]
    fn merge_replaces_only_named_slots() {
        let now = Utc::now();
        let mut ctx = Context::default();
        ctx.merge(vec![StepResult::Plan(create_plan("error handling"))], now);
        let updated = ctx.merge(vec![docs(true)], now);
        assert_eq!(updated, vec![ContextKey::Documentation]);
        assert!(ctx.get(ContextKey::Plan).is_some());

        ctx.merge(vec![docs(false)], now);
        assert_eq!(ctx.slots.len(), 2);
        assert!(!ctx.get(ContextKey::Documentation).expect("docs").success());
    }

    #[test]
    fn context_round_trips_through_json() {
        let now = Utc::now();
        let mut ctx = Context::default();
        ctx.merge(vec![docs(true), StepResult::Plan(create_plan("x"))], now);
        let json = serde_json::to_string(&ctx).expect("serialize");
        assert!(json.contains("\"documentation\":{\"step\":\"documentation\""));
        let back: Context = serde_json::from_str(&json).expect("parse");
        assert_eq!(back, ctx);
    }
}
