//! Security gate agent: violation detection plus the approval protocol.

use std::collections::BTreeSet;

use anyhow::Result;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};

use crate::core::gates::{
    OperationContext, Violation, approval_prompt, cache_key, detect_file_violations,
    detect_violations, gate_names, highest_level, needs_approval, risk_level,
};
use crate::core::halt::SecurityRejectedError;
use crate::core::plan::ImprovementPlan;
use crate::core::types::RiskLevel;
use crate::io::approval::{ApprovalProvider, is_affirmative};

/// Outcome of validating an operation or plan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GateDecision {
    pub approved: bool,
    /// Approval came from the session cache without prompting.
    pub cached: bool,
    pub violations: Vec<Violation>,
}

impl GateDecision {
    /// Convert a rejection into a halting [`SecurityRejectedError`].
    pub fn ensure_approved(&self, subject: &str) -> Result<()> {
        if self.approved {
            return Ok(());
        }
        Err(SecurityRejectedError {
            gates: gate_names(&self.violations),
            subject: subject.to_string(),
        }
        .into())
    }
}

/// Checks operations against the gate catalogue and asks for approval.
///
/// Approvals are cached for the session by the exact set of gates involved,
/// so a different combination always prompts again.
pub struct SecurityGateAgent {
    approvals: Box<dyn ApprovalProvider>,
    approved_keys: BTreeSet<String>,
    source_root: String,
}

impl SecurityGateAgent {
    pub fn new(approvals: Box<dyn ApprovalProvider>, source_root: &str) -> Self {
        Self {
            approvals,
            approved_keys: BTreeSet::new(),
            source_root: source_root.trim_end_matches('/').to_string(),
        }
    }

    /// Validate a single operation description.
    #[instrument(skip_all, fields(operation))]
    pub fn validate_operation(
        &mut self,
        operation: &str,
        ctx: &OperationContext,
    ) -> Result<GateDecision> {
        let violations = detect_violations(operation, ctx);
        self.decide(operation, violations)
    }

    /// Validate every operation and file of an improvement plan as one decision.
    #[instrument(skip_all, fields(objective = %plan.objective))]
    pub fn validate_plan(&mut self, plan: &ImprovementPlan) -> Result<GateDecision> {
        let outside_source = plan
            .files
            .iter()
            .any(|file| !self.is_inside_source(file));
        let mut violations = Vec::new();
        for op in &plan.operations {
            let ctx = OperationContext {
                file_count: op.files.len(),
                outside_source,
                policy_reason: None,
            };
            violations.extend(detect_violations(op.kind.as_str(), &ctx));
        }
        for file in &plan.files {
            violations.extend(detect_file_violations(file));
        }
        self.decide(&format!("improvement plan: {}", plan.objective), violations)
    }

    pub fn risk_level(&self, operation: &str) -> RiskLevel {
        risk_level(operation)
    }

    pub fn needs_approval(&self, operation: &str) -> bool {
        needs_approval(operation)
    }

    /// Forget every cached approval.
    pub fn clear_cache(&mut self) {
        self.approved_keys.clear();
    }

    fn is_inside_source(&self, file: &str) -> bool {
        let prefix = format!("{}/", self.source_root);
        file.starts_with(&prefix)
    }

    fn decide(&mut self, summary: &str, violations: Vec<Violation>) -> Result<GateDecision> {
        if violations.is_empty() {
            debug!("no gate violations");
            return Ok(GateDecision {
                approved: true,
                cached: false,
                violations,
            });
        }

        let key = cache_key(&violations);
        if self.approved_keys.contains(&key) {
            debug!(key = %key, "approval served from session cache");
            return Ok(GateDecision {
                approved: true,
                cached: true,
                violations,
            });
        }

        let prompt = approval_prompt(summary, &violations);
        let answer = self.approvals.ask(&prompt)?;
        let approved = is_affirmative(&answer);
        if approved {
            info!(key = %key, level = %highest_level(&violations), "operation approved");
            self.approved_keys.insert(key);
        } else {
            warn!(key = %key, level = %highest_level(&violations), "operation rejected");
        }
        Ok(GateDecision {
            approved,
            cached: false,
            violations,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::plan::{OperationKind, PlannedOperation};
    use crate::test_support::ScriptedApprovals;

    fn agent(answers: &[&str]) -> (SecurityGateAgent, ScriptedApprovals) {
        let approvals = ScriptedApprovals::new(answers);
        (
            SecurityGateAgent::new(Box::new(approvals.clone()), "src"),
            approvals,
        )
    }

    #[test]
    fn safe_operation_is_approved_without_prompt() {
        let (mut gate, approvals) = agent(&[]);
        let decision = gate
            .validate_operation("git status", &OperationContext::default())
            .expect("validate");
        assert!(decision.approved);
        assert!(approvals.prompts().is_empty());
    }

    #[test]
    fn approval_is_cached_per_gate_set() {
        let (mut gate, approvals) = agent(&["yes", "n"]);
        let first = gate
            .validate_operation("npm install lodash", &OperationContext::default())
            .expect("first");
        assert!(first.approved && !first.cached);

        let second = gate
            .validate_operation("yarn add react", &OperationContext::default())
            .expect("second");
        assert!(second.approved && second.cached);
        assert_eq!(approvals.prompts().len(), 1);

        let third = gate
            .validate_operation("npm install x && rm -rf build", &OperationContext::default())
            .expect("third");
        assert!(!third.approved, "new gate combination prompts again");
        assert_eq!(approvals.prompts().len(), 2);
        let err = third.ensure_approved("npm install x").expect_err("rejected");
        let rejected = err
            .downcast_ref::<SecurityRejectedError>()
            .expect("typed rejection");
        assert_eq!(rejected.gates, vec!["deletion", "dependencies"]);
    }

    #[test]
    fn risk_queries_never_prompt() {
        let (gate, approvals) = agent(&[]);
        assert_eq!(gate.risk_level("git status"), RiskLevel::Safe);
        assert_eq!(gate.risk_level("git push origin main"), RiskLevel::Critical);
        assert!(gate.needs_approval("npm install left-pad"));
        assert!(!gate.needs_approval("git diff"));
        assert!(approvals.prompts().is_empty());
    }

    #[test]
    fn clear_cache_forces_new_prompt() {
        let (mut gate, approvals) = agent(&["y", "y"]);
        gate.validate_operation("pip install x", &OperationContext::default())
            .expect("first");
        gate.clear_cache();
        gate.validate_operation("pip install x", &OperationContext::default())
            .expect("second");
        assert_eq!(approvals.prompts().len(), 2);
    }

    #[test]
    fn plan_with_sensitive_file_requires_approval() {
        let (mut gate, approvals) = agent(&["n"]);
        let plan = ImprovementPlan {
            objective: "security".to_string(),
            branch: "feat/auto-x".to_string(),
            operations: vec![PlannedOperation {
                kind: OperationKind::SecurityHardening,
                description: OperationKind::SecurityHardening.description().to_string(),
                files: vec!["src/config/.env.local.js".to_string()],
            }],
            files: vec!["src/config/.env.local.js".to_string()],
            estimated_diff_kb: 10.0,
        };
        let decision = gate.validate_plan(&plan).expect("validate");
        assert!(!decision.approved);
        assert!(approvals.prompts()[0].contains("CRITICAL:"));
        assert!(decision.violations.iter().any(|v| v.gate == "sensitive_file"));
    }

    #[test]
    fn plan_inside_source_without_risky_files_is_approved() {
        let (mut gate, approvals) = agent(&[]);
        let plan = ImprovementPlan {
            objective: "error handling".to_string(),
            branch: "feat/auto-x".to_string(),
            operations: vec![PlannedOperation {
                kind: OperationKind::AddErrorHandling,
                description: OperationKind::AddErrorHandling.description().to_string(),
                files: vec!["src/a.js".to_string(), "src/b.js".to_string()],
            }],
            files: vec!["src/a.js".to_string(), "src/b.js".to_string()],
            estimated_diff_kb: 20.0,
        };
        assert!(gate.validate_plan(&plan).expect("validate").approved);
        assert!(approvals.prompts().is_empty());
    }
}
