//! Security gate catalogue and violation detection.
//!
//! Matching is plain case-insensitive substring search over the operation
//! text. Approval itself is interactive and lives in the security agent; this
//! module only decides *what* needs approving.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::core::types::RiskLevel;

/// A named category of risky operations.
#[derive(Debug, Clone, Copy)]
pub struct Gate {
    pub name: &'static str,
    pub level: RiskLevel,
    pub patterns: &'static [&'static str],
    pub message: &'static str,
}

pub const GATES: &[Gate] = &[
    Gate {
        name: "dependencies",
        level: RiskLevel::High,
        patterns: &["npm install", "yarn add", "pip install", "go get", "cargo add"],
        message: "Installs or changes third-party dependencies",
    },
    Gate {
        name: "database",
        level: RiskLevel::Critical,
        patterns: &["migrate", "seed", "drop", "truncate", "alter table"],
        message: "Modifies database schema or data",
    },
    Gate {
        name: "deletion",
        level: RiskLevel::High,
        patterns: &["rm -rf", "del /f", "shutil.rmtree"],
        message: "Deletes files recursively",
    },
    Gate {
        name: "secrets",
        level: RiskLevel::Critical,
        patterns: &[".env", "secrets", "credentials", "private key", "password"],
        message: "Touches secrets or credentials",
    },
    Gate {
        name: "cicd",
        level: RiskLevel::High,
        patterns: &[".github/workflows", ".gitlab-ci", "jenkinsfile", "buildspec"],
        message: "Changes CI/CD pipeline configuration",
    },
    Gate {
        name: "production",
        level: RiskLevel::Critical,
        patterns: &["push origin main", "push origin master", "deploy prod"],
        message: "Affects production branches or deployments",
    },
];

const SENSITIVE_FILES: &[&str] = &[
    ".env",
    ".env.local",
    ".env.production",
    "secrets.json",
    "credentials.json",
    ".ssh",
    ".gnupg",
    "id_rsa",
    "id_ed25519",
];

const CICD_FILES: &[&str] = &[".github/workflows", ".gitlab-ci", "jenkinsfile"];

/// Operations touching more files than this are flagged as bulk.
pub const BULK_FILE_THRESHOLD: usize = 5;

/// What a violation was raised against.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "lowercase")]
pub enum Subject {
    Operation(String),
    File(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Violation {
    pub gate: String,
    pub level: RiskLevel,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pattern: Option<String>,
    pub subject: Subject,
}

/// Facts about an operation that substring matching cannot see.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OperationContext {
    pub file_count: usize,
    /// The operation affects paths outside the project source root.
    pub outside_source: bool,
    /// Set when a caller-side policy (e.g. the git deny-list) already flagged the operation.
    pub policy_reason: Option<String>,
}

/// Check an operation description against every gate and heuristic.
pub fn detect_violations(operation: &str, ctx: &OperationContext) -> Vec<Violation> {
    let lowered = operation.to_lowercase();
    let subject = Subject::Operation(operation.to_string());
    let mut violations = Vec::new();

    for gate in GATES {
        for pattern in gate.patterns {
            if lowered.contains(pattern) {
                violations.push(Violation {
                    gate: gate.name.to_string(),
                    level: gate.level,
                    message: gate.message.to_string(),
                    pattern: Some((*pattern).to_string()),
                    subject: subject.clone(),
                });
            }
        }
    }

    if ctx.file_count > BULK_FILE_THRESHOLD {
        violations.push(Violation {
            gate: "bulk_operation".to_string(),
            level: RiskLevel::Medium,
            message: format!("Operation touches {} files", ctx.file_count),
            pattern: None,
            subject: subject.clone(),
        });
    }

    if ctx.outside_source && lowered.split_whitespace().any(|token| token == "mv") {
        violations.push(Violation {
            gate: "file_movement".to_string(),
            level: RiskLevel::High,
            message: "Moves files outside the source directory".to_string(),
            pattern: Some("mv".to_string()),
            subject: subject.clone(),
        });
    }

    if let Some(reason) = &ctx.policy_reason {
        violations.push(Violation {
            gate: "policy".to_string(),
            level: RiskLevel::High,
            message: reason.clone(),
            pattern: None,
            subject,
        });
    }

    violations
}

/// Check a single file path for sensitive or pipeline-critical locations.
pub fn detect_file_violations(path: &str) -> Vec<Violation> {
    let lowered = path.to_lowercase();
    let mut violations = Vec::new();

    if let Some(hit) = SENSITIVE_FILES.iter().find(|name| lowered.contains(*name)) {
        violations.push(Violation {
            gate: "sensitive_file".to_string(),
            level: RiskLevel::Critical,
            message: format!("Sensitive file: {path}"),
            pattern: Some((*hit).to_string()),
            subject: Subject::File(path.to_string()),
        });
    }
    if let Some(hit) = CICD_FILES.iter().find(|name| lowered.contains(*name)) {
        violations.push(Violation {
            gate: "cicd_file".to_string(),
            level: RiskLevel::High,
            message: format!("CI/CD configuration file: {path}"),
            pattern: Some((*hit).to_string()),
            subject: Subject::File(path.to_string()),
        });
    }

    violations
}

/// Session cache key for a violation set: `gates:` + sorted unique gate names.
pub fn cache_key(violations: &[Violation]) -> String {
    let names: BTreeSet<&str> = violations.iter().map(|v| v.gate.as_str()).collect();
    format!("gates:{}", names.into_iter().collect::<Vec<_>>().join("|"))
}

/// Sorted unique gate names for error reporting.
pub fn gate_names(violations: &[Violation]) -> Vec<String> {
    let names: BTreeSet<&str> = violations.iter().map(|v| v.gate.as_str()).collect();
    names.into_iter().map(str::to_string).collect()
}

/// Highest severity among the violations (or `Safe` if none).
pub fn highest_level(violations: &[Violation]) -> RiskLevel {
    violations
        .iter()
        .map(|v| v.level)
        .max()
        .unwrap_or(RiskLevel::Safe)
}

/// Risk level of an operation judged by its text alone.
pub fn risk_level(operation: &str) -> RiskLevel {
    highest_level(&detect_violations(operation, &OperationContext::default()))
}

pub fn needs_approval(operation: &str) -> bool {
    risk_level(operation) != RiskLevel::Safe
}

/// Human-readable approval request listing violations grouped by severity.
pub fn approval_prompt(summary: &str, violations: &[Violation]) -> String {
    let mut out = String::new();
    out.push_str("SECURITY APPROVAL REQUIRED\n");
    out.push_str(&format!("Operation: {summary}\n"));
    for (level, heading) in [
        (RiskLevel::Critical, "CRITICAL"),
        (RiskLevel::High, "HIGH"),
        (RiskLevel::Medium, "MEDIUM"),
    ] {
        let group: Vec<&Violation> = violations.iter().filter(|v| v.level == level).collect();
        if group.is_empty() {
            continue;
        }
        out.push_str(&format!("\n{heading}:\n"));
        for violation in group {
            let target = match &violation.subject {
                Subject::Operation(text) => text,
                Subject::File(path) => path,
            };
            out.push_str(&format!(
                "  - [{}] {} ({})\n",
                violation.gate, violation.message, target
            ));
        }
    }
    out.push_str("\nApprove? [y/N]: ");
    out
}
