//! Objective planning: the orchestrator's step plan and the improve agent's
//! concrete file plan.

use std::collections::BTreeSet;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

/// Kilobytes of diff budgeted per planned file.
pub const ESTIMATED_KB_PER_FILE: f64 = 10.0;
/// Minutes budgeted per plan step.
pub const MINUTES_PER_STEP: u32 = 2;

const SLUG_MAX_LEN: usize = 30;

/// High-level plan recorded in `PLAN` before each improve iteration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectivePlan {
    pub objective: String,
    pub steps: Vec<String>,
    pub estimated_changes: u32,
    pub estimated_minutes: u32,
}

/// Build the keyword-driven step plan for an objective.
pub fn create_plan(objective: &str) -> ObjectivePlan {
    let lowered = objective.to_lowercase();
    let mut steps = Vec::new();
    let mut estimated_changes = 0;

    if lowered.contains("error") || lowered.contains("manejo") {
        steps.push("Identify files lacking error handling".to_string());
        steps.push("Add try/catch blocks and validation".to_string());
        steps.push("Run tests".to_string());
        estimated_changes = 10;
    }
    if lowered.contains("performance") {
        steps.push("Identify performance hotspots".to_string());
        steps.push("Apply optimizations".to_string());
        steps.push("Measure improvements".to_string());
        estimated_changes = 5;
    }
    if steps.is_empty() {
        steps.push("Review code quality hotspots".to_string());
        steps.push("Apply targeted improvements".to_string());
        steps.push("Run tests".to_string());
        estimated_changes = 3;
    }

    let estimated_minutes = steps.len() as u32 * MINUTES_PER_STEP;
    ObjectivePlan {
        objective: objective.to_string(),
        steps,
        estimated_changes,
        estimated_minutes,
    }
}

/// A category of automated source rewrite.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum OperationKind {
    AddErrorHandling,
    OptimizePerformance,
    SecurityHardening,
    AddTests,
}

impl OperationKind {
    /// Maximum number of candidate files selected for this operation.
    pub fn max_files(self) -> usize {
        match self {
            OperationKind::AddErrorHandling => 10,
            OperationKind::OptimizePerformance => 5,
            OperationKind::SecurityHardening => 8,
            OperationKind::AddTests => 5,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            OperationKind::AddErrorHandling => "add-error-handling",
            OperationKind::OptimizePerformance => "optimize-performance",
            OperationKind::SecurityHardening => "security-hardening",
            OperationKind::AddTests => "add-tests",
        }
    }

    /// Description fed to the security gates when the plan is validated.
    pub fn description(self) -> &'static str {
        match self {
            OperationKind::AddErrorHandling => "wrap async functions and promises with error handling",
            OperationKind::OptimizePerformance => "memoize components and lazy-load heavy imports",
            OperationKind::SecurityHardening => "sanitize request input and rendered html",
            OperationKind::AddTests => "generate test stubs for untested modules",
        }
    }
}

/// Map objective keywords to rewrite operations, in a stable order.
pub fn operations_for(objective: &str) -> Vec<OperationKind> {
    let lowered = objective.to_lowercase();
    let mut ops = Vec::new();
    if lowered.contains("error") || lowered.contains("handling") || lowered.contains("manejo") {
        ops.push(OperationKind::AddErrorHandling);
    }
    if lowered.contains("performance") || lowered.contains("optimiz") {
        ops.push(OperationKind::OptimizePerformance);
    }
    if lowered.contains("security") || lowered.contains("seguridad") {
        ops.push(OperationKind::SecurityHardening);
    }
    if lowered.contains("test") || lowered.contains("prueba") {
        ops.push(OperationKind::AddTests);
    }
    ops
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlannedOperation {
    pub kind: OperationKind,
    pub description: String,
    pub files: Vec<String>,
}

/// Concrete plan the improve agent validates and applies.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImprovementPlan {
    pub objective: String,
    pub branch: String,
    pub operations: Vec<PlannedOperation>,
    /// Union of all operation files, sorted and de-duplicated.
    pub files: Vec<String>,
    pub estimated_diff_kb: f64,
}

/// A source file considered for rewriting (path relative to the project root).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceFile {
    pub path: String,
    pub contents: String,
}

impl SourceFile {
    fn extension(&self) -> &str {
        self.path.rsplit_once('.').map(|(_, ext)| ext).unwrap_or("")
    }

    fn is_script(&self) -> bool {
        matches!(self.extension(), "js" | "jsx" | "ts" | "tsx" | "mjs")
    }

    fn is_component(&self) -> bool {
        matches!(self.extension(), "jsx" | "tsx")
    }

    fn is_test(&self) -> bool {
        self.path.contains(".test.") || self.path.contains(".spec.") || self.path.contains("__tests__")
    }
}

/// Path of the generated test file for a script, e.g. `a/b.jsx` → `a/b.test.jsx`.
pub fn test_path_for(path: &str) -> Option<String> {
    let (stem, ext) = path.rsplit_once('.')?;
    if !matches!(ext, "js" | "jsx" | "ts" | "tsx") {
        return None;
    }
    Some(format!("{stem}.test.{ext}"))
}

/// Select candidate files for an operation, capped at the operation's limit.
pub fn select_candidates(kind: OperationKind, files: &[SourceFile]) -> Vec<String> {
    let scripts = files.iter().filter(|f| f.is_script() && !f.is_test());
    let selected: Vec<String> = match kind {
        OperationKind::AddErrorHandling => scripts
            .filter(|f| {
                (f.contents.contains("async ") || f.contents.contains(".then("))
                    && !f.contents.contains("catch")
            })
            .map(|f| f.path.clone())
            .collect(),
        OperationKind::OptimizePerformance => {
            let mut components: Vec<&SourceFile> = scripts.filter(|f| f.is_component()).collect();
            // Largest components first.
            components.sort_by(|a, b| {
                b.contents
                    .lines()
                    .count()
                    .cmp(&a.contents.lines().count())
                    .then_with(|| a.path.cmp(&b.path))
            });
            components.into_iter().map(|f| f.path.clone()).collect()
        }
        OperationKind::SecurityHardening => scripts
            .filter(|f| {
                f.contents.contains("eval(")
                    || f.contents.contains("innerHTML")
                    || f.contents.contains("document.write")
                    || (f.contents.contains("req.body") && !f.contents.contains("validat"))
            })
            .map(|f| f.path.clone())
            .collect(),
        OperationKind::AddTests => {
            let existing: BTreeSet<&str> = files.iter().map(|f| f.path.as_str()).collect();
            scripts
                .filter(|f| {
                    test_path_for(&f.path).is_some_and(|test| !existing.contains(test.as_str()))
                })
                .map(|f| f.path.clone())
                .collect()
        }
    };
    selected.into_iter().take(kind.max_files()).collect()
}

/// Assemble the improvement plan from the objective and candidate sources.
pub fn build_improvement_plan(
    objective: &str,
    branch: &str,
    files: &[SourceFile],
) -> ImprovementPlan {
    let operations: Vec<PlannedOperation> = operations_for(objective)
        .into_iter()
        .map(|kind| PlannedOperation {
            kind,
            description: kind.description().to_string(),
            files: select_candidates(kind, files),
        })
        .collect();
    let unique: BTreeSet<&String> = operations.iter().flat_map(|op| op.files.iter()).collect();
    let files: Vec<String> = unique.into_iter().cloned().collect();
    let estimated_diff_kb = files.len() as f64 * ESTIMATED_KB_PER_FILE;
    ImprovementPlan {
        objective: objective.to_string(),
        branch: branch.to_string(),
        operations,
        files,
        estimated_diff_kb,
    }
}

/// Feature branch name: `feat/auto-YYYYMMDD-<slug>`.
pub fn branch_name(objective: &str, date: NaiveDate) -> String {
    format!("feat/auto-{}-{}", date.format("%Y%m%d"), slugify(objective))
}

fn slugify(text: &str) -> String {
    let mut slug = String::new();
    for ch in text.to_lowercase().chars() {
        if ch.is_ascii_lowercase() || ch.is_ascii_digit() {
            slug.push(ch);
        } else if !slug.ends_with('-') {
            slug.push('-');
        }
    }
    let slug = slug.trim_matches('-');
    let truncated: String = slug.chars().take(SLUG_MAX_LEN).collect();
    let truncated = truncated.trim_end_matches('-');
    if truncated.is_empty() {
        "improvement".to_string()
    } else {
        truncated.to_string()
    }
}
