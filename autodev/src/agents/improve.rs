//! Improve agent: plan rewrites for an objective, pass them through the
//! security gates, and apply them on a feature branch within budget.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result, bail};
use chrono::Utc;
use tracing::{debug, info, instrument, warn};
use walkdir::WalkDir;

use super::analyze::is_ignored_dir;
use super::budget::BudgetAgent;
use super::security::SecurityGateAgent;
use super::{ImproveStep, package_scripts, read_package_json, run_tool};
use crate::core::plan::{
    ImprovementPlan, OperationKind, SourceFile, branch_name, build_improvement_plan, test_path_for,
};
use crate::core::reports::{AppliedChange, ImproveReport, LintRun};
use crate::core::rewrite;
use crate::io::config::ImproveConfig;
use crate::io::git::Git;
use crate::io::paths::{CONFIG_FILE, ProjectPaths, REPORT_DIR};
use crate::io::process::RunLimits;

/// Source files larger than this are never rewritten.
const MAX_SOURCE_BYTES: u64 = 512 * 1024;

pub struct ImproveAgent {
    paths: ProjectPaths,
    cfg: ImproveConfig,
    tool_limits: RunLimits,
    git: Git,
}

impl ImproveAgent {
    pub fn new(paths: ProjectPaths, cfg: ImproveConfig, tool_limits: RunLimits) -> Self {
        let git = Git::new(&paths.root);
        Self {
            paths,
            cfg,
            tool_limits,
            git,
        }
    }

    /// Check out the objective's feature branch.
    ///
    /// The current branch is reused as-is when it already matches; otherwise
    /// the tree must be clean apart from orchestrator artifacts.
    #[instrument(skip_all)]
    fn switch_branch(&self, objective: &str) -> Result<String> {
        let branch = branch_name(objective, Utc::now().date_naive());
        let current = self.git.current_branch()?;
        if current == branch {
            debug!(branch = %branch, "already on feature branch");
            return Ok(branch);
        }
        let report_prefix = format!("{REPORT_DIR}/");
        self.git
            .ensure_clean_except_prefixes(&[report_prefix.as_str(), "STATE.md", CONFIG_FILE])?;
        if self.git.branch_exists(&branch)? {
            self.git.checkout_branch(&branch)?;
            info!(branch = %branch, "using existing feature branch");
        } else {
            self.git.checkout_new_branch(&branch)?;
            info!(branch = %branch, "created feature branch");
        }
        Ok(branch)
    }

    /// Script sources under the configured source root.
    fn collect_sources(&self) -> Result<Vec<SourceFile>> {
        let source_root = self.paths.root.join(&self.cfg.source_root);
        if !source_root.is_dir() {
            debug!(source_root = %source_root.display(), "source root missing");
            return Ok(Vec::new());
        }
        let mut sources = Vec::new();
        let walker = WalkDir::new(&source_root)
            .sort_by_file_name()
            .into_iter()
            .filter_entry(|entry| !(entry.file_type().is_dir() && is_ignored_dir(entry)));
        for entry in walker {
            let entry = entry.context("walk source tree")?;
            if !entry.file_type().is_file() || !is_script(entry.path()) {
                continue;
            }
            let size = entry.metadata().map(|m| m.len()).unwrap_or(u64::MAX);
            if size > MAX_SOURCE_BYTES {
                continue;
            }
            let Ok(contents) = fs::read_to_string(entry.path()) else {
                debug!(path = %entry.path().display(), "skipping non-utf8 source");
                continue;
            };
            sources.push(SourceFile {
                path: self.paths.relative(entry.path()),
                contents,
            });
        }
        Ok(sources)
    }

    /// Apply the plan, stopping once `max_files` files were touched.
    fn apply_plan(
        &self,
        plan: &ImprovementPlan,
        max_files: u32,
        created: &mut Vec<String>,
        warnings: &mut Vec<String>,
    ) -> Result<Vec<AppliedChange>> {
        let mut changes: Vec<AppliedChange> = Vec::new();
        let limit = usize::try_from(max_files).unwrap_or(usize::MAX);
        for file in &plan.files {
            if changes.len() >= limit {
                warn!(limit, "changed-files limit reached, skipping remaining files");
                warnings.push(format!("changed-files limit reached after {limit} files"));
                break;
            }
            let kinds: Vec<OperationKind> = plan
                .operations
                .iter()
                .filter(|op| op.files.contains(file))
                .map(|op| op.kind)
                .collect();

            let path = self.paths.root.join(file);
            let original =
                fs::read_to_string(&path).with_context(|| format!("read {}", path.display()))?;
            let rewritten = kinds
                .iter()
                .fold(original.clone(), |acc, kind| rewrite::apply(*kind, file, &acc));
            if rewritten != original {
                fs::write(&path, &rewritten).with_context(|| format!("write {}", path.display()))?;
                changes.push(AppliedChange {
                    file: file.clone(),
                    operations: kinds.clone(),
                    diff_kb: size_delta_kb(&original, &rewritten),
                    created: false,
                });
            }

            if kinds.contains(&OperationKind::AddTests)
                && changes.len() < limit
                && let Some(test_file) = test_path_for(file)
            {
                let test_path = self.paths.root.join(&test_file);
                if !test_path.exists() {
                    let stub = rewrite::test_stub(file);
                    fs::write(&test_path, &stub)
                        .with_context(|| format!("write {}", test_path.display()))?;
                    created.push(test_file.clone());
                    changes.push(AppliedChange {
                        file: test_file,
                        operations: vec![OperationKind::AddTests],
                        diff_kb: stub.len() as f64 / 1024.0,
                        created: true,
                    });
                }
            }
        }
        Ok(changes)
    }

    /// Run the configured lint scripts that exist, `--fix` first.
    fn run_linters(&self) -> Vec<LintRun> {
        let Some(package) = read_package_json(&self.paths.root) else {
            return Vec::new();
        };
        let scripts = package_scripts(&package);
        let mut runs = Vec::new();
        for script in &self.cfg.lint_scripts {
            if !scripts.iter().any(|(name, _)| name == script) {
                continue;
            }
            let run = |args: &[&str]| {
                run_tool(&self.paths.root, "npm", args, &self.tool_limits)
                    .is_some_and(|out| out.success())
            };
            let success =
                run(&["run", script.as_str(), "--", "--fix"]) || run(&["run", script.as_str()]);
            if !success {
                warn!(script = %script, "lint script failed");
            }
            runs.push(LintRun {
                script: script.clone(),
                success,
            });
        }
        runs
    }

    fn improve_on_branch(
        &self,
        objective: &str,
        branch: &str,
        budget: &mut BudgetAgent,
        gate: &mut SecurityGateAgent,
        created: &mut Vec<String>,
    ) -> Result<ImproveReport> {
        let sources = self.collect_sources()?;
        let plan = build_improvement_plan(objective, branch, &sources);
        debug!(
            operations = plan.operations.len(),
            files = plan.files.len(),
            "improvement plan built"
        );

        let decision = gate.validate_plan(&plan)?;
        decision.ensure_approved(&format!("improvement plan: {objective}"))?;

        let limits = budget.budget().limits().clone();
        let consumed = budget.budget().consumed().clone();
        let available = limits
            .max_changed_files
            .saturating_sub(consumed.changed_files);

        let mut warnings = Vec::new();
        if plan.operations.is_empty() {
            warnings.push(format!("no operations match objective \"{objective}\""));
        }
        let changes = self.apply_plan(&plan, available, created, &mut warnings)?;
        let files_changed = u32::try_from(changes.len()).unwrap_or(u32::MAX);
        let diff_kb: f64 = changes.iter().map(|c| c.diff_kb).sum();
        budget.consume_files(files_changed)?;
        budget.consume_diff_kb(diff_kb)?;
        if changes.is_empty() {
            warnings.push("no applicable changes found".to_string());
        }

        let lint = if changes.is_empty() {
            Vec::new()
        } else {
            self.run_linters()
        };

        let totals = budget.budget().consumed().clone();
        if totals.changed_files > limits.max_changed_files {
            bail!(
                "changed-files limit exceeded: {}/{}",
                totals.changed_files,
                limits.max_changed_files
            );
        }
        if totals.diff_kb > limits.max_diff_kb {
            bail!(
                "diff limit exceeded: {:.1}KB/{:.1}KB",
                totals.diff_kb,
                limits.max_diff_kb
            );
        }

        info!(files_changed, diff_kb, "improvements applied");
        Ok(ImproveReport {
            success: true,
            objective: objective.to_string(),
            branch: branch.to_string(),
            plan,
            changes,
            files_changed,
            diff_kb,
            lint,
            approved_violations: decision.violations,
            warnings,
        })
    }

    /// Discard worktree edits and delete files created by this run.
    fn revert(&self, created: &[String]) {
        warn!("reverting improvement changes");
        if let Err(err) = self.git.restore_all() {
            warn!(err = %format!("{err:#}"), "restore failed");
        }
        if let Err(err) = self.git.clean_paths(created) {
            warn!(err = %format!("{err:#}"), "removing created files failed");
        }
    }
}

impl ImproveStep for ImproveAgent {
    #[instrument(skip_all, fields(objective = %objective))]
    fn execute(
        &mut self,
        objective: &str,
        budget: &mut BudgetAgent,
        gate: &mut SecurityGateAgent,
    ) -> Result<ImproveReport> {
        budget.ensure_change_capacity()?;
        let branch = self.switch_branch(objective)?;

        let mut created = Vec::new();
        let result = self.improve_on_branch(objective, &branch, budget, gate, &mut created);
        if result.is_err() {
            self.revert(&created);
        }
        result
    }
}

fn is_script(path: &Path) -> bool {
    matches!(
        path.extension().and_then(|ext| ext.to_str()),
        Some("js" | "jsx" | "ts" | "tsx" | "mjs")
    )
}

fn size_delta_kb(before: &str, after: &str) -> f64 {
    before.len().abs_diff(after.len()) as f64 / 1024.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::halt::{BudgetExhaustedError, SecurityRejectedError};
    use crate::io::config::{AutodevConfig, BudgetConfig};
    use crate::test_support::{ScriptedApprovals, TestRepo};

    const ASYNC_SOURCE: &str = "async function load(id) {\n  return fetch(id);\n}\n";

    struct Fixture {
        repo: TestRepo,
        agent: ImproveAgent,
        budget: BudgetAgent,
        gate: SecurityGateAgent,
        approvals: ScriptedApprovals,
    }

    fn fixture(files: &[(&str, &str)], answers: &[&str]) -> Fixture {
        let repo = TestRepo::new();
        for (path, contents) in files {
            repo.write(path, contents);
        }
        repo.commit_all("chore: seed sources");
        let paths = ProjectPaths::new(repo.path());
        let cfg = AutodevConfig::default();
        let agent = ImproveAgent::new(
            paths.clone(),
            cfg.improve.clone(),
            crate::agents::tool_limits(&cfg),
        );
        let budget = BudgetAgent::initialize(&paths, &BudgetConfig::default()).expect("budget");
        let approvals = ScriptedApprovals::new(answers);
        let gate = SecurityGateAgent::new(Box::new(approvals.clone()), "src");
        Fixture {
            repo,
            agent,
            budget,
            gate,
            approvals,
        }
    }

    #[test]
    fn wraps_async_functions_on_feature_branch() {
        let mut fx = fixture(&[("src/api.js", ASYNC_SOURCE)], &[]);
        let report = fx
            .agent
            .execute("error handling", &mut fx.budget, &mut fx.gate)
            .expect("improve");

        assert!(report.success);
        assert!(report.branch.starts_with("feat/auto-"));
        assert!(report.branch.ends_with("-error-handling"));
        assert_eq!(fx.repo.git(&["branch", "--show-current"]).trim(), report.branch);
        assert_eq!(report.files_changed, 1);
        assert_eq!(report.changes[0].operations, vec![OperationKind::AddErrorHandling]);
        let rewritten = fx.repo.read("src/api.js");
        assert!(rewritten.contains("catch (error)"));
        assert_eq!(fx.budget.budget().consumed().changed_files, 1);
        assert!(fx.budget.budget().consumed().diff_kb > 0.0);
        assert!(fx.approvals.prompts().is_empty());
    }

    #[test]
    fn reuses_current_feature_branch_with_dirty_tree() {
        let mut fx = fixture(&[("src/api.js", ASYNC_SOURCE)], &[]);
        let first = fx
            .agent
            .execute("error handling", &mut fx.budget, &mut fx.gate)
            .expect("first");
        let second = fx
            .agent
            .execute("error handling", &mut fx.budget, &mut fx.gate)
            .expect("second");
        assert_eq!(first.branch, second.branch);
        assert_eq!(second.files_changed, 0);
        assert!(second.warnings.iter().any(|w| w.contains("no applicable changes")));
    }

    #[test]
    fn dirty_tree_blocks_branch_switch() {
        let mut fx = fixture(&[("src/api.js", ASYNC_SOURCE)], &[]);
        fx.repo.write("src/api.js", "// local edit\n");
        let err = fx
            .agent
            .execute("error handling", &mut fx.budget, &mut fx.gate)
            .expect_err("dirty");
        assert!(format!("{err:#}").contains("uncommitted changes"));
        assert_eq!(fx.repo.git(&["branch", "--show-current"]).trim(), "main");
    }

    #[test]
    fn rejected_plan_leaves_sources_untouched() {
        let source = "const html = eval(input);\n";
        let mut fx = fixture(&[("src/config/.env.loader.js", source)], &["n"]);
        let err = fx
            .agent
            .execute("security", &mut fx.budget, &mut fx.gate)
            .expect_err("rejected");
        let rejected = err
            .downcast_ref::<SecurityRejectedError>()
            .expect("typed rejection");
        assert!(rejected.gates.contains(&"sensitive_file".to_string()));
        assert_eq!(fx.repo.read("src/config/.env.loader.js"), source);
        assert_eq!(fx.budget.budget().consumed().changed_files, 0);
    }

    #[test]
    fn add_tests_creates_stub_files() {
        let mut fx = fixture(&[("src/util.js", "export const one = 1;\n")], &[]);
        let report = fx
            .agent
            .execute("add tests", &mut fx.budget, &mut fx.gate)
            .expect("improve");
        assert_eq!(report.files_changed, 1);
        assert!(report.changes[0].created);
        assert_eq!(report.changes[0].file, "src/util.test.js");
        assert!(fx.repo.read("src/util.test.js").contains("describe('util'"));
    }

    #[test]
    fn exhausted_file_budget_halts_before_branching() {
        let mut fx = fixture(&[("src/api.js", ASYNC_SOURCE)], &[]);
        fx.budget.consume_files(15).expect("consume");
        let err = fx
            .agent
            .execute("error handling", &mut fx.budget, &mut fx.gate)
            .expect_err("exhausted");
        assert!(err.downcast_ref::<BudgetExhaustedError>().is_some());
        assert_eq!(fx.repo.git(&["branch", "--show-current"]).trim(), "main");
    }
}
