//! Test-only helpers: a throwaway git repository, scripted approvals, and
//! fake pipeline steps for driving the orchestrator deterministically.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::rc::Rc;

use anyhow::{Result, anyhow, bail};
use chrono::Utc;

use crate::agents::budget::BudgetAgent;
use crate::agents::security::SecurityGateAgent;
use crate::agents::{
    AnalyzeStep, DocumentStep, GitStep, ImproveStep, Pipeline, TestStep, TroubleshootStep,
};
use crate::core::gates::OperationContext;
use crate::core::halt::SecurityRejectedError;
use crate::core::plan::ImprovementPlan;
use crate::core::reports::{
    AnalysisReport, CodeMetrics, DependencyHealth, DependencyInfo, DocumentReport, ErrorFindings,
    GitReport, ImproveReport, MemoryUsage, ProjectStructure, ScriptInventory, StackInfo,
    SystemSnapshot, TestReport, TroubleshootReport,
};
use crate::io::approval::ApprovalProvider;

/// Approval provider answering from a fixed script and recording prompts.
///
/// Clones share the script and the prompt log, so a test can keep a handle
/// after boxing one into a gate.
#[derive(Debug, Clone, Default)]
pub struct ScriptedApprovals {
    inner: Rc<RefCell<ScriptedInner>>,
}

#[derive(Debug, Default)]
struct ScriptedInner {
    answers: VecDeque<String>,
    prompts: Vec<String>,
}

impl ScriptedApprovals {
    pub fn new(answers: &[&str]) -> Self {
        Self {
            inner: Rc::new(RefCell::new(ScriptedInner {
                answers: answers.iter().map(|a| a.to_string()).collect(),
                prompts: Vec::new(),
            })),
        }
    }

    /// Every prompt shown so far.
    pub fn prompts(&self) -> Vec<String> {
        self.inner.borrow().prompts.clone()
    }
}

impl ApprovalProvider for ScriptedApprovals {
    fn ask(&mut self, prompt: &str) -> Result<String> {
        let mut inner = self.inner.borrow_mut();
        inner.prompts.push(prompt.to_string());
        inner
            .answers
            .pop_front()
            .ok_or_else(|| anyhow!("unexpected approval prompt: {prompt}"))
    }
}

/// Git repository in a temp dir on `main` with one commit.
pub struct TestRepo {
    dir: tempfile::TempDir,
}

impl TestRepo {
    pub fn new() -> Self {
        let dir = tempfile::tempdir().expect("tempdir");
        let repo = Self { dir };
        repo.git(&["init", "-q", "-b", "main"]);
        repo.git(&["config", "user.email", "autodev@example.com"]);
        repo.git(&["config", "user.name", "autodev tests"]);
        repo.git(&["config", "commit.gpgsign", "false"]);
        repo.write("README.md", "# Fixture\n");
        repo.commit_all("chore: initial commit");
        repo
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    pub fn file(&self, rel: &str) -> PathBuf {
        self.path().join(rel)
    }

    pub fn write(&self, rel: &str, contents: &str) {
        let path = self.file(rel);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).expect("create parent dirs");
        }
        fs::write(&path, contents).expect("write fixture file");
    }

    pub fn read(&self, rel: &str) -> String {
        fs::read_to_string(self.file(rel)).expect("read fixture file")
    }

    pub fn commit_all(&self, message: &str) {
        self.git(&["add", "-A"]);
        self.git(&["commit", "-q", "-m", message]);
    }

    /// Run git in the repo, panicking on failure; returns stdout.
    pub fn git(&self, args: &[&str]) -> String {
        let output = Command::new("git")
            .args(args)
            .current_dir(self.path())
            .output()
            .expect("spawn git");
        assert!(
            output.status.success(),
            "git {} failed: {}",
            args.join(" "),
            String::from_utf8_lossy(&output.stderr)
        );
        String::from_utf8_lossy(&output.stdout).into_owned()
    }
}

impl Default for TestRepo {
    fn default() -> Self {
        Self::new()
    }
}

/// Shared record of the calls made to fake steps, e.g. `"improve: tests"`.
#[derive(Debug, Clone, Default)]
pub struct StepLog(Rc<RefCell<Vec<String>>>);

impl StepLog {
    pub fn calls(&self) -> Vec<String> {
        self.0.borrow().clone()
    }

    /// Calls whose step name is `step`.
    pub fn calls_to(&self, step: &str) -> Vec<String> {
        let prefix = format!("{step}:");
        self.calls()
            .into_iter()
            .filter(|call| call == step || call.starts_with(&prefix))
            .collect()
    }

    fn push(&self, call: String) {
        self.0.borrow_mut().push(call);
    }
}

/// What the fake pipeline does on each call.
#[derive(Debug, Clone)]
pub struct FakeScript {
    /// Test outcomes in order; the last one repeats. Empty means always pass.
    pub test_results: Vec<bool>,
    /// Files charged to the budget by each improve call.
    pub files_per_improve: u32,
    /// Branch reported by the improve step.
    pub branch: String,
    /// The improve step fails with this message instead of reporting.
    pub improve_error: Option<String>,
    /// The improve step fails with a security rejection.
    pub improve_rejected: bool,
}

impl Default for FakeScript {
    fn default() -> Self {
        Self {
            test_results: Vec::new(),
            files_per_improve: 1,
            branch: "feat/auto-20260101-fake".to_string(),
            improve_error: None,
            improve_rejected: false,
        }
    }
}

/// Pipeline of fakes following `script`, plus the log they write to.
pub fn fake_pipeline(script: FakeScript) -> (Pipeline, StepLog) {
    let log = StepLog::default();
    let pipeline = Pipeline {
        analyze: Box::new(FakeAnalyze { log: log.clone() }),
        improve: Box::new(FakeImprove {
            log: log.clone(),
            script: script.clone(),
        }),
        test: Box::new(FakeTest {
            log: log.clone(),
            outcomes: script.test_results.into(),
            last: true,
        }),
        document: Box::new(FakeDocument { log: log.clone() }),
        git: Box::new(FakeGit { log: log.clone() }),
        troubleshoot: Box::new(FakeTroubleshoot { log: log.clone() }),
    };
    (pipeline, log)
}

pub fn analysis_report() -> AnalysisReport {
    AnalysisReport {
        success: true,
        timestamp: Utc::now(),
        structure: ProjectStructure::default(),
        stack: StackInfo::default(),
        scripts: ScriptInventory::default(),
        hotspots: Vec::new(),
        large_files: Vec::new(),
        dependencies: DependencyInfo::default(),
        metrics: CodeMetrics::default(),
    }
}

pub fn test_report(success: bool) -> TestReport {
    TestReport {
        success,
        exit_code: Some(if success { 0 } else { 1 }),
        error: (!success).then(|| "test command exited with code 1".to_string()),
        attempts: 1,
        message: None,
        ..TestReport::no_suite()
    }
}

pub fn troubleshoot_report(hint: &str) -> TroubleshootReport {
    TroubleshootReport {
        success: true,
        timestamp: Utc::now(),
        hint: hint.to_string(),
        system: SystemSnapshot::default(),
        environment: Default::default(),
        logs: Vec::new(),
        errors: ErrorFindings::default(),
        dependencies: DependencyHealth::default(),
        processes: Vec::new(),
        disk: Vec::new(),
        memory: MemoryUsage::default(),
        recommendations: Vec::new(),
    }
}

struct FakeAnalyze {
    log: StepLog,
}

impl AnalyzeStep for FakeAnalyze {
    fn execute(&mut self) -> Result<AnalysisReport> {
        self.log.push("analyze".to_string());
        Ok(analysis_report())
    }
}

struct FakeImprove {
    log: StepLog,
    script: FakeScript,
}

impl ImproveStep for FakeImprove {
    fn execute(
        &mut self,
        objective: &str,
        budget: &mut BudgetAgent,
        _gate: &mut SecurityGateAgent,
    ) -> Result<ImproveReport> {
        self.log.push(format!("improve: {objective}"));
        if self.script.improve_rejected {
            return Err(SecurityRejectedError {
                gates: vec!["secrets".to_string()],
                subject: format!("improvement plan: {objective}"),
            }
            .into());
        }
        if let Some(message) = &self.script.improve_error {
            bail!("{message}");
        }
        budget.ensure_change_capacity()?;
        budget.consume_files(self.script.files_per_improve)?;
        Ok(ImproveReport {
            success: true,
            objective: objective.to_string(),
            branch: self.script.branch.clone(),
            plan: ImprovementPlan {
                objective: objective.to_string(),
                branch: self.script.branch.clone(),
                operations: Vec::new(),
                files: Vec::new(),
                estimated_diff_kb: 0.0,
            },
            changes: Vec::new(),
            files_changed: self.script.files_per_improve,
            diff_kb: 0.0,
            lint: Vec::new(),
            approved_violations: Vec::new(),
            warnings: Vec::new(),
        })
    }
}

struct FakeTest {
    log: StepLog,
    outcomes: VecDeque<bool>,
    last: bool,
}

impl TestStep for FakeTest {
    fn execute(&mut self, _budget: &BudgetAgent) -> Result<TestReport> {
        if let Some(next) = self.outcomes.pop_front() {
            self.last = next;
        }
        self.log.push(format!("test: {}", if self.last { "pass" } else { "fail" }));
        Ok(test_report(self.last))
    }
}

struct FakeDocument {
    log: StepLog,
}

impl DocumentStep for FakeDocument {
    fn execute(&mut self) -> Result<DocumentReport> {
        self.log.push("document".to_string());
        Ok(DocumentReport {
            success: true,
            changelog: None,
            readme_updated: false,
            api: None,
            created: Vec::new(),
        })
    }
}

/// Records commands; still routes them through the gate like the real agent.
struct FakeGit {
    log: StepLog,
}

impl FakeGit {
    fn report(command: &str) -> GitReport {
        GitReport {
            command: command.split_whitespace().next().unwrap_or_default().to_string(),
            args: command.split_whitespace().map(str::to_string).collect(),
            output: String::new(),
            success: true,
            changes: None,
            warnings: Vec::new(),
        }
    }
}

impl GitStep for FakeGit {
    fn execute(&mut self, command: &str, gate: &mut SecurityGateAgent) -> Result<GitReport> {
        self.log.push(format!("git: {command}"));
        let operation = format!("git {command}");
        gate.validate_operation(&operation, &OperationContext::default())?
            .ensure_approved(&operation)?;
        Ok(Self::report(command))
    }

    fn commit_flow(&mut self, message: &str, _gate: &mut SecurityGateAgent) -> Result<GitReport> {
        self.log.push(format!("commit: {message}"));
        Ok(Self::report(&format!("commit -m {message}")))
    }
}

struct FakeTroubleshoot {
    log: StepLog,
}

impl TroubleshootStep for FakeTroubleshoot {
    fn execute(&mut self, hint: &str) -> Result<TroubleshootReport> {
        self.log.push(format!("troubleshoot: {hint}"));
        Ok(troubleshoot_report(hint))
    }
}
