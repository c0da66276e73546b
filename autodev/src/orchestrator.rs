//! Workflow state machine over the agents.
//!
//! The orchestrator owns the budget, the security gate and the state agent,
//! and drives the pipeline steps. Every state change goes through
//! [`StateAgent::update_state`], so each one is recorded and persisted.

use std::collections::BTreeMap;

use anyhow::{Context as _, Result};
use serde::Serialize;
use tracing::{info, instrument, warn};

use crate::agents::budget::BudgetAgent;
use crate::agents::security::SecurityGateAgent;
use crate::agents::state::StateAgent;
use crate::agents::Pipeline;
use crate::command::SlashCommand;
use crate::core::budget::{BudgetReport, BudgetStatus};
use crate::core::context::{ContextKey, ErrorRecord, StepResult};
use crate::core::halt::is_halt;
use crate::core::plan::create_plan;
use crate::core::reports::{
    AnalysisReport, DocumentReport, GitReport, ImproveReport, TestReport, TroubleshootReport,
};
use crate::core::state_machine::{PatternAnalysis, Prediction};
use crate::core::types::WorkflowState;
use crate::io::approval::ApprovalProvider;
use crate::io::config::AutodevConfig;
use crate::io::paths::ProjectPaths;

/// Result of one `/sc:` command, printed as JSON by the CLI.
#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum CommandOutput {
    Analysis(AnalysisReport),
    Improvement(ImprovementOutcome),
    Test(TestReport),
    Documentation(DocumentReport),
    Git(GitReport),
    Troubleshoot(TroubleshootReport),
    Workflow(WorkflowReport),
    Status(StatusReport),
    Reset(ResetReport),
}

#[derive(Debug, Clone, Serialize)]
pub struct ImprovementSummary {
    pub objective: String,
    pub success: bool,
    pub iterations: String,
    pub files_changed: String,
    pub time_elapsed: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct ImprovementOutcome {
    pub summary: ImprovementSummary,
    pub improvement: Option<ImproveReport>,
    pub tests: Option<TestReport>,
    pub budget: BudgetReport,
    pub recommendations: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct WorkflowReport {
    pub state: WorkflowState,
    pub success: bool,
    pub results: BTreeMap<ContextKey, StepResult>,
    pub budget: BudgetReport,
    pub last_error: Option<ErrorRecord>,
}

#[derive(Debug, Clone, Serialize)]
pub struct StatusReport {
    pub state: WorkflowState,
    pub budget: BudgetStatus,
    pub patterns: PatternAnalysis,
    pub predictions: Vec<Prediction>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ResetReport {
    pub state: WorkflowState,
    pub budget: BudgetStatus,
}

/// How one improve iteration ended.
enum Iteration {
    Passed,
    Failed,
}

/// Step results produced by the current `improve` call.
#[derive(Default)]
struct ImproveRun {
    improvement: Option<ImproveReport>,
    test: Option<TestReport>,
}

pub struct Orchestrator {
    cfg: AutodevConfig,
    budget: BudgetAgent,
    gate: SecurityGateAgent,
    state: StateAgent,
    pipeline: Pipeline,
    /// Results merged into the context on the next transition.
    pending: Vec<StepResult>,
}

impl Orchestrator {
    /// Orchestrator with the standard agents for the project at `paths.root`.
    pub fn new(
        paths: &ProjectPaths,
        cfg: AutodevConfig,
        approvals: Box<dyn ApprovalProvider>,
    ) -> Result<Self> {
        let pipeline = Pipeline::standard(paths, &cfg);
        Self::with_pipeline(paths, cfg, approvals, pipeline)
    }

    /// Restore budget and state, then wire `pipeline` in.
    pub fn with_pipeline(
        paths: &ProjectPaths,
        cfg: AutodevConfig,
        approvals: Box<dyn ApprovalProvider>,
        pipeline: Pipeline,
    ) -> Result<Self> {
        let budget = BudgetAgent::initialize(paths, &cfg.budget).context("initialize budget")?;
        let state = StateAgent::initialize(paths, &cfg.state).context("initialize state")?;
        let current = state.current();
        if !matches!(current, WorkflowState::Idle | WorkflowState::Done) {
            info!(state = %current, "resuming session");
        }
        let gate = SecurityGateAgent::new(approvals, &cfg.improve.source_root);
        Ok(Self {
            cfg,
            budget,
            gate,
            state,
            pipeline,
            pending: Vec::new(),
        })
    }

    pub fn budget(&self) -> &BudgetAgent {
        &self.budget
    }

    pub fn state(&self) -> &StateAgent {
        &self.state
    }

    /// Run one command. Errors are recorded in the context; halting errors
    /// also move the workflow to `STOP`. The error is returned either way.
    #[instrument(skip_all, fields(command = command.name()))]
    pub fn execute(&mut self, command: SlashCommand) -> Result<CommandOutput> {
        info!(command = command.name(), "executing command");
        let result = match command {
            SlashCommand::Analyze => self.analyze().map(CommandOutput::Analysis),
            SlashCommand::Improve { objective } => {
                self.improve(&objective).map(CommandOutput::Improvement)
            }
            SlashCommand::Test => self.test().map(CommandOutput::Test),
            SlashCommand::Document => self.document().map(CommandOutput::Documentation),
            SlashCommand::Git { command } => self.git(&command).map(CommandOutput::Git),
            SlashCommand::Troubleshoot { hint } => {
                self.troubleshoot(&hint).map(CommandOutput::Troubleshoot)
            }
            SlashCommand::Workflow { objective } => {
                self.run_workflow(&objective).map(CommandOutput::Workflow)
            }
            SlashCommand::Status => Ok(CommandOutput::Status(self.status())),
            SlashCommand::Reset => self.reset().map(CommandOutput::Reset),
        };
        if let Err(err) = &result
            && let Err(record_err) = self.handle_error(err)
        {
            warn!(err = %format!("{record_err:#}"), "failed to record workflow error");
        }
        result
    }

    pub fn analyze(&mut self) -> Result<AnalysisReport> {
        self.transition(WorkflowState::Analyze, "analyze")?;
        let report = self.pipeline.analyze.execute().context("analyze")?;
        self.pending.push(StepResult::Analysis(report.clone()));
        self.transition(WorkflowState::Idle, "analysis complete")?;
        Ok(report)
    }

    /// Budgeted plan → improve → test iterations, then documentation.
    ///
    /// Step errors end the loop and are troubleshot; halting errors (budget
    /// exhausted, security rejected) propagate and stop the workflow.
    pub fn improve(&mut self, objective: &str) -> Result<ImprovementOutcome> {
        if self.state.context().analysis().is_none() {
            info!("no analysis in context, analyzing first");
            self.analyze()?;
        }

        let mut iteration = 0u32;
        let mut continue_improving = true;
        let mut run = ImproveRun::default();
        while continue_improving && self.budget.can_proceed() {
            iteration += 1;
            self.pending.push(StepResult::Plan(create_plan(objective)));
            self.transition(WorkflowState::Plan, &format!("iteration {iteration}: plan"))?;
            self.transition(WorkflowState::Improve, &format!("iteration {iteration}: improve"))?;
            self.budget.consume_iteration()?;

            match self.improve_iteration(objective, &mut run) {
                Ok(Iteration::Passed) => {
                    self.budget.record_test_result(true, true)?;
                    continue_improving = self.should_continue();
                }
                Ok(Iteration::Failed) => {
                    self.budget.record_test_result(false, false)?;
                }
                Err(err) if is_halt(&err) => return Err(err),
                Err(err) => {
                    let message = format!("{err:#}");
                    warn!(iteration, err = %message, "improve iteration failed");
                    self.state.record_error(&message)?;
                    self.budget.record_test_result(false, false)?;
                    self.transition(WorkflowState::Troubleshoot, "iteration error")?;
                    let report = self.pipeline.troubleshoot.execute(&message)?;
                    self.pending.push(StepResult::Troubleshoot(report));
                    continue_improving = false;
                }
            }
        }
        info!(iterations = iteration, stop = %self.budget.stop_reason(), "improve loop finished");

        if run.improvement.is_some() {
            self.transition(WorkflowState::Document, "document improvements")?;
            let docs = self.pipeline.document.execute().context("document")?;
            self.pending.push(StepResult::Documentation(docs));
        }
        self.transition(WorkflowState::Idle, "improve complete")?;
        Ok(self.improvement_outcome(objective, run))
    }

    fn improve_iteration(&mut self, objective: &str, run: &mut ImproveRun) -> Result<Iteration> {
        let report = self
            .pipeline
            .improve
            .execute(objective, &mut self.budget, &mut self.gate)
            .context("improve")?;
        run.improvement = Some(report.clone());
        self.pending.push(StepResult::Improvement(report));
        self.transition(WorkflowState::Test, "run tests")?;

        let test = self.pipeline.test.execute(&self.budget).context("test")?;
        let passed = test.success;
        run.test = Some(test.clone());
        self.pending.push(StepResult::Test(test));
        if passed {
            return Ok(Iteration::Passed);
        }
        self.transition(WorkflowState::Troubleshoot, "tests failed")?;
        let report = self.pipeline.troubleshoot.execute("test failures")?;
        self.pending.push(StepResult::Troubleshoot(report));
        Ok(Iteration::Failed)
    }

    fn should_continue(&self) -> bool {
        let status = self.budget.status();
        status.can_proceed
            && status.remaining.iterations > 0
            && status.percentages.files < self.cfg.improve.continue_files_percent
    }

    pub fn test(&mut self) -> Result<TestReport> {
        self.transition(WorkflowState::Test, "test")?;
        let report = self.pipeline.test.execute(&self.budget).context("test")?;
        let trigger = if report.success { "tests passed" } else { "tests failed" };
        self.pending.push(StepResult::Test(report.clone()));
        self.transition(WorkflowState::Idle, trigger)?;
        Ok(report)
    }

    pub fn document(&mut self) -> Result<DocumentReport> {
        self.transition(WorkflowState::Document, "document")?;
        let report = self.pipeline.document.execute().context("document")?;
        self.pending.push(StepResult::Documentation(report.clone()));
        self.transition(WorkflowState::Idle, "documentation complete")?;
        Ok(report)
    }

    pub fn git(&mut self, command: &str) -> Result<GitReport> {
        self.transition(WorkflowState::Git, &format!("git {command}"))?;
        let report = self.pipeline.git.execute(command, &mut self.gate)?;
        self.pending.push(StepResult::Git(report.clone()));
        self.transition(WorkflowState::Idle, "git complete")?;
        Ok(report)
    }

    pub fn troubleshoot(&mut self, hint: &str) -> Result<TroubleshootReport> {
        self.transition(WorkflowState::Troubleshoot, "troubleshoot")?;
        let report = self
            .pipeline
            .troubleshoot
            .execute(hint)
            .context("troubleshoot")?;
        self.pending.push(StepResult::Troubleshoot(report.clone()));
        self.transition(WorkflowState::Idle, "diagnostics complete")?;
        Ok(report)
    }

    /// Read-only view of the budget and the transition history.
    pub fn status(&self) -> StatusReport {
        StatusReport {
            state: self.state.current(),
            budget: self.budget.status(),
            patterns: self.state.analyze_patterns(),
            predictions: self.state.predict_next_state(),
        }
    }

    pub fn reset(&mut self) -> Result<ResetReport> {
        self.budget.reset()?;
        self.state.reset()?;
        self.gate.clear_cache();
        self.pending.clear();
        Ok(ResetReport {
            state: self.state.current(),
            budget: self.budget.status(),
        })
    }

    /// analyze → improve → document → commit → push, ending in `DONE` or
    /// `STOP`. Step failures end up in the report rather than the result.
    #[instrument(skip_all, fields(objective = %objective))]
    pub fn run_workflow(&mut self, objective: &str) -> Result<WorkflowReport> {
        match self.workflow_steps(objective) {
            Ok(()) => {
                info!("workflow complete");
                self.transition(WorkflowState::Done, "workflow complete")?;
            }
            Err(err) => {
                let message = format!("{err:#}");
                warn!(err = %message, "workflow stopped");
                self.state.record_error(&message)?;
                self.transition(WorkflowState::Stop, "workflow stopped")?;
            }
        }
        let ctx = self.state.context();
        Ok(WorkflowReport {
            state: self.state.current(),
            success: self.state.current() == WorkflowState::Done,
            results: ctx.slots.clone(),
            budget: self.budget.report(),
            last_error: ctx.last_error.clone(),
        })
    }

    fn workflow_steps(&mut self, objective: &str) -> Result<()> {
        self.analyze()?;
        self.improve(objective)?;
        self.document()?;

        self.transition(WorkflowState::Git, "commit")?;
        let message = format!("feat(auto): {objective}");
        let commit = self.pipeline.git.commit_flow(&message, &mut self.gate)?;
        self.pending.push(StepResult::Git(commit));

        let branch = self
            .state
            .context()
            .last_improvement()
            .map(|report| report.branch.clone())
            .filter(|branch| !branch.is_empty());
        if let Some(branch) = branch {
            self.transition(WorkflowState::Git, "push")?;
            let push = self
                .pipeline
                .git
                .execute(&format!("push --set-upstream origin {branch}"), &mut self.gate)?;
            self.pending.push(StepResult::Git(push));
        }
        Ok(())
    }

    fn handle_error(&mut self, err: &anyhow::Error) -> Result<()> {
        self.state.record_error(&format!("{err:#}"))?;
        if is_halt(err) {
            warn!(err = %err, "halting workflow");
            self.transition(WorkflowState::Stop, "halted")?;
        }
        Ok(())
    }

    /// Move to `to`, merging pending results and the current budget status.
    fn transition(&mut self, to: WorkflowState, trigger: &str) -> Result<()> {
        let mut patch = std::mem::take(&mut self.pending);
        patch.push(StepResult::Budget(self.budget.status()));
        self.state.update_state(to, patch, trigger)
    }

    fn improvement_outcome(&self, objective: &str, run: ImproveRun) -> ImprovementOutcome {
        let ctx = self.state.context();
        let ImproveRun { improvement, test: tests } = run;
        let budget = self.budget.report();
        let status = self.budget.status();

        let mut recommendations = Vec::new();
        if tests.as_ref().is_some_and(|t| !t.success) {
            recommendations.push("Review and fix failing tests before continuing".to_string());
        }
        if status.percentages.files > self.cfg.improve.continue_files_percent {
            recommendations.push("Consider splitting the changes into smaller PRs".to_string());
        }
        if ctx.get(ContextKey::Troubleshoot).is_some() {
            recommendations.push("Check report/troubleshoot.log for details".to_string());
        }

        ImprovementOutcome {
            summary: ImprovementSummary {
                objective: objective.to_string(),
                success: tests.as_ref().is_some_and(|t| t.success),
                iterations: budget.summary.iterations.clone(),
                files_changed: budget.summary.files.clone(),
                time_elapsed: budget.summary.time.clone(),
            },
            improvement,
            tests,
            budget,
            recommendations,
        }
    }
}
