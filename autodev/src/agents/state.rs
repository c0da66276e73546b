//! State agent: the workflow state machine plus its persisted artifacts.
//!
//! Every mutation rewrites `report/state.json` (logs truncated to their
//! configured caps) and the human-readable `STATE.md`.

use std::collections::BTreeSet;
use std::path::PathBuf;

use anyhow::{Context as _, Result};
use chrono::{DateTime, Utc};
use minijinja::{Environment, context};
use serde::Serialize;
use tracing::{debug, info, instrument, warn};

use crate::core::budget::BudgetStatus;
use crate::core::context::{Context, ContextKey, StepResult};
use crate::core::state_machine::{
    PatternAnalysis, Prediction, StateMachine, StateSnapshot, analyze_patterns,
    predict_next_state, time_per_state,
};
use crate::core::types::WorkflowState;
use crate::io::config::StateConfig;
use crate::io::paths::ProjectPaths;
use crate::io::store::{load_json, write_atomic, write_json};

const STATE_TEMPLATE: &str = include_str!("templates/state.md");

/// Transitions listed in `STATE.md`, newest first.
const RECENT_TRANSITIONS: usize = 10;

pub struct StateAgent {
    machine: StateMachine,
    state_path: PathBuf,
    markdown_path: PathBuf,
    history_cap: usize,
    transitions_cap: usize,
    engine: StateTemplate,
}

impl StateAgent {
    /// Build the agent and restore any persisted state.
    pub fn initialize(paths: &ProjectPaths, cfg: &StateConfig) -> Result<Self> {
        let mut agent = Self {
            machine: StateMachine::new(Utc::now()),
            state_path: paths.state_path.clone(),
            markdown_path: paths.state_markdown_path.clone(),
            history_cap: cfg.history_cap,
            transitions_cap: cfg.transitions_cap,
            engine: StateTemplate::new(),
        };
        agent.load_state();
        Ok(agent)
    }

    /// Restore the persisted snapshot. Returns `false` on a fresh start.
    ///
    /// An unreadable snapshot is logged and treated as absent.
    #[instrument(skip_all)]
    pub fn load_state(&mut self) -> bool {
        match load_json::<StateSnapshot>(&self.state_path) {
            Ok(Some(snapshot)) => {
                debug!(state = %snapshot.current_state, "restored workflow state");
                self.machine = StateMachine::from_snapshot(snapshot);
                true
            }
            Ok(None) => false,
            Err(err) => {
                warn!(err = %format!("{err:#}"), "ignoring unreadable state snapshot");
                false
            }
        }
    }

    pub fn current(&self) -> WorkflowState {
        self.machine.current()
    }

    pub fn context(&self) -> &Context {
        self.machine.context()
    }

    pub fn machine(&self) -> &StateMachine {
        &self.machine
    }

    /// Transition to `to`, merge `patch` into the context, and persist.
    pub fn update_state(
        &mut self,
        to: WorkflowState,
        patch: Vec<StepResult>,
        trigger: &str,
    ) -> Result<()> {
        let transition = self.machine.apply(to, trigger, patch, Utc::now());
        info!(
            from = %transition.from,
            to = %transition.to,
            trigger = %transition.trigger,
            "state transition"
        );
        self.persist()
    }

    /// Store `message` as the last error without changing state.
    pub fn record_error(&mut self, message: &str) -> Result<()> {
        warn!(state = %self.machine.current(), error = %message, "workflow error recorded");
        self.machine.record_error(message, Utc::now());
        self.persist()
    }

    pub fn analyze_patterns(&self) -> PatternAnalysis {
        analyze_patterns(self.machine.transitions(), self.machine.history())
    }

    pub fn predict_next_state(&self) -> Vec<Prediction> {
        predict_next_state(self.machine.current(), self.machine.transitions())
    }

    /// Full in-memory snapshot, logs untruncated.
    pub fn export_state(&self) -> StateSnapshot {
        self.machine.snapshot(Utc::now(), usize::MAX, usize::MAX)
    }

    pub fn reset(&mut self) -> Result<()> {
        info!("resetting workflow state");
        self.machine.reset(Utc::now());
        self.persist()
    }

    pub fn render_markdown(&self, now: DateTime<Utc>) -> Result<String> {
        self.engine.render(&self.machine, now)
    }

    #[instrument(skip_all)]
    fn persist(&self) -> Result<()> {
        let now = Utc::now();
        let snapshot = self
            .machine
            .snapshot(now, self.history_cap, self.transitions_cap);
        write_json(&self.state_path, &snapshot)
            .with_context(|| format!("persist state {}", self.state_path.display()))?;
        let markdown = self.render_markdown(now)?;
        write_atomic(&self.markdown_path, &markdown)
            .with_context(|| format!("write {}", self.markdown_path.display()))
    }
}

#[derive(Debug, Serialize)]
struct SlotView {
    title: &'static str,
    success: bool,
    summary: String,
}

#[derive(Debug, Serialize)]
struct TransitionView {
    timestamp: String,
    from: &'static str,
    to: &'static str,
    trigger: String,
}

#[derive(Debug, Serialize)]
struct UsageView {
    iterations: String,
    time: String,
    files: String,
    diff: String,
}

#[derive(Debug, Serialize)]
struct BudgetView {
    iterations: u32,
    max_iterations: u32,
    elapsed_secs: u64,
    max_seconds: u64,
    files: u32,
    max_files: u32,
    diff_kb: String,
    max_diff_kb: String,
    usage: UsageView,
    can_proceed: bool,
    stop_reason: &'static str,
}

impl BudgetView {
    fn from_status(status: &BudgetStatus) -> Self {
        let pct = |value: f64| format!("{value:.1}%");
        Self {
            iterations: status.consumed.iterations,
            max_iterations: status.limits.max_iterations,
            elapsed_secs: status.elapsed_secs,
            max_seconds: status.limits.max_seconds,
            files: status.consumed.changed_files,
            max_files: status.limits.max_changed_files,
            diff_kb: format!("{:.1}", status.consumed.diff_kb),
            max_diff_kb: format!("{:.1}", status.limits.max_diff_kb),
            usage: UsageView {
                iterations: pct(status.percentages.iterations),
                time: pct(status.percentages.time),
                files: pct(status.percentages.files),
                diff: pct(status.percentages.diff),
            },
            can_proceed: status.can_proceed,
            stop_reason: status.stop_reason.describe(),
        }
    }
}

#[derive(Debug, Serialize)]
struct TimeRow {
    state: &'static str,
    seconds: String,
}

#[derive(Debug, Serialize)]
struct MetricsView {
    states_visited: usize,
    transitions: usize,
    events: usize,
    time_per_state: Vec<TimeRow>,
}

/// Template engine wrapper for `STATE.md`.
struct StateTemplate {
    env: Environment<'static>,
}

impl StateTemplate {
    fn new() -> Self {
        let mut env = Environment::new();
        env.set_trim_blocks(true);
        env.add_template("state", STATE_TEMPLATE)
            .expect("state template should be valid");
        Self { env }
    }

    fn render(&self, machine: &StateMachine, now: DateTime<Utc>) -> Result<String> {
        let ctx = machine.context();
        let slots: Vec<SlotView> = ctx
            .slots
            .values()
            .filter(|result| result.key() != ContextKey::Budget)
            .map(|result| SlotView {
                title: slot_title(result.key()),
                success: result.success(),
                summary: slot_summary(result),
            })
            .collect();

        let transitions: Vec<TransitionView> = machine
            .transitions()
            .iter()
            .rev()
            .take(RECENT_TRANSITIONS)
            .map(|t| TransitionView {
                timestamp: t.timestamp.format("%Y-%m-%d %H:%M:%S").to_string(),
                from: t.from.as_str(),
                to: t.to.as_str(),
                trigger: t.trigger.clone(),
            })
            .collect();

        let budget = match ctx.get(ContextKey::Budget) {
            Some(StepResult::Budget(status)) => Some(BudgetView::from_status(status)),
            _ => None,
        };

        let last_error = ctx.last_error.as_ref().map(|err| {
            context! {
                state => err.state.as_str(),
                timestamp => err.timestamp.to_rfc3339(),
                message => err.message.clone(),
            }
        });

        let template = self.env.get_template("state")?;
        let rendered = template.render(context! {
            current_state => machine.current().as_str(),
            updated => now.to_rfc3339(),
            session_started => machine.session_started().to_rfc3339(),
            slots => slots,
            last_error => last_error,
            transitions => transitions,
            edges => diagram_edges(machine),
            budget => budget,
            metrics => metrics(machine, now),
        })?;
        Ok(rendered)
    }
}

fn slot_title(key: ContextKey) -> &'static str {
    match key {
        ContextKey::Analysis => "Analysis",
        ContextKey::Plan => "Plan",
        ContextKey::LastImprovement => "Last Improvement",
        ContextKey::LastTest => "Last Test",
        ContextKey::Documentation => "Documentation",
        ContextKey::LastGit => "Last Git",
        ContextKey::Troubleshoot => "Troubleshoot",
        ContextKey::Budget => "Budget",
    }
}

fn slot_summary(result: &StepResult) -> String {
    match result {
        StepResult::Analysis(r) => format!(
            "{} files, primary stack {}, {} hotspots",
            r.structure.total_files,
            r.stack.primary.as_deref().unwrap_or("unknown"),
            r.hotspots.len()
        ),
        StepResult::Plan(p) => format!(
            "{}: {} steps, ~{} changes, ~{} min",
            p.objective,
            p.steps.len(),
            p.estimated_changes,
            p.estimated_minutes
        ),
        StepResult::Improvement(r) => format!(
            "{} files changed ({:.1} KB) on `{}`",
            r.files_changed, r.diff_kb, r.branch
        ),
        StepResult::Test(r) => {
            let mut summary = match r.exit_code {
                Some(code) => format!("exit {code}, {} failed tests", r.failed_tests.len()),
                None => format!("{} failed tests", r.failed_tests.len()),
            };
            if let Some(coverage) = &r.coverage {
                summary.push_str(&format!(", line coverage {:.1}%", coverage.lines));
            }
            if r.flakey_tests {
                summary.push_str(", flakey");
            }
            if let Some(message) = r.message.as_ref().or(r.error.as_ref()) {
                summary.push_str(&format!(" ({message})"));
            }
            summary
        }
        StepResult::Documentation(r) => {
            let changelog = r
                .changelog
                .as_ref()
                .map(|c| format!("changelog {} ({} commits)", c.version, c.commits))
                .unwrap_or_else(|| "no changelog entry".to_string());
            format!("{changelog}, {} files created", r.created.len())
        }
        StepResult::Git(r) => format!("`git {}`", r.args.join(" ")),
        StepResult::Troubleshoot(r) => format!(
            "{} recommendations for \"{}\"",
            r.recommendations.len(),
            r.hint
        ),
        StepResult::Budget(status) => format!(
            "{}/{} iterations, {}",
            status.consumed.iterations,
            status.limits.max_iterations,
            status.stop_reason.describe()
        ),
    }
}

/// Observed edges, in first-seen order, for the mermaid diagram.
fn diagram_edges(machine: &StateMachine) -> Vec<String> {
    let mut edges = vec![format!("[*] --> {}", WorkflowState::Idle.as_str())];
    let mut seen = BTreeSet::new();
    for t in machine.transitions() {
        if seen.insert((t.from, t.to)) {
            edges.push(format!("{} --> {}", t.from.as_str(), t.to.as_str()));
        }
    }
    for terminal in [WorkflowState::Done, WorkflowState::Stop] {
        if seen.iter().any(|(_, to)| *to == terminal) {
            edges.push(format!("{} --> [*]", terminal.as_str()));
        }
    }
    edges
}

fn metrics(machine: &StateMachine, now: DateTime<Utc>) -> MetricsView {
    let mut visited: BTreeSet<WorkflowState> =
        machine.transitions().iter().map(|t| t.to).collect();
    visited.insert(machine.current());
    let totals = time_per_state(
        machine.transitions(),
        machine.current(),
        machine.session_started(),
        now,
    );
    MetricsView {
        states_visited: visited.len(),
        transitions: machine.transitions().len(),
        events: machine.history().len(),
        time_per_state: totals
            .into_iter()
            .map(|(state, secs)| TimeRow {
                state: state.as_str(),
                seconds: format!("{secs:.1}"),
            })
            .collect(),
    }
}
