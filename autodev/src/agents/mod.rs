//! Workflow agents.
//!
//! `budget`, `security` and `state` hold session state for the orchestrator.
//! The remaining agents are pipeline steps, each behind a small trait so the
//! orchestrator can be driven by scripted fakes in tests.

use std::fs;
use std::path::Path;
use std::process::Command;
use std::time::Duration;

use anyhow::Result;
use tracing::debug;

use crate::core::reports::{
    AnalysisReport, DocumentReport, GitReport, ImproveReport, TestReport, TroubleshootReport,
};
use crate::io::config::AutodevConfig;
use crate::io::paths::ProjectPaths;
use crate::io::process::{CommandOutput, RunLimits, run_command_with_timeout};

pub mod analyze;
pub mod budget;
pub mod document;
pub mod git;
pub mod improve;
pub mod security;
pub mod state;
pub mod test;
pub mod troubleshoot;

use self::budget::BudgetAgent;
use self::security::SecurityGateAgent;

pub trait AnalyzeStep {
    fn execute(&mut self) -> Result<AnalysisReport>;
}

pub trait ImproveStep {
    fn execute(
        &mut self,
        objective: &str,
        budget: &mut BudgetAgent,
        gate: &mut SecurityGateAgent,
    ) -> Result<ImproveReport>;
}

pub trait TestStep {
    fn execute(&mut self, budget: &BudgetAgent) -> Result<TestReport>;
}

pub trait DocumentStep {
    fn execute(&mut self) -> Result<DocumentReport>;
}

pub trait GitStep {
    /// Run one git command (quoted arguments honored, no shell).
    fn execute(&mut self, command: &str, gate: &mut SecurityGateAgent) -> Result<GitReport>;

    /// Stage everything and commit with `message`.
    fn commit_flow(&mut self, message: &str, gate: &mut SecurityGateAgent) -> Result<GitReport>;
}

pub trait TroubleshootStep {
    fn execute(&mut self, hint: &str) -> Result<TroubleshootReport>;
}

/// The step implementations the orchestrator drives.
pub struct Pipeline {
    pub analyze: Box<dyn AnalyzeStep>,
    pub improve: Box<dyn ImproveStep>,
    pub test: Box<dyn TestStep>,
    pub document: Box<dyn DocumentStep>,
    pub git: Box<dyn GitStep>,
    pub troubleshoot: Box<dyn TroubleshootStep>,
}

impl Pipeline {
    /// Real agents operating on the project at `paths.root`.
    pub fn standard(paths: &ProjectPaths, cfg: &AutodevConfig) -> Self {
        Self {
            analyze: Box::new(analyze::AnalyzeAgent::new(paths.clone(), tool_limits(cfg))),
            improve: Box::new(improve::ImproveAgent::new(
                paths.clone(),
                cfg.improve.clone(),
                tool_limits(cfg),
            )),
            test: Box::new(test::TestAgent::new(paths.clone(), cfg)),
            document: Box::new(document::DocumentAgent::new(paths.clone())),
            git: Box::new(git::GitAgent::new(paths.clone())),
            troubleshoot: Box::new(troubleshoot::TroubleshootAgent::new(
                paths.clone(),
                tool_limits(cfg),
            )),
        }
    }
}

/// Limits for auxiliary tools (`npm`, version probes, lint scripts).
pub fn tool_limits(cfg: &AutodevConfig) -> RunLimits {
    RunLimits {
        timeout: cfg.tool_timeout(),
        kill_grace: Duration::from_secs(cfg.test.kill_grace_secs),
        output_limit_bytes: cfg.output_limit_bytes,
    }
}

/// Run an auxiliary tool in `root`; `None` when it cannot be spawned.
pub(crate) fn run_tool(
    root: &Path,
    program: &str,
    args: &[&str],
    limits: &RunLimits,
) -> Option<CommandOutput> {
    let mut cmd = Command::new(program);
    cmd.args(args).current_dir(root);
    match run_command_with_timeout(cmd, limits) {
        Ok(output) => Some(output),
        Err(err) => {
            debug!(program, err = %format!("{err:#}"), "tool unavailable");
            None
        }
    }
}

/// First line of `<program> --version`, when the tool answers successfully.
pub(crate) fn probe_version(root: &Path, program: &str, limits: &RunLimits) -> Option<String> {
    let output = run_tool(root, program, &["--version"], limits)?;
    if !output.success() {
        debug!(program, "version probe failed");
        return None;
    }
    let text = output.stdout_text();
    let first = text.lines().next().unwrap_or_default().trim().to_string();
    Some(first)
}

/// Parsed `package.json`, or `None` when absent or malformed.
pub(crate) fn read_package_json(root: &Path) -> Option<serde_json::Value> {
    let path = root.join("package.json");
    let contents = fs::read_to_string(&path).ok()?;
    match serde_json::from_str(&contents) {
        Ok(value) => Some(value),
        Err(err) => {
            debug!(path = %path.display(), err = %err, "ignoring malformed package.json");
            None
        }
    }
}

/// `package.json` scripts as name → command pairs.
pub(crate) fn package_scripts(package: &serde_json::Value) -> Vec<(String, String)> {
    package
        .get("scripts")
        .and_then(serde_json::Value::as_object)
        .map(|scripts| {
            scripts
                .iter()
                .filter_map(|(name, body)| Some((name.clone(), body.as_str()?.to_string())))
                .collect()
        })
        .unwrap_or_default()
}
