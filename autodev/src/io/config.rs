//! Orchestrator configuration stored in `autodev.toml` at the project root.

use std::fs;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};

use crate::core::budget::BudgetLimits;
use crate::io::store::write_atomic;

/// Orchestrator configuration (TOML).
///
/// Intended to be edited by humans. Missing fields default to the values the
/// workflow was tuned with.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AutodevConfig {
    /// Timeout for auxiliary tool invocations (`npm outdated`, version probes).
    pub tool_timeout_secs: u64,

    /// Truncate captured subprocess stdout/stderr beyond this many bytes.
    pub output_limit_bytes: usize,

    pub budget: BudgetConfig,
    pub improve: ImproveConfig,
    pub test: TestConfig,
    pub state: StateConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct BudgetConfig {
    pub max_iterations: u32,
    pub max_seconds: u64,
    pub max_changed_files: u32,
    pub max_diff_kb: f64,
    pub max_no_improvement_cycles: u32,
    pub max_test_failure_rate: f64,
    /// A persisted budget older than this starts a fresh session.
    pub session_ttl_secs: u64,
    /// Audit entries kept in `report/budget-state.json`.
    pub history_cap: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ImproveConfig {
    /// Directory (relative to the root) scanned for rewrite candidates.
    pub source_root: String,
    /// Stop iterating once this share of the file budget is used.
    pub continue_files_percent: f64,
    /// npm scripts run after rewriting, each tried with `--fix` first.
    pub lint_scripts: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct TestConfig {
    /// Explicit test command (e.g. `["npm","test"]`). Empty means auto-detect.
    pub command: Vec<String>,
    pub timeout_secs: u64,
    /// Time between SIGTERM and SIGKILL when a run times out.
    pub kill_grace_secs: u64,
    pub max_retries: u32,
    /// Mean coverage drop (percentage points) that fails a run.
    pub coverage_drop_threshold: f64,
    /// Entries kept in `report/test-results.json`.
    pub history_cap: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct StateConfig {
    pub history_cap: usize,
    pub transitions_cap: usize,
}

impl Default for AutodevConfig {
    fn default() -> Self {
        Self {
            tool_timeout_secs: 120,
            output_limit_bytes: 1_000_000,
            budget: BudgetConfig::default(),
            improve: ImproveConfig::default(),
            test: TestConfig::default(),
            state: StateConfig::default(),
        }
    }
}

impl Default for BudgetConfig {
    fn default() -> Self {
        let limits = BudgetLimits::default();
        Self {
            max_iterations: limits.max_iterations,
            max_seconds: limits.max_seconds,
            max_changed_files: limits.max_changed_files,
            max_diff_kb: limits.max_diff_kb,
            max_no_improvement_cycles: limits.max_no_improvement_cycles,
            max_test_failure_rate: limits.max_test_failure_rate,
            session_ttl_secs: 30 * 60,
            history_cap: 100,
        }
    }
}

impl Default for ImproveConfig {
    fn default() -> Self {
        Self {
            source_root: "src".to_string(),
            continue_files_percent: 80.0,
            lint_scripts: vec![
                "lint".to_string(),
                "prettier".to_string(),
                "typecheck".to_string(),
            ],
        }
    }
}

impl Default for TestConfig {
    fn default() -> Self {
        Self {
            command: Vec::new(),
            timeout_secs: 10 * 60,
            kill_grace_secs: 5,
            max_retries: 1,
            coverage_drop_threshold: 2.0,
            history_cap: 50,
        }
    }
}

impl Default for StateConfig {
    fn default() -> Self {
        Self {
            history_cap: 100,
            transitions_cap: 50,
        }
    }
}

impl BudgetConfig {
    pub fn limits(&self) -> BudgetLimits {
        BudgetLimits {
            max_iterations: self.max_iterations,
            max_seconds: self.max_seconds,
            max_changed_files: self.max_changed_files,
            max_diff_kb: self.max_diff_kb,
            max_no_improvement_cycles: self.max_no_improvement_cycles,
            max_test_failure_rate: self.max_test_failure_rate,
        }
    }

    pub fn session_ttl(&self) -> Duration {
        Duration::from_secs(self.session_ttl_secs)
    }
}

impl AutodevConfig {
    pub fn tool_timeout(&self) -> Duration {
        Duration::from_secs(self.tool_timeout_secs)
    }

    pub fn validate(&self) -> Result<()> {
        if self.tool_timeout_secs == 0 {
            return Err(anyhow!("tool_timeout_secs must be > 0"));
        }
        if self.output_limit_bytes == 0 {
            return Err(anyhow!("output_limit_bytes must be > 0"));
        }

        let budget = &self.budget;
        if budget.max_iterations == 0 {
            return Err(anyhow!("budget.max_iterations must be > 0"));
        }
        if budget.max_seconds == 0 {
            return Err(anyhow!("budget.max_seconds must be > 0"));
        }
        if budget.max_changed_files == 0 {
            return Err(anyhow!("budget.max_changed_files must be > 0"));
        }
        if budget.max_diff_kb.is_nan() || budget.max_diff_kb <= 0.0 {
            return Err(anyhow!("budget.max_diff_kb must be > 0"));
        }
        if !(0.0..=1.0).contains(&budget.max_test_failure_rate) {
            return Err(anyhow!("budget.max_test_failure_rate must be within [0, 1]"));
        }
        if budget.session_ttl_secs == 0 {
            return Err(anyhow!("budget.session_ttl_secs must be > 0"));
        }
        if budget.history_cap == 0 {
            return Err(anyhow!("budget.history_cap must be > 0"));
        }

        let improve = &self.improve;
        if improve.source_root.trim().is_empty() {
            return Err(anyhow!("improve.source_root must not be empty"));
        }
        let percent = improve.continue_files_percent;
        if percent.is_nan() || percent <= 0.0 || percent > 100.0 {
            return Err(anyhow!("improve.continue_files_percent must be within (0, 100]"));
        }

        let test = &self.test;
        if !test.command.is_empty() && test.command[0].trim().is_empty() {
            return Err(anyhow!("test.command must start with a program name"));
        }
        if test.timeout_secs == 0 {
            return Err(anyhow!("test.timeout_secs must be > 0"));
        }
        if test.coverage_drop_threshold.is_nan() || test.coverage_drop_threshold < 0.0 {
            return Err(anyhow!("test.coverage_drop_threshold must be >= 0"));
        }
        if test.history_cap == 0 {
            return Err(anyhow!("test.history_cap must be > 0"));
        }

        if self.state.history_cap == 0 || self.state.transitions_cap == 0 {
            return Err(anyhow!("state.history_cap and state.transitions_cap must be > 0"));
        }
        Ok(())
    }
}

/// Load config from a TOML file.
///
/// If the file is missing, returns `AutodevConfig::default()`.
pub fn load_config(path: &Path) -> Result<AutodevConfig> {
    if !path.exists() {
        let cfg = AutodevConfig::default();
        cfg.validate()?;
        return Ok(cfg);
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let cfg: AutodevConfig =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    cfg.validate()
        .with_context(|| format!("invalid config {}", path.display()))?;
    Ok(cfg)
}

/// Atomically write config to disk (temp file + rename).
pub fn write_config(path: &Path, cfg: &AutodevConfig) -> Result<()> {
    cfg.validate()?;
    let mut buf = toml::to_string_pretty(cfg).context("serialize config toml")?;
    buf.push('\n');
    write_atomic(path, &buf)
}
