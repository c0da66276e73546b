//! Test agent: detect the project's test command, run it under the budget,
//! and judge coverage against the stored baseline.

use std::process::Command;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};

use super::budget::BudgetAgent;
use super::{TestStep, package_scripts, probe_version, read_package_json};
use crate::core::coverage::{
    Coverage, FailedTest, coverage_drop, parse_coverage, parse_failed_tests,
};
use crate::core::reports::TestReport;
use crate::io::config::{AutodevConfig, TestConfig};
use crate::io::paths::ProjectPaths;
use crate::io::process::{RunLimits, run_command_with_timeout};
use crate::io::store::{append_capped, load_json, write_json};

/// npm scripts tried in order when no command is configured.
const NPM_TEST_SCRIPTS: &[&str] = &["test", "test:unit", "test:all", "test:ci"];

/// One attempt as recorded in `report/test-results.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestRunRecord {
    pub timestamp: DateTime<Utc>,
    pub attempt: u32,
    pub command: Vec<String>,
    pub success: bool,
    pub exit_code: Option<i32>,
    pub duration_secs: f64,
    pub timed_out: bool,
    pub coverage: Option<Coverage>,
    pub failed_tests: Vec<FailedTest>,
    pub error: Option<String>,
}

impl TestRunRecord {
    fn from_report(report: &TestReport, attempt: u32) -> Self {
        Self {
            timestamp: Utc::now(),
            attempt,
            command: report.command.clone(),
            success: report.success,
            exit_code: report.exit_code,
            duration_secs: report.duration_secs,
            timed_out: report.timed_out,
            coverage: report.coverage,
            failed_tests: report.failed_tests.clone(),
            error: report.error.clone(),
        }
    }
}

pub struct TestAgent {
    paths: ProjectPaths,
    cfg: TestConfig,
    output_limit_bytes: usize,
    probe_limits: RunLimits,
}

impl TestAgent {
    pub fn new(paths: ProjectPaths, cfg: &AutodevConfig) -> Self {
        Self {
            paths,
            cfg: cfg.test.clone(),
            output_limit_bytes: cfg.output_limit_bytes,
            probe_limits: super::tool_limits(cfg),
        }
    }

    /// The command that would run, or `None` when no suite is detected.
    pub fn detect_command(&self) -> Option<Vec<String>> {
        if !self.cfg.command.is_empty() {
            return Some(self.cfg.command.clone());
        }
        let root = &self.paths.root;

        if let Some(package) = read_package_json(root) {
            let scripts = package_scripts(&package);
            for wanted in NPM_TEST_SCRIPTS {
                let found = scripts
                    .iter()
                    .find(|(name, body)| name.as_str() == *wanted && !body.contains("--watch"));
                if let Some((name, _)) = found {
                    return Some(owned(&["npm", "run", name.as_str()]));
                }
            }
        }

        if root.join("Cargo.toml").exists()
            && probe_version(root, "cargo", &self.probe_limits).is_some()
        {
            return Some(owned(&["cargo", "test"]));
        }

        let runners: [(&str, &[&str]); 5] = [
            ("jest", &["jest", "--coverage"]),
            ("mocha", &["mocha"]),
            ("vitest", &["vitest", "run", "--coverage"]),
            ("pytest", &["pytest"]),
            ("go", &["go", "test", "./...", "-cover"]),
        ];
        for (probe, command) in runners {
            let answered = if probe == "go" {
                version_answers(root, &["go", "version"], &self.probe_limits)
            } else {
                probe_version(root, probe, &self.probe_limits).is_some()
            };
            if answered {
                return Some(owned(command));
            }
        }
        None
    }

    #[instrument(skip_all, fields(attempt = attempt))]
    fn run_once(&self, command: &[String], timeout: Duration, attempt: u32) -> Result<TestReport> {
        let (program, args) = command
            .split_first()
            .context("test command is empty")?;
        let mut cmd = Command::new(program);
        cmd.args(args)
            .current_dir(&self.paths.root)
            .env("CI", "true")
            .env("NODE_ENV", "test")
            .env("FORCE_COLOR", "0");
        let limits = RunLimits {
            timeout,
            kill_grace: Duration::from_secs(self.cfg.kill_grace_secs),
            output_limit_bytes: self.output_limit_bytes,
        };
        debug!(command = %command.join(" "), timeout_secs = timeout.as_secs(), "running tests");
        let output = run_command_with_timeout(cmd, &limits)?;
        let text = output.combined_text();

        let coverage = parse_coverage(&text);
        let drop = match (self.baseline()?, coverage) {
            (Some(baseline), Some(current)) => Some(coverage_drop(&baseline, &current)),
            _ => None,
        };

        let mut success = output.success();
        let error = if output.timed_out {
            Some(format!("test command timed out after {}s", timeout.as_secs()))
        } else if !output.status.success() {
            Some(match output.exit_code() {
                Some(code) => format!("test command exited with code {code}"),
                None => "test command terminated by signal".to_string(),
            })
        } else if let Some(drop) = drop.filter(|d| *d > self.cfg.coverage_drop_threshold) {
            success = false;
            Some(format!(
                "coverage dropped by {drop:.2} points (threshold {:.2})",
                self.cfg.coverage_drop_threshold
            ))
        } else {
            None
        };

        Ok(TestReport {
            success,
            command: command.to_vec(),
            duration_secs: output.elapsed.as_secs_f64(),
            exit_code: output.exit_code(),
            coverage,
            coverage_drop: drop,
            failed_tests: parse_failed_tests(&text),
            output: text,
            error,
            timed_out: output.timed_out,
            flakey_tests: false,
            attempts: attempt,
            message: None,
        })
    }

    fn baseline(&self) -> Result<Option<Coverage>> {
        load_json(&self.paths.baseline_coverage_path)
    }

    fn record(&self, report: &TestReport, attempt: u32) -> Result<()> {
        append_capped(
            &self.paths.test_results_path,
            TestRunRecord::from_report(report, attempt),
            self.cfg.history_cap,
        )
        .context("record test run")
    }

    fn timeout(&self, budget: &BudgetAgent) -> Result<Duration> {
        let configured = Duration::from_secs(self.cfg.timeout_secs);
        Ok(configured.min(budget.remaining_time()?))
    }
}

impl TestStep for TestAgent {
    #[instrument(skip_all)]
    fn execute(&mut self, budget: &BudgetAgent) -> Result<TestReport> {
        let Some(command) = self.detect_command() else {
            info!("no test suite detected");
            return Ok(TestReport::no_suite());
        };

        let mut report = self.run_once(&command, self.timeout(budget)?, 1)?;
        self.record(&report, 1)?;

        let mut attempt = 1;
        while !report.success && !report.timed_out && attempt <= self.cfg.max_retries {
            attempt += 1;
            warn!(attempt, "tests failed, retrying");
            let retry = self.run_once(&command, self.timeout(budget)?, attempt)?;
            self.record(&retry, attempt)?;
            if retry.success {
                info!(attempt, "tests passed on retry, marking as flakey");
                report = TestReport {
                    flakey_tests: true,
                    ..retry
                };
                break;
            }
            report.attempts = attempt;
        }

        if report.success
            && let Some(coverage) = report.coverage
        {
            write_json(&self.paths.baseline_coverage_path, &coverage)
                .context("write coverage baseline")?;
            debug!(lines = coverage.lines, "coverage baseline updated");
        }
        Ok(report)
    }
}

fn owned(parts: &[&str]) -> Vec<String> {
    parts.iter().map(|p| (*p).to_string()).collect()
}

fn version_answers(root: &std::path::Path, command: &[&str], limits: &RunLimits) -> bool {
    let Some((program, args)) = command.split_first() else {
        return false;
    };
    super::run_tool(root, program, args, limits).is_some_and(|out| out.success())
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::io::config::BudgetConfig;

    fn agent(root: &std::path::Path, command: &[&str]) -> (TestAgent, BudgetAgent) {
        let mut cfg = AutodevConfig::default();
        cfg.test.command = owned(command);
        let paths = ProjectPaths::new(root);
        let budget = BudgetAgent::initialize(&paths, &BudgetConfig::default()).expect("budget");
        (TestAgent::new(paths, &cfg), budget)
    }

    fn sh(script: &str) -> Vec<&str> {
        vec!["sh", "-c", script]
    }

    #[test]
    fn passing_run_sets_baseline() {
        let temp = tempfile::tempdir().expect("tempdir");
        let (mut agent, budget) = agent(
            temp.path(),
            &sh("echo 'All files | 81.5 | 70 | 90 | 82 |'"),
        );
        let report = agent.execute(&budget).expect("execute");
        assert!(report.success);
        assert_eq!(report.exit_code, Some(0));
        assert_eq!(report.coverage.map(|c| c.lines), Some(82.0));

        let baseline: Coverage = load_json(&temp.path().join("report/baseline-coverage.json"))
            .expect("load")
            .expect("baseline");
        assert_eq!(baseline.statements, 81.5);
    }

    #[test]
    fn coverage_drop_fails_successful_command() {
        let temp = tempfile::tempdir().expect("tempdir");
        let baseline_path = temp.path().join("report/baseline-coverage.json");
        write_json(&baseline_path, &Coverage::uniform(80.0)).expect("baseline");

        let (mut agent, budget) = agent(temp.path(), &sh("echo 'coverage: 70.0% of statements'"));
        let report = agent.execute(&budget).expect("execute");
        assert!(!report.success);
        assert_eq!(report.exit_code, Some(0));
        assert_eq!(report.coverage_drop, Some(10.0));
        assert!(report.error.as_deref().is_some_and(|e| e.contains("coverage dropped")));

        let baseline: Coverage = load_json(&baseline_path).expect("load").expect("baseline");
        assert_eq!(baseline, Coverage::uniform(80.0), "failed runs keep the baseline");
    }

    #[test]
    fn drop_at_threshold_passes_and_moves_baseline() {
        let temp = tempfile::tempdir().expect("tempdir");
        let baseline_path = temp.path().join("report/baseline-coverage.json");
        write_json(&baseline_path, &Coverage::uniform(80.0)).expect("baseline");

        let (mut agent, budget) = agent(temp.path(), &sh("echo 'coverage: 78.0% of statements'"));
        let report = agent.execute(&budget).expect("execute");
        assert!(report.success, "error: {:?}", report.error);
        assert_eq!(report.coverage_drop, Some(2.0));
        assert!(report.error.is_none());

        let baseline: Coverage = load_json(&baseline_path).expect("load").expect("baseline");
        assert_eq!(baseline, Coverage::uniform(78.0));
    }

    #[test]
    fn drop_just_past_threshold_fails() {
        let temp = tempfile::tempdir().expect("tempdir");
        let baseline_path = temp.path().join("report/baseline-coverage.json");
        write_json(&baseline_path, &Coverage::uniform(80.0)).expect("baseline");

        let (mut agent, budget) = agent(temp.path(), &sh("echo 'coverage: 77.9% of statements'"));
        let report = agent.execute(&budget).expect("execute");
        assert!(!report.success);
        assert!(report.error.as_deref().is_some_and(|e| e.contains("coverage dropped")));

        let baseline: Coverage = load_json(&baseline_path).expect("load").expect("baseline");
        assert_eq!(baseline, Coverage::uniform(80.0));
    }

    #[test]
    fn failing_run_is_retried_and_recorded() {
        let temp = tempfile::tempdir().expect("tempdir");
        let (mut agent, budget) = agent(
            temp.path(),
            &sh("echo '--- FAIL: TestParse (0.00s)'; exit 1"),
        );
        let report = agent.execute(&budget).expect("execute");
        assert!(!report.success);
        assert_eq!(report.attempts, 2);
        assert_eq!(report.failed_tests[0].file, "TestParse");
        assert!(report.error.as_deref().is_some_and(|e| e.contains("code 1")));

        let history: Vec<TestRunRecord> = load_json(&temp.path().join("report/test-results.json"))
            .expect("load")
            .expect("history");
        assert_eq!(history.len(), 2);
        assert!(history.iter().all(|r| !r.success));
    }

    #[test]
    fn success_on_retry_is_flakey() {
        let temp = tempfile::tempdir().expect("tempdir");
        let marker = temp.path().join("attempted");
        let script = format!(
            "if [ -f '{0}' ]; then exit 0; else touch '{0}'; exit 1; fi",
            marker.display()
        );
        let (mut agent, budget) = agent(temp.path(), &sh(&script));
        let report = agent.execute(&budget).expect("execute");
        assert!(report.success);
        assert!(report.flakey_tests);
        assert_eq!(report.attempts, 2);
    }

    #[test]
    fn timeout_reports_exit_124() {
        let temp = tempfile::tempdir().expect("tempdir");
        let (mut agent, budget) = agent(temp.path(), &["sleep", "30"]);
        agent.cfg.timeout_secs = 1;
        agent.cfg.kill_grace_secs = 1;
        let report = agent.execute(&budget).expect("execute");
        assert!(report.timed_out);
        assert!(!report.success);
        assert_eq!(report.exit_code, Some(124));
        assert_eq!(report.attempts, 1, "timeouts are not retried");
        assert!(report.error.as_deref().is_some_and(|e| e.contains("timed out")));
    }

    #[test]
    fn npm_scripts_skip_watch_mode() {
        let temp = tempfile::tempdir().expect("tempdir");
        std::fs::write(
            temp.path().join("package.json"),
            r#"{"scripts":{"test":"jest --watch","test:unit":"jest"}}"#,
        )
        .expect("package.json");
        let (agent, _budget) = agent(temp.path(), &[]);
        assert_eq!(
            agent.detect_command(),
            Some(owned(&["npm", "run", "test:unit"]))
        );
    }

    #[test]
    fn environment_marks_ci_run() {
        let temp = tempfile::tempdir().expect("tempdir");
        let (mut agent, budget) = agent(
            temp.path(),
            &sh("test \"$CI\" = true && test \"$NODE_ENV\" = test && test \"$FORCE_COLOR\" = 0"),
        );
        assert!(agent.execute(&budget).expect("execute").success);
    }
}
