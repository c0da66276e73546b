//! Well-known locations inside the target project.

use std::path::{Path, PathBuf};

pub const CONFIG_FILE: &str = "autodev.toml";
pub const REPORT_DIR: &str = "report";

/// Absolute paths for every file the orchestrator reads or writes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProjectPaths {
    pub root: PathBuf,
    pub config_path: PathBuf,
    pub report_dir: PathBuf,
    pub budget_state_path: PathBuf,
    pub state_path: PathBuf,
    pub state_markdown_path: PathBuf,
    pub test_results_path: PathBuf,
    pub baseline_coverage_path: PathBuf,
    pub analyze_report_path: PathBuf,
    pub troubleshoot_report_path: PathBuf,
    pub troubleshoot_log_path: PathBuf,
}

impl ProjectPaths {
    pub fn new(root: &Path) -> Self {
        let report_dir = root.join(REPORT_DIR);
        Self {
            root: root.to_path_buf(),
            config_path: root.join(CONFIG_FILE),
            budget_state_path: report_dir.join("budget-state.json"),
            state_path: report_dir.join("state.json"),
            state_markdown_path: root.join("STATE.md"),
            test_results_path: report_dir.join("test-results.json"),
            baseline_coverage_path: report_dir.join("baseline-coverage.json"),
            analyze_report_path: report_dir.join("analyze.json"),
            troubleshoot_report_path: report_dir.join("troubleshoot-report.json"),
            troubleshoot_log_path: report_dir.join("troubleshoot.log"),
            report_dir,
        }
    }

    /// Path relative to the project root, with `/` separators.
    pub fn relative(&self, path: &Path) -> String {
        let rel = path.strip_prefix(&self.root).unwrap_or(path);
        rel.components()
            .map(|c| c.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/")
    }
}
