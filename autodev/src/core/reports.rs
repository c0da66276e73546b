//! Result types produced by each pipeline step.
//!
//! Every report carries a `success` flag and is stored in the workflow
//! context under its step's slot.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::core::coverage::{Coverage, FailedTest};
use crate::core::gates::Violation;
use crate::core::plan::{ImprovementPlan, OperationKind};

// ---------------------------------------------------------------------------
// Analyze

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisReport {
    pub success: bool,
    pub timestamp: DateTime<Utc>,
    pub structure: ProjectStructure,
    pub stack: StackInfo,
    pub scripts: ScriptInventory,
    pub hotspots: Vec<Hotspot>,
    pub large_files: Vec<LargeFile>,
    pub dependencies: DependencyInfo,
    pub metrics: CodeMetrics,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProjectStructure {
    pub directories: Vec<String>,
    pub files_by_extension: BTreeMap<String, u64>,
    pub total_files: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StackInfo {
    /// `Node.js`, `Python`, `Go`, `Rust`, or `Polyglot` when several are present.
    pub primary: Option<String>,
    pub languages: Vec<String>,
    pub frameworks: Vec<String>,
    pub databases: Vec<String>,
    pub dev_tools: Vec<String>,
    pub package_manager: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScriptInventory {
    pub npm: BTreeMap<String, String>,
    pub make: Vec<String>,
    pub custom: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HotspotKind {
    Todo,
    Fixme,
    Deprecated,
    Security,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Hotspot {
    pub file: String,
    pub line: usize,
    pub marker: HotspotKind,
    pub text: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LargeFile {
    pub path: String,
    pub size_kb: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VulnerabilityCounts {
    pub info: u64,
    pub low: u64,
    pub moderate: u64,
    pub high: u64,
    pub critical: u64,
}

impl VulnerabilityCounts {
    pub fn total(&self) -> u64 {
        self.info + self.low + self.moderate + self.high + self.critical
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutdatedPackage {
    pub name: String,
    pub current: Option<String>,
    pub wanted: Option<String>,
    pub latest: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DependencyInfo {
    pub production: BTreeMap<String, String>,
    pub development: BTreeMap<String, String>,
    pub outdated: Vec<OutdatedPackage>,
    pub vulnerabilities: VulnerabilityCounts,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CodeMetrics {
    pub lines_of_code: u64,
    pub code_files: u64,
    pub average_lines_per_file: f64,
}

// ---------------------------------------------------------------------------
// Improve

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppliedChange {
    pub file: String,
    pub operations: Vec<OperationKind>,
    pub diff_kb: f64,
    /// True when the file was created rather than edited.
    pub created: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LintRun {
    pub script: String,
    pub success: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImproveReport {
    pub success: bool,
    pub objective: String,
    pub branch: String,
    pub plan: ImprovementPlan,
    pub changes: Vec<AppliedChange>,
    pub files_changed: u32,
    pub diff_kb: f64,
    pub lint: Vec<LintRun>,
    /// Violations that were approved (interactively or from cache) for the plan.
    pub approved_violations: Vec<Violation>,
    pub warnings: Vec<String>,
}

// ---------------------------------------------------------------------------
// Test

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestReport {
    pub success: bool,
    pub command: Vec<String>,
    pub duration_secs: f64,
    pub exit_code: Option<i32>,
    pub coverage: Option<Coverage>,
    /// Mean drop against the stored baseline, when both are known.
    pub coverage_drop: Option<f64>,
    pub failed_tests: Vec<FailedTest>,
    pub output: String,
    pub error: Option<String>,
    pub timed_out: bool,
    pub flakey_tests: bool,
    pub attempts: u32,
    pub message: Option<String>,
}

impl TestReport {
    /// Successful report for a project with nothing to run.
    pub fn no_suite() -> Self {
        Self {
            success: true,
            command: Vec::new(),
            duration_secs: 0.0,
            exit_code: None,
            coverage: None,
            coverage_drop: None,
            failed_tests: Vec::new(),
            output: String::new(),
            error: None,
            timed_out: false,
            flakey_tests: false,
            attempts: 0,
            message: Some("no test suite detected".to_string()),
        }
    }
}

// ---------------------------------------------------------------------------
// Document

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangelogSummary {
    pub path: String,
    pub version: String,
    pub commits: usize,
    pub breaking_changes: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApiSummary {
    pub path: String,
    pub endpoints: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentReport {
    pub success: bool,
    pub changelog: Option<ChangelogSummary>,
    pub readme_updated: bool,
    pub api: Option<ApiSummary>,
    /// Documentation files created on this run.
    pub created: Vec<String>,
}

// ---------------------------------------------------------------------------
// Git

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileChange {
    pub code: String,
    pub path: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GitChanges {
    pub entries: Vec<FileChange>,
    pub files_changed: u32,
    pub insertions: u32,
    pub deletions: u32,
    pub branch: Option<String>,
    pub commit: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GitReport {
    pub command: String,
    pub args: Vec<String>,
    pub output: String,
    pub success: bool,
    pub changes: Option<GitChanges>,
    pub warnings: Vec<String>,
}

// ---------------------------------------------------------------------------
// Troubleshoot

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Medium,
    High,
    Critical,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Recommendation {
    pub severity: Severity,
    pub message: String,
    pub command: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SystemSnapshot {
    pub os: Option<String>,
    pub os_version: Option<String>,
    pub kernel: Option<String>,
    pub host: Option<String>,
    pub cpus: usize,
    /// Tool name → version string, for tools that answered.
    pub tools: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogDigest {
    pub file: String,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorFindings {
    pub test_failures: Vec<String>,
    pub build_errors: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DependencyHealth {
    pub missing: Vec<String>,
    pub vulnerabilities: VulnerabilityCounts,
    pub engine_conflict: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessSample {
    pub pid: u32,
    pub name: String,
    pub cpu_percent: f32,
    pub memory_percent: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiskUsage {
    pub mount: String,
    pub total_gb: f64,
    pub available_gb: f64,
    pub used_percent: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MemoryUsage {
    pub total_mb: u64,
    pub used_mb: u64,
    pub used_percent: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TroubleshootReport {
    pub success: bool,
    pub timestamp: DateTime<Utc>,
    pub hint: String,
    pub system: SystemSnapshot,
    pub environment: BTreeMap<String, String>,
    pub logs: Vec<LogDigest>,
    pub errors: ErrorFindings,
    pub dependencies: DependencyHealth,
    pub processes: Vec<ProcessSample>,
    pub disk: Vec<DiskUsage>,
    pub memory: MemoryUsage,
    pub recommendations: Vec<Recommendation>,
}
