//! Troubleshoot agent: host, environment, log, test-history and dependency
//! diagnostics with rule-based recommendations.

use std::collections::BTreeMap;
use std::ffi::OsStr;
use std::fs;
use std::path::Path;
use std::sync::LazyLock;

use anyhow::{Context, Result};
use chrono::Utc;
use minijinja::Environment;
use regex::Regex;
use serde::Serialize;
use sysinfo::{Disks, ProcessesToUpdate, System};
use tracing::{debug, info, instrument};
use walkdir::WalkDir;

use super::analyze::{is_ignored_dir, npm_audit_counts};
use super::test::TestRunRecord;
use super::{TroubleshootStep, probe_version, read_package_json, run_tool};
use crate::core::reports::{
    DependencyHealth, DiskUsage, ErrorFindings, LogDigest, MemoryUsage, ProcessSample,
    Recommendation, Severity, SystemSnapshot, TroubleshootReport,
};
use crate::io::paths::ProjectPaths;
use crate::io::process::RunLimits;
use crate::io::store::{load_json, write_atomic, write_json};

const LOG_TEMPLATE: &str = include_str!("templates/troubleshoot.log");

const ENV_KEYS: &[&str] = &[
    "NODE_ENV",
    "PORT",
    "DATABASE_URL",
    "API_KEY",
    "DEBUG",
    "CI",
    "GITHUB_ACTIONS",
    "VERCEL",
    "RUST_LOG",
];
const SECRET_MARKERS: &[&str] = &["KEY", "SECRET", "PASSWORD", "TOKEN", "DATABASE_URL"];
const HIDDEN: &str = "***HIDDEN***";

const LOG_TAIL_LINES: usize = 100;
const MAX_LOG_FILES: usize = 20;
const RECENT_FAILURES: usize = 5;
const BUILD_LOGS: &[&str] = &["build.log", "dist/build.log", ".next/build-error.log"];

const DISK_USAGE_ALERT: f64 = 90.0;
const MEMORY_USAGE_ALERT: f64 = 80.0;
const HEAVY_CPU_PERCENT: f32 = 80.0;
const HEAVY_MEMORY_PERCENT: f64 = 10.0;

static UNMET_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"UNMET (?:OPTIONAL )?DEPENDENCY (\S+)").expect("valid regex"));
static MAJOR_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\d+").expect("valid regex"));

pub struct TroubleshootAgent {
    paths: ProjectPaths,
    tool_limits: RunLimits,
    template: Environment<'static>,
}

impl TroubleshootAgent {
    pub fn new(paths: ProjectPaths, tool_limits: RunLimits) -> Self {
        let mut template = Environment::new();
        template.set_trim_blocks(true);
        template
            .add_template("troubleshoot", LOG_TEMPLATE)
            .expect("troubleshoot template should be valid");
        Self {
            paths,
            tool_limits,
            template,
        }
    }

    fn root(&self) -> &Path {
        &self.paths.root
    }

    fn system_snapshot(&self) -> SystemSnapshot {
        let mut sys = System::new();
        sys.refresh_cpu_all();
        let tools = ["node", "npm", "git"]
            .into_iter()
            .filter_map(|tool| {
                probe_version(self.root(), tool, &self.tool_limits)
                    .map(|version| (tool.to_string(), version))
            })
            .collect();
        SystemSnapshot {
            os: System::name(),
            os_version: System::os_version(),
            kernel: System::kernel_version(),
            host: System::host_name(),
            cpus: sys.cpus().len(),
            tools,
        }
    }

    /// `*.log` files at the root and one level down, newest lines only.
    fn collect_logs(&self) -> Vec<LogDigest> {
        let walker = WalkDir::new(self.root())
            .max_depth(2)
            .sort_by_file_name()
            .into_iter()
            .filter_entry(|entry| !(entry.file_type().is_dir() && is_ignored_dir(entry)));
        let mut digests = Vec::new();
        for entry in walker.filter_map(|entry| entry.ok()) {
            let is_log = entry.file_type().is_file()
                && entry.path().extension().is_some_and(|ext| ext == "log");
            if !is_log {
                continue;
            }
            let Ok(contents) = fs::read_to_string(entry.path()) else {
                continue;
            };
            digests.push(digest_log(&self.paths.relative(entry.path()), &contents));
            if digests.len() == MAX_LOG_FILES {
                break;
            }
        }
        digests
    }

    fn analyze_errors(&self, hint: &str) -> ErrorFindings {
        let hint = hint.to_lowercase();
        let mut findings = ErrorFindings::default();
        if hint.is_empty() || hint.contains("test") {
            let records: Vec<TestRunRecord> = load_json(&self.paths.test_results_path)
                .unwrap_or_else(|err| {
                    debug!(err = %format!("{err:#}"), "unreadable test history");
                    None
                })
                .unwrap_or_default();
            findings.test_failures = recent_failures(&records);
        }
        if hint.contains("build") || hint.contains("compile") {
            for log in BUILD_LOGS {
                let Ok(contents) = fs::read_to_string(self.root().join(log)) else {
                    continue;
                };
                findings.build_errors.extend(
                    contents
                        .lines()
                        .filter(|line| {
                            line.contains("ERROR") || line.contains("Failed") || line.contains("Error:")
                        })
                        .map(|line| format!("{log}: {}", line.trim())),
                );
            }
        }
        findings
    }

    fn check_dependencies(&self, node_version: Option<&str>) -> DependencyHealth {
        let Some(package) = read_package_json(self.root()) else {
            return DependencyHealth::default();
        };
        let missing = run_tool(self.root(), "npm", &["ls", "--depth=0"], &self.tool_limits)
            .map(|output| parse_unmet(&output.combined_text()))
            .unwrap_or_default();
        let vulnerabilities = if self.root().join("package-lock.json").exists() {
            npm_audit_counts(self.root(), &self.tool_limits)
        } else {
            Default::default()
        };
        let engine_conflict = package
            .get("engines")
            .and_then(|engines| engines.get("node"))
            .and_then(serde_json::Value::as_str)
            .zip(node_version)
            .and_then(|(required, current)| engine_conflict(current, required));
        DependencyHealth {
            missing,
            vulnerabilities,
            engine_conflict,
        }
    }

    fn write_log(&self, report: &TroubleshootReport) -> Result<()> {
        let view = LogView::from_report(report);
        let rendered = self
            .template
            .get_template("troubleshoot")?
            .render(&view)?;
        write_atomic(&self.paths.troubleshoot_log_path, &rendered)
    }
}

impl TroubleshootStep for TroubleshootAgent {
    #[instrument(skip_all, fields(hint = %hint))]
    fn execute(&mut self, hint: &str) -> Result<TroubleshootReport> {
        let system = self.system_snapshot();
        let node_version = system.tools.get("node").cloned();

        let mut sys = System::new();
        sys.refresh_memory();
        sys.refresh_processes(ProcessesToUpdate::All, true);
        let memory = memory_usage(&sys);

        let mut report = TroubleshootReport {
            success: true,
            timestamp: Utc::now(),
            hint: hint.to_string(),
            environment: masked_environment(std::env::vars()),
            logs: self.collect_logs(),
            errors: self.analyze_errors(hint),
            dependencies: self.check_dependencies(node_version.as_deref()),
            processes: node_processes(&sys, memory.total_mb),
            disk: disk_usage(self.root()),
            memory,
            system,
            recommendations: Vec::new(),
        };
        report.recommendations = recommendations(&report);
        info!(
            recommendations = report.recommendations.len(),
            "diagnostics complete"
        );

        write_json(&self.paths.troubleshoot_report_path, &report)
            .context("write troubleshoot report")?;
        self.write_log(&report).context("write troubleshoot log")?;
        Ok(report)
    }
}

/// Selected variables with secret-looking values masked.
fn masked_environment(vars: impl Iterator<Item = (String, String)>) -> BTreeMap<String, String> {
    vars.filter(|(key, _)| ENV_KEYS.contains(&key.as_str()))
        .map(|(key, value)| {
            if SECRET_MARKERS.iter().any(|marker| key.contains(marker)) {
                (key, HIDDEN.to_string())
            } else {
                (key, value)
            }
        })
        .collect()
}

fn digest_log(file: &str, contents: &str) -> LogDigest {
    let lines: Vec<&str> = contents.lines().collect();
    let tail = &lines[lines.len().saturating_sub(LOG_TAIL_LINES)..];
    let mut digest = LogDigest {
        file: file.to_string(),
        ..LogDigest::default()
    };
    for line in tail {
        let lower = line.to_lowercase();
        if lower.contains("error") {
            digest.errors.push(line.trim().to_string());
        } else if lower.contains("warn") {
            digest.warnings.push(line.trim().to_string());
        }
    }
    digest
}

fn recent_failures(records: &[TestRunRecord]) -> Vec<String> {
    let failures: Vec<&TestRunRecord> = records.iter().filter(|r| !r.success).collect();
    let start = failures.len().saturating_sub(RECENT_FAILURES);
    failures[start..]
        .iter()
        .map(|record| {
            let detail = record.error.clone().unwrap_or_else(|| match record.exit_code {
                Some(code) => format!("exit code {code}"),
                None => "failed".to_string(),
            });
            format!(
                "{} {}: {detail}",
                record.timestamp.format("%Y-%m-%d %H:%M:%S"),
                record.command.join(" ")
            )
        })
        .collect()
}

fn parse_unmet(output: &str) -> Vec<String> {
    UNMET_RE
        .captures_iter(output)
        .map(|caps| caps[1].to_string())
        .collect()
}

/// Conflict description when the running node major is below `engines.node`.
fn engine_conflict(current: &str, required: &str) -> Option<String> {
    let major = |text: &str| -> Option<u64> { MAJOR_RE.find(text)?.as_str().parse().ok() };
    let (have, want) = (major(current)?, major(required)?);
    (have < want).then(|| format!("node {current} does not satisfy engines.node {required}"))
}

fn memory_usage(sys: &System) -> MemoryUsage {
    let total = sys.total_memory();
    let used = sys.used_memory();
    MemoryUsage {
        total_mb: total / 1024 / 1024,
        used_mb: used / 1024 / 1024,
        used_percent: percent(used, total),
    }
}

fn node_processes(sys: &System, total_mb: u64) -> Vec<ProcessSample> {
    let mut samples: Vec<ProcessSample> = sys
        .processes()
        .iter()
        .filter_map(|(pid, process)| {
            let name = OsStr::new(process.name()).to_string_lossy().into_owned();
            if !name.contains("node") {
                return None;
            }
            let memory_mb = process.memory() / 1024 / 1024;
            Some(ProcessSample {
                pid: pid.as_u32(),
                name,
                cpu_percent: process.cpu_usage(),
                memory_percent: percent(memory_mb, total_mb),
            })
        })
        .collect();
    samples.sort_by_key(|sample| sample.pid);
    samples
}

/// Usage of the disk holding `root` (longest matching mount point).
fn disk_usage(root: &Path) -> Vec<DiskUsage> {
    let disks = Disks::new_with_refreshed_list();
    let root = root.canonicalize().unwrap_or_else(|_| root.to_path_buf());
    disks
        .list()
        .iter()
        .filter(|disk| root.starts_with(disk.mount_point()))
        .max_by_key(|disk| disk.mount_point().as_os_str().len())
        .map(|disk| {
            let total = disk.total_space();
            let available = disk.available_space();
            DiskUsage {
                mount: disk.mount_point().display().to_string(),
                total_gb: gigabytes(total),
                available_gb: gigabytes(available),
                used_percent: percent(total.saturating_sub(available), total),
            }
        })
        .into_iter()
        .collect()
}

fn recommendations(report: &TroubleshootReport) -> Vec<Recommendation> {
    let mut recs = Vec::new();
    let mut push = |severity, message: String, command: Option<&str>| {
        recs.push(Recommendation {
            severity,
            message,
            command: command.map(str::to_string),
        });
    };

    if report.disk.iter().any(|d| d.used_percent > DISK_USAGE_ALERT) {
        push(
            Severity::High,
            "Disk space is low; remove temporary files, build output and old logs".to_string(),
            None,
        );
    }
    if report.memory.used_percent > MEMORY_USAGE_ALERT {
        push(
            Severity::Medium,
            "Memory usage is high; close applications that are not needed".to_string(),
            None,
        );
    }
    let deps = &report.dependencies;
    if !deps.missing.is_empty() {
        push(
            Severity::High,
            format!("Missing dependencies: {}", deps.missing.join(", ")),
            Some("npm install"),
        );
    }
    if deps.vulnerabilities.critical > 0 {
        push(
            Severity::Critical,
            format!(
                "{} critical vulnerabilities detected",
                deps.vulnerabilities.critical
            ),
            Some("npm audit fix"),
        );
    }
    if let Some(conflict) = &deps.engine_conflict {
        push(Severity::High, conflict.clone(), None);
    }
    if !report.errors.test_failures.is_empty() {
        push(
            Severity::Medium,
            "Tests are failing; fix them before continuing".to_string(),
            None,
        );
    }
    if !report.errors.build_errors.is_empty() {
        push(
            Severity::High,
            format!("{} build errors found in build logs", report.errors.build_errors.len()),
            None,
        );
    }
    let heavy: Vec<String> = report
        .processes
        .iter()
        .filter(|p| p.cpu_percent > HEAVY_CPU_PERCENT || p.memory_percent > HEAVY_MEMORY_PERCENT)
        .map(|p| p.pid.to_string())
        .collect();
    if !heavy.is_empty() {
        let command = format!("kill {}", heavy.join(" "));
        push(
            Severity::Medium,
            "Node processes are using a lot of resources".to_string(),
            Some(command.as_str()),
        );
    }

    if recs.is_empty() {
        recs.push(Recommendation {
            severity: Severity::Info,
            message: "No significant problems detected".to_string(),
            command: None,
        });
    }
    recs.sort_by(|a, b| b.severity.cmp(&a.severity));
    recs
}

fn percent(part: u64, total: u64) -> f64 {
    if total == 0 {
        0.0
    } else {
        part as f64 / total as f64 * 100.0
    }
}

fn gigabytes(bytes: u64) -> f64 {
    bytes as f64 / 1024.0 / 1024.0 / 1024.0
}

#[derive(Serialize)]
struct ToolRow {
    name: String,
    version: String,
}

#[derive(Serialize)]
struct DiskRow {
    mount: String,
    used_percent: String,
    available_gb: String,
}

#[derive(Serialize)]
struct MemoryRow {
    total_mb: u64,
    used_mb: u64,
    used_percent: String,
}

#[derive(Serialize)]
struct RecommendationRow {
    severity: String,
    message: String,
    command: Option<String>,
}

/// Display values for the plain-text log.
#[derive(Serialize)]
struct LogView {
    timestamp: String,
    hint: String,
    os: String,
    kernel: String,
    host: String,
    cpus: usize,
    tools: Vec<ToolRow>,
    disks: Vec<DiskRow>,
    memory: MemoryRow,
    log_errors: usize,
    test_failures: usize,
    build_errors: usize,
    missing: usize,
    recommendations: Vec<RecommendationRow>,
}

impl LogView {
    fn from_report(report: &TroubleshootReport) -> Self {
        let unknown = |value: &Option<String>| value.clone().unwrap_or_else(|| "unknown".to_string());
        let os = match (&report.system.os, &report.system.os_version) {
            (Some(name), Some(version)) => format!("{name} {version}"),
            (name, _) => unknown(name),
        };
        Self {
            timestamp: report.timestamp.to_rfc3339(),
            hint: if report.hint.is_empty() {
                "None".to_string()
            } else {
                report.hint.clone()
            },
            os,
            kernel: unknown(&report.system.kernel),
            host: unknown(&report.system.host),
            cpus: report.system.cpus,
            tools: report
                .system
                .tools
                .iter()
                .map(|(name, version)| ToolRow {
                    name: name.clone(),
                    version: version.clone(),
                })
                .collect(),
            disks: report
                .disk
                .iter()
                .map(|disk| DiskRow {
                    mount: disk.mount.clone(),
                    used_percent: format!("{:.1}", disk.used_percent),
                    available_gb: format!("{:.1}", disk.available_gb),
                })
                .collect(),
            memory: MemoryRow {
                total_mb: report.memory.total_mb,
                used_mb: report.memory.used_mb,
                used_percent: format!("{:.1}", report.memory.used_percent),
            },
            log_errors: report.logs.iter().filter(|log| !log.errors.is_empty()).count(),
            test_failures: report.errors.test_failures.len(),
            build_errors: report.errors.build_errors.len(),
            missing: report.dependencies.missing.len(),
            recommendations: report
                .recommendations
                .iter()
                .map(|rec| RecommendationRow {
                    severity: format!("{:?}", rec.severity).to_uppercase(),
                    message: rec.message.clone(),
                    command: rec.command.clone(),
                })
                .collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agents::tool_limits;
    use crate::core::reports::VulnerabilityCounts;
    use crate::io::config::AutodevConfig;
    use crate::io::store::append_capped;

    fn blank_report() -> TroubleshootReport {
        TroubleshootReport {
            success: true,
            timestamp: Utc::now(),
            hint: String::new(),
            system: SystemSnapshot::default(),
            environment: BTreeMap::new(),
            logs: Vec::new(),
            errors: ErrorFindings::default(),
            dependencies: DependencyHealth::default(),
            processes: Vec::new(),
            disk: Vec::new(),
            memory: MemoryUsage::default(),
            recommendations: Vec::new(),
        }
    }

    fn failed_record(error: &str) -> TestRunRecord {
        TestRunRecord {
            timestamp: Utc::now(),
            attempt: 1,
            command: vec!["npm".to_string(), "test".to_string()],
            success: false,
            exit_code: Some(1),
            duration_secs: 0.5,
            timed_out: false,
            coverage: None,
            failed_tests: Vec::new(),
            error: Some(error.to_string()),
        }
    }

    #[test]
    fn secrets_are_masked_and_unrelated_vars_dropped() {
        let vars = vec![
            ("API_KEY".to_string(), "abc123".to_string()),
            ("DATABASE_URL".to_string(), "postgres://u:p@db".to_string()),
            ("PORT".to_string(), "3000".to_string()),
            ("HOME".to_string(), "/home/dev".to_string()),
        ];
        let env = masked_environment(vars.into_iter());
        assert_eq!(env.get("API_KEY").map(String::as_str), Some(HIDDEN));
        assert_eq!(env.get("DATABASE_URL").map(String::as_str), Some(HIDDEN));
        assert_eq!(env.get("PORT").map(String::as_str), Some("3000"));
        assert!(!env.contains_key("HOME"));
    }

    #[test]
    fn log_digest_reads_only_the_tail() {
        let mut contents = String::from("ERROR too old to matter\n");
        for idx in 0..LOG_TAIL_LINES - 2 {
            contents.push_str(&format!("info line {idx}\n"));
        }
        contents.push_str("Warning: disk almost full\nerror: connection refused\n");
        let digest = digest_log("app.log", &contents);
        assert_eq!(digest.errors, vec!["error: connection refused"]);
        assert_eq!(digest.warnings, vec!["Warning: disk almost full"]);
    }

    #[test]
    fn engine_conflict_compares_major_versions() {
        assert!(engine_conflict("v16.20.0", ">=18.0.0").is_some());
        assert!(engine_conflict("v20.1.0", ">=18").is_none());
        assert!(engine_conflict("v20.1.0", "*").is_none());
    }

    #[test]
    fn unmet_dependencies_are_listed() {
        let output = "app@1.0.0 /app\n+-- UNMET DEPENDENCY express@^4.18.0\n+-- UNMET OPTIONAL DEPENDENCY fsevents@2\n";
        assert_eq!(parse_unmet(output), vec!["express@^4.18.0", "fsevents@2"]);
    }

    #[test]
    fn recommendations_follow_findings_by_severity() {
        let mut report = blank_report();
        report.memory.used_percent = 85.0;
        report.dependencies.missing = vec!["express".to_string()];
        report.dependencies.vulnerabilities = VulnerabilityCounts {
            critical: 2,
            ..VulnerabilityCounts::default()
        };
        report.processes.push(ProcessSample {
            pid: 42,
            name: "node".to_string(),
            cpu_percent: 95.0,
            memory_percent: 1.0,
        });
        let recs = recommendations(&report);
        let severities: Vec<Severity> = recs.iter().map(|r| r.severity).collect();
        assert_eq!(
            severities,
            vec![Severity::Critical, Severity::High, Severity::Medium, Severity::Medium]
        );
        assert_eq!(recs[0].command.as_deref(), Some("npm audit fix"));
        assert_eq!(recs[1].command.as_deref(), Some("npm install"));
        assert!(recs.iter().any(|r| r.command.as_deref() == Some("kill 42")));
    }

    #[test]
    fn healthy_report_gets_info_recommendation() {
        let recs = recommendations(&blank_report());
        assert_eq!(recs.len(), 1);
        assert_eq!(recs[0].severity, Severity::Info);
    }

    #[test]
    fn execute_reads_test_history_and_writes_reports() {
        let temp = tempfile::tempdir().expect("tempdir");
        let paths = ProjectPaths::new(temp.path());
        for idx in 0..7 {
            append_capped(
                &paths.test_results_path,
                failed_record(&format!("failure {idx}")),
                50,
            )
            .expect("record");
        }
        fs::write(temp.path().join("server.log"), "ok\nError: boom\n").expect("log");

        let cfg = AutodevConfig::default();
        let mut agent = TroubleshootAgent::new(paths.clone(), tool_limits(&cfg));
        let report = agent.execute("test failures").expect("troubleshoot");

        assert_eq!(report.errors.test_failures.len(), RECENT_FAILURES);
        assert!(report.errors.test_failures[4].ends_with("npm test: failure 6"));
        assert_eq!(report.logs.len(), 1);
        assert_eq!(report.logs[0].file, "server.log");
        assert!(
            report
                .recommendations
                .iter()
                .any(|r| r.message.contains("Tests are failing"))
        );

        let stored: TroubleshootReport = load_json(&paths.troubleshoot_report_path)
            .expect("load")
            .expect("report");
        assert_eq!(stored.hint, "test failures");
        let log = fs::read_to_string(&paths.troubleshoot_log_path).expect("log");
        assert!(log.starts_with("TROUBLESHOOTING REPORT"));
        assert!(log.contains("Hint: test failures"));
        assert!(log.contains("Recent test failures: 5"));
        assert!(log.contains("Tests are failing"));
    }

    #[test]
    fn build_hint_collects_build_log_errors() {
        let temp = tempfile::tempdir().expect("tempdir");
        fs::write(
            temp.path().join("build.log"),
            "compiling\nERROR in src/app.js\ndone\n",
        )
        .expect("build log");
        let cfg = AutodevConfig::default();
        let agent = TroubleshootAgent::new(ProjectPaths::new(temp.path()), tool_limits(&cfg));
        let findings = agent.analyze_errors("build broken");
        assert_eq!(findings.build_errors, vec!["build.log: ERROR in src/app.js"]);
        assert!(findings.test_failures.is_empty());
    }
}
