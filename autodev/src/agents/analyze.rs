//! Analyze agent: one walk over the project producing structure, stack,
//! scripts, hotspots, large files, dependencies and size metrics.

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::Path;
use std::sync::LazyLock;

use anyhow::{Context, Result};
use chrono::Utc;
use regex::Regex;
use tracing::{debug, instrument};
use walkdir::{DirEntry, WalkDir};

use super::{AnalyzeStep, package_scripts, read_package_json, run_tool};
use crate::core::reports::{
    AnalysisReport, CodeMetrics, DependencyInfo, Hotspot, HotspotKind, LargeFile,
    OutdatedPackage, ProjectStructure, ScriptInventory, StackInfo, VulnerabilityCounts,
};
use crate::io::paths::ProjectPaths;
use crate::io::process::RunLimits;
use crate::io::store::write_json;

const IGNORED_DIRS: &[&str] = &[
    ".git",
    "node_modules",
    "dist",
    "build",
    ".venv",
    "venv",
    ".next",
    ".cache",
    "target",
    "report",
];
const IGNORED_EXTENSIONS: &[&str] = &["log", "lock", "db", "sqlite"];
const CODE_EXTENSIONS: &[&str] = &[
    "js", "jsx", "ts", "tsx", "mjs", "py", "go", "java", "c", "cpp", "cs", "rb", "php", "swift",
    "kt", "rs", "vue", "svelte",
];
const SCRIPT_DIRS: &[&str] = &["scripts", "bin", ".github/scripts"];

const LARGE_FILE_BYTES: u64 = 100 * 1024;
const LARGE_FILE_LIMIT: usize = 20;
/// Files above this size are counted but never read.
const MAX_SCAN_BYTES: u64 = 1024 * 1024;

static HOTSPOT_RES: LazyLock<Vec<(HotspotKind, Regex)>> = LazyLock::new(|| {
    vec![
        (
            HotspotKind::Todo,
            Regex::new(r"(?i)TODO[:\s]+(.+)").expect("valid regex"),
        ),
        (
            HotspotKind::Fixme,
            Regex::new(r"(?i)FIXME[:\s]+(.+)").expect("valid regex"),
        ),
        (
            HotspotKind::Deprecated,
            Regex::new(r"(?i)@deprecated[:\s]+(.+)").expect("valid regex"),
        ),
        (
            HotspotKind::Security,
            Regex::new(r"(?:SECURITY|VULNERABLE|UNSAFE)[:\s]+(.+)").expect("valid regex"),
        ),
    ]
});
static MAKE_TARGET_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?m)^([a-zA-Z0-9_-]+):").expect("valid regex"));

/// True for directories the analysis never descends into.
pub(crate) fn is_ignored_dir(entry: &DirEntry) -> bool {
    entry.depth() > 0
        && entry
            .file_name()
            .to_str()
            .is_some_and(|name| IGNORED_DIRS.contains(&name))
}

pub struct AnalyzeAgent {
    paths: ProjectPaths,
    tool_limits: RunLimits,
}

/// Accumulated results of the project walk.
#[derive(Default)]
struct WalkSummary {
    structure: ProjectStructure,
    languages: BTreeSet<String>,
    hotspots: Vec<Hotspot>,
    large_files: Vec<LargeFile>,
    metrics: CodeMetrics,
}

impl AnalyzeAgent {
    pub fn new(paths: ProjectPaths, tool_limits: RunLimits) -> Self {
        Self { paths, tool_limits }
    }

    fn walk(&self) -> Result<WalkSummary> {
        let mut summary = WalkSummary::default();
        let walker = WalkDir::new(&self.paths.root)
            .sort_by_file_name()
            .into_iter()
            .filter_entry(|entry| !(entry.file_type().is_dir() && is_ignored_dir(entry)));

        for entry in walker {
            let entry = entry.context("walk project")?;
            let rel = self.paths.relative(entry.path());
            if entry.file_type().is_dir() {
                if entry.depth() > 0 {
                    summary.structure.directories.push(rel);
                }
                continue;
            }
            if !entry.file_type().is_file() {
                continue;
            }
            let ext = extension(entry.path());
            if IGNORED_EXTENSIONS.contains(&ext.as_str()) {
                continue;
            }
            summary.structure.total_files += 1;
            let key = if ext.is_empty() {
                "(none)".to_string()
            } else {
                format!(".{ext}")
            };
            *summary.structure.files_by_extension.entry(key).or_insert(0) += 1;

            let size = entry.metadata().map(|m| m.len()).unwrap_or(0);
            if size > LARGE_FILE_BYTES {
                summary.large_files.push(LargeFile {
                    path: rel.clone(),
                    size_kb: size as f64 / 1024.0,
                });
            }
            if size > MAX_SCAN_BYTES {
                continue;
            }
            let Ok(contents) = fs::read_to_string(entry.path()) else {
                continue;
            };
            summary.hotspots.extend(scan_hotspots(&rel, &contents));
            if CODE_EXTENSIONS.contains(&ext.as_str()) {
                summary.metrics.code_files += 1;
                summary.metrics.lines_of_code += contents.lines().count() as u64;
                if let Some(language) = language_for(&ext) {
                    summary.languages.insert(language.to_string());
                }
            }
        }

        summary
            .large_files
            .sort_by(|a, b| b.size_kb.total_cmp(&a.size_kb));
        summary.large_files.truncate(LARGE_FILE_LIMIT);
        if summary.metrics.code_files > 0 {
            summary.metrics.average_lines_per_file =
                summary.metrics.lines_of_code as f64 / summary.metrics.code_files as f64;
        }
        Ok(summary)
    }

    fn detect_stack(&self, package: Option<&serde_json::Value>, languages: BTreeSet<String>) -> StackInfo {
        let root = &self.paths.root;
        let mut stack = StackInfo {
            languages: languages.into_iter().collect(),
            ..StackInfo::default()
        };
        let mut primaries = Vec::new();

        if let Some(package) = package {
            primaries.push("Node.js");
            stack.package_manager = Some(
                if root.join("yarn.lock").exists() {
                    "yarn"
                } else if root.join("pnpm-lock.yaml").exists() {
                    "pnpm"
                } else {
                    "npm"
                }
                .to_string(),
            );
            let deps = all_dependencies(package);
            let has = |name: &str| deps.contains(name);
            for (dep, framework) in [
                ("react", "React"),
                ("vue", "Vue"),
                ("express", "Express"),
                ("next", "Next.js"),
            ] {
                if has(dep) {
                    stack.frameworks.push(framework.to_string());
                }
            }
            for (dep, tool) in [
                ("vite", "Vite"),
                ("webpack", "Webpack"),
                ("typescript", "TypeScript"),
                ("eslint", "ESLint"),
                ("prettier", "Prettier"),
                ("jest", "Jest"),
            ] {
                if has(dep) {
                    stack.dev_tools.push(tool.to_string());
                }
            }
            let databases: [(&[&str], &str); 5] = [
                (&["sqlite3", "better-sqlite3"], "SQLite"),
                (&["pg"], "PostgreSQL"),
                (&["mysql", "mysql2"], "MySQL"),
                (&["mongodb", "mongoose"], "MongoDB"),
                (&["@supabase/supabase-js"], "Supabase"),
            ];
            for (names, database) in databases {
                if names.iter().any(|name| has(name)) {
                    stack.databases.push(database.to_string());
                }
            }
        }
        if root.join("requirements.txt").exists()
            || root.join("Pipfile").exists()
            || root.join("pyproject.toml").exists()
        {
            primaries.push("Python");
        }
        if root.join("go.mod").exists() {
            primaries.push("Go");
        }
        if root.join("Cargo.toml").exists() {
            primaries.push("Rust");
            stack.package_manager.get_or_insert_with(|| "cargo".to_string());
        }

        stack.primary = match primaries.as_slice() {
            [] => None,
            [only] => Some((*only).to_string()),
            _ => Some("Polyglot".to_string()),
        };
        stack
    }

    fn detect_scripts(&self, package: Option<&serde_json::Value>) -> ScriptInventory {
        let root = &self.paths.root;
        let npm = package
            .map(|pkg| package_scripts(pkg).into_iter().collect())
            .unwrap_or_default();

        let make = fs::read_to_string(root.join("Makefile"))
            .map(|makefile| {
                MAKE_TARGET_RE
                    .captures_iter(&makefile)
                    .map(|caps| caps[1].to_string())
                    .collect()
            })
            .unwrap_or_default();

        let mut custom = Vec::new();
        for dir in SCRIPT_DIRS {
            let Ok(entries) = fs::read_dir(root.join(dir)) else {
                continue;
            };
            let mut names: Vec<String> = entries
                .filter_map(|entry| entry.ok())
                .filter_map(|entry| entry.file_name().to_str().map(str::to_string))
                .filter(|name| {
                    [".sh", ".js", ".py"]
                        .iter()
                        .any(|suffix| name.ends_with(suffix))
                })
                .map(|name| format!("{dir}/{name}"))
                .collect();
            names.sort();
            custom.extend(names);
        }

        ScriptInventory { npm, make, custom }
    }

    fn dependencies(&self, package: Option<&serde_json::Value>) -> DependencyInfo {
        let Some(package) = package else {
            return DependencyInfo::default();
        };
        let root = &self.paths.root;
        let outdated = if root.join("node_modules").is_dir() {
            npm_outdated(root, &self.tool_limits)
        } else {
            debug!("node_modules missing, skipping npm outdated");
            Vec::new()
        };
        let vulnerabilities = if root.join("package-lock.json").exists() {
            npm_audit_counts(root, &self.tool_limits)
        } else {
            debug!("package-lock.json missing, skipping npm audit");
            VulnerabilityCounts::default()
        };
        DependencyInfo {
            production: string_map(package.get("dependencies")),
            development: string_map(package.get("devDependencies")),
            outdated,
            vulnerabilities,
        }
    }
}

impl AnalyzeStep for AnalyzeAgent {
    #[instrument(skip_all)]
    fn execute(&mut self) -> Result<AnalysisReport> {
        let package = read_package_json(&self.paths.root);
        let walk = self.walk()?;
        let report = AnalysisReport {
            success: true,
            timestamp: Utc::now(),
            stack: self.detect_stack(package.as_ref(), walk.languages),
            scripts: self.detect_scripts(package.as_ref()),
            dependencies: self.dependencies(package.as_ref()),
            structure: walk.structure,
            hotspots: walk.hotspots,
            large_files: walk.large_files,
            metrics: walk.metrics,
        };
        debug!(
            total_files = report.structure.total_files,
            hotspots = report.hotspots.len(),
            "analysis complete"
        );
        write_json(&self.paths.analyze_report_path, &report).context("write analysis report")?;
        Ok(report)
    }
}

/// `npm audit --json` severity counts; empty when npm is unavailable.
pub(crate) fn npm_audit_counts(root: &Path, limits: &RunLimits) -> VulnerabilityCounts {
    // npm audit exits non-zero when it finds vulnerabilities; only the JSON matters.
    let Some(output) = run_tool(root, "npm", &["audit", "--json"], limits) else {
        return VulnerabilityCounts::default();
    };
    parse_audit_counts(&output.stdout_text())
}

fn parse_audit_counts(json: &str) -> VulnerabilityCounts {
    let Ok(value) = serde_json::from_str::<serde_json::Value>(json) else {
        debug!("npm audit output is not JSON");
        return VulnerabilityCounts::default();
    };
    let counts = &value["metadata"]["vulnerabilities"];
    let get = |key: &str| counts.get(key).and_then(serde_json::Value::as_u64).unwrap_or(0);
    VulnerabilityCounts {
        info: get("info"),
        low: get("low"),
        moderate: get("moderate"),
        high: get("high"),
        critical: get("critical"),
    }
}

fn npm_outdated(root: &Path, limits: &RunLimits) -> Vec<OutdatedPackage> {
    let Some(output) = run_tool(root, "npm", &["outdated", "--json"], limits) else {
        return Vec::new();
    };
    parse_outdated(&output.stdout_text())
}

fn parse_outdated(json: &str) -> Vec<OutdatedPackage> {
    let Ok(serde_json::Value::Object(packages)) = serde_json::from_str::<serde_json::Value>(json)
    else {
        return Vec::new();
    };
    let field = |info: &serde_json::Value, key: &str| {
        info.get(key)
            .and_then(serde_json::Value::as_str)
            .map(str::to_string)
    };
    packages
        .iter()
        .map(|(name, info)| OutdatedPackage {
            name: name.clone(),
            current: field(info, "current"),
            wanted: field(info, "wanted"),
            latest: field(info, "latest"),
        })
        .collect()
}

fn scan_hotspots(file: &str, contents: &str) -> Vec<Hotspot> {
    let mut found = Vec::new();
    for (idx, line) in contents.lines().enumerate() {
        for (kind, re) in &*HOTSPOT_RES {
            if let Some(caps) = re.captures(line) {
                found.push(Hotspot {
                    file: file.to_string(),
                    line: idx + 1,
                    marker: *kind,
                    text: caps[1].trim().to_string(),
                });
            }
        }
    }
    found
}

fn all_dependencies(package: &serde_json::Value) -> BTreeSet<String> {
    ["dependencies", "devDependencies"]
        .iter()
        .filter_map(|key| package.get(*key).and_then(serde_json::Value::as_object))
        .flat_map(|deps| deps.keys().cloned())
        .collect()
}

fn string_map(value: Option<&serde_json::Value>) -> BTreeMap<String, String> {
    value
        .and_then(serde_json::Value::as_object)
        .map(|map| {
            map.iter()
                .filter_map(|(k, v)| Some((k.clone(), v.as_str()?.to_string())))
                .collect()
        })
        .unwrap_or_default()
}

fn extension(path: &Path) -> String {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(str::to_lowercase)
        .unwrap_or_default()
}

fn language_for(ext: &str) -> Option<&'static str> {
    let language = match ext {
        "js" | "jsx" | "mjs" => "JavaScript",
        "ts" | "tsx" => "TypeScript",
        "py" => "Python",
        "go" => "Go",
        "rs" => "Rust",
        "java" => "Java",
        "c" => "C",
        "cpp" => "C++",
        "cs" => "C#",
        "rb" => "Ruby",
        "php" => "PHP",
        "swift" => "Swift",
        "kt" => "Kotlin",
        "vue" => "Vue",
        "svelte" => "Svelte",
        _ => return None,
    };
    Some(language)
}
