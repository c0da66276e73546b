//! Documentation agent: CHANGELOG, README installation section, API docs
//! and starter guides.

use std::fmt::Write as _;
use std::fs;
use std::path::Path;
use std::sync::LazyLock;

use anyhow::{Context, Result};
use chrono::{NaiveDate, Utc};
use regex::Regex;
use tracing::{debug, info, instrument, warn};

use super::{DocumentStep, package_scripts, read_package_json};
use crate::core::commit_msg::parse_conventional;
use crate::core::reports::{ApiSummary, ChangelogSummary, DocumentReport};
use crate::io::git::Git;
use crate::io::paths::ProjectPaths;
use crate::io::store::write_atomic;

const CHANGELOG_FILE: &str = "CHANGELOG.md";
const CHANGELOG_HEADER: &str =
    "# Changelog\n\nAll notable changes to this project are documented in this file.\n\n";
const FALLBACK_COMMITS: usize = 10;
const INSTALL_HEADING: &str = "## Installation";
const ROUTE_DIRS: &[&str] = &["routes", "api", "controllers", "endpoints", "backend/routes"];

/// Changelog section order; `wip` holds the pending-changes line.
const SECTIONS: &[(&str, &str)] = &[
    ("feat", "Features"),
    ("fix", "Bug Fixes"),
    ("perf", "Performance"),
    ("refactor", "Refactoring"),
    ("docs", "Documentation"),
    ("test", "Tests"),
    ("chore", "Chores"),
    ("wip", "Work in Progress"),
];

static ROUTE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?:router|app)\.(get|post|put|patch|delete)\(\s*['"]([^'"]+)['"]"#)
        .expect("valid regex")
});
static ROUTE_PARAM_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r":(\w+)").expect("valid regex"));

#[derive(Debug, Clone, PartialEq, Eq)]
struct Change {
    kind: String,
    scope: Option<String>,
    description: String,
    breaking: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Endpoint {
    method: String,
    path: String,
    params: Vec<String>,
    auth: bool,
    description: Option<String>,
}

pub struct DocumentAgent {
    paths: ProjectPaths,
    git: Git,
}

impl DocumentAgent {
    pub fn new(paths: ProjectPaths) -> Self {
        let git = Git::new(paths.root.clone());
        Self { paths, git }
    }

    fn root(&self) -> &Path {
        &self.paths.root
    }

    /// Conventional commits since the last tag (or the newest few), plus a
    /// pending-changes entry for a dirty tree.
    fn recent_changes(&self) -> Vec<Change> {
        let tag = self.git.last_tag().unwrap_or_else(|err| {
            debug!(err = %format!("{err:#}"), "cannot read tags");
            None
        });
        let log = self
            .git
            .log(tag.as_deref(), FALLBACK_COMMITS)
            .unwrap_or_else(|err| {
                warn!(err = %format!("{err:#}"), "cannot read git log");
                Vec::new()
            });

        let mut changes: Vec<Change> = log
            .iter()
            .filter_map(|entry| parse_conventional(&entry.message))
            .filter(|commit| SECTIONS.iter().any(|(kind, _)| *kind == commit.kind))
            .map(|commit| Change {
                breaking: commit.breaking || commit.description.to_lowercase().contains("breaking"),
                kind: commit.kind,
                scope: commit.scope,
                description: commit.description,
            })
            .collect();

        match self.git.status_porcelain() {
            Ok(entries) if !entries.is_empty() => changes.push(Change {
                kind: "wip".to_string(),
                scope: None,
                description: format!("{} files with pending changes", entries.len()),
                breaking: false,
            }),
            Ok(_) => {}
            Err(err) => debug!(err = %format!("{err:#}"), "cannot read git status"),
        }
        changes
    }

    /// Version from package.json or Cargo.toml, else a dated tag.
    fn version(&self, today: NaiveDate) -> String {
        if let Some(package) = read_package_json(self.root()) {
            return package
                .get("version")
                .and_then(serde_json::Value::as_str)
                .unwrap_or("Unreleased")
                .to_string();
        }
        let cargo_version = fs::read_to_string(self.root().join("Cargo.toml"))
            .ok()
            .and_then(|text| toml::from_str::<toml::Value>(&text).ok())
            .and_then(|manifest| {
                manifest
                    .get("package")?
                    .get("version")?
                    .as_str()
                    .map(str::to_string)
            });
        cargo_version.unwrap_or_else(|| format!("v{}", today.format("%Y-%m-%d")))
    }

    fn update_changelog(&self, today: NaiveDate) -> Result<Option<ChangelogSummary>> {
        let changes = self.recent_changes();
        if changes.is_empty() {
            info!("no new changes to document");
            return Ok(None);
        }
        let path = self.root().join(CHANGELOG_FILE);
        let existing = if path.exists() {
            fs::read_to_string(&path).with_context(|| format!("read {}", path.display()))?
        } else {
            CHANGELOG_HEADER.to_string()
        };
        let version = self.version(today);
        let entry = changelog_entry(&version, today, &changes);
        write_atomic(&path, &upsert_entry(&existing, &version, &entry))?;

        Ok(Some(ChangelogSummary {
            path: CHANGELOG_FILE.to_string(),
            version,
            commits: changes.iter().filter(|c| c.kind != "wip").count(),
            breaking_changes: changes.iter().filter(|c| c.breaking).count(),
        }))
    }

    fn update_readme(&self) -> Result<bool> {
        let path = self.root().join("README.md");
        if !path.exists() {
            debug!("README.md missing, skipping");
            return Ok(false);
        }
        let Some(section) = self.install_section() else {
            return Ok(false);
        };
        let readme = fs::read_to_string(&path).with_context(|| format!("read {}", path.display()))?;
        if readme.contains(&section) {
            return Ok(false);
        }
        write_atomic(&path, &replace_section(&readme, INSTALL_HEADING, &section))?;
        Ok(true)
    }

    fn install_command(&self) -> Option<&'static str> {
        let root = self.root();
        let command = if root.join("yarn.lock").exists() {
            "yarn install"
        } else if root.join("pnpm-lock.yaml").exists() {
            "pnpm install"
        } else if root.join("package.json").exists() {
            "npm install"
        } else if root.join("Cargo.toml").exists() {
            "cargo build"
        } else if root.join("requirements.txt").exists() {
            "pip install -r requirements.txt"
        } else if root.join("go.mod").exists() {
            "go mod download"
        } else {
            return None;
        };
        Some(command)
    }

    fn install_section(&self) -> Option<String> {
        let command = self.install_command()?;
        Some(format!("{INSTALL_HEADING}\n\n```bash\n{command}\n```\n"))
    }

    fn update_api_docs(&self) -> Result<Option<ApiSummary>> {
        let mut sections = Vec::new();
        for dir in ROUTE_DIRS {
            let Ok(entries) = fs::read_dir(self.root().join(dir)) else {
                continue;
            };
            let mut files: Vec<_> = entries
                .filter_map(|entry| entry.ok().map(|e| e.path()))
                .filter(|path| {
                    path.extension()
                        .and_then(|ext| ext.to_str())
                        .is_some_and(|ext| ext == "js" || ext == "ts")
                })
                .collect();
            files.sort();
            for file in files {
                let Ok(contents) = fs::read_to_string(&file) else {
                    continue;
                };
                let endpoints = extract_endpoints(&contents);
                if endpoints.is_empty() {
                    continue;
                }
                let name = file
                    .file_stem()
                    .map(|stem| stem.to_string_lossy().into_owned())
                    .unwrap_or_default();
                sections.push((name, endpoints));
            }
        }

        let endpoints: usize = sections.iter().map(|(_, e)| e.len()).sum();
        if endpoints == 0 {
            return Ok(None);
        }
        let rel = "docs/API.md";
        write_atomic(&self.root().join(rel), &api_markdown(&sections))?;
        Ok(Some(ApiSummary {
            path: rel.to_string(),
            endpoints,
        }))
    }

    fn create_guides(&self) -> Result<Vec<String>> {
        let mut created = Vec::new();
        let quick_start = "docs/QUICK_START.md";
        if !self.root().join(quick_start).exists()
            && let Some(guide) = self.quick_start_guide()
        {
            write_atomic(&self.root().join(quick_start), &guide)?;
            created.push(quick_start.to_string());
        }
        let contributing = "docs/CONTRIBUTING.md";
        if !self.root().join(contributing).exists() {
            write_atomic(&self.root().join(contributing), CONTRIBUTING_GUIDE)?;
            created.push(contributing.to_string());
        }
        Ok(created)
    }

    fn quick_start_guide(&self) -> Option<String> {
        let package = read_package_json(self.root())?;
        let install = self.install_command().unwrap_or("npm install");
        let scripts = package_scripts(&package);
        let mut guide = format!("# Quick Start\n\n## Installation\n\n```bash\n{install}\n```\n\n");
        guide.push_str("## Available Commands\n\n");
        for (script, title, command) in [
            ("dev", "Development", "npm run dev"),
            ("build", "Build", "npm run build"),
            ("test", "Tests", "npm run test"),
            ("start", "Production", "npm start"),
        ] {
            if scripts.iter().any(|(name, _)| name == script) {
                let _ = write!(guide, "### {title}\n\n```bash\n{command}\n```\n\n");
            }
        }
        Some(guide)
    }
}

impl DocumentStep for DocumentAgent {
    #[instrument(skip_all)]
    fn execute(&mut self) -> Result<DocumentReport> {
        let today = Utc::now().date_naive();
        let changelog = self.update_changelog(today).context("update changelog")?;
        let readme_updated = self.update_readme().context("update README")?;
        let api = self.update_api_docs().context("update API docs")?;
        let created = self.create_guides().context("create guides")?;
        info!(
            changelog = changelog.is_some(),
            readme_updated,
            guides = created.len(),
            "documentation updated"
        );
        Ok(DocumentReport {
            success: true,
            changelog,
            readme_updated,
            api,
            created,
        })
    }
}

fn changelog_entry(version: &str, date: NaiveDate, changes: &[Change]) -> String {
    let mut entry = format!("## [{version}] - {}\n\n", date.format("%Y-%m-%d"));
    for (kind, title) in SECTIONS {
        let group: Vec<&Change> = changes.iter().filter(|c| c.kind == *kind).collect();
        if group.is_empty() {
            continue;
        }
        let _ = writeln!(entry, "### {title}");
        for change in group {
            match &change.scope {
                Some(scope) => {
                    let _ = writeln!(entry, "- **{scope}**: {}", change.description);
                }
                None => {
                    let _ = writeln!(entry, "- {}", change.description);
                }
            }
        }
        entry.push('\n');
    }
    let breaking: Vec<&Change> = changes.iter().filter(|c| c.breaking).collect();
    if !breaking.is_empty() {
        entry.push_str("### BREAKING CHANGES\n");
        for change in breaking {
            let _ = writeln!(entry, "- {}", change.description);
        }
        entry.push('\n');
    }
    entry
}

/// Replace the section already released as `version`, or insert `entry` as a
/// new release.
fn upsert_entry(changelog: &str, version: &str, entry: &str) -> String {
    let heading = format!("## [{version}]");
    let mut start = None;
    let mut offset = 0;
    for line in changelog.split_inclusive('\n') {
        match start {
            None if line.starts_with(&heading) => start = Some(offset),
            Some(begin) if line.starts_with("## ") => {
                return format!("{}{entry}{}", &changelog[..begin], &changelog[offset..]);
            }
            _ => {}
        }
        offset += line.len();
    }
    match start {
        Some(begin) => format!("{}{entry}", &changelog[..begin]),
        None => insert_entry(changelog, entry),
    }
}

/// Insert `entry` before the first release heading, or append it.
fn insert_entry(changelog: &str, entry: &str) -> String {
    let mut offset = 0;
    for line in changelog.split_inclusive('\n') {
        if line.starts_with("## ") {
            return format!("{}{entry}{}", &changelog[..offset], &changelog[offset..]);
        }
        offset += line.len();
    }
    let mut out = changelog.to_string();
    if !out.is_empty() && !out.ends_with("\n\n") {
        out.push_str(if out.ends_with('\n') { "\n" } else { "\n\n" });
    }
    out.push_str(entry);
    out
}

/// Replace the `heading` section (up to the next `## `) or append it.
fn replace_section(content: &str, heading: &str, section: &str) -> String {
    let lines: Vec<&str> = content.lines().collect();
    let Some(start) = lines.iter().position(|line| line.trim_end() == heading) else {
        let mut out = content.trim_end().to_string();
        out.push_str("\n\n");
        out.push_str(section);
        return out;
    };
    let end = lines[start + 1..]
        .iter()
        .position(|line| line.starts_with("## "))
        .map_or(lines.len(), |idx| start + 1 + idx);

    let mut out: Vec<String> = lines[..start].iter().map(|l| l.to_string()).collect();
    out.extend(section.lines().map(str::to_string));
    if end < lines.len() {
        out.push(String::new());
        out.extend(lines[end..].iter().map(|l| l.to_string()));
    }
    let mut joined = out.join("\n");
    joined.push('\n');
    joined
}

fn extract_endpoints(contents: &str) -> Vec<Endpoint> {
    let lines: Vec<&str> = contents.lines().collect();
    let mut endpoints = Vec::new();
    for (idx, line) in lines.iter().enumerate() {
        for caps in ROUTE_RE.captures_iter(line) {
            let path = caps[2].to_string();
            let params = ROUTE_PARAM_RE
                .captures_iter(&path)
                .map(|p| p[1].to_string())
                .collect();
            let previous = idx
                .checked_sub(1)
                .and_then(|prev| lines.get(prev))
                .map(|l| l.trim())
                .unwrap_or_default();
            endpoints.push(Endpoint {
                method: caps[1].to_uppercase(),
                path,
                params,
                auth: line.contains("auth") || previous.contains("auth"),
                description: comment_text(previous),
            });
        }
    }
    endpoints
}

/// Text of a single-line `//` or `/* */` comment.
fn comment_text(line: &str) -> Option<String> {
    let text = if let Some(rest) = line.strip_prefix("//") {
        rest
    } else if line.starts_with("/*") && line.ends_with("*/") {
        line.trim_start_matches('/')
            .trim_start_matches('*')
            .trim_end_matches('/')
            .trim_end_matches('*')
    } else {
        return None;
    };
    let text = text.trim();
    (!text.is_empty()).then(|| text.to_string())
}

fn api_markdown(sections: &[(String, Vec<Endpoint>)]) -> String {
    let mut doc = String::from(
        "# API Documentation\n\nGenerated from the route declarations in this project.\n\n",
    );
    for (name, endpoints) in sections {
        let _ = write!(doc, "## {name}\n\n");
        for endpoint in endpoints {
            let _ = write!(doc, "### {} {}\n\n", endpoint.method, endpoint.path);
            if let Some(description) = &endpoint.description {
                let _ = write!(doc, "{description}\n\n");
            }
            if !endpoint.params.is_empty() {
                doc.push_str("**Parameters:**\n");
                for param in &endpoint.params {
                    let _ = writeln!(doc, "- `{param}`");
                }
                doc.push('\n');
            }
            if endpoint.auth {
                doc.push_str("**Authentication:** required\n\n");
            }
            doc.push_str("---\n\n");
        }
    }
    doc
}

const CONTRIBUTING_GUIDE: &str = "# Contributing

## Workflow

1. Fork the repository
2. Create a feature branch (`git checkout -b feat/my-change`)
3. Commit with Conventional Commits (`git commit -m \"feat: add my change\"`)
4. Push the branch (`git push --set-upstream origin feat/my-change`)
5. Open a pull request

## Code Standards

- Run the project's linters and formatters before committing
- Add tests for new functionality
- Keep the documentation in step with the code

## Reporting Bugs

Open an issue with a clear description, steps to reproduce, the expected
behavior and your environment (OS, runtime versions).
";

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::TestRepo;

    fn agent(repo: &TestRepo) -> DocumentAgent {
        DocumentAgent::new(ProjectPaths::new(repo.path()))
    }

    fn day() -> NaiveDate {
        NaiveDate::from_ymd_opt(2026, 10, 19).expect("date")
    }

    #[test]
    fn changelog_groups_commits_since_last_tag() {
        let repo = TestRepo::new();
        repo.git(&["tag", "v0.1.0"]);
        repo.write("a.txt", "a\n");
        repo.commit_all("feat(api): add users endpoint");
        repo.write("b.txt", "b\n");
        repo.commit_all("fix: handle empty cart");
        repo.write("c.txt", "c\n");
        repo.commit_all("chore!: drop node 14");
        repo.write("d.txt", "d\n");
        repo.commit_all("random message");
        repo.write("package.json", r#"{"version": "1.2.0"}"#);

        let summary = agent(&repo)
            .update_changelog(day())
            .expect("changelog")
            .expect("entry written");
        assert_eq!(summary.version, "1.2.0");
        assert_eq!(summary.commits, 3);
        assert_eq!(summary.breaking_changes, 1);

        let changelog = repo.read("CHANGELOG.md");
        assert!(changelog.starts_with("# Changelog"));
        assert!(changelog.contains("## [1.2.0] - 2026-10-19"));
        assert!(changelog.contains("### Features\n- **api**: add users endpoint\n"));
        assert!(changelog.contains("### Bug Fixes\n- handle empty cart\n"));
        assert!(changelog.contains("### BREAKING CHANGES\n- drop node 14\n"));
        assert!(changelog.contains("### Work in Progress\n- 1 files with pending changes\n"));
        assert!(!changelog.contains("random message"));
    }

    #[test]
    fn new_entries_go_above_older_releases() {
        let existing = "# Changelog\n\nIntro.\n\n## [0.1.0] - 2026-01-01\n\n- old\n";
        let updated = insert_entry(existing, "## [0.2.0] - 2026-02-01\n\n");
        let new_pos = updated.find("[0.2.0]").expect("new");
        let old_pos = updated.find("[0.1.0]").expect("old");
        assert!(new_pos < old_pos);
        assert!(updated.starts_with("# Changelog\n\nIntro.\n\n## [0.2.0]"));
    }

    #[test]
    fn rerun_replaces_entry_for_same_version() {
        let repo = TestRepo::new();
        repo.git(&["tag", "v0.1.0"]);
        repo.write("package.json", r#"{"version": "1.2.0"}"#);
        repo.commit_all("feat: add cart");
        let docs = agent(&repo);
        docs.update_changelog(day()).expect("first").expect("entry");

        repo.commit_all("docs: changelog");
        repo.write("a.txt", "a\n");
        repo.commit_all("fix: rounding");
        docs.update_changelog(day()).expect("second").expect("entry");

        let changelog = repo.read("CHANGELOG.md");
        assert_eq!(changelog.matches("## [1.2.0]").count(), 1);
        assert!(changelog.contains("- add cart\n"));
        assert!(changelog.contains("### Bug Fixes\n- rounding\n"));
    }

    #[test]
    fn upsert_keeps_older_releases() {
        let existing = "# Changelog\n\n## [0.2.0] - 2026-02-01\n\n- stale\n\n## [0.1.0] - 2026-01-01\n\n- old\n";
        let updated = upsert_entry(existing, "0.2.0", "## [0.2.0] - 2026-03-01\n\n- fresh\n\n");
        assert_eq!(
            updated,
            "# Changelog\n\n## [0.2.0] - 2026-03-01\n\n- fresh\n\n## [0.1.0] - 2026-01-01\n\n- old\n"
        );
        let appended = upsert_entry(existing, "0.3.0", "## [0.3.0] - 2026-04-01\n\n");
        assert!(appended.starts_with("# Changelog\n\n## [0.3.0]"));
        assert!(appended.contains("- stale"));
    }

    #[test]
    fn version_falls_back_to_cargo_then_date() {
        let repo = TestRepo::new();
        let docs = agent(&repo);
        assert_eq!(docs.version(day()), "v2026-10-19");
        repo.write("Cargo.toml", "[package]\nname = \"x\"\nversion = \"0.3.1\"\n");
        assert_eq!(docs.version(day()), "0.3.1");
    }

    #[test]
    fn readme_install_section_is_replaced_once() {
        let repo = TestRepo::new();
        repo.write(
            "README.md",
            "# App\n\n## Installation\n\nold steps\n\n## Usage\n\nrun it\n",
        );
        repo.write("package.json", "{}");
        repo.write("pnpm-lock.yaml", "");
        let docs = agent(&repo);
        assert!(docs.update_readme().expect("readme"));
        let readme = repo.read("README.md");
        assert!(readme.contains("## Installation\n\n```bash\npnpm install\n```\n"));
        assert!(!readme.contains("old steps"));
        assert!(readme.contains("## Usage\n\nrun it"));
        assert!(!docs.update_readme().expect("second run"));
    }

    #[test]
    fn api_docs_list_express_routes() {
        let repo = TestRepo::new();
        repo.write(
            "routes/users.js",
            "// List users\nrouter.get('/users', handler);\nrouter.delete('/users/:id', authenticate, handler);\n",
        );
        let summary = agent(&repo)
            .update_api_docs()
            .expect("api docs")
            .expect("endpoints found");
        assert_eq!(summary.endpoints, 2);
        let doc = repo.read("docs/API.md");
        assert!(doc.contains("## users"));
        assert!(doc.contains("### GET /users\n\nList users\n"));
        assert!(doc.contains("### DELETE /users/:id"));
        assert!(doc.contains("- `id`"));
        assert!(doc.contains("**Authentication:** required"));
    }

    #[test]
    fn guides_are_created_only_when_missing() {
        let repo = TestRepo::new();
        repo.write(
            "package.json",
            r#"{"scripts": {"dev": "vite", "test": "jest"}}"#,
        );
        let mut docs = agent(&repo);
        let report = docs.execute().expect("document");
        assert_eq!(
            report.created,
            vec!["docs/QUICK_START.md", "docs/CONTRIBUTING.md"]
        );
        let quick_start = repo.read("docs/QUICK_START.md");
        assert!(quick_start.contains("npm run dev"));
        assert!(!quick_start.contains("npm run build"));

        let again = docs.execute().expect("second run");
        assert!(again.created.is_empty());
    }
}
