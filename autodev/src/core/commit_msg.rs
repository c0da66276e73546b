//! Commit message conventions. Violations are warnings, never errors.

use std::sync::LazyLock;

use regex::Regex;

static CONVENTIONAL_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(feat|fix|docs|style|refactor|perf|test|chore)(\(.+\))?!?: .+$")
        .expect("valid regex")
});

pub const MAX_SUBJECT_LEN: usize = 72;

/// A parsed conventional commit subject line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConventionalCommit {
    pub kind: String,
    pub scope: Option<String>,
    pub description: String,
    pub breaking: bool,
}

static PARSE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(\w+)(?:\(([^)]+)\))?(!)?:\s*(.+)$").expect("valid regex")
});

/// Parse `type(scope)!: description`; `BREAKING CHANGE` in the body also marks breaking.
pub fn parse_conventional(message: &str) -> Option<ConventionalCommit> {
    let subject = message.lines().next()?.trim();
    let caps = PARSE_RE.captures(subject)?;
    Some(ConventionalCommit {
        kind: caps[1].to_lowercase(),
        scope: caps.get(2).map(|m| m.as_str().to_string()),
        description: caps[4].trim().to_string(),
        breaking: caps.get(3).is_some() || message.contains("BREAKING CHANGE"),
    })
}

/// Style warnings for a commit message.
pub fn lint_commit_message(message: &str) -> Vec<String> {
    let mut warnings = Vec::new();
    let subject = message.lines().next().unwrap_or("").trim();
    if !CONVENTIONAL_RE.is_match(subject) {
        warnings.push(
            "commit message does not follow Conventional Commits (type(scope): description)"
                .to_string(),
        );
    }
    let len = subject.chars().count();
    if len > MAX_SUBJECT_LEN {
        warnings.push(format!(
            "commit subject is {len} characters (max {MAX_SUBJECT_LEN})"
        ));
    }
    let upper = message.to_uppercase();
    if upper.contains("WIP") || upper.contains("TODO") {
        warnings.push("commit message contains WIP/TODO marker".to_string());
    }
    warnings
}
