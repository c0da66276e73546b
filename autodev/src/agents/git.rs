//! Git agent: policy-checked git commands with structured results.

use anyhow::{Context, Result, anyhow, bail};
use tracing::{debug, info, instrument, warn};

use super::GitStep;
use super::security::SecurityGateAgent;
use crate::core::args::split_args;
use crate::core::commit_msg::lint_commit_message;
use crate::core::gates::OperationContext;
use crate::core::reports::{FileChange, GitChanges, GitReport};
use crate::io::git::{Git, StatusEntry};
use crate::io::paths::ProjectPaths;

/// Always routed through the security gate.
const DENY_LIST: &[&str] = &[
    "push origin main",
    "push origin master",
    "reset --hard",
    "rebase -i",
    "force-push",
    "push --force",
];

/// Prefixes that run without approval (subject to the push rule).
const ALLOW_LIST: &[&str] = &[
    "status",
    "add -A",
    "commit -m",
    "push --set-upstream origin feat/",
    "restore --staged .",
    "diff",
    "log",
    "branch",
    "checkout -b",
];

pub struct GitAgent {
    git: Git,
}

impl GitAgent {
    pub fn new(paths: ProjectPaths) -> Self {
        Self {
            git: Git::new(paths.root),
        }
    }

    fn status_changes(&self) -> Result<GitChanges> {
        let entries = self.git.status_porcelain()?;
        Ok(GitChanges {
            files_changed: count(entries.len()),
            entries: entries.into_iter().map(file_change).collect(),
            branch: self.git.current_branch().ok(),
            ..GitChanges::default()
        })
    }

    fn staged_changes(&self) -> Result<GitChanges> {
        let staged: Vec<StatusEntry> = self
            .git
            .status_porcelain()?
            .into_iter()
            .filter(|entry| is_staged(&entry.code))
            .collect();
        let stat = self.git.diff_shortstat(true)?;
        Ok(GitChanges {
            entries: staged.into_iter().map(file_change).collect(),
            files_changed: stat.files_changed,
            insertions: stat.insertions,
            deletions: stat.deletions,
            ..GitChanges::default()
        })
    }

    fn diff_changes(&self) -> Result<GitChanges> {
        let stat = self.git.diff_shortstat(false)?;
        Ok(GitChanges {
            files_changed: stat.files_changed,
            insertions: stat.insertions,
            deletions: stat.deletions,
            ..GitChanges::default()
        })
    }

    fn head_changes(&self) -> GitChanges {
        GitChanges {
            branch: self.git.current_branch().ok(),
            commit: self.git.head_short_sha(7).ok(),
            ..GitChanges::default()
        }
    }

    fn commit_all(&self, message: &str, warnings: Vec<String>) -> Result<GitReport> {
        self.git.add_all()?;
        let staged = self.staged_changes()?;
        let committed = self.git.commit_staged(message)?;
        let changes = if committed {
            GitChanges {
                entries: staged.entries,
                files_changed: staged.files_changed,
                insertions: staged.insertions,
                deletions: staged.deletions,
                ..self.head_changes()
            }
        } else {
            GitChanges {
                branch: self.git.current_branch().ok(),
                ..GitChanges::default()
            }
        };
        let output = if committed {
            format!("committed {} files", changes.files_changed)
        } else {
            "nothing to commit".to_string()
        };
        Ok(GitReport {
            command: "commit".to_string(),
            args: vec!["commit".to_string(), "-m".to_string(), message.to_string()],
            output,
            success: true,
            changes: Some(changes),
            warnings,
        })
    }

    /// Structured extras for the commands that have them.
    fn changes_for(&self, args: &[String]) -> Result<Option<GitChanges>> {
        let changes = match args.first().map(String::as_str) {
            Some("status") => Some(self.status_changes()?),
            Some("diff") => Some(self.diff_changes()?),
            Some("add") => Some(self.staged_changes()?),
            Some("commit" | "push") => Some(self.head_changes()),
            _ => None,
        };
        Ok(changes)
    }
}

impl GitStep for GitAgent {
    #[instrument(skip_all, fields(command = %command))]
    fn execute(&mut self, command: &str, gate: &mut SecurityGateAgent) -> Result<GitReport> {
        let mut args = split_args(command)?;
        if args.first().is_some_and(|first| first == "git") {
            args.remove(0);
        }
        if args.is_empty() {
            bail!("empty git command");
        }
        let joined = args.join(" ");
        let operation = format!("git {joined}");

        let ctx = OperationContext {
            policy_reason: policy_reason(&args, &joined),
            ..OperationContext::default()
        };
        if let Some(reason) = &ctx.policy_reason {
            debug!(reason = %reason, "git command flagged by policy");
        }
        gate.validate_operation(&operation, &ctx)?
            .ensure_approved(&operation)?;

        let warnings = if args[0] == "commit" {
            commit_message(&args)
                .map(|message| lint_commit_message(&message))
                .unwrap_or_default()
        } else {
            Vec::new()
        };
        for warning in &warnings {
            warn!(warning = %warning, "commit message check");
        }

        let output = self.git.run_args(&args)?;
        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        let stderr = String::from_utf8_lossy(&output.stderr).into_owned();
        if !output.status.success() {
            return Err(anyhow!("{operation} failed: {}", stderr.trim()));
        }
        info!(command = %operation, "git command succeeded");

        let mut text = stdout;
        if !stderr.trim().is_empty() {
            text.push_str(&stderr);
        }
        Ok(GitReport {
            command: args[0].clone(),
            changes: self.changes_for(&args)?,
            args,
            output: text,
            success: true,
            warnings,
        })
    }

    #[instrument(skip_all)]
    fn commit_flow(&mut self, message: &str, gate: &mut SecurityGateAgent) -> Result<GitReport> {
        let operation = format!("git commit -m \"{message}\"");
        gate.validate_operation(&operation, &OperationContext::default())?
            .ensure_approved(&operation)?;
        let warnings = lint_commit_message(message);

        let result = self.commit_all(message, warnings);
        if result.is_err() {
            warn!("commit flow failed, unstaging changes");
            if let Err(err) = self.git.restore_staged() {
                warn!(err = %format!("{err:#}"), "restore after failed commit failed");
            }
        }
        result.context("commit flow")
    }
}

/// Why a command must be approved even without a gate pattern hit.
fn policy_reason(args: &[String], joined: &str) -> Option<String> {
    if let Some(denied) = DENY_LIST.iter().find(|p| joined.contains(*p)) {
        return Some(format!("Dangerous git command: {denied}"));
    }
    if !ALLOW_LIST.iter().any(|p| joined.starts_with(p)) {
        return Some("Git command is not in the allow-list".to_string());
    }
    if args[0] == "push" && !joined.contains("feat/") {
        return Some("Push to a branch other than feat/*".to_string());
    }
    None
}

/// The argument following `-m`, if any.
fn commit_message(args: &[String]) -> Option<String> {
    let idx = args.iter().position(|arg| arg == "-m")?;
    args.get(idx + 1).cloned()
}

fn is_staged(code: &str) -> bool {
    let index = code.chars().next().unwrap_or(' ');
    index != ' ' && index != '?'
}

fn file_change(entry: StatusEntry) -> FileChange {
    FileChange {
        code: entry.code,
        path: entry.path,
    }
}

fn count(n: usize) -> u32 {
    u32::try_from(n).unwrap_or(u32::MAX)
}
