//! Git adapter for workflow steps.
//!
//! Every call runs `git` directly with an argument vector in the project
//! root; nothing is interpreted by a shell.

use std::path::PathBuf;
use std::process::{Command, Output};

use anyhow::{Context, Result, anyhow};
use tracing::{debug, instrument, warn};

/// Parsed `git status --porcelain` entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusEntry {
    /// 2-letter XY code, or "??" for untracked.
    pub code: String,
    /// Path for the changed file.
    pub path: String,
}

/// Totals from `git diff --shortstat`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ShortStat {
    pub files_changed: u32,
    pub insertions: u32,
    pub deletions: u32,
}

/// A commit subject/body pair from `git log`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogEntry {
    pub sha: String,
    pub message: String,
}

const LOG_RECORD_SEP: &str = "\u{1e}";
const LOG_FIELD_SEP: &str = "\u{1f}";

/// Wrapper for executing git commands in a working directory.
#[derive(Debug, Clone)]
pub struct Git {
    workdir: PathBuf,
}

impl Git {
    pub fn new(workdir: impl Into<PathBuf>) -> Self {
        Self {
            workdir: workdir.into(),
        }
    }

    /// True when the workdir is inside a git work tree.
    pub fn is_repo(&self) -> bool {
        self.run(&["rev-parse", "--is-inside-work-tree"])
            .map(|out| out.status.success())
            .unwrap_or(false)
    }

    /// Return the current branch name (errors on detached HEAD).
    #[instrument(skip_all)]
    pub fn current_branch(&self) -> Result<String> {
        let out = self.run_capture(&["rev-parse", "--abbrev-ref", "HEAD"])?;
        let name = out.trim().to_string();
        if name == "HEAD" {
            warn!("detached HEAD detected");
            return Err(anyhow!("detached HEAD (refuse to run)"));
        }
        debug!(branch = %name, "current branch");
        Ok(name)
    }

    /// Return the current HEAD short SHA.
    pub fn head_short_sha(&self, len: usize) -> Result<String> {
        let arg = format!("--short={len}");
        let out = self.run_capture(&["rev-parse", &arg, "HEAD"])?;
        Ok(out.trim().to_string())
    }

    /// Get status entries (including untracked) in porcelain format.
    pub fn status_porcelain(&self) -> Result<Vec<StatusEntry>> {
        let out = self.run_capture(&["status", "--porcelain=v1", "-uall"])?;
        parse_status(&out)
    }

    /// Ensure the worktree is clean, allowing entries with any of the given prefixes.
    #[instrument(skip_all)]
    pub fn ensure_clean_except_prefixes(&self, allowed_prefixes: &[&str]) -> Result<()> {
        let entries = self.status_porcelain()?;
        let disallowed: Vec<StatusEntry> = entries
            .into_iter()
            .filter(|entry| {
                !allowed_prefixes
                    .iter()
                    .any(|prefix| entry.path.starts_with(prefix))
            })
            .collect();
        if disallowed.is_empty() {
            debug!("worktree is clean");
            return Ok(());
        }
        warn!(disallowed_count = disallowed.len(), "worktree not clean");
        let mut msg = String::from("working tree has uncommitted changes; commit or stash them first:\n");
        for entry in disallowed {
            msg.push_str(&format!("{} {}\n", entry.code, entry.path));
        }
        Err(anyhow!(msg.trim_end().to_string()))
    }

    /// Check whether a local branch exists.
    pub fn branch_exists(&self, branch: &str) -> Result<bool> {
        let status = self
            .run(&[
                "show-ref",
                "--verify",
                "--quiet",
                &format!("refs/heads/{branch}"),
            ])?
            .status;
        Ok(status.success())
    }

    /// Create and checkout a new branch at current HEAD.
    #[instrument(skip_all, fields(branch))]
    pub fn checkout_new_branch(&self, branch: &str) -> Result<()> {
        debug!(branch, "creating and checking out new branch");
        self.run_checked(&["checkout", "-b", branch])?;
        Ok(())
    }

    /// Checkout an existing branch.
    #[instrument(skip_all, fields(branch))]
    pub fn checkout_branch(&self, branch: &str) -> Result<()> {
        debug!(branch, "checking out branch");
        self.run_checked(&["checkout", branch])?;
        Ok(())
    }

    /// Stage all changes (respects .gitignore).
    pub fn add_all(&self) -> Result<()> {
        self.run_checked(&["add", "-A"])?;
        Ok(())
    }

    /// True if there is anything staged for commit.
    pub fn has_staged_changes(&self) -> Result<bool> {
        let out = self.run(&["diff", "--cached", "--name-only"])?;
        Ok(!String::from_utf8_lossy(&out.stdout).trim().is_empty())
    }

    /// Commit staged changes with a message.
    ///
    /// If there are no staged changes, this returns Ok(false) and does nothing.
    #[instrument(skip_all)]
    pub fn commit_staged(&self, message: &str) -> Result<bool> {
        if !self.has_staged_changes()? {
            debug!("no staged changes, skipping commit");
            return Ok(false);
        }
        debug!("committing staged changes");
        self.run_checked(&["commit", "-m", message])?;
        Ok(true)
    }

    /// Unstage everything and discard tracked worktree edits.
    #[instrument(skip_all)]
    pub fn restore_all(&self) -> Result<()> {
        self.restore_staged()?;
        self.run_checked(&["restore", "."])?;
        Ok(())
    }

    /// Unstage everything, keeping worktree edits.
    pub fn restore_staged(&self) -> Result<()> {
        self.run_checked(&["restore", "--staged", "."])?;
        Ok(())
    }

    /// Delete untracked files by path (files created by a failed step).
    pub fn clean_paths(&self, paths: &[String]) -> Result<()> {
        if paths.is_empty() {
            return Ok(());
        }
        let mut args = vec!["clean", "-f", "--"];
        args.extend(paths.iter().map(String::as_str));
        self.run_checked(&args)?;
        Ok(())
    }

    /// Totals for the worktree diff against HEAD (`staged` selects the index instead).
    pub fn diff_shortstat(&self, staged: bool) -> Result<ShortStat> {
        let args: &[&str] = if staged {
            &["diff", "--cached", "--shortstat"]
        } else {
            &["diff", "--shortstat"]
        };
        let out = self.run_capture(args)?;
        Ok(parse_shortstat(&out))
    }

    /// Most recent tag reachable from HEAD, if any.
    pub fn last_tag(&self) -> Result<Option<String>> {
        let out = self.run(&["describe", "--tags", "--abbrev=0"])?;
        if !out.status.success() {
            return Ok(None);
        }
        let tag = String::from_utf8_lossy(&out.stdout).trim().to_string();
        Ok((!tag.is_empty()).then_some(tag))
    }

    /// Commits after `since` (exclusive), or the newest `limit` commits.
    pub fn log(&self, since: Option<&str>, limit: usize) -> Result<Vec<LogEntry>> {
        let format = format!("--format=%h{LOG_FIELD_SEP}%B{LOG_RECORD_SEP}");
        let range;
        let limit_arg = format!("-{limit}");
        let mut args = vec!["log", format.as_str()];
        match since {
            Some(tag) => {
                range = format!("{tag}..HEAD");
                args.push(range.as_str());
            }
            None => args.push(limit_arg.as_str()),
        }
        let out = self.run(&args)?;
        if !out.status.success() {
            // Fresh repository without commits.
            return Ok(Vec::new());
        }
        Ok(parse_log(&String::from_utf8_lossy(&out.stdout)))
    }

    /// Run arbitrary git arguments and return the raw output without checking status.
    #[instrument(skip_all, fields(args = %args.join(" ")))]
    pub fn run_args(&self, args: &[String]) -> Result<Output> {
        let refs: Vec<&str> = args.iter().map(String::as_str).collect();
        self.run(&refs)
    }

    fn run_capture(&self, args: &[&str]) -> Result<String> {
        let output = self.run_checked(args)?;
        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }

    fn run_checked(&self, args: &[&str]) -> Result<Output> {
        let output = self.run(args)?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(anyhow!("git {} failed: {}", args.join(" "), stderr.trim()));
        }
        Ok(output)
    }

    fn run(&self, args: &[&str]) -> Result<Output> {
        Command::new("git")
            .args(args)
            .current_dir(&self.workdir)
            .output()
            .with_context(|| format!("spawn git {}", args.join(" ")))
    }
}

/// Parse full `git status --porcelain` output.
pub fn parse_status(out: &str) -> Result<Vec<StatusEntry>> {
    out.lines()
        .filter(|line| !line.trim().is_empty())
        .map(parse_status_line)
        .collect()
}

fn parse_status_line(line: &str) -> Result<StatusEntry> {
    if let Some(path) = line.strip_prefix("?? ") {
        return Ok(StatusEntry {
            code: "??".to_string(),
            path: path.trim().to_string(),
        });
    }
    if line.len() < 4 {
        return Err(anyhow!("unexpected porcelain line: '{line}'"));
    }
    let code = line[..2].to_string();
    let mut path = line[3..].trim().to_string();
    if let Some((_, new)) = path.split_once("->") {
        path = new.trim().to_string();
    }
    Ok(StatusEntry { code, path })
}

/// Parse ` 3 files changed, 10 insertions(+), 2 deletions(-)`.
pub fn parse_shortstat(out: &str) -> ShortStat {
    let mut stat = ShortStat::default();
    for part in out.trim().split(',') {
        let part = part.trim();
        let Some((count, label)) = part.split_once(' ') else {
            continue;
        };
        let Ok(count) = count.parse::<u32>() else {
            continue;
        };
        if label.starts_with("file") {
            stat.files_changed = count;
        } else if label.starts_with("insertion") {
            stat.insertions = count;
        } else if label.starts_with("deletion") {
            stat.deletions = count;
        }
    }
    stat
}

fn parse_log(out: &str) -> Vec<LogEntry> {
    out.split(LOG_RECORD_SEP)
        .filter_map(|record| {
            let record = record.trim_start_matches('\n');
            let (sha, message) = record.split_once(LOG_FIELD_SEP)?;
            let message = message.trim();
            if sha.is_empty() || message.is_empty() {
                return None;
            }
            Some(LogEntry {
                sha: sha.trim().to_string(),
                message: message.to_string(),
            })
        })
        .collect()
}
