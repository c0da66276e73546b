//! Approval providers for security gates.
//!
//! The [`ApprovalProvider`] trait decouples the security agent from the
//! terminal. Tests use scripted providers that return predetermined answers.

use std::io::{BufRead, Write};

use anyhow::{Context, Result, anyhow};
use tracing::debug;

/// Source of yes/no answers to approval prompts.
pub trait ApprovalProvider {
    /// Show `prompt` and return the raw answer.
    fn ask(&mut self, prompt: &str) -> Result<String>;
}

/// Only `y` / `yes` (any case, surrounding whitespace ignored) approve.
pub fn is_affirmative(answer: &str) -> bool {
    let answer = answer.trim();
    answer.eq_ignore_ascii_case("y") || answer.eq_ignore_ascii_case("yes")
}

/// Prompts on stderr and reads one line from stdin. Blocks until answered.
#[derive(Debug, Default)]
pub struct StdinApprovals;

impl ApprovalProvider for StdinApprovals {
    fn ask(&mut self, prompt: &str) -> Result<String> {
        let mut stderr = std::io::stderr();
        stderr
            .write_all(prompt.as_bytes())
            .context("write approval prompt")?;
        stderr.flush().context("flush approval prompt")?;

        let mut line = String::new();
        let read = std::io::stdin()
            .lock()
            .read_line(&mut line)
            .context("read approval answer")?;
        if read == 0 {
            return Err(anyhow!("stdin closed while waiting for approval"));
        }
        debug!(answer = %line.trim(), "approval answer received");
        Ok(line)
    }
}

/// Denies everything without prompting (non-interactive sessions).
#[derive(Debug, Default)]
pub struct DenyAll;

impl ApprovalProvider for DenyAll {
    fn ask(&mut self, _prompt: &str) -> Result<String> {
        Ok("n".to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_yes_variants_are_affirmative() {
        for answer in ["y", "Y", "yes", " YES\n", "Yes"] {
            assert!(is_affirmative(answer), "{answer:?}");
        }
        for answer in ["", "n", "no", "yep", "sure", "y e s"] {
            assert!(!is_affirmative(answer), "{answer:?}");
        }
    }

    #[test]
    fn deny_all_answers_no() {
        let answer = DenyAll.ask("approve?").expect("ask");
        assert!(!is_affirmative(&answer));
    }
}
