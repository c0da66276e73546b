//! The `/sc:` command surface.

use std::fmt;

pub const PREFIX: &str = "/sc:";
pub const DEFAULT_OBJECTIVE: &str = "general improvements";

pub const HELP: &str = "\
Usage: autodev [--root <dir>] <command> [args...]

Commands:
  /sc:analyze                   Analyze the repository and write report/analyze.json
  /sc:improve \"<objective>\"     Plan, improve and test in budgeted iterations
  /sc:test                      Run the test suite with coverage tracking
  /sc:document                  Update CHANGELOG.md and documentation
  /sc:git \"<command>\"           Run a policy-checked git command
  /sc:troubleshoot \"<hint>\"     Diagnose problems and write recommendations
  /sc:workflow \"<objective>\"    analyze, improve, document, commit and push
  /sc:status                    Budget status and state pattern analysis
  /sc:reset                     Reset budget and workflow state

Reports are written to report/ and the workflow state to STATE.md.
Settings are read from autodev.toml when present.";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SlashCommand {
    Analyze,
    Improve { objective: String },
    Test,
    Document,
    Git { command: String },
    Troubleshoot { hint: String },
    Workflow { objective: String },
    Status,
    Reset,
}

impl SlashCommand {
    /// Parse `command` plus its trailing arguments (joined with spaces).
    pub fn parse(command: &str, args: &[String]) -> Result<Self, CommandError> {
        let Some(name) = command.strip_prefix(PREFIX) else {
            return Err(CommandError::MissingPrefix(command.to_string()));
        };
        let rest = args.join(" ").trim().to_string();
        let objective = || {
            if rest.is_empty() {
                DEFAULT_OBJECTIVE.to_string()
            } else {
                rest.clone()
            }
        };
        let parsed = match name {
            "analyze" => SlashCommand::Analyze,
            "improve" => SlashCommand::Improve {
                objective: objective(),
            },
            "test" => SlashCommand::Test,
            "document" => SlashCommand::Document,
            "git" => SlashCommand::Git {
                command: rest.clone(),
            },
            "troubleshoot" => SlashCommand::Troubleshoot { hint: rest.clone() },
            "workflow" => SlashCommand::Workflow {
                objective: objective(),
            },
            "status" => SlashCommand::Status,
            "reset" => SlashCommand::Reset,
            other => return Err(CommandError::Unknown(other.to_string())),
        };
        Ok(parsed)
    }

    pub fn name(&self) -> &'static str {
        match self {
            SlashCommand::Analyze => "analyze",
            SlashCommand::Improve { .. } => "improve",
            SlashCommand::Test => "test",
            SlashCommand::Document => "document",
            SlashCommand::Git { .. } => "git",
            SlashCommand::Troubleshoot { .. } => "troubleshoot",
            SlashCommand::Workflow { .. } => "workflow",
            SlashCommand::Status => "status",
            SlashCommand::Reset => "reset",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandError {
    MissingPrefix(String),
    Unknown(String),
}

impl fmt::Display for CommandError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CommandError::MissingPrefix(command) => {
                write!(f, "commands must start with {PREFIX} (got '{command}')")
            }
            CommandError::Unknown(name) => write!(f, "unknown command '{PREFIX}{name}'"),
        }
    }
}

impl std::error::Error for CommandError {}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn improve_defaults_objective_and_joins_args() {
        assert_eq!(
            SlashCommand::parse("/sc:improve", &[]),
            Ok(SlashCommand::Improve {
                objective: DEFAULT_OBJECTIVE.to_string()
            })
        );
        assert_eq!(
            SlashCommand::parse("/sc:improve", &args(&["error", "handling"])),
            Ok(SlashCommand::Improve {
                objective: "error handling".to_string()
            })
        );
    }

    #[test]
    fn git_and_troubleshoot_keep_raw_text() {
        assert_eq!(
            SlashCommand::parse("/sc:git", &args(&["commit -m \"feat: x\""])),
            Ok(SlashCommand::Git {
                command: "commit -m \"feat: x\"".to_string()
            })
        );
        assert_eq!(
            SlashCommand::parse("/sc:troubleshoot", &[]),
            Ok(SlashCommand::Troubleshoot {
                hint: String::new()
            })
        );
    }

    #[test]
    fn prefix_and_name_are_required() {
        assert_eq!(
            SlashCommand::parse("analyze", &[]),
            Err(CommandError::MissingPrefix("analyze".to_string()))
        );
        assert_eq!(
            SlashCommand::parse("/sc:deploy", &[]),
            Err(CommandError::Unknown("deploy".to_string()))
        );
        assert_eq!(SlashCommand::parse("/sc:status", &[]), Ok(SlashCommand::Status));
    }
}
