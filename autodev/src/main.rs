//! `/sc:` command line for the autonomous development workflow.
//!
//! Runs one command against the project in `--root` (default: the current
//! directory) and prints its result as JSON on stdout.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;

use autodev::command::{HELP, SlashCommand};
use autodev::exit_codes;
use autodev::io::approval::{ApprovalProvider, DenyAll, StdinApprovals};
use autodev::io::config::load_config;
use autodev::io::paths::ProjectPaths;
use autodev::orchestrator::Orchestrator;

#[derive(Parser)]
#[command(
    name = "autodev",
    version,
    about = "Budgeted, approval-gated development workflow",
    disable_help_subcommand = true
)]
struct Cli {
    /// Project directory to operate on.
    #[arg(long)]
    root: Option<PathBuf>,

    /// Reject every security approval instead of prompting on stdin.
    #[arg(long)]
    non_interactive: bool,

    /// `/sc:` command, e.g. `/sc:improve`.
    command: Option<String>,

    /// Command arguments, joined with spaces.
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    args: Vec<String>,
}

fn main() {
    autodev::logging::init();
    let cli = Cli::parse();

    let Some(name) = cli.command.as_deref() else {
        println!("{HELP}");
        std::process::exit(exit_codes::OK);
    };
    let command = match SlashCommand::parse(name, &cli.args) {
        Ok(command) => command,
        Err(err) => {
            eprintln!("error: {err}\n\n{HELP}");
            std::process::exit(exit_codes::USAGE);
        }
    };

    if let Err(err) = run(&cli, command) {
        eprintln!("error: {err:#}");
        eprintln!("{err:?}");
        std::process::exit(exit_codes::FAILURE);
    }
}

fn run(cli: &Cli, command: SlashCommand) -> Result<()> {
    let root = match &cli.root {
        Some(root) => root.clone(),
        None => std::env::current_dir().context("resolve current directory")?,
    };
    let paths = ProjectPaths::new(&root);
    let cfg = load_config(&paths.config_path)?;
    let approvals: Box<dyn ApprovalProvider> = if cli.non_interactive {
        Box::new(DenyAll)
    } else {
        Box::new(StdinApprovals)
    };

    let mut orchestrator = Orchestrator::new(&paths, cfg, approvals)?;
    let output = orchestrator.execute(command)?;
    let json = serde_json::to_string_pretty(&output).context("serialize command output")?;
    println!("{json}");
    Ok(())
}
