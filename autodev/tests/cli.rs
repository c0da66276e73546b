//! CLI tests for the `/sc:` command surface.
//!
//! Spawns the autodev binary and checks exit codes, stdout JSON, and the
//! artifacts written under the project root.

use std::fs;
use std::process::{Command, Output};

use autodev::exit_codes;
use serde_json::Value;

fn autodev(root: &std::path::Path, args: &[&str]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_autodev"))
        .arg("--root")
        .arg(root)
        .arg("--non-interactive")
        .args(args)
        .env("RUST_LOG", "off")
        .output()
        .expect("spawn autodev")
}

fn stdout_json(output: &Output) -> Value {
    serde_json::from_slice(&output.stdout).expect("stdout is JSON")
}

#[test]
fn no_command_prints_help() {
    let temp = tempfile::tempdir().expect("tempdir");
    let output = autodev(temp.path(), &[]);
    assert_eq!(output.status.code(), Some(exit_codes::OK));
    assert!(String::from_utf8_lossy(&output.stdout).contains("/sc:workflow"));
}

#[test]
fn unknown_or_unprefixed_command_is_usage_error() {
    let temp = tempfile::tempdir().expect("tempdir");
    for command in ["/sc:deploy", "analyze"] {
        let output = autodev(temp.path(), &[command]);
        assert_eq!(output.status.code(), Some(exit_codes::USAGE), "{command}");
        assert!(String::from_utf8_lossy(&output.stderr).contains("Usage:"));
    }
    assert!(!temp.path().join("report").exists());
}

#[test]
fn status_prints_fresh_session() {
    let temp = tempfile::tempdir().expect("tempdir");
    let output = autodev(temp.path(), &["/sc:status"]);
    assert_eq!(output.status.code(), Some(exit_codes::OK));

    let json = stdout_json(&output);
    assert_eq!(json["state"], "IDLE");
    assert_eq!(json["budget"]["can_proceed"], true);
    assert_eq!(json["budget"]["consumed"]["iterations"], 0);
}

#[test]
fn analyze_writes_report_and_state() {
    let temp = tempfile::tempdir().expect("tempdir");
    fs::create_dir_all(temp.path().join("src")).expect("mkdir");
    fs::write(
        temp.path().join("src/app.js"),
        "// TODO: split this module\nexport const answer = 42;\n",
    )
    .expect("write source");

    let output = autodev(temp.path(), &["/sc:analyze"]);
    assert_eq!(
        output.status.code(),
        Some(exit_codes::OK),
        "stderr: {}",
        String::from_utf8_lossy(&output.stderr)
    );
    assert_eq!(stdout_json(&output)["success"], true);

    let report = fs::read_to_string(temp.path().join("report/analyze.json")).expect("report");
    assert!(report.contains("src/app.js"));
    let state = fs::read_to_string(temp.path().join("STATE.md")).expect("STATE.md");
    assert!(state.contains("IDLE"));
}

#[test]
fn rejected_git_command_fails_with_chain() {
    let temp = tempfile::tempdir().expect("tempdir");
    let output = autodev(temp.path(), &["/sc:git", "push", "origin", "main"]);
    assert_eq!(output.status.code(), Some(exit_codes::FAILURE));
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("error:"));
    assert!(stderr.contains("security approval rejected"));

    let state = fs::read_to_string(temp.path().join("report/state.json")).expect("state");
    let snapshot: Value = serde_json::from_str(&state).expect("state json");
    assert_eq!(snapshot["current_state"], "STOP");
}

#[test]
fn invalid_config_is_fatal() {
    let temp = tempfile::tempdir().expect("tempdir");
    fs::write(
        temp.path().join("autodev.toml"),
        "[budget]\nmax_iterations = 0\n",
    )
    .expect("write config");
    let output = autodev(temp.path(), &["/sc:status"]);
    assert_eq!(output.status.code(), Some(exit_codes::FAILURE));
    assert!(String::from_utf8_lossy(&output.stderr).contains("max_iterations"));
}
