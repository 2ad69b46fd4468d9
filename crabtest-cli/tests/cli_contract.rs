//! Integration tests for core CLI contract behavior.

use {predicates::prelude::*, std::fs, tempfile::tempdir};

fn cli_cmd() -> assert_cmd::Command {
    assert_cmd::cargo::cargo_bin_cmd!("crabtest")
}

#[test]
fn help_exits_zero_and_writes_stdout_only() {
    let mut cmd = cli_cmd();
    cmd.arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("crabtest"))
        .stderr(predicate::str::is_empty());
}

#[test]
fn short_help_exits_zero_and_writes_stdout_only() {
    let mut cmd = cli_cmd();
    cmd.arg("-h")
        .assert()
        .success()
        .stdout(predicate::str::contains("crabtest"))
        .stderr(predicate::str::is_empty());
}

#[test]
fn version_exits_zero_and_writes_stdout_only() {
    let mut cmd = cli_cmd();
    cmd.arg("--version")
        .assert()
        .success()
        .stdout(predicate::str::contains("crabtest"))
        .stderr(predicate::str::is_empty());
}

#[test]
fn help_lists_all_subcommands() {
    let mut cmd = cli_cmd();
    cmd.arg("--help")
        .assert()
        .success()
        .stdout(
            predicate::str::contains("run")
                .and(predicate::str::contains("session"))
                .and(predicate::str::contains("list-ports"))
                .and(predicate::str::contains("completions")),
        );
}

#[test]
fn list_ports_json_returns_valid_json() {
    // In environments without serial ports this still exercises the JSON
    // output path with an empty array.
    let mut cmd = cli_cmd();
    let output = cmd
        .args(["list-ports", "--json"])
        .output()
        .expect("command should execute");

    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    let parsed: serde_json::Value =
        serde_json::from_str(&stdout).expect("stdout should be valid JSON");
    assert!(parsed.is_array(), "should be a JSON array");
}

#[test]
fn completions_bash_writes_script_to_stdout() {
    let mut cmd = cli_cmd();
    cmd.args(["completions", "bash"])
        .assert()
        .success()
        .stdout(predicate::str::contains("crabtest"));
}

// ============================================================================
// Exit Code Tests
// ============================================================================

/// Exit code 0: successful operations that require no hardware.
#[test]
fn exit_code_zero_on_success() {
    let mut cmd = cli_cmd();
    cmd.arg("--help").assert().success().code(0);

    let mut cmd = cli_cmd();
    cmd.arg("--version").assert().success().code(0);

    let mut cmd = cli_cmd();
    cmd.args(["completions", "zsh"]).assert().success().code(0);
}

/// Exit code 2: usage error (unknown command, invalid arguments).
#[test]
fn exit_code_two_for_usage_error_unknown_command() {
    let mut cmd = cli_cmd();
    cmd.arg("unknown-command-xyz")
        .assert()
        .failure()
        .code(2);
}

#[test]
fn exit_code_two_for_usage_error_invalid_flag() {
    let mut cmd = cli_cmd();
    cmd.arg("--invalid-flag-xyz").assert().failure().code(2);
}

#[test]
fn missing_subcommand_is_a_usage_error() {
    let mut cmd = cli_cmd();
    cmd.assert().failure().code(2);
}

/// A malformed config file warns but never aborts a command that does not
/// need it.
#[test]
fn malformed_local_config_warns_and_continues() {
    let dir = tempdir().expect("tempdir should be created");
    let config = dir.path().join("crabtest.toml");
    fs::write(&config, "log_dir = [[[not toml").expect("write invalid config");

    let mut cmd = cli_cmd();
    let output = cmd
        .current_dir(dir.path())
        .args(["list-ports", "--json"])
        .output()
        .expect("command should execute");

    assert!(
        output.status.success(),
        "command should succeed despite config warning"
    );
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(
        stderr.contains("parse"),
        "should warn about the unparsable config: {stderr}"
    );
}

/// An explicit --config path that does not exist also degrades to defaults.
#[test]
fn missing_explicit_config_warns_and_continues() {
    let mut cmd = cli_cmd();
    cmd.args([
        "--config",
        "/nonexistent/crabtest-config.toml",
        "list-ports",
        "--json",
    ])
    .assert()
    .success()
    .stderr(predicate::str::contains("defaults"));
}
