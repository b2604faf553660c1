//! E2E tests for the `mia-launcher` binary.
//!
//! Startup failures must end the process with a non-zero status and the
//! host error code on stderr, without leaving the backend behind.

mod common;

use common::{launcher_cmd, EPHEMERAL_GATEWAY};
use predicates::prelude::PredicateBooleanExt;
use predicates::str::contains;

#[test]
fn help_lists_flags() {
    let (mut cmd, _guard) = launcher_cmd(None);
    cmd.arg("--help")
        .assert()
        .success()
        .stdout(contains("--project"))
        .stdout(contains("--mode"))
        .stdout(contains("--log-file"));
}

#[test]
fn missing_backend_command_is_config_error() {
    let (mut cmd, _guard) = launcher_cmd(None);
    cmd.assert()
        .failure()
        .stderr(contains("HOST_CONFIG_INVALID"))
        .stderr(contains("backend.command"));
}

#[test]
fn malformed_project_config_is_reported() {
    let (mut cmd, _guard) = launcher_cmd(Some("[backend\n"));
    cmd.assert().failure().stderr(contains("Config error"));
}

#[test]
fn unknown_executable_is_spawn_failure() {
    let config = format!(
        "[backend]\ncommand = \"/nonexistent/mia-backend\"\nport = 1\n{EPHEMERAL_GATEWAY}"
    );
    let (mut cmd, _guard) = launcher_cmd(Some(&config));
    cmd.assert()
        .failure()
        .stderr(contains("HOST_SPAWN_FAILED"));
}

#[cfg(unix)]
#[test]
fn backend_exit_during_startup_fails_launch() {
    let config = format!(
        "[backend]\ncommand = \"sh\"\nargs = [\"-c\", \"exit 3\"]\nport = 1\n{EPHEMERAL_GATEWAY}"
    );
    let (mut cmd, _guard) = launcher_cmd(Some(&config));
    cmd.assert()
        .failure()
        .stderr(contains("HOST_EXITED_DURING_STARTUP"))
        .stdout(contains("ws://").not());
}

#[test]
fn log_file_flag_writes_launcher_log() {
    let (mut cmd, guard) = launcher_cmd(None);
    let logs = guard.path().join("logs");
    cmd.arg("--log-file").arg(&logs).assert().failure();

    let content = std::fs::read_to_string(logs.join("launcher.log")).expect("log file written");
    assert!(content.contains("MIA launcher"), "log: {content}");
}
