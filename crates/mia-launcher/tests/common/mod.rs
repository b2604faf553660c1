//! Shared E2E test helpers for `mia-launcher` binary tests.

#![allow(dead_code)]

use assert_cmd::cargo::cargo_bin_cmd;
use std::path::Path;
use std::time::Duration;

/// Default timeout for launcher runs.
pub const TIMEOUT: Duration = Duration::from_secs(10);

/// Environment overrides that would leak host settings into a test run.
const HOST_VARS: &[&str] = &[
    "MIA_DEBUG",
    "MIA_BACKEND_COMMAND",
    "MIA_BACKEND_MODE",
    "MIA_BACKEND_PORT",
    "MIA_HEALTH_DEADLINE_MS",
    "MIA_SHUTDOWN_DEADLINE_MS",
];

/// Gateway section binding every channel to an ephemeral port.
pub const EPHEMERAL_GATEWAY: &str = r#"
[gateway]
request_addr = "127.0.0.1:0"
pubsub_addr = "127.0.0.1:0"
duplex_addr = "127.0.0.1:0"
"#;

/// Builds a launcher command over a fresh project directory.
///
/// `project_toml` becomes `<project>/.mia/host.toml` when given. The global
/// config points at a missing file so the user's own config never applies.
/// Returns (command, _guard); keep the guard alive for the test's duration.
pub fn launcher_cmd(project_toml: Option<&str>) -> (assert_cmd::Command, tempfile::TempDir) {
    let tmp = tempfile::tempdir().expect("create temp project dir");
    if let Some(toml) = project_toml {
        write_project_config(tmp.path(), toml);
    }

    let mut cmd: assert_cmd::Command = cargo_bin_cmd!("mia-launcher");
    cmd.timeout(TIMEOUT);
    for var in HOST_VARS {
        cmd.env_remove(var);
    }
    cmd.arg("-C").arg(tmp.path());
    cmd.arg("--config").arg(tmp.path().join("missing-global.toml"));
    (cmd, tmp)
}

fn write_project_config(root: &Path, toml: &str) {
    let dir = root.join(".mia");
    std::fs::create_dir_all(&dir).expect("create .mia dir");
    std::fs::write(dir.join("host.toml"), toml).expect("write host.toml");
}
