//! Process launching seam.
//!
//! [`Launcher`] turns a [`LaunchSpec`] into a running [`BackendChild`].
//! The supervisor only talks to these traits, so tests substitute a fake
//! process without touching the OS.

use crate::config::BackendConfig;
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::io;
use std::path::PathBuf;
use std::process::Stdio;
use tokio::io::AsyncRead;
use tokio::process::{Child, Command};
use tracing::debug;

/// Environment variable carrying the backend's working directory.
pub const ENV_WORKING_DIR: &str = "MIA_WORKING_DIR";
/// Environment variable carrying the operating mode.
pub const ENV_MODE: &str = "MIA_MODE";
/// Environment variable carrying the port the backend must listen on.
pub const ENV_BACKEND_PORT: &str = "MIA_BACKEND_PORT";

/// Everything needed to start the backend executable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchSpec {
    pub command: String,
    pub args: Vec<String>,
    pub env: BTreeMap<String, String>,
    pub working_dir: Option<PathBuf>,
}

impl LaunchSpec {
    #[must_use]
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            args: Vec::new(),
            env: BTreeMap::new(),
            working_dir: None,
        }
    }

    #[must_use]
    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    #[must_use]
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    /// Builds the spec from backend configuration.
    ///
    /// Placeholders in the args are resolved, and the `MIA_WORKING_DIR`,
    /// `MIA_MODE` and `MIA_BACKEND_PORT` variables are always set. They
    /// win over same-named entries in `config.env`.
    #[must_use]
    pub fn from_config(config: &BackendConfig) -> Self {
        let working_dir = config
            .working_dir
            .clone()
            .or_else(|| std::env::current_dir().ok());

        let mut env = config.env.clone();
        if let Some(dir) = &working_dir {
            env.insert(ENV_WORKING_DIR.into(), dir.display().to_string());
        }
        env.insert(ENV_MODE.into(), config.mode.clone());
        env.insert(ENV_BACKEND_PORT.into(), config.port.to_string());

        Self {
            command: config.command.clone(),
            args: config.resolved_args(),
            env,
            working_dir,
        }
    }
}

/// Output pipes of a launched process.
pub struct BackendOutput {
    pub stdout: Box<dyn AsyncRead + Send + Unpin>,
    pub stderr: Box<dyn AsyncRead + Send + Unpin>,
}

impl std::fmt::Debug for BackendOutput {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackendOutput").finish_non_exhaustive()
    }
}

/// Handle to one running backend process.
#[async_trait]
pub trait BackendChild: Send {
    /// OS process id, if known and not yet reaped.
    fn pid(&self) -> Option<u32>;

    /// Takes the output pipes. Returns `None` after the first call or
    /// when output is not captured.
    fn take_output(&mut self) -> Option<BackendOutput>;

    /// Sends the polite termination signal.
    fn terminate(&mut self) -> io::Result<()>;

    /// Forcefully kills the process.
    fn kill(&mut self) -> io::Result<()>;

    /// Waits for exit. `None` means the process died from a signal.
    ///
    /// Must be cancel-safe: the supervisor drops this future whenever a
    /// control signal arrives.
    async fn wait(&mut self) -> io::Result<Option<i32>>;
}

/// Starts backend processes.
#[async_trait]
pub trait Launcher: Send + Sync {
    /// Launches the process described by `spec`.
    ///
    /// # Errors
    ///
    /// Returns the OS error if the executable cannot be started.
    async fn launch(&self, spec: &LaunchSpec) -> io::Result<Box<dyn BackendChild>>;
}

/// [`Launcher`] backed by `tokio::process`.
#[derive(Debug, Clone, Copy, Default)]
pub struct TokioLauncher;

#[async_trait]
impl Launcher for TokioLauncher {
    async fn launch(&self, spec: &LaunchSpec) -> io::Result<Box<dyn BackendChild>> {
        let mut cmd = Command::new(&spec.command);
        cmd.args(&spec.args)
            .envs(&spec.env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &spec.working_dir {
            cmd.current_dir(dir);
        }

        let child = cmd.spawn()?;
        debug!(command = %spec.command, pid = ?child.id(), "Backend process launched");
        Ok(Box::new(TokioChild { child }))
    }
}

struct TokioChild {
    child: Child,
}

#[async_trait]
impl BackendChild for TokioChild {
    fn pid(&self) -> Option<u32> {
        self.child.id()
    }

    fn take_output(&mut self) -> Option<BackendOutput> {
        let stdout = self.child.stdout.take()?;
        let stderr = self.child.stderr.take()?;
        Some(BackendOutput {
            stdout: Box::new(stdout),
            stderr: Box::new(stderr),
        })
    }

    #[cfg(unix)]
    fn terminate(&mut self) -> io::Result<()> {
        use nix::sys::signal::{kill, Signal};
        use nix::unistd::Pid;

        let Some(pid) = self.child.id() else {
            // Already reaped.
            return Ok(());
        };
        let pid = i32::try_from(pid).map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
        kill(Pid::from_raw(pid), Signal::SIGTERM).map_err(io::Error::from)
    }

    #[cfg(not(unix))]
    fn terminate(&mut self) -> io::Result<()> {
        self.child.start_kill()
    }

    fn kill(&mut self) -> io::Result<()> {
        match self.child.start_kill() {
            Err(e) if e.kind() == io::ErrorKind::InvalidInput => Ok(()),
            other => other,
        }
    }

    async fn wait(&mut self) -> io::Result<Option<i32>> {
        let status = self.child.wait().await?;
        Ok(status.code())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn from_config_injects_host_env() {
        let config = BackendConfig {
            command: "python3".into(),
            args: vec!["--mode".into(), "{mode}".into()],
            mode: "classic".into(),
            port: 8123,
            working_dir: Some(PathBuf::from("/srv/mia")),
            env: BTreeMap::from([
                ("MIA_MODE".to_string(), "ignored".to_string()),
                ("PYTHONUNBUFFERED".to_string(), "1".to_string()),
            ]),
            ..BackendConfig::default()
        };

        let spec = LaunchSpec::from_config(&config);

        assert_eq!(spec.command, "python3");
        assert_eq!(spec.args, vec!["--mode", "classic"]);
        assert_eq!(spec.env.get(ENV_MODE).map(String::as_str), Some("classic"));
        assert_eq!(spec.env.get(ENV_BACKEND_PORT).map(String::as_str), Some("8123"));
        assert_eq!(spec.env.get(ENV_WORKING_DIR).map(String::as_str), Some("/srv/mia"));
        assert_eq!(spec.env.get("PYTHONUNBUFFERED").map(String::as_str), Some("1"));
        assert_eq!(spec.working_dir, Some(PathBuf::from("/srv/mia")));
    }

    #[test]
    fn from_config_defaults_working_dir_to_cwd() {
        let config = BackendConfig {
            command: "backend".into(),
            ..BackendConfig::default()
        };
        let spec = LaunchSpec::from_config(&config);
        assert_eq!(spec.working_dir, std::env::current_dir().ok());
        assert!(spec.env.contains_key(ENV_WORKING_DIR));
    }

    #[test]
    fn builder_methods() {
        let spec = LaunchSpec::new("sh").arg("-c").arg("exit 0").env("A", "1");
        assert_eq!(spec.args, vec!["-c", "exit 0"]);
        assert_eq!(spec.env.len(), 1);
    }

    #[tokio::test]
    async fn launch_missing_executable_fails() {
        let result = TokioLauncher
            .launch(&LaunchSpec::new("/nonexistent/mia-backend-binary"))
            .await;
        assert!(result.is_err());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn launch_and_wait_reports_exit_code() {
        let mut child = TokioLauncher
            .launch(&LaunchSpec::new("sh").arg("-c").arg("exit 3"))
            .await
            .expect("sh should launch");
        assert!(child.take_output().is_some());
        assert!(child.take_output().is_none());
        let code = child.wait().await.expect("wait should succeed");
        assert_eq!(code, Some(3));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn terminate_sends_sigterm() {
        let mut child = TokioLauncher
            .launch(&LaunchSpec::new("sleep").arg("30"))
            .await
            .expect("sleep should launch");
        child.terminate().expect("sigterm should be delivered");
        let code = child.wait().await.expect("wait should succeed");
        assert_eq!(code, None, "signal death has no exit code");
    }
}
