//! MIA launcher - desktop host for the local AI backend
//!
//! Starts the backend process, waits until it answers its health check,
//! opens the client channels and keeps them up until the host is asked to
//! stop.
//!
//! # Configuration
//!
//! Configuration is loaded from multiple sources with priority:
//!
//! 1. CLI arguments (highest priority)
//! 2. Environment variables (`MIA_*`)
//! 3. Project config (`.mia/host.toml` in the project root)
//! 4. Global config (`~/.mia/host.toml`, or `--config`)
//! 5. Default values (lowest priority)
//!
//! # Exit Status
//!
//! - `0` after a requested stop (Ctrl-C, SIGTERM)
//! - the backend's own exit code after it exited twice while running
//! - `1` for every other startup or runtime failure

mod logging;

use anyhow::{anyhow, bail, Context, Result};
use clap::Parser;
use mia_runtime::config::{ConfigError, ConfigLoader, ConfigResolver, HostConfig};
use mia_runtime::gateway::Channel;
use mia_runtime::host::{BackendHost, HostError, HostEvent};
use mia_runtime::shutdown::ShutdownOutcome;
use mia_types::ErrorCode;
use std::path::PathBuf;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

/// MIA launcher - supervises the AI backend and serves its channels
#[derive(Parser, Debug)]
#[command(name = "mia-launcher")]
#[command(version, about, long_about = None)]
struct Args {
    /// Global config file (defaults to ~/.mia/host.toml)
    #[arg(long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Project root directory (defaults to current directory)
    #[arg(short = 'C', long)]
    project: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,

    /// Enable verbose output
    #[arg(short, long)]
    verbose: bool,

    /// Backend operating mode (also: MIA_BACKEND_MODE)
    #[arg(long)]
    mode: Option<String>,

    /// Write logs under DIR, enabling file logging
    #[arg(long, value_name = "DIR")]
    log_file: Option<PathBuf>,

    /// Override file log level (default: debug)
    #[arg(long, value_name = "LEVEL")]
    log_level: Option<String>,
}

/// CLI-based configuration resolver.
///
/// Merges file/env config via [`ConfigLoader`] and applies CLI argument
/// overrides as the highest-priority layer.
struct CliConfigResolver {
    project_root: PathBuf,
    config_path: Option<PathBuf>,
    debug: bool,
    mode: Option<String>,
    log_file: Option<PathBuf>,
    log_level: Option<String>,
}

impl CliConfigResolver {
    fn from_args(args: &Args) -> Self {
        let project_root = args.project.clone().unwrap_or_else(|| {
            std::env::current_dir().unwrap_or_else(|e| {
                warn!(error = %e, "Failed to get current directory, using '.'");
                PathBuf::from(".")
            })
        });

        Self {
            project_root,
            config_path: args.config.clone(),
            debug: args.debug,
            mode: args.mode.clone(),
            log_file: args.log_file.clone(),
            log_level: args.log_level.clone(),
        }
    }
}

impl ConfigResolver for CliConfigResolver {
    fn resolve(&self) -> Result<HostConfig, ConfigError> {
        let mut loader = ConfigLoader::new().with_project_root(&self.project_root);
        if let Some(ref path) = self.config_path {
            loader = loader.with_global_config(path);
        }

        let mut config = loader.load()?;

        if self.debug {
            config.debug = true;
        }
        if let Some(ref mode) = self.mode {
            config.backend.mode.clone_from(mode);
        }
        if let Some(ref dir) = self.log_file {
            config.logging.file = true;
            config.logging.file_path = Some(dir.clone());
        }
        if let Some(ref level) = self.log_level {
            config.logging.file_level.clone_from(level);
        }

        Ok(config)
    }
}

/// Why the launcher stopped waiting.
#[derive(Debug)]
enum Exit {
    Signal(&'static str),
    Fatal(HostError),
    EventsClosed,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let resolver = CliConfigResolver::from_args(&args);

    // Resolved early for the logging settings; the host builder resolves
    // again through the same resolver.
    let resolved = resolver
        .resolve()
        .map_err(|e| anyhow!("Config error: {e}"))?;

    let log_path = logging::init(
        args.debug || resolved.debug,
        args.verbose,
        &resolved.logging,
    );

    info!(version = env!("CARGO_PKG_VERSION"), "MIA launcher");
    info!(path = %resolver.project_root.display(), "Project root");
    if let Some(path) = log_path {
        info!(
            path = %path.display(),
            level = %resolved.logging.file_level,
            "File logging enabled"
        );
    }

    let host = BackendHost::builder(resolver)
        .build()
        .map_err(|e| anyhow!("[{}] {e}", e.code()))?;
    let mut events = host
        .take_events()
        .context("host events already taken")?;

    // Registered before the backend exists, so a stop request during
    // startup still reaches the shutdown sequence.
    let mut signals = StopSignals::register()?;

    let start = host.start();
    tokio::pin!(start);
    let started = tokio::select! {
        result = &mut start => Started::Done(result),
        signal = signals.recv() => Started::Interrupted(signal?),
    };
    let channels = match started {
        Started::Done(Ok(channels)) => channels,
        Started::Done(Err(e)) => bail!("Startup failed [{}]: {e}", e.code()),
        Started::Interrupted(signal) => {
            info!(signal, "Stop requested during startup");
            let (outcome, _) = tokio::join!(host.shutdown(), &mut start);
            log_outcome(&outcome);
            return Ok(());
        }
    };
    for channel in &channels {
        info!(kind = %channel.kind, url = %channel.url(), "Channel open");
        println!("{:<14} {}", channel.kind.as_str(), channel.url());
    }

    let exit = wait_for_exit(&mut events, &mut signals).await?;
    match &exit {
        Exit::Signal(name) => info!(signal = *name, "Stop requested"),
        Exit::Fatal(err) => error!(code = err.code(), error = %err, "Host failed"),
        Exit::EventsClosed => warn!("Host event stream closed"),
    }

    let outcome = host.shutdown().await;
    log_outcome(&outcome);

    if let Exit::Fatal(err) = exit {
        if let Some(code) = err.exit_code() {
            std::process::exit(code);
        }
        bail!("[{}] {err}", err.code());
    }
    Ok(())
}

enum Started {
    Done(Result<Vec<Channel>, HostError>),
    Interrupted(&'static str),
}

enum Step {
    Exit(Exit),
    Event(HostEvent),
}

/// Ctrl-C and SIGTERM listeners.
struct StopSignals {
    #[cfg(unix)]
    sigterm: tokio::signal::unix::Signal,
}

impl StopSignals {
    fn register() -> Result<Self> {
        Ok(Self {
            #[cfg(unix)]
            sigterm: tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                .context("Failed to register SIGTERM handler")?,
        })
    }

    /// Waits for the next stop request and returns the signal name.
    async fn recv(&mut self) -> Result<&'static str> {
        #[cfg(unix)]
        let terminate = self.sigterm.recv();
        #[cfg(not(unix))]
        let terminate = std::future::pending::<Option<()>>();

        tokio::select! {
            result = tokio::signal::ctrl_c() => {
                result.context("Failed to listen for Ctrl-C")?;
                Ok("SIGINT")
            }
            _ = terminate => Ok("SIGTERM"),
        }
    }
}

/// Waits for a stop signal or a fatal host event, logging the rest.
async fn wait_for_exit(
    events: &mut mpsc::UnboundedReceiver<HostEvent>,
    signals: &mut StopSignals,
) -> Result<Exit> {
    loop {
        let step = tokio::select! {
            signal = signals.recv() => Step::Exit(Exit::Signal(signal?)),
            event = events.recv() => match event {
                Some(HostEvent::Fatal(err)) => Step::Exit(Exit::Fatal(err)),
                Some(event) => Step::Event(event),
                None => Step::Exit(Exit::EventsClosed),
            },
        };

        match step {
            Step::Exit(exit) => return Ok(exit),
            Step::Event(event) => log_event(&event),
        }
    }
}

fn log_outcome(outcome: &ShutdownOutcome) {
    info!(
        stage = ?outcome.stage,
        exit_code = ?outcome.exit_code,
        confirmed = outcome.confirmed,
        elapsed = ?outcome.elapsed,
        "Host stopped"
    );
}

fn log_event(event: &HostEvent) {
    match event {
        HostEvent::Ready { attempts } => info!(attempts, "Backend ready"),
        HostEvent::UnexpectedExit { code } => warn!(code = ?code, "Backend exited unexpectedly"),
        HostEvent::Restarted { restarts } => info!(restarts, "Backend restarted"),
        HostEvent::ShutdownEscalated => warn!("Backend ignored SIGTERM, killed"),
        HostEvent::Stopped { exit_code } => info!(exit_code = ?exit_code, "Backend stopped"),
        HostEvent::Fatal(err) => error!(code = err.code(), error = %err, "Host failed"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    /// Resolver over an empty temp project with no global config file.
    fn resolver() -> (TempDir, CliConfigResolver) {
        let dir = tempfile::tempdir().expect("create temp dir");
        let resolver = CliConfigResolver {
            project_root: dir.path().to_path_buf(),
            config_path: Some(dir.path().join("missing-global.toml")),
            debug: false,
            mode: None,
            log_file: None,
            log_level: None,
        };
        (dir, resolver)
    }

    fn args() -> Args {
        Args {
            config: None,
            project: None,
            debug: false,
            verbose: false,
            mode: None,
            log_file: None,
            log_level: None,
        }
    }

    #[test]
    fn resolve_defaults_no_overrides() {
        let (_dir, resolver) = resolver();
        let config = resolver.resolve().expect("resolve should succeed");

        let baseline = HostConfig::default();
        assert_eq!(config.debug, baseline.debug);
        assert_eq!(config.logging, baseline.logging);
    }

    #[test]
    fn resolve_cli_overrides() {
        let (_dir, mut resolver) = resolver();
        resolver.debug = true;
        resolver.mode = Some("classic".into());
        resolver.log_file = Some(PathBuf::from("/custom/logs"));
        resolver.log_level = Some("trace".into());

        let config = resolver.resolve().expect("resolve should succeed");

        assert!(config.debug);
        assert_eq!(config.backend.mode, "classic");
        assert!(config.logging.file);
        assert_eq!(config.logging.file_path, Some(PathBuf::from("/custom/logs")));
        assert_eq!(config.logging.file_level, "trace");
    }

    #[test]
    fn cli_mode_beats_project_config() {
        let (dir, mut resolver) = resolver();
        let project = dir.path().join(".mia");
        std::fs::create_dir_all(&project).expect("create project config dir");
        std::fs::write(
            project.join("host.toml"),
            "[backend]\ncommand = \"python3\"\nmode = \"hybrid\"\n",
        )
        .expect("write project config");

        let config = resolver.resolve().expect("resolve should succeed");
        assert_eq!(config.backend.command, "python3");
        assert_eq!(config.backend.mode, "hybrid");

        resolver.mode = Some("classic".into());
        let config = resolver.resolve().expect("resolve should succeed");
        assert_eq!(config.backend.command, "python3");
        assert_eq!(config.backend.mode, "classic");
    }

    #[test]
    fn explicit_config_file_is_used() {
        let (dir, mut resolver) = resolver();
        let path = dir.path().join("host.toml");
        std::fs::write(&path, "debug = true\n[restart]\nmax_restarts = 3\n")
            .expect("write config");
        resolver.config_path = Some(path);

        let config = resolver.resolve().expect("resolve should succeed");
        assert!(config.debug);
        assert_eq!(config.restart.max_restarts, 3);
    }

    #[test]
    fn malformed_config_file_is_an_error() {
        let (dir, mut resolver) = resolver();
        let path = dir.path().join("host.toml");
        std::fs::write(&path, "[backend\n").expect("write config");
        resolver.config_path = Some(path);

        assert!(resolver.resolve().is_err());
    }

    #[test]
    fn from_args_defaults() {
        let resolver = CliConfigResolver::from_args(&args());

        assert!(!resolver.debug);
        assert!(resolver.config_path.is_none());
        assert!(resolver.mode.is_none());
        assert!(resolver.log_file.is_none());
        // project defaults to cwd
        assert!(resolver.project_root.exists());
    }

    #[test]
    fn from_args_with_all_flags() {
        let args = Args {
            config: Some(PathBuf::from("/etc/mia/host.toml")),
            project: Some(PathBuf::from("/tmp")),
            debug: true,
            verbose: true,
            mode: Some("classic".into()),
            log_file: Some(PathBuf::from("/var/log/mia")),
            log_level: Some("info".into()),
        };
        let resolver = CliConfigResolver::from_args(&args);

        assert!(resolver.debug);
        assert_eq!(resolver.project_root, PathBuf::from("/tmp"));
        assert_eq!(resolver.config_path, Some(PathBuf::from("/etc/mia/host.toml")));
        assert_eq!(resolver.mode.as_deref(), Some("classic"));
        assert_eq!(resolver.log_file, Some(PathBuf::from("/var/log/mia")));
        assert_eq!(resolver.log_level.as_deref(), Some("info"));
    }

    #[test]
    fn args_parse_short_flags() {
        let args = Args::try_parse_from(["mia-launcher", "-d", "-C", "/srv/mia", "--mode", "classic"])
            .expect("args should parse");

        assert!(args.debug);
        assert_eq!(args.project, Some(PathBuf::from("/srv/mia")));
        assert_eq!(args.mode.as_deref(), Some("classic"));
    }
}
