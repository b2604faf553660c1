//! Configuration types.
//!
//! All types implement [`Default`] with the compile-time fallback values
//! listed in the module docs of [`crate::config`].

use super::ConfigError;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

/// Placeholder substituted with [`BackendConfig::mode`] in backend args.
pub const MODE_PLACEHOLDER: &str = "{mode}";

/// Placeholder substituted with [`BackendConfig::port`] in backend args.
pub const PORT_PLACEHOLDER: &str = "{port}";

/// Unified host configuration after all layers are merged.
///
/// # Example
///
/// ```
/// use mia_runtime::config::HostConfig;
///
/// let config = HostConfig::default();
/// assert_eq!(config.backend.port, 8000);
/// assert_eq!(config.restart.max_restarts, 1);
/// ```
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct HostConfig {
    /// Enable debug diagnostics.
    pub debug: bool,

    /// How to launch and reach the backend process.
    pub backend: BackendConfig,

    /// Readiness polling.
    pub health: HealthConfig,

    /// Client-facing listeners.
    pub gateway: GatewayConfig,

    /// Termination timing.
    pub shutdown: ShutdownConfig,

    /// Automatic restart budget.
    pub restart: RestartConfig,

    /// File logging for the launcher.
    pub logging: LoggingConfig,
}

impl HostConfig {
    /// Serializes to a TOML string.
    ///
    /// # Errors
    ///
    /// Returns error if serialization fails.
    pub fn to_toml(&self) -> Result<String, toml::ser::Error> {
        toml::to_string_pretty(self)
    }

    /// Deserializes from a TOML string.
    ///
    /// # Errors
    ///
    /// Returns error if the TOML is malformed.
    pub fn from_toml(s: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(s)
    }

    /// Merges another layer into this one.
    ///
    /// Fields of `other` that still hold their default value are treated
    /// as "not set" and leave `self` untouched.
    pub fn merge(&mut self, other: &Self) {
        if other.debug {
            self.debug = true;
        }
        self.backend.merge(&other.backend);
        self.health.merge(&other.health);
        self.gateway.merge(&other.gateway);
        self.shutdown.merge(&other.shutdown);
        self.restart.merge(&other.restart);
        self.logging.merge(&other.logging);
    }

    /// Checks cross-field constraints that serde cannot express.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] naming the offending field.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.backend.command.trim().is_empty() {
            return Err(ConfigError::invalid("backend.command", "must be set"));
        }
        if self.health.interval_ms == 0 {
            return Err(ConfigError::invalid("health.interval_ms", "must be > 0"));
        }
        if self.health.deadline_ms == 0 {
            return Err(ConfigError::invalid("health.deadline_ms", "must be > 0"));
        }
        if self.health.interval_ms > self.health.deadline_ms {
            return Err(ConfigError::invalid(
                "health.interval_ms",
                "must not exceed health.deadline_ms",
            ));
        }
        if self.shutdown.deadline_ms == 0 {
            return Err(ConfigError::invalid("shutdown.deadline_ms", "must be > 0"));
        }
        if self.gateway.subscriber_buffer == 0 {
            return Err(ConfigError::invalid("gateway.subscriber_buffer", "must be > 0"));
        }

        let mut seen = HashSet::new();
        for addr in self.gateway.addrs() {
            // Port 0 asks the OS for a fresh port, so repeats are fine.
            if addr.port() != 0 && !seen.insert(addr) {
                return Err(ConfigError::invalid(
                    "gateway",
                    format!("address {addr} is used by more than one channel"),
                ));
            }
        }

        Ok(())
    }
}

/// Backend process configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct BackendConfig {
    /// Executable to launch.
    pub command: String,

    /// Ordered arguments. `{mode}` and `{port}` are substituted.
    pub args: Vec<String>,

    /// Extra environment variables for the backend.
    pub env: BTreeMap<String, String>,

    /// Working directory (defaults to the host's current directory).
    pub working_dir: Option<PathBuf>,

    /// Operating mode passed to the backend (`classic`, `hybrid`, ...).
    pub mode: String,

    /// Host the backend listens on.
    pub host: String,

    /// Port the backend listens on.
    pub port: u16,

    /// Health check path.
    pub health_path: String,

    /// Synchronous request endpoint path.
    pub request_path: String,

    /// Duplex stream (WebSocket) endpoint path.
    pub stream_path: String,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            command: String::new(),
            args: Vec::new(),
            env: BTreeMap::new(),
            working_dir: None,
            mode: "hybrid_enhanced".into(),
            host: "127.0.0.1".into(),
            port: 8000,
            health_path: "/health".into(),
            request_path: "/api/process".into(),
            stream_path: "/api/stream".into(),
        }
    }
}

impl BackendConfig {
    fn merge(&mut self, other: &Self) {
        let default = Self::default();

        if other.command != default.command {
            self.command.clone_from(&other.command);
        }
        if !other.args.is_empty() {
            self.args.clone_from(&other.args);
        }
        for (key, value) in &other.env {
            self.env.insert(key.clone(), value.clone());
        }
        if other.working_dir.is_some() {
            self.working_dir.clone_from(&other.working_dir);
        }
        if other.mode != default.mode {
            self.mode.clone_from(&other.mode);
        }
        if other.host != default.host {
            self.host.clone_from(&other.host);
        }
        if other.port != default.port {
            self.port = other.port;
        }
        if other.health_path != default.health_path {
            self.health_path.clone_from(&other.health_path);
        }
        if other.request_path != default.request_path {
            self.request_path.clone_from(&other.request_path);
        }
        if other.stream_path != default.stream_path {
            self.stream_path.clone_from(&other.stream_path);
        }
    }

    /// Base HTTP URL of the backend, e.g. `http://127.0.0.1:8000`.
    #[must_use]
    pub fn base_url(&self) -> String {
        format!("http://{}:{}", self.host, self.port)
    }

    /// Full health check URL.
    #[must_use]
    pub fn health_url(&self) -> String {
        format!("{}{}", self.base_url(), self.health_path)
    }

    /// Full synchronous request URL.
    #[must_use]
    pub fn request_url(&self) -> String {
        format!("{}{}", self.base_url(), self.request_path)
    }

    /// Full duplex stream URL (WebSocket scheme).
    #[must_use]
    pub fn stream_url(&self) -> String {
        format!("ws://{}:{}{}", self.host, self.port, self.stream_path)
    }

    /// Arguments with placeholders substituted.
    #[must_use]
    pub fn resolved_args(&self) -> Vec<String> {
        let port = self.port.to_string();
        self.args
            .iter()
            .map(|arg| {
                arg.replace(MODE_PLACEHOLDER, &self.mode)
                    .replace(PORT_PLACEHOLDER, &port)
            })
            .collect()
    }
}

/// Readiness polling configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct HealthConfig {
    /// Fixed delay between polls in milliseconds.
    pub interval_ms: u64,

    /// Overall readiness deadline in milliseconds.
    pub deadline_ms: u64,

    /// Timeout of a single health request in milliseconds.
    pub request_timeout_ms: u64,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            interval_ms: 1_000,
            deadline_ms: 30_000,
            request_timeout_ms: 800,
        }
    }
}

impl HealthConfig {
    fn merge(&mut self, other: &Self) {
        let default = Self::default();

        if other.interval_ms != default.interval_ms {
            self.interval_ms = other.interval_ms;
        }
        if other.deadline_ms != default.deadline_ms {
            self.deadline_ms = other.deadline_ms;
        }
        if other.request_timeout_ms != default.request_timeout_ms {
            self.request_timeout_ms = other.request_timeout_ms;
        }
    }

    #[must_use]
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    #[must_use]
    pub fn deadline(&self) -> Duration {
        Duration::from_millis(self.deadline_ms)
    }

    #[must_use]
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

/// Client-facing listener configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct GatewayConfig {
    /// Bind address of the request/reply channel.
    pub request_addr: SocketAddr,

    /// Bind address of the pub/sub channel.
    pub pubsub_addr: SocketAddr,

    /// Bind address of the duplex channel.
    pub duplex_addr: SocketAddr,

    /// Backend request timeout in milliseconds.
    pub request_timeout_ms: u64,

    /// Per-subscriber event queue capacity.
    pub subscriber_buffer: usize,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            request_addr: SocketAddr::from(([127, 0, 0, 1], 7410)),
            pubsub_addr: SocketAddr::from(([127, 0, 0, 1], 7411)),
            duplex_addr: SocketAddr::from(([127, 0, 0, 1], 7412)),
            request_timeout_ms: 30_000,
            subscriber_buffer: 256,
        }
    }
}

impl GatewayConfig {
    fn merge(&mut self, other: &Self) {
        let default = Self::default();

        if other.request_addr != default.request_addr {
            self.request_addr = other.request_addr;
        }
        if other.pubsub_addr != default.pubsub_addr {
            self.pubsub_addr = other.pubsub_addr;
        }
        if other.duplex_addr != default.duplex_addr {
            self.duplex_addr = other.duplex_addr;
        }
        if other.request_timeout_ms != default.request_timeout_ms {
            self.request_timeout_ms = other.request_timeout_ms;
        }
        if other.subscriber_buffer != default.subscriber_buffer {
            self.subscriber_buffer = other.subscriber_buffer;
        }
    }

    /// Gateway config bound to ephemeral localhost ports.
    ///
    /// Used by tests and by embedders that discover the ports from
    /// [`ChannelGateway::channels`](crate::gateway::ChannelGateway::channels).
    #[must_use]
    pub fn ephemeral() -> Self {
        let any = SocketAddr::from(([127, 0, 0, 1], 0));
        Self {
            request_addr: any,
            pubsub_addr: any,
            duplex_addr: any,
            ..Self::default()
        }
    }

    /// The three bind addresses in request/pubsub/duplex order.
    #[must_use]
    pub fn addrs(&self) -> [SocketAddr; 3] {
        [self.request_addr, self.pubsub_addr, self.duplex_addr]
    }

    #[must_use]
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

/// Termination timing.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ShutdownConfig {
    /// Time the backend gets to exit after the polite signal.
    pub deadline_ms: u64,

    /// Time in-flight client operations get to finish.
    pub drain_ms: u64,

    /// Time to wait for exit confirmation after the forceful signal.
    pub kill_grace_ms: u64,
}

impl Default for ShutdownConfig {
    fn default() -> Self {
        Self {
            deadline_ms: 5_000,
            drain_ms: 500,
            kill_grace_ms: 1_000,
        }
    }
}

impl ShutdownConfig {
    fn merge(&mut self, other: &Self) {
        let default = Self::default();

        if other.deadline_ms != default.deadline_ms {
            self.deadline_ms = other.deadline_ms;
        }
        if other.drain_ms != default.drain_ms {
            self.drain_ms = other.drain_ms;
        }
        if other.kill_grace_ms != default.kill_grace_ms {
            self.kill_grace_ms = other.kill_grace_ms;
        }
    }

    #[must_use]
    pub fn deadline(&self) -> Duration {
        Duration::from_millis(self.deadline_ms)
    }

    #[must_use]
    pub fn drain(&self) -> Duration {
        Duration::from_millis(self.drain_ms)
    }

    #[must_use]
    pub fn kill_grace(&self) -> Duration {
        Duration::from_millis(self.kill_grace_ms)
    }
}

/// Automatic restart budget.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RestartConfig {
    /// Unexpected exits that may be answered with a restart.
    pub max_restarts: u32,
}

impl Default for RestartConfig {
    fn default() -> Self {
        Self { max_restarts: 1 }
    }
}

impl RestartConfig {
    fn merge(&mut self, other: &Self) {
        if other.max_restarts != Self::default().max_restarts {
            self.max_restarts = other.max_restarts;
        }
    }
}

/// File logging configuration (terminal logging is controlled by flags).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LoggingConfig {
    /// Write logs to a file.
    pub file: bool,

    /// Log directory (defaults to `~/.mia/logs`).
    pub file_path: Option<PathBuf>,

    /// Filter level for the file layer.
    pub file_level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            file: false,
            file_path: None,
            file_level: "debug".into(),
        }
    }
}

impl LoggingConfig {
    fn merge(&mut self, other: &Self) {
        if other.file {
            self.file = true;
        }
        if other.file_path.is_some() {
            self.file_path.clone_from(&other.file_path);
        }
        if other.file_level != Self::default().file_level {
            self.file_level.clone_from(&other.file_level);
        }
    }

    /// Log directory with the default applied.
    #[must_use]
    pub fn resolved_file_path(&self) -> PathBuf {
        self.file_path
            .clone()
            .unwrap_or_else(|| super::default_config_dir().join("logs"))
    }

    /// `EnvFilter` directive for the file layer.
    ///
    /// HTTP and WebSocket internals are held at `warn` so they do not
    /// flood the file at debug level.
    #[must_use]
    pub fn file_filter_directive(&self) -> String {
        format!(
            "{},hyper=warn,h2=warn,reqwest=warn,rustls=warn,tungstenite=warn",
            self.file_level
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn configured() -> HostConfig {
        let mut config = HostConfig::default();
        config.backend.command = "python3".into();
        config
    }

    #[test]
    fn defaults() {
        let config = HostConfig::default();
        assert!(!config.debug);
        assert!(config.backend.command.is_empty());
        assert_eq!(config.backend.mode, "hybrid_enhanced");
        assert_eq!(config.backend.health_url(), "http://127.0.0.1:8000/health");
        assert_eq!(config.health.interval(), Duration::from_secs(1));
        assert_eq!(config.health.deadline(), Duration::from_secs(30));
        assert_eq!(config.shutdown.deadline(), Duration::from_secs(5));
        assert_eq!(config.gateway.request_addr.port(), 7410);
    }

    #[test]
    fn toml_roundtrip_preserves_everything() {
        let mut config = configured();
        config.backend.args = vec!["main.py".into(), "--port".into(), "{port}".into()];
        config.backend.env.insert("MIA_DATA".into(), "/tmp/data".into());
        config.gateway.subscriber_buffer = 8;

        let toml = config.to_toml().expect("config should serialize");
        let restored = HostConfig::from_toml(&toml).expect("config should parse");
        assert_eq!(config, restored);
    }

    #[test]
    fn partial_toml_keeps_defaults() {
        let config = HostConfig::from_toml(
            r#"
[backend]
command = "mia-backend"

[health]
deadline_ms = 5000
"#,
        )
        .expect("partial config should parse");

        assert_eq!(config.backend.command, "mia-backend");
        assert_eq!(config.backend.port, 8000);
        assert_eq!(config.health.deadline_ms, 5_000);
        assert_eq!(config.health.interval_ms, 1_000);
    }

    #[test]
    fn merge_overrides_only_set_fields() {
        let mut base = configured();
        base.backend.port = 9000;
        base.backend.env.insert("A".into(), "1".into());

        let mut overlay = HostConfig::default();
        overlay.backend.mode = "classic".into();
        overlay.backend.env.insert("B".into(), "2".into());
        overlay.shutdown.deadline_ms = 2_000;

        base.merge(&overlay);

        assert_eq!(base.backend.command, "python3");
        assert_eq!(base.backend.port, 9000);
        assert_eq!(base.backend.mode, "classic");
        assert_eq!(base.backend.env.len(), 2);
        assert_eq!(base.shutdown.deadline_ms, 2_000);
        assert_eq!(base.shutdown.drain_ms, 500);
    }

    #[test]
    fn resolved_args_substitute_placeholders() {
        let mut backend = BackendConfig {
            command: "python3".into(),
            mode: "adaptive".into(),
            port: 8123,
            ..BackendConfig::default()
        };
        backend.args = vec![
            "launcher.py".into(),
            "--mode={mode}".into(),
            "--web-port".into(),
            "{port}".into(),
        ];

        assert_eq!(
            backend.resolved_args(),
            vec!["launcher.py", "--mode=adaptive", "--web-port", "8123"]
        );
    }

    #[test]
    fn backend_urls() {
        let backend = BackendConfig {
            port: 9100,
            ..BackendConfig::default()
        };
        assert_eq!(backend.request_url(), "http://127.0.0.1:9100/api/process");
        assert_eq!(backend.stream_url(), "ws://127.0.0.1:9100/api/stream");
    }

    #[test]
    fn validate_accepts_configured_defaults() {
        configured().validate().expect("defaults plus command should be valid");
    }

    #[test]
    fn validate_rejects_missing_command() {
        let err = HostConfig::default()
            .validate()
            .expect_err("empty command must be rejected");
        assert!(err.to_string().contains("backend.command"));
    }

    #[test]
    fn validate_rejects_interval_longer_than_deadline() {
        let mut config = configured();
        config.health.interval_ms = 10_000;
        config.health.deadline_ms = 5_000;
        let err = config.validate().expect_err("interval > deadline");
        assert!(err.to_string().contains("health.interval_ms"));
    }

    #[test]
    fn validate_rejects_shared_gateway_address() {
        let mut config = configured();
        config.gateway.pubsub_addr = config.gateway.request_addr;
        let err = config.validate().expect_err("shared address");
        assert!(err.to_string().contains("more than one channel"));
    }

    #[test]
    fn validate_allows_ephemeral_ports() {
        let mut config = configured();
        config.gateway = GatewayConfig::ephemeral();
        config.validate().expect("port 0 may repeat");
    }

    #[test]
    fn file_filter_directive_suppresses_http_noise() {
        let logging = LoggingConfig::default();
        let directive = logging.file_filter_directive();
        assert!(directive.starts_with("debug,"));
        assert!(directive.contains("hyper=warn"));
    }
}
