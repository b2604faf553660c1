//! Configuration management with hierarchical layering.
//!
//! ```text
//! Priority (highest to lowest):
//!
//! ┌─────────────────────────────────────────┐
//! │  1. Resolver overrides (CLI flags)      │  ConfigResolver
//! ├─────────────────────────────────────────┤
//! │  2. Environment Variables (MIA_*)       │  Runtime override
//! ├─────────────────────────────────────────┤
//! │  3. Project Config (.mia/host.toml)     │  Project-specific
//! ├─────────────────────────────────────────┤
//! │  4. Global Config (~/.mia/host.toml)    │  User defaults
//! ├─────────────────────────────────────────┤
//! │  5. Default Values (compile-time)       │  Fallback
//! └─────────────────────────────────────────┘
//! ```
//!
//! # Example Configuration
//!
//! ```toml
//! [backend]
//! command = "python3"
//! args = ["mia_hybrid_launcher.py", "--mode", "{mode}", "--web-port", "{port}"]
//! mode = "hybrid_enhanced"
//! port = 8000
//! health_path = "/health"
//!
//! [health]
//! interval_ms = 1000
//! deadline_ms = 30000
//!
//! [gateway]
//! request_addr = "127.0.0.1:7410"
//! pubsub_addr = "127.0.0.1:7411"
//! duplex_addr = "127.0.0.1:7412"
//!
//! [shutdown]
//! deadline_ms = 5000
//!
//! [restart]
//! max_restarts = 1
//! ```

mod error;
mod loader;
mod types;

pub use error::ConfigError;
pub use loader::{apply_env_overrides, ConfigLoader};
pub use types::{
    BackendConfig, GatewayConfig, HealthConfig, HostConfig, LoggingConfig, RestartConfig,
    ShutdownConfig, MODE_PLACEHOLDER, PORT_PLACEHOLDER,
};

use std::path::PathBuf;

/// Project config directory name.
pub const PROJECT_CONFIG_DIR: &str = ".mia";

/// Config file name, both globally and per project.
pub const PROJECT_CONFIG_FILE: &str = "host.toml";

/// Default global config directory (`~/.mia`).
pub fn default_config_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(PROJECT_CONFIG_DIR)
}

/// Default global config file path (`~/.mia/host.toml`).
pub fn default_config_path() -> PathBuf {
    default_config_dir().join(PROJECT_CONFIG_FILE)
}

/// Produces the final configuration for a host.
///
/// The launcher implements this to stack CLI flags on top of
/// [`ConfigLoader`]; embedders can implement it to inject config from
/// elsewhere.
pub trait ConfigResolver {
    /// Resolves the merged configuration.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if any source fails to load.
    fn resolve(&self) -> Result<HostConfig, ConfigError>;
}

impl ConfigResolver for ConfigLoader {
    fn resolve(&self) -> Result<HostConfig, ConfigError> {
        self.load()
    }
}

/// Resolver that returns a fixed configuration.
#[derive(Debug, Clone)]
pub struct StaticResolver(pub HostConfig);

impl ConfigResolver for StaticResolver {
    fn resolve(&self) -> Result<HostConfig, ConfigError> {
        Ok(self.0.clone())
    }
}
