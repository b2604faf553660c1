//! Configuration loader with hierarchical merging.
//!
//! # Load Order
//!
//! 1. Default values (compile-time)
//! 2. Global config (`~/.mia/host.toml`)
//! 3. Project config (`<project>/.mia/host.toml`)
//! 4. Environment variables (`MIA_*`)
//!
//! Each layer overrides the previous.

use super::{default_config_path, ConfigError, HostConfig, PROJECT_CONFIG_DIR, PROJECT_CONFIG_FILE};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use tracing::debug;

/// Configuration loader with builder pattern.
///
/// # Example
///
/// ```ignore
/// use mia_runtime::config::ConfigLoader;
///
/// let config = ConfigLoader::new()
///     .with_project_root("/path/to/project")
///     .skip_env_vars()
///     .load()?;
/// ```
#[derive(Debug, Clone, Default)]
pub struct ConfigLoader {
    global_config_path: Option<PathBuf>,
    project_root: Option<PathBuf>,
    skip_env: bool,
    skip_global: bool,
    skip_project: bool,
}

impl ConfigLoader {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets a custom global config path.
    #[must_use]
    pub fn with_global_config(mut self, path: impl Into<PathBuf>) -> Self {
        self.global_config_path = Some(path.into());
        self
    }

    /// Sets the project root; project config is `<root>/.mia/host.toml`.
    #[must_use]
    pub fn with_project_root(mut self, path: impl Into<PathBuf>) -> Self {
        self.project_root = Some(path.into());
        self
    }

    #[must_use]
    pub fn skip_env_vars(mut self) -> Self {
        self.skip_env = true;
        self
    }

    #[must_use]
    pub fn skip_global_config(mut self) -> Self {
        self.skip_global = true;
        self
    }

    #[must_use]
    pub fn skip_project_config(mut self) -> Self {
        self.skip_project = true;
        self
    }

    /// Loads and merges configuration from all sources.
    ///
    /// The result is not validated; call [`HostConfig::validate`] once
    /// every override (including CLI flags) has been applied.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if a config file exists but cannot be read
    /// or parsed, or an env var holds an unparsable value. Missing files
    /// are skipped.
    pub fn load(&self) -> Result<HostConfig, ConfigError> {
        let mut config = HostConfig::default();

        if !self.skip_global {
            let global_path = self
                .global_config_path
                .clone()
                .unwrap_or_else(default_config_path);

            if let Some(global) = load_file(&global_path)? {
                debug!(path = %global_path.display(), "Loaded global config");
                config.merge(&global);
            }
        }

        if !self.skip_project {
            if let Some(ref root) = self.project_root {
                let project_path = root.join(PROJECT_CONFIG_DIR).join(PROJECT_CONFIG_FILE);
                if let Some(project) = load_file(&project_path)? {
                    debug!(path = %project_path.display(), "Loaded project config");
                    config.merge(&project);
                }
            }
        }

        if !self.skip_env {
            apply_env_overrides(&mut config, |name| std::env::var(name).ok())?;
        }

        Ok(config)
    }
}

fn load_file(path: &Path) -> Result<Option<HostConfig>, ConfigError> {
    if !path.exists() {
        return Ok(None);
    }

    let content = std::fs::read_to_string(path).map_err(|e| ConfigError::read_file(path, e))?;
    let config = HostConfig::from_toml(&content).map_err(|e| ConfigError::parse_toml(path, e))?;

    Ok(Some(config))
}

/// Applies `MIA_*` overrides using `lookup` to read variables.
///
/// | Variable | Field |
/// |----------|-------|
/// | `MIA_DEBUG` | `debug` |
/// | `MIA_BACKEND_COMMAND` | `backend.command` |
/// | `MIA_BACKEND_MODE` | `backend.mode` |
/// | `MIA_BACKEND_PORT` | `backend.port` |
/// | `MIA_HEALTH_DEADLINE_MS` | `health.deadline_ms` |
/// | `MIA_SHUTDOWN_DEADLINE_MS` | `shutdown.deadline_ms` |
///
/// # Errors
///
/// Returns [`ConfigError::InvalidEnvVar`] for values that do not parse.
pub fn apply_env_overrides<F>(config: &mut HostConfig, lookup: F) -> Result<(), ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    if let Some(val) = lookup("MIA_DEBUG") {
        config.debug =
            parse_bool(&val).ok_or_else(|| ConfigError::invalid_env_var("MIA_DEBUG", "expected bool"))?;
    }
    if let Some(val) = lookup("MIA_BACKEND_COMMAND") {
        config.backend.command = val;
    }
    if let Some(val) = lookup("MIA_BACKEND_MODE") {
        config.backend.mode = val;
    }
    if let Some(val) = lookup("MIA_BACKEND_PORT") {
        config.backend.port = parse_num("MIA_BACKEND_PORT", &val)?;
    }
    if let Some(val) = lookup("MIA_HEALTH_DEADLINE_MS") {
        config.health.deadline_ms = parse_num("MIA_HEALTH_DEADLINE_MS", &val)?;
    }
    if let Some(val) = lookup("MIA_SHUTDOWN_DEADLINE_MS") {
        config.shutdown.deadline_ms = parse_num("MIA_SHUTDOWN_DEADLINE_MS", &val)?;
    }
    Ok(())
}

fn parse_num<T: FromStr>(name: &str, val: &str) -> Result<T, ConfigError> {
    val.trim()
        .parse()
        .map_err(|_| ConfigError::invalid_env_var(name, format!("expected a number, got '{val}'")))
}

/// Accepts "true", "false", "1", "0", "yes", "no", "on", "off" (case-insensitive).
fn parse_bool(s: &str) -> Option<bool> {
    match s.to_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Some(true),
        "false" | "0" | "no" | "off" => Some(false),
        _ => None,
    }
}
