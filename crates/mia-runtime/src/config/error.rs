//! Configuration errors.

use std::path::PathBuf;
use thiserror::Error;

/// Configuration error type.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Failed to read config file.
    #[error("failed to read config file '{path}': {source}")]
    ReadFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Failed to parse TOML.
    #[error("failed to parse config file '{path}': {source}")]
    ParseToml {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    /// Invalid environment variable value.
    #[error("invalid value for environment variable '{name}': {message}")]
    InvalidEnvVar { name: String, message: String },

    /// A value parsed but violates a constraint.
    #[error("invalid configuration for '{field}': {message}")]
    Invalid { field: String, message: String },
}

impl ConfigError {
    pub fn read_file(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::ReadFile {
            path: path.into(),
            source,
        }
    }

    pub fn parse_toml(path: impl Into<PathBuf>, source: toml::de::Error) -> Self {
        Self::ParseToml {
            path: path.into(),
            source,
        }
    }

    pub fn invalid_env_var(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self::InvalidEnvVar {
            name: name.into(),
            message: message.into(),
        }
    }

    pub fn invalid(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Invalid {
            field: field.into(),
            message: message.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display() {
        let err = ConfigError::invalid_env_var("MIA_BACKEND_PORT", "expected u16");
        assert!(err.to_string().contains("MIA_BACKEND_PORT"));
        assert!(err.to_string().contains("expected u16"));

        let err = ConfigError::invalid("health.deadline_ms", "must be > 0");
        assert_eq!(
            err.to_string(),
            "invalid configuration for 'health.deadline_ms': must be > 0"
        );
    }
}
