//! Host-level events and errors.
//!
//! # Error Codes
//!
//! | Variant | Code | Recoverable |
//! |---------|------|-------------|
//! | [`HostError::Config`] | `HOST_CONFIG_INVALID` | No |
//! | [`HostError::Spawn`] | `HOST_SPAWN_FAILED` | No |
//! | [`HostError::Readiness`] | `HOST_NOT_READY` | No |
//! | [`HostError::ExitedDuringStartup`] | `HOST_EXITED_DURING_STARTUP` | No |
//! | [`HostError::RepeatedExit`] | `HOST_REPEATED_EXIT` | No |
//! | [`HostError::RestartFailed`] | `HOST_RESTART_FAILED` | No |
//! | [`HostError::Gateway`] | `HOST_GATEWAY_FAILED` | No |
//! | [`HostError::AlreadyStarted`] | `HOST_ALREADY_STARTED` | No |
//! | [`HostError::ShutDown`] | `HOST_SHUT_DOWN` | No |

use crate::gateway::GatewayError;
use crate::process::SupervisorError;
use crate::readiness::ProbeError;
use mia_types::ErrorCode;
use thiserror::Error;

/// Process-level failure. Reported at most once per session as
/// [`HostEvent::Fatal`].
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum HostError {
    #[error("invalid host configuration: {0}")]
    Config(String),

    #[error("backend could not be started: {0}")]
    Spawn(SupervisorError),

    #[error("backend did not become ready: {0}")]
    Readiness(ProbeError),

    #[error("backend exited during startup (code {code:?})")]
    ExitedDuringStartup { code: Option<i32> },

    #[error("backend exited unexpectedly again (code {code:?})")]
    RepeatedExit { code: Option<i32> },

    #[error("backend restart failed: {0}")]
    RestartFailed(String),

    #[error("gateway failed to open: {0}")]
    Gateway(GatewayError),

    #[error("host already started")]
    AlreadyStarted,

    #[error("host is shut down")]
    ShutDown,
}

impl HostError {
    /// Exit code the host process should propagate, if any.
    ///
    /// Only a repeated unexpected exit carries the backend's code through.
    #[must_use]
    pub fn exit_code(&self) -> Option<i32> {
        match self {
            Self::RepeatedExit { code } => *code,
            _ => None,
        }
    }
}

impl ErrorCode for HostError {
    fn code(&self) -> &'static str {
        match self {
            Self::Config(_) => "HOST_CONFIG_INVALID",
            Self::Spawn(_) => "HOST_SPAWN_FAILED",
            Self::Readiness(_) => "HOST_NOT_READY",
            Self::ExitedDuringStartup { .. } => "HOST_EXITED_DURING_STARTUP",
            Self::RepeatedExit { .. } => "HOST_REPEATED_EXIT",
            Self::RestartFailed(_) => "HOST_RESTART_FAILED",
            Self::Gateway(_) => "HOST_GATEWAY_FAILED",
            Self::AlreadyStarted => "HOST_ALREADY_STARTED",
            Self::ShutDown => "HOST_SHUT_DOWN",
        }
    }

    fn is_recoverable(&self) -> bool {
        false
    }
}

/// Lifecycle report from the host to its embedder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostEvent {
    /// Backend passed its first health check; channels are open.
    Ready { attempts: u32 },
    /// Backend exited while Ready.
    UnexpectedExit { code: Option<i32> },
    /// Replacement process passed its health check.
    Restarted { restarts: u32 },
    /// Unrecoverable failure; the host is shutting itself down.
    Fatal(HostError),
    /// Backend ignored the polite signal and was killed.
    ShutdownEscalated,
    /// Termination sequence finished.
    Stopped { exit_code: Option<i32> },
}
