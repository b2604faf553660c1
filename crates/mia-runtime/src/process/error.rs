//! Supervisor errors.
//!
//! | Variant | Code | Recoverable |
//! |---------|------|-------------|
//! | [`SupervisorError::SpawnFailure`] | `SUPERVISOR_SPAWN_FAILURE` | No |
//! | [`SupervisorError::AlreadySpawned`] | `SUPERVISOR_ALREADY_SPAWNED` | No |
//! | [`SupervisorError::NotRestartable`] | `SUPERVISOR_NOT_RESTARTABLE` | No |
//! | [`SupervisorError::Stopped`] | `SUPERVISOR_STOPPED` | No |
//! | [`SupervisorError::NotRunning`] | `SUPERVISOR_NOT_RUNNING` | Yes |
//! | [`SupervisorError::InvalidTransition`] | `SUPERVISOR_INVALID_TRANSITION` | No |

use super::state::{BackendState, InvalidTransition};
use mia_types::ErrorCode;
use thiserror::Error;

/// Process supervisor error.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SupervisorError {
    /// The executable could not be started.
    #[error("failed to spawn '{command}': {reason}")]
    SpawnFailure { command: String, reason: String },

    /// `spawn` was called after a process was already started.
    #[error("backend process already spawned")]
    AlreadySpawned,

    /// `respawn` was called outside the Degraded state.
    #[error("backend cannot be restarted while {0}")]
    NotRestartable(BackendState),

    /// Termination has begun; no new process may start.
    #[error("supervisor is stopped")]
    Stopped,

    /// No backend process is currently running.
    #[error("backend process is not running")]
    NotRunning,

    #[error(transparent)]
    InvalidTransition(#[from] InvalidTransition),
}

impl ErrorCode for SupervisorError {
    fn code(&self) -> &'static str {
        match self {
            Self::SpawnFailure { .. } => "SUPERVISOR_SPAWN_FAILURE",
            Self::AlreadySpawned => "SUPERVISOR_ALREADY_SPAWNED",
            Self::NotRestartable(_) => "SUPERVISOR_NOT_RESTARTABLE",
            Self::Stopped => "SUPERVISOR_STOPPED",
            Self::NotRunning => "SUPERVISOR_NOT_RUNNING",
            Self::InvalidTransition(_) => "SUPERVISOR_INVALID_TRANSITION",
        }
    }

    fn is_recoverable(&self) -> bool {
        matches!(self, Self::NotRunning)
    }
}
