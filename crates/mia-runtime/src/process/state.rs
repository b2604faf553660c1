//! Backend process state machine.
//!
//! ```text
//!              ┌──────────┐
//!              │ Starting │
//!              └────┬─────┘
//!         ready     │      terminate
//!        ┌──────────┴──────────┐
//!        ▼                     ▼
//!   ┌─────────┐  exit    ┌─────────────┐
//!   │  Ready  │ ───────► │  Degraded   │
//!   └────┬────┘ ◄─────── └──────┬──────┘
//!        │      restarted       │
//!        │ terminate            │ terminate
//!        ▼                      ▼
//!   ┌──────────────────────────────────┐
//!   │           Terminating            │
//!   └────────────────┬─────────────────┘
//!                    │ exit confirmed
//!                    ▼
//!              ┌──────────┐
//!              │ Stopped  │  (terminal)
//!              └──────────┘
//! ```

use chrono::{DateTime, Utc};
use mia_types::ProcessId;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle state of the backend process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendState {
    /// Spawned, readiness not yet confirmed.
    Starting,
    /// Health check passed; serving traffic.
    Ready,
    /// Exited unexpectedly after being Ready.
    Degraded,
    /// Termination signal sent.
    Terminating,
    /// Exit confirmed. Terminal.
    Stopped,
}

impl BackendState {
    /// Returns `true` if moving to `next` is a permitted edge.
    #[must_use]
    pub fn can_transition_to(self, next: Self) -> bool {
        use BackendState::{Degraded, Ready, Starting, Stopped, Terminating};
        matches!(
            (self, next),
            (Starting, Ready)
                | (Starting, Terminating)
                | (Ready, Degraded)
                | (Ready, Terminating)
                | (Degraded, Ready)
                | (Degraded, Terminating)
                | (Terminating, Stopped)
        )
    }

    #[must_use]
    pub fn is_terminal(self) -> bool {
        self == Self::Stopped
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Starting => "starting",
            Self::Ready => "ready",
            Self::Degraded => "degraded",
            Self::Terminating => "terminating",
            Self::Stopped => "stopped",
        }
    }
}

impl fmt::Display for BackendState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Rejected state change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("invalid backend transition {from} -> {to}")]
pub struct InvalidTransition {
    pub from: BackendState,
    pub to: BackendState,
}

/// Snapshot of the supervised backend process.
///
/// Only [`ProcessSupervisor`](super::ProcessSupervisor) mutates this;
/// everyone else reads it through a `watch::Receiver`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackendProcess {
    pub id: ProcessId,
    pub state: BackendState,
    /// When the current process was spawned.
    pub started_at: Option<DateTime<Utc>>,
    pub last_exit_code: Option<i32>,
    /// OS process id of the current process.
    pub pid: Option<u32>,
    /// Restarts performed in this session.
    pub restarts: u32,
}

impl BackendProcess {
    #[must_use]
    pub fn new() -> Self {
        Self {
            id: ProcessId::new(),
            state: BackendState::Starting,
            started_at: None,
            last_exit_code: None,
            pid: None,
            restarts: 0,
        }
    }

    /// Moves to `next` if the edge is permitted.
    ///
    /// # Errors
    ///
    /// Returns [`InvalidTransition`] and leaves the state unchanged otherwise.
    pub fn transition(&mut self, next: BackendState) -> Result<(), InvalidTransition> {
        if !self.state.can_transition_to(next) {
            return Err(InvalidTransition {
                from: self.state,
                to: next,
            });
        }
        self.state = next;
        Ok(())
    }

    /// Seconds since the current process was spawned.
    #[must_use]
    pub fn uptime_secs(&self) -> Option<i64> {
        self.started_at
            .map(|t| (Utc::now() - t).num_seconds().max(0))
    }
}

impl Default for BackendProcess {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use BackendState::*;

    const ALL: [BackendState; 5] = [Starting, Ready, Degraded, Terminating, Stopped];

    #[test]
    fn permitted_edges() {
        let allowed = [
            (Starting, Ready),
            (Starting, Terminating),
            (Ready, Degraded),
            (Ready, Terminating),
            (Degraded, Ready),
            (Degraded, Terminating),
            (Terminating, Stopped),
        ];
        for from in ALL {
            for to in ALL {
                assert_eq!(
                    from.can_transition_to(to),
                    allowed.contains(&(from, to)),
                    "{from} -> {to}"
                );
            }
        }
    }

    #[test]
    fn stopped_is_terminal() {
        assert!(Stopped.is_terminal());
        assert!(ALL.iter().all(|s| !Stopped.can_transition_to(*s)));
    }

    #[test]
    fn transition_rejects_and_keeps_state() {
        let mut process = BackendProcess::new();
        let err = process
            .transition(Degraded)
            .expect_err("starting cannot degrade");
        assert_eq!(err.from, Starting);
        assert_eq!(process.state, Starting);

        process.transition(Ready).expect("starting -> ready");
        process.transition(Terminating).expect("ready -> terminating");
        process.transition(Stopped).expect("terminating -> stopped");
        assert!(process.transition(Starting).is_err());
    }

    #[test]
    fn state_serializes_snake_case() {
        let json = serde_json::to_string(&Terminating).expect("should serialize");
        assert_eq!(json, "\"terminating\"");
        assert_eq!(Degraded.to_string(), "degraded");
    }

    #[test]
    fn uptime_absent_before_spawn() {
        let mut process = BackendProcess::new();
        assert!(process.uptime_secs().is_none());
        process.started_at = Some(Utc::now());
        assert_eq!(process.uptime_secs(), Some(0));
    }
}
