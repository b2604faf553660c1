//! Graceful-then-forceful termination.
//!
//! ```text
//!  shutdown()
//!     │
//!     ├─ 1. cancel session token (probe, watchers, relays stop)
//!     ├─ 2. gateway.close(drain)          refuse new traffic, drain, close clients
//!     ├─ 3. Terminating + SIGTERM
//!     ├─ 4. wait up to `deadline` ──exit──► Stopped            (Graceful)
//!     │                          └─timeout─► SIGKILL, wait up to `kill_grace`
//!     │                                                        (Forceful)
//!     └─ 5. ShutdownOutcome, shared by every caller
//! ```
//!
//! The sequence runs at most once per coordinator, on its own task. Callers
//! only await its result, so a caller that gives up early (a dropped
//! future, an outer timeout) never restarts the sequence.

use crate::config::ShutdownConfig;
use crate::gateway::ChannelGateway;
use crate::host::HostEvent;
use crate::process::{BackendState, ProcessSignal, ProcessSupervisor};
use chrono::{DateTime, Utc};
use futures_util::future::{BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Escalation stage of a shutdown.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ShutdownStage {
    /// Polite signal sent; waiting for the process to exit.
    Graceful,
    /// Deadline elapsed; the process was killed.
    Forceful,
}

/// The in-flight (or finished) shutdown.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ShutdownRequest {
    pub requested_at: DateTime<Utc>,
    pub stage: ShutdownStage,
    /// Time the process gets after the polite signal.
    pub deadline: Duration,
}

/// Result of the termination sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShutdownOutcome {
    /// Final stage reached.
    pub stage: ShutdownStage,
    /// Exit code of the backend, `None` when killed by a signal or never run.
    pub exit_code: Option<i32>,
    /// The process exit was observed.
    pub confirmed: bool,
    /// In-flight client operations finished within the drain window.
    pub drained: bool,
    pub elapsed: Duration,
}

impl ShutdownOutcome {
    /// Returns `true` if escalation to the forceful signal was needed.
    #[must_use]
    pub fn escalated(&self) -> bool {
        self.stage == ShutdownStage::Forceful
    }
}

/// The spawned sequence; `None` if its task panicked.
type Sequence = Shared<BoxFuture<'static, Option<ShutdownOutcome>>>;

/// Drives the termination sequence exactly once.
pub struct ShutdownCoordinator {
    supervisor: Arc<ProcessSupervisor>,
    gateway: Arc<ChannelGateway>,
    session: CancellationToken,
    config: ShutdownConfig,
    events: Option<mpsc::UnboundedSender<HostEvent>>,
    request: Mutex<Option<ShutdownRequest>>,
    sequence: Mutex<Option<Sequence>>,
    outcome: Mutex<Option<ShutdownOutcome>>,
}

impl ShutdownCoordinator {
    #[must_use]
    pub fn new(
        supervisor: Arc<ProcessSupervisor>,
        gateway: Arc<ChannelGateway>,
        session: CancellationToken,
        config: ShutdownConfig,
    ) -> Self {
        Self {
            supervisor,
            gateway,
            session,
            config,
            events: None,
            request: Mutex::new(None),
            sequence: Mutex::new(None),
            outcome: Mutex::new(None),
        }
    }

    /// Reports escalation and the final stop to `tx`.
    #[must_use]
    pub fn with_host_events(mut self, tx: mpsc::UnboundedSender<HostEvent>) -> Self {
        self.events = Some(tx);
        self
    }

    /// Shuts down with the configured deadline.
    pub async fn shutdown(self: &Arc<Self>) -> ShutdownOutcome {
        self.shutdown_with(self.config.deadline()).await
    }

    /// Shuts down, giving the backend `deadline` to exit after the polite
    /// signal.
    ///
    /// Idempotent: only the first call starts the sequence and its
    /// `deadline` wins. The sequence completes even if every caller stops
    /// waiting. Returns within `deadline + drain + kill_grace`.
    pub async fn shutdown_with(self: &Arc<Self>, deadline: Duration) -> ShutdownOutcome {
        let sequence = self
            .sequence
            .lock()
            .get_or_insert_with(|| {
                let coordinator = Arc::clone(self);
                tokio::spawn(async move { coordinator.run(deadline).await })
                    .map(|joined| match joined {
                        Ok(outcome) => Some(outcome),
                        Err(e) => {
                            error!(error = %e, "Shutdown sequence task failed");
                            None
                        }
                    })
                    .boxed()
                    .shared()
            })
            .clone();

        match sequence.await {
            Some(outcome) => outcome,
            None => self.interrupted_outcome(),
        }
    }

    /// The shutdown request, once one was made.
    #[must_use]
    pub fn request(&self) -> Option<ShutdownRequest> {
        self.request.lock().clone()
    }

    /// Outcome of a finished shutdown.
    #[must_use]
    pub fn outcome(&self) -> Option<ShutdownOutcome> {
        *self.outcome.lock()
    }

    /// Best-known outcome when the sequence task died before reporting.
    fn interrupted_outcome(&self) -> ShutdownOutcome {
        let process = self.supervisor.snapshot();
        let request = self.request();
        ShutdownOutcome {
            stage: request.as_ref().map_or(ShutdownStage::Graceful, |r| r.stage),
            exit_code: process.last_exit_code,
            confirmed: process.state == BackendState::Stopped,
            drained: false,
            elapsed: request
                .and_then(|r| (Utc::now() - r.requested_at).to_std().ok())
                .unwrap_or_default(),
        }
    }

    async fn run(&self, deadline: Duration) -> ShutdownOutcome {
        let start = Instant::now();
        *self.request.lock() = Some(ShutdownRequest {
            requested_at: Utc::now(),
            stage: ShutdownStage::Graceful,
            deadline,
        });
        info!(?deadline, state = %self.supervisor.state(), "Shutdown requested");

        self.session.cancel();
        let report = self.gateway.close(self.config.drain()).await;

        let mut stage = ShutdownStage::Graceful;
        let mut confirmed = true;
        if self.supervisor.begin_termination() {
            // Refused only while a launch is in progress; the launch
            // itself queues the signal once the child exists.
            self.supervisor.signal(ProcessSignal::Terminate);

            let stopped = tokio::time::timeout(deadline, self.supervisor.wait_stopped()).await;
            if stopped.is_err() {
                stage = ShutdownStage::Forceful;
                if let Some(request) = self.request.lock().as_mut() {
                    request.stage = ShutdownStage::Forceful;
                }
                warn!(?deadline, "Backend ignored termination, escalating to kill");
                self.emit(HostEvent::ShutdownEscalated);

                self.supervisor.signal(ProcessSignal::Kill);
                confirmed = tokio::time::timeout(self.config.kill_grace(), self.supervisor.wait_stopped())
                    .await
                    .is_ok();
                if !confirmed {
                    error!(
                        grace = ?self.config.kill_grace(),
                        "Backend exit not confirmed after kill"
                    );
                }
            }
        }

        let outcome = ShutdownOutcome {
            stage,
            exit_code: self.supervisor.snapshot().last_exit_code,
            confirmed,
            drained: report.drained,
            elapsed: start.elapsed(),
        };
        info!(
            stage = ?outcome.stage,
            exit_code = ?outcome.exit_code,
            elapsed = ?outcome.elapsed,
            "Shutdown complete"
        );
        *self.outcome.lock() = Some(outcome);
        self.emit(HostEvent::Stopped {
            exit_code: outcome.exit_code,
        });
        outcome
    }

    fn emit(&self, event: HostEvent) {
        if let Some(tx) = &self.events {
            let _ = tx.send(event);
        }
    }
}

impl std::fmt::Debug for ShutdownCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShutdownCoordinator")
            .field("config", &self.config)
            .field("request", &*self.request.lock())
            .finish_non_exhaustive()
    }
}
