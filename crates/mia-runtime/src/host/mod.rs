//! Host orchestration.
//!
//! [`BackendHost`] composes the supervisor, the readiness prober, the
//! gateway, the shutdown coordinator and the update relay, and runs the
//! control flow between them:
//!
//! ```text
//!  start() ──► spawn ──► probe ──ready──► mark_ready ──► gateway.open ──► Ready
//!                │         │
//!                │         └─timeout / exit──► Fatal ──► shutdown
//!                └─error──────────────────────► Fatal ──► shutdown
//!
//!  exit watcher (after Ready):
//!    Restartable ──► UnexpectedExit ──► respawn + probe ──► Restarted
//!    Fatal       ──► UnexpectedExit ──► Fatal(RepeatedExit) ──► shutdown
//! ```
//!
//! Background tasks (event pump, state relay, update relay, exit watcher)
//! stop when the session token is cancelled by the shutdown coordinator.
//! A fatal condition is reported once and always followed by a shutdown.

mod builder;
mod event;

pub use builder::BackendHostBuilder;
pub use event::{HostError, HostEvent};

use crate::config::{ConfigResolver, HostConfig};
use crate::event::{BackendEvent, TOPIC_BACKEND_STATE};
use crate::gateway::{Channel, ChannelGateway};
use crate::process::{
    BackendProcess, ExitDisposition, ExitNotice, LaunchSpec, ProcessSupervisor, SupervisorError,
};
use crate::readiness::{ProbeError, ReadinessProber, ReadyEvent};
use crate::shutdown::{ShutdownCoordinator, ShutdownOutcome};
use crate::update::{UpdateFeed, UpdateOrchestrator};
use mia_types::ErrorCode;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// State shared with the background tasks.
struct Shared {
    supervisor: Arc<ProcessSupervisor>,
    gateway: Arc<ChannelGateway>,
    coordinator: Arc<ShutdownCoordinator>,
    prober: ReadinessProber,
    session: CancellationToken,
    events: mpsc::UnboundedSender<HostEvent>,
    fatal_reported: AtomicBool,
}

/// Receivers consumed by [`BackendHost::start`].
struct Pending {
    exits: mpsc::UnboundedReceiver<ExitNotice>,
    backend_events: mpsc::Receiver<BackendEvent>,
    updates: UpdateOrchestrator,
}

enum Startup {
    Probed(Result<ReadyEvent, ProbeError>),
    Exited(Option<ExitNotice>),
}

/// Supervised backend plus its client gateway.
pub struct BackendHost {
    config: HostConfig,
    shared: Arc<Shared>,
    started: AtomicBool,
    pending: Mutex<Option<Pending>>,
    events: Mutex<Option<mpsc::UnboundedReceiver<HostEvent>>>,
    update_feed: UpdateFeed,
}

impl BackendHost {
    /// Starts building a host whose configuration comes from `resolver`.
    #[must_use]
    pub fn builder(resolver: impl ConfigResolver + 'static) -> BackendHostBuilder {
        BackendHostBuilder::new(resolver)
    }

    /// Spawns the backend, waits for readiness and opens the gateway.
    ///
    /// On any failure the host reports [`HostEvent::Fatal`] and shuts
    /// itself down before returning, so no process is left running.
    ///
    /// # Errors
    ///
    /// - [`HostError::AlreadyStarted`] on a second call
    /// - [`HostError::ShutDown`] if shutdown was requested first
    /// - [`HostError::Spawn`], [`HostError::Readiness`],
    ///   [`HostError::ExitedDuringStartup`], [`HostError::Gateway`]
    pub async fn start(&self) -> Result<Vec<Channel>, HostError> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(HostError::AlreadyStarted);
        }
        let Some(pending) = self.pending.lock().take() else {
            return Err(HostError::AlreadyStarted);
        };
        let shared = &self.shared;
        if shared.session.is_cancelled() {
            return Err(HostError::ShutDown);
        }

        self.spawn_relays(pending.backend_events, pending.updates);
        let mut exits = pending.exits;

        let spec = LaunchSpec::from_config(&self.config.backend);
        info!(command = %spec.command, args = ?spec.args, "Starting backend");
        if let Err(e) = shared.supervisor.spawn(spec).await {
            return Err(match e {
                SupervisorError::Stopped => HostError::ShutDown,
                e => shared.fail(HostError::Spawn(e)).await,
            });
        }

        let mut probe = shared.prober.clone().spawn(&shared.session);
        let startup = tokio::select! {
            result = probe.wait() => Startup::Probed(result),
            notice = exits.recv() => Startup::Exited(notice),
        };
        let ready = match startup {
            Startup::Probed(Ok(ready)) => ready,
            Startup::Probed(Err(ProbeError::Cancelled { .. })) => return Err(HostError::ShutDown),
            Startup::Probed(Err(e)) => return Err(shared.fail(HostError::Readiness(e)).await),
            Startup::Exited(notice) => {
                probe.cancel();
                let code = notice.and_then(|n| n.code);
                return Err(shared.fail(HostError::ExitedDuringStartup { code }).await);
            }
        };

        match shared.supervisor.mark_ready() {
            Ok(()) => {}
            Err(SupervisorError::NotRunning) => {
                let code = shared.supervisor.snapshot().last_exit_code;
                return Err(shared.fail(HostError::ExitedDuringStartup { code }).await);
            }
            Err(e) => {
                debug!(error = %e, "Readiness arrived after shutdown began");
                return Err(HostError::ShutDown);
            }
        }

        let channels = match shared.gateway.open().await {
            Ok(channels) => channels,
            Err(e) if shared.session.is_cancelled() => {
                debug!(error = %e, "Gateway open raced shutdown");
                return Err(HostError::ShutDown);
            }
            Err(e) => return Err(shared.fail(HostError::Gateway(e)).await),
        };

        shared.emit(HostEvent::Ready {
            attempts: ready.attempts,
        });
        tokio::spawn(watch_exits(Arc::clone(shared), exits));
        Ok(channels)
    }

    /// Runs the termination sequence. Idempotent.
    pub async fn shutdown(&self) -> ShutdownOutcome {
        self.shared.coordinator.shutdown().await
    }

    /// Current backend process record.
    #[must_use]
    pub fn status(&self) -> BackendProcess {
        self.shared.supervisor.snapshot()
    }

    /// Host event stream. Available once.
    #[must_use]
    pub fn take_events(&self) -> Option<mpsc::UnboundedReceiver<HostEvent>> {
        self.events.lock().take()
    }

    /// Feed for the external updater.
    #[must_use]
    pub fn update_feed(&self) -> UpdateFeed {
        self.update_feed.clone()
    }

    #[must_use]
    pub fn config(&self) -> &HostConfig {
        &self.config
    }

    #[must_use]
    pub fn gateway(&self) -> &Arc<ChannelGateway> {
        &self.shared.gateway
    }

    #[must_use]
    pub fn coordinator(&self) -> &Arc<ShutdownCoordinator> {
        &self.shared.coordinator
    }

    fn spawn_relays(&self, backend_events: mpsc::Receiver<BackendEvent>, updates: UpdateOrchestrator) {
        let shared = &self.shared;
        tokio::spawn(pump_backend_events(
            Arc::clone(&shared.gateway),
            backend_events,
            shared.session.clone(),
        ));
        tokio::spawn(relay_backend_state(
            Arc::clone(&shared.supervisor),
            Arc::clone(&shared.gateway),
            shared.session.clone(),
        ));
        tokio::spawn(updates.run(Arc::clone(&shared.gateway), shared.session.clone()));
    }
}

impl std::fmt::Debug for BackendHost {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackendHost")
            .field("started", &self.started.load(Ordering::SeqCst))
            .field("supervisor", &self.shared.supervisor)
            .field("gateway", &self.shared.gateway)
            .finish_non_exhaustive()
    }
}

impl Shared {
    fn emit(&self, event: HostEvent) {
        let _ = self.events.send(event);
    }

    /// Reports `err` (once per session) and shuts the host down.
    ///
    /// Returns `err` for the caller to propagate.
    async fn fail(&self, err: HostError) -> HostError {
        if self.session.is_cancelled() {
            debug!(error = %err, "Failure during shutdown, not reported");
        } else if !self.fatal_reported.swap(true, Ordering::SeqCst) {
            error!(code = err.code(), error = %err, "Fatal host error");
            self.emit(HostEvent::Fatal(err.clone()));
        }
        self.coordinator.shutdown().await;
        err
    }

    /// Respawns after an unexpected exit and waits for readiness.
    async fn restart(&self, exits: &mut mpsc::UnboundedReceiver<ExitNotice>) -> Result<u32, HostError> {
        let process = self
            .supervisor
            .respawn()
            .await
            .map_err(|e| HostError::RestartFailed(e.to_string()))?;

        let mut probe = self.prober.clone().spawn(&self.session);
        let step = tokio::select! {
            result = probe.wait() => Startup::Probed(result),
            notice = exits.recv() => Startup::Exited(notice),
        };
        match step {
            Startup::Probed(Ok(_)) => {}
            Startup::Probed(Err(e)) => return Err(HostError::RestartFailed(e.to_string())),
            Startup::Exited(notice) => {
                probe.cancel();
                let code = notice.and_then(|n| n.code);
                return Err(HostError::RestartFailed(format!(
                    "backend exited (code {code:?}) before becoming ready"
                )));
            }
        }

        self.supervisor
            .mark_ready()
            .map_err(|e| HostError::RestartFailed(e.to_string()))?;
        Ok(process.restarts)
    }
}

/// Reacts to process exits after the first readiness.
async fn watch_exits(shared: Arc<Shared>, mut exits: mpsc::UnboundedReceiver<ExitNotice>) {
    loop {
        let notice = tokio::select! {
            () = shared.session.cancelled() => break,
            notice = exits.recv() => match notice {
                Some(notice) => notice,
                None => break,
            },
        };
        if notice.generation != shared.supervisor.generation() {
            debug!(generation = notice.generation, "Ignoring exit of a replaced process");
            continue;
        }

        match notice.disposition {
            ExitDisposition::Expected => {}
            ExitDisposition::Restartable => {
                shared.emit(HostEvent::UnexpectedExit { code: notice.code });
                match shared.restart(&mut exits).await {
                    Ok(restarts) => {
                        info!(restarts, "Backend restarted");
                        shared.emit(HostEvent::Restarted { restarts });
                    }
                    Err(e) => {
                        shared.fail(e).await;
                        break;
                    }
                }
            }
            ExitDisposition::Fatal => {
                shared.emit(HostEvent::UnexpectedExit { code: notice.code });
                shared.fail(HostError::RepeatedExit { code: notice.code }).await;
                break;
            }
            ExitDisposition::DuringStartup => {
                let err = HostError::RestartFailed(format!(
                    "backend exited (code {:?}) before becoming ready",
                    notice.code
                ));
                shared.fail(err).await;
                break;
            }
        }
    }
    debug!("Exit watcher stopped");
}

/// Forwards backend stdout events to pub/sub subscribers, in order.
async fn pump_backend_events(
    gateway: Arc<ChannelGateway>,
    mut events: mpsc::Receiver<BackendEvent>,
    cancel: CancellationToken,
) {
    loop {
        let event = tokio::select! {
            () = cancel.cancelled() => break,
            event = events.recv() => match event {
                Some(event) => event,
                None => break,
            },
        };
        gateway.publish(event);
    }
}

/// Publishes every backend state change on `backend.state`.
async fn relay_backend_state(
    supervisor: Arc<ProcessSupervisor>,
    gateway: Arc<ChannelGateway>,
    cancel: CancellationToken,
) {
    let mut rx = supervisor.subscribe();
    let mut last = rx.borrow_and_update().state;
    loop {
        tokio::select! {
            () = cancel.cancelled() => break,
            changed = rx.changed() => {
                if changed.is_err() {
                    break;
                }
            }
        }

        let process = rx.borrow_and_update().clone();
        if process.state == last {
            continue;
        }
        debug!(from = %last, to = %process.state, "Backend state changed");
        last = process.state;
        match serde_json::to_value(&process) {
            Ok(payload) => {
                gateway.publish(BackendEvent::new(TOPIC_BACKEND_STATE, payload));
            }
            Err(e) => warn!(error = %e, "Backend state not serializable"),
        }
    }
}
