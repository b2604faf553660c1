//! Backend process supervisor.
//!
//! The supervisor owns the single [`BackendProcess`] record and the
//! running child. Each spawned child gets one monitor task that waits for
//! exit and executes control signals:
//!
//! ```text
//!  ShutdownCoordinator ──signal()──► control mpsc ──► monitor task ──► child
//!                                                        │
//!                                            exit        ▼
//!  BackendHost ◄──────────── ExitNotice ◄──────────── on_exit()
//!                                                        │
//!  Gateway / relays ◄─────── watch<BackendProcess> ◄─────┘
//! ```
//!
//! Signal entry points are crate-private: only the shutdown coordinator
//! terminates the process.

use super::error::SupervisorError;
use super::launcher::{BackendChild, LaunchSpec, Launcher};
use super::output::spawn_output_pump;
use super::state::{BackendProcess, BackendState};
use crate::event::BackendEvent;
use chrono::Utc;
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

/// Control signal for the monitor task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ProcessSignal {
    /// Polite termination (SIGTERM).
    Terminate,
    /// Forceful termination (SIGKILL).
    Kill,
}

/// How an observed exit is classified.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitDisposition {
    /// Exit after termination began.
    Expected,
    /// Exit before readiness was confirmed (initial start or restart).
    DuringStartup,
    /// Exit while Ready, restart budget left.
    Restartable,
    /// Exit while Ready, restart budget spent.
    Fatal,
}

/// Report of one process exit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitNotice {
    /// Generation of the process that exited.
    pub generation: u64,
    /// Exit code; `None` when killed by a signal.
    pub code: Option<i32>,
    pub disposition: ExitDisposition,
}

#[derive(Default)]
struct Inner {
    spec: Option<LaunchSpec>,
    control: Option<mpsc::UnboundedSender<ProcessSignal>>,
    generation: u64,
    live: bool,
    launching: bool,
    unexpected_exits: u32,
}

enum Step {
    Exited(std::io::Result<Option<i32>>),
    Control(Option<ProcessSignal>),
}

/// Owns the backend process lifecycle.
pub struct ProcessSupervisor {
    launcher: Arc<dyn Launcher>,
    max_restarts: u32,
    state_tx: watch::Sender<BackendProcess>,
    exit_tx: mpsc::UnboundedSender<ExitNotice>,
    events: Option<mpsc::Sender<BackendEvent>>,
    inner: Mutex<Inner>,
}

impl ProcessSupervisor {
    /// Creates a supervisor and the receiver of its exit notices.
    ///
    /// `max_restarts` is the number of unexpected exits while Ready that
    /// are classified [`ExitDisposition::Restartable`].
    #[must_use]
    pub fn new(
        launcher: Arc<dyn Launcher>,
        max_restarts: u32,
    ) -> (Self, mpsc::UnboundedReceiver<ExitNotice>) {
        let (state_tx, _) = watch::channel(BackendProcess::new());
        let (exit_tx, exit_rx) = mpsc::unbounded_channel();
        let supervisor = Self {
            launcher,
            max_restarts,
            state_tx,
            exit_tx,
            events: None,
            inner: Mutex::new(Inner::default()),
        };
        (supervisor, exit_rx)
    }

    /// Forwards backend stdout events to `tx`.
    #[must_use]
    pub fn with_backend_events(mut self, tx: mpsc::Sender<BackendEvent>) -> Self {
        self.events = Some(tx);
        self
    }

    /// Read-only view of the process record.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<BackendProcess> {
        self.state_tx.subscribe()
    }

    #[must_use]
    pub fn snapshot(&self) -> BackendProcess {
        self.state_tx.borrow().clone()
    }

    #[must_use]
    pub fn state(&self) -> BackendState {
        self.state_tx.borrow().state
    }

    /// Generation of the most recently spawned process (0 before spawn).
    #[must_use]
    pub fn generation(&self) -> u64 {
        self.inner.lock().generation
    }

    /// Spawns the backend for the first time.
    ///
    /// # Errors
    ///
    /// - [`SupervisorError::AlreadySpawned`] on a second call
    /// - [`SupervisorError::Stopped`] if termination already began
    /// - [`SupervisorError::SpawnFailure`] if the executable cannot start
    pub async fn spawn(self: &Arc<Self>, spec: LaunchSpec) -> Result<BackendProcess, SupervisorError> {
        {
            let mut inner = self.inner.lock();
            if inner.generation > 0 || inner.launching {
                return Err(SupervisorError::AlreadySpawned);
            }
            if self.state() != BackendState::Starting {
                return Err(SupervisorError::Stopped);
            }
            inner.launching = true;
            inner.spec = Some(spec.clone());
        }
        self.launch(spec).await
    }

    /// Spawns a replacement after an unexpected exit.
    ///
    /// The state stays Degraded until [`mark_ready`](Self::mark_ready).
    ///
    /// # Errors
    ///
    /// - [`SupervisorError::NotRestartable`] unless Degraded with no live process
    /// - [`SupervisorError::Stopped`] if termination already began
    /// - [`SupervisorError::SpawnFailure`] if the executable cannot start
    pub async fn respawn(self: &Arc<Self>) -> Result<BackendProcess, SupervisorError> {
        let spec = {
            let mut inner = self.inner.lock();
            let state = self.state();
            if matches!(state, BackendState::Terminating | BackendState::Stopped) {
                return Err(SupervisorError::Stopped);
            }
            if state != BackendState::Degraded || inner.live || inner.launching {
                return Err(SupervisorError::NotRestartable(state));
            }
            let Some(spec) = inner.spec.clone() else {
                return Err(SupervisorError::NotRestartable(state));
            };
            inner.launching = true;
            spec
        };
        info!("Restarting backend process");
        self.launch(spec).await
    }

    /// Records a successful readiness probe.
    ///
    /// # Errors
    ///
    /// - [`SupervisorError::NotRunning`] if the process already exited
    /// - [`SupervisorError::InvalidTransition`] from Terminating or Stopped
    pub fn mark_ready(&self) -> Result<(), SupervisorError> {
        let inner = self.inner.lock();
        if !inner.live {
            return Err(SupervisorError::NotRunning);
        }

        let mut result = Ok(());
        self.state_tx.send_if_modified(|p| match p.transition(BackendState::Ready) {
            Ok(()) => true,
            Err(e) => {
                result = Err(e.into());
                false
            }
        });
        if result.is_ok() {
            info!(generation = inner.generation, "Backend ready");
        }
        result
    }

    /// Moves to Terminating, or straight to Stopped when nothing runs.
    ///
    /// Returns `true` if a process is live and must be signalled.
    pub(crate) fn begin_termination(&self) -> bool {
        let inner = self.inner.lock();
        let live = inner.live || inner.launching;
        self.state_tx.send_if_modified(|p| {
            let before = p.state;
            if p.state.can_transition_to(BackendState::Terminating) {
                p.state = BackendState::Terminating;
            }
            if !live && p.state == BackendState::Terminating {
                p.state = BackendState::Stopped;
            }
            p.state != before
        });
        live
    }

    /// Queues a control signal for the live process.
    ///
    /// Returns `false` if no process is live.
    pub(crate) fn signal(&self, signal: ProcessSignal) -> bool {
        let inner = self.inner.lock();
        inner
            .control
            .as_ref()
            .is_some_and(|tx| tx.send(signal).is_ok())
    }

    /// Resolves once the state is Stopped.
    pub(crate) async fn wait_stopped(&self) {
        let mut rx = self.state_tx.subscribe();
        let _ = rx.wait_for(|p| p.state == BackendState::Stopped).await;
    }

    async fn launch(self: &Arc<Self>, spec: LaunchSpec) -> Result<BackendProcess, SupervisorError> {
        let launched = self.launcher.launch(&spec).await;

        let mut inner = self.inner.lock();
        inner.launching = false;

        let mut child = match launched {
            Ok(child) => child,
            Err(e) => {
                error!(command = %spec.command, error = %e, "Backend spawn failed");
                // A termination that raced the launch saw `launching` and
                // is waiting for an exit that will never come.
                self.state_tx.send_if_modified(|p| {
                    if p.state == BackendState::Terminating {
                        p.state = BackendState::Stopped;
                        true
                    } else {
                        false
                    }
                });
                return Err(SupervisorError::SpawnFailure {
                    command: spec.command.clone(),
                    reason: e.to_string(),
                });
            }
        };

        let generation = inner.generation + 1;
        inner.generation = generation;
        inner.live = true;

        let (control_tx, control_rx) = mpsc::unbounded_channel();
        if self.state() == BackendState::Terminating {
            debug!(generation, "Termination began during launch");
            let _ = control_tx.send(ProcessSignal::Terminate);
        }
        inner.control = Some(control_tx);

        let pid = child.pid();
        self.state_tx.send_modify(|p| {
            p.started_at = Some(Utc::now());
            p.pid = pid;
            if generation > 1 {
                p.restarts += 1;
            }
        });
        let snapshot = self.snapshot();
        drop(inner);

        if let Some(output) = child.take_output() {
            spawn_output_pump(output, self.events.clone(), pid);
        }

        let supervisor = Arc::clone(self);
        tokio::spawn(async move {
            supervisor.monitor(generation, child, control_rx).await;
        });

        info!(?pid, generation, command = %spec.command, "Backend process spawned");
        Ok(snapshot)
    }

    async fn monitor(
        self: Arc<Self>,
        generation: u64,
        mut child: Box<dyn BackendChild>,
        mut control: mpsc::UnboundedReceiver<ProcessSignal>,
    ) {
        let pid = child.pid();
        let code = loop {
            let step = tokio::select! {
                status = child.wait() => Step::Exited(status),
                signal = control.recv() => Step::Control(signal),
            };

            match step {
                Step::Exited(Ok(code)) => break code,
                Step::Exited(Err(e)) => {
                    error!(?pid, error = %e, "Waiting on backend process failed");
                    break None;
                }
                Step::Control(Some(ProcessSignal::Terminate)) => {
                    debug!(?pid, "Sending polite termination signal");
                    if let Err(e) = child.terminate() {
                        warn!(?pid, error = %e, "Polite termination failed");
                    }
                }
                Step::Control(Some(ProcessSignal::Kill)) => {
                    warn!(?pid, "Killing backend process");
                    if let Err(e) = child.kill() {
                        error!(?pid, error = %e, "Kill failed");
                    }
                }
                Step::Control(None) => {
                    // Supervisor dropped; the child is killed on drop.
                    break child.wait().await.unwrap_or(None);
                }
            }
        };

        self.on_exit(generation, code);
    }

    fn on_exit(&self, generation: u64, code: Option<i32>) {
        let mut inner = self.inner.lock();
        if generation != inner.generation {
            debug!(generation, current = inner.generation, "Ignoring stale exit");
            return;
        }
        inner.live = false;
        inner.control = None;

        let max_restarts = self.max_restarts;
        let unexpected_exits = &mut inner.unexpected_exits;
        let mut disposition = ExitDisposition::Expected;
        self.state_tx.send_modify(|p| {
            p.last_exit_code = code;
            p.pid = None;
            disposition = match p.state {
                BackendState::Terminating => {
                    p.state = BackendState::Stopped;
                    ExitDisposition::Expected
                }
                BackendState::Stopped => ExitDisposition::Expected,
                BackendState::Starting | BackendState::Degraded => ExitDisposition::DuringStartup,
                BackendState::Ready => {
                    p.state = BackendState::Degraded;
                    *unexpected_exits += 1;
                    if *unexpected_exits <= max_restarts {
                        ExitDisposition::Restartable
                    } else {
                        ExitDisposition::Fatal
                    }
                }
            };
        });
        drop(inner);

        match disposition {
            ExitDisposition::Expected => info!(?code, generation, "Backend process stopped"),
            ExitDisposition::DuringStartup => {
                warn!(?code, generation, "Backend exited before becoming ready");
            }
            ExitDisposition::Restartable => warn!(?code, generation, "Backend exited unexpectedly"),
            ExitDisposition::Fatal => {
                error!(?code, generation, "Backend exited unexpectedly again");
            }
        }

        let _ = self.exit_tx.send(ExitNotice {
            generation,
            code,
            disposition,
        });
    }
}

impl std::fmt::Debug for ProcessSupervisor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessSupervisor")
            .field("max_restarts", &self.max_restarts)
            .field("process", &*self.state_tx.borrow())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{FakeLauncher, TerminateBehavior};
    use std::time::Duration;

    fn supervisor(
        launcher: &Arc<FakeLauncher>,
        max_restarts: u32,
    ) -> (Arc<ProcessSupervisor>, mpsc::UnboundedReceiver<ExitNotice>) {
        let (sup, exits) = ProcessSupervisor::new(Arc::clone(launcher) as Arc<dyn Launcher>, max_restarts);
        (Arc::new(sup), exits)
    }

    async fn next_exit(exits: &mut mpsc::UnboundedReceiver<ExitNotice>) -> ExitNotice {
        tokio::time::timeout(Duration::from_secs(5), exits.recv())
            .await
            .expect("exit notice should arrive")
            .expect("exit channel open")
    }

    #[tokio::test]
    async fn spawn_records_pid_and_start_time() {
        let launcher = Arc::new(FakeLauncher::new());
        let (sup, _exits) = supervisor(&launcher, 1);

        let process = sup
            .spawn(LaunchSpec::new("backend"))
            .await
            .expect("spawn should succeed");

        assert_eq!(process.state, BackendState::Starting);
        assert!(process.pid.is_some());
        assert!(process.started_at.is_some());
        assert_eq!(sup.generation(), 1);
        assert_eq!(launcher.launches().len(), 1);
    }

    #[tokio::test]
    async fn spawn_twice_is_rejected() {
        let launcher = Arc::new(FakeLauncher::new());
        let (sup, _exits) = supervisor(&launcher, 1);
        sup.spawn(LaunchSpec::new("backend")).await.expect("first spawn");

        let err = sup
            .spawn(LaunchSpec::new("backend"))
            .await
            .expect_err("second spawn must fail");
        assert_eq!(err, SupervisorError::AlreadySpawned);
    }

    #[tokio::test]
    async fn spawn_failure_is_reported() {
        let launcher = Arc::new(FakeLauncher::new());
        launcher.fail_next_launch();
        let (sup, _exits) = supervisor(&launcher, 1);

        let err = sup
            .spawn(LaunchSpec::new("missing-backend"))
            .await
            .expect_err("launch failure must surface");
        assert!(matches!(err, SupervisorError::SpawnFailure { ref command, .. } if command == "missing-backend"));
        assert_eq!(sup.state(), BackendState::Starting);
    }

    #[tokio::test]
    async fn exit_while_ready_degrades_then_turns_fatal() {
        let launcher = Arc::new(FakeLauncher::new());
        let (sup, mut exits) = supervisor(&launcher, 1);

        sup.spawn(LaunchSpec::new("backend")).await.expect("spawn");
        sup.mark_ready().expect("ready");
        launcher.process(0).exit(Some(1));

        let notice = next_exit(&mut exits).await;
        assert_eq!(notice.disposition, ExitDisposition::Restartable);
        assert_eq!(notice.code, Some(1));
        assert_eq!(sup.state(), BackendState::Degraded);
        assert_eq!(sup.snapshot().last_exit_code, Some(1));

        let process = sup.respawn().await.expect("respawn");
        assert_eq!(process.restarts, 1);
        assert_eq!(process.state, BackendState::Degraded);
        sup.mark_ready().expect("degraded -> ready");

        launcher.process(1).exit(Some(1));
        let notice = next_exit(&mut exits).await;
        assert_eq!(notice.generation, 2);
        assert_eq!(notice.disposition, ExitDisposition::Fatal);
        assert_eq!(sup.state(), BackendState::Degraded);
    }

    #[tokio::test]
    async fn exit_during_startup_keeps_state() {
        let launcher = Arc::new(FakeLauncher::new());
        let (sup, mut exits) = supervisor(&launcher, 1);

        sup.spawn(LaunchSpec::new("backend")).await.expect("spawn");
        launcher.process(0).exit(Some(2));

        let notice = next_exit(&mut exits).await;
        assert_eq!(notice.disposition, ExitDisposition::DuringStartup);
        assert_eq!(sup.state(), BackendState::Starting);
        assert_eq!(sup.mark_ready(), Err(SupervisorError::NotRunning));
    }

    #[tokio::test]
    async fn respawn_requires_degraded() {
        let launcher = Arc::new(FakeLauncher::new());
        let (sup, _exits) = supervisor(&launcher, 1);
        sup.spawn(LaunchSpec::new("backend")).await.expect("spawn");

        let err = sup.respawn().await.expect_err("starting is not restartable");
        assert_eq!(err, SupervisorError::NotRestartable(BackendState::Starting));
    }

    #[tokio::test]
    async fn terminate_signal_stops_process() {
        let launcher = Arc::new(FakeLauncher::new());
        let (sup, mut exits) = supervisor(&launcher, 1);
        sup.spawn(LaunchSpec::new("backend")).await.expect("spawn");
        sup.mark_ready().expect("ready");

        assert!(sup.begin_termination());
        assert_eq!(sup.state(), BackendState::Terminating);
        assert!(sup.signal(ProcessSignal::Terminate));

        let notice = next_exit(&mut exits).await;
        assert_eq!(notice.disposition, ExitDisposition::Expected);
        sup.wait_stopped().await;
        assert_eq!(sup.state(), BackendState::Stopped);
        assert_eq!(launcher.process(0).terminate_count(), 1);
        assert!(!sup.signal(ProcessSignal::Kill), "no live process after exit");
    }

    #[tokio::test]
    async fn kill_stops_a_process_ignoring_sigterm() {
        let launcher = Arc::new(FakeLauncher::new());
        launcher.set_terminate_behavior(TerminateBehavior::Ignore);
        let (sup, mut exits) = supervisor(&launcher, 1);
        sup.spawn(LaunchSpec::new("backend")).await.expect("spawn");

        assert!(sup.begin_termination());
        sup.signal(ProcessSignal::Terminate);
        sup.signal(ProcessSignal::Kill);

        let notice = next_exit(&mut exits).await;
        assert_eq!(notice.code, None);
        assert_eq!(sup.state(), BackendState::Stopped);
        assert_eq!(launcher.process(0).kill_count(), 1);
    }

    #[tokio::test]
    async fn termination_without_process_stops_immediately() {
        let launcher = Arc::new(FakeLauncher::new());
        let (sup, _exits) = supervisor(&launcher, 1);

        assert!(!sup.begin_termination());
        assert_eq!(sup.state(), BackendState::Stopped);

        let err = sup
            .spawn(LaunchSpec::new("backend"))
            .await
            .expect_err("stopped supervisor must not spawn");
        assert_eq!(err, SupervisorError::Stopped);
    }

    #[tokio::test]
    async fn backend_events_are_forwarded() {
        let launcher = Arc::new(FakeLauncher::new());
        launcher.set_stdout("{\"topic\":\"chat\",\"payload\":\"hello\"}\nplain log line\n");
        let (tx, mut rx) = mpsc::channel(4);
        let (sup, _exits) = ProcessSupervisor::new(Arc::clone(&launcher) as Arc<dyn Launcher>, 1);
        let sup = Arc::new(sup.with_backend_events(tx));

        sup.spawn(LaunchSpec::new("backend")).await.expect("spawn");

        let event = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("event should arrive")
            .expect("channel open");
        assert_eq!(event.topic, "chat");
    }
}
