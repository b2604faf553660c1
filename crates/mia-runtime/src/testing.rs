//! Test doubles for the host seams.
//!
//! Available in unit tests and, with the `test-utils` feature, to
//! integration tests and embedders.
//!
//! - [`FakeLauncher`] / [`FakeProcess`]: a scriptable backend process
//! - [`ScriptedHealth`]: a health check that turns healthy after N calls
//! - [`EchoLink`]: a backend link that echoes requests and stream messages

use crate::gateway::{BackendLink, BackendStream, GatewayError};
use crate::process::{BackendChild, BackendOutput, LaunchSpec, Launcher};
use crate::readiness::{HealthCheck, HealthStatus};
use async_trait::async_trait;
use mia_types::ClientId;
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};

const FAKE_PID_BASE: u32 = 40_000;

/// How a [`FakeProcess`] reacts to the polite termination signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminateBehavior {
    /// Exits at once with the given code.
    Exit(Option<i32>),
    /// Keeps running; only a kill stops it.
    Ignore,
}

impl Default for TerminateBehavior {
    fn default() -> Self {
        Self::Exit(Some(0))
    }
}

struct FakeShared {
    pid: u32,
    exit: watch::Sender<Option<Option<i32>>>,
    on_terminate: TerminateBehavior,
    terminates: AtomicU32,
    kills: AtomicU32,
}

/// Test-side handle of one fake backend process.
#[derive(Clone)]
pub struct FakeProcess {
    shared: Arc<FakeShared>,
}

impl FakeProcess {
    fn new(pid: u32, on_terminate: TerminateBehavior) -> Self {
        let (exit, _) = watch::channel(None);
        Self {
            shared: Arc::new(FakeShared {
                pid,
                exit,
                on_terminate,
                terminates: AtomicU32::new(0),
                kills: AtomicU32::new(0),
            }),
        }
    }

    /// Makes the process exit. Only the first call has an effect.
    pub fn exit(&self, code: Option<i32>) {
        self.shared.exit.send_if_modified(|state| {
            if state.is_some() {
                return false;
            }
            *state = Some(code);
            true
        });
    }

    #[must_use]
    pub fn has_exited(&self) -> bool {
        self.shared.exit.borrow().is_some()
    }

    #[must_use]
    pub fn pid(&self) -> u32 {
        self.shared.pid
    }

    #[must_use]
    pub fn terminate_count(&self) -> u32 {
        self.shared.terminates.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn kill_count(&self) -> u32 {
        self.shared.kills.load(Ordering::SeqCst)
    }
}

impl std::fmt::Debug for FakeProcess {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FakeProcess")
            .field("pid", &self.shared.pid)
            .field("exit", &*self.shared.exit.borrow())
            .finish()
    }
}

struct FakeChild {
    process: FakeProcess,
    exit_rx: watch::Receiver<Option<Option<i32>>>,
    output: Option<BackendOutput>,
}

#[async_trait]
impl BackendChild for FakeChild {
    fn pid(&self) -> Option<u32> {
        (!self.process.has_exited()).then_some(self.process.pid())
    }

    fn take_output(&mut self) -> Option<BackendOutput> {
        self.output.take()
    }

    fn terminate(&mut self) -> io::Result<()> {
        self.process.shared.terminates.fetch_add(1, Ordering::SeqCst);
        if let TerminateBehavior::Exit(code) = self.process.shared.on_terminate {
            self.process.exit(code);
        }
        Ok(())
    }

    fn kill(&mut self) -> io::Result<()> {
        self.process.shared.kills.fetch_add(1, Ordering::SeqCst);
        self.process.exit(None);
        Ok(())
    }

    async fn wait(&mut self) -> io::Result<Option<i32>> {
        let state = *self
            .exit_rx
            .wait_for(Option::is_some)
            .await
            .map_err(|_| io::Error::other("fake process dropped"))?;
        Ok(state.flatten())
    }
}

/// [`Launcher`] producing [`FakeProcess`]es.
#[derive(Default)]
pub struct FakeLauncher {
    processes: Mutex<Vec<FakeProcess>>,
    launches: Mutex<Vec<LaunchSpec>>,
    fail_next: AtomicBool,
    on_terminate: Mutex<TerminateBehavior>,
    stdout: Mutex<Option<String>>,
}

impl FakeLauncher {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// The next launch fails as if the executable were missing.
    pub fn fail_next_launch(&self) {
        self.fail_next.store(true, Ordering::SeqCst);
    }

    /// Termination behavior of processes launched from now on.
    pub fn set_terminate_behavior(&self, behavior: TerminateBehavior) {
        *self.on_terminate.lock() = behavior;
    }

    /// Stdout content of processes launched from now on.
    pub fn set_stdout(&self, stdout: impl Into<String>) {
        *self.stdout.lock() = Some(stdout.into());
    }

    #[must_use]
    pub fn launches(&self) -> Vec<LaunchSpec> {
        self.launches.lock().clone()
    }

    #[must_use]
    pub fn launch_count(&self) -> usize {
        self.launches.lock().len()
    }

    /// Handle of the `index`-th launched process.
    ///
    /// # Panics
    ///
    /// Panics if fewer processes were launched.
    #[must_use]
    pub fn process(&self, index: usize) -> FakeProcess {
        self.processes
            .lock()
            .get(index)
            .cloned()
            .unwrap_or_else(|| panic!("no fake process #{index} was launched"))
    }
}

#[async_trait]
impl Launcher for FakeLauncher {
    async fn launch(&self, spec: &LaunchSpec) -> io::Result<Box<dyn BackendChild>> {
        self.launches.lock().push(spec.clone());
        if self.fail_next.swap(false, Ordering::SeqCst) {
            return Err(io::Error::new(
                io::ErrorKind::NotFound,
                format!("{}: not found", spec.command),
            ));
        }

        let process = {
            let mut processes = self.processes.lock();
            let pid = FAKE_PID_BASE + processes.len() as u32;
            let process = FakeProcess::new(pid, *self.on_terminate.lock());
            processes.push(process.clone());
            process
        };
        let output = self.stdout.lock().clone().map(|text| BackendOutput {
            stdout: Box::new(io::Cursor::new(text.into_bytes())),
            stderr: Box::new(tokio::io::empty()),
        });

        Ok(Box::new(FakeChild {
            exit_rx: process.shared.exit.subscribe(),
            process,
            output,
        }))
    }
}

/// [`HealthCheck`] that reports healthy from the N-th call on.
#[derive(Debug, Default)]
pub struct ScriptedHealth {
    healthy_from: Option<u32>,
    healthy_until: Option<u32>,
    latency: Duration,
    calls: AtomicU32,
}

impl ScriptedHealth {
    /// Not ready for the first `n` checks, healthy afterwards.
    #[must_use]
    pub fn healthy_after(n: u32) -> Self {
        Self {
            healthy_from: Some(n),
            ..Self::default()
        }
    }

    /// Never healthy.
    #[must_use]
    pub fn never() -> Self {
        Self::default()
    }

    /// Refuses every check from the `n`-th call on, e.g. to keep a
    /// restarted backend from passing.
    #[must_use]
    pub fn unhealthy_from(mut self, n: u32) -> Self {
        self.healthy_until = Some(n);
        self
    }

    /// Each check takes `latency` before answering.
    #[must_use]
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    #[must_use]
    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl HealthCheck for ScriptedHealth {
    async fn check(&self) -> HealthStatus {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        let expired = self.healthy_until.is_some_and(|until| call >= until);
        match self.healthy_from {
            Some(n) if call >= n && !expired => HealthStatus::Healthy,
            _ => HealthStatus::NotReady(format!("check {} refused", call + 1)),
        }
    }
}

/// [`BackendLink`] that answers `{"echo": <payload>}` and echoes every
/// stream message back to the client.
#[derive(Default)]
pub struct EchoLink {
    requests: AtomicU32,
    fail_next: Mutex<Option<String>>,
    latency: Mutex<Duration>,
    refuse_streams: AtomicBool,
    streams: Mutex<HashMap<ClientId, Arc<Mutex<Vec<String>>>>>,
}

impl EchoLink {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// The next request fails with [`GatewayError::Backend`].
    pub fn fail_next_request(&self, message: impl Into<String>) {
        *self.fail_next.lock() = Some(message.into());
    }

    pub fn set_request_latency(&self, latency: Duration) {
        *self.latency.lock() = latency;
    }

    /// Makes `open_stream` fail.
    pub fn refuse_streams(&self) {
        self.refuse_streams.store(true, Ordering::SeqCst);
    }

    #[must_use]
    pub fn requests(&self) -> u32 {
        self.requests.load(Ordering::SeqCst)
    }

    /// Messages received on `client`'s stream, in arrival order.
    #[must_use]
    pub fn stream_messages(&self, client: ClientId) -> Vec<String> {
        self.streams
            .lock()
            .get(&client)
            .map(|log| log.lock().clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl BackendLink for EchoLink {
    async fn request(&self, payload: Value) -> Result<Value, GatewayError> {
        self.requests.fetch_add(1, Ordering::SeqCst);
        let latency = *self.latency.lock();
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
        if let Some(message) = self.fail_next.lock().take() {
            return Err(GatewayError::Backend(message));
        }
        Ok(json!({ "echo": payload }))
    }

    async fn open_stream(&self, client: ClientId) -> Result<BackendStream, GatewayError> {
        if self.refuse_streams.load(Ordering::SeqCst) {
            return Err(GatewayError::Backend("stream refused".into()));
        }

        let log = Arc::new(Mutex::new(Vec::new()));
        self.streams.lock().insert(client, Arc::clone(&log));

        let (outbound_tx, mut outbound_rx) = mpsc::channel::<String>(64);
        let (inbound_tx, inbound_rx) = mpsc::channel::<String>(64);
        tokio::spawn(async move {
            while let Some(message) = outbound_rx.recv().await {
                log.lock().push(message.clone());
                if inbound_tx.send(message).await.is_err() {
                    break;
                }
            }
        });

        Ok(BackendStream {
            outbound: outbound_tx,
            inbound: inbound_rx,
        })
    }
}
