//! Shared helpers for integration tests.

#![allow(dead_code)]

use mia_runtime::config::{GatewayConfig, HostConfig};
use mia_runtime::gateway::BackendLink;
use mia_runtime::host::{BackendHost, HostEvent};
use mia_runtime::process::Launcher;
use mia_runtime::readiness::HealthCheck;
use mia_runtime::testing::{EchoLink, FakeLauncher, ScriptedHealth};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

pub const EVENT_TIMEOUT: Duration = Duration::from_secs(5);

/// Config with short timings and ephemeral gateway ports.
pub fn test_config() -> HostConfig {
    let mut config = HostConfig::default();
    config.backend.command = "mia-backend".into();
    config.backend.args = vec!["--mode".into(), "{mode}".into(), "--port".into(), "{port}".into()];
    config.health.interval_ms = 20;
    config.health.deadline_ms = 400;
    config.gateway = GatewayConfig::ephemeral();
    config.gateway.request_timeout_ms = 1_000;
    config.shutdown.deadline_ms = 300;
    config.shutdown.drain_ms = 100;
    config.shutdown.kill_grace_ms = 300;
    config
}

/// A host wired to fakes, with its event stream.
pub struct TestHost {
    pub host: Arc<BackendHost>,
    pub events: mpsc::UnboundedReceiver<HostEvent>,
    pub launcher: Arc<FakeLauncher>,
    pub health: Arc<ScriptedHealth>,
    pub link: Arc<EchoLink>,
}

impl TestHost {
    pub fn new(health: ScriptedHealth) -> Self {
        Self::with_config(test_config(), FakeLauncher::new(), health)
    }

    pub fn with_config(config: HostConfig, launcher: FakeLauncher, health: ScriptedHealth) -> Self {
        let launcher = Arc::new(launcher);
        let health = Arc::new(health);
        let link = Arc::new(EchoLink::new());

        let host = BackendHost::builder(mia_runtime::config::StaticResolver(config))
            .with_launcher(Arc::clone(&launcher) as Arc<dyn Launcher>)
            .with_health_check(Arc::clone(&health) as Arc<dyn HealthCheck>)
            .with_backend_link(Arc::clone(&link) as Arc<dyn BackendLink>)
            .build()
            .expect("host should build");
        let events = host.take_events().expect("events available once");

        Self {
            host: Arc::new(host),
            events,
            launcher,
            health,
            link,
        }
    }

    /// Next host event, failing the test after [`EVENT_TIMEOUT`].
    pub async fn next_event(&mut self) -> HostEvent {
        tokio::time::timeout(EVENT_TIMEOUT, self.events.recv())
            .await
            .expect("host event should arrive")
            .expect("host event channel open")
    }
}

/// Polls `condition` every 10 ms until it holds, failing after 5 s.
pub async fn eventually(what: &str, mut condition: impl FnMut() -> bool) {
    let poll = async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    };
    tokio::time::timeout(EVENT_TIMEOUT, poll)
        .await
        .unwrap_or_else(|_| panic!("timed out waiting for {what}"));
}
