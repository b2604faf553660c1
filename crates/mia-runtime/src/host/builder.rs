//! [`BackendHost`] construction.

use super::{BackendHost, HostError, Shared};
use crate::config::{ConfigResolver, HostConfig, StaticResolver};
use crate::gateway::{BackendLink, ChannelGateway, HttpBackendLink};
use crate::process::{Launcher, ProcessSupervisor, TokioLauncher};
use crate::readiness::{HealthCheck, HttpHealthCheck, ReadinessProber};
use crate::shutdown::ShutdownCoordinator;
use crate::update::UpdateOrchestrator;
use parking_lot::Mutex;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

const BACKEND_EVENT_BUFFER: usize = 256;

/// Builder for [`BackendHost`].
///
/// The OS process, the health check and the backend transport default to
/// the real implementations built from configuration; tests swap them
/// for fakes.
///
/// # Example
///
/// ```ignore
/// use mia_runtime::config::ConfigLoader;
/// use mia_runtime::host::BackendHost;
///
/// let host = BackendHost::builder(ConfigLoader::new().with_project_root("."))
///     .build()?;
/// let channels = host.start().await?;
/// ```
pub struct BackendHostBuilder {
    resolver: Box<dyn ConfigResolver>,
    launcher: Option<Arc<dyn Launcher>>,
    health: Option<Arc<dyn HealthCheck>>,
    link: Option<Arc<dyn BackendLink>>,
}

impl BackendHostBuilder {
    /// Creates a builder that resolves configuration through `resolver`.
    #[must_use]
    pub fn new(resolver: impl ConfigResolver + 'static) -> Self {
        Self {
            resolver: Box::new(resolver),
            launcher: None,
            health: None,
            link: None,
        }
    }

    /// Creates a builder for an already resolved configuration.
    #[must_use]
    pub fn from_config(config: HostConfig) -> Self {
        Self::new(StaticResolver(config))
    }

    #[must_use]
    pub fn with_launcher(mut self, launcher: Arc<dyn Launcher>) -> Self {
        self.launcher = Some(launcher);
        self
    }

    #[must_use]
    pub fn with_health_check(mut self, health: Arc<dyn HealthCheck>) -> Self {
        self.health = Some(health);
        self
    }

    #[must_use]
    pub fn with_backend_link(mut self, link: Arc<dyn BackendLink>) -> Self {
        self.link = Some(link);
        self
    }

    /// Resolves and validates configuration, then wires the components.
    ///
    /// Nothing is spawned or bound until [`BackendHost::start`].
    ///
    /// # Errors
    ///
    /// - [`HostError::Config`] if configuration fails to resolve or validate
    /// - [`HostError::Readiness`] if the HTTP health client cannot be built
    pub fn build(self) -> Result<BackendHost, HostError> {
        let config = self
            .resolver
            .resolve()
            .map_err(|e| HostError::Config(e.to_string()))?;
        config
            .validate()
            .map_err(|e| HostError::Config(e.to_string()))?;

        let launcher: Arc<dyn Launcher> = match self.launcher {
            Some(launcher) => launcher,
            None => Arc::new(TokioLauncher),
        };
        let health: Arc<dyn HealthCheck> = match self.health {
            Some(health) => health,
            None => Arc::new(
                HttpHealthCheck::from_config(&config.backend, &config.health)
                    .map_err(HostError::Readiness)?,
            ),
        };
        let link: Arc<dyn BackendLink> = match self.link {
            Some(link) => link,
            None => Arc::new(HttpBackendLink::from_config(&config.backend)),
        };

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (backend_events_tx, backend_events) = mpsc::channel(BACKEND_EVENT_BUFFER);
        let (supervisor, exits) = ProcessSupervisor::new(launcher, config.restart.max_restarts);
        let supervisor = Arc::new(supervisor.with_backend_events(backend_events_tx));

        let gateway = Arc::new(ChannelGateway::new(
            config.gateway.clone(),
            supervisor.subscribe(),
            link,
        ));
        let session = CancellationToken::new();
        let coordinator = Arc::new(
            ShutdownCoordinator::new(
                Arc::clone(&supervisor),
                Arc::clone(&gateway),
                session.clone(),
                config.shutdown.clone(),
            )
            .with_host_events(events_tx.clone()),
        );
        let (update_feed, updates) = UpdateOrchestrator::channel();

        let shared = Arc::new(Shared {
            supervisor,
            gateway,
            coordinator,
            prober: ReadinessProber::from_config(health, &config.health),
            session,
            events: events_tx,
            fatal_reported: AtomicBool::new(false),
        });

        Ok(BackendHost {
            config,
            shared,
            started: AtomicBool::new(false),
            pending: Mutex::new(Some(super::Pending {
                exits,
                backend_events,
                updates,
            })),
            events: Mutex::new(Some(events_rx)),
            update_feed,
        })
    }
}
