//! MIA Runtime - backend supervision and client gateway.
//!
//! The desktop shell starts one local AI backend process and exposes it
//! to the frontend through three kinds of channels. This crate owns that
//! process and those channels.
//!
//! # Crate Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │  mia-types     : ClientId, ProcessId, RequestId, ErrorCode  │
//! └─────────────────────────────────────────────────────────────┘
//!                               ↓
//! ┌─────────────────────────────────────────────────────────────┐
//! │                   Runtime Layer (THIS CRATE)                 │
//! ├─────────────────────────────────────────────────────────────┤
//! │  process/   : ProcessSupervisor, Launcher, BackendProcess    │
//! │  readiness  : ReadinessProber, HealthCheck                   │
//! │  gateway/   : ChannelGateway, BackendLink, HTTP/WS routers   │
//! │  shutdown   : ShutdownCoordinator                            │
//! │  update     : UpdateOrchestrator                             │
//! │  host/      : BackendHost (composition + control flow)       │
//! └─────────────────────────────────────────────────────────────┘
//!                               ↓
//! ┌─────────────────────────────────────────────────────────────┐
//! │  mia-launcher  : host binary (CLI, tracing, signals)         │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Modules
//!
//! ## [`process`] - Backend Process
//!
//! - [`ProcessSupervisor`](process::ProcessSupervisor): spawn, monitor, restart
//! - [`Launcher`](process::Launcher): OS seam, [`TokioLauncher`](process::TokioLauncher)
//! - [`BackendProcess`](process::BackendProcess): the supervised record
//!
//! ## [`readiness`] - Health Polling
//!
//! - [`ReadinessProber`](readiness::ReadinessProber): fixed-interval poll with deadline
//!
//! ## [`gateway`] - Client Channels
//!
//! - [`ChannelGateway`](gateway::ChannelGateway): request/reply, pub/sub, duplex
//!
//! ## [`shutdown`] / [`update`]
//!
//! - [`ShutdownCoordinator`](shutdown::ShutdownCoordinator): graceful, then forceful
//! - [`UpdateOrchestrator`](update::UpdateOrchestrator): updater events to pub/sub
//!
//! ## [`host`] - Composition
//!
//! - [`BackendHost`](host::BackendHost): start, status, shutdown
//!
//! ## [`config`] - Configuration
//!
//! Configuration priority: Environment > Project > Global > Default

pub mod config;
pub mod event;
pub mod gateway;
pub mod host;
pub mod process;
pub mod readiness;
pub mod shutdown;
pub mod update;

#[cfg(any(test, feature = "test-utils"))]
pub mod testing;

// Re-exports for convenience
pub use config::{ConfigError, ConfigLoader, ConfigResolver, HostConfig};
pub use event::BackendEvent;
pub use gateway::{Channel, ChannelGateway, ChannelKind, GatewayError};
pub use host::{BackendHost, BackendHostBuilder, HostError, HostEvent};
pub use process::{BackendProcess, BackendState, ProcessSupervisor, SupervisorError};
pub use readiness::{ProbeError, ReadinessProber};
pub use shutdown::{ShutdownCoordinator, ShutdownOutcome, ShutdownStage};
pub use update::{UpdateEvent, UpdateFeed, UpdateOrchestrator};
