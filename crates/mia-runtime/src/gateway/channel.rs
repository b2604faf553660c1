//! Channel kinds and bound endpoints.

use crate::config::GatewayConfig;
use mia_types::ClientId;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::SocketAddr;

/// The closed set of client-facing channel kinds.
///
/// Each kind has its own listener and exactly one router.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelKind {
    /// One request in, one response out.
    RequestReply,
    /// Backend events fanned out to subscribers.
    PubSub,
    /// Per-client bidirectional stream into the backend.
    Duplex,
}

impl ChannelKind {
    pub const ALL: [Self; 3] = [Self::RequestReply, Self::PubSub, Self::Duplex];

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::RequestReply => "request_reply",
            Self::PubSub => "pub_sub",
            Self::Duplex => "duplex",
        }
    }

    /// Configured bind address for this kind.
    #[must_use]
    pub fn bind_addr(self, config: &GatewayConfig) -> SocketAddr {
        match self {
            Self::RequestReply => config.request_addr,
            Self::PubSub => config.pubsub_addr,
            Self::Duplex => config.duplex_addr,
        }
    }

    /// Primary route served on this kind's listener.
    #[must_use]
    pub fn path(self) -> &'static str {
        match self {
            Self::RequestReply => "/request",
            Self::PubSub => "/events",
            Self::Duplex => "/stream",
        }
    }
}

impl fmt::Display for ChannelKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A bound channel and its active clients.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Channel {
    pub kind: ChannelKind,
    /// Actual bound address (resolved when configured with port 0).
    pub endpoint: SocketAddr,
    pub clients: Vec<ClientId>,
}

impl Channel {
    /// URL of the primary route, e.g. `ws://127.0.0.1:7411/events`.
    #[must_use]
    pub fn url(&self) -> String {
        let scheme = match self.kind {
            ChannelKind::RequestReply => "http",
            ChannelKind::PubSub | ChannelKind::Duplex => "ws",
        };
        format!("{scheme}://{}{}", self.endpoint, self.kind.path())
    }
}
