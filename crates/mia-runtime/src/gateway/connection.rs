//! Client connection records.

use super::channel::ChannelKind;
use chrono::{DateTime, Utc};
use mia_types::ClientId;
use serde::Serialize;
use std::collections::BTreeSet;

/// Lifecycle of one client connection.
///
/// ```text
/// Connected ──subscribe──► Subscribed ──► Closed
///     └──────────────────────────────────────┘
/// ```
///
/// RequestReply and Duplex clients are Subscribed on attach.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Connected,
    Subscribed,
    Closed,
}

/// One attached client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ClientConnection {
    pub id: ClientId,
    pub kind: ChannelKind,
    pub state: ConnectionState,
    /// Subscribed topics (PubSub only).
    pub topics: BTreeSet<String>,
    pub connected_at: DateTime<Utc>,
}

impl ClientConnection {
    pub(crate) fn new(kind: ChannelKind) -> Self {
        let state = match kind {
            ChannelKind::PubSub => ConnectionState::Connected,
            ChannelKind::RequestReply | ChannelKind::Duplex => ConnectionState::Subscribed,
        };
        Self {
            id: ClientId::new(),
            kind,
            state,
            topics: BTreeSet::new(),
            connected_at: Utc::now(),
        }
    }

    #[must_use]
    pub fn is_open(&self) -> bool {
        self.state != ConnectionState::Closed
    }

    /// Adds topics and moves to Subscribed.
    pub(crate) fn subscribe<I, S>(&mut self, topics: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.topics.extend(topics.into_iter().map(Into::into));
        if self.state == ConnectionState::Connected {
            self.state = ConnectionState::Subscribed;
        }
    }

    /// Removes topics. The state stays Subscribed even with no topics left.
    pub(crate) fn unsubscribe<'a, I>(&mut self, topics: I)
    where
        I: IntoIterator<Item = &'a str>,
    {
        for topic in topics {
            self.topics.remove(topic);
        }
    }

    pub(crate) fn close(&mut self) {
        self.state = ConnectionState::Closed;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn initial_state_depends_on_kind() {
        assert_eq!(
            ClientConnection::new(ChannelKind::PubSub).state,
            ConnectionState::Connected
        );
        assert_eq!(
            ClientConnection::new(ChannelKind::Duplex).state,
            ConnectionState::Subscribed
        );
        assert_eq!(
            ClientConnection::new(ChannelKind::RequestReply).state,
            ConnectionState::Subscribed
        );
    }

    #[test]
    fn subscribe_and_unsubscribe() {
        let mut conn = ClientConnection::new(ChannelKind::PubSub);
        conn.subscribe(["update", "chat"]);
        assert_eq!(conn.state, ConnectionState::Subscribed);
        assert_eq!(conn.topics.len(), 2);

        conn.unsubscribe(["chat", "missing"]);
        assert_eq!(conn.topics.iter().collect::<Vec<_>>(), vec!["update"]);
        assert_eq!(conn.state, ConnectionState::Subscribed);

        conn.close();
        assert!(!conn.is_open());
    }
}
