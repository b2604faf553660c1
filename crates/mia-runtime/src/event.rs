//! Backend events delivered over the pub/sub channel.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Topic that matches every event.
pub const TOPIC_ALL: &str = "*";
/// Topic carrying updater lifecycle events.
pub const TOPIC_UPDATE: &str = "update";
/// Topic carrying backend state changes.
pub const TOPIC_BACKEND_STATE: &str = "backend.state";

/// One event published to subscribers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackendEvent {
    pub topic: String,
    pub payload: Value,
}

impl BackendEvent {
    #[must_use]
    pub fn new(topic: impl Into<String>, payload: Value) -> Self {
        Self {
            topic: topic.into(),
            payload,
        }
    }

    /// Parses a backend output line of the form `{"topic": .., "payload": ..}`.
    ///
    /// Returns `None` for anything else, including JSON without a string
    /// `topic`.
    #[must_use]
    pub fn from_line(line: &str) -> Option<Self> {
        let trimmed = line.trim();
        if !trimmed.starts_with('{') {
            return None;
        }
        let event: Self = serde_json::from_str(trimmed).ok()?;
        if event.topic.is_empty() {
            return None;
        }
        Some(event)
    }
}
