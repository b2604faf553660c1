//! Pub/sub delivery.
//!
//! Each subscriber owns a bounded FIFO queue. Delivery uses `try_send` so
//! a slow client never stalls the publisher or other subscribers; a full
//! or closed queue fails only that client.

use crate::event::{BackendEvent, TOPIC_ALL};
use serde::Deserialize;
use std::collections::BTreeSet;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

/// Receiving end handed to a subscriber.
pub type EventStream = mpsc::Receiver<Arc<BackendEvent>>;

/// Sending half of one subscriber queue.
#[derive(Debug, Clone)]
pub(crate) struct Subscriber {
    queue: mpsc::Sender<Arc<BackendEvent>>,
}

impl Subscriber {
    pub(crate) fn new(buffer: usize) -> (Self, EventStream) {
        let (queue, rx) = mpsc::channel(buffer.max(1));
        (Self { queue }, rx)
    }

    /// Enqueues without waiting. The error is the failure reason.
    pub(crate) fn deliver(&self, event: &Arc<BackendEvent>) -> Result<(), &'static str> {
        match self.queue.try_send(Arc::clone(event)) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => Err("subscriber queue full"),
            Err(TrySendError::Closed(_)) => Err("subscriber disconnected"),
        }
    }
}

/// Returns `true` if a subscription set receives events on `topic`.
#[must_use]
pub fn topic_matches(topics: &BTreeSet<String>, topic: &str) -> bool {
    topics.contains(TOPIC_ALL) || topics.contains(topic)
}

/// Frame sent by a pub/sub client.
///
/// ```json
/// {"op": "subscribe", "topics": ["update", "backend.state"]}
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum SubscriberFrame {
    Subscribe { topics: Vec<String> },
    Unsubscribe { topics: Vec<String> },
}
