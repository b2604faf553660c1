//! Update lifecycle relay.
//!
//! The external updater pushes [`UpdateEvent`]s into an [`UpdateFeed`];
//! the [`UpdateOrchestrator`] republishes each one on the `update`
//! pub/sub topic. Checking, downloading and installing stay with the
//! updater.

use crate::event::{BackendEvent, TOPIC_UPDATE};
use crate::gateway::ChannelGateway;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

const FEED_BUFFER: usize = 16;

/// One updater lifecycle event.
///
/// Serialized as `{"kind": "available", "version": "1.2.0"}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum UpdateEvent {
    Checking,
    Available { version: String },
    Downloaded { version: String },
    Error { message: String },
}

impl UpdateEvent {
    /// The pub/sub event carrying this update event.
    #[must_use]
    pub fn to_backend_event(&self) -> BackendEvent {
        let payload = serde_json::to_value(self).unwrap_or_default();
        BackendEvent::new(TOPIC_UPDATE, payload)
    }
}

/// Sending half handed to the external updater.
#[derive(Debug, Clone)]
pub struct UpdateFeed {
    tx: mpsc::Sender<UpdateEvent>,
}

impl UpdateFeed {
    /// Queues one event for relay.
    ///
    /// # Errors
    ///
    /// Returns the event back if the relay has stopped.
    pub async fn send(&self, event: UpdateEvent) -> Result<(), mpsc::error::SendError<UpdateEvent>> {
        self.tx.send(event).await
    }
}

/// Republishes update events on the `update` topic.
#[derive(Debug)]
pub struct UpdateOrchestrator {
    rx: mpsc::Receiver<UpdateEvent>,
}

impl UpdateOrchestrator {
    /// Creates the feed and its relay.
    #[must_use]
    pub fn channel() -> (UpdateFeed, Self) {
        let (tx, rx) = mpsc::channel(FEED_BUFFER);
        (UpdateFeed { tx }, Self { rx })
    }

    /// Relays until every feed is dropped or `cancel` fires.
    ///
    /// Returns the number of events relayed.
    pub async fn run(mut self, gateway: Arc<ChannelGateway>, cancel: CancellationToken) -> usize {
        let mut relayed = 0;
        loop {
            let event = tokio::select! {
                () = cancel.cancelled() => break,
                event = self.rx.recv() => match event {
                    Some(event) => event,
                    None => break,
                },
            };

            if let UpdateEvent::Error { message } = &event {
                info!(%message, "Updater reported an error");
            }
            let delivered = gateway.publish(event.to_backend_event());
            debug!(?event, delivered, "Update event relayed");
            relayed += 1;
        }
        relayed
    }
}
