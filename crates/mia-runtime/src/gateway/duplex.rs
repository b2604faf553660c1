//! Duplex stream writes.
//!
//! A client's outbound stream is guarded by one async mutex. A message is
//! written entirely while the lock is held, so the parts of a multi-part
//! message never interleave with another write from the same client.
//! Different clients have different locks.

use serde_json::Value;
use tokio::sync::{mpsc, Mutex};

/// One message from a duplex client to the backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DuplexMessage {
    Single(String),
    /// Written back-to-back without interleaving.
    Parts(Vec<String>),
}

impl DuplexMessage {
    /// Interprets a client text frame.
    ///
    /// `{"parts": [...]}` becomes [`DuplexMessage::Parts`]; string parts
    /// are sent verbatim and other values as JSON. Anything else is a
    /// single message.
    #[must_use]
    pub fn parse(frame: &str) -> Self {
        if let Ok(Value::Object(mut map)) = serde_json::from_str::<Value>(frame) {
            if map.len() == 1 {
                if let Some(Value::Array(parts)) = map.remove("parts") {
                    return Self::Parts(
                        parts
                            .into_iter()
                            .map(|part| match part {
                                Value::String(s) => s,
                                other => other.to_string(),
                            })
                            .collect(),
                    );
                }
            }
        }
        Self::Single(frame.to_string())
    }

    #[must_use]
    pub fn part_count(&self) -> usize {
        match self {
            Self::Single(_) => 1,
            Self::Parts(parts) => parts.len(),
        }
    }
}

/// Serialized writer into one backend stream.
#[derive(Debug)]
pub(crate) struct DuplexWriter {
    outbound: Mutex<mpsc::Sender<String>>,
}

impl DuplexWriter {
    pub(crate) fn new(outbound: mpsc::Sender<String>) -> Self {
        Self {
            outbound: Mutex::new(outbound),
        }
    }

    /// Writes every part in order. The error is the failure reason.
    pub(crate) async fn write(&self, message: DuplexMessage) -> Result<(), String> {
        let outbound = self.outbound.lock().await;
        let parts = match message {
            DuplexMessage::Single(text) => vec![text],
            DuplexMessage::Parts(parts) => parts,
        };
        for part in parts {
            outbound
                .send(part)
                .await
                .map_err(|_| "backend stream closed".to_string())?;
        }
        Ok(())
    }
}
