//! Gateway errors.
//!
//! Every variant is scoped to one client operation; none of them tears
//! the gateway down.
//!
//! | Variant | Code | Recoverable |
//! |---------|------|-------------|
//! | [`GatewayError::ChannelWriteFailure`] | `GATEWAY_CHANNEL_WRITE_FAILURE` | No |
//! | [`GatewayError::BackendUnavailable`] | `GATEWAY_BACKEND_UNAVAILABLE` | Yes |
//! | [`GatewayError::Backend`] | `GATEWAY_BACKEND_ERROR` | Yes |
//! | [`GatewayError::Timeout`] | `GATEWAY_TIMEOUT` | Yes |
//! | [`GatewayError::NotOpen`] | `GATEWAY_NOT_OPEN` | Yes |
//! | [`GatewayError::Closed`] | `GATEWAY_CLOSED` | No |
//! | [`GatewayError::UnknownClient`] | `GATEWAY_UNKNOWN_CLIENT` | No |
//! | [`GatewayError::WrongChannel`] | `GATEWAY_WRONG_CHANNEL` | No |
//! | [`GatewayError::InvalidMessage`] | `GATEWAY_INVALID_MESSAGE` | No |
//! | [`GatewayError::AlreadyOpen`] | `GATEWAY_ALREADY_OPEN` | No |
//! | [`GatewayError::Bind`] | `GATEWAY_BIND_FAILED` | No |

use super::channel::ChannelKind;
use crate::process::BackendState;
use mia_types::{ClientId, ErrorCode, RequestId};
use std::net::SocketAddr;
use thiserror::Error;

/// Channel gateway error.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum GatewayError {
    /// Writing to one client failed; that client is closed.
    #[error("write to {client} failed: {reason}")]
    ChannelWriteFailure { client: ClientId, reason: String },

    /// The backend is not in a state that serves this traffic.
    #[error("backend unavailable ({0})")]
    BackendUnavailable(BackendState),

    /// The backend answered with an error or could not be reached.
    #[error("backend error: {0}")]
    Backend(String),

    /// The backend did not answer in time.
    #[error("request timed out: {0}")]
    Timeout(RequestId),

    /// The gateway has not been opened yet.
    #[error("gateway is not open")]
    NotOpen,

    /// The gateway is closed to new traffic.
    #[error("gateway is closed")]
    Closed,

    #[error("unknown client: {0}")]
    UnknownClient(ClientId),

    /// Operation does not belong to the client's channel kind.
    #[error("{client} is not a {expected} client")]
    WrongChannel {
        client: ClientId,
        expected: ChannelKind,
    },

    #[error("invalid message: {0}")]
    InvalidMessage(String),

    #[error("gateway already open")]
    AlreadyOpen,

    #[error("failed to bind {addr}: {reason}")]
    Bind { addr: SocketAddr, reason: String },
}

impl ErrorCode for GatewayError {
    fn code(&self) -> &'static str {
        match self {
            Self::ChannelWriteFailure { .. } => "GATEWAY_CHANNEL_WRITE_FAILURE",
            Self::BackendUnavailable(_) => "GATEWAY_BACKEND_UNAVAILABLE",
            Self::Backend(_) => "GATEWAY_BACKEND_ERROR",
            Self::Timeout(_) => "GATEWAY_TIMEOUT",
            Self::NotOpen => "GATEWAY_NOT_OPEN",
            Self::Closed => "GATEWAY_CLOSED",
            Self::UnknownClient(_) => "GATEWAY_UNKNOWN_CLIENT",
            Self::WrongChannel { .. } => "GATEWAY_WRONG_CHANNEL",
            Self::InvalidMessage(_) => "GATEWAY_INVALID_MESSAGE",
            Self::AlreadyOpen => "GATEWAY_ALREADY_OPEN",
            Self::Bind { .. } => "GATEWAY_BIND_FAILED",
        }
    }

    fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::BackendUnavailable(_) | Self::Backend(_) | Self::Timeout(_) | Self::NotOpen
        )
    }
}
