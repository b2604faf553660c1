//! HTTP and WebSocket front of each channel kind.
//!
//! | Kind | Route | Transport |
//! |------|-------|-----------|
//! | RequestReply | `POST /request`, `GET /status` | JSON over HTTP |
//! | PubSub | `GET /events` | WebSocket, server pushes [`BackendEvent`]s |
//! | Duplex | `GET /stream` | WebSocket, bridged to a backend stream |
//!
//! [`BackendEvent`]: crate::event::BackendEvent

use super::{ChannelGateway, ChannelKind, DuplexMessage, DuplexSession, EventStream, GatewayError, SubscriberFrame};
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use futures_util::{SinkExt, StreamExt};
use mia_types::{ClientId, ErrorCode};
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::{debug, warn};

type SharedGateway = Arc<ChannelGateway>;

/// Router for one channel kind.
pub(crate) fn router(kind: ChannelKind, gateway: SharedGateway) -> Router {
    let router = match kind {
        ChannelKind::RequestReply => Router::new()
            .route(ChannelKind::RequestReply.path(), post(handle_request))
            .route("/status", get(handle_status)),
        ChannelKind::PubSub => Router::new().route(ChannelKind::PubSub.path(), get(handle_events)),
        ChannelKind::Duplex => Router::new().route(ChannelKind::Duplex.path(), get(handle_stream)),
    };
    router.with_state(gateway)
}

/// HTTP status for a gateway error.
pub(crate) fn status_code(err: &GatewayError) -> StatusCode {
    match err {
        GatewayError::BackendUnavailable(_) | GatewayError::NotOpen | GatewayError::Closed => {
            StatusCode::SERVICE_UNAVAILABLE
        }
        GatewayError::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
        GatewayError::Backend(_) => StatusCode::BAD_GATEWAY,
        GatewayError::InvalidMessage(_) | GatewayError::WrongChannel { .. } => StatusCode::BAD_REQUEST,
        GatewayError::UnknownClient(_) => StatusCode::NOT_FOUND,
        GatewayError::ChannelWriteFailure { .. }
        | GatewayError::AlreadyOpen
        | GatewayError::Bind { .. } => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn error_body(err: &GatewayError) -> Value {
    json!({ "error": { "code": err.code(), "message": err.to_string() } })
}

fn error_response(err: &GatewayError) -> Response {
    (status_code(err), Json(error_body(err))).into_response()
}

// === RequestReply ===

async fn handle_request(State(gateway): State<SharedGateway>, Json(payload): Json<Value>) -> Response {
    let client = match gateway.connect_requester() {
        Ok(client) => client,
        Err(e) => return error_response(&e),
    };
    let result = gateway.request(client, payload).await;
    gateway.disconnect(client);

    match result {
        Ok(reply) => Json(reply).into_response(),
        Err(e) => error_response(&e),
    }
}

async fn handle_status(State(gateway): State<SharedGateway>) -> Response {
    Json(gateway.status_report()).into_response()
}

// === PubSub ===

async fn handle_events(State(gateway): State<SharedGateway>, ws: WebSocketUpgrade) -> Response {
    let (client, events) = match gateway.connect_subscriber() {
        Ok(attached) => attached,
        Err(e) => return error_response(&e),
    };
    let on_failure = Arc::clone(&gateway);
    ws.on_failed_upgrade(move |e| {
        warn!(%client, error = %e, "Subscriber upgrade failed");
        on_failure.disconnect(client);
    })
    .on_upgrade(move |socket| pubsub_session(gateway, client, events, socket))
}

enum PubSubStep {
    Deliver(String),
    Frame(String),
    Stop,
}

async fn pubsub_session(gateway: SharedGateway, client: ClientId, mut events: EventStream, socket: WebSocket) {
    let (mut sender, mut receiver) = socket.split();
    let stop = gateway.listener_token();

    loop {
        let step = tokio::select! {
            () = stop.cancelled() => PubSubStep::Stop,
            event = events.recv() => match event {
                Some(event) => match serde_json::to_string(&*event) {
                    Ok(text) => PubSubStep::Deliver(text),
                    Err(e) => {
                        warn!(%client, error = %e, "Event not serializable");
                        continue;
                    }
                },
                // Closed by the gateway.
                None => PubSubStep::Stop,
            },
            frame = receiver.next() => match frame {
                Some(Ok(Message::Text(text))) => PubSubStep::Frame(text.as_str().to_owned()),
                Some(Ok(Message::Close(_)) | Err(_)) | None => PubSubStep::Stop,
                Some(Ok(_)) => continue,
            },
        };

        match step {
            PubSubStep::Deliver(text) => {
                if let Err(e) = sender.send(Message::Text(text.into())).await {
                    let err = GatewayError::ChannelWriteFailure {
                        client,
                        reason: e.to_string(),
                    };
                    warn!(%client, error = %err, "Subscriber write failed");
                    break;
                }
            }
            PubSubStep::Frame(text) => {
                let result = match serde_json::from_str::<SubscriberFrame>(&text) {
                    Ok(SubscriberFrame::Subscribe { topics }) => gateway.subscribe(client, topics),
                    Ok(SubscriberFrame::Unsubscribe { topics }) => {
                        gateway.unsubscribe(client, topics.iter().map(String::as_str))
                    }
                    Err(e) => Err(GatewayError::InvalidMessage(e.to_string())),
                };
                if let Err(e) = result {
                    debug!(%client, error = %e, "Rejected subscriber frame");
                    let reply = error_body(&e).to_string();
                    if sender.send(Message::Text(reply.into())).await.is_err() {
                        break;
                    }
                }
            }
            PubSubStep::Stop => break,
        }
    }

    gateway.disconnect(client);
    let _ = sender.close().await;
}

// === Duplex ===

async fn handle_stream(State(gateway): State<SharedGateway>, ws: WebSocketUpgrade) -> Response {
    let session = match gateway.connect_duplex().await {
        Ok(session) => session,
        Err(e) => return error_response(&e),
    };
    let client = session.client;
    let on_failure = Arc::clone(&gateway);
    ws.on_failed_upgrade(move |e| {
        warn!(%client, error = %e, "Duplex upgrade failed");
        on_failure.disconnect(client);
    })
    .on_upgrade(move |socket| duplex_session(gateway, session, socket))
}

enum DuplexStep {
    FromBackend(String),
    FromClient(String),
    Stop,
}

async fn duplex_session(gateway: SharedGateway, session: DuplexSession, socket: WebSocket) {
    let DuplexSession { client, mut inbound } = session;
    let (mut sender, mut receiver) = socket.split();
    let stop = gateway.listener_token();

    loop {
        let step = tokio::select! {
            () = stop.cancelled() => DuplexStep::Stop,
            message = inbound.recv() => match message {
                Some(text) => DuplexStep::FromBackend(text),
                None => DuplexStep::Stop,
            },
            frame = receiver.next() => match frame {
                Some(Ok(Message::Text(text))) => DuplexStep::FromClient(text.as_str().to_owned()),
                Some(Ok(Message::Binary(bytes))) => match String::from_utf8(bytes.to_vec()) {
                    Ok(text) => DuplexStep::FromClient(text),
                    Err(_) => continue,
                },
                Some(Ok(Message::Close(_)) | Err(_)) | None => DuplexStep::Stop,
                Some(Ok(_)) => continue,
            },
        };

        match step {
            DuplexStep::FromBackend(text) => {
                if let Err(e) = sender.send(Message::Text(text.into())).await {
                    warn!(%client, error = %e, "Duplex client write failed");
                    break;
                }
            }
            DuplexStep::FromClient(text) => {
                match gateway.send_duplex(client, DuplexMessage::parse(&text)).await {
                    Ok(()) => {}
                    Err(e @ (GatewayError::ChannelWriteFailure { .. } | GatewayError::Closed)) => {
                        let _ = sender.send(Message::Text(error_body(&e).to_string().into())).await;
                        break;
                    }
                    Err(e) => {
                        let reply = error_body(&e).to_string();
                        if sender.send(Message::Text(reply.into())).await.is_err() {
                            break;
                        }
                    }
                }
            }
            DuplexStep::Stop => break,
        }
    }

    gateway.disconnect(client);
    let _ = sender.close().await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use mia_types::RequestId;

    #[test]
    fn status_codes() {
        assert_eq!(
            status_code(&GatewayError::BackendUnavailable(crate::process::BackendState::Degraded)),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            status_code(&GatewayError::Timeout(RequestId::new())),
            StatusCode::GATEWAY_TIMEOUT
        );
        assert_eq!(
            status_code(&GatewayError::Backend("x".into())),
            StatusCode::BAD_GATEWAY
        );
    }

    #[test]
    fn error_body_carries_code() {
        let body = error_body(&GatewayError::Closed);
        assert_eq!(body["error"]["code"], "GATEWAY_CLOSED");
        assert_eq!(body["error"]["message"], "gateway is closed");
    }
}
