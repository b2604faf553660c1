//! Link from the gateway to the backend process.

use super::error::GatewayError;
use crate::config::BackendConfig;
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use mia_types::ClientId;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, warn};

const STREAM_BUFFER: usize = 64;

/// One open duplex stream into the backend.
#[derive(Debug)]
pub struct BackendStream {
    /// Messages to the backend. Dropping it closes the stream.
    pub outbound: mpsc::Sender<String>,
    /// Messages from the backend. Ends when the backend closes.
    pub inbound: mpsc::Receiver<String>,
}

/// Transport to the backend for request/reply and duplex traffic.
#[async_trait]
pub trait BackendLink: Send + Sync {
    /// Forwards one request to the synchronous endpoint.
    async fn request(&self, payload: Value) -> Result<Value, GatewayError>;

    /// Opens a duplex stream on behalf of `client`.
    async fn open_stream(&self, client: ClientId) -> Result<BackendStream, GatewayError>;
}

/// [`BackendLink`] over HTTP (requests) and WebSocket (streams).
#[derive(Debug, Clone)]
pub struct HttpBackendLink {
    client: reqwest::Client,
    request_url: String,
    stream_url: String,
}

impl HttpBackendLink {
    #[must_use]
    pub fn new(request_url: impl Into<String>, stream_url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            request_url: request_url.into(),
            stream_url: stream_url.into(),
        }
    }

    #[must_use]
    pub fn from_config(config: &BackendConfig) -> Self {
        Self::new(config.request_url(), config.stream_url())
    }
}

#[async_trait]
impl BackendLink for HttpBackendLink {
    async fn request(&self, payload: Value) -> Result<Value, GatewayError> {
        let resp = self
            .client
            .post(&self.request_url)
            .json(&payload)
            .send()
            .await
            .map_err(|e| GatewayError::Backend(e.to_string()))?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(GatewayError::Backend(format!("status {status}: {body}")));
        }

        resp.json::<Value>()
            .await
            .map_err(|e| GatewayError::Backend(format!("invalid response body: {e}")))
    }

    async fn open_stream(&self, client: ClientId) -> Result<BackendStream, GatewayError> {
        let url = format!("{}?client={}", self.stream_url, client.uuid());
        let (ws, _) = connect_async(url.as_str())
            .await
            .map_err(|e| GatewayError::Backend(format!("stream connect failed: {e}")))?;
        debug!(%client, "Backend stream opened");

        let (mut ws_sender, mut ws_receiver) = ws.split();
        let (outbound_tx, mut outbound_rx) = mpsc::channel::<String>(STREAM_BUFFER);
        let (inbound_tx, inbound_rx) = mpsc::channel::<String>(STREAM_BUFFER);

        tokio::spawn(async move {
            while let Some(text) = outbound_rx.recv().await {
                if let Err(e) = ws_sender.send(Message::Text(text.into())).await {
                    warn!(%client, error = %e, "Backend stream write failed");
                    return;
                }
            }
            let _ = ws_sender.send(Message::Close(None)).await;
        });

        tokio::spawn(async move {
            while let Some(frame) = ws_receiver.next().await {
                let text = match frame {
                    Ok(Message::Text(text)) => text.as_str().to_owned(),
                    Ok(Message::Binary(bytes)) => match String::from_utf8(bytes.to_vec()) {
                        Ok(text) => text,
                        Err(_) => continue,
                    },
                    Ok(Message::Close(_)) => break,
                    Ok(_) => continue,
                    Err(e) => {
                        warn!(%client, error = %e, "Backend stream read failed");
                        break;
                    }
                };
                if inbound_tx.send(text).await.is_err() {
                    break;
                }
            }
            debug!(%client, "Backend stream closed");
        });

        Ok(BackendStream {
            outbound: outbound_tx,
            inbound: inbound_rx,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::extract::ws::{Message as WsMessage, WebSocket, WebSocketUpgrade};
    use axum::http::StatusCode;
    use axum::routing::{get, post};
    use axum::{Json, Router};
    use serde_json::json;

    async fn serve(app: Router) -> std::net::SocketAddr {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind ephemeral port");
        let addr = listener.local_addr().expect("local addr");
        tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });
        addr
    }

    async fn echo_socket(mut socket: WebSocket) {
        while let Some(Ok(msg)) = socket.recv().await {
            if let WsMessage::Text(text) = msg {
                let reply = format!("echo:{}", text.as_str());
                if socket.send(WsMessage::Text(reply.into())).await.is_err() {
                    break;
                }
            }
        }
    }

    fn backend_app() -> Router {
        Router::new()
            .route(
                "/api/process",
                post(|Json(body): Json<Value>| async move { Json(json!({ "echo": body })) }),
            )
            .route("/api/fail", post(|| async { (StatusCode::INTERNAL_SERVER_ERROR, "boom") }))
            .route(
                "/api/stream",
                get(|ws: WebSocketUpgrade| async move { ws.on_upgrade(echo_socket) }),
            )
    }

    #[tokio::test]
    async fn request_round_trips_json() {
        let addr = serve(backend_app()).await;
        let link = HttpBackendLink::new(
            format!("http://{addr}/api/process"),
            format!("ws://{addr}/api/stream"),
        );

        let reply = link
            .request(json!({"text": "hi"}))
            .await
            .expect("backend should answer");
        assert_eq!(reply, json!({"echo": {"text": "hi"}}));
    }

    #[tokio::test]
    async fn error_status_becomes_backend_error() {
        let addr = serve(backend_app()).await;
        let link = HttpBackendLink::new(format!("http://{addr}/api/fail"), "ws://unused");

        let err = link.request(json!({})).await.expect_err("500 must fail");
        assert_eq!(
            err,
            GatewayError::Backend("status 500 Internal Server Error: boom".into())
        );
    }

    #[tokio::test]
    async fn stream_forwards_both_directions() {
        let addr = serve(backend_app()).await;
        let link = HttpBackendLink::new("http://unused", format!("ws://{addr}/api/stream"));

        let mut stream = link
            .open_stream(ClientId::new())
            .await
            .expect("stream should open");
        stream
            .outbound
            .send("ping".into())
            .await
            .expect("outbound open");

        let reply = tokio::time::timeout(std::time::Duration::from_secs(5), stream.inbound.recv())
            .await
            .expect("reply in time")
            .expect("stream open");
        assert_eq!(reply, "echo:ping");
    }

    #[tokio::test]
    async fn unreachable_stream_is_backend_error() {
        let link = HttpBackendLink::new("http://unused", "ws://127.0.0.1:9/api/stream");
        let err = link
            .open_stream(ClientId::new())
            .await
            .expect_err("nothing listens on port 9");
        assert!(matches!(err, GatewayError::Backend(_)));
    }
}
