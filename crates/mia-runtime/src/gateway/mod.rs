//! Channel gateway: multiplexes client channels onto the backend.
//!
//! ```text
//!                    ┌──────────────────────── ChannelGateway ───────────────────────┐
//!  HTTP client ────► │ RequestReply  POST /request ──► BackendLink::request          │
//!                    │                                                               │
//!  WS client   ◄──── │ PubSub        GET /events   ◄── publish() ◄── event pump      │
//!                    │               (bounded queue per subscriber, try_send)        │
//!                    │                                                               │
//!  WS client   ◄───► │ Duplex        GET /stream   ◄─► BackendLink::open_stream      │
//!                    │               (one write mutex per client)                    │
//!                    └───────────────────────────────────────────────────────────────┘
//! ```
//!
//! Each channel kind gets its own listener. Opening happens once, after
//! the backend is Ready; closing refuses new traffic, drains in-flight
//! operations and then closes every client.
//!
//! # Admission
//!
//! | Operation | Gateway | Backend state |
//! |-----------|---------|---------------|
//! | request / duplex | open | Ready |
//! | subscribe | open | Ready or Degraded |
//!
//! Per-client failures close only that client.

mod backend;
mod channel;
mod connection;
mod duplex;
mod error;
mod pubsub;
mod server;

pub use backend::{BackendLink, BackendStream, HttpBackendLink};
pub use channel::{Channel, ChannelKind};
pub use connection::{ClientConnection, ConnectionState};
pub use duplex::DuplexMessage;
pub use error::GatewayError;
pub use pubsub::{topic_matches, EventStream, SubscriberFrame};

use crate::config::GatewayConfig;
use crate::event::BackendEvent;
use crate::process::{BackendProcess, BackendState};
use duplex::DuplexWriter;
use mia_types::{ClientId, RequestId};
use parking_lot::{Mutex, RwLock};
use pubsub::Subscriber;
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Idle,
    Opening,
    Open,
    Closed,
}

enum Sink {
    Request,
    PubSub(Subscriber),
    Duplex(Arc<DuplexWriter>),
}

struct Entry {
    conn: ClientConnection,
    sink: Sink,
}

/// Counter snapshot.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct GatewayStats {
    pub requests_handled: u64,
    pub requests_failed: u64,
    pub events_published: u64,
    pub deliveries_dropped: u64,
    pub connections_opened: u64,
    pub connections_closed: u64,
    pub active_connections: u64,
}

#[derive(Default)]
struct Counters {
    requests_handled: AtomicU64,
    requests_failed: AtomicU64,
    events_published: AtomicU64,
    deliveries_dropped: AtomicU64,
    connections_opened: AtomicU64,
    connections_closed: AtomicU64,
}

fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

/// Outcome of [`ChannelGateway::close`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CloseReport {
    /// In-flight operations finished within the drain window.
    pub drained: bool,
    /// Clients closed by this call.
    pub connections_closed: usize,
}

/// Body of `GET /status`.
#[derive(Debug, Clone, Serialize)]
pub struct StatusReport {
    pub backend: BackendProcess,
    pub gateway: GatewayStats,
    pub uptime_secs: Option<i64>,
}

/// A duplex client attached to a backend stream.
#[derive(Debug)]
pub struct DuplexSession {
    pub client: ClientId,
    /// Messages from the backend for this client.
    pub inbound: mpsc::Receiver<String>,
}

/// Multiplexes client channels onto the single backend process.
pub struct ChannelGateway {
    config: GatewayConfig,
    backend: watch::Receiver<BackendProcess>,
    link: Arc<dyn BackendLink>,
    phase: Mutex<Phase>,
    endpoints: RwLock<Vec<(ChannelKind, std::net::SocketAddr)>>,
    connections: RwLock<HashMap<ClientId, Entry>>,
    in_flight: TaskTracker,
    /// Cancelled when the drain window runs out.
    abandon: CancellationToken,
    listeners: CancellationToken,
    counters: Counters,
}

impl ChannelGateway {
    #[must_use]
    pub fn new(
        config: GatewayConfig,
        backend: watch::Receiver<BackendProcess>,
        link: Arc<dyn BackendLink>,
    ) -> Self {
        Self {
            config,
            backend,
            link,
            phase: Mutex::new(Phase::Idle),
            endpoints: RwLock::new(Vec::new()),
            connections: RwLock::new(HashMap::new()),
            in_flight: TaskTracker::new(),
            abandon: CancellationToken::new(),
            listeners: CancellationToken::new(),
            counters: Counters::default(),
        }
    }

    /// Binds one listener per [`ChannelKind`] and starts serving.
    ///
    /// # Errors
    ///
    /// - [`GatewayError::AlreadyOpen`] on a second call
    /// - [`GatewayError::Closed`] after [`close`](Self::close)
    /// - [`GatewayError::Bind`] if any address cannot be bound; nothing
    ///   is left listening in that case
    pub async fn open(self: &Arc<Self>) -> Result<Vec<Channel>, GatewayError> {
        {
            let mut phase = self.phase.lock();
            match *phase {
                Phase::Idle => *phase = Phase::Opening,
                Phase::Opening | Phase::Open => return Err(GatewayError::AlreadyOpen),
                Phase::Closed => return Err(GatewayError::Closed),
            }
        }

        let bound = match self.bind_all().await {
            Ok(bound) => bound,
            Err(e) => {
                let mut phase = self.phase.lock();
                if *phase == Phase::Opening {
                    *phase = Phase::Idle;
                }
                return Err(e);
            }
        };

        {
            let mut phase = self.phase.lock();
            if *phase != Phase::Opening {
                // Closed while binding; dropping the listeners releases the ports.
                return Err(GatewayError::Closed);
            }
            *phase = Phase::Open;
        }

        let mut endpoints = Vec::with_capacity(bound.len());
        for (kind, local, listener) in bound {
            let router = server::router(kind, Arc::clone(self));
            let shutdown = self.listeners.clone().cancelled_owned();
            tokio::spawn(async move {
                if let Err(e) = axum::serve(listener, router)
                    .with_graceful_shutdown(shutdown)
                    .await
                {
                    warn!(channel = %kind, error = %e, "Listener stopped with error");
                }
                debug!(channel = %kind, "Listener stopped");
            });
            info!(channel = %kind, endpoint = %local, "Channel open");
            endpoints.push((kind, local));
        }
        *self.endpoints.write() = endpoints;

        Ok(self.channels())
    }

    async fn bind_all(
        &self,
    ) -> Result<Vec<(ChannelKind, std::net::SocketAddr, TcpListener)>, GatewayError> {
        let mut bound = Vec::with_capacity(ChannelKind::ALL.len());
        for kind in ChannelKind::ALL {
            let addr = kind.bind_addr(&self.config);
            let bind_error = |e: std::io::Error| GatewayError::Bind {
                addr,
                reason: e.to_string(),
            };
            let listener = TcpListener::bind(addr).await.map_err(bind_error)?;
            let local = listener.local_addr().map_err(bind_error)?;
            bound.push((kind, local, listener));
        }
        Ok(bound)
    }

    /// Returns `true` while the gateway accepts traffic.
    #[must_use]
    pub fn is_open(&self) -> bool {
        *self.phase.lock() == Phase::Open
    }

    #[must_use]
    pub fn backend_state(&self) -> BackendState {
        self.backend.borrow().state
    }

    /// Bound channels with their active clients.
    #[must_use]
    pub fn channels(&self) -> Vec<Channel> {
        let connections = self.connections.read();
        self.endpoints
            .read()
            .iter()
            .map(|(kind, endpoint)| {
                let mut clients: Vec<ClientId> = connections
                    .values()
                    .filter(|e| e.conn.kind == *kind)
                    .map(|e| e.conn.id)
                    .collect();
                clients.sort();
                Channel {
                    kind: *kind,
                    endpoint: *endpoint,
                    clients,
                }
            })
            .collect()
    }

    /// Bound endpoint of one channel kind.
    #[must_use]
    pub fn endpoint(&self, kind: ChannelKind) -> Option<std::net::SocketAddr> {
        self.endpoints
            .read()
            .iter()
            .find(|(k, _)| *k == kind)
            .map(|(_, addr)| *addr)
    }

    #[must_use]
    pub fn connection(&self, client: ClientId) -> Option<ClientConnection> {
        self.connections.read().get(&client).map(|e| e.conn.clone())
    }

    #[must_use]
    pub fn connections(&self) -> Vec<ClientConnection> {
        self.connections.read().values().map(|e| e.conn.clone()).collect()
    }

    #[must_use]
    pub fn stats(&self) -> GatewayStats {
        let c = &self.counters;
        GatewayStats {
            requests_handled: c.requests_handled.load(Ordering::Relaxed),
            requests_failed: c.requests_failed.load(Ordering::Relaxed),
            events_published: c.events_published.load(Ordering::Relaxed),
            deliveries_dropped: c.deliveries_dropped.load(Ordering::Relaxed),
            connections_opened: c.connections_opened.load(Ordering::Relaxed),
            connections_closed: c.connections_closed.load(Ordering::Relaxed),
            active_connections: self.connections.read().len() as u64,
        }
    }

    #[must_use]
    pub fn status_report(&self) -> StatusReport {
        let backend = self.backend.borrow().clone();
        let uptime_secs = backend.uptime_secs();
        StatusReport {
            backend,
            gateway: self.stats(),
            uptime_secs,
        }
    }

    // === RequestReply ===

    /// Attaches a request/reply client.
    ///
    /// # Errors
    ///
    /// [`GatewayError::NotOpen`] / [`GatewayError::Closed`] outside the open phase.
    pub fn connect_requester(&self) -> Result<ClientId, GatewayError> {
        self.ensure_open()?;
        Ok(self.attach(ClientConnection::new(ChannelKind::RequestReply), Sink::Request))
    }

    /// Forwards one request and returns the backend's answer.
    ///
    /// # Errors
    ///
    /// - [`GatewayError::BackendUnavailable`] unless the backend is Ready
    /// - [`GatewayError::Timeout`] after `gateway.request_timeout_ms`
    /// - [`GatewayError::Backend`] for backend-side failures
    /// - [`GatewayError::Closed`] if the gateway closes before the answer
    ///   arrives and the drain window runs out
    pub async fn request(&self, client: ClientId, payload: Value) -> Result<Value, GatewayError> {
        self.ensure_open()?;
        self.ensure_client(client, ChannelKind::RequestReply)?;
        self.ensure_ready()?;

        let id = RequestId::new();
        debug!(%client, request = %id, "Forwarding request");
        let call = tokio::time::timeout(self.config.request_timeout(), self.link.request(payload));
        let result = tokio::select! {
            answer = self.in_flight.track_future(call) => match answer {
                Ok(result) => result,
                Err(_) => Err(GatewayError::Timeout(id)),
            },
            () = self.abandon.cancelled() => Err(GatewayError::Closed),
        };

        match &result {
            Ok(_) => bump(&self.counters.requests_handled),
            Err(e) => {
                bump(&self.counters.requests_failed);
                warn!(%client, request = %id, error = %e, "Request failed");
            }
        }
        result
    }

    // === PubSub ===

    /// Attaches a subscriber. It receives nothing until it subscribes.
    ///
    /// # Errors
    ///
    /// - [`GatewayError::NotOpen`] / [`GatewayError::Closed`] outside the open phase
    /// - [`GatewayError::BackendUnavailable`] unless Ready or Degraded
    pub fn connect_subscriber(&self) -> Result<(ClientId, EventStream), GatewayError> {
        self.ensure_open()?;
        self.ensure_observable()?;
        let (subscriber, events) = Subscriber::new(self.config.subscriber_buffer);
        let id = self.attach(ClientConnection::new(ChannelKind::PubSub), Sink::PubSub(subscriber));
        Ok((id, events))
    }

    /// Adds topics to a subscriber. `*` subscribes to everything.
    ///
    /// # Errors
    ///
    /// Fails for unknown or non-PubSub clients and outside the open phase.
    pub fn subscribe<I, S>(&self, client: ClientId, topics: I) -> Result<(), GatewayError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.ensure_open()?;
        self.ensure_observable()?;
        let mut connections = self.connections.write();
        let entry = Self::entry_mut(&mut connections, client, ChannelKind::PubSub)?;
        entry.conn.subscribe(topics);
        debug!(%client, topics = ?entry.conn.topics, "Subscribed");
        Ok(())
    }

    /// Removes topics from a subscriber.
    ///
    /// # Errors
    ///
    /// Fails for unknown or non-PubSub clients.
    pub fn unsubscribe<'a, I>(&self, client: ClientId, topics: I) -> Result<(), GatewayError>
    where
        I: IntoIterator<Item = &'a str>,
    {
        let mut connections = self.connections.write();
        let entry = Self::entry_mut(&mut connections, client, ChannelKind::PubSub)?;
        entry.conn.unsubscribe(topics);
        Ok(())
    }

    /// Delivers `event` to every matching subscriber, exactly once each.
    ///
    /// Returns the number of deliveries. Subscribers whose queue is full
    /// or closed are closed; nobody else is affected.
    pub fn publish(&self, event: BackendEvent) -> usize {
        let event = Arc::new(event);
        let mut delivered = 0;
        let mut failed = Vec::new();
        {
            let connections = self.connections.read();
            for entry in connections.values() {
                let Sink::PubSub(subscriber) = &entry.sink else {
                    continue;
                };
                if entry.conn.state != ConnectionState::Subscribed
                    || !topic_matches(&entry.conn.topics, &event.topic)
                {
                    continue;
                }
                match subscriber.deliver(&event) {
                    Ok(()) => delivered += 1,
                    Err(reason) => failed.push(GatewayError::ChannelWriteFailure {
                        client: entry.conn.id,
                        reason: reason.to_string(),
                    }),
                }
            }
        }

        for err in failed {
            bump(&self.counters.deliveries_dropped);
            if let GatewayError::ChannelWriteFailure { client, .. } = &err {
                warn!(%client, error = %err, "Closing subscriber");
                self.disconnect(*client);
            }
        }
        bump(&self.counters.events_published);
        debug!(topic = %event.topic, delivered, "Event published");
        delivered
    }

    // === Duplex ===

    /// Attaches a duplex client and opens its backend stream.
    ///
    /// # Errors
    ///
    /// - [`GatewayError::BackendUnavailable`] unless the backend is Ready
    /// - [`GatewayError::Backend`] if the stream cannot be opened
    pub async fn connect_duplex(&self) -> Result<DuplexSession, GatewayError> {
        self.ensure_open()?;
        self.ensure_ready()?;

        let conn = ClientConnection::new(ChannelKind::Duplex);
        let client = conn.id;
        let stream = self.link.open_stream(client).await?;

        // The gateway may have closed while the stream was opening.
        self.ensure_open()?;
        self.attach(conn, Sink::Duplex(Arc::new(DuplexWriter::new(stream.outbound))));
        Ok(DuplexSession {
            client,
            inbound: stream.inbound,
        })
    }

    /// Writes one message to the client's backend stream.
    ///
    /// Writes for the same client are serialized; a
    /// [`DuplexMessage::Parts`] message is never interleaved.
    ///
    /// # Errors
    ///
    /// - [`GatewayError::BackendUnavailable`] unless the backend is Ready
    /// - [`GatewayError::ChannelWriteFailure`] if the stream is gone; the
    ///   client is closed
    /// - [`GatewayError::Closed`] if the write is still pending when the
    ///   drain window runs out
    pub async fn send_duplex(&self, client: ClientId, message: DuplexMessage) -> Result<(), GatewayError> {
        self.ensure_open()?;
        self.ensure_ready()?;
        let writer = {
            let connections = self.connections.read();
            let entry = connections
                .get(&client)
                .ok_or(GatewayError::UnknownClient(client))?;
            match &entry.sink {
                Sink::Duplex(writer) => Arc::clone(writer),
                _ => {
                    return Err(GatewayError::WrongChannel {
                        client,
                        expected: ChannelKind::Duplex,
                    })
                }
            }
        };

        let parts = message.part_count();
        let written = tokio::select! {
            written = self.in_flight.track_future(writer.write(message)) => written,
            () = self.abandon.cancelled() => {
                debug!(%client, "Duplex write abandoned");
                return Err(GatewayError::Closed);
            }
        };
        match written {
            Ok(()) => {
                debug!(%client, parts, "Duplex message written");
                Ok(())
            }
            Err(reason) => {
                let err = GatewayError::ChannelWriteFailure { client, reason };
                warn!(%client, error = %err, "Closing duplex client");
                self.disconnect(client);
                Err(err)
            }
        }
    }

    // === Lifecycle ===

    /// Detaches a client. Returns its final record, now Closed.
    pub fn disconnect(&self, client: ClientId) -> Option<ClientConnection> {
        let entry = self.connections.write().remove(&client)?;
        bump(&self.counters.connections_closed);
        let mut conn = entry.conn;
        conn.close();
        debug!(%client, channel = %conn.kind, "Client disconnected");
        Some(conn)
    }

    /// Closes the gateway.
    ///
    /// New traffic is refused at once. In-flight requests and duplex
    /// writes get up to `drain` to finish; whatever is left is cancelled
    /// and fails with [`GatewayError::Closed`]. Then every client is closed
    /// and the listeners stop. Later calls return immediately.
    pub async fn close(&self, drain: Duration) -> CloseReport {
        {
            let mut phase = self.phase.lock();
            if *phase == Phase::Closed {
                return CloseReport {
                    drained: true,
                    connections_closed: 0,
                };
            }
            *phase = Phase::Closed;
        }
        info!("Gateway closing");

        self.in_flight.close();
        let drained = tokio::time::timeout(drain, self.in_flight.wait()).await.is_ok();
        if !drained {
            warn!(
                in_flight = self.in_flight.len(),
                ?drain,
                "In-flight operations did not drain, cancelling"
            );
            self.abandon.cancel();
        }

        let clients: Vec<ClientId> = self.connections.read().keys().copied().collect();
        let connections_closed = clients
            .into_iter()
            .filter_map(|client| self.disconnect(client))
            .count();
        self.listeners.cancel();

        info!(connections_closed, drained, "Gateway closed");
        CloseReport {
            drained,
            connections_closed,
        }
    }

    /// Token cancelled when the listeners stop.
    pub(crate) fn listener_token(&self) -> CancellationToken {
        self.listeners.clone()
    }

    fn attach(&self, conn: ClientConnection, sink: Sink) -> ClientId {
        let id = conn.id;
        let kind = conn.kind;
        self.connections.write().insert(id, Entry { conn, sink });
        bump(&self.counters.connections_opened);
        debug!(client = %id, channel = %kind, "Client connected");
        id
    }

    fn ensure_open(&self) -> Result<(), GatewayError> {
        match *self.phase.lock() {
            Phase::Open => Ok(()),
            Phase::Idle | Phase::Opening => Err(GatewayError::NotOpen),
            Phase::Closed => Err(GatewayError::Closed),
        }
    }

    fn ensure_ready(&self) -> Result<(), GatewayError> {
        match self.backend_state() {
            BackendState::Ready => Ok(()),
            state => Err(GatewayError::BackendUnavailable(state)),
        }
    }

    fn ensure_observable(&self) -> Result<(), GatewayError> {
        match self.backend_state() {
            BackendState::Ready | BackendState::Degraded => Ok(()),
            state => Err(GatewayError::BackendUnavailable(state)),
        }
    }

    fn ensure_client(&self, client: ClientId, kind: ChannelKind) -> Result<(), GatewayError> {
        match self.connections.read().get(&client) {
            None => Err(GatewayError::UnknownClient(client)),
            Some(entry) if entry.conn.kind != kind => Err(GatewayError::WrongChannel {
                client,
                expected: kind,
            }),
            Some(_) => Ok(()),
        }
    }

    fn entry_mut(
        connections: &mut HashMap<ClientId, Entry>,
        client: ClientId,
        kind: ChannelKind,
    ) -> Result<&mut Entry, GatewayError> {
        let entry = connections
            .get_mut(&client)
            .ok_or(GatewayError::UnknownClient(client))?;
        if entry.conn.kind != kind {
            return Err(GatewayError::WrongChannel {
                client,
                expected: kind,
            });
        }
        Ok(entry)
    }
}

impl std::fmt::Debug for ChannelGateway {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelGateway")
            .field("phase", &*self.phase.lock())
            .field("endpoints", &*self.endpoints.read())
            .field("connections", &self.connections.read().len())
            .finish_non_exhaustive()
    }
}
