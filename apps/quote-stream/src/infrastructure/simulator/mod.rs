//! Price Simulator
//!
//! In-process server side of the quote stream protocol, used by the
//! `price-simulator` binary and by integration tests.
//!
//! # Behavior
//!
//! - `auth` is answered with `[{"T":"success","msg":"authenticated"}]`, or
//!   with an error frame and a close when configured to reject.
//! - `subscribe` is answered with a `subscription` frame listing the
//!   requested symbols, or with a 405 error frame when configured to reject.
//! - Every request is recorded and can be awaited with
//!   [`PriceSimulator::next_request`].
//! - [`PriceSimulator::disconnect`] drops every connection without a close
//!   handshake, which the client observes as an abrupt loss.
//! - [`PriceSimulator::set_accepting`] makes new connections fail so the
//!   client's reconnect backoff can be exercised.
//! - [`PriceSimulator::stall`] keeps sockets open but stops reading and
//!   writing on them, so pings go unanswered.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::accept_hdr_async;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::header::ORIGIN;
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_util::sync::CancellationToken;

use crate::domain::streaming::Quote;
use crate::infrastructure::alpaca::messages::{
    AUTHENTICATED, CONNECTED_GREETING, ClientRequest, ErrorMessage, SubscriptionMessage,
    SuccessMessage,
};

/// Simulator errors.
#[derive(Debug, thiserror::Error)]
pub enum SimulatorError {
    /// The listen address could not be bound.
    #[error("failed to bind {addr}: {source}")]
    Bind {
        /// Requested address
        addr: String,
        /// Underlying I/O error
        source: std::io::Error,
    },

    /// A frame could not be serialized.
    #[error("failed to encode frame: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Simulator behavior switches.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SimulatorConfig {
    /// Send a `connected` greeting as soon as a socket opens.
    pub send_greeting: bool,
    /// Answer every auth request with a 402 error and close.
    pub reject_auth: bool,
    /// Answer every subscribe request with a 405 error.
    pub reject_subscribe: bool,
}

/// A client request as received by the simulator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerRequest {
    /// Simulator-side connection id.
    pub connection_id: u64,
    /// Parsed request.
    pub request: ClientRequest,
}

enum Outbound {
    Text(String),
    Stall,
    Drop,
}

struct Shared {
    config: SimulatorConfig,
    connections: Mutex<HashMap<u64, mpsc::UnboundedSender<Outbound>>>,
    origins: Mutex<Vec<Option<String>>>,
    accepting: AtomicBool,
    accepted: AtomicU64,
    next_id: AtomicU64,
    requests: mpsc::UnboundedSender<PeerRequest>,
}

/// Server side of the quote stream protocol.
pub struct PriceSimulator {
    addr: SocketAddr,
    shared: Arc<Shared>,
    requests: tokio::sync::Mutex<mpsc::UnboundedReceiver<PeerRequest>>,
    cancel: CancellationToken,
}

impl std::fmt::Debug for PriceSimulator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PriceSimulator")
            .field("addr", &self.addr)
            .field("config", &self.shared.config)
            .finish_non_exhaustive()
    }
}

impl PriceSimulator {
    /// Start on an ephemeral localhost port with default behavior.
    ///
    /// # Errors
    ///
    /// Returns an error if no port can be bound.
    pub async fn start() -> Result<Self, SimulatorError> {
        Self::bind("127.0.0.1:0", SimulatorConfig::default()).await
    }

    /// Start on `addr` with `config`.
    ///
    /// # Errors
    ///
    /// Returns an error if `addr` cannot be bound.
    pub async fn bind(addr: &str, config: SimulatorConfig) -> Result<Self, SimulatorError> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|source| SimulatorError::Bind {
                addr: addr.to_string(),
                source,
            })?;
        let local = listener.local_addr().map_err(|source| SimulatorError::Bind {
            addr: addr.to_string(),
            source,
        })?;

        let (request_tx, request_rx) = mpsc::unbounded_channel();
        let shared = Arc::new(Shared {
            config,
            connections: Mutex::new(HashMap::new()),
            origins: Mutex::new(Vec::new()),
            accepting: AtomicBool::new(true),
            accepted: AtomicU64::new(0),
            next_id: AtomicU64::new(1),
            requests: request_tx,
        });
        let cancel = CancellationToken::new();

        tokio::spawn(accept_loop(listener, Arc::clone(&shared), cancel.clone()));
        tracing::info!(addr = %local, "Price simulator listening");

        Ok(Self {
            addr: local,
            shared,
            requests: tokio::sync::Mutex::new(request_rx),
            cancel,
        })
    }

    /// Bound address.
    #[must_use]
    pub const fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// WebSocket URL to dial.
    #[must_use]
    pub fn ws_url(&self) -> String {
        format!("ws://{}/pricing", self.addr)
    }

    /// HTTP base URL, usable as the connector's base URL.
    #[must_use]
    pub fn http_url(&self) -> String {
        format!("http://{}", self.addr)
    }

    /// Publish one batch frame to every live connection.
    ///
    /// Returns the number of connections the frame was queued for.
    ///
    /// # Errors
    ///
    /// Returns an error if the quotes cannot be serialized.
    pub fn publish(&self, quotes: &[Quote]) -> Result<usize, SimulatorError> {
        let text = serde_json::to_string(quotes)?;
        tracing::debug!(quotes = quotes.len(), "Publishing simulated quotes");
        Ok(self.publish_raw(&text))
    }

    /// Send an arbitrary text frame to every live connection.
    pub fn publish_raw(&self, text: &str) -> usize {
        let mut connections = self.shared.connections.lock();
        connections.retain(|_, tx| tx.send(Outbound::Text(text.to_string())).is_ok());
        connections.len()
    }

    /// Drop every live connection without a close handshake.
    ///
    /// Returns the number of connections dropped.
    pub fn disconnect(&self) -> usize {
        let dropped: Vec<_> = self.shared.connections.lock().drain().collect();
        for (id, tx) in &dropped {
            tracing::info!(connection_id = id, "Simulator forcing disconnect");
            let _ = tx.send(Outbound::Drop);
        }
        dropped.len()
    }

    /// Stop answering on every live connection while leaving it open.
    ///
    /// Stalled connections ignore publishes and pings. Returns the number
    /// of connections stalled.
    pub fn stall(&self) -> usize {
        let mut connections = self.shared.connections.lock();
        connections.retain(|_, tx| tx.send(Outbound::Stall).is_ok());
        connections.len()
    }

    /// Accept or refuse new connections. Refused sockets are closed
    /// before the WebSocket handshake.
    pub fn set_accepting(&self, accepting: bool) {
        self.shared.accepting.store(accepting, Ordering::SeqCst);
    }

    /// Wait up to `timeout` for the next client request.
    pub async fn next_request(&self, timeout: Duration) -> Option<PeerRequest> {
        let mut requests = self.requests.lock().await;
        tokio::time::timeout(timeout, requests.recv())
            .await
            .ok()
            .flatten()
    }

    /// Wait up to `timeout` for the next subscribe request and return its symbols.
    pub async fn next_subscription(&self, timeout: Duration) -> Option<(u64, Vec<String>)> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            let request = self.next_request(remaining).await?;
            if let ClientRequest::Subscribe { quotes } = request.request {
                return Some((request.connection_id, quotes));
            }
        }
    }

    /// Number of WebSocket handshakes completed.
    #[must_use]
    pub fn connections_accepted(&self) -> u64 {
        self.shared.accepted.load(Ordering::SeqCst)
    }

    /// Number of connections currently open.
    #[must_use]
    pub fn live_connections(&self) -> usize {
        self.shared.connections.lock().len()
    }

    /// `Origin` header of every accepted handshake, in order.
    #[must_use]
    pub fn origins(&self) -> Vec<Option<String>> {
        self.shared.origins.lock().clone()
    }

    /// Stop accepting and close every connection.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }
}

impl Drop for PriceSimulator {
    fn drop(&mut self) {
        self.shutdown();
    }
}

async fn accept_loop(listener: TcpListener, shared: Arc<Shared>, cancel: CancellationToken) {
    loop {
        tokio::select! {
            () = cancel.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    if !shared.accepting.load(Ordering::SeqCst) {
                        tracing::debug!(peer = %peer, "Simulator refusing connection");
                        drop(stream);
                        continue;
                    }
                    tokio::spawn(handle_connection(stream, Arc::clone(&shared), cancel.clone()));
                }
                Err(e) => {
                    tracing::warn!(error = %e, "Simulator accept failed");
                    break;
                }
            },
        }
    }
}

async fn handle_connection(stream: TcpStream, shared: Arc<Shared>, cancel: CancellationToken) {
    let origin_sink = Arc::clone(&shared);
    let callback = move |request: &Request, response: Response| -> Result<Response, ErrorResponse> {
        let origin = request
            .headers()
            .get(ORIGIN)
            .and_then(|v| v.to_str().ok())
            .map(str::to_owned);
        origin_sink.origins.lock().push(origin);
        Ok(response)
    };

    let ws = match accept_hdr_async(stream, callback).await {
        Ok(ws) => ws,
        Err(e) => {
            tracing::warn!(error = %e, "Simulator handshake failed");
            return;
        }
    };

    let id = shared.next_id.fetch_add(1, Ordering::SeqCst);
    shared.accepted.fetch_add(1, Ordering::SeqCst);
    let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel();
    shared.connections.lock().insert(id, outbound_tx);

    let (mut write, mut read) = ws.split();

    if shared.config.send_greeting
        && let Ok(text) = control_frame(&SuccessMessage::new(CONNECTED_GREETING))
        && write.send(Message::text(text)).await.is_err()
    {
        shared.connections.lock().remove(&id);
        return;
    }

    let mut stalled = false;
    loop {
        tokio::select! {
            () = cancel.cancelled() => {
                let _ = write.close().await;
                break;
            }
            outbound = outbound_rx.recv() => match outbound {
                Some(Outbound::Text(_)) if stalled => {}
                Some(Outbound::Text(text)) => {
                    if write.send(Message::text(text)).await.is_err() {
                        break;
                    }
                }
                Some(Outbound::Stall) => {
                    tracing::info!(connection_id = id, "Simulator stalling connection");
                    stalled = true;
                }
                // Dropping both halves closes the socket without a close frame.
                Some(Outbound::Drop) | None => break,
            },
            // Unread pings get no pong while stalled.
            inbound = read.next(), if !stalled => match inbound {
                Some(Ok(Message::Text(text))) => {
                    match reply_to(id, text.as_str(), &shared) {
                        Reply::Send(frame) => {
                            if write.send(Message::text(frame)).await.is_err() {
                                break;
                            }
                        }
                        Reply::SendAndClose(frame) => {
                            let _ = write.send(Message::text(frame)).await;
                            let _ = write.close().await;
                            break;
                        }
                        Reply::Nothing => {}
                    }
                }
                Some(Ok(Message::Close(_)) | Err(_)) | None => break,
                Some(Ok(_)) => {}
            },
        }
    }

    shared.connections.lock().remove(&id);
    tracing::debug!(connection_id = id, "Simulator connection ended");
}

enum Reply {
    Send(String),
    SendAndClose(String),
    Nothing,
}

fn reply_to(connection_id: u64, text: &str, shared: &Shared) -> Reply {
    let request = match serde_json::from_str::<ClientRequest>(text) {
        Ok(request) => request,
        Err(e) => {
            tracing::warn!(connection_id, error = %e, "Simulator received invalid request");
            return control_frame(&ErrorMessage::new(400, "invalid syntax"))
                .map_or(Reply::Nothing, Reply::Send);
        }
    };

    let _ = shared.requests.send(PeerRequest {
        connection_id,
        request: request.clone(),
    });

    let frame = match request {
        ClientRequest::Auth { .. } if shared.config.reject_auth => {
            return control_frame(&ErrorMessage::new(402, "auth failed"))
                .map_or(Reply::Nothing, Reply::SendAndClose);
        }
        ClientRequest::Auth { .. } => control_frame(&SuccessMessage::new(AUTHENTICATED)),
        ClientRequest::Subscribe { .. } if shared.config.reject_subscribe => {
            control_frame(&ErrorMessage::new(405, "symbol limit exceeded"))
        }
        ClientRequest::Subscribe { quotes } => {
            tracing::info!(connection_id, symbols = ?quotes, "Simulator subscription");
            control_frame(&SubscriptionMessage::new(quotes))
        }
    };

    frame.map_or(Reply::Nothing, Reply::Send)
}

fn control_frame<T: serde::Serialize>(message: &T) -> Result<String, serde_json::Error> {
    serde_json::to_string(&[message])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn control_frames_are_arrays() {
        let frame = control_frame(&SuccessMessage::new(AUTHENTICATED)).unwrap();
        assert_eq!(frame, r#"[{"T":"success","msg":"authenticated"}]"#);

        let frame = control_frame(&SubscriptionMessage::new(vec!["ACA".to_string()])).unwrap();
        assert_eq!(frame, r#"[{"T":"subscription","quotes":["ACA"]}]"#);
    }

    #[tokio::test]
    async fn start_binds_ephemeral_port() {
        let sim = PriceSimulator::start().await.unwrap();
        assert_ne!(sim.addr().port(), 0);
        assert!(sim.ws_url().starts_with("ws://127.0.0.1:"));
        assert_eq!(sim.connections_accepted(), 0);
        assert_eq!(sim.publish(&[Quote::new("ACA", 1.0, 2.0)]).unwrap(), 0);
        assert_eq!(sim.disconnect(), 0);
        assert_eq!(sim.stall(), 0);
    }

    #[tokio::test]
    async fn next_request_times_out_without_clients() {
        let sim = PriceSimulator::start().await.unwrap();
        assert!(sim.next_request(Duration::from_millis(20)).await.is_none());
    }
}
