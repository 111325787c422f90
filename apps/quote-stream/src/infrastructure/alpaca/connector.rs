//! Transport Connector
//!
//! Opens one WebSocket connection to the quote stream and performs the
//! auth handshake on it. The connector holds no state beyond what it needs
//! to dial; the returned [`FeedConnection`] is owned by the caller.
//!
//! The dial request carries an `Origin` header built from the REST base
//! URL and API version, separate from the stream URL that is dialed.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::http::header::ORIGIN;
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};

use super::auth::{AUTH_TIMEOUT, AuthError, AuthHandler, AuthProgress, Credentials};
use super::codec::{CodecError, JsonCodec};
use super::error::ErrorKind;
use super::messages::FeedMessage;
use crate::application::ports::Connector;

/// Default time allowed for the TCP/TLS/WebSocket dial.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Time allowed for a close frame to be written on shutdown.
const CLOSE_TIMEOUT: Duration = Duration::from_secs(1);

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Write half of a feed connection.
pub type FeedWriter = SplitSink<WsStream, Message>;

/// Read half of a feed connection.
pub type FeedReader = SplitStream<WsStream>;

// =============================================================================
// Errors
// =============================================================================

/// Errors from opening or using a feed connection.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// The stream URL or origin could not be turned into a request.
    #[error("invalid endpoint: {0}")]
    InvalidEndpoint(String),

    /// Dialing the stream URL failed.
    #[error("failed to connect to {url}: {reason}")]
    ConnectFailed {
        /// URL that was dialed
        url: String,
        /// Underlying failure
        reason: String,
    },

    /// Dialing did not finish in time.
    #[error("timed out connecting to {url} after {timeout:?}")]
    ConnectTimeout {
        /// URL that was dialed
        url: String,
        /// Timeout that elapsed
        timeout: Duration,
    },

    /// The auth handshake failed.
    #[error("authentication failed: {0}")]
    AuthFailed(#[from] AuthError),

    /// Writing a frame failed.
    #[error("send failed: {0}")]
    SendFailed(String),

    /// Reading a frame failed.
    #[error("read failed: {0}")]
    ReadFailed(String),

    /// The peer closed the connection or the stream ended.
    #[error("connection closed: {0}")]
    Closed(String),
}

impl TransportError {
    /// Classify this error.
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidEndpoint(_) | Self::ConnectFailed { .. } | Self::ConnectTimeout { .. } => {
                ErrorKind::ConnectFailed
            }
            Self::AuthFailed(_) => ErrorKind::AuthFailed,
            Self::SendFailed(_) | Self::ReadFailed(_) | Self::Closed(_) => ErrorKind::ReadFailed,
        }
    }
}

// =============================================================================
// Endpoint
// =============================================================================

/// Where and how to dial the quote stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamEndpoint {
    /// WebSocket URL to dial.
    pub stream_url: String,
    /// REST base URL, used for the handshake origin.
    pub base_url: String,
    /// API version path segment, used for the handshake origin.
    pub api_version: String,
}

impl StreamEndpoint {
    /// Create an endpoint description.
    #[must_use]
    pub fn new(
        stream_url: impl Into<String>,
        base_url: impl Into<String>,
        api_version: impl Into<String>,
    ) -> Self {
        Self {
            stream_url: stream_url.into(),
            base_url: base_url.into(),
            api_version: api_version.into(),
        }
    }

    /// Handshake origin: base URL and API version joined by one slash.
    #[must_use]
    pub fn origin(&self) -> String {
        let base = self.base_url.trim_end_matches('/');
        let version = self.api_version.trim_start_matches('/');
        if version.is_empty() {
            base.to_string()
        } else {
            format!("{base}/{version}")
        }
    }
}

// =============================================================================
// Connection
// =============================================================================

/// One inbound frame, reduced to what the session cares about.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// Text payload.
    Text(String),
    /// Binary payload.
    Binary(Vec<u8>),
    /// Ping or pong; proves liveness and carries no data.
    Keepalive,
}

impl Frame {
    /// Decode the payload with `codec`; keepalives decode to no messages.
    ///
    /// # Errors
    ///
    /// Returns the codec's error for a malformed payload.
    pub fn decode(&self, codec: &JsonCodec) -> Result<Vec<FeedMessage>, CodecError> {
        match self {
            Self::Text(text) => codec.decode(text),
            Self::Binary(bytes) => codec.decode_bytes(bytes),
            Self::Keepalive => Ok(Vec::new()),
        }
    }
}

/// An authenticated physical connection to the feed.
pub struct FeedConnection {
    id: u64,
    writer: FeedWriter,
    reader: FeedReader,
}

impl std::fmt::Debug for FeedConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FeedConnection")
            .field("id", &self.id)
            .finish_non_exhaustive()
    }
}

impl FeedConnection {
    /// Connection id, unique per connector.
    #[must_use]
    pub const fn id(&self) -> u64 {
        self.id
    }

    /// Write one text frame.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::SendFailed`] if the write fails.
    pub async fn send_text(&mut self, text: String) -> Result<(), TransportError> {
        self.writer
            .send(Message::text(text))
            .await
            .map_err(|e| TransportError::SendFailed(e.to_string()))
    }

    /// Write a ping frame.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::SendFailed`] if the write fails.
    pub async fn ping(&mut self) -> Result<(), TransportError> {
        self.writer
            .send(Message::Ping(Vec::new().into()))
            .await
            .map_err(|e| TransportError::SendFailed(e.to_string()))
    }

    #[cfg(test)]
    pub(crate) async fn close_writer(&mut self) {
        let _ = self.writer.close().await;
    }

    /// Read the next frame.
    ///
    /// Cancel safe: dropping the future loses no frame.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::Closed`] on a close frame or end of stream
    /// and [`TransportError::ReadFailed`] on a protocol or I/O error.
    pub async fn read_frame(&mut self) -> Result<Frame, TransportError> {
        match self.reader.next().await {
            Some(Ok(Message::Text(text))) => Ok(Frame::Text(text.as_str().to_owned())),
            Some(Ok(Message::Binary(bytes))) => Ok(Frame::Binary(bytes.to_vec())),
            Some(Ok(Message::Ping(_) | Message::Pong(_) | Message::Frame(_))) => {
                Ok(Frame::Keepalive)
            }
            Some(Ok(Message::Close(frame))) => Err(TransportError::Closed(
                frame.map_or_else(|| "close frame".to_string(), |f| f.reason.as_str().to_owned()),
            )),
            Some(Err(e)) => Err(TransportError::ReadFailed(e.to_string())),
            None => Err(TransportError::Closed("end of stream".to_string())),
        }
    }

    /// Close the connection, giving the close frame a short window.
    pub async fn close(mut self) {
        match tokio::time::timeout(CLOSE_TIMEOUT, self.writer.close()).await {
            Ok(Ok(())) => tracing::debug!(connection_id = self.id, "Connection closed"),
            Ok(Err(e)) => {
                tracing::debug!(connection_id = self.id, error = %e, "Close on dead connection");
            }
            Err(_) => tracing::debug!(connection_id = self.id, "Close frame timed out"),
        }
    }
}

// =============================================================================
// Connector
// =============================================================================

/// Dials the quote stream and authenticates each new connection.
#[derive(Debug)]
pub struct StreamConnector {
    endpoint: StreamEndpoint,
    credentials: Credentials,
    connect_timeout: Duration,
    auth_timeout: Duration,
    codec: JsonCodec,
    next_id: AtomicU64,
}

impl StreamConnector {
    /// Create a connector with default timeouts.
    #[must_use]
    pub const fn new(endpoint: StreamEndpoint, credentials: Credentials) -> Self {
        Self {
            endpoint,
            credentials,
            connect_timeout: CONNECT_TIMEOUT,
            auth_timeout: AUTH_TIMEOUT,
            codec: JsonCodec::new(),
            next_id: AtomicU64::new(1),
        }
    }

    /// Override the dial timeout.
    #[must_use]
    pub const fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Override the handshake timeout.
    #[must_use]
    pub const fn with_auth_timeout(mut self, timeout: Duration) -> Self {
        self.auth_timeout = timeout;
        self
    }

    /// The endpoint this connector dials.
    #[must_use]
    pub const fn endpoint(&self) -> &StreamEndpoint {
        &self.endpoint
    }

    async fn dial(&self) -> Result<WsStream, TransportError> {
        let url = &self.endpoint.stream_url;
        let mut request = url
            .as_str()
            .into_client_request()
            .map_err(|e| TransportError::InvalidEndpoint(format!("{url}: {e}")))?;

        let origin = self.endpoint.origin();
        let origin_header = HeaderValue::from_str(&origin)
            .map_err(|e| TransportError::InvalidEndpoint(format!("origin {origin}: {e}")))?;
        request.headers_mut().insert(ORIGIN, origin_header);

        let (ws, _response) = tokio::time::timeout(self.connect_timeout, connect_async(request))
            .await
            .map_err(|_| TransportError::ConnectTimeout {
                url: url.clone(),
                timeout: self.connect_timeout,
            })?
            .map_err(|e| TransportError::ConnectFailed {
                url: url.clone(),
                reason: e.to_string(),
            })?;

        Ok(ws)
    }

    async fn authenticate(&self, conn: &mut FeedConnection) -> Result<(), AuthError> {
        let mut handler = AuthHandler::new(self.credentials.clone());
        let request = handler.create_auth_request();
        let text = self
            .codec
            .encode(&request)
            .map_err(|e| AuthError::SendFailed(e.to_string()))?;
        conn.send_text(text)
            .await
            .map_err(|e| AuthError::SendFailed(e.to_string()))?;

        loop {
            let frame = conn
                .read_frame()
                .await
                .map_err(|e| AuthError::NoResponse(e.to_string()))?;
            if frame == Frame::Keepalive {
                continue;
            }
            if handler.on_frame(frame.decode(&self.codec))? == AuthProgress::Authenticated {
                return Ok(());
            }
        }
    }
}

#[async_trait]
impl Connector for StreamConnector {
    async fn connect(&self) -> Result<FeedConnection, TransportError> {
        let ws = self.dial().await?;
        let (writer, reader) = ws.split();
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let mut conn = FeedConnection { id, writer, reader };

        tracing::debug!(
            connection_id = id,
            url = %self.endpoint.stream_url,
            "Connected, authenticating"
        );

        let outcome = tokio::time::timeout(self.auth_timeout, self.authenticate(&mut conn))
            .await
            .unwrap_or(Err(AuthError::Timeout(self.auth_timeout)));

        if let Err(e) = outcome {
            conn.close().await;
            return Err(TransportError::AuthFailed(e));
        }

        tracing::info!(connection_id = id, "Authenticated");
        Ok(conn)
    }
}
