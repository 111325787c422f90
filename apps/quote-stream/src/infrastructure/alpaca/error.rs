//! Session Error Types
//!
//! Failure taxonomy for the quote session. Failures during `start` are
//! returned to the caller. Failures while streaming are classified with
//! [`ErrorKind`] for logs and metrics and then handled by reconnecting.

use super::codec::CodecError;
use super::connector::TransportError;

/// Classification of session failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Dial or endpoint resolution failed.
    ConnectFailed,
    /// Auth handshake failed.
    AuthFailed,
    /// Subscription frame could not be sent or acknowledged.
    SubscribeFailed,
    /// An inbound frame could not be decoded.
    DecodeFailed,
    /// Reading from the connection failed or the peer closed it.
    ReadFailed,
    /// The session has been stopped.
    Stopped,
}

impl ErrorKind {
    /// Label used in logs and metrics.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::ConnectFailed => "connect_failed",
            Self::AuthFailed => "auth_failed",
            Self::SubscribeFailed => "subscribe_failed",
            Self::DecodeFailed => "decode_failed",
            Self::ReadFailed => "read_failed",
            Self::Stopped => "stopped",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors surfaced by the quote session.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    /// Connecting or authenticating failed.
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// Subscription frame could not be sent or was not acknowledged.
    #[error("subscribe failed: {0}")]
    SubscribeFailed(String),

    /// Inbound frame could not be decoded.
    #[error("decode failed: {0}")]
    DecodeFailed(#[from] CodecError),

    /// Reading from the connection failed.
    #[error("read failed: {0}")]
    ReadFailed(String),

    /// The session has been stopped.
    #[error("session stopped")]
    Stopped,
}

impl SessionError {
    /// Classify this error.
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::Transport(e) => e.kind(),
            Self::SubscribeFailed(_) => ErrorKind::SubscribeFailed,
            Self::DecodeFailed(_) => ErrorKind::DecodeFailed,
            Self::ReadFailed(_) => ErrorKind::ReadFailed,
            Self::Stopped => ErrorKind::Stopped,
        }
    }
}
