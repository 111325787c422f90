//! Feed Authentication
//!
//! Handles the authentication handshake performed once per physical
//! connection, before any subscription is sent.
//!
//! # Authentication Flow
//!
//! 1. Connect to the stream endpoint
//! 2. Send `{"action":"auth","key":"...","secret":"..."}`
//! 3. Consume the response frame
//!
//! The feed does not return a status this client relies on: any readable
//! response completes the handshake. Two cases are handled explicitly:
//!
//! - A `{"T":"success","msg":"connected"}` greeting that some feeds send
//!   on open is skipped once, so the real reply is the one consumed.
//! - An explicit `{"T":"error",...}` reply fails the handshake.
//!
//! # Error Codes
//!
//! - 401: Not authenticated
//! - 402: Authentication failed (invalid credentials)
//! - 403: Already authenticated
//! - 404: Authentication timeout (>10 seconds)
//! - 406: Connection limit exceeded

use std::time::Duration;

use thiserror::Error;

use super::codec::CodecError;
use super::messages::{AuthRequest, ErrorMessage, FeedMessage};

// =============================================================================
// Constants
// =============================================================================

/// Maximum time allowed for the handshake after the socket opens.
pub const AUTH_TIMEOUT: Duration = Duration::from_secs(10);

// =============================================================================
// Error Types
// =============================================================================

/// Errors that can occur during authentication.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AuthError {
    /// The auth frame could not be written.
    #[error("failed to send auth request: {0}")]
    SendFailed(String),

    /// The connection ended before any response arrived.
    #[error("no auth response: {0}")]
    NoResponse(String),

    /// No response within [`AUTH_TIMEOUT`].
    #[error("authentication timeout after {0:?}")]
    Timeout(Duration),

    /// Not authenticated.
    #[error("not authenticated: must authenticate before making requests")]
    NotAuthenticated,

    /// Authentication failed (invalid credentials).
    #[error("authentication failed: invalid API key or secret")]
    InvalidCredentials,

    /// Connection was already authenticated.
    #[error("already authenticated: connection is already authenticated")]
    AlreadyAuthenticated,

    /// The server's own auth window expired.
    #[error("authentication window expired on server")]
    ServerTimeout,

    /// Connection limit exceeded.
    #[error("connection limit exceeded: too many concurrent connections")]
    ConnectionLimitExceeded,

    /// Credentials failed local validation.
    #[error("invalid credentials: {0}")]
    InvalidCredentialFormat(String),

    /// Any other error reply from the server.
    #[error("server error ({code}): {message}")]
    ServerError {
        /// Error code from server
        code: i32,
        /// Error message from server
        message: String,
    },
}

impl From<&ErrorMessage> for AuthError {
    fn from(err: &ErrorMessage) -> Self {
        match err.code {
            401 => Self::NotAuthenticated,
            402 => Self::InvalidCredentials,
            403 => Self::AlreadyAuthenticated,
            404 => Self::ServerTimeout,
            406 => Self::ConnectionLimitExceeded,
            code => Self::ServerError {
                code,
                message: err.msg.clone(),
            },
        }
    }
}

// =============================================================================
// Credentials
// =============================================================================

/// API credentials presented on every new connection.
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    key: String,
    secret: String,
}

impl Credentials {
    /// Create new credentials.
    ///
    /// # Errors
    ///
    /// Returns an error if either key or secret is empty.
    pub fn new(key: impl Into<String>, secret: impl Into<String>) -> Result<Self, AuthError> {
        let key = key.into();
        let secret = secret.into();

        if key.is_empty() {
            return Err(AuthError::InvalidCredentialFormat(
                "API key cannot be empty".to_string(),
            ));
        }
        if secret.is_empty() {
            return Err(AuthError::InvalidCredentialFormat(
                "API secret cannot be empty".to_string(),
            ));
        }

        Ok(Self { key, secret })
    }

    /// Get the API key.
    #[must_use]
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Get the API secret.
    #[must_use]
    pub fn secret(&self) -> &str {
        &self.secret
    }

    /// Create the auth frame for these credentials.
    #[must_use]
    pub fn to_auth_request(&self) -> AuthRequest {
        AuthRequest::new(self.key.clone(), self.secret.clone())
    }
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("key", &"[REDACTED]")
            .field("secret", &"[REDACTED]")
            .finish()
    }
}

// =============================================================================
// Authentication State
// =============================================================================

/// Current state of the handshake on one connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AuthState {
    /// Socket open, auth frame not sent yet.
    #[default]
    Connected,

    /// Auth frame sent, awaiting response.
    Authenticating,

    /// Handshake complete.
    Authenticated,

    /// Server rejected the credentials.
    Failed,
}

/// Result of feeding one response frame to the handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthProgress {
    /// The frame was a pre-auth greeting; keep reading.
    Pending,
    /// The handshake is complete.
    Authenticated,
}

/// Handshake state machine for one physical connection.
#[derive(Debug)]
pub struct AuthHandler {
    credentials: Credentials,
    state: AuthState,
    greeting_seen: bool,
}

impl AuthHandler {
    /// Create a handler for a freshly opened connection.
    #[must_use]
    pub const fn new(credentials: Credentials) -> Self {
        Self {
            credentials,
            state: AuthState::Connected,
            greeting_seen: false,
        }
    }

    /// Get the current authentication state.
    #[must_use]
    pub const fn state(&self) -> AuthState {
        self.state
    }

    /// Create the auth frame and move to `Authenticating`.
    #[must_use]
    pub fn create_auth_request(&mut self) -> AuthRequest {
        self.state = AuthState::Authenticating;
        self.credentials.to_auth_request()
    }

    /// Process one response frame.
    ///
    /// A frame that cannot be decoded still counts as a response.
    ///
    /// # Errors
    ///
    /// Returns the mapped [`AuthError`] if the frame carries an error reply.
    pub fn on_frame(
        &mut self,
        decoded: Result<Vec<FeedMessage>, CodecError>,
    ) -> Result<AuthProgress, AuthError> {
        let messages = match decoded {
            Ok(messages) => messages,
            Err(e) => {
                tracing::debug!(error = %e, "Undecodable auth response accepted");
                self.state = AuthState::Authenticated;
                return Ok(AuthProgress::Authenticated);
            }
        };

        if let Some(err) = messages.iter().find_map(|m| match m {
            FeedMessage::Error(err) => Some(err),
            _ => None,
        }) {
            self.state = AuthState::Failed;
            return Err(AuthError::from(err));
        }

        let only_greeting = !messages.is_empty()
            && messages
                .iter()
                .all(|m| matches!(m, FeedMessage::Success(s) if s.is_connected_greeting()));

        if only_greeting && !self.greeting_seen {
            self.greeting_seen = true;
            return Ok(AuthProgress::Pending);
        }

        self.state = AuthState::Authenticated;
        Ok(AuthProgress::Authenticated)
    }
}
