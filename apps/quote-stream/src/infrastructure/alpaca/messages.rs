//! Quote Feed Message Types
//!
//! Wire format types for the quote stream's JSON text frames.
//!
//! # Message Types
//!
//! ## Control Messages (server -> client)
//! - `Success`: Connection greeting or authentication success
//! - `Error`: Error response with code and message
//! - `Subscription`: Subscription confirmation
//!
//! ## Data Messages (server -> client)
//! - `Quote`: Stock quotes, see [`Quote`]
//!
//! ## Requests (client -> server)
//! - `AuthRequest`: `{"action":"auth","key":..,"secret":..}`
//! - `SubscriptionRequest`: `{"action":"subscribe","quotes":[..]}`

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::domain::streaming::Quote;

// =============================================================================
// Control Messages
// =============================================================================

/// Greeting sent by some feeds right after the socket opens.
pub const CONNECTED_GREETING: &str = "connected";

/// Message sent when credentials are accepted.
pub const AUTHENTICATED: &str = "authenticated";

/// Success message indicating connection or authentication succeeded.
///
/// # Wire Format (JSON)
/// ```json
/// {"T": "success", "msg": "connected"}
/// {"T": "success", "msg": "authenticated"}
/// ```
///
/// Some peers use `message` instead of `msg`; both are accepted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SuccessMessage {
    /// Message type (always "success")
    #[serde(rename = "T")]
    pub msg_type: String,

    /// Free-form status, typically "connected" or "authenticated"
    #[serde(default, alias = "message")]
    pub msg: String,
}

impl SuccessMessage {
    /// Create a success message.
    #[must_use]
    pub fn new(msg: impl Into<String>) -> Self {
        Self {
            msg_type: "success".to_string(),
            msg: msg.into(),
        }
    }

    /// Whether this is the pre-auth connection greeting.
    #[must_use]
    pub fn is_connected_greeting(&self) -> bool {
        self.msg.eq_ignore_ascii_case(CONNECTED_GREETING)
    }
}

/// Error message with code and description.
///
/// # Wire Format (JSON)
/// ```json
/// {"T": "error", "code": 402, "msg": "auth failed"}
/// ```
///
/// # Error Codes
/// - 400: Invalid syntax
/// - 401: Not authenticated
/// - 402: Auth failed
/// - 403: Already authenticated
/// - 404: Auth timeout
/// - 405: Symbol limit exceeded
/// - 406: Connection limit exceeded
/// - 407: Slow client
/// - 408: Insufficient subscription
/// - 500: Internal error
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorMessage {
    /// Message type (always "error")
    #[serde(rename = "T")]
    pub msg_type: String,

    /// Error code
    #[serde(default)]
    pub code: i32,

    /// Error message
    #[serde(default, alias = "message")]
    pub msg: String,
}

impl ErrorMessage {
    /// Create an error message.
    #[must_use]
    pub fn new(code: i32, msg: impl Into<String>) -> Self {
        Self {
            msg_type: "error".to_string(),
            code,
            msg: msg.into(),
        }
    }

    /// Check if this is an authentication error.
    #[must_use]
    pub const fn is_auth_error(&self) -> bool {
        matches!(self.code, 401..=404)
    }

    /// Check if this is a rate limit error.
    #[must_use]
    pub const fn is_rate_limit_error(&self) -> bool {
        matches!(self.code, 405..=407)
    }
}

/// Subscription confirmation message.
///
/// # Wire Format (JSON)
/// ```json
/// {"T": "subscription", "quotes": ["AAPL", "ACA"]}
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscriptionMessage {
    /// Message type (always "subscription")
    #[serde(rename = "T")]
    pub msg_type: String,

    /// Subscribed quote symbols
    #[serde(default)]
    pub quotes: Vec<String>,
}

impl SubscriptionMessage {
    /// Create a confirmation listing `quotes`.
    #[must_use]
    pub fn new(quotes: Vec<String>) -> Self {
        Self {
            msg_type: "subscription".to_string(),
            quotes,
        }
    }
}

/// One decoded element of an inbound frame.
#[derive(Debug, Clone, PartialEq)]
pub enum FeedMessage {
    /// Success/greeting control message.
    Success(SuccessMessage),
    /// Error control message.
    Error(ErrorMessage),
    /// Subscription confirmation.
    Subscription(SubscriptionMessage),
    /// Stock quote.
    Quote(Quote),
    /// Recognized object of a type this client does not consume (trades, bars, ...).
    Ignored(String),
}

// =============================================================================
// Outbound Messages (Client -> Server)
// =============================================================================

/// Authentication request.
#[derive(Clone, Serialize)]
pub struct AuthRequest {
    /// Action: "auth"
    pub action: &'static str,

    /// API key
    pub key: String,

    /// API secret
    pub secret: String,
}

impl AuthRequest {
    /// Create a new authentication request.
    #[must_use]
    pub const fn new(key: String, secret: String) -> Self {
        Self {
            action: "auth",
            key,
            secret,
        }
    }
}

impl fmt::Debug for AuthRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthRequest")
            .field("action", &self.action)
            .field("key", &"[REDACTED]")
            .field("secret", &"[REDACTED]")
            .finish()
    }
}

/// Quote subscription request.
///
/// Always carries the complete symbol set; the feed treats it as the
/// desired state rather than a delta.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SubscriptionRequest {
    /// Action: "subscribe"
    pub action: &'static str,

    /// Quote symbols
    pub quotes: Vec<String>,
}

impl SubscriptionRequest {
    /// Create a subscribe request for `quotes`.
    #[must_use]
    pub const fn subscribe(quotes: Vec<String>) -> Self {
        Self {
            action: "subscribe",
            quotes,
        }
    }
}

/// Client request as seen by the server side of the protocol.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "action", rename_all = "lowercase")]
pub enum ClientRequest {
    /// Credentials presented on a new connection.
    Auth {
        /// API key
        key: String,
        /// API secret
        secret: String,
    },
    /// Full desired quote subscription.
    Subscribe {
        /// Quote symbols
        #[serde(default)]
        quotes: Vec<String>,
    },
}
