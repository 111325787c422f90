//! Quote Stream WebSocket Adapters
//!
//! Client side of the quote feed:
//!
//! - **connector**: dial, authenticate, read and write frames
//! - **session**: self-healing subscription across connections
//! - **codec** / **messages**: JSON wire format
//! - **reconnect** / **heartbeat**: backoff schedule and liveness

pub mod auth;
pub mod codec;
pub mod connector;
pub mod error;
pub mod heartbeat;
pub mod messages;
pub mod reconnect;
pub mod session;

pub use auth::{AuthError, AuthHandler, AuthProgress, AuthState, Credentials};
pub use codec::{CodecError, JsonCodec};
pub use connector::{FeedConnection, Frame, StreamConnector, StreamEndpoint, TransportError};
pub use error::{ErrorKind, SessionError};
pub use heartbeat::{HeartbeatAction, HeartbeatConfig, HeartbeatMonitor};
pub use messages::*;
pub use reconnect::{ReconnectConfig, ReconnectPolicy};
pub use session::{
    LifecycleState, QuoteSession, QuoteStream, SessionEvent, SessionOptions,
};
