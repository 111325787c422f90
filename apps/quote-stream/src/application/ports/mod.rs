//! Port Interfaces
//!
//! Defines the interfaces (ports) for external systems following
//! the Hexagonal Architecture pattern. These are the contracts that
//! infrastructure adapters must implement.
//!
//! ## Driven Ports (Outbound)
//!
//! - `Connector`: Opens and authenticates one connection to the quote feed

use async_trait::async_trait;

use crate::infrastructure::alpaca::connector::{FeedConnection, TransportError};

/// Opens authenticated connections to the quote feed.
///
/// Called once at session start and again for every reconnect attempt.
/// Implementations must not subscribe; the session owns that.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Connector: Send + Sync {
    /// Dial the feed and complete the auth handshake.
    async fn connect(&self) -> Result<FeedConnection, TransportError>;
}
