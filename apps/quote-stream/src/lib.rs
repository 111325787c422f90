#![cfg_attr(
    test,
    allow(
        clippy::unwrap_used,
        clippy::expect_used,
        clippy::float_cmp,
        clippy::significant_drop_tightening,
        clippy::too_many_lines,
        clippy::match_same_arms,
        clippy::needless_pass_by_value,
        clippy::items_after_statements
    )
)]

//! Quote Stream - Resilient Market Data Session
//!
//! Keeps a quote subscription alive against a streaming price feed and
//! maintains the latest quote per symbol.
//!
//! # Layers (inside → outside)
//!
//! - **Domain**: Core quote types and state
//!   - `streaming`: Quote and batch types
//!   - `subscription`: Cumulative subscription set
//!   - `price_book`: Latest quote per symbol
//!
//! - **Application**: Use cases and port definitions
//!   - `ports`: Feed connector interface
//!   - `services`: Periodic price book reporting
//!
//! - **Infrastructure**: Adapters and external integrations
//!   - `alpaca`: WebSocket connector, codec and the session state machine
//!   - `config`: Configuration from the environment
//!   - `metrics`: Prometheus instrumentation
//!   - `simulator`: In-process price feed for tests and local runs
//!   - `telemetry`: Logging and OpenTelemetry setup
//!
//! # Data Flow
//!
//! ```text
//! Quote feed WS ──► FeedConnection ──► QuoteSession ──┬──► PriceBook
//!       ▲                                  │          │
//!       └──── reconnect + resubscribe ◄────┘          └──► QuoteStream ──► consumer
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::pedantic)]

// =============================================================================
// Module Declarations
// =============================================================================

/// Domain layer - Core quote types with no I/O.
pub mod domain;

/// Application layer - Use cases and port definitions.
pub mod application;

/// Infrastructure layer - Adapters and external integrations.
pub mod infrastructure;

// =============================================================================
// Re-exports
// =============================================================================

// Domain types
pub use domain::price_book::{PriceBook, SharedPriceBook};
pub use domain::streaming::{Quote, QuoteBatch};
pub use domain::subscription::{SubscriptionSet, Symbol};

// Application
pub use application::ports::Connector;
pub use application::services::{PriceReporter, QuoteSummary, summarize};

// Session and connector
pub use infrastructure::alpaca::{
    Credentials, ErrorKind, FeedConnection, HeartbeatConfig, LifecycleState, QuoteSession,
    QuoteStream, ReconnectConfig, SessionError, SessionEvent, SessionOptions, StreamConnector,
    StreamEndpoint, TransportError,
};

// Infrastructure config
pub use infrastructure::config::{ConfigError, DataFeed, Environment, StreamConfig};

// Simulator (for integration tests and local runs)
pub use infrastructure::simulator::{PeerRequest, PriceSimulator, SimulatorConfig, SimulatorError};

// Metrics
pub use infrastructure::metrics::{MetricsError, init_metrics};

// Telemetry
pub use infrastructure::telemetry::{
    TelemetryConfig, TelemetryError, TelemetryGuard, init as init_telemetry,
};
