//! Infrastructure Layer - Adapters and external integrations.
//!
//! This layer contains the concrete implementations of the port interfaces
//! defined in the application layer.

/// Quote stream WebSocket adapters and the session state machine.
pub mod alpaca;

/// Configuration loading.
pub mod config;

/// Prometheus metrics instrumentation.
pub mod metrics;

/// In-process server side of the quote stream protocol.
pub mod simulator;

/// OpenTelemetry tracing integration.
pub mod telemetry;
