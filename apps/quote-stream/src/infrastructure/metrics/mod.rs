//! Prometheus Metrics Module
//!
//! Exposes session metrics in Prometheus format.
//!
//! # Metrics Categories
//!
//! - **Quotes**: Quotes received and batches delivered
//! - **Connections**: Connection state, losses by kind, reconnects
//! - **Subscriptions**: Subscribed symbol count
//! - **Price book**: Number of symbols with a quote
//!
//! # Integration
//!
//! When a listen address is given, metrics are served at `/metrics` by the
//! exporter's own HTTP listener.

use std::net::SocketAddr;
use std::sync::OnceLock;

use metrics::{counter, describe_counter, describe_gauge, gauge};
use metrics_exporter_prometheus::{BuildError, PrometheusBuilder, PrometheusHandle};

use crate::infrastructure::alpaca::ErrorKind;

// =============================================================================
// Global Metrics Handle
// =============================================================================

static PROMETHEUS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Metrics initialization error.
#[derive(Debug, thiserror::Error)]
pub enum MetricsError {
    /// The recorder or listener could not be installed.
    #[error("failed to install Prometheus recorder: {0}")]
    Install(#[from] BuildError),

    /// Another global recorder is already installed.
    #[error("a global metrics recorder is already installed")]
    AlreadyInstalled,
}

/// Install the Prometheus recorder, optionally serving `/metrics` on `listen`.
///
/// Must be called from within a Tokio runtime when `listen` is set.
/// Calling it again returns without reinstalling.
///
/// # Errors
///
/// Returns an error if the recorder or HTTP listener cannot be installed.
pub fn init_metrics(listen: Option<SocketAddr>) -> Result<(), MetricsError> {
    if PROMETHEUS_HANDLE.get().is_some() {
        return Ok(());
    }

    let handle = match listen {
        Some(addr) => {
            let (recorder, exporter) = PrometheusBuilder::new().with_http_listener(addr).build()?;
            let handle = recorder.handle();
            metrics::set_global_recorder(recorder).map_err(|_| MetricsError::AlreadyInstalled)?;
            tokio::spawn(async move {
                if let Err(e) = exporter.await {
                    tracing::error!(error = ?e, "Metrics exporter stopped");
                }
            });
            tracing::info!(addr = %addr, "Metrics listener started");
            handle
        }
        None => PrometheusBuilder::new().install_recorder()?,
    };

    register_metrics();
    let _ = PROMETHEUS_HANDLE.set(handle);
    Ok(())
}

/// Get the Prometheus handle for rendering metrics.
///
/// Returns `None` if metrics have not been initialized.
#[must_use]
pub fn get_metrics_handle() -> Option<PrometheusHandle> {
    PROMETHEUS_HANDLE.get().cloned()
}

// =============================================================================
// Metric Registration
// =============================================================================

fn register_metrics() {
    describe_counter!(
        "quote_stream_quotes_received_total",
        "Total quotes received from the feed"
    );
    describe_counter!(
        "quote_stream_batches_delivered_total",
        "Total quote batches delivered to the output stream"
    );
    describe_counter!(
        "quote_stream_batches_dropped_total",
        "Total quote batches dropped because the consumer fell behind"
    );
    describe_counter!(
        "quote_stream_decode_failures_total",
        "Total inbound frames that could not be decoded"
    );
    describe_counter!(
        "quote_stream_connection_losses_total",
        "Total connection losses by failure kind"
    );
    describe_counter!(
        "quote_stream_reconnect_attempts_total",
        "Total reconnection attempts"
    );
    describe_counter!(
        "quote_stream_reconnects_total",
        "Total successful reconnections"
    );
    describe_gauge!(
        "quote_stream_connected",
        "1 while a feed connection is streaming, 0 otherwise"
    );
    describe_gauge!(
        "quote_stream_subscribed_symbols",
        "Number of symbols in the subscription set"
    );
    describe_gauge!(
        "quote_stream_price_book_symbols",
        "Number of symbols with a quote in the price book"
    );
}

// =============================================================================
// Metric Recording Functions
// =============================================================================

/// Record quotes received in one frame.
pub fn record_quotes_received(count: u64) {
    counter!("quote_stream_quotes_received_total").increment(count);
}

/// Record a batch delivered to the caller.
pub fn record_batch_delivered() {
    counter!("quote_stream_batches_delivered_total").increment(1);
}

/// Record a batch dropped from the consumer backlog.
pub fn record_batch_dropped() {
    counter!("quote_stream_batches_dropped_total").increment(1);
}

/// Record a frame that failed to decode.
pub fn record_decode_failure() {
    counter!("quote_stream_decode_failures_total").increment(1);
}

/// Record a connection loss.
pub fn record_connection_loss(kind: ErrorKind) {
    counter!(
        "quote_stream_connection_losses_total",
        "kind" => kind.as_str()
    )
    .increment(1);
}

/// Record a reconnection attempt.
pub fn record_reconnect_attempt() {
    counter!("quote_stream_reconnect_attempts_total").increment(1);
}

/// Record a successful reconnection.
pub fn record_reconnected() {
    counter!("quote_stream_reconnects_total").increment(1);
}

/// Update the connection state gauge.
pub fn set_connected(connected: bool) {
    gauge!("quote_stream_connected").set(if connected { 1.0 } else { 0.0 });
}

/// Update the subscribed symbol count.
pub fn set_subscribed_symbols(count: f64) {
    gauge!("quote_stream_subscribed_symbols").set(count);
}

/// Update the price book size.
pub fn set_price_book_size(count: f64) {
    gauge!("quote_stream_price_book_symbols").set(count);
}
