//! Quote Stream Binary
//!
//! Opens a self-healing quote session, logs every batch and reports the
//! price book periodically.
//!
//! # Usage
//!
//! ```bash
//! cargo run --bin quote-stream
//! ```
//!
//! # Environment Variables
//!
//! ## Required
//! - `APCA_PAPER_API_KEY` / `APCA_PAPER_API_SECRET` (or the `APCA_LIVE_` pair)
//!
//! ## Optional
//! - `APCA_ENVIRONMENT`: prod | live select the live prefix (default: paper)
//! - `APCA_PAPER_MARKET_STREAM`: WebSocket URL (default: iex feed)
//! - `APCA_PAPER_BASE_URL`, `APCA_PAPER_API_VERSION`: handshake origin
//! - `ALPACA_FEED`: "sip" | "iex" | "test" (default: iex)
//! - `QUOTE_STREAM_SYMBOLS`: Comma separated symbols (default: FAKEPACA)
//! - `QUOTE_STREAM_METRICS_PORT`: Prometheus metrics port, 0 disables (default: 9090)
//! - `QUOTE_STREAM_REPORT_INTERVAL_SECS`: Price book report interval (default: 5)
//! - `LOG_FORMAT`: "json" for structured logs
//! - `OTEL_ENABLED`: Enable OpenTelemetry (default: false)
//! - `RUST_LOG`: Log filter (default: quote_stream=info)

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use quote_stream::infrastructure::telemetry;
use quote_stream::{
    Connector, PriceBook, PriceReporter, QuoteSession, QuoteStream, SessionEvent, StreamConfig,
    init_metrics,
};
use tokio::signal;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

/// Graceful shutdown timeout.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    if rustls::crypto::ring::default_provider()
        .install_default()
        .is_err()
    {
        anyhow::bail!("failed to install rustls crypto provider");
    }

    load_dotenv();

    let _telemetry_guard = telemetry::init().context("failed to initialize telemetry")?;

    tracing::info!("Starting quote stream");

    let config = StreamConfig::from_env().context("invalid configuration")?;
    log_config(&config);

    let metrics_addr = (config.server.metrics_port != 0)
        .then(|| SocketAddr::from(([0, 0, 0, 0], config.server.metrics_port)));
    init_metrics(metrics_addr).context("failed to initialize metrics")?;

    let shutdown_token = CancellationToken::new();
    let price_book = PriceBook::shared();
    let connector: Arc<dyn Connector> = Arc::new(config.connector());

    let (session, quotes) = QuoteSession::start(
        connector,
        Arc::clone(&price_book),
        config.symbols.clone(),
        config.session_options(),
    )
    .await
    .context("failed to start quote session")?;

    tokio::spawn(log_events(session.events(), shutdown_token.clone()));
    tokio::spawn(consume(quotes));

    let reporter = PriceReporter::new(
        Arc::clone(&price_book),
        config.server.report_interval,
        shutdown_token.clone(),
    );
    let reporter_handle = tokio::spawn(reporter.run());

    tracing::info!(session_id = %session.id(), "Quote stream ready");

    await_shutdown(shutdown_token).await;

    if tokio::time::timeout(SHUTDOWN_TIMEOUT, session.stop())
        .await
        .is_err()
    {
        tracing::warn!(
            timeout_secs = SHUTDOWN_TIMEOUT.as_secs(),
            "Session did not stop in time"
        );
    }
    let _ = reporter_handle.await;

    tracing::info!(
        symbols = price_book.len(),
        updates = price_book.update_count(),
        "Quote stream stopped"
    );
    Ok(())
}

/// Log every delivered quote.
async fn consume(mut quotes: QuoteStream) {
    while let Some(batch) = quotes.recv().await {
        for quote in batch.iter() {
            tracing::info!(connection_id = batch.connection_id, quote = %quote, "Quote");
        }
    }
    tracing::debug!("Quote stream closed");
}

/// Log session lifecycle events until shutdown.
async fn log_events(mut events: broadcast::Receiver<SessionEvent>, shutdown: CancellationToken) {
    loop {
        let event = tokio::select! {
            () = shutdown.cancelled() => break,
            event = events.recv() => event,
        };

        match event {
            Ok(SessionEvent::Stopped) => {
                tracing::info!("Session stopped");
                break;
            }
            Ok(event) => tracing::info!(event = ?event, "Session event"),
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                tracing::warn!(skipped, "Session event log lagged");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

/// Load .env file from current directory or any ancestor directory.
fn load_dotenv() {
    if dotenvy::dotenv().is_ok() {
        return;
    }

    if let Ok(cwd) = std::env::current_dir() {
        let mut dir = cwd.as_path();
        while let Some(parent) = dir.parent() {
            let env_path = parent.join(".env");
            if env_path.exists() {
                let _ = dotenvy::from_path(&env_path);
                return;
            }
            dir = parent;
        }
    }
}

/// Log the parsed configuration.
fn log_config(config: &StreamConfig) {
    if config.environment.is_live() {
        tracing::warn!("LIVE environment");
    }
    tracing::info!(
        environment = config.environment.as_str(),
        feed = config.feed.as_str(),
        symbols = ?config.symbols,
        metrics_port = config.server.metrics_port,
        "Configuration loaded"
    );
    tracing::debug!(
        market_stream = %config.market_stream,
        origin = %config.endpoint().origin(),
        "Stream endpoint"
    );
}

/// Wait for shutdown signal (SIGTERM or SIGINT).
async fn await_shutdown(shutdown_token: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            tracing::info!("Received Ctrl+C, initiating shutdown");
        }
        () = terminate => {
            tracing::info!("Received SIGTERM, initiating shutdown");
        }
    }

    shutdown_token.cancel();
}
