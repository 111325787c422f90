//! Price Simulator Binary
//!
//! Serves the quote stream protocol locally and publishes a random walk of
//! quotes, optionally dropping every connection on a fixed period.
//!
//! # Usage
//!
//! ```bash
//! cargo run --bin price-simulator
//! APCA_PAPER_MARKET_STREAM=ws://127.0.0.1:8080/pricing cargo run --bin quote-stream
//! ```
//!
//! # Environment Variables
//!
//! - `SIMULATOR_ADDR`: Listen address (default: 127.0.0.1:8080)
//! - `SIMULATOR_SYMBOLS`: Comma separated symbols (default: FAKEPACA)
//! - `SIMULATOR_INTERVAL_MS`: Publish interval (default: 1000)
//! - `SIMULATOR_DROP_EVERY_SECS`: Force a disconnect this often, 0 disables (default: 0)
//! - `SIMULATOR_GREETING`: Send a `connected` greeting on open (default: false)

use std::collections::HashMap;
use std::time::Duration;

use anyhow::Context;
use quote_stream::infrastructure::telemetry;
use quote_stream::{PriceSimulator, Quote, SimulatorConfig};
use rand::Rng;

const DEFAULT_ADDR: &str = "127.0.0.1:8080";
const STARTING_MID: f64 = 100.0;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();
    let _telemetry_guard = telemetry::init().context("failed to initialize telemetry")?;

    let addr = std::env::var("SIMULATOR_ADDR").unwrap_or_else(|_| DEFAULT_ADDR.to_string());
    let symbols: Vec<String> = std::env::var("SIMULATOR_SYMBOLS")
        .unwrap_or_else(|_| "FAKEPACA".to_string())
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_uppercase)
        .collect();
    let interval = Duration::from_millis(env_u64("SIMULATOR_INTERVAL_MS", 1000)?.max(1));
    let drop_every = Duration::from_secs(env_u64("SIMULATOR_DROP_EVERY_SECS", 0)?);
    let config = SimulatorConfig {
        send_greeting: std::env::var("SIMULATOR_GREETING")
            .is_ok_and(|v| v.eq_ignore_ascii_case("true")),
        ..SimulatorConfig::default()
    };

    let simulator = PriceSimulator::bind(&addr, config)
        .await
        .context("failed to start price simulator")?;
    tracing::info!(
        ws_url = %simulator.ws_url(),
        http_url = %simulator.http_url(),
        symbols = ?symbols,
        "Price simulator ready"
    );

    let mut mids: HashMap<String, f64> = symbols.iter().map(|s| (s.clone(), STARTING_MID)).collect();
    let mut publish = tokio::time::interval(interval);
    let mut drops = (!drop_every.is_zero()).then(|| {
        tokio::time::interval_at(tokio::time::Instant::now() + drop_every, drop_every)
    });

    loop {
        tokio::select! {
            result = tokio::signal::ctrl_c() => {
                if let Err(e) = result {
                    tracing::error!(error = %e, "Failed to listen for Ctrl+C");
                }
                break;
            }
            _ = publish.tick() => {
                let quotes = step(&mut mids);
                let sent = simulator.publish(&quotes).context("failed to encode quotes")?;
                tracing::debug!(connections = sent, quotes = quotes.len(), "Published");
            }
            _ = next_drop(&mut drops) => {
                let dropped = simulator.disconnect();
                tracing::info!(dropped, "Forced disconnect");
            }
        }
    }

    simulator.shutdown();
    tracing::info!(
        accepted = simulator.connections_accepted(),
        "Price simulator stopped"
    );
    Ok(())
}

/// Advance every symbol's mid by a small random step and quote around it.
fn step(mids: &mut HashMap<String, f64>) -> Vec<Quote> {
    let mut rng = rand::rng();
    let mut quotes: Vec<Quote> = mids
        .iter_mut()
        .map(|(symbol, mid)| {
            *mid = (*mid + rng.random_range(-0.5..=0.5)).max(1.0);
            let half_spread = rng.random_range(0.01..=0.10);
            Quote::new(symbol.clone(), round_cents(*mid - half_spread), round_cents(*mid + half_spread))
                .with_sizes(rng.random_range(1..=10), rng.random_range(1..=10))
                .with_exchanges("V", "V")
                .with_timestamp(chrono::Utc::now().to_rfc3339())
                .with_conditions(vec!["R".to_string()])
                .with_tape("C")
        })
        .collect();
    quotes.sort_by(|a, b| a.symbol.cmp(&b.symbol));
    quotes
}

fn round_cents(price: f64) -> f64 {
    (price * 100.0).round() / 100.0
}

async fn next_drop(drops: &mut Option<tokio::time::Interval>) {
    match drops {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}

fn env_u64(key: &str, default: u64) -> anyhow::Result<u64> {
    match std::env::var(key) {
        Ok(v) => v
            .trim()
            .parse()
            .with_context(|| format!("{key} must be an unsigned integer, got {v:?}")),
        Err(_) => Ok(default),
    }
}
