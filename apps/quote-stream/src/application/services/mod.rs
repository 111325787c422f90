//! Application Services
//!
//! Services that orchestrate domain logic and coordinate between ports.
//!
//! - `PriceReporter`: Periodically snapshots the price book and logs it

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::domain::price_book::SharedPriceBook;
use crate::domain::streaming::Quote;
use crate::domain::subscription::Symbol;
use crate::infrastructure::metrics;

/// One line of a price report.
#[derive(Debug, Clone, PartialEq)]
pub struct QuoteSummary {
    /// Ticker symbol.
    pub symbol: Symbol,
    /// Bid price.
    pub bid: f64,
    /// Ask price.
    pub ask: f64,
    /// Ask minus bid.
    pub spread: f64,
    /// Midpoint.
    pub mid: f64,
}

/// Summarize a snapshot, sorted by symbol.
#[must_use]
pub fn summarize(snapshot: &HashMap<Symbol, Arc<Quote>>) -> Vec<QuoteSummary> {
    let mut rows: Vec<QuoteSummary> = snapshot
        .values()
        .map(|q| QuoteSummary {
            symbol: q.symbol.clone(),
            bid: q.bid_price,
            ask: q.ask_price,
            spread: q.spread(),
            mid: q.mid(),
        })
        .collect();
    rows.sort_by(|a, b| a.symbol.cmp(&b.symbol));
    rows
}

/// Logs the price book on a fixed interval until cancelled.
///
/// Only reads the book; it never blocks the session's writes for longer
/// than a snapshot copy.
pub struct PriceReporter {
    price_book: SharedPriceBook,
    interval: Duration,
    cancel: CancellationToken,
}

impl PriceReporter {
    /// Create a reporter.
    #[must_use]
    pub const fn new(
        price_book: SharedPriceBook,
        interval: Duration,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            price_book,
            interval,
            cancel,
        }
    }

    /// Take one report.
    #[must_use]
    pub fn report(&self) -> Vec<QuoteSummary> {
        let rows = summarize(&self.price_book.snapshot());
        #[allow(clippy::cast_precision_loss)]
        metrics::set_price_book_size(rows.len() as f64);

        for row in &rows {
            tracing::info!(
                symbol = %row.symbol,
                bid = row.bid,
                ask = row.ask,
                spread = row.spread,
                mid = row.mid,
                "Price"
            );
        }
        tracing::debug!(
            symbols = rows.len(),
            updates = self.price_book.update_count(),
            last_updated = ?self.price_book.last_updated(),
            "Price book reported"
        );
        rows
    }

    /// Run until the cancellation token fires.
    pub async fn run(self) {
        let mut interval = tokio::time::interval(self.interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        // The first tick completes immediately; report only after a full period.
        interval.tick().await;

        loop {
            tokio::select! {
                () = self.cancel.cancelled() => {
                    tracing::debug!("Price reporter cancelled");
                    break;
                }
                _ = interval.tick() => {
                    let _ = self.report();
                }
            }
        }
    }
}
