//! Price Book
//!
//! Latest quote per symbol, written by the session's receive loop and read
//! by reporters.
//!
//! # Concurrency
//!
//! One writer and any number of readers. Each key is replaced atomically,
//! but a snapshot taken while a batch is being applied may contain some
//! symbols from the new batch and others from before it. Quotes are stored
//! behind `Arc`, so readers hold the lock only long enough to copy
//! references.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use parking_lot::RwLock;

use crate::domain::streaming::Quote;
use crate::domain::subscription::Symbol;

/// Price book shared between the session and its readers.
pub type SharedPriceBook = Arc<PriceBook>;

/// Latest-quote-per-symbol cache.
#[derive(Debug, Default)]
pub struct PriceBook {
    quotes: RwLock<HashMap<Symbol, Arc<Quote>>>,
    updates: AtomicU64,
    last_updated: RwLock<Option<DateTime<Utc>>>,
}

impl PriceBook {
    /// Create an empty price book.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an empty price book ready for sharing.
    #[must_use]
    pub fn shared() -> SharedPriceBook {
        Arc::new(Self::new())
    }

    /// Overwrite the entry of every symbol in `quotes`.
    ///
    /// Later quotes for the same symbol within one call win.
    pub fn update(&self, quotes: &[Arc<Quote>]) {
        if quotes.is_empty() {
            return;
        }

        {
            let mut book = self.quotes.write();
            for quote in quotes {
                book.insert(quote.symbol.clone(), Arc::clone(quote));
            }
        }

        self.updates.fetch_add(quotes.len() as u64, Ordering::Relaxed);
        *self.last_updated.write() = Some(Utc::now());
    }

    /// Latest quote for a symbol.
    #[must_use]
    pub fn get(&self, symbol: &str) -> Option<Arc<Quote>> {
        self.quotes.read().get(symbol).cloned()
    }

    /// Copy of the current state.
    #[must_use]
    pub fn snapshot(&self) -> HashMap<Symbol, Arc<Quote>> {
        self.quotes.read().clone()
    }

    /// Number of symbols with a quote.
    #[must_use]
    pub fn len(&self) -> usize {
        self.quotes.read().len()
    }

    /// Whether no quote has been recorded yet.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.quotes.read().is_empty()
    }

    /// Total quotes written since creation.
    #[must_use]
    pub fn update_count(&self) -> u64 {
        self.updates.load(Ordering::Relaxed)
    }

    /// Wall-clock time of the most recent write.
    #[must_use]
    pub fn last_updated(&self) -> Option<DateTime<Utc>> {
        *self.last_updated.read()
    }
}
