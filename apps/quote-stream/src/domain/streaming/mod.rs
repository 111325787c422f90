//! Market Data Streaming Types
//!
//! Core domain types for the quote feed. Field names follow the wire's
//! short keys through serde renames so the same type is used for decoding
//! feed frames, for the price book, and for the simulated peer.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Deserializer, Serialize};

/// Wire message type for a stock quote.
pub const QUOTE_MESSAGE_TYPE: &str = "q";

/// A bid/ask snapshot for one symbol at one point in time.
///
/// Immutable once received. Prices are floating point, sizes are integers
/// and the timestamp is kept exactly as the exchange sent it.
///
/// ```json
/// {
///   "T": "q",
///   "S": "AAPL",
///   "bx": "V",
///   "bp": 150.25,
///   "bs": 2,
///   "ax": "V",
///   "ap": 150.30,
///   "as": 3,
///   "c": ["R"],
///   "t": "2024-01-15T14:30:00.123456789Z",
///   "z": "C"
/// }
/// ```
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Quote {
    /// Message type (normally "q").
    #[serde(rename = "T", default)]
    pub msg_type: String,

    /// Ticker symbol.
    #[serde(rename = "S")]
    pub symbol: String,

    /// Bid exchange code.
    #[serde(rename = "bx", default)]
    pub bid_exchange: String,

    /// Bid price.
    #[serde(rename = "bp", default)]
    pub bid_price: f64,

    /// Bid size.
    #[serde(rename = "bs", default)]
    pub bid_size: i64,

    /// Ask exchange code.
    #[serde(rename = "ax", default)]
    pub ask_exchange: String,

    /// Ask price.
    #[serde(rename = "ap", default)]
    pub ask_price: f64,

    /// Ask size.
    #[serde(rename = "as", default)]
    pub ask_size: i64,

    /// Quote condition codes.
    #[serde(rename = "c", default, deserialize_with = "null_as_empty")]
    pub conditions: Vec<String>,

    /// Exchange-supplied timestamp, not parsed locally.
    #[serde(rename = "t", default)]
    pub timestamp: String,

    /// Tape identifier.
    #[serde(rename = "z", default)]
    pub tape: String,
}

impl Quote {
    /// Create a quote for `symbol` with the given bid and ask prices.
    #[must_use]
    pub fn new(symbol: impl Into<String>, bid_price: f64, ask_price: f64) -> Self {
        Self {
            msg_type: QUOTE_MESSAGE_TYPE.to_string(),
            symbol: symbol.into(),
            bid_price,
            ask_price,
            ..Self::default()
        }
    }

    /// Set bid and ask sizes.
    #[must_use]
    pub const fn with_sizes(mut self, bid_size: i64, ask_size: i64) -> Self {
        self.bid_size = bid_size;
        self.ask_size = ask_size;
        self
    }

    /// Set bid and ask exchange codes.
    #[must_use]
    pub fn with_exchanges(mut self, bid: impl Into<String>, ask: impl Into<String>) -> Self {
        self.bid_exchange = bid.into();
        self.ask_exchange = ask.into();
        self
    }

    /// Set the exchange timestamp.
    #[must_use]
    pub fn with_timestamp(mut self, timestamp: impl Into<String>) -> Self {
        self.timestamp = timestamp.into();
        self
    }

    /// Set condition codes.
    #[must_use]
    pub fn with_conditions(mut self, conditions: Vec<String>) -> Self {
        self.conditions = conditions;
        self
    }

    /// Set the tape.
    #[must_use]
    pub fn with_tape(mut self, tape: impl Into<String>) -> Self {
        self.tape = tape.into();
        self
    }

    /// Ask minus bid.
    #[must_use]
    pub fn spread(&self) -> f64 {
        self.ask_price - self.bid_price
    }

    /// Midpoint between bid and ask.
    #[must_use]
    pub fn mid(&self) -> f64 {
        (self.bid_price + self.ask_price) / 2.0
    }
}

impl fmt::Display for Quote {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {}x{} @ {}x{}",
            self.symbol, self.bid_price, self.bid_size, self.ask_price, self.ask_size
        )
    }
}

fn null_as_empty<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<Vec<String>>::deserialize(deserializer)?.unwrap_or_default())
}

/// Quotes delivered together from one wire frame.
///
/// Order within a batch carries no meaning beyond arrival order on the
/// connection identified by `connection_id`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QuoteBatch {
    /// Quotes in wire order.
    pub quotes: Vec<Arc<Quote>>,
    /// Physical connection the batch arrived on.
    pub connection_id: u64,
}

impl QuoteBatch {
    /// Create a batch from decoded quotes.
    #[must_use]
    pub fn new(connection_id: u64, quotes: Vec<Quote>) -> Self {
        Self {
            quotes: quotes.into_iter().map(Arc::new).collect(),
            connection_id,
        }
    }

    /// Number of quotes in the batch.
    #[must_use]
    pub fn len(&self) -> usize {
        self.quotes.len()
    }

    /// Whether the batch carries no quotes.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.quotes.is_empty()
    }

    /// Iterate over the quotes.
    pub fn iter(&self) -> impl Iterator<Item = &Quote> {
        self.quotes.iter().map(AsRef::as_ref)
    }
}
