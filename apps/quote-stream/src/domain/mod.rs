//! Domain Layer - Core quote types and state.
//!
//! This layer contains the quote types, the subscription set and the price
//! book, with no I/O. Types here carry serde support for the wire format.

/// Quote types and batches.
pub mod streaming;

/// Cumulative subscription set.
pub mod subscription;

/// Latest-quote-per-symbol cache.
pub mod price_book;
