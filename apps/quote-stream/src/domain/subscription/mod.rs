//! Subscription Tracking
//!
//! The cumulative set of symbols a session has been asked to stream.
//!
//! # Design
//!
//! The set only grows: symbols are added by explicit subscribe calls and
//! are never diffed away. Each announcement to the feed carries the whole
//! set, so the set keeps first-insertion order to make repeated
//! announcements identical for the same contents.

use std::collections::HashSet;

// =============================================================================
// Types
// =============================================================================

/// A ticker symbol. Case-sensitive and opaque.
pub type Symbol = String;

/// Unique, insertion-ordered set of subscribed symbols.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SubscriptionSet {
    ordered: Vec<Symbol>,
    members: HashSet<Symbol>,
}

impl SubscriptionSet {
    /// Create an empty set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a single symbol.
    ///
    /// Returns `true` if the symbol was not already tracked.
    pub fn insert(&mut self, symbol: impl Into<Symbol>) -> bool {
        let symbol = symbol.into();
        if self.members.contains(&symbol) {
            return false;
        }
        self.members.insert(symbol.clone());
        self.ordered.push(symbol);
        true
    }

    /// Add many symbols, ignoring duplicates.
    ///
    /// Returns the symbols that were newly added, in input order.
    pub fn extend<I, S>(&mut self, symbols: I) -> Vec<Symbol>
    where
        I: IntoIterator<Item = S>,
        S: Into<Symbol>,
    {
        let mut added = Vec::new();
        for symbol in symbols {
            let symbol = symbol.into();
            if self.insert(symbol.clone()) {
                added.push(symbol);
            }
        }
        added
    }

    /// Check whether a symbol is tracked.
    #[must_use]
    pub fn contains(&self, symbol: &str) -> bool {
        self.members.contains(symbol)
    }

    /// All tracked symbols in first-insertion order.
    #[must_use]
    pub fn symbols(&self) -> &[Symbol] {
        &self.ordered
    }

    /// Owned copy of the tracked symbols.
    #[must_use]
    pub fn to_vec(&self) -> Vec<Symbol> {
        self.ordered.clone()
    }

    /// Number of tracked symbols.
    #[must_use]
    pub fn len(&self) -> usize {
        self.ordered.len()
    }

    /// Whether nothing is tracked.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.ordered.is_empty()
    }
}

impl<S: Into<Symbol>> FromIterator<S> for SubscriptionSet {
    fn from_iter<I: IntoIterator<Item = S>>(iter: I) -> Self {
        let mut set = Self::new();
        set.extend(iter);
        set
    }
}

// =============================================================================
// Tests
// =============================================================================
