// =============================================================================
// Depth Book — top-of-book aggregation per (symbol, market kind)
// =============================================================================

use std::collections::HashMap;

use parking_lot::RwLock;
use serde::Serialize;

use crate::types::MarketKind;

/// Aggregated view of one symbol's order book.
#[derive(Debug, Clone, Serialize)]
pub struct DepthState {
    pub symbol: String,
    pub kind: MarketKind,
    pub best_bid: f64,
    pub best_ask: f64,
    /// Sum of bid quantities across the received levels.
    pub bid_depth: f64,
    /// Sum of ask quantities across the received levels.
    pub ask_depth: f64,
    pub spread_bps: f64,
    /// (bid_depth - ask_depth) / total, in [-1, 1].
    pub imbalance: f64,
    pub last_update_id: u64,
}

/// Thread-safe store of the latest depth state per series.
pub struct DepthBook {
    books: RwLock<HashMap<(String, MarketKind), DepthState>>,
}

impl DepthBook {
    pub fn new() -> Self {
        Self {
            books: RwLock::new(HashMap::new()),
        }
    }

    /// Replace the book for (symbol, kind) from raw level arrays
    /// (price, quantity), bids descending and asks ascending.
    pub fn update(
        &self,
        symbol: &str,
        kind: MarketKind,
        bids: &[(f64, f64)],
        asks: &[(f64, f64)],
        update_id: u64,
    ) {
        let best_bid = bids.first().map(|l| l.0).unwrap_or(0.0);
        let best_ask = asks.first().map(|l| l.0).unwrap_or(0.0);
        let bid_depth: f64 = bids.iter().map(|l| l.1).sum();
        let ask_depth: f64 = asks.iter().map(|l| l.1).sum();

        let mid = (best_bid + best_ask) / 2.0;
        let spread_bps = if mid > 0.0 {
            ((best_ask - best_bid) / mid) * 10_000.0
        } else {
            0.0
        };

        let total = bid_depth + ask_depth;
        let imbalance = if total > 0.0 {
            (bid_depth - ask_depth) / total
        } else {
            0.0
        };

        let state = DepthState {
            symbol: symbol.to_string(),
            kind,
            best_bid,
            best_ask,
            bid_depth,
            ask_depth,
            spread_bps,
            imbalance,
            last_update_id: update_id,
        };

        self.books.write().insert((symbol.to_string(), kind), state);
    }

    pub fn get(&self, symbol: &str, kind: MarketKind) -> Option<DepthState> {
        self.books.read().get(&(symbol.to_string(), kind)).cloned()
    }

    pub fn spread_bps(&self, symbol: &str, kind: MarketKind) -> Option<f64> {
        self.get(symbol, kind).map(|s| s.spread_bps)
    }

    pub fn imbalance(&self, symbol: &str, kind: MarketKind) -> Option<f64> {
        self.get(symbol, kind).map(|s| s.imbalance)
    }

    pub fn tracked_count(&self) -> usize {
        self.books.read().len()
    }
}

impl Default for DepthBook {
    fn default() -> Self {
        Self::new()
    }
}
