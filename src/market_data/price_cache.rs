// =============================================================================
// Price Cache — last known price per (symbol, market kind)
// =============================================================================
//
// Mutated only by the exchange adapter and the sync workers; every other
// component reads. The owning lock never crosses a component boundary.
// =============================================================================

use std::collections::HashMap;

use chrono::Utc;
use parking_lot::RwLock;
use serde::Serialize;

use crate::types::MarketKind;

/// One cached price observation.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PriceEntry {
    pub symbol: String,
    pub kind: MarketKind,
    pub price: f64,
    pub price_change_24h: Option<f64>,
    /// Milliseconds since the UNIX epoch.
    pub last_updated: i64,
}

/// Thread-safe map of latest prices.
pub struct PriceCache {
    entries: RwLock<HashMap<(String, MarketKind), PriceEntry>>,
}

impl PriceCache {
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
        }
    }

    /// Insert or replace the entry for (symbol, kind).
    pub fn update(
        &self,
        symbol: &str,
        kind: MarketKind,
        price: f64,
        price_change_24h: Option<f64>,
    ) {
        let entry = PriceEntry {
            symbol: symbol.to_string(),
            kind,
            price,
            price_change_24h,
            last_updated: Utc::now().timestamp_millis(),
        };
        self.entries
            .write()
            .insert((symbol.to_string(), kind), entry);
    }

    pub fn get(&self, symbol: &str, kind: MarketKind) -> Option<PriceEntry> {
        self.entries
            .read()
            .get(&(symbol.to_string(), kind))
            .cloned()
    }

    /// Latest price only, if present.
    pub fn price(&self, symbol: &str, kind: MarketKind) -> Option<f64> {
        self.get(symbol, kind).map(|e| e.price)
    }

    /// All entries for one market kind.
    pub fn all_for_kind(&self, kind: MarketKind) -> Vec<PriceEntry> {
        self.entries
            .read()
            .values()
            .filter(|e| e.kind == kind)
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

impl Default for PriceCache {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn update_then_get() {
        let cache = PriceCache::new();
        cache.update("BTCUSDT", MarketKind::Spot, 40_000.0, Some(2.5));

        let entry = cache.get("BTCUSDT", MarketKind::Spot).unwrap();
        assert_eq!(entry.price, 40_000.0);
        assert_eq!(entry.price_change_24h, Some(2.5));
        assert!(entry.last_updated > 0);
    }

    #[test]
    fn kinds_do_not_collide() {
        let cache = PriceCache::new();
        cache.update("BTCUSDT", MarketKind::Spot, 40_000.0, None);
        cache.update("BTCUSDT", MarketKind::Futures, 40_050.0, None);

        assert_eq!(cache.price("BTCUSDT", MarketKind::Spot), Some(40_000.0));
        assert_eq!(cache.price("BTCUSDT", MarketKind::Futures), Some(40_050.0));
        assert_eq!(cache.len(), 2);
        assert_eq!(cache.all_for_kind(MarketKind::Spot).len(), 1);
    }

    #[test]
    fn missing_symbol_is_none() {
        let cache = PriceCache::new();
        assert!(cache.get("NOPE", MarketKind::Spot).is_none());
        assert!(cache.is_empty());
    }
}
