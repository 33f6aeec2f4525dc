// =============================================================================
// Realtime gainers — rank the top movers from 24h tickers
// =============================================================================

use std::collections::HashMap;

use parking_lot::RwLock;

use crate::types::{GainerItem, MarketKind, Ticker};

/// Latest 24h ticker per symbol for one market kind. The WebSocket callback
/// upserts here and wakes the snapshot pipeline; it performs no I/O itself.
pub struct TickerBoard {
    kind: MarketKind,
    tickers: RwLock<HashMap<String, Ticker>>,
}

impl TickerBoard {
    pub fn new(kind: MarketKind) -> Self {
        Self {
            kind,
            tickers: RwLock::new(HashMap::new()),
        }
    }

    pub fn kind(&self) -> MarketKind {
        self.kind
    }

    /// Insert or replace the entry for the ticker's symbol.
    pub fn upsert(&self, ticker: Ticker) {
        self.tickers.write().insert(ticker.symbol.clone(), ticker);
    }

    /// Replace the whole board (REST refresh path).
    pub fn replace_all(&self, tickers: Vec<Ticker>) {
        let mut map = self.tickers.write();
        map.clear();
        for t in tickers {
            map.insert(t.symbol.clone(), t);
        }
    }

    /// Current tickers in unspecified order.
    pub fn snapshot(&self) -> Vec<Ticker> {
        self.tickers.read().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.tickers.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.tickers.read().is_empty()
    }
}

/// Build a top-N gainers ranking from raw 24h tickers.
///
/// Tickers with non-finite or non-positive prices are discarded.  The
/// survivors are sorted by 24h change percent descending (ties broken by
/// quote volume, then symbol for determinism) and assigned 1-based ranks.
pub fn build_gainers(
    tickers: &[Ticker],
    kind: MarketKind,
    top_n: usize,
    data_source: &str,
) -> Vec<GainerItem> {
    let mut candidates: Vec<&Ticker> = tickers
        .iter()
        .filter(|t| t.kind == kind)
        .filter(|t| t.last_price.is_finite() && t.last_price > 0.0)
        .filter(|t| t.price_change_percent.is_finite())
        .collect();

    candidates.sort_by(|a, b| {
        b.price_change_percent
            .partial_cmp(&a.price_change_percent)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| {
                b.quote_volume_24h
                    .partial_cmp(&a.quote_volume_24h)
                    .unwrap_or(std::cmp::Ordering::Equal)
            })
            .then_with(|| a.symbol.cmp(&b.symbol))
    });

    candidates
        .into_iter()
        .take(top_n)
        .enumerate()
        .map(|(i, t)| GainerItem {
            symbol: t.symbol.clone(),
            rank: (i + 1) as u32,
            current_price: t.last_price,
            change_percent: t.price_change_percent,
            volume_24h: t.volume_24h,
            data_source: data_source.to_string(),
        })
        .collect()
}
