// =============================================================================
// Candle Buffer — in-memory ring of recent bars per (symbol, kind, interval)
// =============================================================================
//
// The live (unclosed) bar is replaced in-place on every stream update; once a
// bar closes it becomes permanent and the ring is trimmed to `max_bars`.
// Readers only ever see closed bars unless they ask for the live one.
// =============================================================================

use std::collections::{HashMap, VecDeque};

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::types::{Kline, MarketKind};

/// Composite key identifying one bar series.
#[derive(Debug, Clone, Hash, Eq, PartialEq, Serialize, Deserialize)]
pub struct SeriesKey {
    pub symbol: String,
    pub kind: MarketKind,
    pub interval: String,
}

impl SeriesKey {
    pub fn new(symbol: &str, kind: MarketKind, interval: &str) -> Self {
        Self {
            symbol: symbol.to_string(),
            kind,
            interval: interval.to_string(),
        }
    }
}

impl std::fmt::Display for SeriesKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}@{}", self.symbol, self.kind, self.interval)
    }
}

#[derive(Debug, Clone)]
struct LiveBar {
    kline: Kline,
    is_closed: bool,
}

/// Thread-safe ring buffer of recent bars.
pub struct CandleBuffer {
    series: RwLock<HashMap<SeriesKey, VecDeque<LiveBar>>>,
    max_bars: usize,
}

impl CandleBuffer {
    /// Retain at most `max_bars` closed bars per series, plus one live bar.
    pub fn new(max_bars: usize) -> Self {
        Self {
            series: RwLock::new(HashMap::new()),
            max_bars,
        }
    }

    /// Insert or replace the latest bar for `key`.
    ///
    /// An incoming bar with the same `open_time` as the current live bar
    /// replaces it; a closed bar finalises it and trims the ring.
    pub fn update(&self, key: SeriesKey, kline: Kline, is_closed: bool) {
        let mut map = self.series.write();
        let ring = map
            .entry(key)
            .or_insert_with(|| VecDeque::with_capacity(self.max_bars + 1));

        if let Some(last) = ring.back() {
            if !last.is_closed && last.kline.open_time == kline.open_time {
                ring.pop_back();
            }
        }
        ring.push_back(LiveBar { kline, is_closed });

        if is_closed {
            while ring.len() > self.max_bars {
                ring.pop_front();
            }
        }
    }

    /// The most recent `count` closed bars, oldest-first.
    pub fn closed_bars(&self, key: &SeriesKey, count: usize) -> Vec<Kline> {
        let map = self.series.read();
        match map.get(key) {
            Some(ring) => {
                let closed: Vec<&LiveBar> = ring.iter().filter(|b| b.is_closed).collect();
                let start = closed.len().saturating_sub(count);
                closed[start..].iter().map(|b| b.kline.clone()).collect()
            }
            None => Vec::new(),
        }
    }

    /// Close price of the most recent closed bar.
    pub fn last_close(&self, key: &SeriesKey) -> Option<f64> {
        let map = self.series.read();
        map.get(key).and_then(|ring| {
            ring.iter()
                .rev()
                .find(|b| b.is_closed)
                .map(|b| b.kline.close)
        })
    }

    /// Bars stored for a series, including any live bar.
    pub fn len(&self, key: &SeriesKey) -> usize {
        self.series.read().get(key).map_or(0, VecDeque::len)
    }

    pub fn is_empty(&self, key: &SeriesKey) -> bool {
        self.len(key) == 0
    }
}
