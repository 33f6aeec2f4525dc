// =============================================================================
// Strategy execution — route, build, execute, decide
// =============================================================================

pub mod executors;
pub mod risk;
pub mod router;

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::market_data::{CandleBuffer, DepthBook, PriceCache, SeriesKey};
use crate::types::MarketKind;

/// What an executor decides to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Action {
    Buy,
    Sell,
    NoOp,
    Skip,
}

/// The outcome of one strategy evaluation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Decision {
    pub action: Action,
    pub reason: String,
    /// Position-size multiplier; the risk layer bounds it to
    /// [0, position_ceiling] before sizing.
    pub multiplier: f64,
}

impl Decision {
    pub fn no_op(reason: impl Into<String>) -> Self {
        Self {
            action: Action::NoOp,
            reason: reason.into(),
            multiplier: 0.0,
        }
    }

    pub fn skip(reason: impl Into<String>) -> Self {
        Self {
            action: Action::Skip,
            reason: reason.into(),
            multiplier: 0.0,
        }
    }
}

/// Which concrete executor a route resolves to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StrategyType {
    MomentumBreakout,
    MeanReversion,
    VolumeSurge,
}

impl StrategyType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::MomentumBreakout => "momentum_breakout",
            Self::MeanReversion => "mean_reversion",
            Self::VolumeSurge => "volume_surge",
        }
    }
}

/// Trigger conditions of one user strategy. Any subset may be enabled; the
/// router picks the first matching route.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StrategyConditions {
    #[serde(default)]
    pub momentum_enabled: bool,
    /// 24h change percent that arms the momentum route.
    #[serde(default)]
    pub min_change_percent: f64,

    #[serde(default)]
    pub mean_reversion_enabled: bool,
    #[serde(default)]
    pub rsi_oversold: f64,
    #[serde(default)]
    pub rsi_overbought: f64,

    #[serde(default)]
    pub volume_surge_enabled: bool,
    /// Volume z-score that arms the surge route.
    #[serde(default)]
    pub volume_zscore_threshold: f64,
}

/// Risk parameters of one user strategy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskParams {
    /// Base order quantity before the multiplier.
    pub base_quantity: f64,
    /// Stop-loss / take-profit distance, percent of entry.
    pub risk_percent: f64,
    /// Leverage for margin-based stop/target variants (0 = spot-style).
    #[serde(default)]
    pub leverage: f64,
}

/// One user's strategy definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StrategyConfig {
    pub id: String,
    pub user_id: String,
    pub symbol: String,
    pub conditions: StrategyConditions,
    pub risk: RiskParams,
}

/// The market state an executor sees. Built by the route's market-data
/// builder from the shared caches; `None` fields mean the underlying feed
/// has not produced data yet.
#[derive(Debug, Clone, Serialize)]
pub struct StrategyMarketData {
    pub symbol: String,
    pub last_price: f64,
    pub change_percent_24h: Option<f64>,
    pub rsi_14: Option<f64>,
    pub ema_fast: Option<f64>,
    pub ema_slow: Option<f64>,
    pub volume_zscore: Option<f64>,
    pub spread_bps: Option<f64>,
    pub book_imbalance: Option<f64>,
    pub closed_bars: usize,
}

/// Per-evaluation execution context.
#[derive(Debug, Clone, Serialize)]
pub struct ExecContext {
    pub user_id: String,
    pub symbol: String,
    pub now_ms: i64,
    /// Net open quantity the user already holds in this symbol.
    pub open_position_qty: f64,
}

/// Read-only view over the market caches; the factory injects this once at
/// construction.
pub struct MarketView {
    pub prices: Arc<PriceCache>,
    pub candles: Arc<CandleBuffer>,
    pub depth: Arc<DepthBook>,
    pub kind: MarketKind,
}

impl MarketView {
    /// Assemble the market state for one symbol; `None` when no price has
    /// been observed at all.
    pub fn build(&self, symbol: &str) -> Option<StrategyMarketData> {
        let price_entry = self.prices.get(symbol, self.kind)?;

        let key = SeriesKey::new(symbol, self.kind, "1h");
        let bars = self.candles.closed_bars(&key, 120);
        let closes: Vec<f64> = bars.iter().map(|b| b.close).collect();

        let rsi_14 = crate::indicators::oscillators::rsi(&closes, 14);
        let ema_fast = crate::indicators::trend::ema(&closes, 9);
        let ema_slow = crate::indicators::trend::ema(&closes, 21);
        let volume_zscore = crate::indicators::volume::volume_zscore(&bars, 20);

        Some(StrategyMarketData {
            symbol: symbol.to_string(),
            last_price: price_entry.price,
            change_percent_24h: price_entry.price_change_24h,
            rsi_14,
            ema_fast,
            ema_slow,
            volume_zscore,
            spread_bps: self.depth.spread_bps(symbol, self.kind),
            book_imbalance: self.depth.imbalance(symbol, self.kind),
            closed_bars: bars.len(),
        })
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decision_helpers() {
        let d = Decision::no_op("no route");
        assert_eq!(d.action, Action::NoOp);
        assert_eq!(d.multiplier, 0.0);

        let d = Decision::skip("no data");
        assert_eq!(d.action, Action::Skip);
    }

    #[test]
    fn market_view_requires_a_price() {
        let view = MarketView {
            prices: Arc::new(PriceCache::new()),
            candles: Arc::new(CandleBuffer::new(100)),
            depth: Arc::new(DepthBook::new()),
            kind: MarketKind::Futures,
        };
        assert!(view.build("BTCUSDT").is_none());

        view.prices.update("BTCUSDT", MarketKind::Futures, 40_000.0, Some(3.0));
        let md = view.build("BTCUSDT").unwrap();
        assert_eq!(md.last_price, 40_000.0);
        assert_eq!(md.change_percent_24h, Some(3.0));
        // No bars yet: indicator fields are simply absent.
        assert!(md.rsi_14.is_none());
        assert_eq!(md.closed_bars, 0);
    }
}
