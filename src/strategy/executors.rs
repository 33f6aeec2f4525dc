// =============================================================================
// Strategy executors — the closed set of concrete strategies
// =============================================================================
//
// An executor receives the built market state and execution context and
// returns a Decision.  Missing market data yields `skip`, an unarmed
// condition yields `no_op`; only `buy`/`sell` reach the wire.
// =============================================================================

use crate::strategy::{
    Action, Decision, ExecContext, StrategyConditions, StrategyMarketData, StrategyType,
};

/// The executor capability. Implementations are pure: same inputs, same
/// decision.
pub trait StrategyExecutor: Send + Sync {
    fn name(&self) -> &'static str;
    fn strategy_type(&self) -> StrategyType;
    fn execute(
        &self,
        market: &StrategyMarketData,
        context: &ExecContext,
        conditions: &StrategyConditions,
    ) -> Decision;
}

// ---------------------------------------------------------------------------
// Momentum breakout
// ---------------------------------------------------------------------------

/// Buys strength: a large 24h move with the fast EMA above the slow one.
pub struct MomentumBreakoutExecutor;

impl StrategyExecutor for MomentumBreakoutExecutor {
    fn name(&self) -> &'static str {
        "momentum_breakout"
    }

    fn strategy_type(&self) -> StrategyType {
        StrategyType::MomentumBreakout
    }

    fn execute(
        &self,
        market: &StrategyMarketData,
        context: &ExecContext,
        conditions: &StrategyConditions,
    ) -> Decision {
        let Some(change) = market.change_percent_24h else {
            return Decision::skip("no 24h change data");
        };
        let (Some(ema_fast), Some(ema_slow)) = (market.ema_fast, market.ema_slow) else {
            return Decision::skip("EMA stack not ready");
        };

        if context.open_position_qty > 0.0 {
            return Decision::no_op("position already open");
        }
        if change < conditions.min_change_percent {
            return Decision::no_op(format!(
                "24h change {change:.2}% below arm threshold {:.2}%",
                conditions.min_change_percent
            ));
        }
        if ema_fast <= ema_slow {
            return Decision::no_op("trend not aligned: fast EMA under slow");
        }

        // Scale conviction with how far past the arm threshold the move is.
        let excess = (change / conditions.min_change_percent.max(0.1)).min(3.0);
        Decision {
            action: Action::Buy,
            reason: format!("24h change {change:.2}% with aligned trend"),
            multiplier: excess,
        }
    }
}

// ---------------------------------------------------------------------------
// Mean reversion
// ---------------------------------------------------------------------------

/// Fades extremes: buys oversold RSI, sells overbought RSI.
pub struct MeanReversionExecutor;

impl StrategyExecutor for MeanReversionExecutor {
    fn name(&self) -> &'static str {
        "mean_reversion"
    }

    fn strategy_type(&self) -> StrategyType {
        StrategyType::MeanReversion
    }

    fn execute(
        &self,
        market: &StrategyMarketData,
        context: &ExecContext,
        conditions: &StrategyConditions,
    ) -> Decision {
        let Some(rsi) = market.rsi_14 else {
            return Decision::skip("RSI not ready");
        };

        if rsi <= conditions.rsi_oversold {
            if context.open_position_qty > 0.0 {
                return Decision::no_op("oversold but position already open");
            }
            let depth = ((conditions.rsi_oversold - rsi) / 10.0).min(1.0);
            return Decision {
                action: Action::Buy,
                reason: format!("RSI {rsi:.1} under oversold bound {:.1}", conditions.rsi_oversold),
                multiplier: 1.0 + depth,
            };
        }
        if rsi >= conditions.rsi_overbought {
            if context.open_position_qty <= 0.0 {
                return Decision::no_op("overbought but nothing to reduce");
            }
            return Decision {
                action: Action::Sell,
                reason: format!(
                    "RSI {rsi:.1} over overbought bound {:.1}",
                    conditions.rsi_overbought
                ),
                multiplier: 1.0,
            };
        }

        Decision::no_op(format!("RSI {rsi:.1} inside neutral band"))
    }
}

// ---------------------------------------------------------------------------
// Volume surge
// ---------------------------------------------------------------------------

/// Enters on abnormal volume confirmed by positive book pressure.
pub struct VolumeSurgeExecutor;

impl StrategyExecutor for VolumeSurgeExecutor {
    fn name(&self) -> &'static str {
        "volume_surge"
    }

    fn strategy_type(&self) -> StrategyType {
        StrategyType::VolumeSurge
    }

    fn execute(
        &self,
        market: &StrategyMarketData,
        context: &ExecContext,
        conditions: &StrategyConditions,
    ) -> Decision {
        let Some(zscore) = market.volume_zscore else {
            return Decision::skip("volume history not ready");
        };

        if context.open_position_qty > 0.0 {
            return Decision::no_op("position already open");
        }
        if zscore < conditions.volume_zscore_threshold {
            return Decision::no_op(format!(
                "volume z-score {zscore:.2} below threshold {:.2}",
                conditions.volume_zscore_threshold
            ));
        }
        // Require the book to lean the same way before committing.
        let imbalance = market.book_imbalance.unwrap_or(0.0);
        if imbalance < 0.0 {
            return Decision::no_op("surge without bid-side support");
        }

        Decision {
            action: Action::Buy,
            reason: format!("volume z-score {zscore:.2} with bid support {imbalance:.2}"),
            multiplier: 1.0 + imbalance,
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    fn market() -> StrategyMarketData {
        StrategyMarketData {
            symbol: "BTCUSDT".to_string(),
            last_price: 40_000.0,
            change_percent_24h: Some(6.0),
            rsi_14: Some(55.0),
            ema_fast: Some(40_100.0),
            ema_slow: Some(39_900.0),
            volume_zscore: Some(1.0),
            spread_bps: Some(1.0),
            book_imbalance: Some(0.2),
            closed_bars: 120,
        }
    }

    fn context(open_qty: f64) -> ExecContext {
        ExecContext {
            user_id: "u1".to_string(),
            symbol: "BTCUSDT".to_string(),
            now_ms: 0,
            open_position_qty: open_qty,
        }
    }

    fn conditions() -> StrategyConditions {
        StrategyConditions {
            momentum_enabled: true,
            min_change_percent: 5.0,
            mean_reversion_enabled: true,
            rsi_oversold: 30.0,
            rsi_overbought: 70.0,
            volume_surge_enabled: true,
            volume_zscore_threshold: 2.5,
        }
    }

    #[test]
    fn momentum_buys_armed_breakout() {
        let d = MomentumBreakoutExecutor.execute(&market(), &context(0.0), &conditions());
        assert_eq!(d.action, Action::Buy);
        assert!(d.multiplier > 1.0);
    }

    #[test]
    fn momentum_noops_below_threshold_and_with_open_position() {
        let mut md = market();
        md.change_percent_24h = Some(2.0);
        let d = MomentumBreakoutExecutor.execute(&md, &context(0.0), &conditions());
        assert_eq!(d.action, Action::NoOp);

        let d = MomentumBreakoutExecutor.execute(&market(), &context(1.0), &conditions());
        assert_eq!(d.action, Action::NoOp);
    }

    #[test]
    fn momentum_requires_aligned_trend() {
        let mut md = market();
        md.ema_fast = Some(39_000.0);
        let d = MomentumBreakoutExecutor.execute(&md, &context(0.0), &conditions());
        assert_eq!(d.action, Action::NoOp);
    }

    #[test]
    fn momentum_skips_without_data() {
        let mut md = market();
        md.change_percent_24h = None;
        let d = MomentumBreakoutExecutor.execute(&md, &context(0.0), &conditions());
        assert_eq!(d.action, Action::Skip);
    }

    #[test]
    fn mean_reversion_buys_oversold_sells_overbought() {
        let mut md = market();
        md.rsi_14 = Some(25.0);
        let d = MeanReversionExecutor.execute(&md, &context(0.0), &conditions());
        assert_eq!(d.action, Action::Buy);
        assert!(d.multiplier > 1.0);

        md.rsi_14 = Some(80.0);
        let d = MeanReversionExecutor.execute(&md, &context(1.0), &conditions());
        assert_eq!(d.action, Action::Sell);

        // Overbought with nothing held: nothing to reduce.
        let d = MeanReversionExecutor.execute(&md, &context(0.0), &conditions());
        assert_eq!(d.action, Action::NoOp);
    }

    #[test]
    fn volume_surge_needs_zscore_and_bid_support() {
        let mut md = market();
        md.volume_zscore = Some(3.0);
        let d = VolumeSurgeExecutor.execute(&md, &context(0.0), &conditions());
        assert_eq!(d.action, Action::Buy);

        md.book_imbalance = Some(-0.3);
        let d = VolumeSurgeExecutor.execute(&md, &context(0.0), &conditions());
        assert_eq!(d.action, Action::NoOp);

        md.book_imbalance = Some(0.3);
        md.volume_zscore = Some(1.0);
        let d = VolumeSurgeExecutor.execute(&md, &context(0.0), &conditions());
        assert_eq!(d.action, Action::NoOp);
    }

    #[test]
    fn executors_are_pure() {
        let md = market();
        let cx = context(0.0);
        let cfg = conditions();
        let a = MomentumBreakoutExecutor.execute(&md, &cx, &cfg);
        let b = MomentumBreakoutExecutor.execute(&md, &cx, &cfg);
        assert_eq!(a.action, b.action);
        assert_eq!(a.multiplier, b.multiplier);
        assert_eq!(a.reason, b.reason);
    }
}
