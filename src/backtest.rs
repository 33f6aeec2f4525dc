// =============================================================================
// Backtest Engine — replay klines through a strategy with realistic friction
// =============================================================================
//
// The external contract: given a strategy config, a bar history, and a
// friction model, replay the bars and produce a report.  Fills pay taker
// fees and slippage, and a fill can never absorb more than a fraction of a
// bar's traded volume.  Protective exits are evaluated against each bar's
// full range before new entries are considered.
// =============================================================================

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::indicators::{oscillators, trend, volume};
use crate::strategy::executors::{
    MeanReversionExecutor, MomentumBreakoutExecutor, StrategyExecutor, VolumeSurgeExecutor,
};
use crate::strategy::risk::RiskManager;
use crate::strategy::router::select_route;
use crate::strategy::{Action, ExecContext, StrategyConfig, StrategyMarketData, StrategyType};
use crate::types::{Kline, OrderSide};

/// Bars consumed before the first evaluation.
const WARMUP_BARS: usize = 60;

/// Trading friction applied to every simulated fill.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FrictionModel {
    /// Taker fee as a fraction of notional (0.0004 = 4 bps).
    pub taker_fee_rate: f64,
    /// Slippage applied against the trade direction, basis points.
    pub slippage_bps: f64,
    /// Largest share of one bar's volume a single fill may take.
    pub max_volume_fraction: f64,
}

impl Default for FrictionModel {
    fn default() -> Self {
        Self {
            taker_fee_rate: 0.0004,
            slippage_bps: 2.0,
            max_volume_fraction: 0.05,
        }
    }
}

impl FrictionModel {
    /// Reference price adjusted against the taker.
    pub fn fill_price(&self, side: OrderSide, reference: f64) -> f64 {
        let slip = self.slippage_bps / 10_000.0;
        match side {
            OrderSide::Buy => reference * (1.0 + slip),
            OrderSide::Sell => reference * (1.0 - slip),
        }
    }

    /// Bound a desired quantity by the bar's available volume.
    pub fn cap_quantity(&self, desired: f64, bar_volume: f64) -> f64 {
        desired.min(bar_volume * self.max_volume_fraction)
    }
}

/// Aggregate result of one replay.
#[derive(Debug, Clone, Serialize)]
pub struct BacktestReport {
    pub bars_replayed: usize,
    pub trades: usize,
    pub wins: usize,
    pub losses: usize,
    pub total_fees: f64,
    pub final_equity: f64,
    pub return_pct: f64,
    pub max_drawdown_pct: f64,
}

#[derive(Debug, Clone)]
struct OpenTrade {
    quantity: f64,
    entry_price: f64,
    stop_loss: f64,
    take_profit: f64,
}

/// Replay `bars` through the strategy and return the report.
pub fn run_backtest(
    config: &StrategyConfig,
    bars: &[Kline],
    friction: &FrictionModel,
    initial_equity: f64,
) -> BacktestReport {
    let mut report = BacktestReport {
        bars_replayed: 0,
        trades: 0,
        wins: 0,
        losses: 0,
        total_fees: 0.0,
        final_equity: initial_equity,
        return_pct: 0.0,
        max_drawdown_pct: 0.0,
    };

    let Some(route) = select_route(&config.conditions) else {
        return report;
    };
    let executor: Box<dyn StrategyExecutor> = match route.strategy_type {
        StrategyType::MomentumBreakout => Box::new(MomentumBreakoutExecutor),
        StrategyType::MeanReversion => Box::new(MeanReversionExecutor),
        StrategyType::VolumeSurge => Box::new(VolumeSurgeExecutor),
    };
    let risk = RiskManager::new(3.0);

    let mut cash = initial_equity;
    let mut open: Option<OpenTrade> = None;
    let mut peak_equity = initial_equity;

    for t in WARMUP_BARS..bars.len() {
        report.bars_replayed += 1;
        let bar = &bars[t];

        // Protective exits first, against the bar's full range.
        if let Some(trade) = &open {
            let stop_hit = bar.low <= trade.stop_loss;
            let target_hit = bar.high >= trade.take_profit;
            // A bar that spans both resolves pessimistically at the stop.
            let exit_ref = if stop_hit {
                Some(trade.stop_loss)
            } else if target_hit {
                Some(trade.take_profit)
            } else {
                None
            };

            if let Some(reference) = exit_ref {
                let price = friction.fill_price(OrderSide::Sell, reference);
                let notional = price * trade.quantity;
                let fee = notional * friction.taker_fee_rate;
                cash += notional - fee;
                report.total_fees += fee;
                report.trades += 1;
                if price > trade.entry_price {
                    report.wins += 1;
                } else {
                    report.losses += 1;
                }
                debug!(
                    bar = t,
                    exit = price,
                    entry = trade.entry_price,
                    "backtest exit"
                );
                open = None;
            }
        }

        // New entries only while flat.
        if open.is_none() {
            let window = &bars[..=t];
            let market = market_state(config, window);
            let context = ExecContext {
                user_id: config.user_id.clone(),
                symbol: config.symbol.clone(),
                now_ms: bar.open_time,
                open_position_qty: 0.0,
            };
            let mut decision = executor.execute(&market, &context, &config.conditions);
            decision.multiplier = risk.clamp_multiplier(decision.multiplier);

            if decision.action == Action::Buy {
                let desired = config.risk.base_quantity * decision.multiplier.max(1.0);
                let quantity = friction.cap_quantity(desired, bar.volume);
                let price = friction.fill_price(OrderSide::Buy, bar.close);
                let notional = price * quantity;
                let fee = notional * friction.taker_fee_rate;

                if quantity > 0.0 && notional + fee <= cash {
                    cash -= notional + fee;
                    report.total_fees += fee;
                    let protective =
                        risk.protective_prices(price, config.risk.risk_percent, true);
                    open = Some(OpenTrade {
                        quantity,
                        entry_price: price,
                        stop_loss: protective.stop_loss,
                        take_profit: protective.take_profit,
                    });
                }
            }
        }

        // Mark equity and drawdown at the close.
        let equity = cash
            + open
                .as_ref()
                .map(|tr| tr.quantity * bar.close)
                .unwrap_or(0.0);
        if equity > peak_equity {
            peak_equity = equity;
        }
        let drawdown = if peak_equity > 0.0 {
            (peak_equity - equity) / peak_equity * 100.0
        } else {
            0.0
        };
        if drawdown > report.max_drawdown_pct {
            report.max_drawdown_pct = drawdown;
        }
        report.final_equity = equity;
    }

    report.return_pct = if initial_equity > 0.0 {
        (report.final_equity / initial_equity - 1.0) * 100.0
    } else {
        0.0
    };
    report
}

/// Build the market state an executor sees at the end of `window`.
fn market_state(config: &StrategyConfig, window: &[Kline]) -> StrategyMarketData {
    let closes: Vec<f64> = window.iter().map(|b| b.close).collect();
    let last = *closes.last().unwrap_or(&0.0);

    // 24h change proxy: percent move over the last 24 bars.
    let change_percent_24h = trend::roc(&closes, 24);

    StrategyMarketData {
        symbol: config.symbol.clone(),
        last_price: last,
        change_percent_24h,
        rsi_14: oscillators::rsi(&closes, 14),
        ema_fast: trend::ema(&closes, 9),
        ema_slow: trend::ema(&closes, 21),
        volume_zscore: volume::volume_zscore(window, 20),
        spread_bps: None,
        book_imbalance: None,
        closed_bars: window.len(),
    }
}
