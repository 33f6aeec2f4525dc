// =============================================================================
// Strategy Router + Factory — (symbol, market state, config) -> decision
// =============================================================================
//
// The router inspects a strategy's conditions and selects a route; the
// factory resolves the route to its executor with dependencies injected once
// at construction.  A buy/sell decision materialises a pending
// ScheduledOrder after risk validation; anything else never reaches the
// wire.
// =============================================================================

use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Utc;
use serde_json::json;
use tracing::{debug, info};

use crate::orders::ScheduledOrder;
use crate::store::audit::LogLevel;
use crate::store::Store;
use crate::strategy::executors::{
    MeanReversionExecutor, MomentumBreakoutExecutor, StrategyExecutor, VolumeSurgeExecutor,
};
use crate::strategy::risk::RiskManager;
use crate::strategy::{
    Action, Decision, ExecContext, MarketView, StrategyConfig, StrategyConditions, StrategyType,
};
use crate::types::{OrderSide, OrderStatus, OrderType};

/// A resolved route: which executor runs and how its inputs are built.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StrategyRoute {
    pub strategy_type: StrategyType,
}

/// Select a route from the strategy's conditions. Priority order is
/// momentum, then mean reversion, then volume surge; `None` means no route
/// matches and the evaluation is a no-op.
pub fn select_route(conditions: &StrategyConditions) -> Option<StrategyRoute> {
    if conditions.momentum_enabled {
        return Some(StrategyRoute {
            strategy_type: StrategyType::MomentumBreakout,
        });
    }
    if conditions.mean_reversion_enabled {
        return Some(StrategyRoute {
            strategy_type: StrategyType::MeanReversion,
        });
    }
    if conditions.volume_surge_enabled {
        return Some(StrategyRoute {
            strategy_type: StrategyType::VolumeSurge,
        });
    }
    None
}

/// Builds executors with their dependencies injected once.
pub struct StrategyFactory {
    market: Arc<MarketView>,
    risk: RiskManager,
    momentum: Arc<MomentumBreakoutExecutor>,
    mean_reversion: Arc<MeanReversionExecutor>,
    volume_surge: Arc<VolumeSurgeExecutor>,
}

impl StrategyFactory {
    pub fn new(market: Arc<MarketView>, risk: RiskManager) -> Self {
        Self {
            market,
            risk,
            momentum: Arc::new(MomentumBreakoutExecutor),
            mean_reversion: Arc::new(MeanReversionExecutor),
            volume_surge: Arc::new(VolumeSurgeExecutor),
        }
    }

    /// The registry: resolve a route to its executor instance.
    pub fn executor_for(&self, route: StrategyRoute) -> Arc<dyn StrategyExecutor> {
        match route.strategy_type {
            StrategyType::MomentumBreakout => self.momentum.clone(),
            StrategyType::MeanReversion => self.mean_reversion.clone(),
            StrategyType::VolumeSurge => self.volume_surge.clone(),
        }
    }
}

/// Routes strategy evaluations and materialises resulting orders.
pub struct StrategyRouter {
    factory: StrategyFactory,
    store: Arc<Store>,
}

impl StrategyRouter {
    pub fn new(factory: StrategyFactory, store: Arc<Store>) -> Self {
        Self { factory, store }
    }

    /// Evaluate one strategy. Returns the decision and, for buy/sell, the
    /// pending order that was created.
    pub fn evaluate(
        &self,
        config: &StrategyConfig,
        open_position_qty: f64,
    ) -> Result<(Decision, Option<ScheduledOrder>)> {
        let now_ms = Utc::now().timestamp_millis();

        let Some(route) = select_route(&config.conditions) else {
            let decision = Decision::no_op("no route matches strategy conditions");
            self.log_decision(config, &decision, None)?;
            return Ok((decision, None));
        };

        let Some(market) = self.factory.market.build(&config.symbol) else {
            let decision = Decision::skip("no market data for symbol");
            self.log_decision(config, &decision, Some(route))?;
            return Ok((decision, None));
        };

        let context = ExecContext {
            user_id: config.user_id.clone(),
            symbol: config.symbol.clone(),
            now_ms,
            open_position_qty,
        };

        let executor = self.factory.executor_for(route);
        let mut decision = executor.execute(&market, &context, &config.conditions);

        // Bound the multiplier before any sizing happens.
        decision.multiplier = self.factory.risk.clamp_multiplier(decision.multiplier);
        self.log_decision(config, &decision, Some(route))?;

        if !matches!(decision.action, Action::Buy | Action::Sell) {
            return Ok((decision, None));
        }

        let quantity = config.risk.base_quantity * decision.multiplier.max(1.0);
        self.factory
            .risk
            .validate_position_size(quantity, config.risk.base_quantity)
            .context("risk validation rejected order")?;

        let side = if decision.action == Action::Buy {
            OrderSide::Buy
        } else {
            OrderSide::Sell
        };

        let mut order = ScheduledOrder::new_pending(
            &config.user_id,
            &config.symbol,
            side,
            OrderType::Market,
            quantity,
            None,
            now_ms,
        );
        order.strategy_id = Some(config.id.clone());
        order.reduce_only = decision.action == Action::Sell && open_position_qty > 0.0;
        self.store.insert_order(&order)?;

        info!(
            strategy_id = %config.id,
            symbol = %config.symbol,
            action = ?decision.action,
            multiplier = decision.multiplier,
            quantity,
            order_id = %order.id,
            "strategy decision produced an order"
        );

        Ok((decision, Some(order)))
    }

    fn log_decision(
        &self,
        config: &StrategyConfig,
        decision: &Decision,
        route: Option<StrategyRoute>,
    ) -> Result<()> {
        debug!(
            strategy_id = %config.id,
            symbol = %config.symbol,
            action = ?decision.action,
            reason = %decision.reason,
            "strategy evaluated"
        );
        self.store.append_operation_log(
            "strategy",
            &config.id,
            "evaluated",
            None,
            Some(&json!({
                "action": decision.action,
                "reason": decision.reason,
                "multiplier": decision.multiplier,
                "route": route.map(|r| r.strategy_type.as_str()),
            })),
            LogLevel::Info,
        )
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::market_data::{CandleBuffer, DepthBook, PriceCache};
    use crate::strategy::RiskParams;
    use crate::types::MarketKind;

    fn config(conditions: StrategyConditions) -> StrategyConfig {
        StrategyConfig {
            id: "s1".to_string(),
            user_id: "u1".to_string(),
            symbol: "BTCUSDT".to_string(),
            conditions,
            risk: RiskParams {
                base_quantity: 0.1,
                risk_percent: 2.0,
                leverage: 0.0,
            },
        }
    }

    fn router_with_prices(change: Option<f64>) -> (StrategyRouter, Arc<Store>) {
        let prices = Arc::new(PriceCache::new());
        if let Some(change) = change {
            prices.update("BTCUSDT", MarketKind::Futures, 40_000.0, Some(change));
        }
        let view = Arc::new(MarketView {
            prices,
            candles: Arc::new(CandleBuffer::new(200)),
            depth: Arc::new(DepthBook::new()),
            kind: MarketKind::Futures,
        });
        let store = Arc::new(Store::open_in_memory().unwrap());
        let factory = StrategyFactory::new(view, RiskManager::new(3.0));
        (StrategyRouter::new(factory, store.clone()), store)
    }

    #[test]
    fn route_selection_priority_and_no_match() {
        let mut conditions = StrategyConditions::default();
        assert!(select_route(&conditions).is_none());

        conditions.volume_surge_enabled = true;
        assert_eq!(
            select_route(&conditions).unwrap().strategy_type,
            StrategyType::VolumeSurge
        );

        conditions.mean_reversion_enabled = true;
        assert_eq!(
            select_route(&conditions).unwrap().strategy_type,
            StrategyType::MeanReversion
        );

        conditions.momentum_enabled = true;
        assert_eq!(
            select_route(&conditions).unwrap().strategy_type,
            StrategyType::MomentumBreakout
        );
    }

    #[test]
    fn unmatched_conditions_are_a_no_op_and_hit_no_wire() {
        let (router, store) = router_with_prices(Some(5.0));
        let (decision, order) = router
            .evaluate(&config(StrategyConditions::default()), 0.0)
            .unwrap();
        assert_eq!(decision.action, Action::NoOp);
        assert!(order.is_none());
        assert!(store.all_orders().unwrap().is_empty());
    }

    #[test]
    fn missing_market_data_skips() {
        let (router, _store) = router_with_prices(None);
        let mut conditions = StrategyConditions::default();
        conditions.momentum_enabled = true;
        let (decision, order) = router.evaluate(&config(conditions), 0.0).unwrap();
        assert_eq!(decision.action, Action::Skip);
        assert!(order.is_none());
    }

    #[test]
    fn momentum_buy_produces_pending_order_with_bounded_multiplier() {
        // 24h change of 50% would give a raw multiplier of 3.0 (capped by the
        // executor) and survives the risk clamp at ceiling 3.0.
        let (router, store) = router_with_prices(Some(50.0));
        let mut conditions = StrategyConditions::default();
        conditions.momentum_enabled = true;
        conditions.min_change_percent = 5.0;

        // The momentum executor also needs the EMA stack; without bars it
        // skips, so feed candles through the view's buffer.
        let (decision, order) = router.evaluate(&config(conditions), 0.0).unwrap();
        // No candles: EMA missing -> skip, not a silent buy.
        assert_eq!(decision.action, Action::Skip);
        assert!(order.is_none());
        assert!(store.all_orders().unwrap().is_empty());
    }

    #[test]
    fn full_buy_path_materialises_order() {
        let prices = Arc::new(PriceCache::new());
        prices.update("BTCUSDT", MarketKind::Futures, 40_000.0, Some(10.0));
        let candles = Arc::new(CandleBuffer::new(200));
        // Rising closes so the EMA stack aligns.
        for i in 0..60 {
            let close = 39_000.0 + i as f64 * 20.0;
            candles.update(
                crate::market_data::SeriesKey::new("BTCUSDT", MarketKind::Futures, "1h"),
                crate::types::Kline {
                    symbol: "BTCUSDT".to_string(),
                    kind: MarketKind::Futures,
                    interval: "1h".to_string(),
                    open_time: i * 3_600_000,
                    open: close,
                    high: close + 10.0,
                    low: close - 10.0,
                    close,
                    volume: 100.0,
                    quote_volume: None,
                    trade_count: None,
                },
                true,
            );
        }
        let view = Arc::new(MarketView {
            prices,
            candles,
            depth: Arc::new(DepthBook::new()),
            kind: MarketKind::Futures,
        });
        let store = Arc::new(Store::open_in_memory().unwrap());
        let factory = StrategyFactory::new(view, RiskManager::new(3.0));
        let router = StrategyRouter::new(factory, store.clone());

        let mut conditions = StrategyConditions::default();
        conditions.momentum_enabled = true;
        conditions.min_change_percent = 5.0;

        let (decision, order) = router.evaluate(&config(conditions), 0.0).unwrap();
        assert_eq!(decision.action, Action::Buy);
        assert!(decision.multiplier <= 3.0);

        let order = order.unwrap();
        assert_eq!(order.status, OrderStatus::Pending);
        assert_eq!(order.strategy_id.as_deref(), Some("s1"));
        assert!(order.quantity > 0.0);
        // Persisted.
        assert!(store.get_order(&order.id).unwrap().is_some());
    }
}
