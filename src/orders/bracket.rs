// =============================================================================
// Bracket reconciliation — protective-leg settlement and close synthesis
// =============================================================================
//
// For every active bracket link:
//   - A missing entry order orphans the link (warning only).
//   - If either protective leg reports TRIGGERED/FILLED/FINISHED, that side
//     executed.  The surviving leg is cancelled (bounded retries); then the
//     link closes and exactly one synthetic reduce-only close order is
//     attached to the entry (child.parent_order_id = entry.id, entry's
//     close_order_ids gains the child id).
//   - The entry keeps its `filled` status: bracket closure is expressed by
//     the presence of the reduce-only child, never by mutating the parent.
//
// A cancel that keeps failing leaves the link active; the next cycle retries.
// =============================================================================

use anyhow::{Context, Result};
use chrono::Utc;
use serde_json::json;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::exchange::OrderReport;
use crate::store::audit::LogLevel;
use crate::types::{OrderStatus, OrderType};

use super::reconciler::OrderReconciler;
use super::{bracket_close_client_id, BracketLink, BracketStatus, ScheduledOrder};

/// Which protective side executed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ExecutedLeg {
    TakeProfit,
    StopLoss,
}

/// Summary of one bracket pass.
#[derive(Debug, Clone, Default)]
pub struct BracketSummary {
    pub links_checked: usize,
    pub links_closed: usize,
    pub links_orphaned: usize,
    pub closes_synthesised: usize,
}

impl OrderReconciler {
    /// One pass over all active bracket links.
    pub async fn reconcile_brackets(&self) -> Result<BracketSummary> {
        let mut summary = BracketSummary::default();
        let links = self.store.active_bracket_links().context("load bracket links")?;
        summary.links_checked = links.len();

        for link in links {
            match self.reconcile_bracket(&link).await {
                Ok(BracketOutcome::Untouched) => {}
                Ok(BracketOutcome::Orphaned) => {
                    summary.links_orphaned += 1;
                    self.stats.lock().brackets_orphaned += 1;
                }
                Ok(BracketOutcome::Closed) => {
                    summary.links_closed += 1;
                    summary.closes_synthesised += 1;
                    self.stats.lock().brackets_closed += 1;
                }
                Err(e) => {
                    warn!(link_id = %link.id, error = %e, "bracket reconciliation failed — continuing");
                }
            }
        }

        Ok(summary)
    }

    async fn reconcile_bracket(&self, link: &BracketLink) -> Result<BracketOutcome> {
        // Orphan detection: the entry must still exist locally.
        let Some(entry) = self.store.get_order_by_client_id(&link.entry_client_id)? else {
            warn!(
                link_id = %link.id,
                entry_client_id = %link.entry_client_id,
                "bracket entry missing from store — marking link orphaned"
            );
            self.store
                .update_bracket_status(&link.id, BracketStatus::Orphaned)?;
            self.store.append_audit(
                "bracket_link",
                &link.id,
                "orphaned",
                Some(&json!({ "status": "active" })),
                Some(&json!({ "status": "orphaned" })),
                LogLevel::Warning,
            )?;
            return Ok(BracketOutcome::Orphaned);
        };

        // Query both protective legs.
        let tp_report = self.query_leg(&entry, link.tp_client_id.as_deref()).await?;
        let sl_report = self.query_leg(&entry, link.sl_client_id.as_deref()).await?;

        let tp_executed = tp_report.as_ref().is_some_and(|r| r.status.is_executed());
        let sl_executed = sl_report.as_ref().is_some_and(|r| r.status.is_executed());

        let (leg, executed_report) = match (tp_executed, sl_executed) {
            (true, _) => (ExecutedLeg::TakeProfit, tp_report),
            (false, true) => (ExecutedLeg::StopLoss, sl_report),
            (false, false) => return Ok(BracketOutcome::Untouched),
        };

        // Cancel the surviving leg before closing the link.
        let survivor = match leg {
            ExecutedLeg::TakeProfit => link.sl_client_id.as_deref(),
            ExecutedLeg::StopLoss => link.tp_client_id.as_deref(),
        };
        if let Some(survivor_id) = survivor {
            let survivor_executed = match leg {
                ExecutedLeg::TakeProfit => sl_executed,
                ExecutedLeg::StopLoss => tp_executed,
            };
            if !survivor_executed && !self.cancel_leg_with_retries(&entry, survivor_id).await {
                // Leave the link active so the next cycle retries the cancel.
                warn!(
                    link_id = %link.id,
                    survivor = survivor_id,
                    "protective-leg cancel exhausted retries — deferring bracket closure"
                );
                return Ok(BracketOutcome::Untouched);
            }
        }

        // Fill price and quantity come from the triggered leg, falling back
        // to current mark price and the entry quantity.
        let (close_qty, close_price) = match &executed_report {
            Some(report) if report.executed_qty > 0.0 && report.avg_price > 0.0 => {
                (report.executed_qty, report.avg_price)
            }
            _ => {
                let mark = self
                    .exchange
                    .mark_price(&entry.symbol)
                    .await
                    .unwrap_or(entry.avg_price);
                (entry.quantity, mark)
            }
        };

        self.attach_synthetic_close(
            &entry,
            close_qty,
            close_price,
            &bracket_close_client_id(&entry.id, &link.id),
        )?;

        self.store
            .update_bracket_status(&link.id, BracketStatus::Closed)?;
        info!(
            link_id = %link.id,
            entry_id = %entry.id,
            leg = ?leg,
            close_qty,
            close_price,
            "bracket closed"
        );

        Ok(BracketOutcome::Closed)
    }

    async fn query_leg(
        &self,
        entry: &ScheduledOrder,
        client_id: Option<&str>,
    ) -> Result<Option<OrderReport>> {
        match client_id {
            Some(id) => {
                self.exchange
                    .query_algo_order(&entry.user_id, &entry.symbol, id)
                    .await
            }
            None => Ok(None),
        }
    }

    /// Cancel an algo leg with bounded retries. Returns success.
    async fn cancel_leg_with_retries(&self, entry: &ScheduledOrder, client_id: &str) -> bool {
        let attempts = self.config.max_cancel_retries.max(1);
        for attempt in 1..=attempts {
            match self
                .exchange
                .cancel_algo_order(&entry.user_id, &entry.symbol, client_id)
                .await
            {
                Ok(()) => {
                    debug!(client_id, attempt, "protective leg cancelled");
                    return true;
                }
                Err(e) => {
                    warn!(client_id, attempt, error = %e, "protective-leg cancel failed");
                }
            }
        }
        false
    }

    /// Create the reduce-only close child and wire the bidirectional linkage:
    /// child.parent_order_id = entry.id and entry.close_order_ids += child.id.
    pub(crate) fn attach_synthetic_close(
        &self,
        entry: &ScheduledOrder,
        quantity: f64,
        avg_price: f64,
        client_order_id: &str,
    ) -> Result<ScheduledOrder> {
        let now = Utc::now().timestamp_millis();
        let close = ScheduledOrder {
            id: Uuid::new_v4().to_string(),
            user_id: entry.user_id.clone(),
            symbol: entry.symbol.clone(),
            side: entry.side.opposite(),
            order_type: OrderType::Market,
            quantity,
            price: None,
            reduce_only: true,
            trigger_time: now,
            status: OrderStatus::Filled,
            client_order_id: client_order_id.to_string(),
            exchange_order_id: None,
            executed_qty: quantity,
            avg_price,
            parent_order_id: Some(entry.id.clone()),
            close_order_ids: Vec::new(),
            bracket_enabled: false,
            strategy_id: entry.strategy_id.clone(),
            execution_id: entry.execution_id.clone(),
            created_at: now,
            updated_at: now,
        };

        self.store.insert_order(&close)?;

        let mut parent = entry.clone();
        parent.add_close_order_id(&close.id);
        self.store.update_order(&parent)?;

        self.store.append_operation_log(
            "scheduled_order",
            &close.id,
            "close_synthesised",
            None,
            Some(&json!({
                "parent_order_id": entry.id,
                "quantity": quantity,
                "avg_price": avg_price,
            })),
            LogLevel::Info,
        )?;

        Ok(close)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BracketOutcome {
    Untouched,
    Orphaned,
    Closed,
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::Ordering;
    use std::sync::Arc;

    use crate::exchange::testing::MockExchange;
    use crate::runtime_config::ReconcilerConfig;
    use crate::store::Store;
    use crate::types::{ExchangeOrderStatus, OrderSide};

    fn setup() -> (Arc<Store>, Arc<MockExchange>, OrderReconciler) {
        let store = Arc::new(Store::open_in_memory().unwrap());
        let exchange = Arc::new(MockExchange::new());
        let reconciler = OrderReconciler::new(
            store.clone(),
            exchange.clone(),
            ReconcilerConfig::default(),
        );
        (store, exchange, reconciler)
    }

    fn filled_entry(store: &Store, bracket: bool) -> ScheduledOrder {
        let mut entry = ScheduledOrder::new_pending(
            "u1",
            "BTCUSDT",
            OrderSide::Buy,
            OrderType::Limit,
            1.0,
            Some(40_000.0),
            0,
        );
        entry.status = OrderStatus::Filled;
        entry.avg_price = 40_000.0;
        entry.executed_qty = 1.0;
        entry.bracket_enabled = bracket;
        store.insert_order(&entry).unwrap();
        entry
    }

    fn linked_bracket(store: &Store, entry: &ScheduledOrder) -> BracketLink {
        let link = BracketLink::new(&entry.symbol, &entry.client_order_id, Some("TP1"), Some("SL1"));
        store.insert_bracket_link(&link).unwrap();
        link
    }

    #[tokio::test]
    async fn tp_trigger_cancels_sl_and_synthesises_close() {
        let (store, exchange, reconciler) = setup();
        let entry = filled_entry(&store, true);
        let link = linked_bracket(&store, &entry);

        exchange.set_algo_order(MockExchange::report("TP1", ExchangeOrderStatus::Finished, 1.0, 41_000.0));
        exchange.set_algo_order(MockExchange::report("SL1", ExchangeOrderStatus::New, 0.0, 0.0));

        let summary = reconciler.reconcile_brackets().await.unwrap();
        assert_eq!(summary.links_closed, 1);
        assert_eq!(summary.closes_synthesised, 1);

        // SL cancellation was issued.
        assert_eq!(exchange.cancel_calls.load(Ordering::Relaxed), 1);
        assert_eq!(
            exchange.algo_orders.lock().get("SL1").unwrap().status,
            ExchangeOrderStatus::Canceled
        );

        // The link is closed, the close order exists with the right shape.
        assert!(store.active_bracket_links().unwrap().is_empty());
        let parent = store.get_order(&entry.id).unwrap().unwrap();
        assert_eq!(parent.status, OrderStatus::Filled);
        assert_eq!(parent.close_order_ids.len(), 1);

        let close = store.get_order(&parent.close_order_ids[0]).unwrap().unwrap();
        assert!(close.reduce_only);
        assert_eq!(close.parent_order_id.as_deref(), Some(entry.id.as_str()));
        assert_eq!(close.status, OrderStatus::Filled);
        assert_eq!(close.side, OrderSide::Sell);
        assert!((close.avg_price - 41_000.0).abs() < 1e-9);
        assert!(close.client_order_id.starts_with("BC_"));
        assert!(close.client_order_id.len() <= 36);
        let _ = link;
    }

    #[tokio::test]
    async fn missing_entry_orphans_the_link() {
        let (store, _exchange, reconciler) = setup();
        let link = BracketLink::new("ETHUSDT", "ghost-entry", Some("TP1"), Some("SL1"));
        store.insert_bracket_link(&link).unwrap();

        let summary = reconciler.reconcile_brackets().await.unwrap();
        assert_eq!(summary.links_orphaned, 1);
        assert!(store.active_bracket_links().unwrap().is_empty());
    }

    #[tokio::test]
    async fn untriggered_legs_leave_the_link_active() {
        let (store, exchange, reconciler) = setup();
        let entry = filled_entry(&store, true);
        linked_bracket(&store, &entry);

        exchange.set_algo_order(MockExchange::report("TP1", ExchangeOrderStatus::New, 0.0, 0.0));
        exchange.set_algo_order(MockExchange::report("SL1", ExchangeOrderStatus::New, 0.0, 0.0));

        let summary = reconciler.reconcile_brackets().await.unwrap();
        assert_eq!(summary.links_closed, 0);
        assert_eq!(store.active_bracket_links().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn cancel_retries_then_defers_when_exhausted() {
        let (store, exchange, reconciler) = setup();
        let entry = filled_entry(&store, true);
        linked_bracket(&store, &entry);

        exchange.set_algo_order(MockExchange::report("TP1", ExchangeOrderStatus::Triggered, 1.0, 41_000.0));
        exchange.set_algo_order(MockExchange::report("SL1", ExchangeOrderStatus::New, 0.0, 0.0));
        // All three attempts fail.
        exchange.cancel_failures_remaining.store(3, Ordering::Relaxed);

        let summary = reconciler.reconcile_brackets().await.unwrap();
        assert_eq!(summary.links_closed, 0);
        assert_eq!(exchange.cancel_calls.load(Ordering::Relaxed), 3);
        // Link survives for the next cycle.
        assert_eq!(store.active_bracket_links().unwrap().len(), 1);

        // Next cycle: cancel succeeds and the bracket closes exactly once.
        let summary = reconciler.reconcile_brackets().await.unwrap();
        assert_eq!(summary.links_closed, 1);
        let parent = store.get_order(&entry.id).unwrap().unwrap();
        assert_eq!(parent.close_order_ids.len(), 1);
    }

    #[tokio::test]
    async fn fallback_uses_mark_price_and_entry_quantity() {
        let (store, exchange, reconciler) = setup();
        let entry = filled_entry(&store, true);
        linked_bracket(&store, &entry);

        // Executed report carries no usable fill data.
        exchange.set_algo_order(MockExchange::report("SL1", ExchangeOrderStatus::Finished, 0.0, 0.0));
        exchange.set_algo_order(MockExchange::report("TP1", ExchangeOrderStatus::New, 0.0, 0.0));
        exchange.mark_prices.lock().insert("BTCUSDT".to_string(), 39_500.0);

        reconciler.reconcile_brackets().await.unwrap();
        let parent = store.get_order(&entry.id).unwrap().unwrap();
        let close = store.get_order(&parent.close_order_ids[0]).unwrap().unwrap();
        assert!((close.avg_price - 39_500.0).abs() < 1e-9);
        assert!((close.quantity - 1.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn closed_link_is_not_reprocessed() {
        let (store, exchange, reconciler) = setup();
        let entry = filled_entry(&store, true);
        linked_bracket(&store, &entry);

        exchange.set_algo_order(MockExchange::report("TP1", ExchangeOrderStatus::Finished, 1.0, 41_000.0));
        exchange.set_algo_order(MockExchange::report("SL1", ExchangeOrderStatus::New, 0.0, 0.0));

        reconciler.reconcile_brackets().await.unwrap();
        let summary = reconciler.reconcile_brackets().await.unwrap();
        assert_eq!(summary.links_checked, 0);

        // Still exactly one close child.
        let parent = store.get_order(&entry.id).unwrap().unwrap();
        assert_eq!(parent.close_order_ids.len(), 1);
    }
}
