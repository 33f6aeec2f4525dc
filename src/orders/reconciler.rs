// =============================================================================
// Order Reconciler — mirror exchange truth into local scheduled orders
// =============================================================================
//
// The 30-second reconciliation loop:
//   1. Select local orders in {processing, sent} with a client order id.
//      Orders already `filled` are never re-queried.
//   2. Query the regular or algo endpoint depending on the order type and
//      mirror the exchange status:
//        FILLED -> filled, CANCELED/PENDING_CANCEL -> cancelled,
//        REJECTED/EXPIRED -> failed, PARTIALLY_FILLED -> filled (executed
//        qty adopted only when strictly greater), NEW -> processing.
//        FINISHED coerces a still-active algo order to filled; TRIGGERED
//        leaves local state for the next cycle to settle.
//   3. Persist and append an operation-log entry only when status, executed
//      quantity, or average price actually changed — re-running the loop
//      over an unchanged exchange is a no-op.
//
// A single order's failure never aborts the cycle.
// =============================================================================

use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Utc;
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::json;
use tracing::{debug, info, warn};

use crate::exchange::{ExchangeApi, OrderReport, OrderRequest};
use crate::runtime_config::ReconcilerConfig;
use crate::store::audit::LogLevel;
use crate::store::Store;
use crate::types::{ExchangeOrderStatus, OrderStatus};

use super::ScheduledOrder;

/// One mirrored change, surfaced so the caller can route notifications.
#[derive(Debug, Clone, Serialize)]
pub struct OrderChange {
    pub order_id: String,
    pub user_id: String,
    pub symbol: String,
    pub old_status: OrderStatus,
    pub new_status: OrderStatus,
    pub executed_qty: f64,
    pub avg_price: f64,
}

/// Outcome of one reconciliation pass.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ReconcileSummary {
    pub checked: usize,
    pub updated: usize,
    pub submitted: usize,
    pub errors: usize,
    pub changes: Vec<OrderChange>,
}

/// Counters across the reconciler's lifetime.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ReconcilerStats {
    pub cycles: u64,
    pub orders_checked: u64,
    pub orders_updated: u64,
    pub orders_submitted: u64,
    pub query_errors: u64,
    pub brackets_closed: u64,
    pub brackets_orphaned: u64,
    pub maintenance_repairs: u64,
}

/// Reconciles local scheduled orders and bracket links against the exchange.
pub struct OrderReconciler {
    pub(crate) store: Arc<Store>,
    pub(crate) exchange: Arc<dyn ExchangeApi>,
    pub(crate) config: ReconcilerConfig,
    pub(crate) stats: Mutex<ReconcilerStats>,
}

impl OrderReconciler {
    pub fn new(store: Arc<Store>, exchange: Arc<dyn ExchangeApi>, config: ReconcilerConfig) -> Self {
        Self {
            store,
            exchange,
            config,
            stats: Mutex::new(ReconcilerStats::default()),
        }
    }

    /// Map an exchange report onto the local status vocabulary.
    ///
    /// `None` means "no local transition this cycle".
    fn map_status(remote: ExchangeOrderStatus, is_algo: bool) -> Option<OrderStatus> {
        match remote {
            ExchangeOrderStatus::Filled | ExchangeOrderStatus::PartiallyFilled => {
                Some(OrderStatus::Filled)
            }
            ExchangeOrderStatus::Canceled | ExchangeOrderStatus::PendingCancel => {
                Some(OrderStatus::Cancelled)
            }
            ExchangeOrderStatus::Rejected | ExchangeOrderStatus::Expired => {
                Some(OrderStatus::Failed)
            }
            ExchangeOrderStatus::New => Some(OrderStatus::Processing),
            // Consistency sweep: a finished algo order is done executing.
            ExchangeOrderStatus::Finished if is_algo => Some(OrderStatus::Filled),
            ExchangeOrderStatus::Finished | ExchangeOrderStatus::Triggered => None,
        }
    }

    /// One pass of the local-state reconciliation loop.
    pub async fn reconcile_local_orders(&self) -> Result<ReconcileSummary> {
        let mut summary = ReconcileSummary::default();
        self.stats.lock().cycles += 1;

        let active = self.store.active_orders().context("load active orders")?;
        summary.checked = active.len();
        self.stats.lock().orders_checked += active.len() as u64;

        for order in active {
            match self.mirror_one(&order).await {
                Ok(Some(change)) => {
                    summary.updated += 1;
                    self.stats.lock().orders_updated += 1;
                    summary.changes.push(change);
                }
                Ok(None) => {}
                Err(e) => {
                    summary.errors += 1;
                    self.stats.lock().query_errors += 1;
                    warn!(order_id = %order.id, error = %e, "order reconciliation failed — continuing");
                }
            }
        }

        debug!(
            checked = summary.checked,
            updated = summary.updated,
            errors = summary.errors,
            "local order reconciliation pass complete"
        );
        Ok(summary)
    }

    /// Query the exchange for one order and mirror any drift.
    async fn mirror_one(&self, order: &ScheduledOrder) -> Result<Option<OrderChange>> {
        let is_algo = order.order_type.is_algo();
        let report = if is_algo {
            self.exchange
                .query_algo_order(&order.user_id, &order.symbol, &order.client_order_id)
                .await?
        } else {
            self.exchange
                .query_order(&order.user_id, &order.symbol, &order.client_order_id)
                .await?
        };

        let Some(report) = report else {
            warn!(
                order_id = %order.id,
                client_order_id = %order.client_order_id,
                "exchange does not know an active local order"
            );
            return Ok(None);
        };

        self.apply_report(order, &report, is_algo)
    }

    /// Apply an exchange report; persists and logs only on a real change.
    fn apply_report(
        &self,
        order: &ScheduledOrder,
        report: &OrderReport,
        is_algo: bool,
    ) -> Result<Option<OrderChange>> {
        let mapped = Self::map_status(report.status, is_algo);

        let mut updated = order.clone();
        let mut changed = false;

        if let Some(new_status) = mapped {
            if new_status != updated.status {
                updated.status = new_status;
                changed = true;
            }
        }
        // Executed quantity only ever moves forward.
        if report.executed_qty > updated.executed_qty {
            updated.executed_qty = report.executed_qty;
            changed = true;
        }
        if report.avg_price > 0.0 && (report.avg_price - updated.avg_price).abs() > f64::EPSILON {
            updated.avg_price = report.avg_price;
            changed = true;
        }
        if updated.exchange_order_id.is_none() && !report.exchange_order_id.is_empty() {
            updated.exchange_order_id = Some(report.exchange_order_id.clone());
            changed = true;
        }

        if !changed {
            return Ok(None);
        }

        self.store.update_order(&updated)?;
        self.store.append_operation_log(
            "scheduled_order",
            &order.id,
            "exchange_sync",
            Some(&json!({
                "status": order.status.as_str(),
                "executed_qty": order.executed_qty,
                "avg_price": order.avg_price,
            })),
            Some(&json!({
                "status": updated.status.as_str(),
                "executed_qty": updated.executed_qty,
                "avg_price": updated.avg_price,
            })),
            LogLevel::Info,
        )?;

        info!(
            order_id = %order.id,
            old_status = %order.status,
            new_status = %updated.status,
            executed_qty = updated.executed_qty,
            "order state mirrored from exchange"
        );

        Ok(Some(OrderChange {
            order_id: order.id.clone(),
            user_id: order.user_id.clone(),
            symbol: order.symbol.clone(),
            old_status: order.status,
            new_status: updated.status,
            executed_qty: updated.executed_qty,
            avg_price: updated.avg_price,
        }))
    }

    // -------------------------------------------------------------------------
    // Submission of due pending orders
    // -------------------------------------------------------------------------

    /// Submit pending orders whose trigger time has been reached:
    /// `pending -> processing` at submission, `processing -> sent` on ack.
    /// An exchange rejection (including a client-id collision) is terminal
    /// for the attempt; the id is never regenerated.
    pub async fn submit_due_orders(&self, now_ms: i64) -> Result<usize> {
        let due = self.store.due_pending_orders(now_ms)?;
        let mut submitted = 0;

        for mut order in due {
            if let Err(e) = order.validate() {
                warn!(order_id = %order.id, error = %e, "rejecting invalid pending order");
                order.status = OrderStatus::Failed;
                self.store.update_order(&order)?;
                continue;
            }

            order.status = OrderStatus::Processing;
            self.store.update_order(&order)?;

            let request = OrderRequest {
                symbol: order.symbol.clone(),
                side: order.side,
                order_type: order.order_type,
                quantity: order.quantity,
                price: order.price,
                trigger_price: order.price.filter(|_| order.order_type.is_algo()),
                reduce_only: order.reduce_only,
                client_order_id: order.client_order_id.clone(),
            };

            match self.exchange.place_order(&order.user_id, &request).await {
                Ok(ack) => {
                    order.status = OrderStatus::Sent;
                    order.exchange_order_id = Some(ack.exchange_order_id);
                    self.store.update_order(&order)?;
                    self.store.append_operation_log(
                        "scheduled_order",
                        &order.id,
                        "submitted",
                        None,
                        Some(&json!({ "status": "sent" })),
                        LogLevel::Info,
                    )?;
                    submitted += 1;
                    self.stats.lock().orders_submitted += 1;
                }
                Err(e) => {
                    // A rejection is terminal; the reconciliation loop picks
                    // up transport-level uncertainty on the next pass.
                    warn!(order_id = %order.id, error = %e, "order submission failed");
                    order.status = OrderStatus::Failed;
                    self.store.update_order(&order)?;
                    self.store.append_operation_log(
                        "scheduled_order",
                        &order.id,
                        "submit_failed",
                        None,
                        Some(&json!({ "error": e.to_string() })),
                        LogLevel::Warning,
                    )?;
                }
            }
        }

        Ok(submitted)
    }

    pub fn stats(&self) -> ReconcilerStats {
        self.stats.lock().clone()
    }

    pub fn now_ms() -> i64 {
        Utc::now().timestamp_millis()
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::exchange::testing::MockExchange;
    use crate::types::{OrderSide, OrderType};

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

    fn active_order(store: &Store, status: OrderStatus, order_type: OrderType) -> ScheduledOrder {
        let mut order = ScheduledOrder::new_pending(
            "u1",
            "BTCUSDT",
            OrderSide::Buy,
            order_type,
            1.0,
            Some(40_000.0),
            0,
        );
        order.status = status;
        store.insert_order(&order).unwrap();
        order
    }

    #[tokio::test]
    async fn filled_report_mirrors_to_filled_with_log() {
        let (store, exchange, reconciler) = setup();
        let order = active_order(&store, OrderStatus::Sent, OrderType::Limit);
        exchange.set_order(MockExchange::report(
            &order.client_order_id,
            ExchangeOrderStatus::Filled,
            1.0,
            40_100.0,
        ));

        let summary = reconciler.reconcile_local_orders().await.unwrap();
        assert_eq!(summary.updated, 1);
        assert_eq!(summary.changes[0].new_status, OrderStatus::Filled);

        let loaded = store.get_order(&order.id).unwrap().unwrap();
        assert_eq!(loaded.status, OrderStatus::Filled);
        assert!((loaded.avg_price - 40_100.0).abs() < 1e-9);
        assert_eq!(store.operation_log_count().unwrap(), 1);
    }

    #[tokio::test]
    async fn status_mapping_table() {
        assert_eq!(
            OrderReconciler::map_status(ExchangeOrderStatus::Filled, false),
            Some(OrderStatus::Filled)
        );
        assert_eq!(
            OrderReconciler::map_status(ExchangeOrderStatus::PartiallyFilled, false),
            Some(OrderStatus::Filled)
        );
        assert_eq!(
            OrderReconciler::map_status(ExchangeOrderStatus::Canceled, false),
            Some(OrderStatus::Cancelled)
        );
        assert_eq!(
            OrderReconciler::map_status(ExchangeOrderStatus::PendingCancel, false),
            Some(OrderStatus::Cancelled)
        );
        assert_eq!(
            OrderReconciler::map_status(ExchangeOrderStatus::Rejected, false),
            Some(OrderStatus::Failed)
        );
        assert_eq!(
            OrderReconciler::map_status(ExchangeOrderStatus::Expired, false),
            Some(OrderStatus::Failed)
        );
        assert_eq!(
            OrderReconciler::map_status(ExchangeOrderStatus::New, false),
            Some(OrderStatus::Processing)
        );
        // FINISHED coerces only algo orders.
        assert_eq!(
            OrderReconciler::map_status(ExchangeOrderStatus::Finished, true),
            Some(OrderStatus::Filled)
        );
        assert_eq!(
            OrderReconciler::map_status(ExchangeOrderStatus::Finished, false),
            None
        );
        assert_eq!(
            OrderReconciler::map_status(ExchangeOrderStatus::Triggered, true),
            None
        );
    }

    #[tokio::test]
    async fn algo_orders_use_the_algo_endpoint() {
        let (store, exchange, reconciler) = setup();
        let order = active_order(&store, OrderStatus::Processing, OrderType::StopMarket);
        exchange.set_algo_order(MockExchange::report(
            &order.client_order_id,
            ExchangeOrderStatus::Finished,
            1.0,
            39_000.0,
        ));

        reconciler.reconcile_local_orders().await.unwrap();
        assert_eq!(exchange.algo_query_calls.load(std::sync::atomic::Ordering::Relaxed), 1);
        assert_eq!(exchange.query_calls.load(std::sync::atomic::Ordering::Relaxed), 0);

        // FINISHED while locally processing goes straight to filled.
        let loaded = store.get_order(&order.id).unwrap().unwrap();
        assert_eq!(loaded.status, OrderStatus::Filled);
    }

    #[tokio::test]
    async fn filled_orders_are_never_requeried() {
        let (store, exchange, reconciler) = setup();
        active_order(&store, OrderStatus::Filled, OrderType::Limit);

        let summary = reconciler.reconcile_local_orders().await.unwrap();
        assert_eq!(summary.checked, 0);
        assert_eq!(exchange.query_calls.load(std::sync::atomic::Ordering::Relaxed), 0);
    }

    #[tokio::test]
    async fn executed_qty_never_regresses() {
        let (store, exchange, reconciler) = setup();
        let mut order = active_order(&store, OrderStatus::Sent, OrderType::Limit);
        order.executed_qty = 0.8;
        store.update_order(&order).unwrap();

        // Exchange reports a smaller executed quantity.
        exchange.set_order(MockExchange::report(
            &order.client_order_id,
            ExchangeOrderStatus::PartiallyFilled,
            0.5,
            40_000.0,
        ));
        reconciler.reconcile_local_orders().await.unwrap();

        let loaded = store.get_order(&order.id).unwrap().unwrap();
        // Status mirrored, but the quantity kept its high-water mark.
        assert_eq!(loaded.status, OrderStatus::Filled);
        assert!((loaded.executed_qty - 0.8).abs() < 1e-9);
    }

    #[tokio::test]
    async fn reconciliation_is_idempotent_on_frozen_exchange() {
        let (store, exchange, reconciler) = setup();
        let order = active_order(&store, OrderStatus::Sent, OrderType::Limit);
        exchange.set_order(MockExchange::report(
            &order.client_order_id,
            ExchangeOrderStatus::Filled,
            1.0,
            40_100.0,
        ));

        reconciler.reconcile_local_orders().await.unwrap();
        let logs_after_first = store.operation_log_count().unwrap();
        let row_after_first = store.get_order(&order.id).unwrap().unwrap();

        // Second pass over the unchanged exchange.
        let summary = reconciler.reconcile_local_orders().await.unwrap();
        assert_eq!(summary.updated, 0);
        assert_eq!(store.operation_log_count().unwrap(), logs_after_first);
        let row_after_second = store.get_order(&order.id).unwrap().unwrap();
        assert_eq!(row_after_first.status, row_after_second.status);
        assert_eq!(row_after_first.executed_qty, row_after_second.executed_qty);
        assert_eq!(row_after_first.close_order_ids, row_after_second.close_order_ids);
    }

    #[tokio::test]
    async fn one_bad_order_does_not_block_the_cycle() {
        let (store, exchange, reconciler) = setup();
        // First order unknown to the exchange; second order resolvable.
        active_order(&store, OrderStatus::Sent, OrderType::Limit);
        let good = active_order(&store, OrderStatus::Sent, OrderType::Limit);
        exchange.set_order(MockExchange::report(
            &good.client_order_id,
            ExchangeOrderStatus::Filled,
            1.0,
            40_000.0,
        ));

        let summary = reconciler.reconcile_local_orders().await.unwrap();
        assert_eq!(summary.checked, 2);
        assert_eq!(summary.updated, 1);
    }

    #[tokio::test]
    async fn due_pending_orders_submit_and_ack() {
        let (store, exchange, reconciler) = setup();
        let order = ScheduledOrder::new_pending(
            "u1",
            "ETHUSDT",
            OrderSide::Sell,
            OrderType::Limit,
            2.0,
            Some(2500.0),
            1000,
        );
        store.insert_order(&order).unwrap();

        // Not yet due.
        assert_eq!(reconciler.submit_due_orders(500).await.unwrap(), 0);
        // Due now.
        assert_eq!(reconciler.submit_due_orders(1500).await.unwrap(), 1);
        assert_eq!(exchange.place_calls.load(std::sync::atomic::Ordering::Relaxed), 1);

        let loaded = store.get_order(&order.id).unwrap().unwrap();
        assert_eq!(loaded.status, OrderStatus::Sent);
        assert!(loaded.exchange_order_id.is_some());
    }
}
