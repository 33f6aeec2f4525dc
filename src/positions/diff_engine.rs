// =============================================================================
// Position Diff Engine — detect externally-initiated position changes
// =============================================================================
//
// Every cycle the engine fetches each user's non-zero exchange positions and
// compares them with the last stored snapshot map keyed by (user, symbol).
// Diffs are classified with a confidence score; only scores meeting the
// per-type threshold materialise an ExternalOperation.  A detected close is
// attached to the most recent matching filled entry as a synthetic
// reduce-only close order; bracket-enabled entries route through the bracket
// closure path so the surviving protective legs are cancelled.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{TimeZone, Timelike, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::json;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::exchange::ExchangeApi;
use crate::orders::reconciler::OrderReconciler;
use crate::orders::{external_close_client_id, BracketStatus, ScheduledOrder};
use crate::store::audit::LogLevel;
use crate::store::Store;
use crate::types::{ExchangePosition, OrderStatus};

use super::{ExternalOpKind, ExternalOpStatus, ExternalOperation, PositionSnapshot};

/// Confidence thresholds per diff class.
const NEW_POSITION_THRESHOLD: f64 = 0.7;
const CHANGED_POSITION_THRESHOLD: f64 = 0.8;
/// Size delta below this fraction is jitter, not a change.
const SIZE_EPSILON: f64 = 1e-9;

/// Counters for the stats endpoint.
#[derive(Debug, Clone, Default, Serialize)]
pub struct DiffStats {
    pub cycles: u64,
    pub diffs_classified: u64,
    pub operations_materialised: u64,
    pub operations_below_threshold: u64,
    pub closes_attached: u64,
    pub user_errors: u64,
}

/// Watches users' exchange positions and derives external operations.
pub struct PositionDiffEngine {
    store: Arc<Store>,
    exchange: Arc<dyn ExchangeApi>,
    reconciler: Arc<OrderReconciler>,
    users: Vec<String>,
    /// Last known exchange position per (user, symbol).
    snapshots: Mutex<HashMap<(String, String), PositionSnapshot>>,
    stats: Mutex<DiffStats>,
}

/// A classified diff before materialisation.
#[derive(Debug, Clone, PartialEq)]
pub struct ClassifiedDiff {
    pub kind: ExternalOpKind,
    pub confidence: f64,
    pub old_amount: f64,
    pub new_amount: f64,
}

/// Heuristic: the overlap of the US and European sessions sees most
/// discretionary activity.
fn is_active_trading_hours(now_ms: i64) -> bool {
    match Utc.timestamp_millis_opt(now_ms).single() {
        Some(t) => (12..22).contains(&t.hour()),
        None => false,
    }
}

/// Classify one (previous, current) pair. Pure; the caller owns thresholds.
pub fn classify_diff(
    previous: Option<&PositionSnapshot>,
    current: Option<&ExchangePosition>,
    now_ms: i64,
) -> Option<ClassifiedDiff> {
    let hours_bonus: f64 = if is_active_trading_hours(now_ms) { 0.1 } else { 0.0 };

    match (previous, current) {
        // Newly present symbol.
        (None, Some(pos)) => {
            let mut confidence = 0.5;
            if pos.position_amt.abs() > 0.1 {
                confidence += 0.3;
            }
            if pos.update_time > 0 {
                confidence += 0.2;
            }
            Some(ClassifiedDiff {
                kind: ExternalOpKind::ExternalOpen,
                confidence: (confidence + hours_bonus).min(1.0),
                old_amount: 0.0,
                new_amount: pos.position_amt,
            })
        }

        // Symbol disappeared.
        (Some(prev), None) => Some(ClassifiedDiff {
            kind: ExternalOpKind::ExternalFullClose,
            confidence: 0.95,
            old_amount: prev.position_amt,
            new_amount: 0.0,
        }),

        // Size change.
        (Some(prev), Some(pos)) => {
            let delta = (pos.position_amt - prev.position_amt).abs();
            if delta <= SIZE_EPSILON || prev.position_amt.abs() <= SIZE_EPSILON {
                return None;
            }

            let kind = if pos.position_amt.abs() < prev.position_amt.abs() {
                ExternalOpKind::ExternalPartialClose
            } else {
                ExternalOpKind::ExternalAddPosition
            };

            let change_ratio = delta / prev.position_amt.abs();
            let mut confidence = 0.5;
            if change_ratio > 0.1 {
                confidence += 0.4;
            } else if change_ratio > 0.01 {
                confidence += 0.2;
            }
            if pos.update_time != prev.exchange_update_time {
                confidence += 0.2;
            }

            Some(ClassifiedDiff {
                kind,
                confidence: (confidence + hours_bonus).min(1.0),
                old_amount: prev.position_amt,
                new_amount: pos.position_amt,
            })
        }

        (None, None) => None,
    }
}

/// Whether a classified diff clears its materialisation threshold.
pub fn meets_threshold(diff: &ClassifiedDiff) -> bool {
    match diff.kind {
        ExternalOpKind::ExternalOpen => diff.confidence >= NEW_POSITION_THRESHOLD,
        ExternalOpKind::ExternalFullClose => true,
        _ => diff.confidence >= CHANGED_POSITION_THRESHOLD,
    }
}

impl PositionDiffEngine {
    pub fn new(
        store: Arc<Store>,
        exchange: Arc<dyn ExchangeApi>,
        reconciler: Arc<OrderReconciler>,
        users: Vec<String>,
    ) -> Self {
        Self {
            store,
            exchange,
            reconciler,
            users,
            snapshots: Mutex::new(HashMap::new()),
            stats: Mutex::new(DiffStats::default()),
        }
    }

    /// One detection cycle across all users. Returns the operations that
    /// were materialised so the caller can route notifications.
    pub async fn detect_cycle(&self, now_ms: i64) -> Vec<ExternalOperation> {
        self.stats.lock().cycles += 1;
        let mut materialised = Vec::new();

        for user_id in self.users.clone() {
            match self.detect_for_user(&user_id, now_ms).await {
                Ok(mut ops) => materialised.append(&mut ops),
                Err(e) => {
                    self.stats.lock().user_errors += 1;
                    warn!(user_id = %user_id, error = %e, "position detection failed for user — continuing");
                }
            }
        }

        materialised
    }

    async fn detect_for_user(&self, user_id: &str, now_ms: i64) -> Result<Vec<ExternalOperation>> {
        let positions = self
            .exchange
            .positions(user_id)
            .await
            .context("fetch positions")?;

        let current_by_symbol: HashMap<&str, &ExchangePosition> =
            positions.iter().map(|p| (p.symbol.as_str(), p)).collect();

        // Symbols present before, for disappearance detection.
        let previous_symbols: Vec<String> = {
            let map = self.snapshots.lock();
            map.keys()
                .filter(|(u, _)| u == user_id)
                .map(|(_, s)| s.clone())
                .collect()
        };

        let mut ops = Vec::new();

        // Current positions: new or changed.
        for pos in &positions {
            let previous = {
                let map = self.snapshots.lock();
                map.get(&(user_id.to_string(), pos.symbol.clone())).cloned()
            };
            if let Some(diff) = classify_diff(previous.as_ref(), Some(pos), now_ms) {
                self.stats.lock().diffs_classified += 1;
                if meets_threshold(&diff) {
                    ops.push(self.materialise(user_id, &pos.symbol, diff, now_ms).await?);
                } else {
                    self.stats.lock().operations_below_threshold += 1;
                    debug!(
                        user_id,
                        symbol = %pos.symbol,
                        confidence = diff.confidence,
                        "diff below confidence threshold — ignored"
                    );
                }
            }
        }

        // Previously-held symbols that vanished.
        for symbol in previous_symbols {
            if current_by_symbol.contains_key(symbol.as_str()) {
                continue;
            }
            let previous = {
                let map = self.snapshots.lock();
                map.get(&(user_id.to_string(), symbol.clone())).cloned()
            };
            if let Some(diff) = classify_diff(previous.as_ref(), None, now_ms) {
                self.stats.lock().diffs_classified += 1;
                ops.push(self.materialise(user_id, &symbol, diff, now_ms).await?);
            }
        }

        // Refresh the snapshot map to the observed state.
        {
            let mut map = self.snapshots.lock();
            map.retain(|(u, s), _| u != user_id || current_by_symbol.contains_key(s.as_str()));
            for pos in &positions {
                map.insert(
                    (user_id.to_string(), pos.symbol.clone()),
                    PositionSnapshot {
                        user_id: user_id.to_string(),
                        symbol: pos.symbol.clone(),
                        position_amt: pos.position_amt,
                        entry_price: pos.entry_price,
                        mark_price: pos.mark_price,
                        exchange_update_time: pos.update_time,
                        snapshot_time: now_ms,
                    },
                );
            }
        }

        Ok(ops)
    }

    /// Persist one operation and run the close-attachment path when the
    /// operation reduces a position.
    async fn materialise(
        &self,
        user_id: &str,
        symbol: &str,
        diff: ClassifiedDiff,
        now_ms: i64,
    ) -> Result<ExternalOperation> {
        let op = ExternalOperation {
            id: Uuid::new_v4().to_string(),
            user_id: user_id.to_string(),
            symbol: symbol.to_string(),
            operation_type: diff.kind,
            old_amount: diff.old_amount,
            new_amount: diff.new_amount,
            confidence: diff.confidence,
            detected_at: now_ms,
            status: ExternalOpStatus::Detected,
        };
        self.store.insert_external_operation(&op)?;
        self.store.append_audit(
            "external_operation",
            &op.id,
            op.operation_type.as_str(),
            Some(&json!({ "amount": op.old_amount })),
            Some(&json!({ "amount": op.new_amount })),
            LogLevel::Info,
        )?;
        self.stats.lock().operations_materialised += 1;

        info!(
            user_id,
            symbol,
            operation = %op.operation_type,
            confidence = op.confidence,
            old = op.old_amount,
            new = op.new_amount,
            "external operation detected"
        );

        if op.operation_type.is_close() {
            if let Err(e) = self.attach_close(&op).await {
                warn!(op_id = %op.id, error = %e, "failed to attach close order for external operation");
            }
        }

        Ok(op)
    }

    /// Attach a synthetic reduce-only close to the best candidate parent:
    /// same user and symbol, non-reduce-only, filled, and without an active
    /// close child already. Bracket-enabled parents route through the
    /// bracket path so the surviving legs are cancelled; the parent stays
    /// `filled` either way.
    async fn attach_close(&self, op: &ExternalOperation) -> Result<()> {
        let candidates = self
            .store
            .orders_for_user_symbol(&op.user_id, &op.symbol)?;

        let parent = candidates.into_iter().find(|o| {
            !o.reduce_only && o.status == OrderStatus::Filled && o.close_order_ids.is_empty()
        });

        let Some(parent) = parent else {
            debug!(
                user_id = %op.user_id,
                symbol = %op.symbol,
                "no candidate parent for external close"
            );
            return Ok(());
        };

        if parent.bracket_enabled {
            self.cancel_bracket_legs(&parent).await?;
        }

        let close_qty = (op.old_amount - op.new_amount).abs();
        let close_price = self
            .exchange
            .mark_price(&op.symbol)
            .await
            .unwrap_or(parent.avg_price);

        self.reconciler.attach_synthetic_close(
            &parent,
            if close_qty > 0.0 { close_qty } else { parent.quantity },
            close_price,
            &external_close_client_id(&parent.id, &op.id),
        )?;
        self.stats.lock().closes_attached += 1;

        self.store.mark_external_operation_processed(&op.id)?;
        Ok(())
    }

    /// Cancel any still-active protective legs of the parent's bracket and
    /// close the link.
    async fn cancel_bracket_legs(&self, parent: &ScheduledOrder) -> Result<()> {
        for link in self.store.active_bracket_links()? {
            if link.entry_client_id != parent.client_order_id {
                continue;
            }
            for leg in [link.tp_client_id.as_deref(), link.sl_client_id.as_deref()]
                .into_iter()
                .flatten()
            {
                if let Err(e) = self
                    .exchange
                    .cancel_algo_order(&parent.user_id, &parent.symbol, leg)
                    .await
                {
                    warn!(leg, error = %e, "failed to cancel protective leg after external close");
                }
            }
            self.store
                .update_bracket_status(&link.id, BracketStatus::Closed)?;
        }
        Ok(())
    }

    /// Seed the snapshot map (warm start / tests).
    pub fn seed_snapshot(&self, snapshot: PositionSnapshot) {
        self.snapshots.lock().insert(
            (snapshot.user_id.clone(), snapshot.symbol.clone()),
            snapshot,
        );
    }

    pub fn snapshot_count(&self) -> usize {
        self.snapshots.lock().len()
    }

    pub fn stats(&self) -> DiffStats {
        self.stats.lock().clone()
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::exchange::testing::MockExchange;
    use crate::runtime_config::ReconcilerConfig;
    use crate::types::{OrderSide, OrderType};

    // 14:00 UTC — inside active trading hours.
    const ACTIVE_TS: i64 = 1_700_056_800_000;
    // 03:00 UTC — outside active trading hours.
    const QUIET_TS: i64 = 1_700_017_200_000;

    fn pos(symbol: &str, amt: f64, update_time: i64) -> ExchangePosition {
        ExchangePosition {
            symbol: symbol.to_string(),
            position_amt: amt,
            entry_price: 2000.0,
            mark_price: 2010.0,
            leverage: 10.0,
            update_time,
        }
    }

    fn snap(user: &str, symbol: &str, amt: f64, update_time: i64) -> PositionSnapshot {
        PositionSnapshot {
            user_id: user.to_string(),
            symbol: symbol.to_string(),
            position_amt: amt,
            entry_price: 2000.0,
            mark_price: 2000.0,
            exchange_update_time: update_time,
            snapshot_time: 0,
        }
    }

    fn engine(exchange: Arc<MockExchange>) -> (PositionDiffEngine, Arc<Store>) {
        let store = Arc::new(Store::open_in_memory().unwrap());
        let reconciler = Arc::new(OrderReconciler::new(
            store.clone(),
            exchange.clone(),
            ReconcilerConfig::default(),
        ));
        (
            PositionDiffEngine::new(store.clone(), exchange, reconciler, vec!["u1".to_string()]),
            store,
        )
    }

    #[test]
    fn classify_new_position_confidence_arithmetic() {
        // Large position with an exchange update time: 0.5 + 0.3 + 0.2 = 1.0.
        let diff = classify_diff(None, Some(&pos("ETHUSDT", 1.0, 5)), QUIET_TS).unwrap();
        assert_eq!(diff.kind, ExternalOpKind::ExternalOpen);
        assert!((diff.confidence - 1.0).abs() < 1e-9);

        // Dust position without update time: 0.5 only — below threshold.
        let diff = classify_diff(None, Some(&pos("ETHUSDT", 0.05, 0)), QUIET_TS).unwrap();
        assert!((diff.confidence - 0.5).abs() < 1e-9);
        assert!(!meets_threshold(&diff));
    }

    #[test]
    fn classify_full_close_is_always_material() {
        let prev = snap("u1", "ETHUSDT", 1.0, 5);
        let diff = classify_diff(Some(&prev), None, QUIET_TS).unwrap();
        assert_eq!(diff.kind, ExternalOpKind::ExternalFullClose);
        assert!((diff.confidence - 0.95).abs() < 1e-9);
        assert!(meets_threshold(&diff));
        assert!((diff.old_amount - 1.0).abs() < 1e-9);
        assert_eq!(diff.new_amount, 0.0);
    }

    #[test]
    fn classify_size_changes() {
        let prev = snap("u1", "ETHUSDT", 2.0, 5);

        // Halved: partial close, ratio 0.5 > 0.1 and update time differs:
        // 0.5 + 0.4 + 0.2 = 1.0 (clamped).
        let diff = classify_diff(Some(&prev), Some(&pos("ETHUSDT", 1.0, 6)), QUIET_TS).unwrap();
        assert_eq!(diff.kind, ExternalOpKind::ExternalPartialClose);
        assert!(meets_threshold(&diff));

        // Grown: add position.
        let diff = classify_diff(Some(&prev), Some(&pos("ETHUSDT", 3.0, 6)), QUIET_TS).unwrap();
        assert_eq!(diff.kind, ExternalOpKind::ExternalAddPosition);

        // Tiny wobble below 1%: 0.5 + 0 + 0.2 = 0.7 < 0.8 — ignored.
        let diff = classify_diff(Some(&prev), Some(&pos("ETHUSDT", 2.0001, 6)), QUIET_TS).unwrap();
        assert!(!meets_threshold(&diff));

        // Identical size: no diff at all.
        assert!(classify_diff(Some(&prev), Some(&pos("ETHUSDT", 2.0, 5)), QUIET_TS).is_none());
    }

    #[test]
    fn active_hours_bonus_applies() {
        let quiet = classify_diff(None, Some(&pos("ETHUSDT", 0.05, 5)), QUIET_TS).unwrap();
        let active = classify_diff(None, Some(&pos("ETHUSDT", 0.05, 5)), ACTIVE_TS).unwrap();
        assert!((active.confidence - quiet.confidence - 0.1).abs() < 1e-9);
    }

    #[tokio::test]
    async fn full_close_materialises_and_attaches_reduce_only_child() {
        let exchange = Arc::new(MockExchange::new());
        exchange.mark_prices.lock().insert("ETHUSDT".to_string(), 2050.0);
        let (engine, store) = engine(exchange);

        // A filled entry exists for the user.
        let mut entry = ScheduledOrder::new_pending(
            "u1",
            "ETHUSDT",
            OrderSide::Buy,
            OrderType::Limit,
            1.0,
            Some(2000.0),
            0,
        );
        entry.status = OrderStatus::Filled;
        entry.avg_price = 2000.0;
        store.insert_order(&entry).unwrap();

        // User held 1.0 at the last snapshot; the exchange now shows nothing.
        engine.seed_snapshot(snap("u1", "ETHUSDT", 1.0, 5));

        let ops = engine.detect_cycle(QUIET_TS).await;
        assert_eq!(ops.len(), 1);
        assert_eq!(ops[0].operation_type, ExternalOpKind::ExternalFullClose);
        assert!((ops[0].confidence - 0.95).abs() < 1e-9);

        // The synthetic close is linked to the entry.
        let parent = store.get_order(&entry.id).unwrap().unwrap();
        assert_eq!(parent.status, OrderStatus::Filled);
        assert_eq!(parent.close_order_ids.len(), 1);
        let close = store.get_order(&parent.close_order_ids[0]).unwrap().unwrap();
        assert!(close.reduce_only);
        assert_eq!(close.parent_order_id.as_deref(), Some(entry.id.as_str()));
        assert!(close.client_order_id.starts_with("EC_"));
        assert!(close.client_order_id.len() <= 36);
        assert!((close.avg_price - 2050.0).abs() < 1e-9);

        // The operation row is marked processed.
        let stored_ops = store.recent_external_operations(10).unwrap();
        assert_eq!(stored_ops[0].status, ExternalOpStatus::Processed);

        // Snapshot map no longer holds the symbol.
        assert_eq!(engine.snapshot_count(), 0);
    }

    #[tokio::test]
    async fn bracket_enabled_parent_routes_through_bracket_closure() {
        let exchange = Arc::new(MockExchange::new());
        exchange.mark_prices.lock().insert("ETHUSDT".to_string(), 2050.0);
        exchange.set_algo_order(MockExchange::report(
            "TP1",
            crate::types::ExchangeOrderStatus::New,
            0.0,
            0.0,
        ));
        exchange.set_algo_order(MockExchange::report(
            "SL1",
            crate::types::ExchangeOrderStatus::New,
            0.0,
            0.0,
        ));
        let (engine, store) = engine(exchange.clone());

        let mut entry = ScheduledOrder::new_pending(
            "u1",
            "ETHUSDT",
            OrderSide::Buy,
            OrderType::Limit,
            1.0,
            Some(2000.0),
            0,
        );
        entry.status = OrderStatus::Filled;
        entry.bracket_enabled = true;
        store.insert_order(&entry).unwrap();

        let link = crate::orders::BracketLink::new(
            "ETHUSDT",
            &entry.client_order_id,
            Some("TP1"),
            Some("SL1"),
        );
        store.insert_bracket_link(&link).unwrap();

        engine.seed_snapshot(snap("u1", "ETHUSDT", 1.0, 5));
        let ops = engine.detect_cycle(QUIET_TS).await;
        assert_eq!(ops.len(), 1);

        // Both protective legs were cancelled and the link closed.
        assert_eq!(exchange.cancel_calls.load(std::sync::atomic::Ordering::Relaxed), 2);
        assert!(store.active_bracket_links().unwrap().is_empty());

        // Parent is still filled, with the close child attached.
        let parent = store.get_order(&entry.id).unwrap().unwrap();
        assert_eq!(parent.status, OrderStatus::Filled);
        assert_eq!(parent.close_order_ids.len(), 1);
    }

    #[tokio::test]
    async fn first_sight_of_position_is_external_open() {
        let exchange = Arc::new(MockExchange::new());
        exchange.set_positions("u1", vec![pos("BTCUSDT", 0.5, 10)]);
        let (engine, store) = engine(exchange);

        let ops = engine.detect_cycle(QUIET_TS).await;
        assert_eq!(ops.len(), 1);
        assert_eq!(ops[0].operation_type, ExternalOpKind::ExternalOpen);
        assert!(ops[0].confidence >= 0.7);
        assert_eq!(engine.snapshot_count(), 1);
        assert_eq!(store.recent_external_operations(10).unwrap().len(), 1);

        // A second cycle over the same exchange state detects nothing new.
        let ops = engine.detect_cycle(QUIET_TS).await;
        assert!(ops.is_empty());
    }
}
