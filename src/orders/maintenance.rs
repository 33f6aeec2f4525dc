// =============================================================================
// Relationship maintenance — repair parent/child order linkage
// =============================================================================
//
// Runs after every reconciliation cycle:
//   1. Null out `parent_order_id` references to orders that no longer exist.
//   2. Prune ids from `close_order_ids` whose orders no longer exist.
//   3. Adopt stray reduce-only orders: attach them to the most recent
//      matching filled entry of the same user and symbol.
//   4. Repair bidirectional drift: a child listed in a parent's
//      `close_order_ids` must carry that parent's id.
//
// Every repair appends a warning-level audit entry; on a consistent store
// the pass changes nothing.
// =============================================================================

use std::collections::HashMap;

use anyhow::{Context, Result};
use serde::Serialize;
use serde_json::json;
use tracing::{debug, warn};

use crate::store::audit::LogLevel;
use crate::types::OrderStatus;

use super::reconciler::OrderReconciler;
use super::ScheduledOrder;

/// What one maintenance pass repaired.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MaintenanceSummary {
    pub dangling_parents_cleared: usize,
    pub close_ids_pruned: usize,
    pub orphans_adopted: usize,
    pub backlinks_repaired: usize,
}

impl MaintenanceSummary {
    pub fn total(&self) -> usize {
        self.dangling_parents_cleared
            + self.close_ids_pruned
            + self.orphans_adopted
            + self.backlinks_repaired
    }
}

impl OrderReconciler {
    /// One relationship-maintenance pass over the whole order store.
    pub fn run_maintenance(&self) -> Result<MaintenanceSummary> {
        let mut summary = MaintenanceSummary::default();

        let all = self.store.all_orders().context("load orders for maintenance")?;
        let by_id: HashMap<String, ScheduledOrder> =
            all.iter().map(|o| (o.id.clone(), o.clone())).collect();

        // Orders mutated during the pass, flushed at the end.
        let mut dirty: HashMap<String, ScheduledOrder> = HashMap::new();

        // ── 1 + 2: dangling references ──────────────────────────────────
        for order in &all {
            let mut updated = order.clone();
            let mut changed = false;

            if let Some(parent_id) = &updated.parent_order_id {
                if !by_id.contains_key(parent_id) {
                    warn!(
                        order_id = %updated.id,
                        parent_id = %parent_id,
                        "clearing parent reference to nonexistent order"
                    );
                    self.audit_repair(&updated.id, "dangling_parent_cleared", parent_id)?;
                    updated.parent_order_id = None;
                    summary.dangling_parents_cleared += 1;
                    changed = true;
                }
            }

            let before = updated.close_order_ids.len();
            updated.prune_close_order_ids(&|id| by_id.contains_key(id));
            let pruned = before - updated.close_order_ids.len();
            if pruned > 0 {
                self.audit_repair(&updated.id, "stale_close_ids_pruned", &pruned.to_string())?;
                summary.close_ids_pruned += pruned;
                changed = true;
            }

            if changed {
                dirty.insert(updated.id.clone(), updated);
            }
        }

        // ── 3: adopt stray reduce-only orders ───────────────────────────
        for order in &all {
            let current = dirty.get(&order.id).unwrap_or(order);
            if !current.reduce_only || current.parent_order_id.is_some() {
                continue;
            }

            let candidate = all
                .iter()
                .filter(|p| {
                    p.user_id == current.user_id
                        && p.symbol == current.symbol
                        && !p.reduce_only
                        && p.status == OrderStatus::Filled
                })
                .max_by_key(|p| p.created_at);

            if let Some(parent) = candidate {
                debug!(
                    child_id = %current.id,
                    parent_id = %parent.id,
                    "adopting stray reduce-only order"
                );
                self.audit_repair(&current.id, "orphan_adopted", &parent.id)?;

                let mut child = current.clone();
                child.parent_order_id = Some(parent.id.clone());
                dirty.insert(child.id.clone(), child);

                let mut parent_row = dirty.get(&parent.id).cloned().unwrap_or_else(|| parent.clone());
                parent_row.add_close_order_id(&order.id);
                dirty.insert(parent_row.id.clone(), parent_row);

                summary.orphans_adopted += 1;
            }
        }

        // ── 4: bidirectional repair ─────────────────────────────────────
        for order in &all {
            let parent = dirty.get(&order.id).cloned().unwrap_or_else(|| order.clone());
            for child_id in parent.close_order_ids.clone() {
                let child = dirty
                    .get(&child_id)
                    .cloned()
                    .or_else(|| by_id.get(&child_id).cloned());
                if let Some(mut child) = child {
                    if child.parent_order_id.as_deref() != Some(parent.id.as_str()) {
                        warn!(
                            child_id = %child.id,
                            parent_id = %parent.id,
                            "repairing child's parent reference"
                        );
                        self.audit_repair(&child.id, "backlink_repaired", &parent.id)?;
                        child.parent_order_id = Some(parent.id.clone());
                        dirty.insert(child.id.clone(), child);
                        summary.backlinks_repaired += 1;
                    }
                }
            }
        }

        for order in dirty.values() {
            self.store.update_order(order)?;
        }
        if summary.total() > 0 {
            self.stats.lock().maintenance_repairs += summary.total() as u64;
        }

        Ok(summary)
    }

    fn audit_repair(&self, entity_id: &str, action: &str, detail: &str) -> Result<()> {
        self.store.append_audit(
            "scheduled_order",
            entity_id,
            action,
            None,
            Some(&json!({ "detail": detail })),
            LogLevel::Warning,
        )
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use crate::exchange::testing::MockExchange;
    use crate::runtime_config::ReconcilerConfig;
    use crate::store::Store;
    use crate::types::{OrderSide, OrderType};

    fn setup() -> (Arc<Store>, OrderReconciler) {
        let store = Arc::new(Store::open_in_memory().unwrap());
        let reconciler = OrderReconciler::new(
            store.clone(),
            Arc::new(MockExchange::new()),
            ReconcilerConfig::default(),
        );
        (store, reconciler)
    }

    fn order(store: &Store, status: OrderStatus, reduce_only: bool) -> ScheduledOrder {
        let mut o = ScheduledOrder::new_pending(
            "u1",
            "BTCUSDT",
            OrderSide::Buy,
            OrderType::Limit,
            1.0,
            Some(40_000.0),
            0,
        );
        o.status = status;
        o.reduce_only = reduce_only;
        store.insert_order(&o).unwrap();
        o
    }

    #[test]
    fn dangling_parent_is_cleared() {
        let (store, reconciler) = setup();
        let mut child = order(&store, OrderStatus::Filled, true);
        child.parent_order_id = Some("no-such-order".to_string());
        store.update_order(&child).unwrap();

        let summary = reconciler.run_maintenance().unwrap();
        assert_eq!(summary.dangling_parents_cleared, 1);
        // The stray reduce-only is then adopted by... nobody (no filled
        // non-reduce-only entry exists), so the parent stays empty.
        let loaded = store.get_order(&child.id).unwrap().unwrap();
        assert!(loaded.parent_order_id.is_none());
    }

    #[test]
    fn stale_close_ids_are_pruned() {
        let (store, reconciler) = setup();
        let mut parent = order(&store, OrderStatus::Filled, false);
        parent.add_close_order_id("ghost-1");
        parent.add_close_order_id("ghost-2");
        store.update_order(&parent).unwrap();

        let summary = reconciler.run_maintenance().unwrap();
        assert_eq!(summary.close_ids_pruned, 2);
        let loaded = store.get_order(&parent.id).unwrap().unwrap();
        assert!(loaded.close_order_ids.is_empty());
    }

    #[test]
    fn stray_reduce_only_adopts_latest_filled_entry() {
        let (store, reconciler) = setup();
        let mut older = ScheduledOrder::new_pending(
            "u1",
            "BTCUSDT",
            OrderSide::Buy,
            OrderType::Limit,
            1.0,
            None,
            0,
        );
        older.status = OrderStatus::Filled;
        older.created_at = 100;
        store.insert_order(&older).unwrap();

        let mut newer = ScheduledOrder::new_pending(
            "u1",
            "BTCUSDT",
            OrderSide::Buy,
            OrderType::Limit,
            1.0,
            None,
            0,
        );
        newer.status = OrderStatus::Filled;
        newer.created_at = 200;
        store.insert_order(&newer).unwrap();

        let child = order(&store, OrderStatus::Filled, true);

        let summary = reconciler.run_maintenance().unwrap();
        assert_eq!(summary.orphans_adopted, 1);

        let loaded_child = store.get_order(&child.id).unwrap().unwrap();
        assert_eq!(loaded_child.parent_order_id.as_deref(), Some(newer.id.as_str()));
        let loaded_parent = store.get_order(&newer.id).unwrap().unwrap();
        assert!(loaded_parent.close_order_ids.contains(&child.id));
    }

    #[test]
    fn backlink_repair_points_child_at_listing_parent() {
        let (store, reconciler) = setup();
        let child = order(&store, OrderStatus::Filled, true);
        let other = order(&store, OrderStatus::Filled, false);
        let mut parent = order(&store, OrderStatus::Filled, false);

        // Parent lists the child, but the child points elsewhere.
        parent.add_close_order_id(&child.id);
        store.update_order(&parent).unwrap();
        let mut drifted = child.clone();
        drifted.parent_order_id = Some(other.id.clone());
        store.update_order(&drifted).unwrap();

        let summary = reconciler.run_maintenance().unwrap();
        assert!(summary.backlinks_repaired >= 1);
        let loaded = store.get_order(&child.id).unwrap().unwrap();
        assert_eq!(loaded.parent_order_id.as_deref(), Some(parent.id.as_str()));
    }

    #[test]
    fn consistent_store_is_a_noop() {
        let (store, reconciler) = setup();
        let mut parent = order(&store, OrderStatus::Filled, false);
        let mut child = order(&store, OrderStatus::Filled, true);
        child.parent_order_id = Some(parent.id.clone());
        store.update_order(&child).unwrap();
        parent.add_close_order_id(&child.id);
        store.update_order(&parent).unwrap();

        let summary = reconciler.run_maintenance().unwrap();
        assert_eq!(summary, MaintenanceSummary::default());

        // Idempotent: a second pass is also a no-op.
        let summary = reconciler.run_maintenance().unwrap();
        assert_eq!(summary.total(), 0);
    }
}
