// =============================================================================
// Scheduled-order and bracket-link persistence
// =============================================================================
//
// `close_order_ids` is comma-joined only here, at the persistence boundary;
// everywhere else it is an ordered set of ids.
// =============================================================================

use std::str::FromStr;

use anyhow::{Context, Result};
use chrono::Utc;
use rusqlite::{params, Row};

use crate::orders::{BracketLink, BracketStatus, ScheduledOrder};
use crate::types::{OrderSide, OrderStatus, OrderType};

use super::Store;

fn join_ids(ids: &[String]) -> String {
    ids.join(",")
}

fn split_ids(joined: &str) -> Vec<String> {
    joined
        .split(',')
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

fn order_from_row(row: &Row<'_>) -> rusqlite::Result<ScheduledOrder> {
    let side: String = row.get(3)?;
    let order_type: String = row.get(4)?;
    let status: String = row.get(9)?;
    let close_ids: String = row.get(15)?;

    Ok(ScheduledOrder {
        id: row.get(0)?,
        user_id: row.get(1)?,
        symbol: row.get(2)?,
        side: OrderSide::from_str(&side).unwrap_or(OrderSide::Buy),
        order_type: OrderType::from_str(&order_type).unwrap_or(OrderType::Market),
        quantity: row.get(5)?,
        price: row.get(6)?,
        reduce_only: row.get::<_, i64>(7)? != 0,
        trigger_time: row.get(8)?,
        status: OrderStatus::from_str(&status).unwrap_or(OrderStatus::Failed),
        client_order_id: row.get(10)?,
        exchange_order_id: row.get(11)?,
        executed_qty: row.get(12)?,
        avg_price: row.get(13)?,
        parent_order_id: row.get(14)?,
        close_order_ids: split_ids(&close_ids),
        bracket_enabled: row.get::<_, i64>(16)? != 0,
        strategy_id: row.get(17)?,
        execution_id: row.get(18)?,
        created_at: row.get(19)?,
        updated_at: row.get(20)?,
    })
}

const ORDER_COLUMNS: &str = "id, user_id, symbol, side, order_type, quantity, price, reduce_only, \
     trigger_time, status, client_order_id, exchange_order_id, executed_qty, avg_price, \
     parent_order_id, close_order_ids, bracket_enabled, strategy_id, execution_id, \
     created_at, updated_at";

impl Store {
    // -------------------------------------------------------------------------
    // Scheduled orders
    // -------------------------------------------------------------------------

    /// Insert a new order. Fails on duplicate id or client order id; a client
    /// id collision is terminal for the attempt and must not be regenerated.
    pub fn insert_order(&self, order: &ScheduledOrder) -> Result<()> {
        order.validate()?;
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO scheduled_orders \
                 (id, user_id, symbol, side, order_type, quantity, price, reduce_only, \
                  trigger_time, status, client_order_id, exchange_order_id, executed_qty, \
                  avg_price, parent_order_id, close_order_ids, bracket_enabled, strategy_id, \
                  execution_id, created_at, updated_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, \
                         ?16, ?17, ?18, ?19, ?20, ?21)",
                params![
                    order.id,
                    order.user_id,
                    order.symbol,
                    order.side.as_str(),
                    order.order_type.as_str(),
                    order.quantity,
                    order.price,
                    order.reduce_only as i64,
                    order.trigger_time,
                    order.status.as_str(),
                    order.client_order_id,
                    order.exchange_order_id,
                    order.executed_qty,
                    order.avg_price,
                    order.parent_order_id,
                    join_ids(&order.close_order_ids),
                    order.bracket_enabled as i64,
                    order.strategy_id,
                    order.execution_id,
                    order.created_at,
                    order.updated_at,
                ],
            )
            .with_context(|| format!("insert order {}", order.id))?;
            Ok(())
        })
    }

    /// Full-row update by id. `updated_at` is stamped here.
    pub fn update_order(&self, order: &ScheduledOrder) -> Result<()> {
        let updated_at = Utc::now().timestamp_millis();
        self.with_conn(|conn| {
            let changed = conn
                .execute(
                    "UPDATE scheduled_orders SET \
                     status = ?2, exchange_order_id = ?3, executed_qty = ?4, avg_price = ?5, \
                     parent_order_id = ?6, close_order_ids = ?7, bracket_enabled = ?8, \
                     quantity = ?9, price = ?10, updated_at = ?11 \
                     WHERE id = ?1",
                    params![
                        order.id,
                        order.status.as_str(),
                        order.exchange_order_id,
                        order.executed_qty,
                        order.avg_price,
                        order.parent_order_id,
                        join_ids(&order.close_order_ids),
                        order.bracket_enabled as i64,
                        order.quantity,
                        order.price,
                        updated_at,
                    ],
                )
                .with_context(|| format!("update order {}", order.id))?;
            if changed == 0 {
                anyhow::bail!("order {} not found for update", order.id);
            }
            Ok(())
        })
    }

    pub fn get_order(&self, id: &str) -> Result<Option<ScheduledOrder>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {ORDER_COLUMNS} FROM scheduled_orders WHERE id = ?1"
            ))?;
            let mut rows = stmt.query_map(params![id], order_from_row)?;
            Ok(rows.next().transpose()?)
        })
    }

    pub fn get_order_by_client_id(&self, client_order_id: &str) -> Result<Option<ScheduledOrder>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {ORDER_COLUMNS} FROM scheduled_orders WHERE client_order_id = ?1"
            ))?;
            let mut rows = stmt.query_map(params![client_order_id], order_from_row)?;
            Ok(rows.next().transpose()?)
        })
    }

    /// Orders the reconciliation loop re-queries: `processing` or `sent`
    /// with a non-empty client order id.
    pub fn active_orders(&self) -> Result<Vec<ScheduledOrder>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {ORDER_COLUMNS} FROM scheduled_orders \
                 WHERE status IN ('processing', 'sent') AND client_order_id != '' \
                 ORDER BY created_at ASC"
            ))?;
            let orders = stmt
                .query_map([], order_from_row)?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(orders)
        })
    }

    /// Orders in `pending` whose trigger time has been reached.
    pub fn due_pending_orders(&self, now_ms: i64) -> Result<Vec<ScheduledOrder>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {ORDER_COLUMNS} FROM scheduled_orders \
                 WHERE status = 'pending' AND trigger_time <= ?1 ORDER BY trigger_time ASC"
            ))?;
            let orders = stmt
                .query_map(params![now_ms], order_from_row)?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(orders)
        })
    }

    /// All orders for one user+symbol, newest first.
    pub fn orders_for_user_symbol(&self, user_id: &str, symbol: &str) -> Result<Vec<ScheduledOrder>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {ORDER_COLUMNS} FROM scheduled_orders \
                 WHERE user_id = ?1 AND symbol = ?2 ORDER BY created_at DESC"
            ))?;
            let orders = stmt
                .query_map(params![user_id, symbol], order_from_row)?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(orders)
        })
    }

    /// Every stored order. Used by the maintenance pass.
    pub fn all_orders(&self) -> Result<Vec<ScheduledOrder>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {ORDER_COLUMNS} FROM scheduled_orders ORDER BY created_at ASC"
            ))?;
            let orders = stmt
                .query_map([], order_from_row)?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(orders)
        })
    }

    /// Mark strategy-driven orders stranded in `pending`/`processing` at boot
    /// as failed. Reactivation is an operator action.
    pub fn fail_zombie_orders(&self) -> Result<usize> {
        let now = Utc::now().timestamp_millis();
        self.with_conn(|conn| {
            let changed = conn.execute(
                "UPDATE scheduled_orders SET status = 'failed', updated_at = ?1 \
                 WHERE status IN ('pending', 'processing') AND strategy_id IS NOT NULL",
                params![now],
            )?;
            Ok(changed)
        })
    }

    // -------------------------------------------------------------------------
    // Bracket links
    // -------------------------------------------------------------------------

    pub fn insert_bracket_link(&self, link: &BracketLink) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO bracket_links \
                 (id, group_id, entry_client_id, tp_client_id, sl_client_id, symbol, status, \
                  created_at, updated_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                params![
                    link.id,
                    link.group_id,
                    link.entry_client_id,
                    link.tp_client_id,
                    link.sl_client_id,
                    link.symbol,
                    link.status.as_str(),
                    link.created_at,
                    link.updated_at,
                ],
            )
            .with_context(|| format!("insert bracket link {}", link.id))?;
            Ok(())
        })
    }

    pub fn update_bracket_status(&self, id: &str, status: BracketStatus) -> Result<()> {
        let now = Utc::now().timestamp_millis();
        self.with_conn(|conn| {
            let changed = conn.execute(
                "UPDATE bracket_links SET status = ?2, updated_at = ?3 WHERE id = ?1",
                params![id, status.as_str(), now],
            )?;
            if changed == 0 {
                anyhow::bail!("bracket link {id} not found for update");
            }
            Ok(())
        })
    }

    pub fn active_bracket_links(&self) -> Result<Vec<BracketLink>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, group_id, entry_client_id, tp_client_id, sl_client_id, symbol, \
                        status, created_at, updated_at \
                 FROM bracket_links WHERE status = 'active' ORDER BY created_at ASC",
            )?;
            let links = stmt
                .query_map([], |row| {
                    let status: String = row.get(6)?;
                    Ok(BracketLink {
                        id: row.get(0)?,
                        group_id: row.get(1)?,
                        entry_client_id: row.get(2)?,
                        tp_client_id: row.get(3)?,
                        sl_client_id: row.get(4)?,
                        symbol: row.get(5)?,
                        status: BracketStatus::from_str(&status)
                            .unwrap_or(BracketStatus::Orphaned),
                        created_at: row.get(7)?,
                        updated_at: row.get(8)?,
                    })
                })?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(links)
        })
    }
}
