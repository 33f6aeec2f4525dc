// =============================================================================
// Order domain model — scheduled orders and bracket links
// =============================================================================
//
// A ScheduledOrder is the local record of one intended exchange order.  A
// BracketLink ties an entry order to its protective take-profit / stop-loss
// legs.  Parent/child linkage is bidirectional: the child carries
// `parent_order_id`, the parent lists the child in `close_order_ids`.
//
// `close_order_ids` is an ordered set in memory; it is comma-joined only at
// the persistence boundary.
// =============================================================================

pub mod bracket;
pub mod maintenance;
pub mod reconciler;

use anyhow::Result;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::types::{OrderSide, OrderStatus, OrderType};

/// Hard cap the exchange imposes on client order ids.
pub const MAX_CLIENT_ORDER_ID_LEN: usize = 36;

// ---------------------------------------------------------------------------
// ScheduledOrder
// ---------------------------------------------------------------------------

/// Local record of one intended (or completed) exchange order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduledOrder {
    pub id: String,
    pub user_id: String,
    pub symbol: String,
    pub side: OrderSide,
    pub order_type: OrderType,
    pub quantity: f64,
    pub price: Option<f64>,
    pub reduce_only: bool,
    /// Earliest submission time, milliseconds since the UNIX epoch.
    pub trigger_time: i64,
    pub status: OrderStatus,
    /// Unique, <= 36 chars. Collisions are terminal for the attempt; the id
    /// is never regenerated.
    pub client_order_id: String,
    pub exchange_order_id: Option<String>,
    pub executed_qty: f64,
    pub avg_price: f64,
    pub parent_order_id: Option<String>,
    /// Ids of reduce-only children that close this order's position.
    pub close_order_ids: Vec<String>,
    pub bracket_enabled: bool,
    pub strategy_id: Option<String>,
    pub execution_id: Option<String>,
    pub created_at: i64,
    pub updated_at: i64,
}

impl ScheduledOrder {
    /// Construct a fresh pending order with a generated id and client id.
    #[allow(clippy::too_many_arguments)]
    pub fn new_pending(
        user_id: &str,
        symbol: &str,
        side: OrderSide,
        order_type: OrderType,
        quantity: f64,
        price: Option<f64>,
        trigger_time: i64,
    ) -> Self {
        let now = Utc::now().timestamp_millis();
        Self {
            id: Uuid::new_v4().to_string(),
            user_id: user_id.to_string(),
            symbol: symbol.to_string(),
            side,
            order_type,
            quantity,
            price,
            reduce_only: false,
            trigger_time,
            status: OrderStatus::Pending,
            client_order_id: Uuid::new_v4().to_string(),
            exchange_order_id: None,
            executed_qty: 0.0,
            avg_price: 0.0,
            parent_order_id: None,
            close_order_ids: Vec::new(),
            bracket_enabled: false,
            strategy_id: None,
            execution_id: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Ingress validation: non-empty client id within the exchange cap,
    /// positive quantity. Rejected orders are never retried.
    pub fn validate(&self) -> Result<()> {
        if self.client_order_id.is_empty() {
            anyhow::bail!("client_order_id must not be empty");
        }
        if self.client_order_id.len() > MAX_CLIENT_ORDER_ID_LEN {
            anyhow::bail!(
                "client_order_id exceeds {} chars: {}",
                MAX_CLIENT_ORDER_ID_LEN,
                self.client_order_id.len()
            );
        }
        if self.quantity <= 0.0 || !self.quantity.is_finite() {
            anyhow::bail!("quantity must be positive and finite");
        }
        Ok(())
    }

    /// Append a close-order id, preserving order and rejecting duplicates.
    pub fn add_close_order_id(&mut self, id: &str) {
        if !self.close_order_ids.iter().any(|existing| existing == id) {
            self.close_order_ids.push(id.to_string());
        }
    }

    /// Drop close-order ids not present in `keep`.
    pub fn prune_close_order_ids(&mut self, keep: &dyn Fn(&str) -> bool) {
        self.close_order_ids.retain(|id| keep(id));
    }

    /// Whether this order is a bracketed entry (owns protective legs).
    pub fn is_bracket_entry(&self) -> bool {
        self.bracket_enabled && !self.reduce_only
    }
}

// ---------------------------------------------------------------------------
// BracketLink
// ---------------------------------------------------------------------------

/// State of a bracket link.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BracketStatus {
    Active,
    Closed,
    Orphaned,
}

impl BracketStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Closed => "closed",
            Self::Orphaned => "orphaned",
        }
    }
}

impl std::str::FromStr for BracketStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(Self::Active),
            "closed" => Ok(Self::Closed),
            "orphaned" => Ok(Self::Orphaned),
            other => anyhow::bail!("unknown bracket status: {other}"),
        }
    }
}

/// One bracketed entry: the entry order plus its protective legs, all
/// referenced by client order id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BracketLink {
    pub id: String,
    pub group_id: String,
    pub entry_client_id: String,
    pub tp_client_id: Option<String>,
    pub sl_client_id: Option<String>,
    pub symbol: String,
    pub status: BracketStatus,
    pub created_at: i64,
    pub updated_at: i64,
}

impl BracketLink {
    pub fn new(
        symbol: &str,
        entry_client_id: &str,
        tp_client_id: Option<&str>,
        sl_client_id: Option<&str>,
    ) -> Self {
        let now = Utc::now().timestamp_millis();
        Self {
            id: Uuid::new_v4().to_string(),
            group_id: Uuid::new_v4().to_string(),
            entry_client_id: entry_client_id.to_string(),
            tp_client_id: tp_client_id.map(str::to_string),
            sl_client_id: sl_client_id.map(str::to_string),
            symbol: symbol.to_string(),
            status: BracketStatus::Active,
            created_at: now,
            updated_at: now,
        }
    }
}

// ---------------------------------------------------------------------------
// Client-order-id hygiene
// ---------------------------------------------------------------------------

/// Shorten an internal id for embedding in a compound client id: the segment
/// before the first '-' of a UUID, or a plain prefix for anything else.
fn short_id(id: &str) -> &str {
    let cut = id.find('-').unwrap_or(id.len()).min(8);
    &id[..cut]
}

/// Client id for a synthesised external-close order:
/// `EC_{shortEntryId}_{shortExtOpId}`.
///
/// The result is always <= 36 chars by construction; a final deterministic
/// truncation guards against non-UUID inputs. Never hash.
pub fn external_close_client_id(entry_id: &str, ext_op_id: &str) -> String {
    let mut id = format!("EC_{}_{}", short_id(entry_id), short_id(ext_op_id));
    id.truncate(MAX_CLIENT_ORDER_ID_LEN);
    id
}

/// Client id for a synthesised bracket-close order:
/// `BC_{shortEntryId}_{shortLinkId}`.
pub fn bracket_close_client_id(entry_id: &str, link_id: &str) -> String {
    let mut id = format!("BC_{}_{}", short_id(entry_id), short_id(link_id));
    id.truncate(MAX_CLIENT_ORDER_ID_LEN);
    id
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    fn order() -> ScheduledOrder {
        ScheduledOrder::new_pending(
            "u1",
            "BTCUSDT",
            OrderSide::Buy,
            OrderType::Limit,
            0.5,
            Some(40_000.0),
            0,
        )
    }

    #[test]
    fn new_pending_generates_valid_client_id() {
        let o = order();
        o.validate().unwrap();
        assert_eq!(o.client_order_id.len(), 36);
        assert_eq!(o.status, OrderStatus::Pending);
    }

    #[test]
    fn validate_rejects_empty_and_oversized_client_ids() {
        let mut o = order();
        o.client_order_id = String::new();
        assert!(o.validate().is_err());

        o.client_order_id = "x".repeat(37);
        assert!(o.validate().is_err());

        o.client_order_id = "x".repeat(36);
        o.validate().unwrap();
    }

    #[test]
    fn validate_rejects_nonpositive_quantity() {
        let mut o = order();
        o.quantity = 0.0;
        assert!(o.validate().is_err());
        o.quantity = f64::NAN;
        assert!(o.validate().is_err());
    }

    #[test]
    fn close_order_ids_behave_like_ordered_set() {
        let mut o = order();
        o.add_close_order_id("a");
        o.add_close_order_id("b");
        o.add_close_order_id("a");
        assert_eq!(o.close_order_ids, vec!["a", "b"]);

        o.prune_close_order_ids(&|id| id == "b");
        assert_eq!(o.close_order_ids, vec!["b"]);
    }

    #[test]
    fn external_close_id_is_short_and_deterministic() {
        let entry = "123e4567-e89b-12d3-a456-426614174000";
        let ext = "abcdefab-1111-2222-3333-444455556666";
        let id = external_close_client_id(entry, ext);
        assert_eq!(id, "EC_123e4567_abcdefab");
        assert!(id.len() <= MAX_CLIENT_ORDER_ID_LEN);
        // Deterministic: same inputs, same output.
        assert_eq!(id, external_close_client_id(entry, ext));
    }

    #[test]
    fn close_id_truncates_non_uuid_inputs() {
        let long = "z".repeat(64);
        let id = external_close_client_id(&long, &long);
        assert!(id.len() <= MAX_CLIENT_ORDER_ID_LEN);
        assert!(id.starts_with("EC_zzzzzzzz"));
    }

    #[test]
    fn bracket_link_starts_active() {
        let link = BracketLink::new("ETHUSDT", "entry-cid", Some("tp-cid"), Some("sl-cid"));
        assert_eq!(link.status, BracketStatus::Active);
        assert_eq!(link.symbol, "ETHUSDT");
        assert!(link.tp_client_id.is_some());
    }
}
