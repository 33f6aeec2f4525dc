// =============================================================================
// Exchange adapter — normalised REST + WebSocket access to the derivatives
// exchange
// =============================================================================
//
// Components never touch raw exchange payloads; they depend on the
// `ExchangeApi` capability below, which the concrete client implements and
// tests mock.
// =============================================================================

pub mod client;
pub mod rate_limit;
pub mod stream;

#[cfg(test)]
pub mod testing;

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::types::{
    ExchangeOrderStatus, ExchangePosition, Kline, MarketKind, OrderSide, OrderType, Ticker,
};

pub use client::ExchangeClient;

/// A new-order request in internal shape. The client translates this into the
/// regular or algo endpoint depending on `order_type`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderRequest {
    pub symbol: String,
    pub side: OrderSide,
    pub order_type: OrderType,
    pub quantity: f64,
    pub price: Option<f64>,
    /// Trigger price for algo order types.
    pub trigger_price: Option<f64>,
    pub reduce_only: bool,
    pub client_order_id: String,
}

/// Acknowledgement of a submitted order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderAck {
    pub exchange_order_id: String,
    pub status: ExchangeOrderStatus,
}

/// Point-in-time view of one order as the exchange reports it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderReport {
    pub client_order_id: String,
    pub exchange_order_id: String,
    pub status: ExchangeOrderStatus,
    pub executed_qty: f64,
    pub avg_price: f64,
    /// Exchange-side update time, milliseconds since the UNIX epoch.
    pub update_time: i64,
}

/// The narrow exchange capability the core depends on.
///
/// Regular and algo orders have distinct endpoints and status vocabularies;
/// the reconciler picks the method by `OrderType::is_algo`.
#[async_trait]
pub trait ExchangeApi: Send + Sync {
    /// Submit an order on behalf of `user_id`.
    async fn place_order(&self, user_id: &str, request: &OrderRequest) -> Result<OrderAck>;

    /// Cancel a regular order by client order id.
    async fn cancel_order(&self, user_id: &str, symbol: &str, client_order_id: &str)
        -> Result<()>;

    /// Cancel an algo order by client order id.
    async fn cancel_algo_order(
        &self,
        user_id: &str,
        symbol: &str,
        client_order_id: &str,
    ) -> Result<()>;

    /// Query a regular order. `Ok(None)` means the exchange does not know the
    /// order (distinct from a transport failure).
    async fn query_order(
        &self,
        user_id: &str,
        symbol: &str,
        client_order_id: &str,
    ) -> Result<Option<OrderReport>>;

    /// Query an algo order.
    async fn query_algo_order(
        &self,
        user_id: &str,
        symbol: &str,
        client_order_id: &str,
    ) -> Result<Option<OrderReport>>;

    /// Current non-zero positions for `user_id`.
    async fn positions(&self, user_id: &str) -> Result<Vec<ExchangePosition>>;

    /// Historical bars. `start_time`/`end_time` are optional millisecond
    /// bounds.
    async fn klines(
        &self,
        symbol: &str,
        kind: MarketKind,
        interval: &str,
        limit: u32,
        start_time: Option<i64>,
        end_time: Option<i64>,
    ) -> Result<Vec<Kline>>;

    /// All 24h tickers for a market kind.
    async fn tickers_24h(&self, kind: MarketKind) -> Result<Vec<Ticker>>;

    /// Top-of-book snapshot: (bids, asks, update id), levels as
    /// (price, quantity).
    async fn depth_snapshot(
        &self,
        symbol: &str,
        kind: MarketKind,
        limit: u32,
    ) -> Result<(Vec<(f64, f64)>, Vec<(f64, f64)>, u64)>;

    /// Current mark price for a futures symbol.
    async fn mark_price(&self, symbol: &str) -> Result<f64>;
}
