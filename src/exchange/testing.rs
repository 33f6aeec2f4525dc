// =============================================================================
// Scriptable in-memory exchange for tests
// =============================================================================

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use anyhow::Result;
use async_trait::async_trait;
use parking_lot::Mutex;

use crate::types::{
    ExchangeOrderStatus, ExchangePosition, Kline, MarketKind, Ticker,
};

use super::{ExchangeApi, OrderAck, OrderReport, OrderRequest};

/// Deterministic mock of the exchange capability. Tests script its state and
/// inspect the calls components made.
#[derive(Default)]
pub struct MockExchange {
    /// Regular orders by client order id.
    pub orders: Mutex<HashMap<String, OrderReport>>,
    /// Algo orders by client order id.
    pub algo_orders: Mutex<HashMap<String, OrderReport>>,
    /// Positions per user id.
    pub positions: Mutex<HashMap<String, Vec<ExchangePosition>>>,
    /// Kline history per symbol.
    pub klines: Mutex<HashMap<String, Vec<Kline>>>,
    /// Tickers per kind.
    pub tickers: Mutex<Vec<Ticker>>,
    /// Mark prices per symbol.
    pub mark_prices: Mutex<HashMap<String, f64>>,

    /// Remaining cancel attempts that should fail before one succeeds.
    pub cancel_failures_remaining: AtomicU64,

    pub query_calls: AtomicU64,
    pub algo_query_calls: AtomicU64,
    pub cancel_calls: AtomicU64,
    pub place_calls: AtomicU64,
    pub kline_calls: AtomicU64,
}

impl MockExchange {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_order(&self, report: OrderReport) {
        self.orders
            .lock()
            .insert(report.client_order_id.clone(), report);
    }

    pub fn set_algo_order(&self, report: OrderReport) {
        self.algo_orders
            .lock()
            .insert(report.client_order_id.clone(), report);
    }

    pub fn set_positions(&self, user_id: &str, positions: Vec<ExchangePosition>) {
        self.positions.lock().insert(user_id.to_string(), positions);
    }

    pub fn set_klines(&self, symbol: &str, bars: Vec<Kline>) {
        self.klines.lock().insert(symbol.to_string(), bars);
    }

    pub fn report(
        client_order_id: &str,
        status: ExchangeOrderStatus,
        executed_qty: f64,
        avg_price: f64,
    ) -> OrderReport {
        OrderReport {
            client_order_id: client_order_id.to_string(),
            exchange_order_id: format!("ex-{client_order_id}"),
            status,
            executed_qty,
            avg_price,
            update_time: 1,
        }
    }
}

#[async_trait]
impl ExchangeApi for MockExchange {
    async fn place_order(&self, _user_id: &str, request: &OrderRequest) -> Result<OrderAck> {
        self.place_calls.fetch_add(1, Ordering::Relaxed);
        let report = Self::report(&request.client_order_id, ExchangeOrderStatus::New, 0.0, 0.0);
        let ack = OrderAck {
            exchange_order_id: report.exchange_order_id.clone(),
            status: report.status,
        };
        if request.order_type.is_algo() {
            self.set_algo_order(report);
        } else {
            self.set_order(report);
        }
        Ok(ack)
    }

    async fn cancel_order(
        &self,
        _user_id: &str,
        _symbol: &str,
        client_order_id: &str,
    ) -> Result<()> {
        self.cancel_calls.fetch_add(1, Ordering::Relaxed);
        if self
            .cancel_failures_remaining
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| v.checked_sub(1))
            .is_ok()
        {
            anyhow::bail!("injected cancel failure");
        }
        if let Some(report) = self.orders.lock().get_mut(client_order_id) {
            report.status = ExchangeOrderStatus::Canceled;
        }
        Ok(())
    }

    async fn cancel_algo_order(
        &self,
        _user_id: &str,
        _symbol: &str,
        client_order_id: &str,
    ) -> Result<()> {
        self.cancel_calls.fetch_add(1, Ordering::Relaxed);
        if self
            .cancel_failures_remaining
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| v.checked_sub(1))
            .is_ok()
        {
            anyhow::bail!("injected cancel failure");
        }
        if let Some(report) = self.algo_orders.lock().get_mut(client_order_id) {
            report.status = ExchangeOrderStatus::Canceled;
        }
        Ok(())
    }

    async fn query_order(
        &self,
        _user_id: &str,
        _symbol: &str,
        client_order_id: &str,
    ) -> Result<Option<OrderReport>> {
        self.query_calls.fetch_add(1, Ordering::Relaxed);
        Ok(self.orders.lock().get(client_order_id).cloned())
    }

    async fn query_algo_order(
        &self,
        _user_id: &str,
        _symbol: &str,
        client_order_id: &str,
    ) -> Result<Option<OrderReport>> {
        self.algo_query_calls.fetch_add(1, Ordering::Relaxed);
        Ok(self.algo_orders.lock().get(client_order_id).cloned())
    }

    async fn positions(&self, user_id: &str) -> Result<Vec<ExchangePosition>> {
        Ok(self
            .positions
            .lock()
            .get(user_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn klines(
        &self,
        symbol: &str,
        _kind: MarketKind,
        _interval: &str,
        limit: u32,
        start_time: Option<i64>,
        end_time: Option<i64>,
    ) -> Result<Vec<Kline>> {
        self.kline_calls.fetch_add(1, Ordering::Relaxed);
        let all = self
            .klines
            .lock()
            .get(symbol)
            .cloned()
            .unwrap_or_default();
        let filtered: Vec<Kline> = all
            .into_iter()
            .filter(|k| start_time.map_or(true, |s| k.open_time >= s))
            .filter(|k| end_time.map_or(true, |e| k.open_time <= e))
            .take(limit as usize)
            .collect();
        Ok(filtered)
    }

    async fn tickers_24h(&self, kind: MarketKind) -> Result<Vec<Ticker>> {
        Ok(self
            .tickers
            .lock()
            .iter()
            .filter(|t| t.kind == kind)
            .cloned()
            .collect())
    }

    async fn depth_snapshot(
        &self,
        _symbol: &str,
        _kind: MarketKind,
        _limit: u32,
    ) -> Result<(Vec<(f64, f64)>, Vec<(f64, f64)>, u64)> {
        Ok((Vec::new(), Vec::new(), 0))
    }

    async fn mark_price(&self, symbol: &str) -> Result<f64> {
        self.mark_prices
            .lock()
            .get(symbol)
            .copied()
            .ok_or_else(|| anyhow::anyhow!("no mark price scripted for {symbol}"))
    }
}
