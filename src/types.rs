// =============================================================================
// Shared types used across the Meridian analytics backend
// =============================================================================

use serde::{Deserialize, Serialize};

/// Which market a symbol trades on. Spot and futures data are synced, ranked,
/// and persisted independently of each other.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MarketKind {
    Spot,
    Futures,
}

impl MarketKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Spot => "spot",
            Self::Futures => "futures",
        }
    }
}

impl std::fmt::Display for MarketKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for MarketKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "spot" => Ok(Self::Spot),
            "futures" => Ok(Self::Futures),
            other => anyhow::bail!("unknown market kind: {other}"),
        }
    }
}

/// Order direction, serialised the way the exchange expects it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum OrderSide {
    Buy,
    Sell,
}

impl OrderSide {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Buy => "BUY",
            Self::Sell => "SELL",
        }
    }

    /// The side that closes a position opened with `self`.
    pub fn opposite(&self) -> Self {
        match self {
            Self::Buy => Self::Sell,
            Self::Sell => Self::Buy,
        }
    }
}

impl std::fmt::Display for OrderSide {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for OrderSide {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "BUY" => Ok(Self::Buy),
            "SELL" => Ok(Self::Sell),
            other => anyhow::bail!("unknown order side: {other}"),
        }
    }
}

/// Order type. Trigger-based types route through the exchange's algo-order
/// endpoints, which have a distinct schema and status vocabulary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderType {
    Market,
    Limit,
    TakeProfitMarket,
    StopMarket,
}

impl OrderType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Market => "MARKET",
            Self::Limit => "LIMIT",
            Self::TakeProfitMarket => "TAKE_PROFIT_MARKET",
            Self::StopMarket => "STOP_MARKET",
        }
    }

    /// Whether this order type lives on the algo-order endpoint.
    pub fn is_algo(&self) -> bool {
        matches!(self, Self::TakeProfitMarket | Self::StopMarket)
    }
}

impl std::fmt::Display for OrderType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for OrderType {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "MARKET" => Ok(Self::Market),
            "LIMIT" => Ok(Self::Limit),
            "TAKE_PROFIT_MARKET" => Ok(Self::TakeProfitMarket),
            "STOP_MARKET" => Ok(Self::StopMarket),
            other => anyhow::bail!("unknown order type: {other}"),
        }
    }
}

/// Local life-cycle of a scheduled order.
///
/// `pending -> processing -> sent -> filled` is the happy path; `cancelled`
/// and `failed` are terminal for the order but not for its bracket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderStatus {
    Pending,
    Processing,
    Sent,
    Filled,
    Cancelled,
    Failed,
    Completed,
}

impl OrderStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Sent => "sent",
            Self::Filled => "filled",
            Self::Cancelled => "cancelled",
            Self::Failed => "failed",
            Self::Completed => "completed",
        }
    }

    /// States the reconciliation loop re-queries against the exchange.
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Processing | Self::Sent)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Filled | Self::Cancelled | Self::Failed | Self::Completed
        )
    }
}

impl std::fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for OrderStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "pending" => Ok(Self::Pending),
            "processing" => Ok(Self::Processing),
            "sent" => Ok(Self::Sent),
            "filled" => Ok(Self::Filled),
            "cancelled" => Ok(Self::Cancelled),
            "failed" => Ok(Self::Failed),
            "completed" => Ok(Self::Completed),
            other => anyhow::bail!("unknown order status: {other}"),
        }
    }
}

/// Status vocabulary reported by the exchange. `Triggered` and `Finished`
/// only appear on algo endpoints.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExchangeOrderStatus {
    New,
    PartiallyFilled,
    Filled,
    Canceled,
    PendingCancel,
    Rejected,
    Expired,
    Triggered,
    Finished,
}

impl ExchangeOrderStatus {
    /// Parse the exchange's wire representation. Unknown statuses are an
    /// error so the reconciler can surface them instead of guessing.
    pub fn parse(s: &str) -> anyhow::Result<Self> {
        match s {
            "NEW" => Ok(Self::New),
            "PARTIALLY_FILLED" => Ok(Self::PartiallyFilled),
            "FILLED" => Ok(Self::Filled),
            "CANCELED" => Ok(Self::Canceled),
            "PENDING_CANCEL" => Ok(Self::PendingCancel),
            "REJECTED" => Ok(Self::Rejected),
            "EXPIRED" => Ok(Self::Expired),
            "TRIGGERED" => Ok(Self::Triggered),
            "FINISHED" => Ok(Self::Finished),
            other => anyhow::bail!("unknown exchange order status: {other}"),
        }
    }

    /// Whether an algo order in this state has executed its trigger.
    pub fn is_executed(&self) -> bool {
        matches!(self, Self::Triggered | Self::Filled | Self::Finished)
    }
}

/// One row of a realtime-gainers ranking. Transient: lives only inside the
/// change detector and the save controller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GainerItem {
    pub symbol: String,
    /// 1-based rank within the list.
    pub rank: u32,
    pub current_price: f64,
    pub change_percent: f64,
    pub volume_24h: f64,
    pub data_source: String,
}

/// Normalised OHLCV bar. Unique by (symbol, kind, interval, open_time);
/// the store upserts on that key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Kline {
    pub symbol: String,
    pub kind: MarketKind,
    pub interval: String,
    /// Bar open time, milliseconds since the UNIX epoch.
    pub open_time: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
    #[serde(default)]
    pub quote_volume: Option<f64>,
    #[serde(default)]
    pub trade_count: Option<u64>,
}

/// Normalised 24-hour ticker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Ticker {
    pub symbol: String,
    pub kind: MarketKind,
    pub last_price: f64,
    pub price_change_percent: f64,
    pub volume_24h: f64,
    #[serde(default)]
    pub quote_volume_24h: f64,
    /// Exchange event time, milliseconds since the UNIX epoch.
    pub event_time: i64,
}

/// A single position as reported by the exchange's position-risk endpoint.
/// `position_amt` is signed: positive long, negative short.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExchangePosition {
    pub symbol: String,
    pub position_amt: f64,
    pub entry_price: f64,
    pub mark_price: f64,
    #[serde(default)]
    pub leverage: f64,
    /// Exchange-side last-update time, milliseconds since the UNIX epoch.
    pub update_time: i64,
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn order_type_algo_detection() {
        assert!(OrderType::TakeProfitMarket.is_algo());
        assert!(OrderType::StopMarket.is_algo());
        assert!(!OrderType::Market.is_algo());
        assert!(!OrderType::Limit.is_algo());
    }

    #[test]
    fn order_status_round_trip() {
        for s in [
            "pending",
            "processing",
            "sent",
            "filled",
            "cancelled",
            "failed",
            "completed",
        ] {
            let parsed = OrderStatus::from_str(s).unwrap();
            assert_eq!(parsed.as_str(), s);
        }
        assert!(OrderStatus::from_str("nonsense").is_err());
    }

    #[test]
    fn active_states_are_exactly_processing_and_sent() {
        assert!(OrderStatus::Processing.is_active());
        assert!(OrderStatus::Sent.is_active());
        assert!(!OrderStatus::Pending.is_active());
        assert!(!OrderStatus::Filled.is_active());
        assert!(!OrderStatus::Cancelled.is_active());
    }

    #[test]
    fn exchange_status_executed_set() {
        assert!(ExchangeOrderStatus::parse("TRIGGERED").unwrap().is_executed());
        assert!(ExchangeOrderStatus::parse("FINISHED").unwrap().is_executed());
        assert!(ExchangeOrderStatus::parse("FILLED").unwrap().is_executed());
        assert!(!ExchangeOrderStatus::parse("NEW").unwrap().is_executed());
        assert!(ExchangeOrderStatus::parse("WAT").is_err());
    }

    #[test]
    fn side_opposite() {
        assert_eq!(OrderSide::Buy.opposite(), OrderSide::Sell);
        assert_eq!(OrderSide::Sell.opposite(), OrderSide::Buy);
    }

    #[test]
    fn market_kind_serde_is_lowercase() {
        let json = serde_json::to_string(&MarketKind::Futures).unwrap();
        assert_eq!(json, "\"futures\"");
        let back: MarketKind = serde_json::from_str("\"spot\"").unwrap();
        assert_eq!(back, MarketKind::Spot);
    }
}
