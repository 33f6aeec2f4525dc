// =============================================================================
// Exchange REST client — HMAC-SHA256 signed requests, regular + algo orders
// =============================================================================
//
// SECURITY: secrets are never logged or serialised.  Signed requests carry
// the API key as a header and a recvWindow to tolerate minor clock drift.
//
// Regular orders live on /fapi/v1/order; trigger-based (algo) orders live on
// /fapi/v1/algo/order with a different schema and the extended status set
// (TRIGGERED / FINISHED).  Spot market data comes from the spot base URL,
// futures market data and all account endpoints from the futures base URL.
// =============================================================================

use std::collections::HashMap;
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result};
use async_trait::async_trait;
use hmac::{Hmac, Mac};
use parking_lot::RwLock;
use reqwest::header::{HeaderMap, HeaderValue};
use sha2::Sha256;
use tracing::{debug, instrument, warn};

use crate::types::{ExchangeOrderStatus, ExchangePosition, Kline, MarketKind, Ticker};

use super::rate_limit::RateLimitGuard;
use super::{ExchangeApi, OrderAck, OrderReport, OrderRequest};

type HmacSha256 = Hmac<Sha256>;

/// Default recv-window sent with every signed request (milliseconds).
const RECV_WINDOW: u64 = 5000;

/// Exchange error code for "order does not exist".
const ERR_UNKNOWN_ORDER: i64 = -2013;

/// API key + secret pair.
#[derive(Clone)]
pub struct Credentials {
    pub api_key: String,
    pub secret: String,
}

/// Signed REST client. Shared across tasks as `Arc<ExchangeClient>`.
pub struct ExchangeClient {
    default_creds: Credentials,
    user_creds: RwLock<HashMap<String, Credentials>>,
    spot_base: String,
    futures_base: String,
    http: reqwest::Client,
    pub limits: RateLimitGuard,
}

impl ExchangeClient {
    // -------------------------------------------------------------------------
    // Construction
    // -------------------------------------------------------------------------

    /// Create a client with default credentials. Per-user keys can be added
    /// with [`Self::add_user_credentials`].
    pub fn new(api_key: impl Into<String>, secret: impl Into<String>) -> Self {
        let spot_base = std::env::var("MERIDIAN_SPOT_BASE")
            .unwrap_or_else(|_| "https://api.binance.com".to_string());
        let futures_base = std::env::var("MERIDIAN_FUTURES_BASE")
            .unwrap_or_else(|_| "https://fapi.binance.com".to_string());

        let http = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(5))
            .build()
            .expect("failed to build reqwest client");

        debug!(%spot_base, %futures_base, "ExchangeClient initialised");

        Self {
            default_creds: Credentials {
                api_key: api_key.into(),
                secret: secret.into(),
            },
            user_creds: RwLock::new(HashMap::new()),
            spot_base,
            futures_base,
            http,
            limits: RateLimitGuard::new(),
        }
    }

    /// Register credentials for a user. Order and position calls for that
    /// user sign with these keys.
    pub fn add_user_credentials(&self, user_id: &str, api_key: &str, secret: &str) {
        self.user_creds.write().insert(
            user_id.to_string(),
            Credentials {
                api_key: api_key.to_string(),
                secret: secret.to_string(),
            },
        );
    }

    fn creds_for(&self, user_id: &str) -> Credentials {
        self.user_creds
            .read()
            .get(user_id)
            .cloned()
            .unwrap_or_else(|| self.default_creds.clone())
    }

    // -------------------------------------------------------------------------
    // Signing helpers
    // -------------------------------------------------------------------------

    fn sign(secret: &str, query: &str) -> String {
        let mut mac =
            HmacSha256::new_from_slice(secret.as_bytes()).expect("HMAC accepts any key size");
        mac.update(query.as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }

    fn timestamp_ms() -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("system clock before UNIX epoch")
            .as_millis() as u64
    }

    fn signed_query(secret: &str, params: &str) -> String {
        let ts = Self::timestamp_ms();
        let base = if params.is_empty() {
            format!("timestamp={ts}&recvWindow={RECV_WINDOW}")
        } else {
            format!("{params}&timestamp={ts}&recvWindow={RECV_WINDOW}")
        };
        let sig = Self::sign(secret, &base);
        format!("{base}&signature={sig}")
    }

    // -------------------------------------------------------------------------
    // Request plumbing
    // -------------------------------------------------------------------------

    /// Send a signed request and parse the JSON body. Non-2xx responses
    /// become errors carrying the body for diagnosis.
    async fn signed_request(
        &self,
        method: reqwest::Method,
        path: &str,
        params: &str,
        creds: &Credentials,
        weight: u32,
    ) -> Result<serde_json::Value> {
        if !self.limits.try_spend(weight) {
            anyhow::bail!("rate-limit ceiling reached for {path}");
        }

        let qs = Self::signed_query(&creds.secret, params);
        let url = format!("{}{}?{}", self.futures_base, path, qs);

        let mut headers = HeaderMap::new();
        if let Ok(val) = HeaderValue::from_str(&creds.api_key) {
            headers.insert("X-MBX-APIKEY", val);
        }

        let resp = self
            .http
            .request(method.clone(), &url)
            .headers(headers)
            .send()
            .await
            .with_context(|| format!("{method} {path} request failed"))?;

        self.limits.note_response_headers(resp.headers());

        let status = resp.status();
        let body: serde_json::Value = resp
            .json()
            .await
            .with_context(|| format!("failed to parse {path} response"))?;

        if !status.is_success() {
            anyhow::bail!("exchange {method} {path} returned {status}: {body}");
        }
        Ok(body)
    }

    /// Send an unsigned (public) request against the base for `kind`.
    async fn public_request(
        &self,
        kind: MarketKind,
        path: &str,
        query: &str,
        weight: u32,
    ) -> Result<serde_json::Value> {
        if !self.limits.try_spend(weight) {
            anyhow::bail!("rate-limit ceiling reached for {path}");
        }

        let base = match kind {
            MarketKind::Spot => &self.spot_base,
            MarketKind::Futures => &self.futures_base,
        };
        let url = if query.is_empty() {
            format!("{base}{path}")
        } else {
            format!("{base}{path}?{query}")
        };

        let resp = self
            .http
            .get(&url)
            .send()
            .await
            .with_context(|| format!("GET {path} request failed"))?;

        self.limits.note_response_headers(resp.headers());

        let status = resp.status();
        let body: serde_json::Value = resp
            .json()
            .await
            .with_context(|| format!("failed to parse {path} response"))?;

        if !status.is_success() {
            anyhow::bail!("exchange GET {path} returned {status}: {body}");
        }
        Ok(body)
    }

    /// Whether an error body is the exchange's "unknown order" rejection.
    fn is_unknown_order(body: &serde_json::Value) -> bool {
        body.get("code").and_then(|c| c.as_i64()) == Some(ERR_UNKNOWN_ORDER)
    }
}

// =============================================================================
// Pure payload parsers (unit-tested without network)
// =============================================================================

/// Parse a JSON value that may be either a decimal string or a number.
pub(crate) fn parse_decimal(val: &serde_json::Value) -> Result<f64> {
    if let Some(s) = val.as_str() {
        s.parse::<f64>()
            .with_context(|| format!("failed to parse '{s}' as f64"))
    } else if let Some(n) = val.as_f64() {
        Ok(n)
    } else {
        anyhow::bail!("expected decimal string or number, got: {val}")
    }
}

/// Parse one row of the klines array-of-arrays response.
///
/// Indices: [0] openTime, [1] open, [2] high, [3] low, [4] close,
/// [5] volume, [6] closeTime, [7] quoteAssetVolume, [8] numberOfTrades.
pub(crate) fn parse_kline_row(
    symbol: &str,
    kind: MarketKind,
    interval: &str,
    row: &serde_json::Value,
) -> Result<Kline> {
    let arr = row.as_array().context("kline entry is not an array")?;
    if arr.len() < 9 {
        anyhow::bail!("kline entry has {} elements, expected >= 9", arr.len());
    }

    Ok(Kline {
        symbol: symbol.to_string(),
        kind,
        interval: interval.to_string(),
        open_time: arr[0].as_i64().context("missing openTime")?,
        open: parse_decimal(&arr[1])?,
        high: parse_decimal(&arr[2])?,
        low: parse_decimal(&arr[3])?,
        close: parse_decimal(&arr[4])?,
        volume: parse_decimal(&arr[5])?,
        quote_volume: parse_decimal(&arr[7]).ok(),
        trade_count: arr[8].as_u64(),
    })
}

/// Parse one 24h ticker object.
pub(crate) fn parse_ticker(kind: MarketKind, obj: &serde_json::Value) -> Result<Ticker> {
    Ok(Ticker {
        symbol: obj["symbol"]
            .as_str()
            .context("ticker missing symbol")?
            .to_string(),
        kind,
        last_price: parse_decimal(&obj["lastPrice"])?,
        price_change_percent: parse_decimal(&obj["priceChangePercent"])?,
        volume_24h: parse_decimal(&obj["volume"])?,
        quote_volume_24h: parse_decimal(&obj["quoteVolume"]).unwrap_or(0.0),
        event_time: obj["closeTime"].as_i64().unwrap_or(0),
    })
}

/// Parse a regular-order report.
pub(crate) fn parse_order_report(obj: &serde_json::Value) -> Result<OrderReport> {
    let status_str = obj["status"].as_str().context("order missing status")?;
    Ok(OrderReport {
        client_order_id: obj["clientOrderId"]
            .as_str()
            .unwrap_or_default()
            .to_string(),
        exchange_order_id: obj["orderId"]
            .as_i64()
            .map(|n| n.to_string())
            .or_else(|| obj["orderId"].as_str().map(str::to_string))
            .unwrap_or_default(),
        status: ExchangeOrderStatus::parse(status_str)?,
        executed_qty: parse_decimal(&obj["executedQty"]).unwrap_or(0.0),
        avg_price: parse_decimal(&obj["avgPrice"])
            .or_else(|_| parse_decimal(&obj["price"]))
            .unwrap_or(0.0),
        update_time: obj["updateTime"].as_i64().unwrap_or(0),
    })
}

/// Parse an algo-order report (distinct schema: clientAlgoId / algoStatus).
pub(crate) fn parse_algo_report(obj: &serde_json::Value) -> Result<OrderReport> {
    let status_str = obj["algoStatus"]
        .as_str()
        .context("algo order missing algoStatus")?;
    Ok(OrderReport {
        client_order_id: obj["clientAlgoId"]
            .as_str()
            .unwrap_or_default()
            .to_string(),
        exchange_order_id: obj["algoId"]
            .as_i64()
            .map(|n| n.to_string())
            .or_else(|| obj["algoId"].as_str().map(str::to_string))
            .unwrap_or_default(),
        status: ExchangeOrderStatus::parse(status_str)?,
        executed_qty: parse_decimal(&obj["executedQty"]).unwrap_or(0.0),
        avg_price: parse_decimal(&obj["avgPrice"]).unwrap_or(0.0),
        update_time: obj["updateTime"].as_i64().unwrap_or(0),
    })
}

/// Parse one row of the position-risk response.
pub(crate) fn parse_position(obj: &serde_json::Value) -> Result<ExchangePosition> {
    Ok(ExchangePosition {
        symbol: obj["symbol"]
            .as_str()
            .context("position missing symbol")?
            .to_string(),
        position_amt: parse_decimal(&obj["positionAmt"])?,
        entry_price: parse_decimal(&obj["entryPrice"]).unwrap_or(0.0),
        mark_price: parse_decimal(&obj["markPrice"]).unwrap_or(0.0),
        leverage: parse_decimal(&obj["leverage"]).unwrap_or(0.0),
        update_time: obj["updateTime"].as_i64().unwrap_or(0),
    })
}

// =============================================================================
// ExchangeApi implementation
// =============================================================================

#[async_trait]
impl ExchangeApi for ExchangeClient {
    #[instrument(skip(self, request), fields(symbol = %request.symbol), name = "exchange::place_order")]
    async fn place_order(&self, user_id: &str, request: &OrderRequest) -> Result<OrderAck> {
        if !self.limits.try_place_order() {
            anyhow::bail!("order rate ceiling reached");
        }
        let creds = self.creds_for(user_id);

        let (path, body) = if request.order_type.is_algo() {
            let trigger = request
                .trigger_price
                .context("algo order requires trigger_price")?;
            let mut params = format!(
                "symbol={}&side={}&algoType={}&quantity={}&triggerPrice={}&clientAlgoId={}",
                request.symbol,
                request.side.as_str(),
                request.order_type.as_str(),
                request.quantity,
                trigger,
                request.client_order_id,
            );
            if request.reduce_only {
                params.push_str("&reduceOnly=true");
            }
            ("/fapi/v1/algo/order", params)
        } else {
            let mut params = format!(
                "symbol={}&side={}&type={}&quantity={}&newClientOrderId={}",
                request.symbol,
                request.side.as_str(),
                request.order_type.as_str(),
                request.quantity,
                request.client_order_id,
            );
            if let Some(price) = request.price {
                params.push_str(&format!("&price={price}&timeInForce=GTC"));
            }
            if request.reduce_only {
                params.push_str("&reduceOnly=true");
            }
            ("/fapi/v1/order", params)
        };

        let body = self
            .signed_request(reqwest::Method::POST, path, &body, &creds, 1)
            .await?;

        let report = if request.order_type.is_algo() {
            parse_algo_report(&body)?
        } else {
            parse_order_report(&body)?
        };

        debug!(symbol = %request.symbol, order_id = %report.exchange_order_id, "order placed");
        Ok(OrderAck {
            exchange_order_id: report.exchange_order_id,
            status: report.status,
        })
    }

    #[instrument(skip(self), name = "exchange::cancel_order")]
    async fn cancel_order(
        &self,
        user_id: &str,
        symbol: &str,
        client_order_id: &str,
    ) -> Result<()> {
        let creds = self.creds_for(user_id);
        let params = format!("symbol={symbol}&origClientOrderId={client_order_id}");
        self.signed_request(reqwest::Method::DELETE, "/fapi/v1/order", &params, &creds, 1)
            .await?;
        debug!(symbol, client_order_id, "order cancelled");
        Ok(())
    }

    #[instrument(skip(self), name = "exchange::cancel_algo_order")]
    async fn cancel_algo_order(
        &self,
        user_id: &str,
        symbol: &str,
        client_order_id: &str,
    ) -> Result<()> {
        let creds = self.creds_for(user_id);
        let params = format!("symbol={symbol}&clientAlgoId={client_order_id}");
        self.signed_request(
            reqwest::Method::DELETE,
            "/fapi/v1/algo/order",
            &params,
            &creds,
            1,
        )
        .await?;
        debug!(symbol, client_order_id, "algo order cancelled");
        Ok(())
    }

    #[instrument(skip(self), name = "exchange::query_order")]
    async fn query_order(
        &self,
        user_id: &str,
        symbol: &str,
        client_order_id: &str,
    ) -> Result<Option<OrderReport>> {
        let creds = self.creds_for(user_id);
        let params = format!("symbol={symbol}&origClientOrderId={client_order_id}");
        match self
            .signed_request(reqwest::Method::GET, "/fapi/v1/order", &params, &creds, 1)
            .await
        {
            Ok(body) => Ok(Some(parse_order_report(&body)?)),
            Err(e) => {
                // "Unknown order" is a definitive miss, not a transport error.
                if let Some(body) = extract_error_body(&e) {
                    if Self::is_unknown_order(&body) {
                        return Ok(None);
                    }
                }
                Err(e)
            }
        }
    }

    #[instrument(skip(self), name = "exchange::query_algo_order")]
    async fn query_algo_order(
        &self,
        user_id: &str,
        symbol: &str,
        client_order_id: &str,
    ) -> Result<Option<OrderReport>> {
        let creds = self.creds_for(user_id);
        let params = format!("symbol={symbol}&clientAlgoId={client_order_id}");
        match self
            .signed_request(
                reqwest::Method::GET,
                "/fapi/v1/algo/order",
                &params,
                &creds,
                1,
            )
            .await
        {
            Ok(body) => Ok(Some(parse_algo_report(&body)?)),
            Err(e) => {
                if let Some(body) = extract_error_body(&e) {
                    if Self::is_unknown_order(&body) {
                        return Ok(None);
                    }
                }
                Err(e)
            }
        }
    }

    #[instrument(skip(self), name = "exchange::positions")]
    async fn positions(&self, user_id: &str) -> Result<Vec<ExchangePosition>> {
        let creds = self.creds_for(user_id);
        let body = self
            .signed_request(reqwest::Method::GET, "/fapi/v2/positionRisk", "", &creds, 5)
            .await?;

        let rows = body.as_array().context("positionRisk is not an array")?;
        let mut positions = Vec::new();
        for row in rows {
            let pos = parse_position(row)?;
            if pos.position_amt.abs() > f64::EPSILON {
                positions.push(pos);
            }
        }
        debug!(user_id, count = positions.len(), "positions fetched");
        Ok(positions)
    }

    #[instrument(skip(self), name = "exchange::klines")]
    async fn klines(
        &self,
        symbol: &str,
        kind: MarketKind,
        interval: &str,
        limit: u32,
        start_time: Option<i64>,
        end_time: Option<i64>,
    ) -> Result<Vec<Kline>> {
        let path = match kind {
            MarketKind::Spot => "/api/v3/klines",
            MarketKind::Futures => "/fapi/v1/klines",
        };
        let mut query = format!("symbol={symbol}&interval={interval}&limit={limit}");
        if let Some(start) = start_time {
            query.push_str(&format!("&startTime={start}"));
        }
        if let Some(end) = end_time {
            query.push_str(&format!("&endTime={end}"));
        }

        let body = self.public_request(kind, path, &query, 2).await?;
        let rows = body.as_array().context("klines response is not an array")?;

        let mut bars = Vec::with_capacity(rows.len());
        for row in rows {
            match parse_kline_row(symbol, kind, interval, row) {
                Ok(bar) => bars.push(bar),
                Err(e) => warn!(error = %e, "skipping malformed kline row"),
            }
        }
        debug!(symbol, interval, count = bars.len(), "klines fetched");
        Ok(bars)
    }

    #[instrument(skip(self), name = "exchange::tickers_24h")]
    async fn tickers_24h(&self, kind: MarketKind) -> Result<Vec<Ticker>> {
        let path = match kind {
            MarketKind::Spot => "/api/v3/ticker/24hr",
            MarketKind::Futures => "/fapi/v1/ticker/24hr",
        };
        let body = self.public_request(kind, path, "", 40).await?;
        let rows = body.as_array().context("ticker response is not an array")?;

        let mut tickers = Vec::with_capacity(rows.len());
        for row in rows {
            match parse_ticker(kind, row) {
                Ok(t) => tickers.push(t),
                Err(e) => warn!(error = %e, "skipping malformed ticker"),
            }
        }
        debug!(kind = %kind, count = tickers.len(), "tickers fetched");
        Ok(tickers)
    }

    #[instrument(skip(self), name = "exchange::depth_snapshot")]
    async fn depth_snapshot(
        &self,
        symbol: &str,
        kind: MarketKind,
        limit: u32,
    ) -> Result<(Vec<(f64, f64)>, Vec<(f64, f64)>, u64)> {
        let path = match kind {
            MarketKind::Spot => "/api/v3/depth",
            MarketKind::Futures => "/fapi/v1/depth",
        };
        let query = format!("symbol={symbol}&limit={limit}");
        let body = self.public_request(kind, path, &query, 5).await?;

        let parse_levels = |key: &str| -> Result<Vec<(f64, f64)>> {
            let rows = body[key]
                .as_array()
                .with_context(|| format!("depth missing {key}"))?;
            rows.iter()
                .map(|row| {
                    let price = parse_decimal(&row[0])?;
                    let qty = parse_decimal(&row[1])?;
                    Ok((price, qty))
                })
                .collect()
        };

        let update_id = body["lastUpdateId"].as_u64().unwrap_or(0);
        Ok((parse_levels("bids")?, parse_levels("asks")?, update_id))
    }

    #[instrument(skip(self), name = "exchange::mark_price")]
    async fn mark_price(&self, symbol: &str) -> Result<f64> {
        let query = format!("symbol={symbol}");
        let body = self
            .public_request(MarketKind::Futures, "/fapi/v1/premiumIndex", &query, 1)
            .await?;
        parse_decimal(&body["markPrice"]).context("premiumIndex missing markPrice")
    }
}

/// Best-effort extraction of the JSON error body embedded in an error message
/// produced by [`ExchangeClient::signed_request`].
fn extract_error_body(err: &anyhow::Error) -> Option<serde_json::Value> {
    let text = err.to_string();
    let start = text.find('{')?;
    serde_json::from_str(&text[start..]).ok()
}

impl std::fmt::Debug for ExchangeClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExchangeClient")
            .field("api_key", &"<redacted>")
            .field("secret", &"<redacted>")
            .field("spot_base", &self.spot_base)
            .field("futures_base", &self.futures_base)
            .finish()
    }
}
