// =============================================================================
// Exchange WebSocket streams — ticker / kline / depth consumers
// =============================================================================
//
// Stream functions run until disconnect and return so the owning worker can
// reconnect.  Frame callbacks only mutate in-memory caches and wake the
// snapshot pipeline; they never perform I/O.
// =============================================================================

use std::sync::Arc;

use anyhow::{Context, Result};
use futures_util::StreamExt;
use tokio::sync::Notify;
use tokio_tungstenite::connect_async;
use tracing::{debug, error, info, warn};

use crate::market_data::{CandleBuffer, DepthBook, PriceCache, SeriesKey, TickerBoard};
use crate::sync::TransportHealth;
use crate::types::{Kline, MarketKind, Ticker};

/// WebSocket base for a market kind, overridable for testing.
fn ws_base(kind: MarketKind) -> String {
    match kind {
        MarketKind::Spot => std::env::var("MERIDIAN_SPOT_WS")
            .unwrap_or_else(|_| "wss://stream.binance.com:9443".to_string()),
        MarketKind::Futures => std::env::var("MERIDIAN_FUTURES_WS")
            .unwrap_or_else(|_| "wss://fstream.binance.com".to_string()),
    }
}

// ---------------------------------------------------------------------------
// All-market ticker stream
// ---------------------------------------------------------------------------

/// Consume the all-market 24h ticker stream for `kind`.
///
/// Each frame is an array of tickers for symbols whose stats changed; the
/// callback upserts the ticker board, refreshes the price cache, and wakes
/// the gainers pipeline.
pub async fn run_ticker_stream(
    kind: MarketKind,
    board: &Arc<TickerBoard>,
    prices: &Arc<PriceCache>,
    wake: &Arc<Notify>,
    health: &Arc<TransportHealth>,
) -> Result<()> {
    let url = format!("{}/ws/!ticker@arr", ws_base(kind));
    info!(url = %url, kind = %kind, "connecting to ticker WebSocket");

    let (ws_stream, _response) = connect_async(&url)
        .await
        .context("failed to connect to ticker WebSocket")?;
    info!(kind = %kind, "ticker WebSocket connected");
    health.mark_running(true);

    let (_write, mut read) = ws_stream.split();

    let result = loop {
        match read.next().await {
            Some(Ok(msg)) => {
                if let tokio_tungstenite::tungstenite::Message::Text(text) = msg {
                    match parse_ticker_frame(kind, &text) {
                        Ok(tickers) => {
                            for t in tickers {
                                prices.update(
                                    &t.symbol,
                                    kind,
                                    t.last_price,
                                    Some(t.price_change_percent),
                                );
                                board.upsert(t);
                            }
                            health.note_message();
                            wake.notify_one();
                        }
                        Err(e) => {
                            health.note_failure();
                            warn!(error = %e, "failed to parse ticker frame");
                        }
                    }
                }
            }
            Some(Err(e)) => {
                error!(kind = %kind, error = %e, "ticker WebSocket read error");
                break Err(e.into());
            }
            None => {
                warn!(kind = %kind, "ticker WebSocket stream ended");
                break Ok(());
            }
        }
    };

    health.mark_running(false);
    result
}

/// Parse one all-market ticker frame (array of ticker objects).
fn parse_ticker_frame(kind: MarketKind, text: &str) -> Result<Vec<Ticker>> {
    let root: serde_json::Value =
        serde_json::from_str(text).context("failed to parse ticker JSON")?;
    let rows = root.as_array().context("ticker frame is not an array")?;

    let mut tickers = Vec::with_capacity(rows.len());
    for row in rows {
        let symbol = row["s"].as_str().context("missing field s")?.to_uppercase();
        tickers.push(Ticker {
            symbol,
            kind,
            last_price: parse_frame_f64(&row["c"], "c")?,
            price_change_percent: parse_frame_f64(&row["P"], "P")?,
            volume_24h: parse_frame_f64(&row["v"], "v")?,
            quote_volume_24h: parse_frame_f64(&row["q"], "q").unwrap_or(0.0),
            event_time: row["E"].as_i64().unwrap_or(0),
        });
    }
    Ok(tickers)
}

// ---------------------------------------------------------------------------
// Kline stream
// ---------------------------------------------------------------------------

/// Consume the kline stream for one (symbol, kind, interval) series and feed
/// bars into `buffer`.
pub async fn run_kline_stream(
    symbol: &str,
    kind: MarketKind,
    interval: &str,
    buffer: &Arc<CandleBuffer>,
    health: &Arc<TransportHealth>,
) -> Result<()> {
    let lower = symbol.to_lowercase();
    let url = format!("{}/ws/{lower}@kline_{interval}", ws_base(kind));
    info!(url = %url, symbol, interval, "connecting to kline WebSocket");

    let (ws_stream, _response) = connect_async(&url)
        .await
        .context("failed to connect to kline WebSocket")?;
    info!(symbol, interval, "kline WebSocket connected");
    health.mark_running(true);

    let (_write, mut read) = ws_stream.split();

    let result = loop {
        match read.next().await {
            Some(Ok(msg)) => {
                if let tokio_tungstenite::tungstenite::Message::Text(text) = msg {
                    match parse_kline_frame(kind, &text) {
                        Ok((key, bar, is_closed)) => {
                            debug!(key = %key, close = bar.close, is_closed, "bar update");
                            buffer.update(key, bar, is_closed);
                            health.note_message();
                        }
                        Err(e) => {
                            health.note_failure();
                            warn!(error = %e, "failed to parse kline frame");
                        }
                    }
                }
            }
            Some(Err(e)) => {
                error!(symbol, error = %e, "kline WebSocket read error");
                break Err(e.into());
            }
            None => {
                warn!(symbol, interval, "kline WebSocket stream ended");
                break Ok(());
            }
        }
    };

    health.mark_running(false);
    result
}

/// Parse a kline frame. Supports both the combined-stream envelope and the
/// direct single-stream payload.
fn parse_kline_frame(kind: MarketKind, text: &str) -> Result<(SeriesKey, Kline, bool)> {
    let root: serde_json::Value =
        serde_json::from_str(text).context("failed to parse kline JSON")?;

    let data = if root.get("data").is_some() {
        &root["data"]
    } else {
        &root
    };

    let symbol = data["s"].as_str().context("missing field s")?.to_uppercase();
    let k = &data["k"];
    let interval = k["i"].as_str().context("missing field k.i")?.to_string();

    let bar = Kline {
        symbol: symbol.clone(),
        kind,
        interval: interval.clone(),
        open_time: k["t"].as_i64().context("missing field k.t")?,
        open: parse_frame_f64(&k["o"], "k.o")?,
        high: parse_frame_f64(&k["h"], "k.h")?,
        low: parse_frame_f64(&k["l"], "k.l")?,
        close: parse_frame_f64(&k["c"], "k.c")?,
        volume: parse_frame_f64(&k["v"], "k.v")?,
        quote_volume: parse_frame_f64(&k["q"], "k.q").ok(),
        trade_count: k["n"].as_u64(),
    };
    let is_closed = k["x"].as_bool().context("missing field k.x")?;

    Ok((
        SeriesKey {
            symbol,
            kind,
            interval,
        },
        bar,
        is_closed,
    ))
}

// ---------------------------------------------------------------------------
// Depth stream
// ---------------------------------------------------------------------------

/// Consume the partial-depth stream (top 20 levels) for one symbol.
pub async fn run_depth_stream(
    symbol: &str,
    kind: MarketKind,
    book: &Arc<DepthBook>,
    health: &Arc<TransportHealth>,
) -> Result<()> {
    let lower = symbol.to_lowercase();
    let url = format!("{}/ws/{lower}@depth20@100ms", ws_base(kind));
    info!(url = %url, symbol, "connecting to depth WebSocket");

    let (ws_stream, _response) = connect_async(&url)
        .await
        .context("failed to connect to depth WebSocket")?;
    info!(symbol, "depth WebSocket connected");
    health.mark_running(true);

    let (_write, mut read) = ws_stream.split();

    let result = loop {
        match read.next().await {
            Some(Ok(msg)) => {
                if let tokio_tungstenite::tungstenite::Message::Text(text) = msg {
                    match parse_depth_frame(&text) {
                        Ok((bids, asks, update_id)) => {
                            book.update(symbol, kind, &bids, &asks, update_id);
                            health.note_message();
                        }
                        Err(e) => {
                            health.note_failure();
                            warn!(error = %e, "failed to parse depth frame");
                        }
                    }
                }
            }
            Some(Err(e)) => {
                error!(symbol, error = %e, "depth WebSocket read error");
                break Err(e.into());
            }
            None => {
                warn!(symbol, "depth WebSocket stream ended");
                break Ok(());
            }
        }
    };

    health.mark_running(false);
    result
}

/// Parse a partial-depth frame into (bids, asks, update_id) level vectors.
fn parse_depth_frame(text: &str) -> Result<(Vec<(f64, f64)>, Vec<(f64, f64)>, u64)> {
    let root: serde_json::Value =
        serde_json::from_str(text).context("failed to parse depth JSON")?;

    let update_id = root["lastUpdateId"]
        .as_u64()
        .or_else(|| root["u"].as_u64())
        .context("missing update id")?;

    let parse_levels = |key: &str| -> Result<Vec<(f64, f64)>> {
        let rows = root[key].as_array().with_context(|| format!("missing field {key}"))?;
        let mut levels = Vec::with_capacity(rows.len());
        for row in rows {
            let price = row
                .get(0)
                .and_then(|v| v.as_str())
                .and_then(|s| s.parse::<f64>().ok())
                .with_context(|| format!("bad price level in {key}"))?;
            let qty = row
                .get(1)
                .and_then(|v| v.as_str())
                .and_then(|s| s.parse::<f64>().ok())
                .with_context(|| format!("bad qty level in {key}"))?;
            levels.push((price, qty));
        }
        Ok(levels)
    };

    Ok((parse_levels("bids")?, parse_levels("asks")?, update_id))
}

/// Frame values arrive as decimal strings; tolerate plain numbers too.
fn parse_frame_f64(val: &serde_json::Value, name: &str) -> Result<f64> {
    match val {
        serde_json::Value::String(s) => s
            .parse::<f64>()
            .with_context(|| format!("failed to parse {name} as f64: {s}")),
        serde_json::Value::Number(n) => n
            .as_f64()
            .with_context(|| format!("field {name} is not a valid f64")),
        _ => anyhow::bail!("field {name} has unexpected JSON type"),
    }
}
