// =============================================================================
// Sync workers — one per data kind, each with a WebSocket and a REST path
// =============================================================================
//
// The WebSocket path reconnects forever; the REST path polls at
// `base_interval * multiplier`, where the supervisor sets the multiplier
// (1.0 in REST mode, the backoff factor while WebSockets are healthy).
// =============================================================================

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::Result;
use tokio::sync::{watch, Notify};
use tracing::{debug, warn};

use crate::exchange::{stream, ExchangeApi};
use crate::market_data::{CandleBuffer, DepthBook, PriceCache, SeriesKey, TickerBoard};
use crate::store::Store;
use crate::types::MarketKind;

use super::{SyncKind, TransportHealth};

/// Intervals each kline worker keeps in sync.
pub const SYNCED_INTERVALS: [&str; 2] = ["1m", "1h"];
/// Depth levels requested on the REST path.
const DEPTH_LEVELS: u32 = 20;

/// Shared handles one worker operates on.
pub struct WorkerContext {
    pub exchange: Arc<dyn ExchangeApi>,
    pub store: Arc<Store>,
    pub prices: Arc<PriceCache>,
    pub candles: Arc<CandleBuffer>,
    pub depth: Arc<DepthBook>,
    pub board: Arc<TickerBoard>,
    /// Spot-market ticker board, refreshed on the REST path only.
    pub spot_board: Arc<TickerBoard>,
    /// Wakes the change-gated snapshot pipeline.
    pub gainers_wake: Arc<Notify>,
    pub kind: MarketKind,
    pub watchlist: Vec<String>,
}

/// One per-kind worker: transport health plus the supervisor-set REST
/// multiplier.
pub struct SyncWorker {
    pub kind: SyncKind,
    pub health: Arc<TransportHealth>,
    /// f64 bit pattern; read with [`Self::rest_multiplier`].
    multiplier_bits: AtomicU64,
    /// Consecutive REST poll failures, for the both-transports-down alert.
    pub rest_failures: AtomicU64,
}

impl SyncWorker {
    pub fn new(kind: SyncKind) -> Self {
        Self {
            kind,
            health: Arc::new(TransportHealth::new()),
            multiplier_bits: AtomicU64::new(1.0_f64.to_bits()),
            rest_failures: AtomicU64::new(0),
        }
    }

    pub fn rest_multiplier(&self) -> f64 {
        f64::from_bits(self.multiplier_bits.load(Ordering::Relaxed))
    }

    pub fn set_rest_multiplier(&self, multiplier: f64) {
        self.multiplier_bits
            .store(multiplier.to_bits(), Ordering::Relaxed);
    }

    /// Effective REST polling period right now.
    pub fn rest_period(&self) -> tokio::time::Duration {
        let secs = self.kind.base_rest_interval_secs() as f64 * self.rest_multiplier().max(0.1);
        tokio::time::Duration::from_secs_f64(secs)
    }

    /// Run one REST poll for this worker's kind.
    pub async fn rest_poll(&self, cx: &WorkerContext) {
        let result = match self.kind {
            SyncKind::Price => poll_prices(cx).await,
            SyncKind::Kline => poll_klines(cx).await,
            SyncKind::Depth => poll_depth(cx).await,
            SyncKind::Gainers => poll_gainers(cx).await,
        };
        match result {
            Ok(()) => {
                self.rest_failures.store(0, Ordering::Relaxed);
            }
            Err(e) => {
                self.rest_failures.fetch_add(1, Ordering::Relaxed);
                warn!(kind = %self.kind, error = %e, "REST poll failed");
            }
        }
    }

    /// Spawn this worker's WebSocket consumer with a reconnect loop.
    pub fn spawn_ws(self: &Arc<Self>, cx: Arc<WorkerContext>, mut shutdown: watch::Receiver<bool>) {
        let worker = self.clone();
        tokio::spawn(async move {
            loop {
                if *shutdown.borrow() {
                    break;
                }
                let run = worker.run_ws_once(&cx);
                tokio::select! {
                    result = run => {
                        if let Err(e) = result {
                            warn!(kind = %worker.kind, error = %e, "WebSocket transport error — reconnecting in 5s");
                            worker.health.note_failure();
                        }
                    }
                    _ = shutdown.changed() => break,
                }
                tokio::select! {
                    _ = tokio::time::sleep(tokio::time::Duration::from_secs(5)) => {}
                    _ = shutdown.changed() => break,
                }
            }
            worker.health.mark_running(false);
            debug!(kind = %worker.kind, "WebSocket worker stopped");
        });
    }

    /// Spawn this worker's REST polling loop.
    pub fn spawn_rest(
        self: &Arc<Self>,
        cx: Arc<WorkerContext>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let worker = self.clone();
        tokio::spawn(async move {
            loop {
                let period = worker.rest_period();
                tokio::select! {
                    _ = tokio::time::sleep(period) => {
                        worker.rest_poll(&cx).await;
                    }
                    _ = shutdown.changed() => break,
                }
            }
            debug!(kind = %worker.kind, "REST worker stopped");
        });
    }

    async fn run_ws_once(&self, cx: &WorkerContext) -> Result<()> {
        match self.kind {
            SyncKind::Price | SyncKind::Gainers => {
                // Price and gainers share the all-market ticker stream; each
                // worker maintains its own subscription so health is tracked
                // per kind.
                stream::run_ticker_stream(
                    cx.kind,
                    &cx.board,
                    &cx.prices,
                    &cx.gainers_wake,
                    &self.health,
                )
                .await
            }
            SyncKind::Kline => {
                // One connection per (symbol, interval); run them as a set
                // and fail together so reconnection is uniform.
                let mut tasks = Vec::new();
                for symbol in &cx.watchlist {
                    for interval in SYNCED_INTERVALS {
                        let candles = cx.candles.clone();
                        let health = self.health.clone();
                        let symbol = symbol.clone();
                        let kind = cx.kind;
                        tasks.push(tokio::spawn(async move {
                            stream::run_kline_stream(&symbol, kind, interval, &candles, &health)
                                .await
                        }));
                    }
                }
                for task in tasks {
                    task.await??;
                }
                Ok(())
            }
            SyncKind::Depth => {
                let mut tasks = Vec::new();
                for symbol in &cx.watchlist {
                    let depth = cx.depth.clone();
                    let health = self.health.clone();
                    let symbol = symbol.clone();
                    let kind = cx.kind;
                    tasks.push(tokio::spawn(async move {
                        stream::run_depth_stream(&symbol, kind, &depth, &health).await
                    }));
                }
                for task in tasks {
                    task.await??;
                }
                Ok(())
            }
        }
    }
}

// ---------------------------------------------------------------------------
// REST poll implementations
// ---------------------------------------------------------------------------

async fn poll_prices(cx: &WorkerContext) -> Result<()> {
    let tickers = cx.exchange.tickers_24h(cx.kind).await?;
    for t in &tickers {
        cx.prices
            .update(&t.symbol, cx.kind, t.last_price, Some(t.price_change_percent));
    }
    debug!(count = tickers.len(), "prices refreshed over REST");
    Ok(())
}

async fn poll_klines(cx: &WorkerContext) -> Result<()> {
    for symbol in &cx.watchlist {
        for interval in SYNCED_INTERVALS {
            let bars = cx
                .exchange
                .klines(symbol, cx.kind, interval, 100, None, None)
                .await?;
            for bar in &bars {
                cx.candles
                    .update(SeriesKey::new(symbol, cx.kind, interval), bar.clone(), true);
            }
            cx.store.upsert_klines(&bars)?;
        }
    }
    Ok(())
}

async fn poll_depth(cx: &WorkerContext) -> Result<()> {
    for symbol in &cx.watchlist {
        let (bids, asks, update_id) = cx
            .exchange
            .depth_snapshot(symbol, cx.kind, DEPTH_LEVELS)
            .await?;
        cx.depth.update(symbol, cx.kind, &bids, &asks, update_id);
    }
    Ok(())
}

async fn poll_gainers(cx: &WorkerContext) -> Result<()> {
    let tickers = cx.exchange.tickers_24h(cx.kind).await?;
    cx.board.replace_all(tickers);

    // The spot ranking has no WebSocket of its own; it rides this poll.
    let spot = cx.exchange.tickers_24h(MarketKind::Spot).await?;
    cx.spot_board.replace_all(spot);

    cx.gainers_wake.notify_one();
    Ok(())
}
