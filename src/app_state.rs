// =============================================================================
// Central Application State — construction-time wiring of all subsystems
// =============================================================================
//
// There is no god-object in the core: components receive the narrow
// capabilities they need at construction, and AppState only ties the pieces
// together for the RPC surface and the long-lived loops in main.  Only the
// store gateway and the exchange adapter are shared.
// =============================================================================

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Utc;
use parking_lot::Mutex;
use tokio::sync::{broadcast, watch, Notify};
use tracing::{info, warn};

use crate::cache::layered::{KvTier, SharedKv};
use crate::cache::{LayeredCache, ModelCache, WarmupPool};
use crate::exchange::{ExchangeApi, ExchangeClient};
use crate::health::{FnProbe, HealthChecker};
use crate::market_data::{CandleBuffer, DepthBook, PriceCache, TickerBoard};
use crate::notify::{
    BroadcastSink, Notification, NotificationDispatcher, NotificationSink, RelaySink,
};
use crate::orders::reconciler::OrderReconciler;
use crate::positions::diff_engine::PositionDiffEngine;
use crate::precompute::features::FeatureSet;
use crate::precompute::PrecomputeScheduler;
use crate::runtime_config::RuntimeConfig;
use crate::snapshot::{ChangeDetector, SaveController};
use crate::store::Store;
use crate::strategy::risk::RiskManager;
use crate::strategy::router::{StrategyFactory, StrategyRouter};
use crate::strategy::MarketView;
use crate::sync::supervisor::SyncSupervisor;
use crate::sync::workers::WorkerContext;
use crate::types::{GainerItem, MarketKind};

/// Per-alert cooldown for notifications. Health alerts repeat at most once
/// every thirty minutes; the same gate serves all dedupe keys.
const ALERT_COOLDOWN_MS: i64 = 1_800_000;
/// Candle ring capacity per series.
const CANDLE_RING: usize = 500;
/// Capacity of the notification broadcast toward WebSocket clients.
const NOTIFY_BUFFER: usize = 256;

/// Everything main.rs and the RPC surface need, wired once at boot.
pub struct AppState {
    pub config: RuntimeConfig,
    pub store: Arc<Store>,
    pub exchange: Arc<dyn ExchangeApi>,

    // Market data
    pub prices: Arc<PriceCache>,
    pub candles: Arc<CandleBuffer>,
    pub depth: Arc<DepthBook>,
    pub futures_board: Arc<TickerBoard>,
    pub spot_board: Arc<TickerBoard>,
    pub gainers_wake: Arc<Notify>,

    // Snapshot pipeline
    pub save_controller: Arc<SaveController>,
    pub detector_spot: Mutex<ChangeDetector>,
    pub detector_futures: Mutex<ChangeDetector>,

    // Caches & precompute
    pub model_cache: Arc<ModelCache>,
    pub feature_cache: Arc<LayeredCache<FeatureSet>>,
    pub precompute: Arc<PrecomputeScheduler>,
    pub warmup_pool: Arc<WarmupPool>,

    // Orders & positions
    pub reconciler: Arc<OrderReconciler>,
    pub diff_engine: Arc<PositionDiffEngine>,

    // Strategy execution
    pub strategy_router: Arc<StrategyRouter>,

    // Sync
    pub supervisor: Arc<SyncSupervisor>,

    // Observability
    pub dispatcher: Arc<NotificationDispatcher>,
    pub notify_tx: broadcast::Sender<Notification>,
    pub health: Arc<HealthChecker>,

    // Control
    pub running: AtomicBool,
    pub shutdown_tx: watch::Sender<bool>,
    pub start_time: std::time::Instant,
}

impl AppState {
    /// Wire every subsystem from the runtime config.
    pub fn new(config: RuntimeConfig) -> Result<Arc<Self>> {
        let store = Arc::new(Store::open(&config.db_path)?);

        // Boot hygiene: strategy orders stranded mid-flight are zombies.
        let zombies = store.fail_zombie_orders()?;
        if zombies > 0 {
            warn!(count = zombies, "failed zombie strategy orders at boot");
        }

        let api_key = std::env::var("MERIDIAN_API_KEY").unwrap_or_default();
        let api_secret = std::env::var("MERIDIAN_API_SECRET").unwrap_or_default();
        let exchange_client = Arc::new(ExchangeClient::new(api_key, api_secret));
        let exchange: Arc<dyn ExchangeApi> = exchange_client;

        // Market data handles.
        let prices = Arc::new(PriceCache::new());
        let candles = Arc::new(CandleBuffer::new(CANDLE_RING));
        let depth = Arc::new(DepthBook::new());
        let futures_board = Arc::new(TickerBoard::new(MarketKind::Futures));
        let spot_board = Arc::new(TickerBoard::new(MarketKind::Spot));
        let gainers_wake = Arc::new(Notify::new());

        // Notifications.
        let (notify_tx, _) = broadcast::channel(NOTIFY_BUFFER);
        let sinks: Vec<Arc<dyn NotificationSink>> = vec![
            Arc::new(BroadcastSink::new(notify_tx.clone())),
            Arc::new(RelaySink::email()),
            Arc::new(RelaySink::sms()),
        ];
        let dispatcher = Arc::new(NotificationDispatcher::new(
            config.notification.enabled,
            ALERT_COOLDOWN_MS,
            sinks,
        ));

        // Snapshot pipeline.
        let save_controller = Arc::new(SaveController::new(
            store.clone(),
            config.save_controller.clone(),
        ));
        let detector_spot = Mutex::new(ChangeDetector::new(
            MarketKind::Spot,
            config.change_detection_spot.clone(),
        ));
        let detector_futures = Mutex::new(ChangeDetector::new(
            MarketKind::Futures,
            config.change_detection_futures.clone(),
        ));

        // Layered caches.
        let kv: Arc<dyn KvTier> = Arc::new(SharedKv::new(config.cache.l2_ttl_secs));
        let model_cache = Arc::new(ModelCache::new(
            store.clone(),
            config.cache.clone(),
            Some(kv.clone()),
        ));
        let feature_cache = Arc::new(LayeredCache::new(
            "features",
            config.cache.clone(),
            Some(kv),
        ));
        let warmup_pool = Arc::new(WarmupPool::new(config.cache.warmup_concurrency));

        // Precompute.
        let precompute = Arc::new(PrecomputeScheduler::new(
            store.clone(),
            exchange.clone(),
            model_cache.clone(),
            feature_cache.clone(),
            config.precompute.clone(),
            config.cache.clone(),
            config.watchlist.clone(),
        ));

        // Orders & positions.
        let reconciler = Arc::new(OrderReconciler::new(
            store.clone(),
            exchange.clone(),
            config.reconciler.clone(),
        ));
        let users = monitored_users();
        let diff_engine = Arc::new(PositionDiffEngine::new(
            store.clone(),
            exchange.clone(),
            reconciler.clone(),
            users,
        ));

        // Strategy routing: the factory receives its capabilities exactly
        // once, here.
        let market_view = Arc::new(MarketView {
            prices: prices.clone(),
            candles: candles.clone(),
            depth: depth.clone(),
            kind: MarketKind::Futures,
        });
        let strategy_router = Arc::new(StrategyRouter::new(
            StrategyFactory::new(market_view, RiskManager::new(config.position_ceiling)),
            store.clone(),
        ));

        // Sync supervisor.
        let worker_context = Arc::new(WorkerContext {
            exchange: exchange.clone(),
            store: store.clone(),
            prices: prices.clone(),
            candles: candles.clone(),
            depth: depth.clone(),
            board: futures_board.clone(),
            spot_board: spot_board.clone(),
            gainers_wake: gainers_wake.clone(),
            kind: MarketKind::Futures,
            watchlist: config.watchlist.clone(),
        });
        let supervisor = Arc::new(SyncSupervisor::new(
            config.supervisor.clone(),
            worker_context,
            dispatcher.clone(),
        ));

        // Health probes.
        let mut health = HealthChecker::new(store.clone(), dispatcher.clone());
        {
            let store = store.clone();
            health.register(Arc::new(FnProbe::new("store", move || store.probe())));
        }
        {
            let supervisor = supervisor.clone();
            health.register(Arc::new(FnProbe::new("market-data", move || {
                let stats = supervisor.stats();
                if stats.rest_api_mode {
                    // Degraded but serving.
                    return Ok(());
                }
                anyhow::ensure!(
                    stats.websocket_healthy,
                    "websocket transports unhealthy without REST fallback"
                );
                Ok(())
            })));
        }
        {
            let prices = prices.clone();
            health.register(Arc::new(FnProbe::new("price-cache", move || {
                anyhow::ensure!(!prices.is_empty(), "price cache empty");
                Ok(())
            })));
        }

        let (shutdown_tx, _) = watch::channel(false);

        Ok(Arc::new(Self {
            config,
            store,
            exchange,
            prices,
            candles,
            depth,
            futures_board,
            spot_board,
            gainers_wake,
            save_controller,
            detector_spot,
            detector_futures,
            model_cache,
            feature_cache,
            precompute,
            warmup_pool,
            reconciler,
            diff_engine,
            strategy_router,
            supervisor,
            dispatcher,
            notify_tx,
            health: Arc::new(health),
            running: AtomicBool::new(true),
            shutdown_tx,
            start_time: std::time::Instant::now(),
        }))
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Relaxed)
    }

    pub fn set_running(&self, running: bool) {
        self.running.store(running, Ordering::Relaxed);
        info!(running, "scheduler running flag changed");
    }

    /// Build the current gainers ranking for a kind from its ticker board.
    pub fn build_gainers(&self, kind: MarketKind, limit: usize) -> Vec<GainerItem> {
        let board = match kind {
            MarketKind::Spot => &self.spot_board,
            MarketKind::Futures => &self.futures_board,
        };
        crate::market_data::build_gainers(&board.snapshot(), kind, limit, "ticker-board")
    }

    /// One change-gated snapshot evaluation for `kind`. Returns the new
    /// snapshot id when a save happened. At most one evaluation per kind is
    /// in flight: the caller loop is the only driver.
    pub async fn evaluate_gainers(&self, kind: MarketKind) -> Result<Option<i64>> {
        let now = Utc::now().timestamp_millis();
        let gainers = self.build_gainers(kind, self.config.top_n_gainers);
        if gainers.is_empty() {
            return Ok(None);
        }

        let should_save = {
            let mut detector = match kind {
                MarketKind::Spot => self.detector_spot.lock(),
                MarketKind::Futures => self.detector_futures.lock(),
            };
            detector.has_significant_change(&gainers, now)
        };
        if !should_save {
            return Ok(None);
        }

        let id = self
            .save_controller
            .save_snapshot(kind, gainers.clone(), now)
            .await
            .context("change-gated snapshot save failed")?;

        let mut detector = match kind {
            MarketKind::Spot => self.detector_spot.lock(),
            MarketKind::Futures => self.detector_futures.lock(),
        };
        detector.note_saved(gainers, now);
        Ok(Some(id))
    }

    /// Force a snapshot save regardless of the detector (RPC generate).
    pub async fn force_snapshot(&self, kind: MarketKind, limit: usize) -> Result<i64> {
        let now = Utc::now().timestamp_millis();
        let gainers = self.build_gainers(kind, limit);
        anyhow::ensure!(!gainers.is_empty(), "no tickers observed for {kind}");

        let id = self
            .save_controller
            .save_snapshot(kind, gainers.clone(), now)
            .await?;

        let mut detector = match kind {
            MarketKind::Spot => self.detector_spot.lock(),
            MarketKind::Futures => self.detector_futures.lock(),
        };
        detector.note_saved(gainers, now);
        Ok(id)
    }

    /// Seed detectors from the last persisted snapshots so a restart does
    /// not re-save an unchanged ranking.
    pub fn warm_start_detectors(&self) -> Result<()> {
        for kind in [MarketKind::Spot, MarketKind::Futures] {
            if let Some((header, items)) = self.store.latest_snapshot(kind)? {
                let mut detector = match kind {
                    MarketKind::Spot => self.detector_spot.lock(),
                    MarketKind::Futures => self.detector_futures.lock(),
                };
                detector.seed_previous(items, header.timestamp);
            }
        }
        Ok(())
    }

    pub fn uptime_secs(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }

    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
        self.supervisor.stop();
    }
}

/// Users whose positions are monitored. Comma-separated user ids in the
/// environment; a single default user otherwise.
fn monitored_users() -> Vec<String> {
    std::env::var("MERIDIAN_USERS")
        .ok()
        .map(|raw| {
            raw.split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect::<Vec<_>>()
        })
        .filter(|users| !users.is_empty())
        .unwrap_or_else(|| vec!["default".to_string()])
}
