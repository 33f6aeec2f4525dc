// =============================================================================
// Precompute Scheduler — periodic feature and model refresh with fresh-skip
// =============================================================================
//
// The model loop walks the watchlist x model-type cross product every cycle.
// An entry that is still fresh in any cache layer is skipped; the rest are
// trained under a bounded semaphore.  A key that keeps failing backs off
// exponentially without ever blocking the scheduler.  Feature sets follow the
// same shape on a faster cadence.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Utc;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::{watch, Semaphore};
use tracing::{debug, info, warn};

use crate::cache::{LayeredCache, ModelCache};
use crate::exchange::ExchangeApi;
use crate::precompute::features::{FeatureSet, FeatureSupervisor};
use crate::precompute::model::{self, ModelType, MIN_TRAINING_SAMPLES, WARMUP_BARS};
use crate::runtime_config::{CacheConfig, PrecomputeConfig};
use crate::store::Store;
use crate::types::MarketKind;

/// Interval of the bars models train on.
const TRAINING_INTERVAL: &str = "1h";
/// Extra bars requested beyond the bare minimum.
const HISTORY_SLACK: usize = 100;
/// Initial backoff after a failed training, milliseconds.
const BACKOFF_BASE_MS: i64 = 120_000;
/// Backoff ceiling, milliseconds.
const BACKOFF_CAP_MS: i64 = 3_600_000;

#[derive(Debug, Clone, Default)]
struct BackoffState {
    failures: u32,
    next_attempt_ms: i64,
}

/// Counters for the stats endpoint.
#[derive(Debug, Clone, Default, Serialize)]
pub struct PrecomputeStats {
    pub model_cycles: u64,
    pub models_trained: u64,
    pub models_skipped_fresh: u64,
    pub models_failed: u64,
    pub feature_cycles: u64,
    pub feature_sets_computed: u64,
    pub history_backfills: u64,
}

/// Owns the periodic precompute loops.
pub struct PrecomputeScheduler {
    store: Arc<Store>,
    exchange: Arc<dyn ExchangeApi>,
    models: Arc<ModelCache>,
    features: Arc<LayeredCache<FeatureSet>>,
    supervisor: FeatureSupervisor,
    config: PrecomputeConfig,
    cache_config: CacheConfig,
    watchlist: Vec<String>,
    training_permits: Arc<Semaphore>,
    backoff: Mutex<HashMap<String, BackoffState>>,
    stats: Mutex<PrecomputeStats>,
}

impl PrecomputeScheduler {
    pub fn new(
        store: Arc<Store>,
        exchange: Arc<dyn ExchangeApi>,
        models: Arc<ModelCache>,
        features: Arc<LayeredCache<FeatureSet>>,
        config: PrecomputeConfig,
        cache_config: CacheConfig,
        watchlist: Vec<String>,
    ) -> Self {
        let permits = config.max_training_concurrency.max(1);
        Self {
            store,
            exchange,
            models,
            features,
            supervisor: FeatureSupervisor::new(config.max_extractor_concurrency),
            config,
            cache_config,
            watchlist,
            training_permits: Arc::new(Semaphore::new(permits)),
            backoff: Mutex::new(HashMap::new()),
            stats: Mutex::new(PrecomputeStats::default()),
        }
    }

    /// Load persisted artefacts into L1. Called once before the loops start.
    pub fn preload(&self) -> Result<usize> {
        self.models.preload(Utc::now().timestamp_millis())
    }

    /// Spawn the model and feature loops; they stop when `shutdown` flips.
    pub fn spawn_loops(self: &Arc<Self>, shutdown: watch::Receiver<bool>) {
        let scheduler = self.clone();
        let mut model_shutdown = shutdown.clone();
        tokio::spawn(async move {
            let period =
                tokio::time::Duration::from_secs(scheduler.config.model_pretrain_interval_secs);
            let mut ticker = tokio::time::interval(period);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        scheduler.pretrain_cycle().await;
                    }
                    _ = model_shutdown.changed() => {
                        info!("model pretrain loop stopping");
                        break;
                    }
                }
            }
        });

        let scheduler = self.clone();
        let mut feature_shutdown = shutdown;
        tokio::spawn(async move {
            let period =
                tokio::time::Duration::from_secs(scheduler.config.feature_compute_interval_secs);
            let mut ticker = tokio::time::interval(period);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        scheduler.feature_cycle().await;
                    }
                    _ = feature_shutdown.changed() => {
                        info!("feature compute loop stopping");
                        break;
                    }
                }
            }
        });
    }

    // -------------------------------------------------------------------------
    // Model pretraining
    // -------------------------------------------------------------------------

    /// One pass over watchlist x model types. Trainings run concurrently,
    /// bounded by the training semaphore.
    pub async fn pretrain_cycle(self: &Arc<Self>) {
        let now = Utc::now().timestamp_millis();
        self.stats.lock().model_cycles += 1;

        let mut tasks = Vec::new();
        for symbol in &self.watchlist {
            for model_type in ModelType::ALL {
                let key = format!("{symbol}:{model_type}");

                if !self.backoff_expired(&key, now) {
                    debug!(key = %key, "skipping: in backoff");
                    continue;
                }
                if self.models.get(symbol, model_type.as_str(), now).is_some() {
                    self.stats.lock().models_skipped_fresh += 1;
                    continue;
                }

                tasks.push((symbol.clone(), model_type, key));
            }
        }

        let mut handles = Vec::with_capacity(tasks.len());
        for (symbol, model_type, key) in tasks {
            let scheduler = self.clone();
            handles.push(tokio::spawn(async move {
                let _permit = scheduler
                    .training_permits
                    .clone()
                    .acquire_owned()
                    .await
                    .expect("training semaphore closed");

                match scheduler.train_one(&symbol, model_type).await {
                    Ok(trained) => {
                        scheduler.clear_backoff(&key);
                        scheduler.stats.lock().models_trained += 1;
                        info!(
                            symbol = %symbol,
                            model_type = %model_type,
                            accuracy = trained.accuracy,
                            samples = trained.samples,
                            "model pretrained"
                        );
                    }
                    Err(e) => {
                        scheduler.record_failure(&key, now);
                        scheduler.stats.lock().models_failed += 1;
                        warn!(symbol = %symbol, model_type = %model_type, error = %e, "model training failed");
                    }
                }
            }));
        }
        for handle in handles {
            let _ = handle.await;
        }
    }

    async fn train_one(&self, symbol: &str, model_type: ModelType) -> Result<model::TrainedModel> {
        let bars = self.ensure_history(symbol, model_type).await?;
        let trained_at = Utc::now().timestamp_millis();
        let max_age_ms = (self.cache_config.l3_ttl_secs as i64) * 1000;

        let symbol_owned = symbol.to_string();
        let trained = tokio::task::spawn_blocking(move || {
            model::train_model(&symbol_owned, model_type, &bars, trained_at, max_age_ms)
        })
        .await
        .context("training task panicked")??;

        self.models.put(&trained.stored, trained_at)?;
        Ok(trained)
    }

    /// Load enough local history to train; backfill from the exchange and
    /// upsert (deduplicated by series key) when the store falls short.
    async fn ensure_history(
        &self,
        symbol: &str,
        model_type: ModelType,
    ) -> Result<Vec<crate::types::Kline>> {
        let needed = MIN_TRAINING_SAMPLES + WARMUP_BARS + model_type.horizon_bars() + HISTORY_SLACK;

        let local = self.store.load_klines(
            symbol,
            MarketKind::Futures,
            TRAINING_INTERVAL,
            needed,
        )?;
        if local.len() >= needed {
            return Ok(local);
        }

        debug!(
            symbol,
            have = local.len(),
            needed,
            "backfilling extended kline history"
        );
        self.stats.lock().history_backfills += 1;

        let fetched = self
            .exchange
            .klines(
                symbol,
                MarketKind::Futures,
                TRAINING_INTERVAL,
                needed as u32,
                None,
                None,
            )
            .await
            .context("extended history fetch failed")?;
        self.store.upsert_klines(&fetched)?;

        let reloaded =
            self.store
                .load_klines(symbol, MarketKind::Futures, TRAINING_INTERVAL, needed)?;
        Ok(reloaded)
    }

    // -------------------------------------------------------------------------
    // Feature computation
    // -------------------------------------------------------------------------

    /// One feature pass over the watchlist. Entries still fresh within the
    /// compute cadence are skipped.
    pub async fn feature_cycle(&self) {
        let now = Utc::now().timestamp_millis();
        self.stats.lock().feature_cycles += 1;

        let freshness_ms = (self.config.feature_compute_interval_secs as i64) * 1000;

        for symbol in &self.watchlist {
            let key = format!("features:{symbol}");
            if self.features.get(&key, now, Some(freshness_ms)).is_some() {
                continue;
            }

            let bars = match self.store.load_klines(
                symbol,
                MarketKind::Futures,
                TRAINING_INTERVAL,
                150,
            ) {
                Ok(bars) if !bars.is_empty() => bars,
                Ok(_) => {
                    debug!(symbol, "no local bars — skipping feature set");
                    continue;
                }
                Err(e) => {
                    warn!(symbol, error = %e, "failed to load bars for features");
                    continue;
                }
            };

            let set = self
                .supervisor
                .extract(symbol, Arc::new(bars), now)
                .await;
            let quality = set.quality.overall;
            self.features.put(&key, set, now, None, now);
            self.stats.lock().feature_sets_computed += 1;
            debug!(symbol, quality, "feature set materialised");
        }
    }

    pub fn stats(&self) -> PrecomputeStats {
        self.stats.lock().clone()
    }

    // -------------------------------------------------------------------------
    // Backoff bookkeeping
    // -------------------------------------------------------------------------

    fn backoff_expired(&self, key: &str, now_ms: i64) -> bool {
        self.backoff
            .lock()
            .get(key)
            .map_or(true, |s| now_ms >= s.next_attempt_ms)
    }

    fn record_failure(&self, key: &str, now_ms: i64) {
        let mut map = self.backoff.lock();
        let state = map.entry(key.to_string()).or_default();
        state.failures += 1;
        let delay = (BACKOFF_BASE_MS << (state.failures.min(6) - 1)).min(BACKOFF_CAP_MS);
        state.next_attempt_ms = now_ms + delay;
    }

    fn clear_backoff(&self, key: &str) {
        self.backoff.lock().remove(key);
    }
}
