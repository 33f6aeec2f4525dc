// =============================================================================
// Model Cache — L1/L2 over the durable ml_models table (L3)
// =============================================================================
//
// Lookups walk L1 -> L2 -> L3 and populate upward.  A model whose
// `expires_at` has passed is never returned from any layer; the caller sees
// a miss and schedules a retrain.
// =============================================================================

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::Result;
use tracing::{debug, info, warn};

use crate::runtime_config::CacheConfig;
use crate::store::models::StoredModel;
use crate::store::Store;

use super::layered::{KvTier, LayeredCache};

fn cache_key(symbol: &str, model_type: &str) -> String {
    format!("model:{symbol}:{model_type}")
}

/// Three-tier cache for trained models.
pub struct ModelCache {
    cache: LayeredCache<StoredModel>,
    store: Arc<Store>,
    l3_enabled: bool,
    l3_hits: AtomicU64,
}

impl ModelCache {
    pub fn new(store: Arc<Store>, config: CacheConfig, l2: Option<Arc<dyn KvTier>>) -> Self {
        let l3_enabled = config.l3_enabled;
        Self {
            cache: LayeredCache::new("models", config, l2),
            store,
            l3_enabled,
            l3_hits: AtomicU64::new(0),
        }
    }

    /// Fetch an unexpired model, populating upper layers on a lower-layer
    /// hit. Returns `None` on miss or expiry.
    pub fn get(&self, symbol: &str, model_type: &str, now_ms: i64) -> Option<StoredModel> {
        let key = cache_key(symbol, model_type);

        if let Some(hit) = self.cache.get(&key, now_ms, None) {
            if hit.value.expires_at > now_ms {
                return Some(hit.value);
            }
            // Expired in the upper layers: purge and fall through to L3,
            // which applies the same expiry filter.
            self.cache.invalidate(&key);
        }

        if !self.l3_enabled {
            return None;
        }

        match self.store.load_model(symbol, model_type, now_ms) {
            Ok(Some(model)) => {
                self.l3_hits.fetch_add(1, Ordering::Relaxed);
                if let Err(e) = self.store.touch_model(&model.id) {
                    warn!(error = %e, "failed to bump model access count");
                }
                self.cache.put(
                    &key,
                    model.clone(),
                    model.trained_at,
                    Some(model.accuracy),
                    now_ms,
                );
                Some(model)
            }
            Ok(None) => None,
            Err(e) => {
                warn!(symbol, model_type, error = %e, "L3 model lookup failed");
                None
            }
        }
    }

    /// Persist a freshly trained model to every layer.
    pub fn put(&self, model: &StoredModel, now_ms: i64) -> Result<()> {
        if self.l3_enabled {
            self.store.upsert_model(model)?;
        }
        self.cache.put(
            &cache_key(&model.symbol, &model.model_type),
            model.clone(),
            model.trained_at,
            Some(model.accuracy),
            now_ms,
        );
        debug!(symbol = %model.symbol, model_type = %model.model_type, "model cached");
        Ok(())
    }

    /// Load every unexpired persisted model into L1. Called once at startup.
    pub fn preload(&self, now_ms: i64) -> Result<usize> {
        if !self.l3_enabled {
            return Ok(0);
        }
        let models = self.store.load_fresh_models(now_ms)?;
        let count = models.len();
        for model in models {
            self.cache.put(
                &cache_key(&model.symbol, &model.model_type),
                model.clone(),
                model.trained_at,
                Some(model.accuracy),
                now_ms,
            );
        }
        info!(count, "persisted models preloaded into L1");
        Ok(count)
    }

    /// Drop expired rows from L3.
    pub fn purge_expired(&self, now_ms: i64) -> Result<usize> {
        self.store.delete_expired_models(now_ms)
    }

    pub fn l3_hits(&self) -> u64 {
        self.l3_hits.load(Ordering::Relaxed)
    }

    pub fn stats(&self) -> super::layered::CacheStats {
        self.cache.stats()
    }
}
