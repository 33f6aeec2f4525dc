// =============================================================================
// Layered Cache — bounded L1 map over a shared key-value L2
// =============================================================================
//
// Lookup order is L1 -> L2 (a durable L3 is layered on top of this by the
// artefact-specific wrappers); a hit on a lower layer populates the upper
// layers.  L1 eviction is expire-then-evict-least-valuable: expired entries
// go first, then the lowest access count, ties broken by lowest accuracy
// (models) or highest age.
// =============================================================================

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::runtime_config::CacheConfig;

/// A cached value plus the metadata the eviction policy scores on.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CachedArtifact<T> {
    pub value: T,
    /// When the artefact was computed/trained, ms since epoch.
    pub created_at_ms: i64,
    /// Model accuracy; `None` for non-model artefacts.
    pub accuracy: Option<f64>,
    pub access_count: u64,
}

#[derive(Debug, Clone)]
struct L1Entry<T> {
    artifact: CachedArtifact<T>,
    inserted_at_ms: i64,
}

/// The shared key-value capability backing L2. A deployment may substitute a
/// remote store; the in-process [`SharedKv`] keeps the tier real for tests
/// and single-node runs.
pub trait KvTier: Send + Sync {
    /// Fetch a payload and its stored-at time, honouring the tier's TTL.
    fn get(&self, key: &str, now_ms: i64) -> Option<(String, i64)>;
    fn put(&self, key: &str, payload: String, now_ms: i64);
    fn remove(&self, key: &str);
}

/// Process-shared L2 with TTL-on-read semantics.
pub struct SharedKv {
    entries: RwLock<HashMap<String, (String, i64)>>,
    ttl_ms: i64,
}

impl SharedKv {
    pub fn new(ttl_secs: u64) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            ttl_ms: (ttl_secs as i64) * 1000,
        }
    }
}

impl KvTier for SharedKv {
    fn get(&self, key: &str, now_ms: i64) -> Option<(String, i64)> {
        let expired = {
            let map = self.entries.read();
            match map.get(key) {
                Some((payload, stored_at)) => {
                    if now_ms - stored_at >= self.ttl_ms {
                        true
                    } else {
                        return Some((payload.clone(), *stored_at));
                    }
                }
                None => return None,
            }
        };
        if expired {
            self.entries.write().remove(key);
        }
        None
    }

    fn put(&self, key: &str, payload: String, now_ms: i64) {
        self.entries
            .write()
            .insert(key.to_string(), (payload, now_ms));
    }

    fn remove(&self, key: &str) {
        self.entries.write().remove(key);
    }
}

/// Per-layer hit/miss counters for the stats endpoint.
#[derive(Debug, Clone, Default, Serialize)]
pub struct CacheStats {
    pub l1_hits: u64,
    pub l2_hits: u64,
    pub misses: u64,
    pub evictions: u64,
}

/// L1 + L2 cache for one artefact family.
pub struct LayeredCache<T> {
    name: &'static str,
    config: CacheConfig,
    l1: Mutex<HashMap<String, L1Entry<T>>>,
    l2: Option<Arc<dyn KvTier>>,
    l1_hits: AtomicU64,
    l2_hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
}

impl<T> LayeredCache<T>
where
    T: Clone + Serialize + DeserializeOwned,
{
    pub fn new(name: &'static str, config: CacheConfig, l2: Option<Arc<dyn KvTier>>) -> Self {
        let l2 = if config.l2_enabled { l2 } else { None };
        Self {
            name,
            config,
            l1: Mutex::new(HashMap::new()),
            l2,
            l1_hits: AtomicU64::new(0),
            l2_hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
        }
    }

    /// Look up `key`. An entry older than `max_age_ms` (by its
    /// `created_at_ms`) is treated as a miss per the freshness policy.
    ///
    /// An L2 hit repopulates L1.
    pub fn get(&self, key: &str, now_ms: i64, max_age_ms: Option<i64>) -> Option<CachedArtifact<T>> {
        let fresh = |artifact: &CachedArtifact<T>| match max_age_ms {
            Some(max) => now_ms - artifact.created_at_ms < max,
            None => true,
        };

        // L1
        if self.config.l1_enabled {
            let mut map = self.l1.lock();
            let l1_ttl_ms = (self.config.l1_ttl_secs as i64) * 1000;
            if let Some(entry) = map.get_mut(key) {
                if now_ms - entry.inserted_at_ms >= l1_ttl_ms || !fresh(&entry.artifact) {
                    map.remove(key);
                } else {
                    entry.artifact.access_count += 1;
                    self.l1_hits.fetch_add(1, Ordering::Relaxed);
                    return Some(entry.artifact.clone());
                }
            }
        }

        // L2
        if let Some(l2) = &self.l2 {
            if let Some((payload, _stored_at)) = l2.get(key, now_ms) {
                if let Ok(mut artifact) = serde_json::from_str::<CachedArtifact<T>>(&payload) {
                    if fresh(&artifact) {
                        artifact.access_count += 1;
                        self.l2_hits.fetch_add(1, Ordering::Relaxed);
                        // Promote to L1.
                        self.insert_l1(key, artifact.clone(), now_ms);
                        return Some(artifact);
                    }
                    l2.remove(key);
                } else {
                    debug!(cache = self.name, key, "dropping undecodable L2 payload");
                    l2.remove(key);
                }
            }
        }

        self.misses.fetch_add(1, Ordering::Relaxed);
        None
    }

    /// Store a value in every enabled layer.
    pub fn put(
        &self,
        key: &str,
        value: T,
        created_at_ms: i64,
        accuracy: Option<f64>,
        now_ms: i64,
    ) {
        let artifact = CachedArtifact {
            value,
            created_at_ms,
            accuracy,
            access_count: 0,
        };

        if let Some(l2) = &self.l2 {
            if let Ok(payload) = serde_json::to_string(&artifact) {
                l2.put(key, payload, now_ms);
            }
        }
        self.insert_l1(key, artifact, now_ms);
    }

    /// Drop a key from the in-process layers.
    pub fn invalidate(&self, key: &str) {
        self.l1.lock().remove(key);
        if let Some(l2) = &self.l2 {
            l2.remove(key);
        }
    }

    pub fn l1_len(&self) -> usize {
        self.l1.lock().len()
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            l1_hits: self.l1_hits.load(Ordering::Relaxed),
            l2_hits: self.l2_hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
        }
    }

    // -------------------------------------------------------------------------
    // L1 internals
    // -------------------------------------------------------------------------

    fn insert_l1(&self, key: &str, artifact: CachedArtifact<T>, now_ms: i64) {
        if !self.config.l1_enabled {
            return;
        }
        let mut map = self.l1.lock();
        map.insert(
            key.to_string(),
            L1Entry {
                artifact,
                inserted_at_ms: now_ms,
            },
        );

        if map.len() <= self.config.l1_max_size {
            return;
        }

        // Expire first.
        let l1_ttl_ms = (self.config.l1_ttl_secs as i64) * 1000;
        let expired: Vec<String> = map
            .iter()
            .filter(|(_, e)| now_ms - e.inserted_at_ms >= l1_ttl_ms)
            .map(|(k, _)| k.clone())
            .collect();
        for k in expired {
            map.remove(&k);
            self.evictions.fetch_add(1, Ordering::Relaxed);
        }

        // Then evict the least valuable until back under the bound.
        while map.len() > self.config.l1_max_size {
            let victim = map
                .iter()
                .min_by(|(_, a), (_, b)| {
                    a.artifact
                        .access_count
                        .cmp(&b.artifact.access_count)
                        .then_with(|| match (a.artifact.accuracy, b.artifact.accuracy) {
                            // Lower accuracy goes first.
                            (Some(aa), Some(ba)) => {
                                aa.partial_cmp(&ba).unwrap_or(std::cmp::Ordering::Equal)
                            }
                            // Otherwise the older entry goes first.
                            _ => a.inserted_at_ms.cmp(&b.inserted_at_ms),
                        })
                })
                .map(|(k, _)| k.clone());

            match victim {
                Some(k) => {
                    map.remove(&k);
                    self.evictions.fetch_add(1, Ordering::Relaxed);
                    debug!(cache = self.name, key = %k, "L1 eviction");
                }
                None => break,
            }
        }
    }
}
