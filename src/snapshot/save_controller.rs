// =============================================================================
// Save Controller — transactional snapshot writes with retry and retention
// =============================================================================
//
// One snapshot save is one database transaction (header + chunked item
// inserts).  Transient failures are retried a bounded number of times with a
// fixed delay; a permanent failure is surfaced to the caller, who re-evaluates
// freshness on the next pipeline wake-up and retries independently.
// =============================================================================

use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Utc;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::time::{timeout, Duration};
use tracing::{info, warn};

use crate::runtime_config::SaveControllerConfig;
use crate::store::Store;
use crate::types::{GainerItem, MarketKind};

/// Counters exposed through the stats endpoint.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SaveStats {
    pub attempts: u64,
    pub saved: u64,
    pub failed: u64,
    pub retries: u64,
    pub last_save_ms: Option<i64>,
    pub last_error: Option<String>,
}

/// Writes gainers snapshots under the configured retry/backoff policy and
/// owns the retention pass.
pub struct SaveController {
    store: Arc<Store>,
    config: SaveControllerConfig,
    stats: Mutex<SaveStats>,
}

impl SaveController {
    pub fn new(store: Arc<Store>, config: SaveControllerConfig) -> Self {
        Self {
            store,
            config,
            stats: Mutex::new(SaveStats::default()),
        }
    }

    /// Persist one snapshot atomically. Returns the snapshot id.
    ///
    /// Retries `retry_attempts` times with a fixed `retry_delay` between
    /// attempts; each attempt carries the configured save timeout.
    pub async fn save_snapshot(
        &self,
        kind: MarketKind,
        items: Vec<GainerItem>,
        timestamp_ms: i64,
    ) -> Result<i64> {
        let attempts = self.config.retry_attempts.max(1);
        let mut last_err: Option<anyhow::Error> = None;

        for attempt in 1..=attempts {
            self.stats.lock().attempts += 1;

            let store = self.store.clone();
            let batch = items.clone();
            let batch_size = self.config.batch_size;

            let write = tokio::task::spawn_blocking(move || {
                store.insert_snapshot(kind, timestamp_ms, &batch, batch_size)
            });

            let outcome = timeout(Duration::from_secs(self.config.save_timeout_secs), write)
                .await
                .map_err(|_| anyhow::anyhow!("snapshot save timed out"))
                .and_then(|joined| joined.context("snapshot save task panicked"))
                .and_then(|res| res);

            match outcome {
                Ok(snapshot_id) => {
                    let mut stats = self.stats.lock();
                    stats.saved += 1;
                    stats.last_save_ms = Some(Utc::now().timestamp_millis());
                    stats.last_error = None;
                    info!(
                        kind = %kind,
                        snapshot_id,
                        items = items.len(),
                        attempt,
                        "snapshot persisted"
                    );
                    return Ok(snapshot_id);
                }
                Err(e) => {
                    warn!(kind = %kind, attempt, error = %e, "snapshot save attempt failed");
                    last_err = Some(e);
                    if attempt < attempts {
                        self.stats.lock().retries += 1;
                        tokio::time::sleep(Duration::from_millis(self.config.retry_delay_ms))
                            .await;
                    }
                }
            }
        }

        let err = last_err.unwrap_or_else(|| anyhow::anyhow!("snapshot save failed"));
        let mut stats = self.stats.lock();
        stats.failed += 1;
        stats.last_error = Some(err.to_string());
        Err(err)
    }

    /// Retention: drop snapshots beyond the age window, then enforce the
    /// per-kind count cap. Returns (deleted_by_age, deleted_by_count).
    pub async fn run_retention(&self, kind: MarketKind) -> Result<(usize, usize)> {
        let cutoff = Utc::now().timestamp_millis()
            - (self.config.retention_hours as i64) * 3_600_000;
        let max_keep = self.config.max_snapshots;

        let store = self.store.clone();
        let (by_age, by_count) =
            tokio::task::spawn_blocking(move || store.prune_snapshots(kind, cutoff, max_keep))
                .await
                .context("retention task panicked")??;

        if by_age + by_count > 0 {
            info!(kind = %kind, by_age, by_count, "snapshot retention pass");
        }
        Ok((by_age, by_count))
    }

    pub fn stats(&self) -> SaveStats {
        self.stats.lock().clone()
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    fn items(n: u32) -> Vec<GainerItem> {
        (1..=n)
            .map(|i| GainerItem {
                symbol: format!("S{i}"),
                rank: i,
                current_price: i as f64,
                change_percent: 1.0,
                volume_24h: 100.0,
                data_source: "test".to_string(),
            })
            .collect()
    }

    fn fast_config() -> SaveControllerConfig {
        SaveControllerConfig {
            batch_size: 3,
            save_timeout_secs: 5,
            retry_attempts: 3,
            retry_delay_ms: 10,
            retention_hours: 1,
            max_snapshots: 5,
        }
    }

    #[tokio::test]
    async fn save_writes_all_items_atomically() {
        let store = Arc::new(Store::open_in_memory().unwrap());
        let controller = SaveController::new(store.clone(), fast_config());

        let id = controller
            .save_snapshot(MarketKind::Spot, items(7), 1_700_000_000_000)
            .await
            .unwrap();

        let read = store.snapshot_items(id).unwrap();
        assert_eq!(read.len(), 7);
        let stats = controller.stats();
        assert_eq!(stats.saved, 1);
        assert_eq!(stats.failed, 0);
    }

    #[tokio::test]
    async fn permanent_failure_counts_and_surfaces() {
        let store = Arc::new(Store::open_in_memory().unwrap());
        // Break the schema so every attempt fails.
        store
            .with_conn(|c| {
                c.execute_batch("DROP TABLE gainers_snapshot_items")?;
                Ok(())
            })
            .unwrap();

        let controller = SaveController::new(store, fast_config());
        let err = controller
            .save_snapshot(MarketKind::Spot, items(2), 1)
            .await;
        assert!(err.is_err());

        let stats = controller.stats();
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.attempts, 3);
        assert_eq!(stats.retries, 2);
        assert!(stats.last_error.is_some());
    }

    #[tokio::test]
    async fn retention_enforces_count_cap() {
        let store = Arc::new(Store::open_in_memory().unwrap());
        let controller = SaveController::new(store.clone(), fast_config());

        let now = Utc::now().timestamp_millis();
        for i in 0..8 {
            controller
                .save_snapshot(MarketKind::Futures, items(1), now + i)
                .await
                .unwrap();
        }

        let (_, by_count) = controller.run_retention(MarketKind::Futures).await.unwrap();
        assert_eq!(by_count, 3);
        assert_eq!(store.count_snapshots(MarketKind::Futures).unwrap(), 5);
    }
}
