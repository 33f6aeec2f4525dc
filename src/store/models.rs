// =============================================================================
// ML model persistence — the durable L3 of the layered cache
// =============================================================================
//
// An expired model (`expires_at <= now`) is never returned on lookup; callers
// see a miss and retrain.
// =============================================================================

use anyhow::{Context, Result};
use rusqlite::params;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::Store;

/// A persisted trained model: serialised parameters plus evaluation metrics.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredModel {
    pub id: String,
    pub symbol: String,
    pub model_type: String,
    /// Serialised model parameters.
    pub payload: Vec<u8>,
    /// Cross-validated accuracy in [0, 1].
    pub accuracy: f64,
    /// Training-set size.
    pub samples: u64,
    pub trained_at: i64,
    pub expires_at: i64,
    pub access_count: u64,
}

impl StoredModel {
    pub fn new(
        symbol: &str,
        model_type: &str,
        payload: Vec<u8>,
        accuracy: f64,
        samples: u64,
        trained_at: i64,
        expires_at: i64,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            symbol: symbol.to_string(),
            model_type: model_type.to_string(),
            payload,
            accuracy,
            samples,
            trained_at,
            expires_at,
            access_count: 0,
        }
    }
}

impl Store {
    /// Insert or replace the model for (symbol, model_type).
    pub fn upsert_model(&self, model: &StoredModel) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO ml_models \
                 (id, symbol, model_type, payload, accuracy, samples, trained_at, expires_at, access_count) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9) \
                 ON CONFLICT(symbol, model_type) DO UPDATE SET \
                 id = excluded.id, payload = excluded.payload, accuracy = excluded.accuracy, \
                 samples = excluded.samples, trained_at = excluded.trained_at, \
                 expires_at = excluded.expires_at, access_count = 0",
                params![
                    model.id,
                    model.symbol,
                    model.model_type,
                    model.payload,
                    model.accuracy,
                    model.samples as i64,
                    model.trained_at,
                    model.expires_at,
                    model.access_count as i64,
                ],
            )
            .with_context(|| format!("upsert model {}:{}", model.symbol, model.model_type))?;
            Ok(())
        })
    }

    /// Load a model iff it has not expired at `now_ms`. Expired rows are
    /// reported as a miss, never returned.
    pub fn load_model(
        &self,
        symbol: &str,
        model_type: &str,
        now_ms: i64,
    ) -> Result<Option<StoredModel>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, payload, accuracy, samples, trained_at, expires_at, access_count \
                 FROM ml_models \
                 WHERE symbol = ?1 AND model_type = ?2 AND expires_at > ?3",
            )?;
            let mut rows = stmt.query_map(params![symbol, model_type, now_ms], |row| {
                Ok(StoredModel {
                    id: row.get(0)?,
                    symbol: symbol.to_string(),
                    model_type: model_type.to_string(),
                    payload: row.get(1)?,
                    accuracy: row.get(2)?,
                    samples: row.get::<_, i64>(3)? as u64,
                    trained_at: row.get(4)?,
                    expires_at: row.get(5)?,
                    access_count: row.get::<_, i64>(6)? as u64,
                })
            })?;
            Ok(rows.next().transpose()?)
        })
    }

    /// All unexpired models, used to warm L1 at startup.
    pub fn load_fresh_models(&self, now_ms: i64) -> Result<Vec<StoredModel>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, symbol, model_type, payload, accuracy, samples, trained_at, \
                        expires_at, access_count \
                 FROM ml_models WHERE expires_at > ?1",
            )?;
            let models = stmt
                .query_map(params![now_ms], |row| {
                    Ok(StoredModel {
                        id: row.get(0)?,
                        symbol: row.get(1)?,
                        model_type: row.get(2)?,
                        payload: row.get(3)?,
                        accuracy: row.get(4)?,
                        samples: row.get::<_, i64>(5)? as u64,
                        trained_at: row.get(6)?,
                        expires_at: row.get(7)?,
                        access_count: row.get::<_, i64>(8)? as u64,
                    })
                })?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(models)
        })
    }

    /// Bump the access counter for eviction scoring.
    pub fn touch_model(&self, id: &str) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "UPDATE ml_models SET access_count = access_count + 1 WHERE id = ?1",
                params![id],
            )?;
            Ok(())
        })
    }

    /// Remove expired rows; returns the number deleted.
    pub fn delete_expired_models(&self, now_ms: i64) -> Result<usize> {
        self.with_conn(|conn| {
            let deleted = conn.execute(
                "DELETE FROM ml_models WHERE expires_at <= ?1",
                params![now_ms],
            )?;
            Ok(deleted)
        })
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    fn model(symbol: &str, expires_at: i64) -> StoredModel {
        StoredModel::new(symbol, "direction", vec![1, 2, 3], 0.62, 1200, 100, expires_at)
    }

    #[test]
    fn expired_model_is_reported_as_miss() {
        let store = Store::open_in_memory().unwrap();
        store.upsert_model(&model("BTCUSDT", 1000)).unwrap();

        assert!(store.load_model("BTCUSDT", "direction", 999).unwrap().is_some());
        assert!(store.load_model("BTCUSDT", "direction", 1000).unwrap().is_none());
        assert!(store.load_model("BTCUSDT", "direction", 2000).unwrap().is_none());
    }

    #[test]
    fn upsert_replaces_and_resets_access_count() {
        let store = Store::open_in_memory().unwrap();
        store.upsert_model(&model("BTCUSDT", 1000)).unwrap();

        let loaded = store.load_model("BTCUSDT", "direction", 0).unwrap().unwrap();
        store.touch_model(&loaded.id).unwrap();
        store.touch_model(&loaded.id).unwrap();
        assert_eq!(
            store.load_model("BTCUSDT", "direction", 0).unwrap().unwrap().access_count,
            2
        );

        // Retraining replaces the row and zeroes the counter.
        let mut retrained = model("BTCUSDT", 5000);
        retrained.accuracy = 0.7;
        store.upsert_model(&retrained).unwrap();
        let loaded = store.load_model("BTCUSDT", "direction", 0).unwrap().unwrap();
        assert_eq!(loaded.access_count, 0);
        assert!((loaded.accuracy - 0.7).abs() < 1e-12);
    }

    #[test]
    fn delete_expired_prunes_only_stale_rows() {
        let store = Store::open_in_memory().unwrap();
        store.upsert_model(&model("A", 100)).unwrap();
        store.upsert_model(&model("B", 10_000)).unwrap();

        assert_eq!(store.delete_expired_models(500).unwrap(), 1);
        assert_eq!(store.load_fresh_models(0).unwrap().len(), 1);
    }
}
