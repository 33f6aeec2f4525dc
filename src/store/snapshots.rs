// =============================================================================
// Gainers snapshot persistence — immutable once committed
// =============================================================================
//
// A snapshot row plus its items are written in one transaction; items carry
// the snapshot id as foreign key and are batch-inserted in chunks.  Snapshots
// are never updated after commit.
// =============================================================================

use anyhow::{Context, Result};
use rusqlite::params;
use serde::Serialize;

use crate::types::{GainerItem, MarketKind};

use super::Store;

/// Persisted header of one gainers observation.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GainersSnapshot {
    pub id: i64,
    pub kind: MarketKind,
    /// Observation time, milliseconds since the UNIX epoch.
    pub timestamp: i64,
}

impl Store {
    /// Insert a snapshot and all of its items in a single transaction.
    ///
    /// Items are inserted in chunks of `batch_size` rows per statement batch.
    /// Returns the new snapshot id. The transaction rolls back wholesale on
    /// any failure so a partially-written snapshot can never be observed.
    pub fn insert_snapshot(
        &self,
        kind: MarketKind,
        timestamp: i64,
        items: &[GainerItem],
        batch_size: usize,
    ) -> Result<i64> {
        let batch_size = batch_size.max(1);
        self.with_conn_mut(|conn| {
            let tx = conn.transaction().context("begin snapshot transaction")?;

            tx.execute(
                "INSERT INTO gainers_snapshots (kind, timestamp) VALUES (?1, ?2)",
                params![kind.as_str(), timestamp],
            )
            .context("insert snapshot header")?;
            let snapshot_id = tx.last_insert_rowid();

            {
                let mut stmt = tx
                    .prepare(
                        "INSERT INTO gainers_snapshot_items \
                         (snapshot_id, symbol, rank, current_price, change_percent, volume_24h, data_source) \
                         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                    )
                    .context("prepare item insert")?;

                for chunk in items.chunks(batch_size) {
                    for item in chunk {
                        stmt.execute(params![
                            snapshot_id,
                            item.symbol,
                            item.rank,
                            item.current_price,
                            item.change_percent,
                            item.volume_24h,
                            item.data_source,
                        ])
                        .with_context(|| format!("insert item {}", item.symbol))?;
                    }
                }
            }

            tx.commit().context("commit snapshot transaction")?;
            Ok(snapshot_id)
        })
    }

    /// The most recent snapshot for `kind` together with its items
    /// (rank-ascending), if any exists.
    pub fn latest_snapshot(
        &self,
        kind: MarketKind,
    ) -> Result<Option<(GainersSnapshot, Vec<GainerItem>)>> {
        let header = self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, timestamp FROM gainers_snapshots \
                 WHERE kind = ?1 ORDER BY timestamp DESC, id DESC LIMIT 1",
            )?;
            let mut rows = stmt.query(params![kind.as_str()])?;
            match rows.next()? {
                Some(row) => Ok(Some(GainersSnapshot {
                    id: row.get(0)?,
                    kind,
                    timestamp: row.get(1)?,
                })),
                None => Ok(None),
            }
        })?;

        match header {
            Some(h) => {
                let items = self.snapshot_items(h.id)?;
                Ok(Some((h, items)))
            }
            None => Ok(None),
        }
    }

    /// All items of one snapshot, rank-ascending.
    pub fn snapshot_items(&self, snapshot_id: i64) -> Result<Vec<GainerItem>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT symbol, rank, current_price, change_percent, volume_24h, data_source \
                 FROM gainers_snapshot_items WHERE snapshot_id = ?1 ORDER BY rank ASC",
            )?;
            let items = stmt
                .query_map(params![snapshot_id], |row| {
                    Ok(GainerItem {
                        symbol: row.get(0)?,
                        rank: row.get(1)?,
                        current_price: row.get(2)?,
                        change_percent: row.get(3)?,
                        volume_24h: row.get(4)?,
                        data_source: row.get(5)?,
                    })
                })?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(items)
        })
    }

    /// Number of snapshots stored for `kind`.
    pub fn count_snapshots(&self, kind: MarketKind) -> Result<u32> {
        self.with_conn(|conn| {
            let count: u32 = conn.query_row(
                "SELECT COUNT(*) FROM gainers_snapshots WHERE kind = ?1",
                params![kind.as_str()],
                |row| row.get(0),
            )?;
            Ok(count)
        })
    }

    /// Retention pass: delete snapshots older than `cutoff_ms`, then keep
    /// only the newest `max_keep` per kind. Two bounded statements, run in
    /// sequence; cascading deletes remove the items.
    ///
    /// Returns (deleted_by_age, deleted_by_count).
    pub fn prune_snapshots(
        &self,
        kind: MarketKind,
        cutoff_ms: i64,
        max_keep: u32,
    ) -> Result<(usize, usize)> {
        self.with_conn(|conn| {
            let by_age = conn
                .execute(
                    "DELETE FROM gainers_snapshots WHERE kind = ?1 AND timestamp < ?2",
                    params![kind.as_str(), cutoff_ms],
                )
                .context("prune snapshots by age")?;

            let by_count = conn
                .execute(
                    "DELETE FROM gainers_snapshots WHERE kind = ?1 AND id NOT IN ( \
                         SELECT id FROM gainers_snapshots WHERE kind = ?1 \
                         ORDER BY timestamp DESC, id DESC LIMIT ?2)",
                    params![kind.as_str(), max_keep],
                )
                .context("prune snapshots by count")?;

            Ok((by_age, by_count))
        })
    }
}
