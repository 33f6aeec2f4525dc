// =============================================================================
// Kline persistence — upsert by (symbol, kind, interval, open_time)
// =============================================================================

use anyhow::{Context, Result};
use rusqlite::params;

use crate::types::{Kline, MarketKind};

use super::Store;

impl Store {
    /// Upsert a batch of klines in one transaction. Re-ingesting the same bar
    /// overwrites the OHLCV payload, so backfills are idempotent.
    ///
    /// Returns the number of rows written.
    pub fn upsert_klines(&self, klines: &[Kline]) -> Result<usize> {
        if klines.is_empty() {
            return Ok(0);
        }
        self.with_conn_mut(|conn| {
            let tx = conn.transaction().context("begin kline transaction")?;
            {
                let mut stmt = tx
                    .prepare(
                        "INSERT INTO klines \
                         (symbol, kind, interval, open_time, open, high, low, close, volume, quote_volume, trade_count) \
                         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11) \
                         ON CONFLICT(symbol, kind, interval, open_time) DO UPDATE SET \
                         open = excluded.open, high = excluded.high, low = excluded.low, \
                         close = excluded.close, volume = excluded.volume, \
                         quote_volume = excluded.quote_volume, trade_count = excluded.trade_count",
                    )
                    .context("prepare kline upsert")?;

                for k in klines {
                    stmt.execute(params![
                        k.symbol,
                        k.kind.as_str(),
                        k.interval,
                        k.open_time,
                        k.open,
                        k.high,
                        k.low,
                        k.close,
                        k.volume,
                        k.quote_volume,
                        k.trade_count.map(|n| n as i64),
                    ])
                    .with_context(|| format!("upsert kline {}@{}", k.symbol, k.open_time))?;
                }
            }
            tx.commit().context("commit kline transaction")?;
            Ok(klines.len())
        })
    }

    /// The most recent `limit` bars for a series, oldest-first.
    pub fn load_klines(
        &self,
        symbol: &str,
        kind: MarketKind,
        interval: &str,
        limit: usize,
    ) -> Result<Vec<Kline>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT open_time, open, high, low, close, volume, quote_volume, trade_count \
                 FROM klines WHERE symbol = ?1 AND kind = ?2 AND interval = ?3 \
                 ORDER BY open_time DESC LIMIT ?4",
            )?;
            let mut bars = stmt
                .query_map(
                    params![symbol, kind.as_str(), interval, limit],
                    |row| {
                        Ok(Kline {
                            symbol: symbol.to_string(),
                            kind,
                            interval: interval.to_string(),
                            open_time: row.get(0)?,
                            open: row.get(1)?,
                            high: row.get(2)?,
                            low: row.get(3)?,
                            close: row.get(4)?,
                            volume: row.get(5)?,
                            quote_volume: row.get(6)?,
                            trade_count: row.get::<_, Option<i64>>(7)?.map(|n| n as u64),
                        })
                    },
                )?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            bars.reverse();
            Ok(bars)
        })
    }

    /// Number of bars stored for a series.
    pub fn count_klines(&self, symbol: &str, kind: MarketKind, interval: &str) -> Result<usize> {
        self.with_conn(|conn| {
            let count: usize = conn.query_row(
                "SELECT COUNT(*) FROM klines WHERE symbol = ?1 AND kind = ?2 AND interval = ?3",
                params![symbol, kind.as_str(), interval],
                |row| row.get(0),
            )?;
            Ok(count)
        })
    }
}
