// =============================================================================
// Price-cache persistence — warm-start rows for the in-memory cache
// =============================================================================

use anyhow::{Context, Result};
use rusqlite::params;
use std::str::FromStr;

use crate::market_data::PriceEntry;
use crate::types::MarketKind;

use super::Store;

impl Store {
    /// Upsert the given entries in one transaction (advisory warmup write).
    pub fn save_price_cache(&self, entries: &[PriceEntry]) -> Result<usize> {
        if entries.is_empty() {
            return Ok(0);
        }
        self.with_conn_mut(|conn| {
            let tx = conn.transaction().context("begin price-cache transaction")?;
            {
                let mut stmt = tx.prepare(
                    "INSERT INTO price_cache (symbol, kind, price, price_change_24h, last_updated) \
                     VALUES (?1, ?2, ?3, ?4, ?5) \
                     ON CONFLICT(symbol, kind) DO UPDATE SET \
                     price = excluded.price, price_change_24h = excluded.price_change_24h, \
                     last_updated = excluded.last_updated",
                )?;
                for entry in entries {
                    stmt.execute(params![
                        entry.symbol,
                        entry.kind.as_str(),
                        entry.price,
                        entry.price_change_24h,
                        entry.last_updated,
                    ])?;
                }
            }
            tx.commit().context("commit price-cache transaction")?;
            Ok(entries.len())
        })
    }

    /// All persisted price rows, for warm-starting the in-memory cache.
    pub fn load_price_cache(&self) -> Result<Vec<PriceEntry>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT symbol, kind, price, price_change_24h, last_updated FROM price_cache",
            )?;
            let rows = stmt
                .query_map([], |row| {
                    let kind: String = row.get(1)?;
                    Ok(PriceEntry {
                        symbol: row.get(0)?,
                        kind: MarketKind::from_str(&kind).unwrap_or(MarketKind::Spot),
                        price: row.get(2)?,
                        price_change_24h: row.get(3)?,
                        last_updated: row.get(4)?,
                    })
                })?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    fn entry(symbol: &str, price: f64) -> PriceEntry {
        PriceEntry {
            symbol: symbol.to_string(),
            kind: MarketKind::Futures,
            price,
            price_change_24h: Some(1.5),
            last_updated: 100,
        }
    }

    #[test]
    fn save_then_load_round_trips() {
        let store = Store::open_in_memory().unwrap();
        store
            .save_price_cache(&[entry("BTCUSDT", 40_000.0), entry("ETHUSDT", 2_500.0)])
            .unwrap();

        let rows = store.load_price_cache().unwrap();
        assert_eq!(rows.len(), 2);
        assert!(rows.iter().any(|r| r.symbol == "BTCUSDT" && r.price == 40_000.0));
    }

    #[test]
    fn upsert_replaces_existing_rows() {
        let store = Store::open_in_memory().unwrap();
        store.save_price_cache(&[entry("BTCUSDT", 40_000.0)]).unwrap();
        store.save_price_cache(&[entry("BTCUSDT", 41_000.0)]).unwrap();

        let rows = store.load_price_cache().unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].price, 41_000.0);
    }
}
