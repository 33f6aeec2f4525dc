// =============================================================================
// Durable Store — narrow SQLite gateway for all persisted state
// =============================================================================
//
// Single-writer SQLite in WAL mode behind a parking_lot::Mutex.  Every
// subsystem talks to persistence through this gateway only; no SQL leaks
// into component code.
//
// Tables: gainers snapshots + items, klines, price cache, scheduled orders,
// bracket links, external operations, ML models, operation log, audit trail.
// =============================================================================

pub mod audit;
pub mod klines;
pub mod models;
pub mod orders;
pub mod prices;
pub mod snapshots;

use std::path::Path;

use anyhow::{Context, Result};
use parking_lot::Mutex;
use rusqlite::Connection;
use tracing::info;

/// Schema. WAL mode keeps reads concurrent with the single writer; the
/// NORMAL sync level is sufficient because every write is transactional.
const SCHEMA_SQL: &str = r#"
PRAGMA journal_mode = WAL;
PRAGMA synchronous = NORMAL;
PRAGMA foreign_keys = ON;

CREATE TABLE IF NOT EXISTS gainers_snapshots (
    id         INTEGER PRIMARY KEY AUTOINCREMENT,
    kind       TEXT NOT NULL,
    timestamp  INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_snapshots_kind_ts
    ON gainers_snapshots(kind, timestamp DESC);

CREATE TABLE IF NOT EXISTS gainers_snapshot_items (
    snapshot_id    INTEGER NOT NULL REFERENCES gainers_snapshots(id) ON DELETE CASCADE,
    symbol         TEXT NOT NULL,
    rank           INTEGER NOT NULL,
    current_price  REAL NOT NULL,
    change_percent REAL NOT NULL,
    volume_24h     REAL NOT NULL,
    data_source    TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_items_snapshot
    ON gainers_snapshot_items(snapshot_id);

CREATE TABLE IF NOT EXISTS klines (
    symbol      TEXT NOT NULL,
    kind        TEXT NOT NULL,
    interval    TEXT NOT NULL,
    open_time   INTEGER NOT NULL,
    open        REAL NOT NULL,
    high        REAL NOT NULL,
    low         REAL NOT NULL,
    close       REAL NOT NULL,
    volume      REAL NOT NULL,
    quote_volume REAL,
    trade_count INTEGER,
    PRIMARY KEY (symbol, kind, interval, open_time)
) WITHOUT ROWID;

CREATE TABLE IF NOT EXISTS price_cache (
    symbol           TEXT NOT NULL,
    kind             TEXT NOT NULL,
    price            REAL NOT NULL,
    price_change_24h REAL,
    last_updated     INTEGER NOT NULL,
    PRIMARY KEY (symbol, kind)
) WITHOUT ROWID;

CREATE TABLE IF NOT EXISTS scheduled_orders (
    id               TEXT PRIMARY KEY,
    user_id          TEXT NOT NULL,
    symbol           TEXT NOT NULL,
    side             TEXT NOT NULL,
    order_type       TEXT NOT NULL,
    quantity         REAL NOT NULL,
    price            REAL,
    reduce_only      INTEGER NOT NULL DEFAULT 0,
    trigger_time     INTEGER NOT NULL,
    status           TEXT NOT NULL,
    client_order_id  TEXT NOT NULL UNIQUE,
    exchange_order_id TEXT,
    executed_qty     REAL NOT NULL DEFAULT 0,
    avg_price        REAL NOT NULL DEFAULT 0,
    parent_order_id  TEXT,
    close_order_ids  TEXT NOT NULL DEFAULT '',
    bracket_enabled  INTEGER NOT NULL DEFAULT 0,
    strategy_id      TEXT,
    execution_id     TEXT,
    created_at       INTEGER NOT NULL,
    updated_at       INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_orders_status
    ON scheduled_orders(status);
CREATE INDEX IF NOT EXISTS idx_orders_user_symbol
    ON scheduled_orders(user_id, symbol);

CREATE TABLE IF NOT EXISTS bracket_links (
    id              TEXT PRIMARY KEY,
    group_id        TEXT NOT NULL,
    entry_client_id TEXT NOT NULL,
    tp_client_id    TEXT,
    sl_client_id    TEXT,
    symbol          TEXT NOT NULL,
    status          TEXT NOT NULL,
    created_at      INTEGER NOT NULL,
    updated_at      INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_bracket_status
    ON bracket_links(status);

CREATE TABLE IF NOT EXISTS external_operations (
    id             TEXT PRIMARY KEY,
    user_id        TEXT NOT NULL,
    symbol         TEXT NOT NULL,
    operation_type TEXT NOT NULL,
    old_amount     REAL NOT NULL,
    new_amount     REAL NOT NULL,
    confidence     REAL NOT NULL,
    detected_at    INTEGER NOT NULL,
    status         TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS ml_models (
    id           TEXT PRIMARY KEY,
    symbol       TEXT NOT NULL,
    model_type   TEXT NOT NULL,
    payload      BLOB NOT NULL,
    accuracy     REAL NOT NULL,
    samples      INTEGER NOT NULL,
    trained_at   INTEGER NOT NULL,
    expires_at   INTEGER NOT NULL,
    access_count INTEGER NOT NULL DEFAULT 0,
    UNIQUE (symbol, model_type)
);

CREATE TABLE IF NOT EXISTS operation_log (
    id          INTEGER PRIMARY KEY AUTOINCREMENT,
    entity_type TEXT NOT NULL,
    entity_id   TEXT NOT NULL,
    action      TEXT NOT NULL,
    old_value   TEXT,
    new_value   TEXT,
    level       TEXT NOT NULL,
    created_at  INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS audit_trail (
    id          INTEGER PRIMARY KEY AUTOINCREMENT,
    entity_type TEXT NOT NULL,
    entity_id   TEXT NOT NULL,
    action      TEXT NOT NULL,
    old_value   TEXT,
    new_value   TEXT,
    level       TEXT NOT NULL,
    created_at  INTEGER NOT NULL
);
"#;

/// Narrow persistence gateway shared across the process as `Arc<Store>`.
pub struct Store {
    conn: Mutex<Connection>,
}

impl Store {
    /// Open (or create) the store at `path` and apply the schema.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open store at {}", path.display()))?;
        conn.execute_batch(SCHEMA_SQL)
            .context("failed to apply store schema")?;
        info!(path = %path.display(), "store opened");
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// In-memory store for tests.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("failed to open in-memory store")?;
        conn.execute_batch(SCHEMA_SQL)
            .context("failed to apply store schema")?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Cheap liveness probe used by the health checker.
    pub fn probe(&self) -> Result<()> {
        let conn = self.conn.lock();
        conn.query_row("SELECT 1", [], |_| Ok(()))
            .context("store probe failed")?;
        Ok(())
    }

    /// Run `f` with the locked connection. Submodules use this to keep all
    /// locking in one place.
    pub(crate) fn with_conn<T>(&self, f: impl FnOnce(&Connection) -> Result<T>) -> Result<T> {
        let conn = self.conn.lock();
        f(&conn)
    }

    /// Run `f` with a mutable connection (required for transactions).
    pub(crate) fn with_conn_mut<T>(
        &self,
        f: impl FnOnce(&mut Connection) -> Result<T>,
    ) -> Result<T> {
        let mut conn = self.conn.lock();
        f(&mut conn)
    }
}

impl std::fmt::Debug for Store {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Store").finish_non_exhaustive()
    }
}
