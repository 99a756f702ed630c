pub mod assets;
pub mod checkpoint;
pub mod coins;
pub mod raw;

pub use assets::{AssetQuery, AssetStore};
pub use checkpoint::CheckpointStore;
pub use raw::RawStore;

use parking_lot::Mutex;
use rusqlite::{Connection, Transaction};
use std::sync::Arc;

use crate::error::{EtlError, Result};

const SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS raw_records (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    source_name TEXT NOT NULL,
    payload TEXT NOT NULL,
    fetched_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_raw_records_source_fetched
    ON raw_records(source_name, fetched_at);

CREATE TABLE IF NOT EXISTS coins (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    symbol TEXT NOT NULL UNIQUE,
    name TEXT NOT NULL,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS coin_source_mappings (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    coin_id INTEGER NOT NULL REFERENCES coins(id),
    source TEXT NOT NULL,
    source_id TEXT NOT NULL,
    source_symbol TEXT NOT NULL,
    source_name TEXT NOT NULL,
    created_at TEXT NOT NULL,
    last_seen TEXT NOT NULL,
    UNIQUE(source, source_id)
);

CREATE INDEX IF NOT EXISTS idx_mappings_coin ON coin_source_mappings(coin_id);

CREATE TABLE IF NOT EXISTS assets (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    coin_id INTEGER NOT NULL REFERENCES coins(id),
    symbol TEXT NOT NULL,
    name TEXT NOT NULL,
    price_usd TEXT,
    market_cap TEXT,
    source TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    UNIQUE(symbol, source)
);

CREATE INDEX IF NOT EXISTS idx_assets_updated ON assets(updated_at DESC, id DESC);
CREATE INDEX IF NOT EXISTS idx_assets_source ON assets(source);

CREATE TABLE IF NOT EXISTS etl_checkpoints (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    source TEXT NOT NULL UNIQUE,
    last_processed_id INTEGER,
    last_processed_at TEXT,
    status TEXT NOT NULL DEFAULT 'pending',
    run_id TEXT NOT NULL,
    last_error TEXT,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);
"#;

/// Shared handle to the single SQLite connection.
///
/// Every write goes through this mutex, so the pipeline and the read API see
/// each statement (and each `with_tx` closure) as one atomic unit. Guards are
/// never held across an `.await`.
#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

impl Database {
    pub fn open(path: &str) -> Result<Self> {
        let conn = Connection::open(path)?;
        conn.pragma_update(None, "journal_mode", "WAL").ok();
        conn.pragma_update(None, "synchronous", "NORMAL").ok();
        let db = Self::init(conn)?;
        tracing::info!(path = %path, "database opened");
        Ok(db)
    }

    #[cfg(test)]
    pub fn open_in_memory() -> Result<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.pragma_update(None, "foreign_keys", "ON")?;
        conn.execute_batch(SCHEMA_SQL)?;
        Ok(Self { conn: Arc::new(Mutex::new(conn)) })
    }

    pub fn with_conn<T>(&self, f: impl FnOnce(&Connection) -> Result<T>) -> Result<T> {
        let conn = self.conn.lock();
        f(&conn)
    }

    /// Runs `f` inside one transaction: committed on `Ok`, rolled back on `Err`.
    pub fn with_tx<T>(&self, f: impl FnOnce(&Transaction<'_>) -> Result<T>) -> Result<T> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        let out = f(&tx)?;
        tx.commit()?;
        Ok(out)
    }

    pub fn ping(&self) -> Result<()> {
        self.with_conn(|c| {
            let one: i64 = c.query_row("SELECT 1", [], |r| r.get(0))?;
            if one != 1 {
                return Err(EtlError::Corrupt("SELECT 1 returned garbage".into()));
            }
            Ok(())
        })
    }
}

pub(crate) fn parse_decimal(col: &str, v: Option<String>) -> Result<Option<rust_decimal::Decimal>> {
    match v {
        None => Ok(None),
        Some(s) => s
            .parse()
            .map(Some)
            .map_err(|e| EtlError::Corrupt(format!("{}={:?}: {}", col, s, e))),
    }
}
