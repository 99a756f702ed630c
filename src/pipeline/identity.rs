//! Canonical coin identity across sources.
//!
//! Merge key is the canonical symbol, not the source's native id: the first
//! time `(source, source_id)` is seen it is linked to the coin whose symbol it
//! normalizes to, and from then on the mapping alone decides the coin.

use chrono::Utc;
use rusqlite::Connection;

use crate::error::{EtlError, Result};
use crate::store::{coins, Database};
use crate::types::{CanonicalCoin, SourceMapping};

/// Hand-maintained: canonical symbol -> spellings sources use for it.
const SYMBOL_ALIASES: &[(&str, &[&str])] = &[
    ("BTC", &["BITCOIN", "XBT"]),
    ("ETH", &["ETHEREUM"]),
    ("USDT", &["TETHER"]),
];

pub fn normalize_symbol(raw: &str) -> String {
    let s = raw.trim().to_uppercase();
    for (canonical, aliases) in SYMBOL_ALIASES {
        if aliases.contains(&s.as_str()) {
            return canonical.to_string();
        }
    }
    s
}

/// Returns the coin for `(source, source_id)`, creating the coin and/or the
/// mapping as needed. Runs on the caller's connection so it can share a
/// transaction with the asset upsert.
pub fn resolve(
    c: &Connection,
    source: &str,
    source_id: &str,
    symbol: &str,
    name: &str,
) -> Result<CanonicalCoin> {
    if let Some(m) = coins::find_mapping(c, source, source_id)? {
        coins::touch_mapping(c, source, source_id)?;
        return coins::find_by_id(c, m.coin_id)?.ok_or_else(|| {
            EtlError::Corrupt(format!(
                "mapping {}:{} points at missing coin {}",
                source, source_id, m.coin_id
            ))
        });
    }

    let canonical = normalize_symbol(symbol);
    let coin = match coins::find_by_symbol(c, &canonical)? {
        Some(coin) => {
            coins::touch_coin(c, coin.id)?;
            coin
        }
        None => {
            let coin = coins::insert_coin(c, &canonical, name.trim())?;
            tracing::info!(symbol = %coin.symbol, coin_id = coin.id, "new canonical coin");
            coin
        }
    };

    coins::insert_mapping(
        c,
        &SourceMapping {
            coin_id: coin.id,
            source: source.to_string(),
            source_id: source_id.to_string(),
            source_symbol: symbol.to_string(),
            source_name: name.to_string(),
            last_seen: Utc::now(),
        },
    )?;
    tracing::debug!(
        source,
        source_id,
        symbol = %coin.symbol,
        coin_id = coin.id,
        "linked source id to coin"
    );
    Ok(coin)
}

/// Standalone access to identity data outside a batch.
#[derive(Clone)]
pub struct IdentityResolver {
    db: Database,
}

impl IdentityResolver {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    pub fn coin_by_symbol(&self, symbol: &str) -> Result<Option<CanonicalCoin>> {
        let canonical = normalize_symbol(symbol);
        self.db.with_conn(|c| coins::find_by_symbol(c, &canonical))
    }

    pub fn coin_by_source_id(
        &self,
        source: &str,
        source_id: &str,
    ) -> Result<Option<CanonicalCoin>> {
        self.db.with_conn(|c| match coins::find_mapping(c, source, source_id)? {
            Some(m) => coins::find_by_id(c, m.coin_id),
            None => Ok(None),
        })
    }

    pub fn sources_for_coin(&self, coin_id: i64) -> Result<Vec<SourceMapping>> {
        self.db.with_conn(|c| coins::mappings_for_coin(c, coin_id))
    }
}
