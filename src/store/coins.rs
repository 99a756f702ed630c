use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};

use crate::error::Result;
use crate::types::{CanonicalCoin, SourceMapping};

pub fn find_by_symbol(c: &Connection, symbol: &str) -> Result<Option<CanonicalCoin>> {
    Ok(c.query_row(
        "SELECT id, symbol, name FROM coins WHERE symbol = ?1",
        params![symbol],
        |r| Ok(CanonicalCoin { id: r.get(0)?, symbol: r.get(1)?, name: r.get(2)? }),
    )
    .optional()?)
}

pub fn find_by_id(c: &Connection, id: i64) -> Result<Option<CanonicalCoin>> {
    Ok(c.query_row(
        "SELECT id, symbol, name FROM coins WHERE id = ?1",
        params![id],
        |r| Ok(CanonicalCoin { id: r.get(0)?, symbol: r.get(1)?, name: r.get(2)? }),
    )
    .optional()?)
}

pub fn insert_coin(c: &Connection, symbol: &str, name: &str) -> Result<CanonicalCoin> {
    let now = Utc::now();
    c.execute(
        "INSERT INTO coins (symbol, name, created_at, updated_at) VALUES (?1, ?2, ?3, ?3)",
        params![symbol, name, now],
    )?;
    Ok(CanonicalCoin {
        id: c.last_insert_rowid(),
        symbol: symbol.to_string(),
        name: name.to_string(),
    })
}

pub fn touch_coin(c: &Connection, id: i64) -> Result<()> {
    c.execute("UPDATE coins SET updated_at = ?2 WHERE id = ?1", params![id, Utc::now()])?;
    Ok(())
}

pub fn find_mapping(
    c: &Connection,
    source: &str,
    source_id: &str,
) -> Result<Option<SourceMapping>> {
    Ok(c.query_row(
        "SELECT coin_id, source, source_id, source_symbol, source_name, last_seen
         FROM coin_source_mappings WHERE source = ?1 AND source_id = ?2",
        params![source, source_id],
        |r| {
            Ok(SourceMapping {
                coin_id: r.get(0)?,
                source: r.get(1)?,
                source_id: r.get(2)?,
                source_symbol: r.get(3)?,
                source_name: r.get(4)?,
                last_seen: r.get(5)?,
            })
        },
    )
    .optional()?)
}

pub fn insert_mapping(c: &Connection, m: &SourceMapping) -> Result<()> {
    c.execute(
        "INSERT INTO coin_source_mappings
         (coin_id, source, source_id, source_symbol, source_name, created_at, last_seen)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6)",
        params![m.coin_id, m.source, m.source_id, m.source_symbol, m.source_name, m.last_seen],
    )?;
    Ok(())
}

pub fn touch_mapping(c: &Connection, source: &str, source_id: &str) -> Result<()> {
    c.execute(
        "UPDATE coin_source_mappings SET last_seen = ?3 WHERE source = ?1 AND source_id = ?2",
        params![source, source_id, Utc::now()],
    )?;
    Ok(())
}

pub fn mappings_for_coin(c: &Connection, coin_id: i64) -> Result<Vec<SourceMapping>> {
    let mut stmt = c.prepare(
        "SELECT coin_id, source, source_id, source_symbol, source_name, last_seen
         FROM coin_source_mappings WHERE coin_id = ?1 ORDER BY source, source_id",
    )?;
    let rows = stmt.query_map(params![coin_id], |r| {
        Ok(SourceMapping {
            coin_id: r.get(0)?,
            source: r.get(1)?,
            source_id: r.get(2)?,
            source_symbol: r.get(3)?,
            source_name: r.get(4)?,
            last_seen: r.get(5)?,
        })
    })?;
    Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
}
