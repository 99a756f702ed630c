use chrono::Utc;
use rusqlite::types::Value;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, Row};
use serde::Serialize;

use super::{parse_decimal, Database};
use crate::error::Result;
use crate::types::CanonicalAsset;

const COLUMNS: &str = "id, coin_id, symbol, name, price_usd, market_cap, source, updated_at";

/// Canonical fields ready to be written, symbol already alias-normalized.
#[derive(Debug, Clone)]
pub struct AssetUpsert<'a> {
    pub coin_id: i64,
    pub symbol: &'a str,
    pub name: &'a str,
    pub price_usd: Option<rust_decimal::Decimal>,
    pub market_cap: Option<rust_decimal::Decimal>,
    pub source: &'a str,
}

/// Update-if-exists-else-insert on (symbol, source). An existing row keeps
/// its id; name, prices and `coin_id` are overwritten and `updated_at`
/// moves to now. Callers run this inside the same transaction as identity
/// resolution.
pub fn upsert(c: &Connection, a: &AssetUpsert<'_>) -> Result<i64> {
    let id: i64 = c.query_row(
        "INSERT INTO assets (coin_id, symbol, name, price_usd, market_cap, source, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
         ON CONFLICT(symbol, source) DO UPDATE SET
             coin_id = excluded.coin_id,
             name = excluded.name,
             price_usd = excluded.price_usd,
             market_cap = excluded.market_cap,
             updated_at = excluded.updated_at
         RETURNING id",
        params![
            a.coin_id,
            a.symbol,
            a.name,
            a.price_usd.map(|d| d.to_string()),
            a.market_cap.map(|d| d.to_string()),
            a.source,
            Utc::now(),
        ],
        |r| r.get(0),
    )?;
    Ok(id)
}

#[derive(Debug, Clone)]
pub struct AssetQuery {
    pub page: u32,
    pub page_size: u32,
    pub symbol: Option<String>,
    pub source: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct AssetPage {
    pub data: Vec<CanonicalAsset>,
    pub total: u64,
}

#[derive(Clone)]
pub struct AssetStore {
    db: Database,
}

impl AssetStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    pub fn find(&self, symbol: &str, source: &str) -> Result<Option<CanonicalAsset>> {
        self.db.with_conn(|c| {
            let row = c
                .query_row(
                    &format!("SELECT {} FROM assets WHERE symbol = ?1 AND source = ?2", COLUMNS),
                    params![symbol, source],
                    from_row,
                )
                .optional()?;
            row.transpose()
        })
    }

    pub fn count(&self) -> Result<u64> {
        self.db.with_conn(|c| {
            let n: i64 = c.query_row("SELECT COUNT(*) FROM assets", [], |r| r.get(0))?;
            Ok(n as u64)
        })
    }

    /// Most recently updated first. `symbol` is a case-insensitive substring
    /// match, `source` is exact.
    pub fn query(&self, q: &AssetQuery) -> Result<AssetPage> {
        let mut clauses: Vec<&str> = Vec::new();
        let mut args: Vec<Value> = Vec::new();
        if let Some(sym) = q.symbol.as_ref().filter(|s| !s.is_empty()) {
            clauses.push("symbol LIKE ? ESCAPE '\\'");
            args.push(Value::Text(format!("%{}%", escape_like(sym))));
        }
        if let Some(src) = q.source.as_ref().filter(|s| !s.is_empty()) {
            clauses.push("source = ?");
            args.push(Value::Text(src.clone()));
        }
        let filter = if clauses.is_empty() {
            String::new()
        } else {
            format!(" WHERE {}", clauses.join(" AND "))
        };

        let page = q.page.max(1) as i64;
        let size = q.page_size.max(1) as i64;

        self.db.with_conn(|c| {
            let total: i64 = c.query_row(
                &format!("SELECT COUNT(*) FROM assets{}", filter),
                params_from_iter(args.iter()),
                |r| r.get(0),
            )?;

            let mut page_args = args.clone();
            page_args.push(Value::Integer(size));
            page_args.push(Value::Integer((page - 1) * size));
            let mut stmt = c.prepare(&format!(
                "SELECT {} FROM assets{} ORDER BY updated_at DESC, id DESC LIMIT ? OFFSET ?",
                COLUMNS, filter
            ))?;
            let rows = stmt.query_map(params_from_iter(page_args.iter()), from_row)?;
            let mut data = Vec::new();
            for r in rows {
                data.push(r??);
            }
            Ok(AssetPage { data, total: total as u64 })
        })
    }
}

fn escape_like(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for ch in s.chars() {
        if matches!(ch, '%' | '_' | '\\') {
            out.push('\\');
        }
        out.push(ch);
    }
    out
}

fn from_row(r: &Row<'_>) -> rusqlite::Result<Result<CanonicalAsset>> {
    let price = parse_decimal("price_usd", r.get(4)?);
    let cap = parse_decimal("market_cap", r.get(5)?);
    let (price_usd, market_cap) = match (price, cap) {
        (Ok(p), Ok(m)) => (p, m),
        (Err(e), _) | (_, Err(e)) => return Ok(Err(e)),
    };
    Ok(Ok(CanonicalAsset {
        id: r.get(0)?,
        coin_id: r.get(1)?,
        symbol: r.get(2)?,
        name: r.get(3)?,
        price_usd,
        market_cap,
        source: r.get(6)?,
        updated_at: r.get(7)?,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::coins;
    use rust_decimal_macros::dec;

    fn seed(db: &Database, symbol: &str, source: &str, price: rust_decimal::Decimal) -> i64 {
        db.with_tx(|tx| {
            let coin = match coins::find_by_symbol(tx, symbol)? {
                Some(c) => c,
                None => coins::insert_coin(tx, symbol, symbol)?,
            };
            upsert(
                tx,
                &AssetUpsert {
                    coin_id: coin.id,
                    symbol,
                    name: symbol,
                    price_usd: Some(price),
                    market_cap: None,
                    source,
                },
            )
        })
        .unwrap()
    }

    #[test]
    fn same_symbol_and_source_keeps_one_row() {
        let db = Database::open_in_memory().unwrap();
        let assets = AssetStore::new(db.clone());

        let first = seed(&db, "BTC", "coinpaprika", dec!(50000));
        let before = assets.find("BTC", "coinpaprika").unwrap().unwrap();
        let second = seed(&db, "BTC", "coinpaprika", dec!(51000));

        assert_eq!(first, second);
        assert_eq!(assets.count().unwrap(), 1);
        let row = assets.find("BTC", "coinpaprika").unwrap().unwrap();
        assert_eq!(row.price_usd, Some(dec!(51000)));
        assert!(row.updated_at >= before.updated_at);
    }

    #[test]
    fn same_symbol_from_other_source_is_a_separate_row() {
        let db = Database::open_in_memory().unwrap();
        let assets = AssetStore::new(db.clone());
        seed(&db, "BTC", "coinpaprika", dec!(50000));
        seed(&db, "BTC", "coingecko", dec!(50010));
        assert_eq!(assets.count().unwrap(), 2);
        let a = assets.find("BTC", "coinpaprika").unwrap().unwrap();
        let b = assets.find("BTC", "coingecko").unwrap().unwrap();
        assert_eq!(a.coin_id, b.coin_id);
    }

    #[test]
    fn query_filters_and_pages() {
        let db = Database::open_in_memory().unwrap();
        let assets = AssetStore::new(db.clone());
        for (sym, src) in [
            ("BTC", "coinpaprika"),
            ("WBTC", "coinpaprika"),
            ("ETH", "coinpaprika"),
            ("BTC", "coingecko"),
        ] {
            seed(&db, sym, src, dec!(1));
        }

        let all = assets
            .query(&AssetQuery { page: 1, page_size: 2, symbol: None, source: None })
            .unwrap();
        assert_eq!(all.total, 4);
        assert_eq!(all.data.len(), 2);
        // newest write first
        let newest = &all.data[0];
        assert_eq!((newest.symbol.as_str(), newest.source.as_str()), ("BTC", "coingecko"));

        let btc = assets
            .query(&AssetQuery {
                page: 1,
                page_size: 50,
                symbol: Some("btc".into()),
                source: Some("coinpaprika".into()),
            })
            .unwrap();
        assert_eq!(btc.total, 2);
        let mut syms: Vec<_> = btc.data.iter().map(|a| a.symbol.clone()).collect();
        syms.sort();
        assert_eq!(syms, vec!["BTC", "WBTC"]);

        let past_end = assets
            .query(&AssetQuery { page: 3, page_size: 2, symbol: None, source: None })
            .unwrap();
        assert_eq!(past_end.total, 4);
        assert!(past_end.data.is_empty());

        let wildcard = assets
            .query(&AssetQuery { page: 1, page_size: 50, symbol: Some("%".into()), source: None })
            .unwrap();
        assert_eq!(wildcard.total, 0);
    }
}
