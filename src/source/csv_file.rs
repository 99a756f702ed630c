use async_trait::async_trait;
use rust_decimal::Decimal;
use serde_json::{Map, Value};
use std::path::PathBuf;

use super::{decimal_from, identity_fields, SourceAdapter};
use crate::error::{FetchError, NormalizeError};
use crate::types::{FetchedRecord, NormalizedAsset};

pub const NAME: &str = "csv_source";

const SYMBOL_KEYS: &[&str] = &["symbol", "Symbol", "SYMBOL"];
const NAME_KEYS: &[&str] = &["name", "Name", "NAME"];
const ID_KEYS: &[&str] = &["id", "Id", "ID"];
const PRICE_KEYS: &[&str] = &["price", "Price", "PRICE", "price_usd", "priceUSD"];
const CAP_KEYS: &[&str] = &["market_cap", "MarketCap", "MARKET_CAP", "marketCap"];

/// Header CSV file, one coin per row. Re-read whole on every pass.
pub struct CsvFileSource {
    path: PathBuf,
}

impl CsvFileSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl SourceAdapter for CsvFileSource {
    fn name(&self) -> &str {
        NAME
    }

    async fn fetch(&self, resume_from: Option<i64>) -> Result<Vec<FetchedRecord>, FetchError> {
        let bytes = match tokio::fs::read(&self.path).await {
            Ok(b) => b,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::warn!(
                    path = %self.path.display(),
                    "csv file not found, nothing to ingest"
                );
                return Ok(Vec::new());
            }
            Err(e) => return Err(e.into()),
        };
        tracing::debug!(
            path = %self.path.display(),
            ?resume_from,
            bytes = bytes.len(),
            "reading csv source"
        );

        let mut rdr = csv::ReaderBuilder::new().trim(csv::Trim::All).from_reader(bytes.as_slice());
        let headers = rdr.headers()?.clone();

        let mut out = Vec::new();
        for row in rdr.records() {
            let row = row?;
            let mut obj = Map::new();
            for (k, v) in headers.iter().zip(row.iter()) {
                obj.insert(k.to_string(), Value::String(v.to_string()));
            }
            out.push(FetchedRecord::new(Value::Object(obj)));
        }
        Ok(out)
    }

    fn normalize(&self, payload: &Value) -> Result<NormalizedAsset, NormalizeError> {
        normalize_flat(NAME, payload)
    }
}

/// Flat records with loosely-cased column names. An unparseable price or
/// market cap becomes `None`; the record itself is kept.
pub(crate) fn normalize_flat(
    source: &str,
    payload: &Value,
) -> Result<NormalizedAsset, NormalizeError> {
    let (source_id, symbol, name) = identity_fields(payload, SYMBOL_KEYS, NAME_KEYS, ID_KEYS)?;
    Ok(NormalizedAsset {
        source_id,
        symbol: symbol.to_uppercase(),
        name,
        price_usd: first_decimal(payload, PRICE_KEYS),
        market_cap: first_decimal(payload, CAP_KEYS),
        source: source.to_string(),
    })
}

fn first_decimal(payload: &Value, keys: &[&str]) -> Option<Decimal> {
    keys.iter().find_map(|k| payload.get(*k).and_then(decimal_from))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;
    use std::io::Write;

    fn write_csv(body: &str) -> tempfile::NamedTempFile {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        f.write_all(body.as_bytes()).unwrap();
        f
    }

    #[tokio::test]
    async fn reads_rows_in_file_order() {
        let f = write_csv(
            "Symbol,Name,Price,MarketCap\nbtc,Bitcoin,50000,1000000\neth, Ethereum ,3000.5,\n",
        );
        let src = CsvFileSource::new(f.path());
        let rows = src.fetch(None).await.unwrap();
        assert_eq!(rows.len(), 2);

        let btc = src.normalize(&rows[0].payload).unwrap();
        assert_eq!(btc.symbol, "BTC");
        assert_eq!(btc.source_id, "BTC");
        assert_eq!(btc.price_usd, Some(dec!(50000)));
        assert_eq!(btc.market_cap, Some(dec!(1000000)));

        let eth = src.normalize(&rows[1].payload).unwrap();
        assert_eq!(eth.name, "Ethereum");
        assert_eq!(eth.price_usd, Some(dec!(3000.5)));
        assert_eq!(eth.market_cap, None);
        assert_eq!(eth.source, "csv_source");
    }

    #[tokio::test]
    async fn missing_file_is_empty_not_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let src = CsvFileSource::new(dir.path().join("nope.csv"));
        assert!(src.fetch(None).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn ragged_file_is_a_fetch_error() {
        let f = write_csv("symbol,name,price\nbtc,Bitcoin\n");
        let err = CsvFileSource::new(f.path()).fetch(None).await.unwrap_err();
        assert!(matches!(err, FetchError::Csv(_)), "{err:?}");
    }

    #[test]
    fn bad_price_falls_through_to_next_column() {
        let n = normalize_flat(
            NAME,
            &serde_json::json!({"id": "7", "symbol": "sol", "price": "n/a", "price_usd": "150.25"}),
        )
        .unwrap();
        assert_eq!(n.source_id, "7");
        assert_eq!(n.name, "sol");
        assert_eq!(n.price_usd, Some(dec!(150.25)));
    }

    #[test]
    fn blank_symbol_is_rejected() {
        let blank = serde_json::json!({"symbol": "  ", "name": "Ghost"});
        let err = normalize_flat(NAME, &blank).unwrap_err();
        assert_eq!(err, NormalizeError::MissingField("symbol"));
    }
}
