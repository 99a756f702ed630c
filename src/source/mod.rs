pub mod coingecko;
pub mod coinpaprika;
pub mod csv_file;

use async_trait::async_trait;
use rust_decimal::Decimal;
use serde_json::Value;
use std::time::Duration;

use crate::config::{non_empty, Settings};
use crate::error::{FetchError, NormalizeError};
use crate::store::RawStore;
use crate::types::{FetchedRecord, NormalizedAsset};

pub use coingecko::CoinGeckoSource;
pub use coinpaprika::CoinPaprikaSource;
pub use csv_file::CsvFileSource;

/// Abstraction for price sources (REST APIs, flat files).
#[async_trait]
pub trait SourceAdapter: Send + Sync {
    fn name(&self) -> &str;

    /// Fetch the records available from `resume_from` on, in source order.
    /// Must be safe to repeat. Sources without stable positions ignore
    /// `resume_from` and return their whole current snapshot.
    async fn fetch(&self, resume_from: Option<i64>) -> Result<Vec<FetchedRecord>, FetchError>;

    /// Map one raw payload to canonical fields.
    fn normalize(&self, payload: &Value) -> Result<NormalizedAsset, NormalizeError>;

    /// Append to the raw store; the returned id is the record's position.
    fn save_raw(&self, raw: &RawStore, record: &FetchedRecord) -> crate::error::Result<i64> {
        raw.append(self.name(), record)
    }
}

/// Sources by name, iterated in registration order.
#[derive(Default)]
pub struct SourceRegistry {
    sources: Vec<Box<dyn SourceAdapter>>,
}

impl SourceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, source: Box<dyn SourceAdapter>) -> anyhow::Result<()> {
        if self.get(source.name()).is_some() {
            anyhow::bail!("source registered twice: {}", source.name());
        }
        self.sources.push(source);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&dyn SourceAdapter> {
        self.sources.iter().find(|s| s.name() == name).map(|s| s.as_ref())
    }

    pub fn names(&self) -> Vec<String> {
        self.sources.iter().map(|s| s.name().to_string()).collect()
    }

    pub fn len(&self) -> usize {
        self.sources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sources.is_empty()
    }

    pub fn from_settings(s: &Settings) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(s.fetch_timeout_sec.max(1)))
            .build()?;

        let mut reg = Self::new();
        for name in s.source_names() {
            let source: Box<dyn SourceAdapter> = match name.as_str() {
                coinpaprika::NAME => Box::new(CoinPaprikaSource::new(
                    http.clone(),
                    s.coinpaprika_base_url.clone(),
                    non_empty(&s.coinpaprika_api_key),
                )),
                coingecko::NAME => Box::new(CoinGeckoSource::new(
                    http.clone(),
                    s.coingecko_base_url.clone(),
                    non_empty(&s.coingecko_api_key),
                    s.coingecko_per_page,
                    s.coingecko_pages,
                    s.coingecko_concurrency,
                )),
                csv_file::NAME => Box::new(CsvFileSource::new(s.csv_path())),
                other => anyhow::bail!("unknown source in SOURCES: {}", other),
            };
            reg.register(source)?;
        }
        tracing::info!(sources = ?reg.names(), "sources registered");
        Ok(reg)
    }
}

/// Accepts JSON numbers and numeric strings, including exponent notation.
pub(crate) fn decimal_from(v: &Value) -> Option<Decimal> {
    let s = match v {
        Value::Number(n) => n.to_string(),
        Value::String(s) => s.trim().to_string(),
        _ => return None,
    };
    if s.is_empty() {
        return None;
    }
    s.parse::<Decimal>().ok().or_else(|| Decimal::from_scientific(&s).ok())
}

/// First non-empty string (or number, stringified) among `keys`.
pub(crate) fn text_field(v: &Value, keys: &[&str]) -> Option<String> {
    keys.iter().find_map(|k| match v.get(*k) {
        Some(Value::String(s)) if !s.trim().is_empty() => Some(s.trim().to_string()),
        Some(Value::Number(n)) => Some(n.to_string()),
        _ => None,
    })
}

/// Shared shape for `{id, symbol, name, ...}` records.
pub(crate) fn identity_fields(
    payload: &Value,
    symbol_keys: &[&str],
    name_keys: &[&str],
    id_keys: &[&str],
) -> Result<(String, String, String), NormalizeError> {
    if !payload.is_object() {
        return Err(NormalizeError::NotAnObject);
    }
    let symbol = text_field(payload, symbol_keys).ok_or(NormalizeError::MissingField("symbol"))?;
    let name = text_field(payload, name_keys).unwrap_or_else(|| symbol.clone());
    let source_id = text_field(payload, id_keys).unwrap_or_else(|| symbol.to_uppercase());
    Ok((source_id, symbol, name))
}
