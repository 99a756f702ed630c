use async_trait::async_trait;
use serde_json::Value;

use super::{decimal_from, identity_fields, SourceAdapter};
use crate::error::{FetchError, NormalizeError};
use crate::types::{FetchedRecord, NormalizedAsset};

pub const NAME: &str = "coinpaprika";

/// CoinPaprika `/tickers`: one bulk snapshot of every coin, no positions.
pub struct CoinPaprikaSource {
    base_url: String,
    api_key: Option<String>,
    http: reqwest::Client,
}

impl CoinPaprikaSource {
    pub fn new(http: reqwest::Client, base_url: String, api_key: Option<String>) -> Self {
        Self { base_url, api_key, http }
    }
}

#[async_trait]
impl SourceAdapter for CoinPaprikaSource {
    fn name(&self) -> &str {
        NAME
    }

    async fn fetch(&self, resume_from: Option<i64>) -> Result<Vec<FetchedRecord>, FetchError> {
        let url = format!("{}/tickers", self.base_url.trim_end_matches('/'));
        tracing::debug!(url = %url, ?resume_from, "fetching coinpaprika tickers");

        let mut req = self.http.get(&url);
        if let Some(key) = &self.api_key {
            req = req.bearer_auth(key);
        }
        let body: Value = req.send().await?.error_for_status()?.json().await?;

        match body {
            Value::Array(items) => Ok(items.into_iter().map(FetchedRecord::new).collect()),
            other => Err(FetchError::Decode(format!(
                "expected a json array from {}, got {}",
                url,
                json_kind(&other)
            ))),
        }
    }

    fn normalize(&self, payload: &Value) -> Result<NormalizedAsset, NormalizeError> {
        let (source_id, symbol, name) = identity_fields(payload, &["symbol"], &["name"], &["id"])?;
        let usd = payload.get("quotes").and_then(|q| q.get("USD"));
        Ok(NormalizedAsset {
            source_id,
            symbol: symbol.to_uppercase(),
            name,
            price_usd: usd.and_then(|u| u.get("price")).and_then(decimal_from),
            market_cap: usd.and_then(|u| u.get("market_cap")).and_then(decimal_from),
            source: NAME.to_string(),
        })
    }
}

pub(crate) fn json_kind(v: &Value) -> &'static str {
    match v {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
