use async_trait::async_trait;
use futures::{stream, StreamExt};
use serde_json::Value;

use super::coinpaprika::json_kind;
use super::{decimal_from, identity_fields, SourceAdapter};
use crate::error::{FetchError, NormalizeError};
use crate::types::{FetchedRecord, NormalizedAsset};

pub const NAME: &str = "coingecko";

/// CoinGecko `/coins/markets`, page-numbered. Pages are requested with
/// bounded concurrency but yielded strictly in page order; the first short
/// page ends the listing. Page numbers shift as market caps move, so there
/// is no stable position to resume from.
pub struct CoinGeckoSource {
    base_url: String,
    api_key: Option<String>,
    http: reqwest::Client,
    per_page: usize,
    pages: usize,
    concurrency: usize,
}

impl CoinGeckoSource {
    pub fn new(
        http: reqwest::Client,
        base_url: String,
        api_key: Option<String>,
        per_page: usize,
        pages: usize,
        concurrency: usize,
    ) -> Self {
        Self {
            base_url,
            api_key,
            http,
            per_page: per_page.clamp(1, 250),
            pages: pages.max(1),
            concurrency: concurrency.max(1),
        }
    }

    async fn fetch_page(&self, page: usize) -> Result<Vec<Value>, FetchError> {
        let url = format!("{}/coins/markets", self.base_url.trim_end_matches('/'));
        let mut req = self.http.get(&url).query(&[
            ("vs_currency", "usd".to_string()),
            ("order", "market_cap_desc".to_string()),
            ("per_page", self.per_page.to_string()),
            ("page", page.to_string()),
        ]);
        if let Some(key) = &self.api_key {
            req = req.header("x-cg-demo-api-key", key);
        }
        let body: Value = req.send().await?.error_for_status()?.json().await?;
        match body {
            Value::Array(items) => Ok(items),
            other => Err(FetchError::Decode(format!(
                "expected a json array from {} page {}, got {}",
                url,
                page,
                json_kind(&other)
            ))),
        }
    }
}

#[async_trait]
impl SourceAdapter for CoinGeckoSource {
    fn name(&self) -> &str {
        NAME
    }

    async fn fetch(&self, resume_from: Option<i64>) -> Result<Vec<FetchedRecord>, FetchError> {
        tracing::debug!(
            ?resume_from,
            pages = self.pages,
            per_page = self.per_page,
            conc = self.concurrency,
            "fetching coingecko markets"
        );

        let mut out: Vec<FetchedRecord> = Vec::new();
        let mut pages = stream::iter((1..=self.pages).map(|p| self.fetch_page(p)))
            .buffered(self.concurrency);

        while let Some(res) = pages.next().await {
            let items = res?;
            let short = items.len() < self.per_page;
            out.extend(items.into_iter().map(FetchedRecord::new));
            if short {
                break;
            }
        }

        Ok(out)
    }

    fn normalize(&self, payload: &Value) -> Result<NormalizedAsset, NormalizeError> {
        let (source_id, symbol, name) = identity_fields(payload, &["symbol"], &["name"], &["id"])?;
        Ok(NormalizedAsset {
            source_id,
            symbol: symbol.to_uppercase(),
            name,
            price_usd: payload.get("current_price").and_then(decimal_from),
            market_cap: payload.get("market_cap").and_then(decimal_from),
            source: NAME.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;
    use serde_json::json;
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn coins(prefix: &str, n: usize) -> Value {
        Value::Array(
            (0..n)
                .map(|i| {
                    let id = format!("{}{}", prefix, i);
                    json!({"id": id, "symbol": id, "name": "x"})
                })
                .collect(),
        )
    }

    async fn mount_page(server: &MockServer, page: &str, body: Value) {
        Mock::given(method("GET"))
            .and(path("/coins/markets"))
            .and(query_param("vs_currency", "usd"))
            .and(query_param("page", page))
            .respond_with(ResponseTemplate::new(200).set_body_json(body))
            .mount(server)
            .await;
    }

    #[test]
    fn normalizes_flat_market_row() {
        let s =
            CoinGeckoSource::new(reqwest::Client::new(), "http://unused".into(), None, 250, 1, 1);
        let n = s
            .normalize(&json!({
                "id": "bitcoin",
                "symbol": "btc",
                "name": "Bitcoin",
                "current_price": 50123.5,
                "market_cap": null
            }))
            .unwrap();
        assert_eq!(n.source_id, "bitcoin");
        assert_eq!(n.symbol, "BTC");
        assert_eq!(n.price_usd, Some(dec!(50123.5)));
        assert_eq!(n.market_cap, None);
        assert_eq!(n.source, "coingecko");
    }

    #[tokio::test]
    async fn pages_come_back_in_order_and_stop_when_short() {
        let server = MockServer::start().await;
        mount_page(&server, "1", coins("a", 2)).await;
        mount_page(&server, "2", coins("b", 2)).await;
        mount_page(&server, "3", coins("c", 1)).await;
        mount_page(&server, "4", coins("d", 2)).await;

        let s = CoinGeckoSource::new(reqwest::Client::new(), server.uri(), None, 2, 5, 3);
        let got = s.fetch(None).await.unwrap();
        let ids: Vec<_> = got
            .iter()
            .map(|r| r.payload["id"].as_str().unwrap().to_string())
            .collect();
        assert_eq!(ids, vec!["a0", "a1", "b0", "b1", "c0"]);
    }

    #[tokio::test]
    async fn failing_page_fails_the_fetch() {
        let server = MockServer::start().await;
        mount_page(&server, "1", coins("a", 2)).await;
        Mock::given(method("GET"))
            .and(path("/coins/markets"))
            .and(query_param("page", "2"))
            .respond_with(ResponseTemplate::new(429))
            .mount(&server)
            .await;

        let s = CoinGeckoSource::new(reqwest::Client::new(), server.uri(), None, 2, 2, 1);
        let err = s.fetch(None).await.unwrap_err();
        assert!(matches!(err, FetchError::HttpStatus { status: 429, .. }), "{err:?}");
    }
}
