use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::Json;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::time::Instant;
use uuid::Uuid;

use super::{ApiError, AppState};
use crate::pipeline::identity::IdentityResolver;
use crate::stats::{now_ms, StatsSnapshot};
use crate::store::{AssetQuery, AssetStore, CheckpointStore, RawStore};
use crate::types::{
    CanonicalAsset, CanonicalCoin, Checkpoint, CheckpointStatus, RawRecord, SourceMapping,
};

const DEFAULT_PAGE_SIZE: i64 = 50;
const MAX_PAGE_SIZE: i64 = 100;

pub async fn index() -> Json<Value> {
    Json(json!({
        "service": env!("CARGO_PKG_NAME"),
        "version": env!("CARGO_PKG_VERSION"),
        "endpoints": ["/data", "/health", "/stats", "/coins/{symbol}", "/raw/{id}"],
    }))
}

#[derive(Debug, Default, Deserialize)]
pub struct DataParams {
    pub page: Option<i64>,
    pub page_size: Option<i64>,
    pub symbol: Option<String>,
    pub source: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct DataResponse {
    pub request_id: String,
    pub latency_ms: f64,
    pub data: Vec<CanonicalAsset>,
    pub total: u64,
    pub page: u32,
    pub page_size: u32,
}

pub async fn data(
    State(st): State<AppState>,
    Query(p): Query<DataParams>,
) -> Result<Json<DataResponse>, ApiError> {
    let t0 = Instant::now();
    let request_id = Uuid::new_v4().to_string();

    let page = p.page.unwrap_or(1);
    if page < 1 || page > u32::MAX as i64 {
        return Err(ApiError::Invalid(format!("page must be >= 1, got {}", page)));
    }
    let page_size = p.page_size.unwrap_or(DEFAULT_PAGE_SIZE);
    if !(1..=MAX_PAGE_SIZE).contains(&page_size) {
        return Err(ApiError::Invalid(format!(
            "page_size must be between 1 and {}, got {}",
            MAX_PAGE_SIZE, page_size
        )));
    }

    let q = AssetQuery {
        page: page as u32,
        page_size: page_size as u32,
        symbol: p.symbol,
        source: p.source,
    };
    let res = AssetStore::new(st.db.clone()).query(&q)?;

    let latency_ms = t0.elapsed().as_secs_f64() * 1000.0;
    tracing::debug!(
        request_id = %request_id,
        total = res.total,
        rows = res.data.len(),
        latency_ms,
        "data served"
    );
    Ok(Json(DataResponse {
        request_id,
        latency_ms,
        data: res.data,
        total: res.total,
        page: q.page,
        page_size: q.page_size,
    }))
}

#[derive(Debug, Serialize)]
pub struct HealthReport {
    pub overall: &'static str,
    pub database: &'static str,
    pub etl: &'static str,
    pub timestamp: DateTime<Utc>,
}

/// 503 only when the database cannot answer; a failed source is `degraded`.
pub async fn health(State(st): State<AppState>) -> (StatusCode, Json<HealthReport>) {
    let timestamp = Utc::now();
    if let Err(e) = st.db.ping() {
        tracing::error!(error = %e, "database health check failed");
        let report = HealthReport {
            overall: "unhealthy",
            database: "unhealthy",
            etl: "unknown",
            timestamp,
        };
        return (StatusCode::SERVICE_UNAVAILABLE, Json(report));
    }

    let etl = match CheckpointStore::new(st.db.clone()).list() {
        Ok(cps) if cps.iter().any(|c| c.status == CheckpointStatus::Failed) => "degraded",
        Ok(_) => "healthy",
        Err(e) => {
            tracing::warn!(error = %e, "could not read checkpoints for health");
            "unknown"
        }
    };
    let report = HealthReport { overall: "healthy", database: "healthy", etl, timestamp };
    (StatusCode::OK, Json(report))
}

#[derive(Debug, Default, Serialize)]
pub struct SourceStats {
    pub status: Option<CheckpointStatus>,
    pub last_processed_id: Option<i64>,
    pub last_processed_at: Option<DateTime<Utc>>,
    pub run_id: Option<String>,
    pub last_error: Option<String>,
    pub raw_records: u64,
}

impl From<&Checkpoint> for SourceStats {
    fn from(c: &Checkpoint) -> Self {
        Self {
            status: Some(c.status),
            last_processed_id: c.last_processed_id,
            last_processed_at: c.last_processed_at,
            run_id: Some(c.run_id.clone()),
            last_error: c.last_error.clone(),
            raw_records: 0,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct StatsReport {
    pub last_success: Option<DateTime<Utc>>,
    pub last_failure: Option<DateTime<Utc>>,
    pub assets_total: u64,
    pub sources: BTreeMap<String, SourceStats>,
    pub pipeline: StatsSnapshot,
}

pub async fn stats(State(st): State<AppState>) -> Result<Json<StatsReport>, ApiError> {
    let cps = CheckpointStore::new(st.db.clone()).list()?;

    // Registered sources that have never run still show up, with empty fields.
    let mut sources: BTreeMap<String, SourceStats> =
        st.sources.iter().map(|s| (s.clone(), SourceStats::default())).collect();
    for c in &cps {
        sources.insert(c.source.clone(), SourceStats::from(c));
    }
    let raw = RawStore::new(st.db.clone());
    for (name, s) in sources.iter_mut() {
        s.raw_records = raw.count(name)?;
    }

    let last_success = cps
        .iter()
        .filter(|c| c.status == CheckpointStatus::Completed)
        .filter_map(|c| c.last_processed_at)
        .max();
    let last_failure = cps
        .iter()
        .filter(|c| c.status == CheckpointStatus::Failed)
        .map(|c| c.updated_at)
        .max();

    let assets_total = AssetStore::new(st.db.clone()).count()?;

    Ok(Json(StatsReport {
        last_success,
        last_failure,
        assets_total,
        sources,
        pipeline: st.stats.snapshot(now_ms()),
    }))
}

#[derive(Debug, Serialize)]
pub struct CoinView {
    pub coin: CanonicalCoin,
    pub mappings: Vec<SourceMapping>,
    pub assets: Vec<CanonicalAsset>,
}

#[derive(Debug, Default, Deserialize)]
pub struct CoinParams {
    pub source: Option<String>,
}

/// One merged coin with every source id linked to it and the per-source rows.
/// With `?source=` the path is that source's native id instead of a symbol.
pub async fn coin(
    State(st): State<AppState>,
    Path(key): Path<String>,
    Query(p): Query<CoinParams>,
) -> Result<Json<CoinView>, ApiError> {
    let ids = IdentityResolver::new(st.db.clone());
    let found = match p.source.as_deref() {
        Some(source) => ids.coin_by_source_id(source, &key)?,
        None => ids.coin_by_symbol(&key)?,
    };
    let coin = found.ok_or_else(|| match &p.source {
        Some(source) => ApiError::NotFound(format!("unknown {} id {}", source, key)),
        None => ApiError::NotFound(format!("unknown coin {}", key)),
    })?;
    let mappings = ids.sources_for_coin(coin.id)?;

    let store = AssetStore::new(st.db.clone());
    let mut assets = Vec::new();
    let mut seen: Vec<&str> = Vec::new();
    for m in &mappings {
        if seen.contains(&m.source.as_str()) {
            continue;
        }
        seen.push(&m.source);
        if let Some(a) = store.find(&coin.symbol, &m.source)? {
            assets.push(a);
        }
    }

    Ok(Json(CoinView { coin, mappings, assets }))
}

/// The stored audit copy at one raw position, as a checkpoint refers to it.
pub async fn raw_record(
    State(st): State<AppState>,
    Path(id): Path<i64>,
) -> Result<Json<RawRecord>, ApiError> {
    RawStore::new(st.db.clone())
        .get(id)?
        .map(Json)
        .ok_or_else(|| ApiError::NotFound(format!("no raw record {}", id)))
}
