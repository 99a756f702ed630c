use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// One record as returned by a source, before it has a raw-store position.
#[derive(Debug, Clone)]
pub struct FetchedRecord {
    pub payload: serde_json::Value,
    pub fetched_at: DateTime<Utc>,
}

impl FetchedRecord {
    pub fn new(payload: serde_json::Value) -> Self {
        Self { payload, fetched_at: Utc::now() }
    }
}

/// Append-only audit copy of a fetched record.
#[derive(Debug, Clone, Serialize)]
pub struct RawRecord {
    pub id: i64,
    pub source_name: String,
    pub payload: serde_json::Value,
    pub fetched_at: DateTime<Utc>,
}

/// Output of a source's `normalize`: canonical fields, symbol not yet aliased.
#[derive(Debug, Clone, PartialEq)]
pub struct NormalizedAsset {
    pub source_id: String,
    pub symbol: String,
    pub name: String,
    pub price_usd: Option<Decimal>,
    pub market_cap: Option<Decimal>,
    pub source: String,
}

/// Per-source observation of a coin. Unique on (symbol, source).
#[derive(Debug, Clone, Serialize)]
pub struct CanonicalAsset {
    pub id: i64,
    pub coin_id: i64,
    pub symbol: String,
    pub name: String,
    pub price_usd: Option<Decimal>,
    pub market_cap: Option<Decimal>,
    pub source: String,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CanonicalCoin {
    pub id: i64,
    pub symbol: String,
    pub name: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct SourceMapping {
    pub coin_id: i64,
    pub source: String,
    pub source_id: String,
    pub source_symbol: String,
    pub source_name: String,
    pub last_seen: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CheckpointStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl CheckpointStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CheckpointStatus::Pending => "pending",
            CheckpointStatus::Running => "running",
            CheckpointStatus::Completed => "completed",
            CheckpointStatus::Failed => "failed",
        }
    }
}

impl std::str::FromStr for CheckpointStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(CheckpointStatus::Pending),
            "running" => Ok(CheckpointStatus::Running),
            "completed" => Ok(CheckpointStatus::Completed),
            "failed" => Ok(CheckpointStatus::Failed),
            other => Err(format!("unknown checkpoint status `{}`", other)),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Checkpoint {
    pub source: String,
    pub last_processed_id: Option<i64>,
    pub last_processed_at: Option<DateTime<Utc>>,
    pub status: CheckpointStatus,
    pub run_id: String,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Completed,
    Failed,
}

/// Outcome of one `run_source` pass.
#[derive(Debug, Clone, Serialize)]
pub struct RunResult {
    pub source: String,
    pub status: RunStatus,
    pub run_id: Option<String>,
    pub records_fetched: usize,
    pub records_processed: usize,
    pub records_skipped: usize,
    pub batches_committed: usize,
    pub last_position: Option<i64>,
    pub duration_ms: u64,
    pub error: Option<String>,
    // Set when the source could not be read; the run still completes empty.
    pub fetch_error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PassSummary {
    pub started_at: DateTime<Utc>,
    pub duration_ms: u64,
    pub sources: Vec<RunResult>,
}

impl PassSummary {
    pub fn failed(&self) -> usize {
        self.sources.iter().filter(|r| r.status == RunStatus::Failed).count()
    }

    pub fn records_processed(&self) -> usize {
        self.sources.iter().map(|r| r.records_processed).sum()
    }
}
