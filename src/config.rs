use serde::Deserialize;

use crate::pipeline::RunConfig;

#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    pub database_path: String,

    pub etl_interval_sec: u64,
    pub etl_batch_size: usize,
    // Recovery testing: abort a run once this many records went through batches.
    pub fail_after_n_records: Option<String>,
    pub fetch_timeout_sec: u64,

    // Comma-separated, in run order
    pub sources: String,

    pub coinpaprika_base_url: String,
    pub coinpaprika_api_key: Option<String>,

    pub coingecko_base_url: String,
    pub coingecko_api_key: Option<String>,
    pub coingecko_per_page: usize,
    pub coingecko_pages: usize,
    pub coingecko_concurrency: usize,

    pub csv_source_path: Option<String>,

    pub api_host: String,
    pub api_port: u16,

    pub log_level: String,
    pub stats_log_sec: u64,
}

impl Settings {
    pub fn from_env() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();
        let c = config::Config::builder()
            .set_default("database_path", "price_etl.db")?
            .set_default("etl_interval_sec", 300)?
            .set_default("etl_batch_size", 100)?
            .set_default("fetch_timeout_sec", 30)?
            .set_default("sources", "coinpaprika,coingecko,csv_source")?
            .set_default("coinpaprika_base_url", "https://api.coinpaprika.com/v1")?
            .set_default("coingecko_base_url", "https://api.coingecko.com/api/v3")?
            .set_default("coingecko_per_page", 250)?
            .set_default("coingecko_pages", 1)?
            .set_default("coingecko_concurrency", 2)?
            .set_default("api_host", "0.0.0.0")?
            .set_default("api_port", 8000)?
            .set_default("log_level", "info")?
            .set_default("stats_log_sec", 60)?
            .add_source(config::Environment::default())
            .build()?;
        Ok(c.try_deserialize()?)
    }

    pub fn source_names(&self) -> Vec<String> {
        self.sources
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect()
    }

    pub fn csv_path(&self) -> String {
        non_empty(&self.csv_source_path).unwrap_or_else(|| "data/sample.csv".to_string())
    }

    pub fn run_config(&self) -> anyhow::Result<RunConfig> {
        Ok(RunConfig::new(self.etl_batch_size, parse_opt_usize(&self.fail_after_n_records)?))
    }
}

pub fn non_empty(s: &Option<String>) -> Option<String> {
    s.as_ref().map(|x| x.trim().to_string()).filter(|x| !x.is_empty())
}

fn parse_opt_usize(s: &Option<String>) -> anyhow::Result<Option<usize>> {
    Ok(match non_empty(s) {
        Some(v) => Some(v.parse::<usize>()?),
        None => None,
    })
}
