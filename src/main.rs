mod api;
mod config;
mod error;
mod pipeline;
mod source;
mod stats;
mod store;
mod types;

use anyhow::Result;
use std::time::Duration;
use tokio::sync::watch;
use tracing_subscriber::EnvFilter;

use crate::config::Settings;
use crate::pipeline::{scheduler, Orchestrator};
use crate::source::SourceRegistry;
use crate::stats::{now_ms, Stats};
use crate::store::Database;

#[tokio::main]
async fn main() -> Result<()> {
    let s = Settings::from_env()?;

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&s.log_level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let run_config = s.run_config()?;
    let db = Database::open(&s.database_path)?;
    let registry = SourceRegistry::from_settings(&s)?;
    if registry.is_empty() {
        tracing::warn!(sources = %s.sources, "no sources configured, passes will be empty");
    }
    let stats = Stats::new(now_ms());

    let checkpoints = store::CheckpointStore::new(db.clone());
    for name in registry.names() {
        match checkpoints.get(&name)? {
            Some(cp) => tracing::info!(
                source = %name,
                status = cp.status.as_str(),
                last_processed_id = ?cp.last_processed_id,
                "resuming from checkpoint"
            ),
            None => tracing::info!(source = %name, "no checkpoint yet, starting fresh"),
        }
    }

    let state = api::AppState {
        db: db.clone(),
        sources: registry.names(),
        stats: stats.clone(),
    };
    let orchestrator = Orchestrator::new(db, registry, run_config, stats.clone());

    tracing::info!(
        batch_size = run_config.batch_size,
        fail_after = ?run_config.fail_after_n_records,
        interval_sec = s.etl_interval_sec,
        "pipeline configured"
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let etl = tokio::spawn(scheduler::run(
        orchestrator,
        stats,
        Duration::from_secs(s.etl_interval_sec.max(1)),
        s.stats_log_sec,
        shutdown_rx,
    ));

    let addr = format!("{}:{}", s.api_host, s.api_port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!(addr = %addr, "api listening");

    axum::serve(listener, api::router(state))
        .with_graceful_shutdown(async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!(error = %e, "ctrl-c handler failed");
            }
            tracing::info!("shutdown requested");
            let _ = shutdown_tx.send(true);
        })
        .await?;

    // Lets an in-flight pass finish before exit.
    etl.await?;
    tracing::info!("bye");
    Ok(())
}
