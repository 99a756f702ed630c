use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

use super::Orchestrator;
use crate::stats::{now_ms, Stats};

/// Runs a pass every `interval` until `shutdown` flips to `true`.
///
/// Shutdown is only observed between passes: a pass that has started always
/// runs to the end, so no batch is ever left half-applied.
pub async fn run(
    orchestrator: Orchestrator,
    stats: Arc<Stats>,
    interval: Duration,
    stats_log_sec: u64,
    mut shutdown: watch::Receiver<bool>,
) {
    tracing::info!(
        interval_sec = interval.as_secs(),
        sources = ?orchestrator.source_names(),
        "scheduler started"
    );

    loop {
        if *shutdown.borrow() {
            break;
        }

        let pass = orchestrator.run_all().await;
        tracing::info!(
            sources = pass.sources.len(),
            failed = pass.failed(),
            processed = pass.records_processed(),
            ms = pass.duration_ms,
            "pass finished"
        );

        if let Some(s) = stats.log_due(now_ms(), stats_log_sec) {
            tracing::info!(
                up_sec = s.up_sec,
                passes = s.passes,
                ok = s.runs_completed,
                failed = s.runs_failed,
                fetch_errors = s.fetch_errors,
                stored = s.records_stored,
                skipped = s.records_skipped,
                "stats"
            );
        }

        tokio::select! {
            _ = tokio::time::sleep(interval) => {}
            changed = shutdown.changed() => {
                // A dropped sender counts as shutdown too.
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
        }
    }

    tracing::info!("scheduler stopped");
}
