use chrono::Utc;
use std::sync::Arc;
use std::time::Instant;

use super::batch::process_batch;
use super::RunConfig;
use crate::error::{EtlError, Result};
use crate::source::{SourceAdapter, SourceRegistry};
use crate::stats::Stats;
use crate::store::{CheckpointStore, Database, RawStore};
use crate::types::{PassSummary, RunResult, RunStatus};

/// Drives fetch -> raw -> batch -> advance for every registered source.
pub struct Orchestrator {
    db: Database,
    registry: SourceRegistry,
    config: RunConfig,
    checkpoints: CheckpointStore,
    raw: RawStore,
    stats: Arc<Stats>,
}

// Counters accumulated while a run is in flight, kept when it aborts.
#[derive(Default)]
struct Progress {
    run_id: Option<String>,
    fetched: usize,
    processed: usize,
    skipped: usize,
    batches: usize,
    last_position: Option<i64>,
    fetch_error: Option<String>,
}

impl Orchestrator {
    pub fn new(
        db: Database,
        registry: SourceRegistry,
        config: RunConfig,
        stats: Arc<Stats>,
    ) -> Self {
        Self {
            checkpoints: CheckpointStore::new(db.clone()),
            raw: RawStore::new(db.clone()),
            db,
            registry,
            config,
            stats,
        }
    }

    pub fn source_names(&self) -> Vec<String> {
        self.registry.names()
    }

    /// Only an unknown name is an `Err`; anything going wrong inside the run
    /// comes back as a `Failed` result with the partial counts.
    pub async fn run_source(&self, name: &str) -> Result<RunResult> {
        let source = self
            .registry
            .get(name)
            .ok_or_else(|| EtlError::UnknownSource(name.to_string()))?;
        Ok(self.run_adapter(source).await)
    }

    /// Sources run one after another in registration order; a failing source
    /// never stops the rest of the pass.
    pub async fn run_all(&self) -> PassSummary {
        let started_at = Utc::now();
        let t0 = Instant::now();

        let mut sources = Vec::with_capacity(self.registry.len());
        for name in self.registry.names() {
            match self.run_source(&name).await {
                Ok(r) => sources.push(r),
                Err(e) => tracing::error!(source = %name, error = %e, "source skipped"),
            }
        }

        let pass = PassSummary {
            started_at,
            duration_ms: t0.elapsed().as_millis() as u64,
            sources,
        };
        self.stats.record_pass(&pass);
        pass
    }

    async fn run_adapter(&self, source: &dyn SourceAdapter) -> RunResult {
        let name = source.name();
        let t0 = Instant::now();
        let mut p = Progress::default();

        let outcome = self.execute(source, &mut p).await;
        let (status, error) = match outcome {
            Ok(()) => (RunStatus::Completed, None),
            Err(e) => {
                let reason = e.to_string();
                if let Err(e2) = self.checkpoints.fail(name, &reason) {
                    tracing::error!(source = name, error = %e2, "could not record run failure");
                }
                (RunStatus::Failed, Some(reason))
            }
        };

        let result = RunResult {
            source: name.to_string(),
            status,
            run_id: p.run_id,
            records_fetched: p.fetched,
            records_processed: p.processed,
            records_skipped: p.skipped,
            batches_committed: p.batches,
            last_position: p.last_position,
            duration_ms: t0.elapsed().as_millis() as u64,
            error,
            fetch_error: p.fetch_error,
        };
        tracing::info!(
            source = name,
            status = ?result.status,
            fetched = result.records_fetched,
            processed = result.records_processed,
            skipped = result.records_skipped,
            batches = result.batches_committed,
            ms = result.duration_ms,
            "run finished"
        );
        result
    }

    async fn execute(&self, source: &dyn SourceAdapter, p: &mut Progress) -> Result<()> {
        let name = source.name();
        let run_id = self.checkpoints.start_run(name)?;
        p.run_id = Some(run_id.clone());
        let resume_from = self.checkpoints.last_processed_id(name)?;
        tracing::info!(source = name, run_id = %run_id, ?resume_from, "run started");

        let records = match source.fetch(resume_from).await {
            Ok(r) => r,
            Err(e) => {
                tracing::warn!(
                    source = name,
                    run_id = %run_id,
                    error = %e,
                    "fetch failed, treating as no data"
                );
                p.fetch_error = Some(e.to_string());
                Vec::new()
            }
        };
        p.fetched = records.len();

        if records.is_empty() {
            self.checkpoints.complete(name)?;
            return Ok(());
        }

        for (i, chunk) in records.chunks(self.config.batch_size).enumerate() {
            let mut last = None;
            for record in chunk {
                last = Some(source.save_raw(&self.raw, record)?);
            }

            let out = process_batch(&self.db, source, chunk)?;
            p.processed += out.stored;
            p.skipped += out.skipped;

            if let Some(position) = last {
                self.checkpoints.advance(name, position)?;
                p.last_position = Some(position);
            }
            p.batches += 1;
            tracing::debug!(
                source = name,
                run_id = %run_id,
                batch = i + 1,
                size = chunk.len(),
                stored = out.stored,
                position = ?last,
                "batch committed"
            );

            if let Some(threshold) = self.config.fail_after_n_records {
                let seen = p.processed + p.skipped;
                if seen >= threshold {
                    return Err(EtlError::InjectedFailure { processed: seen, threshold });
                }
            }
        }

        self.checkpoints.complete(name)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::testing::ScriptedSource;
    use crate::source::CoinPaprikaSource;
    use crate::stats::now_ms;
    use crate::store::AssetStore;
    use crate::types::{CheckpointStatus, FetchedRecord, NormalizedAsset};
    use std::time::Duration;

    fn orchestrator(
        db: &Database,
        sources: Vec<ScriptedSource>,
        config: RunConfig,
    ) -> Orchestrator {
        let mut reg = SourceRegistry::new();
        for s in sources {
            reg.register(Box::new(s)).unwrap();
        }
        Orchestrator::new(db.clone(), reg, config, Stats::new(now_ms()))
    }

    fn raw_ids(db: &Database, source: &str) -> Vec<i64> {
        db.with_conn(|c| {
            let mut stmt =
                c.prepare("SELECT id FROM raw_records WHERE source_name = ?1 ORDER BY id")?;
            let ids = stmt
                .query_map([source], |r| r.get(0))?
                .collect::<rusqlite::Result<Vec<i64>>>()?;
            Ok(ids)
        })
        .unwrap()
    }

    fn checkpoint(db: &Database, source: &str) -> crate::types::Checkpoint {
        CheckpointStore::new(db.clone()).get(source).unwrap().unwrap()
    }

    #[tokio::test]
    async fn injected_failure_after_second_batch_keeps_its_checkpoint() {
        let db = Database::open_in_memory().unwrap();
        let orch = orchestrator(
            &db,
            vec![ScriptedSource::with_coins("test_source", 12)],
            RunConfig::new(5, Some(10)),
        );

        let r = orch.run_source("test_source").await.unwrap();
        assert_eq!(r.status, RunStatus::Failed);
        assert_eq!(r.records_fetched, 12);
        assert_eq!(r.records_processed, 10);
        assert_eq!(r.batches_committed, 2);
        assert!(r.error.as_deref().unwrap().contains("failure injection"));

        let ids = raw_ids(&db, "test_source");
        assert_eq!(ids.len(), 10);
        let cp = checkpoint(&db, "test_source");
        assert_eq!(cp.status, CheckpointStatus::Failed);
        assert_eq!(cp.last_processed_id, Some(ids[9]));
        assert_eq!(r.last_position, Some(ids[9]));
        assert_eq!(AssetStore::new(db.clone()).count().unwrap(), 10);
    }

    #[tokio::test]
    async fn next_run_resumes_from_last_advanced_position() {
        let db = Database::open_in_memory().unwrap();
        let failing = orchestrator(
            &db,
            vec![ScriptedSource::with_coins("s", 12)],
            RunConfig::new(5, Some(10)),
        );
        failing.run_source("s").await.unwrap();
        let tenth = raw_ids(&db, "s")[9];

        let healthy = orchestrator(
            &db,
            vec![ScriptedSource::with_coins("s", 12)],
            RunConfig::new(5, None),
        );
        let r = healthy.run_source("s").await.unwrap();
        assert_eq!(r.status, RunStatus::Completed);
        assert_eq!(r.records_processed, 12);

        let cp = checkpoint(&db, "s");
        assert_eq!(cp.status, CheckpointStatus::Completed);
        assert!(cp.last_processed_id.unwrap() > tenth);
        assert_eq!(cp.last_error, None);
        // Re-fetched records collapse onto the rows the failed run already wrote.
        assert_eq!(AssetStore::new(db).count().unwrap(), 12);
    }

    #[tokio::test]
    async fn storage_error_fails_the_run_and_keeps_the_checkpoint() {
        let db = Database::open_in_memory().unwrap();
        let orch = orchestrator(
            &db,
            vec![ScriptedSource::with_coins("s", 5)],
            RunConfig::new(5, None),
        );
        let first = orch.run_source("s").await.unwrap();
        assert_eq!(first.status, RunStatus::Completed);
        let before = checkpoint(&db, "s").last_processed_id;
        assert_eq!(before, raw_ids(&db, "s").last().copied());

        db.with_conn(|c| Ok(c.execute_batch("DROP TABLE assets")?)).unwrap();

        let r = orch.run_source("s").await.unwrap();
        assert_eq!(r.status, RunStatus::Failed);
        assert_eq!(r.records_processed, 0);
        assert_eq!(r.batches_committed, 0);
        assert_eq!(r.last_position, None);

        let cp = checkpoint(&db, "s");
        assert_eq!(cp.status, CheckpointStatus::Failed);
        assert_eq!(cp.last_processed_id, before);
        let reason = cp.last_error.unwrap();
        assert!(reason.contains("storage error"), "{reason}");
        assert_eq!(r.error.as_deref(), Some(reason.as_str()));
    }

    #[tokio::test]
    async fn slow_source_times_out_and_the_run_still_completes() {
        use wiremock::matchers::{method, path};
        use wiremock::{Mock, MockServer, ResponseTemplate};

        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/tickers"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(serde_json::json!([]))
                    .set_delay(Duration::from_millis(800)),
            )
            .mount(&server)
            .await;

        let http = reqwest::Client::builder()
            .timeout(Duration::from_millis(100))
            .build()
            .unwrap();
        let mut reg = SourceRegistry::new();
        reg.register(Box::new(CoinPaprikaSource::new(http, server.uri(), None)))
            .unwrap();
        let db = Database::open_in_memory().unwrap();
        let orch =
            Orchestrator::new(db.clone(), reg, RunConfig::new(5, None), Stats::new(now_ms()));

        let pass = orch.run_all().await;
        let r = &pass.sources[0];
        assert_eq!(r.status, RunStatus::Completed);
        assert_eq!(r.records_fetched, 0);
        assert!(r.fetch_error.as_deref().unwrap().contains("timed out"), "{:?}", r.fetch_error);

        let cp = checkpoint(&db, "coinpaprika");
        assert_eq!(cp.status, CheckpointStatus::Completed);
        assert_eq!(cp.last_processed_id, None);
        assert_eq!(orch.stats.snapshot(now_ms()).fetch_errors, 1);
    }

    #[tokio::test]
    async fn resume_point_is_handed_to_fetch() {
        let db = Database::open_in_memory().unwrap();
        let cps = CheckpointStore::new(db.clone());
        cps.advance("s", 42).unwrap();

        let src = Arc::new(ScriptedSource::new("s", vec![]));
        let mut reg = SourceRegistry::new();
        reg.register(Box::new(SharedSource(src.clone()))).unwrap();
        let orch = Orchestrator::new(db, reg, RunConfig::new(5, None), Stats::new(now_ms()));
        orch.run_source("s").await.unwrap();
        orch.run_source("s").await.unwrap();
        assert_eq!(src.resume_points(), vec![Some(42), Some(42)]);
    }

    #[tokio::test]
    async fn empty_fetch_completes_without_moving_checkpoint() {
        let db = Database::open_in_memory().unwrap();
        CheckpointStore::new(db.clone()).advance("s", 7).unwrap();
        let empty = ScriptedSource::new("s", vec![]);
        let orch = orchestrator(&db, vec![empty], RunConfig::new(5, None));

        let r = orch.run_source("s").await.unwrap();
        assert_eq!(r.status, RunStatus::Completed);
        assert_eq!(r.records_processed, 0);
        assert_eq!(r.fetch_error, None);
        let cp = checkpoint(&db, "s");
        assert_eq!(cp.status, CheckpointStatus::Completed);
        assert_eq!(cp.last_processed_id, Some(7));
    }

    #[tokio::test]
    async fn broken_fetch_is_reported_but_not_fatal() {
        let db = Database::open_in_memory().unwrap();
        let orch = orchestrator(&db, vec![ScriptedSource::broken("down")], RunConfig::new(5, None));

        let r = orch.run_source("down").await.unwrap();
        assert_eq!(r.status, RunStatus::Completed);
        assert_eq!(r.records_fetched, 0);
        assert!(r.fetch_error.as_deref().unwrap().contains("connection refused"));
        assert_eq!(checkpoint(&db, "down").last_processed_id, None);
    }

    #[tokio::test]
    async fn one_failing_source_does_not_stop_the_pass() {
        let db = Database::open_in_memory().unwrap();
        let orch = orchestrator(
            &db,
            vec![
                ScriptedSource::broken("down"),
                ScriptedSource::with_coins("a", 3),
                ScriptedSource::with_coins("b", 2),
            ],
            RunConfig::new(2, None),
        );

        let pass = orch.run_all().await;
        let names: Vec<_> = pass.sources.iter().map(|r| r.source.as_str()).collect();
        assert_eq!(names, vec!["down", "a", "b"]);
        assert_eq!(pass.failed(), 0);
        assert_eq!(pass.records_processed(), 5);
        assert_eq!(pass.sources[1].batches_committed, 2);

        let snap = orch.stats.snapshot(now_ms());
        assert_eq!(snap.passes, 1);
        assert_eq!(snap.fetch_errors, 1);
        assert_eq!(snap.records_stored, 5);
    }

    #[tokio::test]
    async fn injected_failure_in_one_source_leaves_others_completed() {
        let db = Database::open_in_memory().unwrap();
        let orch = orchestrator(
            &db,
            vec![ScriptedSource::with_coins("a", 4), ScriptedSource::with_coins("b", 1)],
            RunConfig::new(2, Some(2)),
        );
        let pass = orch.run_all().await;
        assert_eq!(pass.sources[0].status, RunStatus::Failed);
        assert_eq!(pass.sources[1].status, RunStatus::Completed);
        assert_eq!(pass.failed(), 1);
        assert_eq!(orch.stats.snapshot(now_ms()).passes_with_failures, 1);
    }

    #[tokio::test]
    async fn unknown_source_is_an_error() {
        let db = Database::open_in_memory().unwrap();
        let orch = orchestrator(&db, vec![], RunConfig::new(5, None));
        let err = orch.run_source("nope").await.unwrap_err();
        assert!(matches!(err, EtlError::UnknownSource(ref n) if n == "nope"));
    }

    // Lets a test keep a handle on a source after the registry owns it.
    struct SharedSource(Arc<ScriptedSource>);

    #[async_trait::async_trait]
    impl SourceAdapter for SharedSource {
        fn name(&self) -> &str {
            self.0.name()
        }

        async fn fetch(
            &self,
            resume_from: Option<i64>,
        ) -> std::result::Result<Vec<FetchedRecord>, crate::error::FetchError> {
            self.0.fetch(resume_from).await
        }

        fn normalize(
            &self,
            payload: &serde_json::Value,
        ) -> std::result::Result<NormalizedAsset, crate::error::NormalizeError> {
            self.0.normalize(payload)
        }
    }
}
