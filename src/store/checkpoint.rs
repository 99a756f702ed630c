use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension, Row};
use uuid::Uuid;

use super::Database;
use crate::error::{EtlError, Result};
use crate::types::{Checkpoint, CheckpointStatus};

const COLUMNS: &str = "source, last_processed_id, last_processed_at, status, run_id, \
                       last_error, created_at, updated_at";

/// Per-source resumability state.
///
/// State machine: `pending -> running -> {completed | failed}`, and both
/// terminal states go back to `running` on the next pass. `last_processed_id`
/// only moves forward and marks the highest raw position whose batch is
/// already committed to the canonical store.
#[derive(Clone)]
pub struct CheckpointStore {
    db: Database,
}

impl CheckpointStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    pub fn get(&self, source: &str) -> Result<Option<Checkpoint>> {
        self.db.with_conn(|c| find(c, source))
    }

    pub fn get_or_create(&self, source: &str) -> Result<Checkpoint> {
        self.db.with_conn(|c| get_or_create(c, source))
    }

    pub fn list(&self) -> Result<Vec<Checkpoint>> {
        self.db.with_conn(|c| {
            let sql = format!("SELECT {} FROM etl_checkpoints ORDER BY source", COLUMNS);
            let mut stmt = c.prepare(&sql)?;
            let rows = stmt.query_map([], from_row)?;
            let mut out = Vec::new();
            for r in rows {
                out.push(r??);
            }
            Ok(out)
        })
    }

    pub fn start_run(&self, source: &str) -> Result<String> {
        let run_id = Uuid::new_v4().to_string();
        self.db.with_conn(|c| {
            get_or_create(c, source)?;
            c.execute(
                "UPDATE etl_checkpoints SET status = ?2, run_id = ?3, updated_at = ?4 \
                 WHERE source = ?1",
                params![source, CheckpointStatus::Running.as_str(), &run_id, Utc::now()],
            )?;
            Ok(())
        })?;
        tracing::debug!(source, run_id = %run_id, "run started");
        Ok(run_id)
    }

    /// Must only be called after the batch ending at `position` is committed.
    /// A position at or below the current one leaves the row untouched.
    pub fn advance(&self, source: &str, position: i64) -> Result<()> {
        let changed = self.db.with_conn(|c| {
            get_or_create(c, source)?;
            let now = Utc::now();
            Ok(c.execute(
                "UPDATE etl_checkpoints
                 SET last_processed_id = ?2, last_processed_at = ?3, updated_at = ?3
                 WHERE source = ?1 AND (last_processed_id IS NULL OR last_processed_id < ?2)",
                params![source, position, now],
            )?)
        })?;
        if changed == 0 {
            tracing::warn!(
                source,
                position,
                "checkpoint not advanced: position is not ahead of current"
            );
        }
        Ok(())
    }

    pub fn complete(&self, source: &str) -> Result<()> {
        self.set_status(source, CheckpointStatus::Completed, None)?;
        tracing::info!(source, "run completed");
        Ok(())
    }

    /// Leaves `last_processed_id` alone so the next run resumes from committed progress.
    pub fn fail(&self, source: &str, reason: &str) -> Result<()> {
        self.set_status(source, CheckpointStatus::Failed, Some(reason))?;
        tracing::error!(source, reason, "run failed");
        Ok(())
    }

    pub fn last_processed_id(&self, source: &str) -> Result<Option<i64>> {
        Ok(self.get_or_create(source)?.last_processed_id)
    }

    fn set_status(
        &self,
        source: &str,
        status: CheckpointStatus,
        error: Option<&str>,
    ) -> Result<()> {
        self.db.with_conn(|c| {
            get_or_create(c, source)?;
            c.execute(
                "UPDATE etl_checkpoints SET status = ?2, last_error = ?3, updated_at = ?4 \
                 WHERE source = ?1",
                params![source, status.as_str(), error, Utc::now()],
            )?;
            Ok(())
        })
    }
}

fn find(c: &Connection, source: &str) -> Result<Option<Checkpoint>> {
    let row = c
        .query_row(
            &format!("SELECT {} FROM etl_checkpoints WHERE source = ?1", COLUMNS),
            params![source],
            from_row,
        )
        .optional()?;
    row.transpose()
}

fn get_or_create(c: &Connection, source: &str) -> Result<Checkpoint> {
    if let Some(cp) = find(c, source)? {
        return Ok(cp);
    }
    let now = Utc::now();
    c.execute(
        "INSERT OR IGNORE INTO etl_checkpoints (source, status, run_id, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?4)",
        params![source, CheckpointStatus::Pending.as_str(), Uuid::new_v4().to_string(), now],
    )?;
    tracing::debug!(source, "checkpoint created");
    find(c, source)?.ok_or_else(|| EtlError::Corrupt(format!("checkpoint for {} vanished", source)))
}

// Status parse errors surface as the inner Result so a bad row does not
// masquerade as a sqlite error.
fn from_row(r: &Row<'_>) -> rusqlite::Result<Result<Checkpoint>> {
    let status: String = r.get(3)?;
    let status = match status.parse::<CheckpointStatus>() {
        Ok(s) => s,
        Err(e) => return Ok(Err(EtlError::Corrupt(e))),
    };
    Ok(Ok(Checkpoint {
        source: r.get(0)?,
        last_processed_id: r.get(1)?,
        last_processed_at: r.get(2)?,
        status,
        run_id: r.get(4)?,
        last_error: r.get(5)?,
        created_at: r.get(6)?,
        updated_at: r.get(7)?,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> CheckpointStore {
        CheckpointStore::new(Database::open_in_memory().unwrap())
    }

    #[test]
    fn first_access_creates_pending_row() {
        let cps = store();
        assert!(cps.get("coingecko").unwrap().is_none());

        let cp = cps.get_or_create("coingecko").unwrap();
        assert_eq!(cp.status, CheckpointStatus::Pending);
        assert_eq!(cp.last_processed_id, None);
        assert!(!cp.run_id.is_empty());

        let again = cps.get_or_create("coingecko").unwrap();
        assert_eq!(again.run_id, cp.run_id);
        assert_eq!(cps.list().unwrap().len(), 1);
    }

    #[test]
    fn each_run_gets_a_fresh_id() {
        let cps = store();
        let a = cps.start_run("csv_source").unwrap();
        let b = cps.start_run("csv_source").unwrap();
        assert_ne!(a, b);
        let cp = cps.get("csv_source").unwrap().unwrap();
        assert_eq!(cp.status, CheckpointStatus::Running);
        assert_eq!(cp.run_id, b);
    }

    #[test]
    fn failure_keeps_committed_progress() {
        let cps = store();
        cps.start_run("test_source").unwrap();
        cps.advance("test_source", 100).unwrap();
        cps.fail("test_source", "Test error").unwrap();

        assert_eq!(cps.last_processed_id("test_source").unwrap(), Some(100));
        let cp = cps.get("test_source").unwrap().unwrap();
        assert_eq!(cp.status, CheckpointStatus::Failed);
        assert_eq!(cp.last_error.as_deref(), Some("Test error"));
        assert!(cp.last_processed_at.is_some());

        cps.start_run("test_source").unwrap();
        cps.complete("test_source").unwrap();
        let cp = cps.get("test_source").unwrap().unwrap();
        assert_eq!(cp.status, CheckpointStatus::Completed);
        assert_eq!(cp.last_error, None);
        assert_eq!(cp.last_processed_id, Some(100));
    }

    #[test]
    fn position_never_moves_backwards() {
        let cps = store();
        let mut seen = Vec::new();
        for (i, pos) in [5, 10, 7, 10, 3, 12].into_iter().enumerate() {
            if i == 2 {
                cps.fail("s", "injected").unwrap();
            }
            cps.advance("s", pos).unwrap();
            seen.push(cps.last_processed_id("s").unwrap().unwrap());
        }
        assert_eq!(seen, vec![5, 10, 10, 10, 10, 12]);
    }
}
