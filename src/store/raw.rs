use rusqlite::{params, OptionalExtension};

use super::Database;
use crate::error::Result;
use crate::types::{FetchedRecord, RawRecord};

/// Append-only audit log of everything a source returned.
#[derive(Clone)]
pub struct RawStore {
    db: Database,
}

impl RawStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Returns the new row id, which doubles as the record's position.
    pub fn append(&self, source_name: &str, record: &FetchedRecord) -> Result<i64> {
        self.db.with_conn(|c| {
            c.execute(
                "INSERT INTO raw_records (source_name, payload, fetched_at) VALUES (?1, ?2, ?3)",
                params![source_name, &record.payload, record.fetched_at],
            )?;
            Ok(c.last_insert_rowid())
        })
    }

    pub fn get(&self, id: i64) -> Result<Option<RawRecord>> {
        self.db.with_conn(|c| {
            Ok(c.query_row(
                "SELECT id, source_name, payload, fetched_at FROM raw_records WHERE id = ?1",
                params![id],
                |r| {
                    Ok(RawRecord {
                        id: r.get(0)?,
                        source_name: r.get(1)?,
                        payload: r.get(2)?,
                        fetched_at: r.get(3)?,
                    })
                },
            )
            .optional()?)
        })
    }

    pub fn count(&self, source_name: &str) -> Result<u64> {
        self.db.with_conn(|c| {
            let n: i64 = c.query_row(
                "SELECT COUNT(*) FROM raw_records WHERE source_name = ?1",
                params![source_name],
                |r| r.get(0),
            )?;
            Ok(n as u64)
        })
    }
}
