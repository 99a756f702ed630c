use super::identity;
use crate::error::Result;
use crate::source::SourceAdapter;
use crate::store::assets::{self, AssetUpsert};
use crate::store::Database;
use crate::types::FetchedRecord;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchOutcome {
    pub stored: usize,
    pub skipped: usize,
}

/// Normalize each record and upsert it. A record that fails to normalize is
/// logged and skipped; a storage error aborts the batch. Identity resolution
/// and the asset write for one record share a single transaction. The row is
/// keyed by the resolved coin's symbol, so a source that renames a ticker keeps
/// writing to the same row.
pub fn process_batch(
    db: &Database,
    source: &dyn SourceAdapter,
    records: &[FetchedRecord],
) -> Result<BatchOutcome> {
    let mut out = BatchOutcome::default();
    for record in records {
        let n = match source.normalize(&record.payload) {
            Ok(n) => n,
            Err(e) => {
                let id = record.payload.get("id").map(|v| v.to_string());
                tracing::warn!(
                    source = source.name(),
                    id = id.as_deref().unwrap_or("unknown"),
                    error = %e,
                    "skipping record that failed to normalize"
                );
                out.skipped += 1;
                continue;
            }
        };

        db.with_tx(|tx| {
            let coin = identity::resolve(tx, &n.source, &n.source_id, &n.symbol, &n.name)?;
            assets::upsert(
                tx,
                &AssetUpsert {
                    coin_id: coin.id,
                    symbol: &coin.symbol,
                    name: &n.name,
                    price_usd: n.price_usd,
                    market_cap: n.market_cap,
                    source: &n.source,
                },
            )
        })?;
        out.stored += 1;
    }
    Ok(out)
}
