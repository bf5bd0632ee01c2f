// ABOUTME: Sync engine - change detection, ingestion strategies, table swap, orchestration
// ABOUTME: Shared ingestion plumbing (batched inserts, progress reporting) lives here

pub mod checksum;
pub mod chunked;
pub mod detector;
pub mod engine;
pub mod mapping;
pub mod streaming;
pub mod swap;

use anyhow::{Context, Result};

use crate::config::EngineConfig;
use crate::db::Database;
use crate::model::SyncConfig;
use crate::source::{Row, SourceReader};
use crate::store::SyncLogStore;

pub use checksum::{compute_checksum, SampleRows};
pub use detector::{detect_changes, Detection, SkipReason};
pub use engine::{QueryResult, SyncEngine, SyncOutcome, SyncResult, SyncStats};
pub use mapping::ColumnMapping;

/// Everything an ingestion strategy needs to populate one staging table.
pub struct IngestContext<'a> {
    pub db: &'a dyn Database,
    pub source: &'a dyn SourceReader,
    pub logs: &'a dyn SyncLogStore,
    pub engine: &'a EngineConfig,
    pub sync: &'a SyncConfig,
    /// Log row that receives progress updates
    pub log_id: &'a str,
}

/// What an ingestion strategy reports back.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct IngestResult {
    /// Non-blank rows written to the staging table
    pub processed_rows: u64,
    pub samples: SampleRows,
}

/// Rows per multi-row INSERT so that `rows * columns` stays under the
/// database's bind parameter ceiling.
pub fn rows_per_statement(db: &dyn Database, column_count: usize) -> usize {
    std::cmp::max(1, db.max_bind_parameters() / column_count.max(1))
}

/// Insert `rows` into `table` through `mapping`, batched by the parameter ceiling.
///
/// Returns the number of rows inserted.
pub async fn insert_rows(
    db: &dyn Database,
    table: &str,
    mapping: &ColumnMapping,
    rows: &[Row],
) -> Result<u64> {
    if rows.is_empty() || mapping.is_empty() {
        return Ok(0);
    }

    let batch_size = rows_per_statement(db, mapping.len());
    let mut total = 0u64;

    for chunk in rows.chunks(batch_size) {
        let sql = db.create_insert_sql(table, mapping.columns(), chunk.len());
        let params: Vec<_> = chunk.iter().flat_map(|row| mapping.values(row)).collect();
        db.execute(&sql, &params)
            .await
            .with_context(|| format!("Failed to insert {} rows into '{}'", chunk.len(), table))?;
        total += chunk.len() as u64;
    }

    Ok(total)
}

/// Writes the running row count to the log row every `every` rows.
pub(crate) struct Progress<'a> {
    logs: &'a dyn SyncLogStore,
    log_id: &'a str,
    every: u64,
    next_mark: u64,
}

impl<'a> Progress<'a> {
    pub(crate) fn new(logs: &'a dyn SyncLogStore, log_id: &'a str, every: u64) -> Self {
        Self {
            logs,
            log_id,
            every,
            next_mark: every,
        }
    }

    pub(crate) async fn report(&mut self, processed: u64) {
        if self.every == 0 || processed < self.next_mark {
            return;
        }
        while self.next_mark <= processed {
            self.next_mark += self.every;
        }
        if let Err(e) = self.logs.update_log_progress(self.log_id, processed).await {
            tracing::warn!("Failed to record progress for log {}: {:#}", self.log_id, e);
        }
    }
}
