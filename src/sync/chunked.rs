// ABOUTME: Chunked ingestion - paginated range reads inserted one multi-row INSERT per chunk
// ABOUTME: Used for small and medium sheets where header-name column matching matters

use anyhow::{Context, Result};

use super::checksum::sample_indexes;
use super::{insert_rows, rows_per_statement, ColumnMapping, IngestContext, IngestResult, Progress};
use crate::source::{is_blank_row, Row};

/// Rows fetched per range read: bounded by the configured chunk size and by
/// the bind parameter ceiling for `column_count` columns.
pub fn rows_per_chunk(ctx: &IngestContext<'_>, column_count: usize) -> usize {
    ctx.engine
        .max_chunk_rows
        .max(1)
        .min(rows_per_statement(ctx.db, column_count))
}

/// Populate `staging` from the sheet, one range read per chunk.
///
/// `expected_rows` is the data row count from change detection; it only
/// positions the checksum samples. Reading stops at the first chunk that
/// comes back short.
pub async fn ingest(
    ctx: &IngestContext<'_>,
    staging: &str,
    mapping: &ColumnMapping,
    expected_rows: u64,
) -> Result<IngestResult> {
    let chunk_rows = rows_per_chunk(ctx, mapping.len());
    let (first_idx, middle_idx, last_idx) = sample_indexes(expected_rows).unwrap_or((0, 0, 0));
    let sample = expected_rows > 0;

    let mut result = IngestResult::default();
    let mut progress = Progress::new(ctx.logs, ctx.log_id, ctx.engine.progress_interval_rows);
    let mut offset: u64 = 0;
    let mut chunk_no = 0usize;

    loop {
        if chunk_no > 0 && !ctx.engine.chunk_delay().is_zero() {
            tokio::time::sleep(ctx.engine.chunk_delay()).await;
        }
        chunk_no += 1;

        let row_start = ctx.sync.data_start_row() + offset;
        let row_end = row_start + chunk_rows as u64 - 1;
        let fetched = ctx
            .source
            .fetch_range(&ctx.sync.source, row_start, row_end, ctx.sync.end_column())
            .await
            .with_context(|| {
                format!(
                    "Failed to fetch rows {}-{} of {}",
                    row_start, row_end, ctx.sync.source
                )
            })?;
        let fetched_len = fetched.len();

        if sample {
            for (i, row) in fetched.iter().enumerate() {
                let idx = offset + i as u64;
                if idx == first_idx {
                    result.samples.first = row.clone();
                }
                if idx == middle_idx {
                    result.samples.middle = row.clone();
                }
                if idx == last_idx {
                    result.samples.last = row.clone();
                }
            }
        }

        let rows: Vec<Row> = fetched.into_iter().filter(|r| !is_blank_row(r)).collect();
        let inserted = insert_rows(ctx.db, staging, mapping, &rows).await?;
        result.processed_rows += inserted;
        progress.report(result.processed_rows).await;

        tracing::debug!(
            "Chunk {} of '{}': {} rows fetched, {} inserted",
            chunk_no,
            ctx.sync.table_name,
            fetched_len,
            inserted
        );

        if fetched_len < chunk_rows {
            break;
        }
        offset += chunk_rows as u64;
    }

    Ok(result)
}
