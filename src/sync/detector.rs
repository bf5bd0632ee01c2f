// ABOUTME: Change detection - decides whether a sync can be skipped
// ABOUTME: Checks modification time first, then row count plus sampled-row checksum

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};

use super::checksum::{sample_indexes, SampleRows};
use crate::model::{to_millis, SyncConfig};
use crate::source::{Row, SourceReader};

/// Why a sync was skipped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// Source file modification time equals the recorded one.
    NotModified,
    /// Row count and sampled-row checksum match the last sync.
    ChecksumMatch,
}

impl SkipReason {
    pub fn describe(&self) -> &'static str {
        match self {
            SkipReason::NotModified => "source not modified since last sync",
            SkipReason::ChecksumMatch => "source content unchanged (checksum match)",
        }
    }
}

/// Result of running change detection for one table.
#[derive(Debug, Clone, PartialEq)]
pub enum Detection {
    Skip {
        reason: SkipReason,
        modified_time: Option<DateTime<Utc>>,
    },
    Changed {
        /// Data rows in the source
        row_count: u64,
        header: Option<Row>,
        modified_time: Option<DateTime<Utc>>,
    },
}

/// Fetch the three checksum samples for a sheet with `row_count` data rows.
pub async fn fetch_samples(
    source: &dyn SourceReader,
    config: &SyncConfig,
    row_count: u64,
) -> Result<SampleRows> {
    let Some((first, middle, last)) = sample_indexes(row_count) else {
        return Ok(SampleRows::default());
    };
    let base = config.data_start_row();
    let mut rows = source
        .fetch_rows(
            &config.source,
            &[base + first, base + middle, base + last],
            config.end_column(),
        )
        .await
        .with_context(|| format!("Failed to fetch sample rows from {}", config.source))?
        .into_iter();

    Ok(SampleRows {
        first: rows.next().unwrap_or_default(),
        middle: rows.next().unwrap_or_default(),
        last: rows.next().unwrap_or_default(),
    })
}

/// Run change detection.
///
/// The modification time is always read (it is stored after a successful
/// sync) but only compared when `force` is false. A failure reading it is not
/// fatal; detection falls through to the checksum.
pub async fn detect_changes(
    source: &dyn SourceReader,
    config: &SyncConfig,
    force: bool,
) -> Result<Detection> {
    let modified_time = match source
        .get_modification_time(&config.source.spreadsheet_id)
        .await
    {
        Ok(time) => time,
        Err(e) => {
            tracing::warn!(
                "Could not read modification time of {}: {}; falling back to checksum",
                config.source.spreadsheet_id,
                e
            );
            None
        }
    };

    if !force {
        if let (Some(current), Some(last)) = (modified_time, config.last_modified_time) {
            if to_millis(current) == to_millis(last) {
                return Ok(Detection::Skip {
                    reason: SkipReason::NotModified,
                    modified_time,
                });
            }
        }
    }

    let scan = source
        .scan(&config.source, config.header_row())
        .await
        .with_context(|| format!("Failed to scan {}", config.source))?;
    let row_count = config.data_rows_from_scan(scan.column_len);

    if !force && config.last_row_count == Some(row_count) {
        if let Some(ref last_checksum) = config.last_checksum {
            let samples = fetch_samples(source, config, row_count).await?;
            if &samples.checksum(row_count) == last_checksum {
                return Ok(Detection::Skip {
                    reason: SkipReason::ChecksumMatch,
                    modified_time,
                });
            }
            tracing::debug!(
                "Checksum changed for '{}' with unchanged row count {}",
                config.table_name,
                row_count
            );
        }
    }

    Ok(Detection::Changed {
        row_count,
        header: scan.header,
        modified_time,
    })
}
