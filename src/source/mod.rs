// ABOUTME: Source Reader abstraction over an external spreadsheet
// ABOUTME: Row-range reads, column scans, modification times and bulk CSV export

pub mod memory;
pub mod retry;
pub mod sheets;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::Stream;
use serde::{Deserialize, Serialize};
use std::pin::Pin;

pub use memory::MemorySource;
pub use retry::RetryPolicy;
pub use sheets::SheetsClient;

/// A normalised cell. Blank cells are `None`.
pub type Cell = Option<String>;

/// A normalised row. Trailing blank cells are stripped.
pub type Row = Vec<Cell>;

/// Bulk export body, yielded chunk by chunk.
pub type ByteStream = Pin<Box<dyn Stream<Item = SourceResult<Bytes>> + Send>>;

pub type SourceResult<T> = std::result::Result<T, SourceError>;

/// Identifies one tab of one spreadsheet.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SourceRef {
    pub spreadsheet_id: String,
    pub sheet_name: String,
}

impl SourceRef {
    pub fn new(spreadsheet_id: impl Into<String>, sheet_name: impl Into<String>) -> Self {
        Self {
            spreadsheet_id: spreadsheet_id.into(),
            sheet_name: sheet_name.into(),
        }
    }
}

impl std::fmt::Display for SourceRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.spreadsheet_id, self.sheet_name)
    }
}

/// Errors surfaced by a [`SourceReader`], classified for the retry policy.
#[derive(Debug, thiserror::Error)]
pub enum SourceError {
    #[error("rate limited by source: {0}")]
    RateLimited(String),

    #[error("transient source error: {0}")]
    Transient(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("source request failed with HTTP {status}: {message}")]
    Http { status: u16, message: String },

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl SourceError {
    /// Rate limits and transient failures are worth retrying; everything else
    /// is surfaced immediately.
    pub fn is_retryable(&self) -> bool {
        matches!(self, SourceError::RateLimited(_) | SourceError::Transient(_))
    }
}

/// Header row and column-A length of a sheet, read in one pass.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ScanResult {
    pub header: Option<Row>,
    /// Number of rows from row 1 up to the last non-empty cell in column A.
    pub column_len: u64,
}

/// Read access to the external tabular source.
///
/// Row numbers are 1-based and inclusive, as in spreadsheet A1 notation.
#[async_trait]
pub trait SourceReader: Send + Sync {
    /// Rows `row_start..=row_end`, optionally bounded to columns `A..=col_end`.
    async fn fetch_range(
        &self,
        source: &SourceRef,
        row_start: u64,
        row_end: u64,
        col_end: Option<&str>,
    ) -> SourceResult<Vec<Row>>;

    /// Length of column A, without reading the rest of the grid.
    async fn count_rows(&self, source: &SourceRef) -> SourceResult<u64>;

    /// Last modification time of the spreadsheet file, if the source exposes one.
    async fn get_modification_time(
        &self,
        spreadsheet_id: &str,
    ) -> SourceResult<Option<DateTime<Utc>>>;

    /// Internal numeric id (gid) of a sheet, needed for the bulk export.
    async fn get_sheet_id(&self, source: &SourceRef) -> SourceResult<i64>;

    /// Whole sheet as CSV bytes.
    async fn stream_export(&self, spreadsheet_id: &str, sheet_gid: i64) -> SourceResult<ByteStream>;

    /// Header row (when `header_row` is set) plus the column-A length.
    async fn scan(&self, source: &SourceRef, header_row: Option<u64>) -> SourceResult<ScanResult> {
        let header = match header_row {
            Some(row) => Some(
                self.fetch_range(source, row, row, None)
                    .await?
                    .into_iter()
                    .next()
                    .unwrap_or_default(),
            ),
            None => None,
        };
        let column_len = self.count_rows(source).await?;
        Ok(ScanResult { header, column_len })
    }

    /// Individual rows by number, in the order requested. Missing rows come back empty.
    async fn fetch_rows(
        &self,
        source: &SourceRef,
        rows: &[u64],
        col_end: Option<&str>,
    ) -> SourceResult<Vec<Row>> {
        let mut out = Vec::with_capacity(rows.len());
        for &row in rows {
            let fetched = self.fetch_range(source, row, row, col_end).await?;
            out.push(fetched.into_iter().next().unwrap_or_default());
        }
        Ok(out)
    }
}

/// Normalise a raw cell value as returned by the Sheets values API.
pub fn normalize_cell(value: &serde_json::Value) -> Cell {
    match value {
        serde_json::Value::Null => None,
        serde_json::Value::String(s) if s.is_empty() => None,
        serde_json::Value::String(s) => Some(s.clone()),
        serde_json::Value::Bool(b) => Some(if *b { "TRUE" } else { "FALSE" }.to_string()),
        other => Some(other.to_string()),
    }
}

/// Strip trailing blank cells so the same content always compares equal,
/// whichever API it was read through.
pub fn trim_row(mut row: Row) -> Row {
    while matches!(row.last(), Some(None)) {
        row.pop();
    }
    row
}

pub fn normalize_row(values: &[serde_json::Value]) -> Row {
    trim_row(values.iter().map(normalize_cell).collect())
}

/// Column letters to a 1-based width, e.g. `"C"` is 3 and `"AA"` is 27.
/// Saturates instead of overflowing on absurdly long input.
pub fn column_width(letters: &str) -> usize {
    letters
        .chars()
        .filter(|c| c.is_ascii_alphabetic())
        .fold(0usize, |acc, c| {
            acc.saturating_mul(26)
                .saturating_add(c.to_ascii_uppercase() as usize - 'A' as usize + 1)
        })
}

/// Cut a row down to the columns `A..=col_end`.
pub fn bound_row(row: Row, col_end: Option<&str>) -> Row {
    match col_end {
        Some(letters) => trim_row(row.into_iter().take(column_width(letters)).collect()),
        None => row,
    }
}

/// A row with no non-blank cell.
pub fn is_blank_row(row: &[Cell]) -> bool {
    row.iter().all(|c| c.as_deref().map_or(true, |s| s.trim().is_empty()))
}
