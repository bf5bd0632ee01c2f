// ABOUTME: In-process SourceReader backed by a mutable grid
// ABOUTME: Call counters and failure injection for exercising the engine without network

use anyhow::anyhow;
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use super::{
    bound_row, normalize_row, ByteStream, Row, ScanResult, SourceError, SourceReader, SourceRef,
    SourceResult,
};

/// Bytes per chunk of the rendered CSV export; small so parsers see split records.
const EXPORT_CHUNK_BYTES: usize = 7;

/// Number of calls made against a [`MemorySource`], per operation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CallCounts {
    pub fetch_range: usize,
    pub count_rows: usize,
    pub modification_time: usize,
    pub scan: usize,
    pub fetch_rows: usize,
    pub export: usize,
}

#[derive(Debug, Clone)]
struct MemorySheet {
    gid: i64,
    rows: Vec<Row>,
}

#[derive(Debug, Default)]
struct MemoryState {
    sheets: HashMap<SourceRef, MemorySheet>,
    modified: HashMap<String, DateTime<Utc>>,
    next_gid: i64,
    /// Remaining successful `fetch_range` calls before an injected failure.
    fetch_failure_after: Option<usize>,
    /// Export bytes emitted before an injected stream error.
    export_failure_after: Option<usize>,
    fetch_delay: Duration,
    counts: CallCounts,
}

/// A spreadsheet held in memory.
///
/// Rows are stored as the whole sheet, row 1 first, the same way the
/// spreadsheet API addresses them.
#[derive(Debug, Default)]
pub struct MemorySource {
    state: Mutex<MemoryState>,
}

impl MemorySource {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> SourceResult<std::sync::MutexGuard<'_, MemoryState>> {
        self.state
            .lock()
            .map_err(|_| SourceError::Other(anyhow!("memory source mutex poisoned")))
    }

    /// Replace the content of a sheet.
    pub fn set_rows(&self, source: &SourceRef, rows: Vec<Row>) {
        if let Ok(mut state) = self.state.lock() {
            let gid = match state.sheets.get(source) {
                Some(sheet) => sheet.gid,
                None => {
                    state.next_gid += 1;
                    state.next_gid
                }
            };
            state.sheets.insert(source.clone(), MemorySheet { gid, rows });
        }
    }

    /// Replace the content of a sheet from raw JSON cell values.
    pub fn set_values(&self, source: &SourceRef, values: Vec<Vec<serde_json::Value>>) {
        let rows = values.iter().map(|row| normalize_row(row)).collect();
        self.set_rows(source, rows);
    }

    pub fn set_modified_time(&self, spreadsheet_id: &str, time: Option<DateTime<Utc>>) {
        if let Ok(mut state) = self.state.lock() {
            match time {
                Some(t) => {
                    state.modified.insert(spreadsheet_id.to_string(), t);
                }
                None => {
                    state.modified.remove(spreadsheet_id);
                }
            }
        }
    }

    /// Let `ok_calls` more `fetch_range` calls succeed, then fail every call.
    pub fn fail_fetch_after(&self, ok_calls: Option<usize>) {
        if let Ok(mut state) = self.state.lock() {
            state.fetch_failure_after = ok_calls;
        }
    }

    /// Break export streams after `bytes` bytes.
    pub fn fail_export_after(&self, bytes: Option<usize>) {
        if let Ok(mut state) = self.state.lock() {
            state.export_failure_after = bytes;
        }
    }

    /// Sleep inside every `fetch_range`, to hold a sync in flight.
    pub fn set_fetch_delay(&self, delay: Duration) {
        if let Ok(mut state) = self.state.lock() {
            state.fetch_delay = delay;
        }
    }

    pub fn counts(&self) -> CallCounts {
        self.state
            .lock()
            .map(|s| s.counts.clone())
            .unwrap_or_default()
    }

    pub fn reset_counts(&self) {
        if let Ok(mut state) = self.state.lock() {
            state.counts = CallCounts::default();
        }
    }

    fn sheet(state: &MemoryState, source: &SourceRef) -> SourceResult<MemorySheet> {
        state
            .sheets
            .get(source)
            .cloned()
            .ok_or_else(|| SourceError::NotFound(format!("Sheet '{}' not found", source)))
    }
}

fn slice_rows(rows: &[Row], row_start: u64, row_end: u64, col_end: Option<&str>) -> Vec<Row> {
    let start = row_start.saturating_sub(1) as usize;
    let end = (row_end as usize).min(rows.len());
    if start >= end {
        return Vec::new();
    }
    rows[start..end]
        .iter()
        .map(|row| bound_row(row.clone(), col_end))
        .collect()
}

/// Length of column A: rows up to the last non-empty first cell.
fn column_a_len(rows: &[Row]) -> u64 {
    rows.iter()
        .rposition(|row| matches!(row.first(), Some(Some(v)) if !v.is_empty()))
        .map(|idx| idx as u64 + 1)
        .unwrap_or(0)
}

fn csv_field(cell: &Option<String>) -> String {
    match cell {
        None => String::new(),
        Some(v) if v.contains([',', '"', '\n', '\r']) => format!("\"{}\"", v.replace('"', "\"\"")),
        Some(v) => v.clone(),
    }
}

/// Render rows the way the spreadsheet CSV export does: every row padded to
/// the widest row, CRLF line endings.
pub fn render_csv(rows: &[Row]) -> String {
    let width = rows.iter().map(|r| r.len()).max().unwrap_or(0);
    let mut out = String::new();
    for row in rows {
        let fields: Vec<String> = (0..width)
            .map(|idx| csv_field(row.get(idx).unwrap_or(&None)))
            .collect();
        out.push_str(&fields.join(","));
        out.push_str("\r\n");
    }
    out
}

#[async_trait]
impl SourceReader for MemorySource {
    async fn fetch_range(
        &self,
        source: &SourceRef,
        row_start: u64,
        row_end: u64,
        col_end: Option<&str>,
    ) -> SourceResult<Vec<Row>> {
        let (sheet, delay) = {
            let mut state = self.lock()?;
            state.counts.fetch_range += 1;
            match state.fetch_failure_after {
                Some(0) => {
                    return Err(SourceError::Other(anyhow!(
                        "injected failure reading {} rows {}..{}",
                        source,
                        row_start,
                        row_end
                    )))
                }
                Some(n) => state.fetch_failure_after = Some(n - 1),
                None => {}
            }
            (Self::sheet(&state, source)?, state.fetch_delay)
        };

        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        Ok(slice_rows(&sheet.rows, row_start, row_end, col_end))
    }

    async fn count_rows(&self, source: &SourceRef) -> SourceResult<u64> {
        let mut state = self.lock()?;
        state.counts.count_rows += 1;
        let sheet = Self::sheet(&state, source)?;
        Ok(column_a_len(&sheet.rows))
    }

    async fn get_modification_time(
        &self,
        spreadsheet_id: &str,
    ) -> SourceResult<Option<DateTime<Utc>>> {
        let mut state = self.lock()?;
        state.counts.modification_time += 1;
        Ok(state.modified.get(spreadsheet_id).copied())
    }

    async fn get_sheet_id(&self, source: &SourceRef) -> SourceResult<i64> {
        let state = self.lock()?;
        Ok(Self::sheet(&state, source)?.gid)
    }

    async fn stream_export(&self, spreadsheet_id: &str, sheet_gid: i64) -> SourceResult<ByteStream> {
        let (csv, fail_after) = {
            let mut state = self.lock()?;
            state.counts.export += 1;
            let sheet = state
                .sheets
                .iter()
                .find(|(src, sheet)| src.spreadsheet_id == spreadsheet_id && sheet.gid == sheet_gid)
                .map(|(_, sheet)| sheet.clone())
                .ok_or_else(|| {
                    SourceError::NotFound(format!("gid {} in {}", sheet_gid, spreadsheet_id))
                })?;
            (render_csv(&sheet.rows).into_bytes(), state.export_failure_after)
        };

        let limit = fail_after.unwrap_or(csv.len()).min(csv.len());
        let mut items: Vec<SourceResult<Bytes>> = csv[..limit]
            .chunks(EXPORT_CHUNK_BYTES)
            .map(|chunk| Ok(Bytes::copy_from_slice(chunk)))
            .collect();
        if fail_after.is_some() {
            items.push(Err(SourceError::Transient(
                "injected failure: export stream reset".to_string(),
            )));
        }
        Ok(Box::pin(futures::stream::iter(items)))
    }

    async fn scan(&self, source: &SourceRef, header_row: Option<u64>) -> SourceResult<ScanResult> {
        let mut state = self.lock()?;
        state.counts.scan += 1;
        let sheet = Self::sheet(&state, source)?;
        let header = header_row.map(|row| {
            slice_rows(&sheet.rows, row, row, None)
                .into_iter()
                .next()
                .unwrap_or_default()
        });
        Ok(ScanResult {
            header,
            column_len: column_a_len(&sheet.rows),
        })
    }

    async fn fetch_rows(
        &self,
        source: &SourceRef,
        rows: &[u64],
        col_end: Option<&str>,
    ) -> SourceResult<Vec<Row>> {
        let mut state = self.lock()?;
        state.counts.fetch_rows += 1;
        let sheet = Self::sheet(&state, source)?;
        Ok(rows
            .iter()
            .map(|&row| {
                slice_rows(&sheet.rows, row, row, col_end)
                    .into_iter()
                    .next()
                    .unwrap_or_default()
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::TryStreamExt;
    use serde_json::json;

    fn source() -> SourceRef {
        SourceRef::new("book", "Sheet1")
    }

    fn populated() -> MemorySource {
        let mem = MemorySource::new();
        mem.set_values(
            &source(),
            vec![
                vec![json!("name"), json!("qty")],
                vec![json!("a"), json!(1)],
                vec![json!("b, inc"), json!(2)],
                vec![json!(""), json!(3)],
            ],
        );
        mem
    }

    #[tokio::test]
    async fn test_count_rows_uses_column_a() {
        let mem = populated();
        assert_eq!(mem.count_rows(&source()).await.unwrap(), 3);
        assert_eq!(mem.counts().count_rows, 1);
    }

    #[tokio::test]
    async fn test_fetch_range_is_one_based_and_bounded() {
        let mem = populated();
        let rows = mem.fetch_range(&source(), 2, 10, Some("A")).await.unwrap();
        assert_eq!(rows.len(), 3);
        assert_eq!(rows[0], vec![Some("a".to_string())]);
        assert!(rows[2].is_empty());
    }

    #[tokio::test]
    async fn test_fetch_failure_injection() {
        let mem = populated();
        mem.fail_fetch_after(Some(1));
        assert!(mem.fetch_range(&source(), 1, 1, None).await.is_ok());
        assert!(mem.fetch_range(&source(), 2, 2, None).await.is_err());
        mem.fail_fetch_after(None);
        assert!(mem.fetch_range(&source(), 2, 2, None).await.is_ok());
    }

    #[tokio::test]
    async fn test_export_renders_csv() {
        let mem = populated();
        let gid = mem.get_sheet_id(&source()).await.unwrap();
        let stream = mem.stream_export("book", gid).await.unwrap();
        let chunks: Vec<Bytes> = stream.try_collect().await.unwrap();
        let text: String = chunks
            .iter()
            .map(|c| String::from_utf8_lossy(c).into_owned())
            .collect();
        assert_eq!(text, "name,qty\r\na,1\r\n\"b, inc\",2\r\n,3\r\n");
    }
}
