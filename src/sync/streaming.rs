// ABOUTME: Streaming ingestion - parses the bulk CSV export incrementally into batched INSERTs
// ABOUTME: Used for large sheets; memory stays bounded by one INSERT batch

use anyhow::{Context, Result};
use csv_core::{ReadFieldResult, Reader};
use futures::StreamExt;

use super::{insert_rows, rows_per_statement, ColumnMapping, IngestContext, IngestResult, Progress};
use crate::source::{bound_row, is_blank_row, trim_row, Row};

/// Push parser turning arbitrary byte chunks into CSV records.
///
/// Records may span chunk boundaries; a partial field is kept in `field`
/// until the rest of it arrives. An empty line yields an empty record so
/// record numbers stay aligned with sheet rows.
pub struct CsvRecordParser {
    reader: Reader,
    field: Vec<u8>,
    field_len: usize,
    record: Row,
    at_record_start: bool,
    after_cr: bool,
}

impl Default for CsvRecordParser {
    fn default() -> Self {
        Self::new()
    }
}

impl CsvRecordParser {
    pub fn new() -> Self {
        Self {
            reader: Reader::new(),
            field: vec![0; 1024],
            field_len: 0,
            record: Vec::new(),
            at_record_start: true,
            after_cr: false,
        }
    }

    fn take_field(&mut self) {
        let value = String::from_utf8_lossy(&self.field[..self.field_len]).into_owned();
        self.field_len = 0;
        self.record
            .push(if value.is_empty() { None } else { Some(value) });
    }

    /// Parse until the current record ends or `input` runs out, returning
    /// the number of bytes consumed.
    fn read_record(&mut self, input: &[u8], out: &mut Vec<Row>) -> usize {
        let mut consumed = 0;
        loop {
            let (result, nin, nout) = self
                .reader
                .read_field(&input[consumed..], &mut self.field[self.field_len..]);
            consumed += nin;
            self.field_len += nout;

            match result {
                ReadFieldResult::InputEmpty | ReadFieldResult::End => return consumed,
                ReadFieldResult::OutputFull => {
                    let grown = self.field.len() * 2;
                    self.field.resize(grown, 0);
                }
                ReadFieldResult::Field { record_end } => {
                    self.take_field();
                    if record_end {
                        out.push(trim_row(std::mem::take(&mut self.record)));
                        self.at_record_start = true;
                        self.after_cr = consumed > 0 && input[consumed - 1] == b'\r';
                        return consumed;
                    }
                }
            }
        }
    }

    /// Feed the next chunk, appending every completed record to `out`.
    pub fn feed(&mut self, mut input: &[u8], out: &mut Vec<Row>) {
        // csv-core skips blank lines, so terminators at the start of a
        // record are consumed here instead.
        while let Some(&byte) = input.first() {
            if self.at_record_start {
                if byte == b'\n' && self.after_cr {
                    self.after_cr = false;
                    input = &input[1..];
                    continue;
                }
                self.after_cr = false;
                if byte == b'\n' || byte == b'\r' {
                    out.push(Vec::new());
                    self.after_cr = byte == b'\r';
                    input = &input[1..];
                    continue;
                }
                self.at_record_start = false;
            }
            let consumed = self.read_record(input, out);
            input = &input[consumed..];
        }
    }

    /// Flush a final record that had no trailing line terminator.
    pub fn finish(&mut self, out: &mut Vec<Row>) {
        self.read_record(&[], out);
    }
}

struct Batch<'c, 'a> {
    ctx: &'c IngestContext<'a>,
    staging: &'c str,
    mapping: &'c ColumnMapping,
    rows: Vec<Row>,
    capacity: usize,
}

impl Batch<'_, '_> {
    async fn push(&mut self, row: Row) -> Result<u64> {
        self.rows.push(row);
        if self.rows.len() >= self.capacity {
            return self.flush().await;
        }
        Ok(0)
    }

    async fn flush(&mut self) -> Result<u64> {
        let rows = std::mem::take(&mut self.rows);
        insert_rows(self.ctx.db, self.staging, self.mapping, &rows).await
    }
}

/// Populate `staging` from the sheet's bulk CSV export.
///
/// Rows are matched to the destination by position. The middle checksum
/// sample is the data row at the configured fixed offset, so no more than
/// one batch is ever held in memory. When the sheet is shorter than that
/// offset the last data row stands in for it.
pub async fn ingest(
    ctx: &IngestContext<'_>,
    staging: &str,
    mapping: &ColumnMapping,
) -> Result<IngestResult> {
    let source = &ctx.sync.source;
    let gid = ctx
        .source
        .get_sheet_id(source)
        .await
        .with_context(|| format!("Failed to resolve sheet id of {}", source))?;
    let mut stream = ctx
        .source
        .stream_export(&source.spreadsheet_id, gid)
        .await
        .with_context(|| format!("Failed to start export of {}", source))?;

    let skip = ctx.sync.data_start_row() - 1;
    let middle_at = ctx.engine.stream_middle_sample_offset;
    let col_end = ctx.sync.end_column();

    let mut parser = CsvRecordParser::new();
    let mut batch = Batch {
        ctx,
        staging,
        mapping,
        rows: Vec::new(),
        capacity: rows_per_statement(ctx.db, mapping.len()),
    };
    let mut progress = Progress::new(ctx.logs, ctx.log_id, ctx.engine.progress_interval_rows);
    let mut result = IngestResult::default();
    let mut record_no: u64 = 0;
    let mut middle_seen = false;
    let mut finished = false;
    let mut records = Vec::new();

    while !finished {
        match stream.next().await {
            Some(chunk) => {
                let chunk = chunk.with_context(|| format!("Export of {} failed", source))?;
                parser.feed(&chunk, &mut records);
            }
            None => {
                parser.finish(&mut records);
                finished = true;
            }
        }

        for record in records.drain(..) {
            let index = record_no;
            record_no += 1;
            if index < skip {
                continue;
            }
            let data_index = index - skip;
            let row = bound_row(record, col_end);

            if data_index == 0 {
                result.samples.first = row.clone();
            }
            if data_index == middle_at {
                result.samples.middle = row.clone();
                middle_seen = true;
            }
            if is_blank_row(&row) {
                continue;
            }
            result.samples.last = row.clone();

            result.processed_rows += 1;
            batch.push(row).await?;
            progress.report(result.processed_rows).await;
        }
    }

    batch.flush().await?;

    if !middle_seen {
        result.samples.middle = result.samples.last.clone();
    }

    tracing::debug!(
        "Streamed {} records from {}, {} rows written to '{}'",
        record_no,
        source,
        result.processed_rows,
        staging
    );
    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::db::{ColumnInfo, Database, SqliteDatabase};
    use crate::model::{SyncConfig, SyncLogEntry};
    use crate::source::{MemorySource, SourceRef};
    use crate::store::{SqlStore, SyncLogStore};
    use serde_json::json;
    use std::sync::Arc;

    fn cells(values: &[&str]) -> Row {
        values
            .iter()
            .map(|v| if v.is_empty() { None } else { Some(v.to_string()) })
            .collect()
    }

    #[test]
    fn test_parser_handles_records_split_across_chunks() {
        let csv = b"a,\"b, with comma\"\r\n\"multi\nline\",2\r\nlast,row";
        let mut parser = CsvRecordParser::new();
        let mut out = Vec::new();
        for chunk in csv.chunks(3) {
            parser.feed(chunk, &mut out);
        }
        parser.finish(&mut out);
        assert_eq!(
            out,
            vec![
                cells(&["a", "b, with comma"]),
                cells(&["multi\nline", "2"]),
                cells(&["last", "row"]),
            ]
        );
    }

    #[test]
    fn test_parser_grows_field_buffer() {
        let long = "x".repeat(5000);
        let csv = format!("{},y\n", long);
        let mut parser = CsvRecordParser::new();
        let mut out = Vec::new();
        parser.feed(csv.as_bytes(), &mut out);
        parser.finish(&mut out);
        assert_eq!(out, vec![vec![Some(long), Some("y".to_string())]]);
    }

    #[test]
    fn test_parser_trims_trailing_empty_fields() {
        let mut parser = CsvRecordParser::new();
        let mut out = Vec::new();
        parser.feed(b"a,,\r\n,,\r\n", &mut out);
        parser.finish(&mut out);
        assert_eq!(out, vec![cells(&["a"]), Vec::new()]);
    }

    #[test]
    fn test_parser_keeps_empty_lines_as_records() {
        let mut parser = CsvRecordParser::new();
        let mut out = Vec::new();
        parser.feed(b"h\n\na\nb\n", &mut out);
        parser.finish(&mut out);
        assert_eq!(out, vec![cells(&["h"]), Vec::new(), cells(&["a"]), cells(&["b"])]);
    }

    #[test]
    fn test_parser_empty_lines_with_crlf_split_across_chunks() {
        let csv = b"\r\n\r\nh\r\n\r\na\r\n";
        let mut parser = CsvRecordParser::new();
        let mut out = Vec::new();
        for chunk in csv.chunks(1) {
            parser.feed(chunk, &mut out);
        }
        parser.finish(&mut out);
        assert_eq!(
            out,
            vec![Vec::new(), Vec::new(), cells(&["h"]), Vec::new(), cells(&["a"])]
        );
    }

    async fn run(rows: usize, middle_offset: u64) -> (Arc<SqliteDatabase>, IngestResult) {
        let db = Arc::new(SqliteDatabase::open_in_memory().unwrap());
        db.execute("CREATE TABLE stage (id INTEGER PRIMARY KEY, a TEXT, b TEXT)", &[])
            .await
            .unwrap();
        let store = SqlStore::new(db.clone());
        store.ensure_schema().await.unwrap();
        let entry = SyncLogEntry::running("items");
        store.insert_log(&entry).await.unwrap();

        let source = SourceRef::new("book", "Sheet1");
        let mem = MemorySource::new();
        let mut values = vec![vec![json!("a"), json!("b")]];
        for i in 0..rows {
            values.push(vec![json!(format!("r{}", i)), json!(i), json!("extra")]);
        }
        mem.set_values(&source, values);
        let sync = SyncConfig::new("items", source);
        let engine = EngineConfig {
            stream_middle_sample_offset: middle_offset,
            progress_interval_rows: 10,
            ..Default::default()
        };
        let mapping = ColumnMapping::positional(&db.get_table_columns("stage").await.unwrap())
            .unwrap();
        let ctx = IngestContext {
            db: db.as_ref(),
            source: &mem,
            logs: &store,
            engine: &engine,
            sync: &sync,
            log_id: &entry.id,
        };
        let result = ingest(&ctx, "stage", &mapping).await.unwrap();
        let log = store.get_log(&entry.id).await.unwrap().unwrap();
        assert_eq!(log.rows_synced, (result.processed_rows / 10) * 10);
        (db, result)
    }

    #[tokio::test]
    async fn test_streams_export_into_staging() {
        let (db, result) = run(25, 7).await;
        assert_eq!(result.processed_rows, 25);
        assert_eq!(db.count_rows("stage").await.unwrap(), 25);
        assert_eq!(result.samples.first, cells(&["r0", "0", "extra"]));
        assert_eq!(result.samples.middle, cells(&["r7", "7", "extra"]));
        assert_eq!(result.samples.last, cells(&["r24", "24", "extra"]));

        let rs = db
            .query("SELECT a, b FROM stage WHERE a = 'r3'", &[])
            .await
            .unwrap();
        assert_eq!(rs.get(0, "b").as_str(), Some("3"));
    }

    #[tokio::test]
    async fn test_short_sheet_uses_last_row_as_middle_sample() {
        let (_, result) = run(3, 1000).await;
        assert_eq!(result.processed_rows, 3);
        assert_eq!(result.samples.middle, result.samples.last);
    }

    #[tokio::test]
    async fn test_broken_export_is_an_error() {
        let db = SqliteDatabase::open_in_memory().unwrap();
        db.execute("CREATE TABLE stage (a TEXT)", &[]).await.unwrap();
        let store = SqlStore::new(Arc::new(SqliteDatabase::open_in_memory().unwrap()));
        store.ensure_schema().await.unwrap();

        let source = SourceRef::new("book", "Sheet1");
        let mem = MemorySource::new();
        mem.set_values(&source, vec![vec![json!("a")], vec![json!("x")], vec![json!("y")]]);
        mem.fail_export_after(Some(4));
        let sync = SyncConfig::new("items", source);
        let engine = EngineConfig::default();
        let mapping = ColumnMapping::positional(&[ColumnInfo::new("a", "TEXT")]).unwrap();
        let ctx = IngestContext {
            db: &db,
            source: &mem,
            logs: &store,
            engine: &engine,
            sync: &sync,
            log_id: "none",
        };
        let err = ingest(&ctx, "stage", &mapping).await.unwrap_err();
        assert!(format!("{:#}", err).contains("export stream reset"));
    }
}
