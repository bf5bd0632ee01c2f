// ABOUTME: Google Sheets implementation of SourceReader over reqwest
// ABOUTME: Values API for ranges/scans, Drive metadata for modification time, CSV export stream

use anyhow::{anyhow, Context};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::TryStreamExt;
use reqwest::{Client, RequestBuilder, StatusCode};
use std::time::Duration;
use url::Url;

use super::{
    normalize_row, ByteStream, RetryPolicy, Row, ScanResult, SourceError, SourceReader, SourceRef,
    SourceResult,
};
use crate::config::SheetsConfig;

/// Client for the Sheets v4 values API, the Drive v3 files API and the
/// spreadsheet CSV export endpoint.
///
/// Authentication is a bearer token obtained elsewhere; token refresh is the
/// caller's concern.
pub struct SheetsClient {
    client: Client,
    export_client: Client,
    config: SheetsConfig,
    retry: RetryPolicy,
}

impl SheetsClient {
    pub fn new(config: SheetsConfig) -> anyhow::Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()
            .context("Failed to create HTTP client")?;

        // Export bodies can take minutes to stream; only bound the connect.
        let export_client = Client::builder()
            .connect_timeout(Duration::from_secs(config.request_timeout_secs))
            .build()
            .context("Failed to create HTTP export client")?;

        Ok(Self {
            client,
            export_client,
            config,
            retry: RetryPolicy::default(),
        })
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    fn authorize(&self, request: RequestBuilder) -> RequestBuilder {
        match self.config.access_token {
            Some(ref token) => request.bearer_auth(token),
            None => request,
        }
    }

    fn spreadsheet_url(&self, spreadsheet_id: &str, rest: &[&str]) -> SourceResult<Url> {
        build_url(&self.config.api_base, "spreadsheets", spreadsheet_id, rest)
    }

    async fn get_json(&self, url: Url) -> SourceResult<serde_json::Value> {
        let response = self
            .authorize(self.client.get(url.clone()))
            .send()
            .await
            .map_err(classify_transport)?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(classify_status(status, &body));
        }

        response
            .json()
            .await
            .map_err(|e| SourceError::Other(anyhow!("Invalid JSON from {}: {}", url, e)))
    }

    async fn batch_get(
        &self,
        spreadsheet_id: &str,
        ranges: &[String],
    ) -> SourceResult<Vec<Vec<Row>>> {
        let mut url = self.spreadsheet_url(spreadsheet_id, &["values:batchGet"])?;
        {
            let mut query = url.query_pairs_mut();
            query.append_pair("majorDimension", "ROWS");
            for range in ranges {
                query.append_pair("ranges", range);
            }
        }

        let body = self
            .retry
            .run("batchGet", || self.get_json(url.clone()))
            .await?;

        let value_ranges = body
            .get("valueRanges")
            .and_then(|v| v.as_array())
            .cloned()
            .unwrap_or_default();

        Ok((0..ranges.len())
            .map(|idx| value_ranges.get(idx).map(parse_values).unwrap_or_default())
            .collect())
    }
}

fn build_url(base: &str, collection: &str, id: &str, rest: &[&str]) -> SourceResult<Url> {
    let mut url = Url::parse(base)
        .map_err(|e| SourceError::Other(anyhow!("Invalid API base URL '{}': {}", base, e)))?;
    {
        let mut segments = url
            .path_segments_mut()
            .map_err(|_| SourceError::Other(anyhow!("API base URL '{}' cannot be a base", base)))?;
        segments.pop_if_empty();
        segments.push(collection);
        segments.push(id);
        segments.extend(rest);
    }
    Ok(url)
}

/// Quote a sheet title for A1 notation.
fn quote_sheet(sheet: &str) -> String {
    format!("'{}'", sheet.replace('\'', "''"))
}

/// A1 range for rows `start..=end`, optionally bounded to columns `A..=col_end`.
pub fn a1_range(sheet: &str, start: u64, end: u64, col_end: Option<&str>) -> String {
    match col_end {
        Some(col) => format!("{}!A{}:{}{}", quote_sheet(sheet), start, col, end),
        None => format!("{}!{}:{}", quote_sheet(sheet), start, end),
    }
}

fn column_a_range(sheet: &str) -> String {
    format!("{}!A:A", quote_sheet(sheet))
}

fn parse_values(range: &serde_json::Value) -> Vec<Row> {
    range
        .get("values")
        .and_then(|v| v.as_array())
        .map(|rows| {
            rows.iter()
                .map(|row| row.as_array().map(|cells| normalize_row(cells)).unwrap_or_default())
                .collect()
        })
        .unwrap_or_default()
}

/// Map an HTTP failure to the retry classification.
pub fn classify_status(status: StatusCode, body: &str) -> SourceError {
    let lowered = body.to_lowercase();
    match status.as_u16() {
        429 => SourceError::RateLimited(body.to_string()),
        403 if lowered.contains("quota") || lowered.contains("rate") => {
            SourceError::RateLimited(body.to_string())
        }
        404 => SourceError::NotFound(body.to_string()),
        code if status.is_server_error() => SourceError::Transient(format!("HTTP {}: {}", code, body)),
        code => SourceError::Http {
            status: code,
            message: body.to_string(),
        },
    }
}

fn classify_transport(error: reqwest::Error) -> SourceError {
    if error.is_timeout() || error.is_connect() || error.is_request() {
        SourceError::Transient(error.to_string())
    } else {
        SourceError::Other(anyhow!(error))
    }
}

#[async_trait]
impl SourceReader for SheetsClient {
    async fn fetch_range(
        &self,
        source: &SourceRef,
        row_start: u64,
        row_end: u64,
        col_end: Option<&str>,
    ) -> SourceResult<Vec<Row>> {
        let range = a1_range(&source.sheet_name, row_start, row_end, col_end);
        let mut url = self.spreadsheet_url(&source.spreadsheet_id, &["values", &range])?;
        url.query_pairs_mut().append_pair("majorDimension", "ROWS");

        let body = self
            .retry
            .run("fetch_range", || self.get_json(url.clone()))
            .await?;
        Ok(parse_values(&body))
    }

    async fn count_rows(&self, source: &SourceRef) -> SourceResult<u64> {
        let range = column_a_range(&source.sheet_name);
        let url = self.spreadsheet_url(&source.spreadsheet_id, &["values", &range])?;
        let body = self
            .retry
            .run("count_rows", || self.get_json(url.clone()))
            .await?;
        Ok(parse_values(&body).len() as u64)
    }

    async fn get_modification_time(
        &self,
        spreadsheet_id: &str,
    ) -> SourceResult<Option<DateTime<Utc>>> {
        let mut url = build_url(&self.config.drive_base, "files", spreadsheet_id, &[])?;
        url.query_pairs_mut().append_pair("fields", "modifiedTime");

        let body = self
            .retry
            .run("get_modification_time", || self.get_json(url.clone()))
            .await?;

        Ok(body
            .get("modifiedTime")
            .and_then(|v| v.as_str())
            .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
            .map(|dt| dt.with_timezone(&Utc)))
    }

    async fn get_sheet_id(&self, source: &SourceRef) -> SourceResult<i64> {
        let mut url = self.spreadsheet_url(&source.spreadsheet_id, &[])?;
        url.query_pairs_mut()
            .append_pair("fields", "sheets.properties(sheetId,title)");

        let body = self
            .retry
            .run("get_sheet_id", || self.get_json(url.clone()))
            .await?;

        body.get("sheets")
            .and_then(|v| v.as_array())
            .into_iter()
            .flatten()
            .filter_map(|sheet| sheet.get("properties"))
            .find(|props| props.get("title").and_then(|t| t.as_str()) == Some(source.sheet_name.as_str()))
            .and_then(|props| props.get("sheetId").and_then(|id| id.as_i64()))
            .ok_or_else(|| SourceError::NotFound(format!("Sheet '{}' not found", source)))
    }

    async fn stream_export(&self, spreadsheet_id: &str, sheet_gid: i64) -> SourceResult<ByteStream> {
        let mut url = build_url(&self.config.export_base, "d", spreadsheet_id, &["export"])?;
        url.query_pairs_mut()
            .append_pair("format", "csv")
            .append_pair("gid", &sheet_gid.to_string());

        let response = self
            .retry
            .run("stream_export", || async {
                let response = self
                    .authorize(self.export_client.get(url.clone()))
                    .send()
                    .await
                    .map_err(classify_transport)?;
                let status = response.status();
                if !status.is_success() {
                    let body = response.text().await.unwrap_or_default();
                    return Err(classify_status(status, &body));
                }
                Ok(response)
            })
            .await?;

        let stream = response.bytes_stream().map_err(classify_transport);
        Ok(Box::pin(stream))
    }

    async fn scan(&self, source: &SourceRef, header_row: Option<u64>) -> SourceResult<ScanResult> {
        let mut ranges = Vec::with_capacity(2);
        if let Some(row) = header_row {
            ranges.push(a1_range(&source.sheet_name, row, row, None));
        }
        ranges.push(column_a_range(&source.sheet_name));

        let mut results = self.batch_get(&source.spreadsheet_id, &ranges).await?;
        let column = results.pop().unwrap_or_default();
        let header = match header_row {
            Some(_) => Some(
                results
                    .pop()
                    .and_then(|rows| rows.into_iter().next())
                    .unwrap_or_default(),
            ),
            None => None,
        };

        Ok(ScanResult {
            header,
            column_len: column.len() as u64,
        })
    }

    async fn fetch_rows(
        &self,
        source: &SourceRef,
        rows: &[u64],
        col_end: Option<&str>,
    ) -> SourceResult<Vec<Row>> {
        if rows.is_empty() {
            return Ok(Vec::new());
        }
        let ranges: Vec<String> = rows
            .iter()
            .map(|&row| a1_range(&source.sheet_name, row, row, col_end))
            .collect();

        Ok(self
            .batch_get(&source.spreadsheet_id, &ranges)
            .await?
            .into_iter()
            .map(|rows| rows.into_iter().next().unwrap_or_default())
            .collect())
    }
}
