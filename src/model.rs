// ABOUTME: Data model for managed tables, sync attempts and scheduled jobs
// ABOUTME: SyncConfig, SyncLogEntry and Job with their status enums

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::source::SourceRef;

/// Table marker meaning "every table in the folder".
pub const WILDCARD_TABLE: &str = "*";

/// Status of one sync attempt, also kept as the last outcome on a [`SyncConfig`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncStatus {
    Running,
    Success,
    Error,
    Skipped,
    /// Timed out, as opposed to `Error` which means an exception.
    Failed,
}

impl SyncStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncStatus::Running => "running",
            SyncStatus::Success => "success",
            SyncStatus::Error => "error",
            SyncStatus::Skipped => "skipped",
            SyncStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for SyncStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SyncStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "running" => Ok(SyncStatus::Running),
            "success" => Ok(SyncStatus::Success),
            "error" => Ok(SyncStatus::Error),
            "skipped" => Ok(SyncStatus::Skipped),
            "failed" => Ok(SyncStatus::Failed),
            other => anyhow::bail!("Unknown sync status '{}'", other),
        }
    }
}

/// Persisted state of a scheduled job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Idle,
    Running,
    Success,
    Failed,
    Skipped,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Idle => "idle",
            JobStatus::Running => "running",
            JobStatus::Success => "success",
            JobStatus::Failed => "failed",
            JobStatus::Skipped => "skipped",
        }
    }

    /// Read a stored status. Unset and unknown values read as `Idle`.
    pub fn from_stored(value: Option<&str>) -> Self {
        match value {
            Some("running") => JobStatus::Running,
            Some("success") => JobStatus::Success,
            Some("failed") => JobStatus::Failed,
            Some("skipped") => JobStatus::Skipped,
            _ => JobStatus::Idle,
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Sync settings and bookkeeping for one managed table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Live table name (unique key)
    pub table_name: String,
    pub source: SourceRef,
    /// Folder the table is grouped under, for folder-wide jobs
    pub folder: Option<String>,
    /// First sheet row of the region (1-based); the header row when `has_header` is set
    pub start_row: u64,
    /// Last column letter to read, e.g. `"F"`; all columns when unset
    pub end_column: Option<String>,
    pub has_header: bool,
    pub last_sync_at: Option<DateTime<Utc>>,
    pub last_status: Option<SyncStatus>,
    pub last_error: Option<String>,
    pub last_checksum: Option<String>,
    pub last_row_count: Option<u64>,
    pub last_modified_time: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl SyncConfig {
    pub fn new(table_name: impl Into<String>, source: SourceRef) -> Self {
        let now = Utc::now();
        Self {
            table_name: table_name.into(),
            source,
            folder: None,
            start_row: 1,
            end_column: None,
            has_header: true,
            last_sync_at: None,
            last_status: None,
            last_error: None,
            last_checksum: None,
            last_row_count: None,
            last_modified_time: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_folder(mut self, folder: impl Into<String>) -> Self {
        self.folder = Some(folder.into());
        self
    }

    pub fn with_header(mut self, has_header: bool) -> Self {
        self.has_header = has_header;
        self
    }

    pub fn with_start_row(mut self, start_row: u64) -> Self {
        self.start_row = start_row.max(1);
        self
    }

    pub fn with_end_column(mut self, end_column: impl Into<String>) -> Self {
        self.end_column = Some(end_column.into());
        self
    }

    /// Sheet row holding the header, if any.
    pub fn header_row(&self) -> Option<u64> {
        self.has_header.then_some(self.start_row.max(1))
    }

    /// Sheet row of the first data row.
    pub fn data_start_row(&self) -> u64 {
        self.start_row.max(1) + u64::from(self.has_header)
    }

    /// Data rows implied by a column-A scan of `column_len` rows.
    pub fn data_rows_from_scan(&self, column_len: u64) -> u64 {
        column_len.saturating_sub(self.data_start_row() - 1)
    }

    pub fn end_column(&self) -> Option<&str> {
        self.end_column.as_deref()
    }
}

/// One sync attempt. A `running` row doubles as the per-table lock.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncLogEntry {
    pub id: String,
    pub table_name: String,
    /// Set on rows written by the scheduler for a job run
    pub job_id: Option<String>,
    pub status: SyncStatus,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub duration_ms: Option<i64>,
    pub rows_synced: u64,
    pub rows_inserted: u64,
    pub rows_updated: u64,
    pub rows_deleted: u64,
    pub error_message: Option<String>,
}

impl SyncLogEntry {
    /// A fresh `running` entry for `table_name`.
    pub fn running(table_name: impl Into<String>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            table_name: table_name.into(),
            job_id: None,
            status: SyncStatus::Running,
            started_at: Utc::now(),
            completed_at: None,
            duration_ms: None,
            rows_synced: 0,
            rows_inserted: 0,
            rows_updated: 0,
            rows_deleted: 0,
            error_message: None,
        }
    }

    /// Log table name for job-level entries.
    pub fn job_table_name(job_name: &str) -> String {
        format!("job:{}", job_name)
    }
}

/// Terminal values written to a log row when an attempt finishes.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LogCompletion {
    pub rows_synced: u64,
    pub rows_inserted: u64,
    pub rows_updated: u64,
    pub rows_deleted: u64,
    pub duration_ms: i64,
    pub error_message: Option<String>,
}

/// What a job does when it fires.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum JobTarget {
    /// Sync one table.
    Table { folder: Option<String>, table: String },
    /// Sync every table in a folder.
    Folder { folder: String },
    /// Run a query, optionally materialising the result into a table.
    Query {
        sql: String,
        destination: Option<String>,
    },
}

impl JobTarget {
    pub fn kind(&self) -> &'static str {
        match self {
            JobTarget::Table { .. } => "table",
            JobTarget::Folder { .. } => "folder",
            JobTarget::Query { .. } => "query",
        }
    }

    /// Rebuild a target from its stored columns.
    ///
    /// A table job whose table is [`WILDCARD_TABLE`] targets the whole folder.
    pub fn from_columns(
        kind: &str,
        folder: Option<String>,
        table: Option<String>,
        sql: Option<String>,
        destination: Option<String>,
    ) -> anyhow::Result<Self> {
        match kind {
            "query" => {
                let sql = sql.ok_or_else(|| anyhow::anyhow!("Query job has no SQL"))?;
                Ok(JobTarget::Query { sql, destination })
            }
            "folder" => {
                let folder = folder.ok_or_else(|| anyhow::anyhow!("Folder job has no folder"))?;
                Ok(JobTarget::Folder { folder })
            }
            "table" => match table {
                Some(t) if t == WILDCARD_TABLE => {
                    let folder = folder
                        .ok_or_else(|| anyhow::anyhow!("Wildcard table job has no folder"))?;
                    Ok(JobTarget::Folder { folder })
                }
                Some(table) => Ok(JobTarget::Table { folder, table }),
                None => anyhow::bail!("Table job has no table"),
            },
            other => anyhow::bail!("Unknown job target type '{}'", other),
        }
    }

    /// Columns `(kind, folder, table, sql, destination)` for storage.
    pub fn to_columns(
        &self,
    ) -> (
        &'static str,
        Option<String>,
        Option<String>,
        Option<String>,
        Option<String>,
    ) {
        match self {
            JobTarget::Table { folder, table } => {
                ("table", folder.clone(), Some(table.clone()), None, None)
            }
            JobTarget::Folder { folder } => ("folder", Some(folder.clone()), None, None, None),
            JobTarget::Query { sql, destination } => {
                ("query", None, None, Some(sql.clone()), destination.clone())
            }
        }
    }
}

/// A scheduled trigger.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: String,
    pub name: String,
    pub target: JobTarget,
    /// Cron expression (5 or 6 fields)
    pub schedule: String,
    /// Optional time-of-day window, `HH:MM`
    pub window_start: Option<String>,
    pub window_end: Option<String>,
    pub enabled: bool,
    pub status: JobStatus,
    pub last_run: Option<DateTime<Utc>>,
    pub next_run: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Job {
    pub fn new(name: impl Into<String>, target: JobTarget, schedule: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            name: name.into(),
            target,
            schedule: schedule.into(),
            window_start: None,
            window_end: None,
            enabled: true,
            status: JobStatus::Idle,
            last_run: None,
            next_run: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_window(mut self, start: impl Into<String>, end: impl Into<String>) -> Self {
        self.window_start = Some(start.into());
        self.window_end = Some(end.into());
        self
    }
}

pub fn to_millis(time: DateTime<Utc>) -> i64 {
    time.timestamp_millis()
}

pub fn from_millis(millis: i64) -> Option<DateTime<Utc>> {
    Utc.timestamp_millis_opt(millis).single()
}
