// ABOUTME: Persistence for sync configs, sync log rows and jobs
// ABOUTME: Store traits plus a SQL implementation over the Database adapter

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Arc;

use crate::db::{Database, ResultSet, SqlValue};
use crate::model::{
    from_millis, to_millis, Job, JobStatus, JobTarget, LogCompletion, SyncConfig, SyncLogEntry,
    SyncStatus,
};
use crate::source::SourceRef;

pub const CONFIGS_TABLE: &str = "_sync_configs";
pub const LOGS_TABLE: &str = "_sync_logs";
pub const JOBS_TABLE: &str = "_sync_jobs";

const SCHEMA: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS _sync_configs (
        table_name TEXT PRIMARY KEY,
        spreadsheet_id TEXT NOT NULL,
        sheet_name TEXT NOT NULL,
        folder TEXT,
        start_row BIGINT NOT NULL DEFAULT 1,
        end_column TEXT,
        has_header BIGINT NOT NULL DEFAULT 1,
        last_sync_at BIGINT,
        last_status TEXT,
        last_error TEXT,
        last_checksum TEXT,
        last_row_count BIGINT,
        last_modified_time BIGINT,
        created_at BIGINT NOT NULL,
        updated_at BIGINT NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS _sync_logs (
        id TEXT PRIMARY KEY,
        table_name TEXT NOT NULL,
        job_id TEXT,
        status TEXT NOT NULL,
        started_at BIGINT NOT NULL,
        completed_at BIGINT,
        duration_ms BIGINT,
        rows_synced BIGINT NOT NULL DEFAULT 0,
        rows_inserted BIGINT NOT NULL DEFAULT 0,
        rows_updated BIGINT NOT NULL DEFAULT 0,
        rows_deleted BIGINT NOT NULL DEFAULT 0,
        error_message TEXT
    )",
    "CREATE INDEX IF NOT EXISTS _sync_logs_table_status ON _sync_logs (table_name, status)",
    "CREATE TABLE IF NOT EXISTS _sync_jobs (
        id TEXT PRIMARY KEY,
        name TEXT NOT NULL,
        target_type TEXT NOT NULL,
        folder TEXT,
        table_name TEXT,
        query_sql TEXT,
        destination_table TEXT,
        schedule TEXT NOT NULL,
        window_start TEXT,
        window_end TEXT,
        enabled BIGINT NOT NULL DEFAULT 1,
        status TEXT,
        last_run BIGINT,
        next_run BIGINT,
        created_at BIGINT NOT NULL,
        updated_at BIGINT NOT NULL
    )",
];

const CONFIG_COLUMNS: &str = "table_name, spreadsheet_id, sheet_name, folder, start_row, end_column, \
     has_header, last_sync_at, last_status, last_error, last_checksum, last_row_count, \
     last_modified_time, created_at, updated_at";

const LOG_COLUMNS: &str = "id, table_name, job_id, status, started_at, completed_at, duration_ms, \
     rows_synced, rows_inserted, rows_updated, rows_deleted, error_message";

const JOB_COLUMNS: &str = "id, name, target_type, folder, table_name, query_sql, destination_table, \
     schedule, window_start, window_end, enabled, status, last_run, next_run, created_at, updated_at";

/// Bookkeeping written after a fully successful sync.
#[derive(Debug, Clone, PartialEq)]
pub struct SyncBookkeeping {
    pub checksum: String,
    pub row_count: u64,
    pub modified_time: Option<DateTime<Utc>>,
    pub synced_at: DateTime<Utc>,
}

#[async_trait]
pub trait SyncConfigStore: Send + Sync {
    async fn get_config(&self, table: &str) -> Result<Option<SyncConfig>>;

    async fn upsert_config(&self, config: &SyncConfig) -> Result<()>;

    /// Checksum and row count are written together, only here.
    async fn record_sync_success(&self, table: &str, bookkeeping: &SyncBookkeeping) -> Result<()>;

    /// Record a non-success outcome. A new modification time is kept when given.
    async fn record_sync_status(
        &self,
        table: &str,
        status: SyncStatus,
        error: Option<&str>,
        modified_time: Option<DateTime<Utc>>,
    ) -> Result<()>;

    async fn list_configs(&self) -> Result<Vec<SyncConfig>>;

    async fn list_configs_in_folder(&self, folder: &str) -> Result<Vec<SyncConfig>>;

    async fn delete_config(&self, table: &str) -> Result<bool>;
}

#[async_trait]
pub trait SyncLogStore: Send + Sync {
    /// Newest `running` row for `table` started at or after `since`.
    async fn find_running_log(
        &self,
        table: &str,
        since: DateTime<Utc>,
    ) -> Result<Option<SyncLogEntry>>;

    /// Insert `entry` unless a `running` row for its table started at or after
    /// `since`. Returns whether the row was inserted.
    async fn start_log(&self, entry: &SyncLogEntry, since: DateTime<Utc>) -> Result<bool>;

    async fn insert_log(&self, entry: &SyncLogEntry) -> Result<()>;

    async fn finish_log(&self, id: &str, status: SyncStatus, completion: &LogCompletion)
        -> Result<()>;

    async fn update_log_progress(&self, id: &str, rows_synced: u64) -> Result<()>;

    async fn get_log(&self, id: &str) -> Result<Option<SyncLogEntry>>;

    async fn recent_logs(&self, table: &str, limit: usize) -> Result<Vec<SyncLogEntry>>;

    async fn purge_logs_before(&self, before: DateTime<Utc>) -> Result<u64>;

    async fn fail_stuck_logs(&self, before: DateTime<Utc>, message: &str) -> Result<u64>;
}

#[async_trait]
pub trait JobStore: Send + Sync {
    async fn get_job(&self, id: &str) -> Result<Option<Job>>;

    async fn list_jobs(&self) -> Result<Vec<Job>>;

    async fn upsert_job(&self, job: &Job) -> Result<()>;

    async fn delete_job(&self, id: &str) -> Result<bool>;

    /// Compare-and-swap into `running`. Returns false when the job is already
    /// running (or does not exist).
    async fn claim_job(&self, id: &str, now: DateTime<Utc>) -> Result<bool>;

    async fn finish_job(
        &self,
        id: &str,
        status: JobStatus,
        next_run: Option<DateTime<Utc>>,
    ) -> Result<()>;

    /// Force a job still marked `running` back to idle. Returns whether it was.
    async fn release_if_running(&self, id: &str) -> Result<bool>;

    /// Reset jobs running since before `before` to idle.
    async fn reset_stuck_jobs(&self, before: DateTime<Utc>) -> Result<u64>;
}

/// All three stores over one [`Database`].
pub struct SqlStore {
    db: Arc<dyn Database>,
}

impl SqlStore {
    pub fn new(db: Arc<dyn Database>) -> Self {
        Self { db }
    }

    pub fn db(&self) -> &Arc<dyn Database> {
        &self.db
    }

    /// Create the bookkeeping tables if missing.
    pub async fn ensure_schema(&self) -> Result<()> {
        for ddl in SCHEMA {
            self.db
                .execute(ddl, &[])
                .await
                .context("Failed to create bookkeeping tables")?;
        }
        tracing::debug!("Bookkeeping schema ready on {}", self.db.kind().as_str());
        Ok(())
    }

    /// Replace each `?` with the dialect's numbered placeholder.
    fn sql(&self, template: &str) -> String {
        let mut out = String::with_capacity(template.len() + 16);
        let mut index = 0;
        for ch in template.chars() {
            if ch == '?' {
                index += 1;
                out.push_str(&self.db.placeholder(index));
            } else {
                out.push(ch);
            }
        }
        out
    }
}

fn int(value: u64) -> SqlValue {
    SqlValue::Integer(i64::try_from(value).unwrap_or(i64::MAX))
}

fn millis(time: DateTime<Utc>) -> SqlValue {
    SqlValue::Integer(to_millis(time))
}

fn opt_millis(time: Option<DateTime<Utc>>) -> SqlValue {
    time.map(millis).unwrap_or(SqlValue::Null)
}

fn opt_text(value: Option<&str>) -> SqlValue {
    value.map(SqlValue::from).unwrap_or(SqlValue::Null)
}

fn get_text(rs: &ResultSet, row: usize, col: &str) -> Option<String> {
    rs.get(row, col).to_text()
}

fn get_int(rs: &ResultSet, row: usize, col: &str) -> Option<i64> {
    rs.get(row, col).as_i64()
}

fn get_time(rs: &ResultSet, row: usize, col: &str) -> Option<DateTime<Utc>> {
    get_int(rs, row, col).and_then(from_millis)
}

fn get_count(rs: &ResultSet, row: usize, col: &str) -> u64 {
    get_int(rs, row, col).unwrap_or(0).max(0) as u64
}

fn config_from_row(rs: &ResultSet, row: usize) -> Result<SyncConfig> {
    let table_name =
        get_text(rs, row, "table_name").context("Sync config row without table_name")?;
    let last_status = match get_text(rs, row, "last_status") {
        Some(s) => Some(s.parse::<SyncStatus>()?),
        None => None,
    };
    Ok(SyncConfig {
        source: SourceRef::new(
            get_text(rs, row, "spreadsheet_id").unwrap_or_default(),
            get_text(rs, row, "sheet_name").unwrap_or_default(),
        ),
        folder: get_text(rs, row, "folder"),
        start_row: get_int(rs, row, "start_row").unwrap_or(1).max(1) as u64,
        end_column: get_text(rs, row, "end_column"),
        has_header: get_int(rs, row, "has_header").unwrap_or(1) != 0,
        last_sync_at: get_time(rs, row, "last_sync_at"),
        last_status,
        last_error: get_text(rs, row, "last_error"),
        last_checksum: get_text(rs, row, "last_checksum"),
        last_row_count: get_int(rs, row, "last_row_count").map(|n| n.max(0) as u64),
        last_modified_time: get_time(rs, row, "last_modified_time"),
        created_at: get_time(rs, row, "created_at").unwrap_or_else(Utc::now),
        updated_at: get_time(rs, row, "updated_at").unwrap_or_else(Utc::now),
        table_name,
    })
}

fn log_from_row(rs: &ResultSet, row: usize) -> Result<SyncLogEntry> {
    Ok(SyncLogEntry {
        id: get_text(rs, row, "id").context("Sync log row without id")?,
        table_name: get_text(rs, row, "table_name").unwrap_or_default(),
        job_id: get_text(rs, row, "job_id"),
        status: get_text(rs, row, "status")
            .context("Sync log row without status")?
            .parse()?,
        started_at: get_time(rs, row, "started_at").unwrap_or_else(Utc::now),
        completed_at: get_time(rs, row, "completed_at"),
        duration_ms: get_int(rs, row, "duration_ms"),
        rows_synced: get_count(rs, row, "rows_synced"),
        rows_inserted: get_count(rs, row, "rows_inserted"),
        rows_updated: get_count(rs, row, "rows_updated"),
        rows_deleted: get_count(rs, row, "rows_deleted"),
        error_message: get_text(rs, row, "error_message"),
    })
}

fn job_from_row(rs: &ResultSet, row: usize) -> Result<Job> {
    let id = get_text(rs, row, "id").context("Job row without id")?;
    let target = JobTarget::from_columns(
        &get_text(rs, row, "target_type").unwrap_or_default(),
        get_text(rs, row, "folder"),
        get_text(rs, row, "table_name"),
        get_text(rs, row, "query_sql"),
        get_text(rs, row, "destination_table"),
    )
    .with_context(|| format!("Invalid target for job {}", id))?;

    Ok(Job {
        name: get_text(rs, row, "name").unwrap_or_default(),
        target,
        schedule: get_text(rs, row, "schedule").unwrap_or_default(),
        window_start: get_text(rs, row, "window_start"),
        window_end: get_text(rs, row, "window_end"),
        enabled: get_int(rs, row, "enabled").unwrap_or(1) != 0,
        status: JobStatus::from_stored(get_text(rs, row, "status").as_deref()),
        last_run: get_time(rs, row, "last_run"),
        next_run: get_time(rs, row, "next_run"),
        created_at: get_time(rs, row, "created_at").unwrap_or_else(Utc::now),
        updated_at: get_time(rs, row, "updated_at").unwrap_or_else(Utc::now),
        id,
    })
}

#[async_trait]
impl SyncConfigStore for SqlStore {
    async fn get_config(&self, table: &str) -> Result<Option<SyncConfig>> {
        let sql = self.sql(&format!(
            "SELECT {} FROM {} WHERE table_name = ?",
            CONFIG_COLUMNS, CONFIGS_TABLE
        ));
        let rs = self
            .db
            .query(&sql, &[table.into()])
            .await
            .with_context(|| format!("Failed to load sync config for '{}'", table))?;
        if rs.is_empty() {
            return Ok(None);
        }
        config_from_row(&rs, 0).map(Some)
    }

    async fn upsert_config(&self, config: &SyncConfig) -> Result<()> {
        let sql = self.sql(&format!(
            "INSERT INTO {} ({}) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT (table_name) DO UPDATE SET
                spreadsheet_id = EXCLUDED.spreadsheet_id,
                sheet_name = EXCLUDED.sheet_name,
                folder = EXCLUDED.folder,
                start_row = EXCLUDED.start_row,
                end_column = EXCLUDED.end_column,
                has_header = EXCLUDED.has_header,
                last_sync_at = EXCLUDED.last_sync_at,
                last_status = EXCLUDED.last_status,
                last_error = EXCLUDED.last_error,
                last_checksum = EXCLUDED.last_checksum,
                last_row_count = EXCLUDED.last_row_count,
                last_modified_time = EXCLUDED.last_modified_time,
                updated_at = EXCLUDED.updated_at",
            CONFIGS_TABLE, CONFIG_COLUMNS
        ));
        let params = vec![
            config.table_name.as_str().into(),
            config.source.spreadsheet_id.as_str().into(),
            config.source.sheet_name.as_str().into(),
            opt_text(config.folder.as_deref()),
            int(config.start_row),
            opt_text(config.end_column.as_deref()),
            SqlValue::Integer(i64::from(config.has_header)),
            opt_millis(config.last_sync_at),
            opt_text(config.last_status.as_ref().map(SyncStatus::as_str)),
            opt_text(config.last_error.as_deref()),
            opt_text(config.last_checksum.as_deref()),
            config.last_row_count.map(int).unwrap_or(SqlValue::Null),
            opt_millis(config.last_modified_time),
            millis(config.created_at),
            millis(Utc::now()),
        ];
        self.db
            .execute(&sql, &params)
            .await
            .with_context(|| format!("Failed to save sync config for '{}'", config.table_name))?;
        Ok(())
    }

    async fn record_sync_success(&self, table: &str, bookkeeping: &SyncBookkeeping) -> Result<()> {
        let sql = self.sql(&format!(
            "UPDATE {} SET last_sync_at = ?, last_status = ?, last_error = NULL,
                last_checksum = ?, last_row_count = ?,
                last_modified_time = COALESCE(?, last_modified_time), updated_at = ?
             WHERE table_name = ?",
            CONFIGS_TABLE
        ));
        let params = vec![
            millis(bookkeeping.synced_at),
            SyncStatus::Success.as_str().into(),
            bookkeeping.checksum.as_str().into(),
            int(bookkeeping.row_count),
            opt_millis(bookkeeping.modified_time),
            millis(Utc::now()),
            table.into(),
        ];
        self.db
            .execute(&sql, &params)
            .await
            .with_context(|| format!("Failed to record sync result for '{}'", table))?;
        Ok(())
    }

    async fn record_sync_status(
        &self,
        table: &str,
        status: SyncStatus,
        error: Option<&str>,
        modified_time: Option<DateTime<Utc>>,
    ) -> Result<()> {
        let sql = self.sql(&format!(
            "UPDATE {} SET last_status = ?, last_error = ?,
                last_modified_time = COALESCE(?, last_modified_time), updated_at = ?
             WHERE table_name = ?",
            CONFIGS_TABLE
        ));
        let params = vec![
            status.as_str().into(),
            opt_text(error),
            opt_millis(modified_time),
            millis(Utc::now()),
            table.into(),
        ];
        self.db
            .execute(&sql, &params)
            .await
            .with_context(|| format!("Failed to record sync status for '{}'", table))?;
        Ok(())
    }

    async fn list_configs(&self) -> Result<Vec<SyncConfig>> {
        let sql = format!(
            "SELECT {} FROM {} ORDER BY table_name",
            CONFIG_COLUMNS, CONFIGS_TABLE
        );
        let rs = self
            .db
            .query(&sql, &[])
            .await
            .context("Failed to list sync configs")?;
        (0..rs.len()).map(|row| config_from_row(&rs, row)).collect()
    }

    async fn list_configs_in_folder(&self, folder: &str) -> Result<Vec<SyncConfig>> {
        let sql = self.sql(&format!(
            "SELECT {} FROM {} WHERE folder = ? ORDER BY table_name",
            CONFIG_COLUMNS, CONFIGS_TABLE
        ));
        let rs = self
            .db
            .query(&sql, &[folder.into()])
            .await
            .with_context(|| format!("Failed to list sync configs in folder '{}'", folder))?;
        (0..rs.len()).map(|row| config_from_row(&rs, row)).collect()
    }

    async fn delete_config(&self, table: &str) -> Result<bool> {
        let sql = self.sql(&format!("DELETE FROM {} WHERE table_name = ?", CONFIGS_TABLE));
        let affected = self
            .db
            .execute(&sql, &[table.into()])
            .await
            .with_context(|| format!("Failed to delete sync config for '{}'", table))?;
        Ok(affected > 0)
    }
}

impl SqlStore {
    fn log_params(entry: &SyncLogEntry) -> Vec<SqlValue> {
        vec![
            entry.id.as_str().into(),
            entry.table_name.as_str().into(),
            opt_text(entry.job_id.as_deref()),
            entry.status.as_str().into(),
            millis(entry.started_at),
            opt_millis(entry.completed_at),
            entry.duration_ms.map(SqlValue::Integer).unwrap_or(SqlValue::Null),
            int(entry.rows_synced),
            int(entry.rows_inserted),
            int(entry.rows_updated),
            int(entry.rows_deleted),
            opt_text(entry.error_message.as_deref()),
        ]
    }
}

#[async_trait]
impl SyncLogStore for SqlStore {
    async fn find_running_log(
        &self,
        table: &str,
        since: DateTime<Utc>,
    ) -> Result<Option<SyncLogEntry>> {
        let sql = self.sql(&format!(
            "SELECT {} FROM {} WHERE table_name = ? AND status = 'running' AND started_at >= ?
             ORDER BY started_at DESC LIMIT 1",
            LOG_COLUMNS, LOGS_TABLE
        ));
        let rs = self
            .db
            .query(&sql, &[table.into(), millis(since)])
            .await
            .with_context(|| format!("Failed to check running syncs for '{}'", table))?;
        if rs.is_empty() {
            return Ok(None);
        }
        log_from_row(&rs, 0).map(Some)
    }

    async fn start_log(&self, entry: &SyncLogEntry, since: DateTime<Utc>) -> Result<bool> {
        // Explicit casts: PostgreSQL cannot infer parameter types in a bare SELECT list.
        let sql = self.sql(&format!(
            "INSERT INTO {table} ({cols})
             SELECT CAST(? AS TEXT), CAST(? AS TEXT), CAST(? AS TEXT), CAST(? AS TEXT),
                    CAST(? AS BIGINT), CAST(? AS BIGINT), CAST(? AS BIGINT), CAST(? AS BIGINT),
                    CAST(? AS BIGINT), CAST(? AS BIGINT), CAST(? AS BIGINT), CAST(? AS TEXT)
             WHERE NOT EXISTS (
                SELECT 1 FROM {table}
                WHERE table_name = ? AND status = 'running' AND started_at >= ?
             )",
            table = LOGS_TABLE,
            cols = LOG_COLUMNS
        ));
        let mut params = Self::log_params(entry);
        params.push(entry.table_name.as_str().into());
        params.push(millis(since));

        let inserted = self
            .db
            .execute(&sql, &params)
            .await
            .with_context(|| format!("Failed to start sync log for '{}'", entry.table_name))?;
        Ok(inserted > 0)
    }

    async fn insert_log(&self, entry: &SyncLogEntry) -> Result<()> {
        let sql = self.sql(&format!(
            "INSERT INTO {} ({}) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
            LOGS_TABLE, LOG_COLUMNS
        ));
        self.db
            .execute(&sql, &Self::log_params(entry))
            .await
            .with_context(|| format!("Failed to insert sync log for '{}'", entry.table_name))?;
        Ok(())
    }

    async fn finish_log(
        &self,
        id: &str,
        status: SyncStatus,
        completion: &LogCompletion,
    ) -> Result<()> {
        let sql = self.sql(&format!(
            "UPDATE {} SET status = ?, completed_at = ?, duration_ms = ?, rows_synced = ?,
                rows_inserted = ?, rows_updated = ?, rows_deleted = ?, error_message = ?
             WHERE id = ?",
            LOGS_TABLE
        ));
        let params = vec![
            status.as_str().into(),
            millis(Utc::now()),
            SqlValue::Integer(completion.duration_ms),
            int(completion.rows_synced),
            int(completion.rows_inserted),
            int(completion.rows_updated),
            int(completion.rows_deleted),
            opt_text(completion.error_message.as_deref()),
            id.into(),
        ];
        self.db
            .execute(&sql, &params)
            .await
            .with_context(|| format!("Failed to finish sync log {}", id))?;
        Ok(())
    }

    async fn update_log_progress(&self, id: &str, rows_synced: u64) -> Result<()> {
        let sql = self.sql(&format!(
            "UPDATE {} SET rows_synced = ? WHERE id = ? AND status = 'running'",
            LOGS_TABLE
        ));
        self.db
            .execute(&sql, &[int(rows_synced), id.into()])
            .await
            .with_context(|| format!("Failed to update progress of sync log {}", id))?;
        Ok(())
    }

    async fn get_log(&self, id: &str) -> Result<Option<SyncLogEntry>> {
        let sql = self.sql(&format!(
            "SELECT {} FROM {} WHERE id = ?",
            LOG_COLUMNS, LOGS_TABLE
        ));
        let rs = self.db.query(&sql, &[id.into()]).await?;
        if rs.is_empty() {
            return Ok(None);
        }
        log_from_row(&rs, 0).map(Some)
    }

    async fn recent_logs(&self, table: &str, limit: usize) -> Result<Vec<SyncLogEntry>> {
        let sql = self.sql(&format!(
            "SELECT {} FROM {} WHERE table_name = ? ORDER BY started_at DESC LIMIT ?",
            LOG_COLUMNS, LOGS_TABLE
        ));
        let rs = self
            .db
            .query(&sql, &[table.into(), int(limit as u64)])
            .await
            .with_context(|| format!("Failed to list sync logs for '{}'", table))?;
        (0..rs.len()).map(|row| log_from_row(&rs, row)).collect()
    }

    async fn purge_logs_before(&self, before: DateTime<Utc>) -> Result<u64> {
        let sql = self.sql(&format!(
            "DELETE FROM {} WHERE started_at < ? AND status <> 'running'",
            LOGS_TABLE
        ));
        self.db
            .execute(&sql, &[millis(before)])
            .await
            .context("Failed to purge old sync logs")
    }

    async fn fail_stuck_logs(&self, before: DateTime<Utc>, message: &str) -> Result<u64> {
        let sql = self.sql(&format!(
            "UPDATE {} SET status = 'error', error_message = ?, completed_at = ?
             WHERE status = 'running' AND started_at < ?",
            LOGS_TABLE
        ));
        self.db
            .execute(&sql, &[message.into(), millis(Utc::now()), millis(before)])
            .await
            .context("Failed to fail stuck sync logs")
    }
}

#[async_trait]
impl JobStore for SqlStore {
    async fn get_job(&self, id: &str) -> Result<Option<Job>> {
        let sql = self.sql(&format!(
            "SELECT {} FROM {} WHERE id = ?",
            JOB_COLUMNS, JOBS_TABLE
        ));
        let rs = self
            .db
            .query(&sql, &[id.into()])
            .await
            .with_context(|| format!("Failed to load job {}", id))?;
        if rs.is_empty() {
            return Ok(None);
        }
        job_from_row(&rs, 0).map(Some)
    }

    async fn list_jobs(&self) -> Result<Vec<Job>> {
        let sql = format!("SELECT {} FROM {} ORDER BY name", JOB_COLUMNS, JOBS_TABLE);
        let rs = self.db.query(&sql, &[]).await.context("Failed to list jobs")?;
        (0..rs.len()).map(|row| job_from_row(&rs, row)).collect()
    }

    async fn upsert_job(&self, job: &Job) -> Result<()> {
        let (kind, folder, table, query_sql, destination) = job.target.to_columns();
        let sql = self.sql(&format!(
            "INSERT INTO {} ({}) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT (id) DO UPDATE SET
                name = EXCLUDED.name,
                target_type = EXCLUDED.target_type,
                folder = EXCLUDED.folder,
                table_name = EXCLUDED.table_name,
                query_sql = EXCLUDED.query_sql,
                destination_table = EXCLUDED.destination_table,
                schedule = EXCLUDED.schedule,
                window_start = EXCLUDED.window_start,
                window_end = EXCLUDED.window_end,
                enabled = EXCLUDED.enabled,
                status = EXCLUDED.status,
                last_run = EXCLUDED.last_run,
                next_run = EXCLUDED.next_run,
                updated_at = EXCLUDED.updated_at",
            JOBS_TABLE, JOB_COLUMNS
        ));
        let params = vec![
            job.id.as_str().into(),
            job.name.as_str().into(),
            kind.into(),
            folder.into(),
            table.into(),
            query_sql.into(),
            destination.into(),
            job.schedule.as_str().into(),
            opt_text(job.window_start.as_deref()),
            opt_text(job.window_end.as_deref()),
            SqlValue::Integer(i64::from(job.enabled)),
            job.status.as_str().into(),
            opt_millis(job.last_run),
            opt_millis(job.next_run),
            millis(job.created_at),
            millis(job.updated_at),
        ];
        self.db
            .execute(&sql, &params)
            .await
            .with_context(|| format!("Failed to save job '{}'", job.name))?;
        Ok(())
    }

    async fn delete_job(&self, id: &str) -> Result<bool> {
        let sql = self.sql(&format!("DELETE FROM {} WHERE id = ?", JOBS_TABLE));
        let affected = self
            .db
            .execute(&sql, &[id.into()])
            .await
            .with_context(|| format!("Failed to delete job {}", id))?;
        Ok(affected > 0)
    }

    async fn claim_job(&self, id: &str, now: DateTime<Utc>) -> Result<bool> {
        let sql = self.sql(&format!(
            "UPDATE {} SET status = 'running', last_run = ?, updated_at = ?
             WHERE id = ? AND (status IS NULL OR status <> 'running')",
            JOBS_TABLE
        ));
        let affected = self
            .db
            .execute(&sql, &[millis(now), millis(now), id.into()])
            .await
            .with_context(|| format!("Failed to claim job {}", id))?;
        Ok(affected == 1)
    }

    async fn finish_job(
        &self,
        id: &str,
        status: JobStatus,
        next_run: Option<DateTime<Utc>>,
    ) -> Result<()> {
        let sql = self.sql(&format!(
            "UPDATE {} SET status = ?, next_run = ?, updated_at = ? WHERE id = ?",
            JOBS_TABLE
        ));
        self.db
            .execute(
                &sql,
                &[
                    status.as_str().into(),
                    opt_millis(next_run),
                    millis(Utc::now()),
                    id.into(),
                ],
            )
            .await
            .with_context(|| format!("Failed to update status of job {}", id))?;
        Ok(())
    }

    async fn release_if_running(&self, id: &str) -> Result<bool> {
        let sql = self.sql(&format!(
            "UPDATE {} SET status = 'idle', updated_at = ? WHERE id = ? AND status = 'running'",
            JOBS_TABLE
        ));
        let affected = self
            .db
            .execute(&sql, &[millis(Utc::now()), id.into()])
            .await
            .with_context(|| format!("Failed to release job {}", id))?;
        Ok(affected > 0)
    }

    async fn reset_stuck_jobs(&self, before: DateTime<Utc>) -> Result<u64> {
        let sql = self.sql(&format!(
            "UPDATE {} SET status = 'idle', updated_at = ?
             WHERE status = 'running' AND updated_at < ?",
            JOBS_TABLE
        ));
        self.db
            .execute(&sql, &[millis(Utc::now()), millis(before)])
            .await
            .context("Failed to reset stuck jobs")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::SqliteDatabase;
    use chrono::Duration;

    async fn store() -> SqlStore {
        let db: Arc<dyn Database> = Arc::new(SqliteDatabase::open_in_memory().unwrap());
        let store = SqlStore::new(db);
        store.ensure_schema().await.unwrap();
        store
    }

    #[tokio::test]
    async fn test_ensure_schema_is_idempotent() {
        let store = store().await;
        store.ensure_schema().await.unwrap();
    }

    #[tokio::test]
    async fn test_config_round_trip_and_success_bookkeeping() {
        let store = store().await;
        let config = SyncConfig::new("orders", SourceRef::new("book", "Orders"))
            .with_folder("sales")
            .with_start_row(2)
            .with_end_column("F");
        store.upsert_config(&config).await.unwrap();

        let loaded = store.get_config("orders").await.unwrap().unwrap();
        assert_eq!(loaded.source, config.source);
        assert_eq!(loaded.start_row, 2);
        assert_eq!(loaded.end_column.as_deref(), Some("F"));
        assert!(loaded.has_header);
        assert!(loaded.last_checksum.is_none());

        let modified = from_millis(1_700_000_000_000).unwrap();
        store
            .record_sync_success(
                "orders",
                &SyncBookkeeping {
                    checksum: "abc".into(),
                    row_count: 12,
                    modified_time: Some(modified),
                    synced_at: Utc::now(),
                },
            )
            .await
            .unwrap();
        store
            .record_sync_status("orders", SyncStatus::Skipped, None, None)
            .await
            .unwrap();

        let loaded = store.get_config("orders").await.unwrap().unwrap();
        assert_eq!(loaded.last_checksum.as_deref(), Some("abc"));
        assert_eq!(loaded.last_row_count, Some(12));
        assert_eq!(loaded.last_modified_time, Some(modified));
        assert_eq!(loaded.last_status, Some(SyncStatus::Skipped));

        assert_eq!(store.list_configs_in_folder("sales").await.unwrap().len(), 1);
        assert!(store.delete_config("orders").await.unwrap());
        assert!(store.get_config("orders").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_start_log_refuses_second_running_row() {
        let store = store().await;
        let since = Utc::now() - Duration::minutes(10);

        let first = SyncLogEntry::running("orders");
        assert!(store.start_log(&first, since).await.unwrap());
        assert!(!store
            .start_log(&SyncLogEntry::running("orders"), since)
            .await
            .unwrap());
        assert!(store
            .start_log(&SyncLogEntry::running("customers"), since)
            .await
            .unwrap());

        let running = store.find_running_log("orders", since).await.unwrap().unwrap();
        assert_eq!(running.id, first.id);

        store
            .finish_log(&first.id, SyncStatus::Success, &LogCompletion::default())
            .await
            .unwrap();
        assert!(store.find_running_log("orders", since).await.unwrap().is_none());
        assert!(store
            .start_log(&SyncLogEntry::running("orders"), since)
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_stale_running_log_does_not_block() {
        let store = store().await;
        let mut stale = SyncLogEntry::running("orders");
        stale.started_at = Utc::now() - Duration::minutes(45);
        store.insert_log(&stale).await.unwrap();

        let since = Utc::now() - Duration::minutes(10);
        assert!(store.find_running_log("orders", since).await.unwrap().is_none());

        let failed = store
            .fail_stuck_logs(Utc::now() - Duration::minutes(30), "stuck")
            .await
            .unwrap();
        assert_eq!(failed, 1);
        let log = store.get_log(&stale.id).await.unwrap().unwrap();
        assert_eq!(log.status, SyncStatus::Error);
        assert_eq!(log.error_message.as_deref(), Some("stuck"));
    }

    #[tokio::test]
    async fn test_claim_job_is_compare_and_swap() {
        let store = store().await;
        let job = Job::new(
            "nightly",
            JobTarget::Table {
                folder: None,
                table: "orders".into(),
            },
            "0 2 * * *",
        );
        store.upsert_job(&job).await.unwrap();

        assert!(store.claim_job(&job.id, Utc::now()).await.unwrap());
        assert!(!store.claim_job(&job.id, Utc::now()).await.unwrap());
        assert_eq!(
            store.get_job(&job.id).await.unwrap().unwrap().status,
            JobStatus::Running
        );

        assert!(store.release_if_running(&job.id).await.unwrap());
        assert!(!store.release_if_running(&job.id).await.unwrap());
        assert!(store.claim_job(&job.id, Utc::now()).await.unwrap());

        store
            .finish_job(&job.id, JobStatus::Success, None)
            .await
            .unwrap();
        let loaded = store.get_job(&job.id).await.unwrap().unwrap();
        assert_eq!(loaded.status, JobStatus::Success);
        assert!(loaded.last_run.is_some());
    }

    #[tokio::test]
    async fn test_claim_unknown_job_affects_nothing() {
        let store = store().await;
        assert!(!store.claim_job("missing", Utc::now()).await.unwrap());
    }

    #[tokio::test]
    async fn test_purge_keeps_running_rows() {
        let store = store().await;
        let mut old_done = SyncLogEntry::running("orders");
        old_done.status = SyncStatus::Success;
        old_done.started_at = Utc::now() - Duration::hours(30);
        store.insert_log(&old_done).await.unwrap();

        let mut old_running = SyncLogEntry::running("orders");
        old_running.started_at = Utc::now() - Duration::hours(30);
        store.insert_log(&old_running).await.unwrap();

        store.insert_log(&SyncLogEntry::running("customers")).await.unwrap();

        let purged = store
            .purge_logs_before(Utc::now() - Duration::hours(24))
            .await
            .unwrap();
        assert_eq!(purged, 1);
        assert_eq!(store.recent_logs("orders", 10).await.unwrap().len(), 1);
    }
}
