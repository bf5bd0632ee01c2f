// ABOUTME: Sync orchestrator - perform_sync and perform_query_job entry points
// ABOUTME: Takes the per-table log lock, detects changes, ingests through the swapper, keeps bookkeeping

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use std::time::Instant;

use super::detector::{detect_changes, Detection, SkipReason};
use super::mapping::{generic_column_name, ColumnMapping};
use super::swap::{swap, swap_new_table};
use super::{chunked, insert_rows, streaming, IngestContext, IngestResult};
use crate::config::EngineConfig;
use crate::db::{ColumnInfo, Database, ResultSet};
use crate::model::{LogCompletion, SyncConfig, SyncLogEntry, SyncStatus};
use crate::source::{Row, SourceReader};
use crate::store::{SqlStore, SyncBookkeeping, SyncConfigStore, SyncLogStore};
use crate::utils::{sanitize_column_name, validate_table_name};

/// How a `perform_sync` call ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncOutcome {
    Success,
    Skipped,
    /// Another sync of the same table holds the lock. Not an error.
    AlreadyRunning,
    Error,
}

/// Row statistics of a sync.
///
/// These come from the before and after row counts only; the engine does not
/// track row identity, so "updated" means "present both before and after".
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SyncStats {
    pub inserted: u64,
    pub updated: u64,
    pub deleted: u64,
    pub total: u64,
}

impl SyncStats {
    pub fn from_counts(old_count: u64, new_count: u64) -> Self {
        let (inserted, updated, deleted) = if new_count >= old_count {
            (new_count - old_count, old_count, 0)
        } else {
            (0, new_count, old_count - new_count)
        };
        Self {
            inserted,
            updated,
            deleted,
            total: new_count,
        }
    }
}

/// Structured result of [`SyncEngine::perform_sync`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SyncResult {
    pub success: bool,
    pub outcome: SyncOutcome,
    pub table: String,
    pub message: Option<String>,
    pub error: Option<String>,
    pub stats: Option<SyncStats>,
    pub processed_rows: u64,
    pub log_id: Option<String>,
}

impl SyncResult {
    fn already_running(table: &str, log_id: Option<String>) -> Self {
        Self {
            success: false,
            outcome: SyncOutcome::AlreadyRunning,
            table: table.to_string(),
            message: Some(format!("Sync already in progress for table '{}'", table)),
            error: None,
            stats: None,
            processed_rows: 0,
            log_id,
        }
    }

    fn failed(table: &str, error: &anyhow::Error, log_id: Option<String>) -> Self {
        Self {
            success: false,
            outcome: SyncOutcome::Error,
            table: table.to_string(),
            message: None,
            error: Some(format!("{:#}", error)),
            stats: None,
            processed_rows: 0,
            log_id,
        }
    }
}

/// Structured result of [`SyncEngine::perform_query_job`].
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct QueryResult {
    pub success: bool,
    pub row_count: u64,
    pub columns: Vec<String>,
    /// The first rows of the result, rendered as text
    pub rows: Vec<Row>,
    pub destination: Option<String>,
    pub message: Option<String>,
    pub error: Option<String>,
}

enum RunOutcome {
    Skipped {
        reason: SkipReason,
        modified_time: Option<DateTime<Utc>>,
    },
    Synced {
        processed_rows: u64,
        stats: SyncStats,
    },
}

/// Mirrors spreadsheet tabs into database tables.
///
/// Safe to share between tasks: concurrent calls for different tables run
/// independently, and concurrent calls for the same table are serialised by
/// the `running` log row.
pub struct SyncEngine {
    db: Arc<dyn Database>,
    source: Arc<dyn SourceReader>,
    store: Arc<SqlStore>,
    config: EngineConfig,
}

impl SyncEngine {
    pub fn new(store: Arc<SqlStore>, source: Arc<dyn SourceReader>, config: EngineConfig) -> Self {
        Self {
            db: Arc::clone(store.db()),
            source,
            store,
            config,
        }
    }

    pub fn store(&self) -> &Arc<SqlStore> {
        &self.store
    }

    pub fn db(&self) -> &Arc<dyn Database> {
        &self.db
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    fn lock_cutoff(&self) -> DateTime<Utc> {
        let timeout = chrono::Duration::from_std(self.config.lock_timeout())
            .unwrap_or_else(|_| chrono::Duration::minutes(10));
        Utc::now() - timeout
    }

    /// Sync one table from its sheet.
    ///
    /// Never returns an error: every failure is reported in the [`SyncResult`]
    /// and recorded on the log row, which always ends in a terminal status.
    pub async fn perform_sync(&self, table: &str, force: bool) -> SyncResult {
        let started = Instant::now();
        let since = self.lock_cutoff();

        match self.store.find_running_log(table, since).await {
            Ok(Some(running)) => {
                tracing::info!("Sync of '{}' already in progress (log {})", table, running.id);
                return SyncResult::already_running(table, Some(running.id));
            }
            Ok(None) => {}
            Err(e) => return SyncResult::failed(table, &e, None),
        }

        let config = match self.store.get_config(table).await {
            Ok(Some(config)) => config,
            Ok(None) => {
                let err = anyhow::anyhow!("No sync configuration for table '{}'", table);
                tracing::warn!("{}", err);
                return SyncResult::failed(table, &err, None);
            }
            Err(e) => return SyncResult::failed(table, &e, None),
        };

        let entry = SyncLogEntry::running(table);
        match self.store.start_log(&entry, since).await {
            Ok(true) => {}
            Ok(false) => {
                tracing::info!("Sync of '{}' already in progress", table);
                return SyncResult::already_running(table, None);
            }
            Err(e) => return SyncResult::failed(table, &e, None),
        }

        tracing::info!(
            "Starting sync of '{}' from {}{}",
            table,
            config.source,
            if force { " (forced)" } else { "" }
        );
        let outcome = self.run_sync(&config, &entry.id, force).await;
        let duration_ms = started.elapsed().as_millis() as i64;
        let log_id = Some(entry.id.clone());

        match outcome {
            Ok(RunOutcome::Skipped {
                reason,
                modified_time,
            }) => {
                tracing::info!("Skipped sync of '{}': {}", table, reason.describe());
                self.finish(&entry.id, SyncStatus::Skipped, LogCompletion::default())
                    .await;
                if let Err(e) = self
                    .store
                    .record_sync_status(table, SyncStatus::Skipped, None, modified_time)
                    .await
                {
                    tracing::warn!("Failed to record skip for '{}': {:#}", table, e);
                }
                SyncResult {
                    success: true,
                    outcome: SyncOutcome::Skipped,
                    table: table.to_string(),
                    message: Some(reason.describe().to_string()),
                    error: None,
                    stats: Some(SyncStats::default()),
                    processed_rows: 0,
                    log_id,
                }
            }
            Ok(RunOutcome::Synced {
                processed_rows,
                stats,
            }) => {
                tracing::info!(
                    "Completed sync of '{}': {} rows ({} inserted, {} updated, {} deleted) in {}ms",
                    table,
                    processed_rows,
                    stats.inserted,
                    stats.updated,
                    stats.deleted,
                    duration_ms
                );
                let completion = LogCompletion {
                    rows_synced: processed_rows,
                    rows_inserted: stats.inserted,
                    rows_updated: stats.updated,
                    rows_deleted: stats.deleted,
                    duration_ms,
                    error_message: None,
                };
                self.finish(&entry.id, SyncStatus::Success, completion)
                    .await;
                SyncResult {
                    success: true,
                    outcome: SyncOutcome::Success,
                    table: table.to_string(),
                    message: Some(format!("Synced {} rows", processed_rows)),
                    error: None,
                    stats: Some(stats),
                    processed_rows,
                    log_id,
                }
            }
            Err(e) => {
                tracing::error!("Sync of '{}' failed: {:?}", table, e);
                let message = format!("{:#}", e);
                let completion = LogCompletion {
                    duration_ms,
                    error_message: Some(message.clone()),
                    ..Default::default()
                };
                self.finish(&entry.id, SyncStatus::Error, completion).await;
                if let Err(e) = self
                    .store
                    .record_sync_status(table, SyncStatus::Error, Some(&message), None)
                    .await
                {
                    tracing::warn!("Failed to record error for '{}': {:#}", table, e);
                }
                SyncResult::failed(table, &e, log_id)
            }
        }
    }

    async fn finish(&self, log_id: &str, status: SyncStatus, completion: LogCompletion) {
        if let Err(e) = self.store.finish_log(log_id, status, &completion).await {
            tracing::error!(
                "Failed to close sync log {} as {}: {:#}; the reaper will close it",
                log_id,
                status,
                e
            );
        }
    }

    async fn run_sync(&self, config: &SyncConfig, log_id: &str, force: bool) -> Result<RunOutcome> {
        let table = config.table_name.as_str();
        validate_table_name(table)?;

        let columns = self.db.get_table_columns(table).await?;
        if columns.is_empty() {
            bail!(
                "Table '{}' does not exist; provision it before syncing",
                table
            );
        }

        let (row_count, header, modified_time) =
            match detect_changes(self.source.as_ref(), config, force).await? {
                Detection::Skip {
                    reason,
                    modified_time,
                } => {
                    return Ok(RunOutcome::Skipped {
                        reason,
                        modified_time,
                    })
                }
                Detection::Changed {
                    row_count,
                    header,
                    modified_time,
                } => (row_count, header, modified_time),
            };

        let old_count = self.db.count_rows(table).await?;
        let ctx = IngestContext {
            db: self.db.as_ref(),
            source: self.source.as_ref(),
            logs: self.store.as_ref(),
            engine: &self.config,
            sync: config,
            log_id,
        };

        let ingested: IngestResult = if row_count > self.config.chunk_threshold {
            tracing::info!(
                "'{}' has {} rows, above the chunk threshold of {}; streaming the export",
                table,
                row_count,
                self.config.chunk_threshold
            );
            let mapping = ColumnMapping::positional(&columns)?;
            swap(self.db.as_ref(), table, |staging| {
                let ctx = &ctx;
                let mapping = &mapping;
                async move { streaming::ingest(ctx, &staging, mapping).await }
            })
            .await?
        } else {
            let mapping = ColumnMapping::build(header.as_ref(), &columns)?;
            swap(self.db.as_ref(), table, |staging| {
                let ctx = &ctx;
                let mapping = &mapping;
                async move { chunked::ingest(ctx, &staging, mapping, row_count).await }
            })
            .await?
        };

        let stats = SyncStats::from_counts(old_count, ingested.processed_rows);
        let bookkeeping = SyncBookkeeping {
            checksum: ingested.samples.checksum(row_count),
            row_count,
            modified_time,
            synced_at: Utc::now(),
        };
        self.store
            .record_sync_success(table, &bookkeeping)
            .await
            .with_context(|| format!("Failed to record sync bookkeeping for '{}'", table))?;

        Ok(RunOutcome::Synced {
            processed_rows: ingested.processed_rows,
            stats,
        })
    }

    /// Run a query and, when `destination` is given, replace that table with
    /// the result. Never returns an error; failures land in the result.
    pub async fn perform_query_job(&self, sql: &str, destination: Option<&str>) -> QueryResult {
        match self.run_query_job(sql, destination).await {
            Ok(result) => result,
            Err(e) => {
                tracing::error!("Query job failed: {:?}", e);
                QueryResult {
                    success: false,
                    destination: destination.map(str::to_string),
                    error: Some(format!("{:#}", e)),
                    ..Default::default()
                }
            }
        }
    }

    async fn run_query_job(&self, sql: &str, destination: Option<&str>) -> Result<QueryResult> {
        if let Some(dest) = destination {
            validate_table_name(dest)?;
        }

        let rs = self
            .db
            .query(sql, &[])
            .await
            .context("Query job statement failed")?;
        let rows: Vec<Row> = rs
            .rows
            .iter()
            .map(|r| r.iter().map(|v| v.to_text()).collect())
            .collect();

        let mut result = QueryResult {
            success: true,
            row_count: rows.len() as u64,
            columns: rs.columns.clone(),
            rows: rows
                .iter()
                .take(self.config.query_preview_rows)
                .cloned()
                .collect(),
            destination: destination.map(str::to_string),
            message: None,
            error: None,
        };

        let Some(dest) = destination else {
            result.message = Some(format!("Query returned {} rows", result.row_count));
            return Ok(result);
        };

        let entry = SyncLogEntry::running(dest);
        if !self.store.start_log(&entry, self.lock_cutoff()).await? {
            return Ok(QueryResult {
                success: false,
                message: Some(format!("Sync already in progress for table '{}'", dest)),
                ..result
            });
        }

        let started = Instant::now();
        let written = self.materialize(dest, &rs, &rows).await;
        let duration_ms = started.elapsed().as_millis() as i64;

        match written {
            Ok(count) => {
                let completion = LogCompletion {
                    rows_synced: count,
                    rows_inserted: count,
                    duration_ms,
                    ..Default::default()
                };
                self.finish(&entry.id, SyncStatus::Success, completion)
                    .await;
                tracing::info!("Materialised {} query rows into '{}'", count, dest);
                result.message = Some(format!("Wrote {} rows to '{}'", count, dest));
                Ok(result)
            }
            Err(e) => {
                let completion = LogCompletion {
                    duration_ms,
                    error_message: Some(format!("{:#}", e)),
                    ..Default::default()
                };
                self.finish(&entry.id, SyncStatus::Error, completion).await;
                Err(e)
            }
        }
    }

    async fn materialize(&self, dest: &str, rs: &ResultSet, rows: &[Row]) -> Result<u64> {
        if rs.columns.is_empty() {
            bail!("Query returned no columns to write into '{}'", dest);
        }
        let names = unique_column_names(&rs.columns);
        let columns: Vec<ColumnInfo> = names.iter().map(|n| ColumnInfo::new(n, "TEXT")).collect();
        let mapping = ColumnMapping::direct(&columns);
        let db = self.db.as_ref();

        swap_new_table(db, dest, &names, |staging| {
            let mapping = &mapping;
            async move { insert_rows(db, &staging, mapping, rows).await }
        })
        .await
    }

    /// Create the live table for `config` with one TEXT column per header and
    /// store the config. Returns the column names used.
    pub async fn provision_table(
        &self,
        config: &SyncConfig,
        headers: &[String],
    ) -> Result<Vec<String>> {
        validate_table_name(&config.table_name)?;
        if self.db.table_exists(&config.table_name).await? {
            bail!("Table '{}' already exists", config.table_name);
        }
        if headers.is_empty() {
            bail!(
                "Cannot provision '{}' without any columns",
                config.table_name
            );
        }

        let names = unique_column_names(headers);
        let ddl = self.db.create_text_table_sql(&config.table_name, &names);
        self.db
            .execute(&ddl, &[])
            .await
            .with_context(|| format!("Failed to create table '{}'", config.table_name))?;
        self.store.upsert_config(config).await?;

        tracing::info!(
            "Provisioned '{}' with {} columns from {}",
            config.table_name,
            names.len(),
            config.source
        );
        Ok(names)
    }

    /// Provision a table using the sheet's header row, or generic column names
    /// sized to the first data row when the sheet has no header.
    pub async fn provision_from_source(&self, config: &SyncConfig) -> Result<Vec<String>> {
        let scan = self
            .source
            .scan(&config.source, config.header_row())
            .await
            .with_context(|| format!("Failed to read {}", config.source))?;

        let headers: Vec<String> = match scan.header {
            Some(header) if !header.is_empty() => header
                .iter()
                .enumerate()
                .map(|(i, cell)| cell.clone().unwrap_or_else(|| generic_column_name(i)))
                .collect(),
            _ => {
                let first = self
                    .source
                    .fetch_range(
                        &config.source,
                        config.data_start_row(),
                        config.data_start_row(),
                        config.end_column(),
                    )
                    .await
                    .with_context(|| format!("Failed to read {}", config.source))?;
                let width = first.first().map(|r| r.len()).unwrap_or(0);
                (0..width).map(generic_column_name).collect()
            }
        };

        self.provision_table(config, &headers).await
    }

    /// Drop a managed table together with its sync configuration.
    pub async fn delete_table(&self, table: &str) -> Result<bool> {
        validate_table_name(table)?;
        self.db.drop_table_if_exists(table).await?;
        let existed = self.store.delete_config(table).await?;
        tracing::info!("Deleted table '{}'", table);
        Ok(existed)
    }
}

/// Sanitised, de-duplicated column names; unusable names become `col_N`.
pub fn unique_column_names(headers: &[String]) -> Vec<String> {
    let mut names: Vec<String> = Vec::with_capacity(headers.len());
    for (i, header) in headers.iter().enumerate() {
        let base = sanitize_column_name(header).unwrap_or_else(|| generic_column_name(i));
        let mut name = base.clone();
        let mut suffix = 2;
        while names.contains(&name) {
            name = format!("{}_{}", base, suffix);
            suffix += 1;
        }
        names.push(name);
    }
    names
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stats_from_counts() {
        assert_eq!(
            SyncStats::from_counts(0, 3),
            SyncStats {
                inserted: 3,
                updated: 0,
                deleted: 0,
                total: 3
            }
        );
        assert_eq!(
            SyncStats::from_counts(3, 2),
            SyncStats {
                inserted: 0,
                updated: 2,
                deleted: 1,
                total: 2
            }
        );
        assert_eq!(
            SyncStats::from_counts(4, 4),
            SyncStats {
                inserted: 0,
                updated: 4,
                deleted: 0,
                total: 4
            }
        );
    }

    #[test]
    fn test_unique_column_names() {
        let headers: Vec<String> = ["Name", "name", "", "Total (USD)", "name"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        assert_eq!(
            unique_column_names(&headers),
            vec!["name", "name_2", "col_3", "total_usd", "name_3"]
        );
    }

    #[test]
    fn test_failed_result_uses_alternate_chain() {
        let err = anyhow::anyhow!("root cause").context("outer");
        let result = SyncResult::failed("t", &err, None);
        assert_eq!(result.error.as_deref(), Some("outer: root cause"));
        assert_eq!(result.outcome, SyncOutcome::Error);
        assert!(!result.success);
    }
}
