// ABOUTME: Stuck-state reaper - frees jobs and sync locks left running by a crash
// ABOUTME: Also sweeps orphaned staging tables and purges old sync log rows

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::config::SchedulerConfig;
use crate::store::{JobStore, SqlStore, SyncLogStore};
use crate::sync::swap::drop_stale_staging_tables;

/// What one reaper pass changed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReaperReport {
    pub jobs_reset: u64,
    pub logs_failed: u64,
    pub staging_dropped: Vec<String>,
    pub logs_purged: u64,
}

impl ReaperReport {
    pub fn is_empty(&self) -> bool {
        self.jobs_reset == 0
            && self.logs_failed == 0
            && self.staging_dropped.is_empty()
            && self.logs_purged == 0
    }
}

fn before(now: DateTime<Utc>, secs: u64) -> DateTime<Utc> {
    now - chrono::Duration::seconds(secs.min(i64::MAX as u64) as i64)
}

/// One reaper pass. Every step runs even when an earlier one fails.
pub async fn run_once(store: &SqlStore, config: &SchedulerConfig, now: DateTime<Utc>) -> ReaperReport {
    let mut report = ReaperReport::default();

    match store
        .reset_stuck_jobs(before(now, config.job_stuck_timeout_secs))
        .await
    {
        Ok(n) => report.jobs_reset = n,
        Err(e) => tracing::warn!("Reaper could not reset stuck jobs: {:#}", e),
    }

    let message = format!(
        "Marked as error by reaper: still running after {} minutes",
        config.log_stuck_timeout_secs / 60
    );
    match store
        .fail_stuck_logs(before(now, config.log_stuck_timeout_secs), &message)
        .await
    {
        Ok(n) => report.logs_failed = n,
        Err(e) => tracing::warn!("Reaper could not fail stuck sync logs: {:#}", e),
    }

    match drop_stale_staging_tables(
        store.db().as_ref(),
        Duration::from_secs(config.staging_max_age_secs),
        now,
    )
    .await
    {
        Ok(dropped) => report.staging_dropped = dropped,
        Err(e) => tracing::warn!("Reaper could not sweep staging tables: {:#}", e),
    }

    match store
        .purge_logs_before(before(now, config.log_retention_secs))
        .await
    {
        Ok(n) => report.logs_purged = n,
        Err(e) => tracing::warn!("Reaper could not purge old sync logs: {:#}", e),
    }

    if report.is_empty() {
        tracing::debug!("Reaper pass found nothing to clean up");
    } else {
        tracing::info!(
            "Reaper: {} jobs reset, {} sync logs failed, {} staging tables dropped, {} logs purged",
            report.jobs_reset,
            report.logs_failed,
            report.staging_dropped.len(),
            report.logs_purged
        );
    }
    report
}

/// Run the reaper every `reaper_interval`, starting one interval from now.
pub fn spawn(store: Arc<SqlStore>, config: SchedulerConfig) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(config.reaper_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately.
        ticker.tick().await;
        loop {
            ticker.tick().await;
            run_once(&store, &config, Utc::now()).await;
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{Database, SqliteDatabase};
    use crate::model::{Job, JobStatus, JobTarget, SyncLogEntry, SyncStatus};
    use crate::sync::swap::staging_table_name;

    async fn store() -> SqlStore {
        let store = SqlStore::new(Arc::new(SqliteDatabase::open_in_memory().unwrap()));
        store.ensure_schema().await.unwrap();
        store
    }

    #[tokio::test]
    async fn test_reaper_recovers_stale_state() {
        let store = store().await;
        let config = SchedulerConfig::default();
        let now = Utc::now();
        let long_ago = now - chrono::Duration::hours(2);

        let mut job = Job::new(
            "nightly",
            JobTarget::Folder {
                folder: "finance".into(),
            },
            "0 2 * * *",
        );
        job.status = JobStatus::Running;
        job.updated_at = long_ago;
        store.upsert_job(&job).await.unwrap();

        let mut log = SyncLogEntry::running("orders");
        log.started_at = long_ago;
        store.insert_log(&log).await.unwrap();

        let db = store.db().clone();
        db.execute("CREATE TABLE orders (a TEXT)", &[]).await.unwrap();
        let orphan = staging_table_name("orders", long_ago);
        db.clone_table_structure("orders", &orphan).await.unwrap();

        let report = run_once(&store, &config, now).await;
        assert_eq!(report.jobs_reset, 1);
        assert_eq!(report.logs_failed, 1);
        assert_eq!(report.staging_dropped, vec![orphan]);

        let job = store.get_job(&job.id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Idle);
        let log = store.get_log(&log.id).await.unwrap().unwrap();
        assert_eq!(log.status, SyncStatus::Error);
        assert!(log.error_message.unwrap().contains("reaper"));

        assert!(run_once(&store, &config, now).await.is_empty());
    }

    #[tokio::test]
    async fn test_reaper_leaves_fresh_state_alone() {
        let store = store().await;
        let mut job = Job::new(
            "hourly",
            JobTarget::Table {
                folder: None,
                table: "orders".into(),
            },
            "0 * * * *",
        );
        job.status = JobStatus::Running;
        store.upsert_job(&job).await.unwrap();
        store
            .insert_log(&SyncLogEntry::running("orders"))
            .await
            .unwrap();

        let report = run_once(&store, &SchedulerConfig::default(), Utc::now()).await;
        assert!(report.is_empty());
    }
}
