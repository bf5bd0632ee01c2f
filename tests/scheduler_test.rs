// ABOUTME: Integration tests for the job scheduler and the reaper
// ABOUTME: Single-flight claims, windows, timeouts, folder fan-out and timer lifecycle

use chrono::{Duration as ChronoDuration, FixedOffset, Utc};
use sheet_sync::config::{EngineConfig, SchedulerConfig};
use sheet_sync::db::{Database, SqliteDatabase};
use sheet_sync::model::{Job, JobStatus, JobTarget, SyncConfig, SyncLogEntry, SyncStatus};
use sheet_sync::scheduler::{JobRunOutcome, JobScheduler, JobTrigger, SkipCause};
use sheet_sync::source::{MemorySource, Row, SourceRef};
use sheet_sync::store::{JobStore, SqlStore, SyncLogStore};
use sheet_sync::sync::SyncEngine;
use std::sync::Arc;
use std::time::Duration;

struct Harness {
    engine: Arc<SyncEngine>,
    source: Arc<MemorySource>,
    db: Arc<dyn Database>,
    store: Arc<SqlStore>,
}

async fn harness() -> Harness {
    let db: Arc<dyn Database> = Arc::new(SqliteDatabase::open_in_memory().unwrap());
    let store = Arc::new(SqlStore::new(db.clone()));
    store.ensure_schema().await.unwrap();
    let source = Arc::new(MemorySource::new());
    let engine = Arc::new(SyncEngine::new(
        store.clone(),
        source.clone(),
        EngineConfig {
            chunk_delay_ms: 0,
            ..Default::default()
        },
    ));
    Harness {
        engine,
        source,
        db,
        store,
    }
}

fn rows(prefix: &str, n: usize) -> Vec<Row> {
    (1..=n)
        .map(|i| vec![Some(format!("{}-{}", prefix, i)), Some(i.to_string())])
        .collect()
}

/// Provision `table` from its own tab, optionally inside `folder`.
async fn add_table(h: &Harness, table: &str, folder: Option<&str>, n: usize) {
    let source = SourceRef::new("book", table);
    h.source.set_rows(&source, rows(table, n));
    let mut config = SyncConfig::new(table, source).with_header(false);
    if let Some(folder) = folder {
        config = config.with_folder(folder);
    }
    h.engine
        .provision_table(&config, &["col_1".to_string(), "col_2".to_string()])
        .await
        .unwrap();
}

async fn add_job(h: &Harness, job: Job) -> String {
    h.store.upsert_job(&job).await.unwrap();
    job.id
}

fn table_job(name: &str, table: &str) -> Job {
    Job::new(
        name,
        JobTarget::Table {
            folder: None,
            table: table.to_string(),
        },
        "0 2 * * *",
    )
}

fn scheduler(h: &Harness, config: SchedulerConfig) -> JobScheduler {
    JobScheduler::new(h.engine.clone(), config)
}

#[tokio::test]
async fn test_run_now_syncs_table_and_records_job_log() {
    let h = harness().await;
    add_table(&h, "orders", None, 3).await;
    let id = add_job(&h, table_job("nightly", "orders")).await;

    let outcome = scheduler(&h, SchedulerConfig::default()).run_now(&id).await;
    assert!(matches!(outcome, JobRunOutcome::Succeeded { .. }), "{:?}", outcome);
    assert_eq!(h.db.count_rows("orders").await.unwrap(), 3);

    let job = h.store.get_job(&id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Success);
    assert!(job.last_run.is_some());
    assert!(job.next_run.unwrap() > Utc::now());

    let logs = h
        .store
        .recent_logs(&SyncLogEntry::job_table_name("nightly"), 5)
        .await
        .unwrap();
    assert_eq!(logs.len(), 1);
    assert_eq!(logs[0].status, SyncStatus::Success);
    assert_eq!(logs[0].job_id.as_deref(), Some(id.as_str()));
    assert_eq!(logs[0].rows_synced, 3);
}

#[tokio::test]
async fn test_overlapping_runs_in_one_process_are_single_flight() {
    let h = harness().await;
    add_table(&h, "orders", None, 3).await;
    h.source.set_fetch_delay(Duration::from_millis(300));
    let id = add_job(&h, table_job("nightly", "orders")).await;
    let scheduler = scheduler(&h, SchedulerConfig::default());

    let (a, b) = tokio::join!(scheduler.run_now(&id), scheduler.run_now(&id));
    let skipped = [&a, &b]
        .iter()
        .filter(|o| {
            matches!(
                o,
                JobRunOutcome::Skipped {
                    reason: SkipCause::InFlight
                }
            )
        })
        .count();
    assert_eq!(skipped, 1, "{:?} / {:?}", a, b);
    assert!(!scheduler.is_running(&id));

    let logs = h
        .store
        .recent_logs(&SyncLogEntry::job_table_name("nightly"), 5)
        .await
        .unwrap();
    assert_eq!(logs.len(), 1);
}

#[tokio::test]
async fn test_claim_is_exclusive_across_schedulers() {
    let h = harness().await;
    add_table(&h, "orders", None, 3).await;
    h.source.set_fetch_delay(Duration::from_millis(300));
    let id = add_job(&h, table_job("nightly", "orders")).await;

    // Two schedulers sharing one store stand in for two processes.
    let first = scheduler(&h, SchedulerConfig::default());
    let second = scheduler(&h, SchedulerConfig::default());
    let (a, b) = tokio::join!(
        first.run_job(&id, JobTrigger::Schedule),
        second.run_job(&id, JobTrigger::Schedule)
    );

    let outcomes = [a, b];
    assert_eq!(
        outcomes
            .iter()
            .filter(|o| matches!(o, JobRunOutcome::Succeeded { .. }))
            .count(),
        1,
        "{:?}",
        outcomes
    );
    assert!(outcomes.contains(&JobRunOutcome::Skipped {
        reason: SkipCause::ClaimLost
    }));
    assert_eq!(
        h.store.get_job(&id).await.unwrap().unwrap().status,
        JobStatus::Success
    );
}

#[tokio::test]
async fn test_job_outside_window_is_skipped() {
    let h = harness().await;
    add_table(&h, "orders", None, 3).await;

    let config = SchedulerConfig::default();
    let offset = FixedOffset::east_opt(config.window_utc_offset_minutes * 60).unwrap();
    let local = Utc::now().with_timezone(&offset);
    let start = (local + ChronoDuration::hours(2)).format("%H:%M").to_string();
    let end = (local + ChronoDuration::hours(3)).format("%H:%M").to_string();
    let id = add_job(&h, table_job("windowed", "orders").with_window(start, end)).await;

    let outcome = scheduler(&h, config).run_now(&id).await;
    assert_eq!(
        outcome,
        JobRunOutcome::Skipped {
            reason: SkipCause::OutsideWindow
        }
    );
    assert_eq!(h.db.count_rows("orders").await.unwrap(), 0);

    let job = h.store.get_job(&id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Skipped);
    assert!(job.next_run.is_some());
}

#[tokio::test]
async fn test_disabled_and_unknown_jobs() {
    let h = harness().await;
    add_table(&h, "orders", None, 2).await;
    let mut job = table_job("paused", "orders");
    job.enabled = false;
    let id = add_job(&h, job).await;
    let scheduler = scheduler(&h, SchedulerConfig::default());

    assert_eq!(
        scheduler.run_job(&id, JobTrigger::Schedule).await,
        JobRunOutcome::Skipped {
            reason: SkipCause::Disabled
        }
    );
    // A manual trigger still runs a disabled job.
    assert!(matches!(
        scheduler.run_now(&id).await,
        JobRunOutcome::Succeeded { .. }
    ));
    assert_eq!(
        scheduler.run_now("no-such-job").await,
        JobRunOutcome::Skipped {
            reason: SkipCause::NotFound
        }
    );
}

#[tokio::test]
async fn test_timeout_marks_job_failed_and_releases_claim() {
    let h = harness().await;
    add_table(&h, "orders", None, 3).await;
    h.source.set_fetch_delay(Duration::from_secs(5));
    let id = add_job(&h, table_job("slow", "orders")).await;
    let config = SchedulerConfig {
        job_timeout_secs: 1,
        ..Default::default()
    };

    let outcome = scheduler(&h, config).run_now(&id).await;
    assert_eq!(outcome, JobRunOutcome::TimedOut);

    let job = h.store.get_job(&id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Failed);
    let logs = h
        .store
        .recent_logs(&SyncLogEntry::job_table_name("slow"), 5)
        .await
        .unwrap();
    assert_eq!(logs.len(), 1);
    assert_eq!(logs[0].status, SyncStatus::Failed);
    assert!(logs[0].error_message.as_deref().unwrap().contains("timed out"));
}

#[tokio::test]
async fn test_failing_target_marks_job_failed() {
    let h = harness().await;
    let id = add_job(&h, table_job("broken", "not_configured")).await;

    let outcome = scheduler(&h, SchedulerConfig::default()).run_now(&id).await;
    match outcome {
        JobRunOutcome::Failed { error } => assert!(error.contains("No sync configuration")),
        other => panic!("expected failure, got {:?}", other),
    }
    let job = h.store.get_job(&id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Failed);
}

#[tokio::test]
async fn test_folder_job_syncs_every_table_in_folder() {
    let h = harness().await;
    add_table(&h, "orders", Some("finance"), 3).await;
    add_table(&h, "invoices", Some("finance"), 2).await;
    add_table(&h, "staff", Some("hr"), 4).await;
    let id = add_job(
        &h,
        Job::new(
            "finance",
            JobTarget::Folder {
                folder: "finance".into(),
            },
            "*/15 * * * *",
        ),
    )
    .await;

    let outcome = scheduler(
        &h,
        SchedulerConfig {
            folder_concurrency: 2,
            ..Default::default()
        },
    )
    .run_now(&id)
    .await;
    match outcome {
        JobRunOutcome::Succeeded { message } => assert!(message.starts_with("2 synced"), "{}", message),
        other => panic!("expected success, got {:?}", other),
    }
    assert_eq!(h.db.count_rows("orders").await.unwrap(), 3);
    assert_eq!(h.db.count_rows("invoices").await.unwrap(), 2);
    assert_eq!(h.db.count_rows("staff").await.unwrap(), 0);

    let logs = h
        .store
        .recent_logs(&SyncLogEntry::job_table_name("finance"), 5)
        .await
        .unwrap();
    assert_eq!(logs[0].rows_synced, 5);
}

#[tokio::test]
async fn test_query_job_materialises_result() {
    let h = harness().await;
    add_table(&h, "orders", None, 3).await;
    h.engine.perform_sync("orders", false).await;
    let id = add_job(
        &h,
        Job::new(
            "rollup",
            JobTarget::Query {
                sql: "SELECT col_1 AS item FROM orders".into(),
                destination: Some("order_items".into()),
            },
            "0 * * * *",
        ),
    )
    .await;

    let outcome = scheduler(&h, SchedulerConfig::default()).run_now(&id).await;
    assert!(matches!(outcome, JobRunOutcome::Succeeded { .. }), "{:?}", outcome);
    assert_eq!(h.db.count_rows("order_items").await.unwrap(), 3);
}

#[tokio::test]
async fn test_initialize_reaps_stuck_jobs_and_manages_timers() {
    let h = harness().await;
    add_table(&h, "orders", None, 2).await;

    let mut stuck = table_job("stuck", "orders");
    stuck.status = JobStatus::Running;
    stuck.updated_at = Utc::now() - ChronoDuration::hours(2);
    let stuck_id = add_job(&h, stuck).await;

    let mut yearly = table_job("yearly", "orders");
    yearly.schedule = "0 0 1 1 *".into();
    let yearly_id = add_job(&h, yearly).await;

    let mut disabled = table_job("disabled", "orders");
    disabled.enabled = false;
    add_job(&h, disabled).await;

    let mut invalid = table_job("invalid", "orders");
    invalid.schedule = "whenever".into();
    add_job(&h, invalid).await;

    let scheduler = scheduler(&h, SchedulerConfig::default());
    assert_eq!(scheduler.initialize().await.unwrap(), 2);
    assert_eq!(scheduler.initialize().await.unwrap(), 2);

    let mut expected = vec![stuck_id.clone(), yearly_id.clone()];
    expected.sort();
    assert_eq!(scheduler.active_jobs(), expected);

    // The startup reaper pass released the stale claim.
    assert_eq!(
        h.store.get_job(&stuck_id).await.unwrap().unwrap().status,
        JobStatus::Idle
    );
    assert!(matches!(
        scheduler.run_now(&stuck_id).await,
        JobRunOutcome::Succeeded { .. }
    ));

    assert!(scheduler.stop_job(&yearly_id));
    assert!(!scheduler.stop_job(&yearly_id));
    assert_eq!(scheduler.active_jobs(), vec![stuck_id]);

    scheduler.stop_all();
    assert!(scheduler.active_jobs().is_empty());
    assert_eq!(scheduler.reload().await.unwrap(), 2);
    scheduler.stop_all();
}

#[tokio::test]
async fn test_timer_fires_job() {
    let h = harness().await;
    add_table(&h, "orders", None, 2).await;
    let mut job = table_job("every_second", "orders");
    job.schedule = "* * * * * *".into();
    let id = add_job(&h, job).await;

    let scheduler = scheduler(&h, SchedulerConfig::default());
    scheduler.initialize().await.unwrap();

    let mut synced = false;
    for _ in 0..50 {
        tokio::time::sleep(Duration::from_millis(100)).await;
        if h.db.count_rows("orders").await.unwrap() == 2 {
            synced = true;
            break;
        }
    }
    scheduler.stop_all();
    assert!(synced, "timer never ran the job");
    assert!(h.store.get_job(&id).await.unwrap().unwrap().last_run.is_some());
}
