// ABOUTME: Job scheduler - cron timers, single-flight execution, windows and timeouts
// ABOUTME: All timer and in-flight bookkeeping lives in an explicit SchedulerState per instance

use anyhow::{Context, Result};
use chrono::Utc;
use futures::stream::{self, StreamExt};
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;
use tokio::task::JoinHandle;

use super::reaper;
use super::schedule::{next_fire_after, next_run_after, parse_schedule};
use super::window::{reference_offset, TimeWindow};
use crate::config::SchedulerConfig;
use crate::model::{Job, JobStatus, JobTarget, LogCompletion, SyncLogEntry, SyncStatus};
use crate::store::{JobStore, SqlStore, SyncConfigStore, SyncLogStore};
use crate::sync::{SyncEngine, SyncOutcome};

/// What started a job run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobTrigger {
    Schedule,
    Manual,
}

/// Why a run did not execute.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipCause {
    /// This process is already executing the job.
    InFlight,
    /// The persisted claim was taken by another process or tick.
    ClaimLost,
    OutsideWindow,
    Disabled,
    NotFound,
}

/// Result of one [`JobScheduler::run_job`] call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum JobRunOutcome {
    Skipped { reason: SkipCause },
    Succeeded { message: String },
    Failed { error: String },
    TimedOut,
}

/// Per-instance scheduler bookkeeping.
#[derive(Debug, Default)]
pub struct SchedulerState {
    timers: HashMap<String, JoinHandle<()>>,
    in_flight: HashSet<String>,
    reaper: Option<JoinHandle<()>>,
    initialized: bool,
}

impl SchedulerState {
    fn abort_all(&mut self) {
        for (_, handle) in self.timers.drain() {
            handle.abort();
        }
        if let Some(handle) = self.reaper.take() {
            handle.abort();
        }
        self.initialized = false;
    }
}

struct SchedulerInner {
    engine: Arc<SyncEngine>,
    store: Arc<SqlStore>,
    config: SchedulerConfig,
    state: Mutex<SchedulerState>,
}

impl SchedulerInner {
    fn state(&self) -> MutexGuard<'_, SchedulerState> {
        // State stays consistent across a panic in another holder: every
        // critical section is a single map or set update.
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Drop for SchedulerInner {
    fn drop(&mut self) {
        self.state().abort_all();
    }
}

/// Marks a job as executing in this process until dropped.
struct InFlightGuard {
    inner: Arc<SchedulerInner>,
    job_id: String,
}

impl InFlightGuard {
    fn acquire(inner: &Arc<SchedulerInner>, job_id: &str) -> Option<Self> {
        if !inner.state().in_flight.insert(job_id.to_string()) {
            return None;
        }
        Some(Self {
            inner: Arc::clone(inner),
            job_id: job_id.to_string(),
        })
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.inner.state().in_flight.remove(&self.job_id);
    }
}

/// Summary of executing one job target.
#[derive(Debug, Clone, Default)]
struct TargetReport {
    status: Option<JobStatus>,
    message: String,
    error: Option<String>,
    rows: u64,
}

/// Fires jobs on their cron schedules with at most one execution per job.
///
/// Cheap to clone; clones share the same state.
#[derive(Clone)]
pub struct JobScheduler {
    inner: Arc<SchedulerInner>,
}

impl JobScheduler {
    pub fn new(engine: Arc<SyncEngine>, config: SchedulerConfig) -> Self {
        let store = Arc::clone(engine.store());
        Self {
            inner: Arc::new(SchedulerInner {
                engine,
                store,
                config,
                state: Mutex::new(SchedulerState::default()),
            }),
        }
    }

    /// Run a reaper pass, start the periodic reaper and one timer per enabled job.
    ///
    /// Calling this again while initialised does nothing. Returns the number
    /// of active job timers.
    pub async fn initialize(&self) -> Result<usize> {
        {
            let mut state = self.inner.state();
            if state.initialized {
                return Ok(state.timers.len());
            }
            state.initialized = true;
        }

        reaper::run_once(&self.inner.store, &self.inner.config, Utc::now()).await;

        let jobs = match self.inner.store.list_jobs().await {
            Ok(jobs) => jobs,
            Err(e) => {
                self.inner.state().initialized = false;
                return Err(e).context("Failed to load jobs for the scheduler");
            }
        };

        let reaper = reaper::spawn(Arc::clone(&self.inner.store), self.inner.config.clone());
        let mut state = self.inner.state();
        if let Some(old) = state.reaper.replace(reaper) {
            old.abort();
        }
        for job in jobs.iter().filter(|j| j.enabled) {
            match parse_schedule(&job.schedule) {
                Ok(schedule) => {
                    let handle = tokio::spawn(timer_loop(
                        Arc::downgrade(&self.inner),
                        job.id.clone(),
                        schedule,
                    ));
                    if let Some(old) = state.timers.insert(job.id.clone(), handle) {
                        old.abort();
                    }
                }
                Err(e) => tracing::warn!("Not scheduling job '{}': {:#}", job.name, e),
            }
        }

        tracing::info!(
            "Scheduler initialised with {} of {} jobs",
            state.timers.len(),
            jobs.len()
        );
        Ok(state.timers.len())
    }

    /// Stop everything and initialise again, picking up job changes.
    pub async fn reload(&self) -> Result<usize> {
        self.stop_all();
        self.initialize().await
    }

    /// Cancel the timer of one job. Runs already executing are not interrupted.
    pub fn stop_job(&self, job_id: &str) -> bool {
        match self.inner.state().timers.remove(job_id) {
            Some(handle) => {
                handle.abort();
                tracing::info!("Stopped timer for job {}", job_id);
                true
            }
            None => false,
        }
    }

    pub fn stop_all(&self) {
        self.inner.state().abort_all();
        tracing::info!("Scheduler stopped");
    }

    /// Ids of jobs with an active timer, sorted.
    pub fn active_jobs(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.inner.state().timers.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Whether this process is executing `job_id` right now.
    pub fn is_running(&self, job_id: &str) -> bool {
        self.inner.state().in_flight.contains(job_id)
    }

    /// Manual trigger, through the same path as a timer firing.
    pub async fn run_now(&self, job_id: &str) -> JobRunOutcome {
        self.run_job(job_id, JobTrigger::Manual).await
    }

    /// Execute one job if nobody else is.
    ///
    /// Never returns an error and never leaves the job persisted as `running`.
    pub async fn run_job(&self, job_id: &str, trigger: JobTrigger) -> JobRunOutcome {
        let Some(_guard) = InFlightGuard::acquire(&self.inner, job_id) else {
            tracing::debug!("Job {} is already executing in this process", job_id);
            return JobRunOutcome::Skipped {
                reason: SkipCause::InFlight,
            };
        };

        let store = &self.inner.store;
        let job = match store.get_job(job_id).await {
            Ok(Some(job)) => job,
            Ok(None) => {
                tracing::warn!("Job {} no longer exists", job_id);
                return JobRunOutcome::Skipped {
                    reason: SkipCause::NotFound,
                };
            }
            Err(e) => {
                return JobRunOutcome::Failed {
                    error: format!("{:#}", e),
                }
            }
        };

        if !job.enabled && trigger == JobTrigger::Schedule {
            return JobRunOutcome::Skipped {
                reason: SkipCause::Disabled,
            };
        }

        match store.claim_job(&job.id, Utc::now()).await {
            Ok(true) => {}
            Ok(false) => {
                tracing::debug!("Job '{}' was claimed elsewhere", job.name);
                return JobRunOutcome::Skipped {
                    reason: SkipCause::ClaimLost,
                };
            }
            Err(e) => {
                tracing::error!("Failed to claim job '{}': {:?}", job.name, e);
                return JobRunOutcome::Failed {
                    error: format!("{:#}", e),
                };
            }
        }

        let outcome = self.execute_claimed(&job, trigger).await;

        match store.release_if_running(&job.id).await {
            Ok(true) => tracing::warn!(
                "Job '{}' was still marked running after its run; released",
                job.name
            ),
            Ok(false) => {}
            Err(e) => tracing::error!("Failed to release job '{}': {:#}", job.name, e),
        }
        outcome
    }

    async fn execute_claimed(&self, job: &Job, trigger: JobTrigger) -> JobRunOutcome {
        let store = &self.inner.store;
        let config = &self.inner.config;
        let default_offset = chrono::Duration::seconds(config.default_next_run_secs as i64);

        let window = match TimeWindow::from_bounds(
            job.window_start.as_deref(),
            job.window_end.as_deref(),
        )
        .and_then(|w| Ok((w, reference_offset(config.window_utc_offset_minutes)?)))
        {
            Ok(window) => window,
            Err(e) => {
                let error = format!("{:#}", e);
                tracing::error!("Job '{}' has an invalid window: {}", job.name, error);
                let next = next_run_after(&job.schedule, Utc::now(), default_offset);
                self.finish_job(job, JobStatus::Failed, next).await;
                return JobRunOutcome::Failed { error };
            }
        };

        if let (Some(window), offset) = window {
            if !window.contains_at(Utc::now(), offset) {
                tracing::info!("Job '{}' skipped: outside its time window", job.name);
                let next = next_run_after(&job.schedule, Utc::now(), default_offset);
                self.finish_job(job, JobStatus::Skipped, next).await;
                return JobRunOutcome::Skipped {
                    reason: SkipCause::OutsideWindow,
                };
            }
        }

        tracing::info!(
            "Running job '{}' ({} target, {:?} trigger)",
            job.name,
            job.target.kind(),
            trigger
        );
        let started = Instant::now();
        let mut entry = SyncLogEntry::running(SyncLogEntry::job_table_name(&job.name));
        entry.job_id = Some(job.id.clone());
        if let Err(e) = store.insert_log(&entry).await {
            tracing::warn!("Failed to write run log for job '{}': {:#}", job.name, e);
        }

        let engine = Arc::clone(&self.inner.engine);
        let target = job.target.clone();
        let concurrency = config.folder_concurrency.max(1);
        let handle = tokio::spawn(async move { execute_target(&engine, &target, concurrency).await });

        // Dropping the handle on timeout detaches the task; it finishes on its own.
        let (status, log_status, report, outcome) =
            match tokio::time::timeout(config.job_timeout(), handle).await {
                Err(_) => {
                    let error = format!(
                        "Job timed out after {}s",
                        config.job_timeout().as_secs()
                    );
                    tracing::error!("Job '{}': {}", job.name, error);
                    let report = TargetReport {
                        error: Some(error),
                        ..Default::default()
                    };
                    (JobStatus::Failed, SyncStatus::Failed, report, JobRunOutcome::TimedOut)
                }
                Ok(Err(join_error)) => {
                    let error = format!("Job task panicked: {}", join_error);
                    tracing::error!("Job '{}': {}", job.name, error);
                    let report = TargetReport {
                        error: Some(error.clone()),
                        ..Default::default()
                    };
                    (
                        JobStatus::Failed,
                        SyncStatus::Error,
                        report,
                        JobRunOutcome::Failed { error },
                    )
                }
                Ok(Ok(report)) => match report.error.clone() {
                    Some(error) => {
                        tracing::error!("Job '{}' failed: {}", job.name, error);
                        let outcome = JobRunOutcome::Failed { error };
                        (JobStatus::Failed, SyncStatus::Error, report, outcome)
                    }
                    None => {
                        let status = report.status.unwrap_or(JobStatus::Success);
                        tracing::info!("Job '{}' {}: {}", job.name, status, report.message);
                        let log_status = if status == JobStatus::Skipped {
                            SyncStatus::Skipped
                        } else {
                            SyncStatus::Success
                        };
                        let outcome = JobRunOutcome::Succeeded {
                            message: report.message.clone(),
                        };
                        (status, log_status, report, outcome)
                    }
                },
            };

        let completion = LogCompletion {
            rows_synced: report.rows,
            duration_ms: started.elapsed().as_millis() as i64,
            error_message: report.error.clone(),
            ..Default::default()
        };
        if let Err(e) = store.finish_log(&entry.id, log_status, &completion).await {
            tracing::warn!("Failed to close run log for job '{}': {:#}", job.name, e);
        }

        let next = next_run_after(&job.schedule, Utc::now(), default_offset);
        self.finish_job(job, status, next).await;
        outcome
    }

    async fn finish_job(&self, job: &Job, status: JobStatus, next: chrono::DateTime<Utc>) {
        if let Err(e) = self.inner.store.finish_job(&job.id, status, Some(next)).await {
            tracing::error!("Failed to record {} for job '{}': {:#}", status, job.name, e);
        }
    }
}

async fn timer_loop(inner: std::sync::Weak<SchedulerInner>, job_id: String, schedule: cron::Schedule) {
    loop {
        let now = Utc::now();
        let Some(next) = next_fire_after(&schedule, now) else {
            tracing::warn!("Schedule of job {} has no future fire times", job_id);
            return;
        };
        let wait = (next - now).to_std().unwrap_or_default();
        tokio::time::sleep(wait).await;

        let Some(inner) = inner.upgrade() else {
            return;
        };
        let scheduler = JobScheduler { inner };
        let id = job_id.clone();
        let run = tokio::spawn(async move {
            scheduler.run_job(&id, JobTrigger::Schedule).await
        });
        match run.await {
            Ok(outcome) => tracing::debug!("Job {} tick: {:?}", job_id, outcome),
            Err(e) => tracing::error!("Job {} run aborted: {}", job_id, e),
        }
    }
}

async fn execute_target(engine: &SyncEngine, target: &JobTarget, concurrency: usize) -> TargetReport {
    match target {
        JobTarget::Table { table, .. } => {
            let result = engine.perform_sync(table, false).await;
            match result.outcome {
                SyncOutcome::Success | SyncOutcome::Skipped => TargetReport {
                    status: Some(JobStatus::Success),
                    message: result.message.unwrap_or_default(),
                    error: None,
                    rows: result.processed_rows,
                },
                SyncOutcome::AlreadyRunning => TargetReport {
                    status: Some(JobStatus::Skipped),
                    message: result.message.unwrap_or_default(),
                    error: None,
                    rows: 0,
                },
                SyncOutcome::Error => TargetReport {
                    error: Some(result.error.unwrap_or_else(|| "sync failed".to_string())),
                    ..Default::default()
                },
            }
        }
        JobTarget::Folder { folder } => {
            let configs = match engine.store().list_configs_in_folder(folder).await {
                Ok(configs) => configs,
                Err(e) => {
                    return TargetReport {
                        error: Some(format!("{:#}", e)),
                        ..Default::default()
                    }
                }
            };
            if configs.is_empty() {
                return TargetReport {
                    status: Some(JobStatus::Success),
                    message: format!("No tables in folder '{}'", folder),
                    ..Default::default()
                };
            }

            let syncs: Vec<_> = configs
                .iter()
                .map(|config| engine.perform_sync(&config.table_name, false))
                .collect();
            let results: Vec<_> = stream::iter(syncs)
                .buffer_unordered(concurrency)
                .collect()
                .await;

            let count = |outcome: SyncOutcome| results.iter().filter(|r| r.outcome == outcome).count();
            let failed: Vec<String> = results
                .iter()
                .filter(|r| r.outcome == SyncOutcome::Error)
                .map(|r| format!("{}: {}", r.table, r.error.as_deref().unwrap_or("unknown error")))
                .collect();
            let message = format!(
                "{} synced, {} unchanged, {} already running, {} failed",
                count(SyncOutcome::Success),
                count(SyncOutcome::Skipped),
                count(SyncOutcome::AlreadyRunning),
                failed.len()
            );
            TargetReport {
                status: Some(JobStatus::Success),
                rows: results.iter().map(|r| r.processed_rows).sum(),
                error: (!failed.is_empty()).then(|| format!("{} ({})", message, failed.join("; "))),
                message,
            }
        }
        JobTarget::Query { sql, destination } => {
            let result = engine.perform_query_job(sql, destination.as_deref()).await;
            if result.success {
                TargetReport {
                    status: Some(JobStatus::Success),
                    message: result
                        .message
                        .unwrap_or_else(|| format!("{} rows", result.row_count)),
                    error: None,
                    rows: result.row_count,
                }
            } else if let Some(error) = result.error {
                TargetReport {
                    error: Some(error),
                    ..Default::default()
                }
            } else {
                TargetReport {
                    status: Some(JobStatus::Skipped),
                    message: result.message.unwrap_or_default(),
                    ..Default::default()
                }
            }
        }
    }
}
