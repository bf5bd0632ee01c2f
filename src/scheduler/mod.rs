// ABOUTME: Job scheduling - cron timers, time windows, single-flight runs
// ABOUTME: Plus the reaper that recovers state left behind by crashed runs

pub mod reaper;
pub mod runner;
pub mod schedule;
pub mod window;

pub use reaper::ReaperReport;
pub use runner::{JobRunOutcome, JobScheduler, JobTrigger, SchedulerState, SkipCause};
pub use schedule::{next_run_after, parse_schedule};
pub use window::TimeWindow;
