// ABOUTME: Cron schedule parsing and next-run computation for jobs
// ABOUTME: Coarse interval patterns first, exact cron evaluation second, fixed default last

use anyhow::{Context, Result};
use chrono::{DateTime, Duration, Utc};
use cron::Schedule;
use std::str::FromStr;

/// Parse a 5- or 6-field cron expression. Five fields get a `0` seconds field.
pub fn parse_schedule(expr: &str) -> Result<Schedule> {
    let normalized = normalize(expr);
    Schedule::from_str(&normalized).with_context(|| format!("Invalid cron expression '{}'", expr))
}

fn normalize(expr: &str) -> String {
    let fields: Vec<&str> = expr.split_whitespace().collect();
    if fields.len() == 5 {
        format!("0 {}", fields.join(" "))
    } else {
        fields.join(" ")
    }
}

/// Next time `schedule` fires strictly after `now`.
pub fn next_fire_after(schedule: &Schedule, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
    schedule.after(&now).next()
}

fn every(field: &str) -> Option<i64> {
    field
        .strip_prefix("*/")
        .and_then(|n| n.parse::<i64>().ok())
        .filter(|n| *n > 0)
}

fn is_fixed(field: &str) -> bool {
    !field.is_empty() && field.chars().all(|c| c.is_ascii_digit())
}

/// Offset implied by a coarse interval pattern, if the expression is one.
fn coarse_interval(expr: &str) -> Option<Duration> {
    let normalized = normalize(expr);
    let f: Vec<&str> = normalized.split_whitespace().collect();
    if f.len() != 6 {
        return None;
    }
    let rest_any = f[3..].iter().all(|x| *x == "*" || *x == "?");
    if !rest_any {
        return None;
    }
    let (sec, min, hour) = (f[0], f[1], f[2]);

    if let Some(n) = every(sec) {
        if min == "*" && hour == "*" {
            return Some(Duration::seconds(n));
        }
    }
    if sec == "*" && min == "*" && hour == "*" {
        return Some(Duration::seconds(1));
    }
    if is_fixed(sec) && hour == "*" {
        if let Some(n) = every(min) {
            return Some(Duration::minutes(n));
        }
        if min == "*" {
            return Some(Duration::minutes(1));
        }
        if is_fixed(min) {
            return Some(Duration::hours(1));
        }
    }
    if is_fixed(sec) && is_fixed(min) {
        if let Some(n) = every(hour) {
            return Some(Duration::hours(n));
        }
    }
    None
}

/// Next run time stored on a job after it ran (or was skipped).
///
/// Simple interval patterns (`*/N` seconds, minutes or hours, every minute,
/// hourly) add their interval to `now`. Other valid expressions use the next
/// cron fire time. Anything unparseable falls back to `now + default`.
pub fn next_run_after(expr: &str, now: DateTime<Utc>, default: Duration) -> DateTime<Utc> {
    if let Some(offset) = coarse_interval(expr) {
        return now + offset;
    }
    match parse_schedule(expr) {
        Ok(schedule) => next_fire_after(&schedule, now).unwrap_or(now + default),
        Err(e) => {
            tracing::debug!("{:#}; using default next run offset", e);
            now + default
        }
    }
}
