// ABOUTME: Time-of-day windows gating job execution
// ABOUTME: Evaluated in a fixed reference UTC offset; windows may wrap midnight

use anyhow::{bail, Context, Result};
use chrono::{DateTime, FixedOffset, NaiveTime, Utc};

/// `[start, end)` in local time of day.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeWindow {
    pub start: NaiveTime,
    pub end: NaiveTime,
}

impl TimeWindow {
    pub fn parse(start: &str, end: &str) -> Result<Self> {
        Ok(Self {
            start: parse_hhmm(start)?,
            end: parse_hhmm(end)?,
        })
    }

    /// Window from a job's optional bounds. Both or neither must be set.
    pub fn from_bounds(start: Option<&str>, end: Option<&str>) -> Result<Option<Self>> {
        match (start, end) {
            (Some(s), Some(e)) => Ok(Some(Self::parse(s, e)?)),
            (None, None) => Ok(None),
            _ => bail!("Time window needs both a start and an end"),
        }
    }

    /// A window whose start equals its end is open all day. When end is
    /// before start the window wraps past midnight.
    pub fn contains(&self, time: NaiveTime) -> bool {
        if self.start == self.end {
            return true;
        }
        if self.start < self.end {
            self.start <= time && time < self.end
        } else {
            time >= self.start || time < self.end
        }
    }

    pub fn contains_at(&self, now: DateTime<Utc>, offset: FixedOffset) -> bool {
        self.contains(now.with_timezone(&offset).time())
    }
}

fn parse_hhmm(value: &str) -> Result<NaiveTime> {
    NaiveTime::parse_from_str(value.trim(), "%H:%M")
        .with_context(|| format!("Invalid time '{}', expected HH:MM", value))
}

/// Reference offset for windows, from minutes east of UTC.
pub fn reference_offset(minutes: i32) -> Result<FixedOffset> {
    FixedOffset::east_opt(minutes * 60)
        .with_context(|| format!("UTC offset of {} minutes is out of range", minutes))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn t(h: u32, m: u32) -> NaiveTime {
        NaiveTime::from_hms_opt(h, m, 0).unwrap()
    }

    #[test]
    fn test_daytime_window() {
        let w = TimeWindow::parse("09:00", "17:30").unwrap();
        assert!(w.contains(t(9, 0)));
        assert!(w.contains(t(17, 29)));
        assert!(!w.contains(t(17, 30)));
        assert!(!w.contains(t(8, 59)));
    }

    #[test]
    fn test_window_wrapping_midnight() {
        let w = TimeWindow::parse("22:00", "06:00").unwrap();
        assert!(w.contains(t(23, 0)));
        assert!(w.contains(t(0, 30)));
        assert!(!w.contains(t(6, 0)));
        assert!(!w.contains(t(12, 0)));
    }

    #[test]
    fn test_equal_bounds_always_open() {
        let w = TimeWindow::parse("00:00", "00:00").unwrap();
        assert!(w.contains(t(13, 37)));
    }

    #[test]
    fn test_evaluated_in_reference_offset() {
        let w = TimeWindow::parse("09:00", "10:00").unwrap();
        let offset = reference_offset(330).unwrap();
        // 03:45 UTC is 09:15 at +05:30
        let now = Utc.with_ymd_and_hms(2024, 1, 1, 3, 45, 0).unwrap();
        assert!(w.contains_at(now, offset));
        assert!(!w.contains_at(now, reference_offset(0).unwrap()));
    }

    #[test]
    fn test_bounds() {
        assert_eq!(TimeWindow::from_bounds(None, None).unwrap(), None);
        assert!(TimeWindow::from_bounds(Some("09:00"), None).is_err());
        assert!(TimeWindow::parse("9am", "10:00").is_err());
    }
}
