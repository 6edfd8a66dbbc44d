//! Attendance gates: business-hours window and claimed-identity match.

use chrono::{DateTime, Datelike, FixedOffset, NaiveTime, Offset, TimeZone, Timelike, Utc, Weekday};
use std::ops::RangeInclusive;
use thiserror::Error;

#[derive(Error, Debug, PartialEq)]
pub enum GateError {
    #[error("attendance is only accepted during business hours (server time {now})")]
    OutsideWindow { now: String },
    #[error("unknown user {0}")]
    UnknownUser(String),
    #[error("face does not match with user")]
    IdentityMismatch { predicted: String, expected: String },
}

/// Source of the current instant.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Always returns the same instant.
#[derive(Debug, Clone, Copy)]
pub struct FixedClock(pub DateTime<Utc>);

impl Clock for FixedClock {
    fn now(&self) -> DateTime<Utc> {
        self.0
    }
}

/// Allowed weekdays and inclusive hour range in a fixed civil timezone.
#[derive(Debug, Clone)]
pub struct TimeWindow {
    offset: FixedOffset,
    days: Vec<Weekday>,
    hours: RangeInclusive<u32>,
}

impl Default for TimeWindow {
    /// Monday to Friday, 07:00 through 08:59, UTC+07:00.
    fn default() -> Self {
        Self {
            offset: FixedOffset::east_opt(7 * 3600).unwrap_or_else(|| Utc.fix()),
            days: vec![Weekday::Mon, Weekday::Tue, Weekday::Wed, Weekday::Thu, Weekday::Fri],
            hours: 7..=8,
        }
    }
}

impl TimeWindow {
    pub fn new(offset: FixedOffset, days: Vec<Weekday>, hours: RangeInclusive<u32>) -> Self {
        Self { offset, days, hours }
    }

    pub fn offset(&self) -> FixedOffset {
        self.offset
    }

    /// `at` in the window's timezone.
    pub fn local(&self, at: DateTime<Utc>) -> DateTime<FixedOffset> {
        at.with_timezone(&self.offset)
    }

    pub fn contains(&self, at: DateTime<Utc>) -> bool {
        let local = self.local(at);
        self.days.contains(&local.weekday()) && self.hours.contains(&local.hour())
    }

    pub fn check(&self, at: DateTime<Utc>) -> Result<(), GateError> {
        if self.contains(at) {
            Ok(())
        } else {
            Err(GateError::OutsideWindow {
                now: self.local(at).format("%Y-%m-%d %H:%M:%S %:z").to_string(),
            })
        }
    }

    /// Local midnight of the day containing `at`, as a UTC instant.
    pub fn start_of_day(&self, at: DateTime<Utc>) -> DateTime<Utc> {
        let midnight = self.local(at).date_naive().and_time(NaiveTime::MIN);
        // Fixed offsets have no gaps, so the mapping is always single.
        self.offset
            .from_local_datetime(&midnight)
            .single()
            .map(|dt| dt.with_timezone(&Utc))
            .unwrap_or(at)
    }
}

/// Exact, case-sensitive comparison of the predicted label with the claimed username.
pub fn match_identity(predicted: &str, expected: &str) -> Result<(), GateError> {
    if predicted == expected {
        Ok(())
    } else {
        Err(GateError::IdentityMismatch {
            predicted: predicted.to_string(),
            expected: expected.to_string(),
        })
    }
}

/// Parse `mon,tue,wed` (chrono weekday names, any case).
pub fn parse_days(s: &str) -> Option<Vec<Weekday>> {
    let days: Vec<Weekday> = s
        .split(',')
        .map(str::trim)
        .filter(|d| !d.is_empty())
        .map(|d| d.parse().ok())
        .collect::<Option<_>>()?;
    (!days.is_empty()).then_some(days)
}

/// Parse an inclusive hour range `7-8` (or a single hour `7`).
pub fn parse_hours(s: &str) -> Option<RangeInclusive<u32>> {
    let (start, end) = match s.split_once('-') {
        Some((a, b)) => (a.trim().parse().ok()?, b.trim().parse().ok()?),
        None => {
            let h = s.trim().parse().ok()?;
            (h, h)
        }
    };
    (start <= end && end < 24).then_some(start..=end)
}

#[cfg(test)]
mod tests {
    use super::*;

    /// 2024-06-03 is a Monday.
    fn jakarta(day: u32, hour: u32, minute: u32) -> DateTime<Utc> {
        FixedOffset::east_opt(7 * 3600)
            .unwrap()
            .with_ymd_and_hms(2024, 6, day, hour, minute, 0)
            .unwrap()
            .with_timezone(&Utc)
    }

    #[test]
    fn test_window_boundaries() {
        let w = TimeWindow::default();
        assert!(w.check(jakarta(3, 7, 0)).is_ok());
        assert!(w.check(jakarta(3, 8, 59)).is_ok());
        assert!(w.check(jakarta(3, 9, 0)).is_err());
        assert!(w.check(jakarta(3, 6, 59)).is_err());
        assert!(w.check(jakarta(7, 8, 0)).is_ok()); // Friday
    }

    #[test]
    fn test_weekend_rejected_all_day() {
        let w = TimeWindow::default();
        for hour in 0..24 {
            assert!(w.check(jakarta(8, hour, 30)).is_err(), "saturday {hour}:30");
            assert!(w.check(jakarta(9, hour, 30)).is_err(), "sunday {hour}:30");
        }
    }

    #[test]
    fn test_window_uses_fixed_offset_not_utc() {
        // 01:30 UTC Monday is 08:30 in Jakarta.
        let at = Utc.with_ymd_and_hms(2024, 6, 3, 1, 30, 0).unwrap();
        assert!(TimeWindow::default().contains(at));
        assert!(!TimeWindow::new(FixedOffset::east_opt(0).unwrap(), vec![Weekday::Mon], 7..=8).contains(at));
    }

    #[test]
    fn test_rejection_message_carries_server_time() {
        let err = TimeWindow::default().check(jakarta(3, 9, 0)).unwrap_err();
        assert_eq!(
            err,
            GateError::OutsideWindow {
                now: "2024-06-03 09:00:00 +07:00".into()
            }
        );
        assert!(err.to_string().contains("2024-06-03 09:00:00"));
    }

    #[test]
    fn test_start_of_day() {
        let w = TimeWindow::default();
        let start = w.start_of_day(jakarta(3, 8, 15));
        assert_eq!(start, Utc.with_ymd_and_hms(2024, 6, 2, 17, 0, 0).unwrap());
        // Just after local midnight still belongs to the new day.
        assert_eq!(w.start_of_day(jakarta(4, 0, 1)), jakarta(4, 0, 0));
    }

    #[test]
    fn test_identity_match() {
        assert!(match_identity("alice", "alice").is_ok());
        assert!(matches!(
            match_identity("alice", "bob"),
            Err(GateError::IdentityMismatch { .. })
        ));
        assert!(match_identity("Alice", "alice").is_err());
    }

    #[test]
    fn test_parse_days_and_hours() {
        assert_eq!(
            parse_days("mon, tue,Wed"),
            Some(vec![Weekday::Mon, Weekday::Tue, Weekday::Wed])
        );
        assert_eq!(parse_days("mon,funday"), None);
        assert_eq!(parse_days(""), None);
        assert_eq!(parse_hours("7-8"), Some(7..=8));
        assert_eq!(parse_hours("13"), Some(13..=13));
        assert_eq!(parse_hours("9-7"), None);
        assert_eq!(parse_hours("7-24"), None);
    }

    #[test]
    fn test_fixed_clock() {
        let at = jakarta(3, 7, 30);
        assert_eq!(FixedClock(at).now(), at);
    }
}
