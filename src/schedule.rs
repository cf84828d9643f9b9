//! Restriction schedule evaluation.
//!
//! A restricted route carries a set of weekdays and a set of same-day time
//! ranges. The route is restricted at an instant when its weekday is one of the
//! restricted days AND the time of day falls inside any of the ranges.
//!
//! All times are local wall-clock times ([`NaiveDateTime`]); the caller's
//! [`Clock`](crate::providers::Clock) decides what "local" means.

use chrono::{Datelike, Days, NaiveDateTime, NaiveTime, Timelike, Weekday};
use serde::{Deserialize, Serialize};

use crate::error::RouteError;

/// Format used for times of day on the wire and in the cache.
pub const TIME_FORMAT: &str = "%H:%M:%S";

/// First second of the day.
pub fn day_start() -> NaiveTime {
    NaiveTime::MIN
}

/// Last whole second of the day (23:59:59).
pub fn day_end() -> NaiveTime {
    NaiveTime::from_hms_opt(23, 59, 59).unwrap_or(NaiveTime::MIN)
}

/// Parse a time of day. Accepts "HH:MM:SS" and "HH:MM" (seconds default to 0).
pub fn parse_time_of_day(s: &str) -> Result<NaiveTime, RouteError> {
    let trimmed = s.trim();
    NaiveTime::parse_from_str(trimmed, TIME_FORMAT)
        .or_else(|_| NaiveTime::parse_from_str(trimmed, "%H:%M"))
        .map_err(|_| RouteError::InvalidTime(s.to_string()))
}

/// Parse a weekday name ("Monday", "mon", "MONDAY", ...).
pub fn parse_weekday(s: &str) -> Result<Weekday, RouteError> {
    s.trim()
        .parse::<Weekday>()
        .map_err(|_| RouteError::UnknownWeekday(s.to_string()))
}

/// Full English name of a weekday, as stored in the cache.
pub fn weekday_name(day: Weekday) -> &'static str {
    match day {
        Weekday::Mon => "Monday",
        Weekday::Tue => "Tuesday",
        Weekday::Wed => "Wednesday",
        Weekday::Thu => "Thursday",
        Weekday::Fri => "Friday",
        Weekday::Sat => "Saturday",
        Weekday::Sun => "Sunday",
    }
}

/// A same-day, non-wrapping interval `[start, end]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeRange {
    #[serde(with = "hms")]
    pub start: NaiveTime,
    #[serde(with = "hms")]
    pub end: NaiveTime,
}

impl TimeRange {
    /// Create a range. Returns `None` when `start > end` (wrapping ranges are not supported).
    pub fn new(start: NaiveTime, end: NaiveTime) -> Option<Self> {
        (start <= end).then_some(Self { start, end })
    }

    /// Parse both bounds from "HH:MM:SS" strings.
    ///
    /// Returns `Ok(None)` for a well-formed but wrapping range.
    pub fn parse(start: &str, end: &str) -> Result<Option<Self>, RouteError> {
        Ok(Self::new(parse_time_of_day(start)?, parse_time_of_day(end)?))
    }

    /// The whole day, `[00:00:00, 23:59:59]`.
    pub fn whole_day() -> Self {
        Self { start: day_start(), end: day_end() }
    }

    /// Inclusive containment of a time of day.
    #[inline]
    pub fn contains(&self, time: NaiveTime) -> bool {
        time >= self.start && time <= self.end
    }
}

/// Serde adapter for "HH:MM:SS" times of day.
mod hms {
    use chrono::NaiveTime;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(time: &NaiveTime, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&time.format(super::TIME_FORMAT).to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<NaiveTime, D::Error> {
        let s = String::deserialize(deserializer)?;
        super::parse_time_of_day(&s).map_err(serde::de::Error::custom)
    }
}

/// Check whether the weekday of `now` is one of `restricted_days`.
#[inline]
pub fn is_day_restricted(now: &NaiveDateTime, restricted_days: &[Weekday]) -> bool {
    restricted_days.contains(&now.weekday())
}

/// Check whether the time of day of `now` falls within any of `ranges`.
///
/// `now` is truncated to whole seconds, matching the fixed-width "HH:MM:SS"
/// comparison the schedules are authored in.
pub fn is_within_time_range(now: &NaiveDateTime, ranges: &[TimeRange]) -> bool {
    let time = now.time();
    let time = time.with_nanosecond(0).unwrap_or(time);
    ranges.iter().any(|r| r.contains(time))
}

/// Compute the allowed windows of a day given its forbidden intervals.
///
/// The input does not need to be sorted. Overlapping forbidden intervals are
/// merged by the sweep, so the result never contains a gap that intersects a
/// forbidden interval.
///
/// # Example
///
/// ```rust
/// use parking_guard::schedule::{complement_time_ranges, TimeRange};
///
/// let forbidden = TimeRange::parse("06:00:00", "08:00:00").unwrap().unwrap();
/// let allowed = complement_time_ranges(&[forbidden]);
/// assert_eq!(allowed, vec![
///     TimeRange::parse("00:00:00", "06:00:00").unwrap().unwrap(),
///     TimeRange::parse("08:00:00", "23:59:59").unwrap().unwrap(),
/// ]);
/// ```
pub fn complement_time_ranges(forbidden: &[TimeRange]) -> Vec<TimeRange> {
    let mut sorted = forbidden.to_vec();
    sorted.sort_by_key(|r| r.start);

    let end_of_day = day_end();
    let mut allowed = Vec::with_capacity(sorted.len() + 1);
    let mut last_end = day_start();

    for range in &sorted {
        if range.start > last_end {
            allowed.push(TimeRange { start: last_end, end: range.start });
        }
        last_end = last_end.max(range.end);
    }

    if last_end < end_of_day {
        allowed.push(TimeRange { start: last_end, end: end_of_day });
    }

    allowed
}

/// Weekly restriction schedule of a route.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RestrictionSchedule {
    /// Restricted weekdays, deduplicated.
    pub days: Vec<Weekday>,
    /// Restricted intervals on those days.
    pub ranges: Vec<TimeRange>,
}

impl RestrictionSchedule {
    pub fn new(days: Vec<Weekday>, ranges: Vec<TimeRange>) -> Self {
        let mut unique: Vec<Weekday> = Vec::with_capacity(days.len());
        for day in days {
            if !unique.contains(&day) {
                unique.push(day);
            }
        }
        Self { days: unique, ranges }
    }

    /// A route is restricted iff its day is restricted and the time is within a range.
    #[inline]
    pub fn is_restricted_at(&self, now: &NaiveDateTime) -> bool {
        is_day_restricted(now, &self.days) && is_within_time_range(now, &self.ranges)
    }

    /// Allowed windows on `day`: the complement of the ranges on a restricted
    /// day, the whole day otherwise.
    pub fn allowed_windows_on(&self, day: Weekday) -> Vec<TimeRange> {
        if self.days.contains(&day) {
            complement_time_ranges(&self.ranges)
        } else {
            vec![TimeRange::whole_day()]
        }
    }

    /// The next instant strictly after `now` at which a restricted interval
    /// begins, looking up to one week ahead.
    ///
    /// This is when the current allowed window ends. Returns `None` when the
    /// schedule never restricts anything.
    pub fn next_restriction_start(&self, now: &NaiveDateTime) -> Option<NaiveDateTime> {
        if self.days.is_empty() || self.ranges.is_empty() {
            return None;
        }

        let mut starts: Vec<NaiveTime> = self.ranges.iter().map(|r| r.start).collect();
        starts.sort();

        (0..=7u64)
            .filter_map(|offset| now.date().checked_add_days(Days::new(offset)))
            .filter(|date| self.days.contains(&date.weekday()))
            .flat_map(|date| starts.iter().map(move |start| date.and_time(*start)))
            .find(|candidate| candidate > now)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn range(start: &str, end: &str) -> TimeRange {
        TimeRange::parse(start, end).unwrap().unwrap()
    }

    /// 2024-01-01 is a Monday.
    fn monday_at(h: u32, m: u32, s: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 1, 1).unwrap().and_hms_opt(h, m, s).unwrap()
    }

    #[test]
    fn test_parse_time_of_day() {
        assert_eq!(parse_time_of_day("07:30:15").unwrap(), NaiveTime::from_hms_opt(7, 30, 15).unwrap());
        assert_eq!(parse_time_of_day("07:30").unwrap(), NaiveTime::from_hms_opt(7, 30, 0).unwrap());
        assert!(matches!(parse_time_of_day("7h30"), Err(RouteError::InvalidTime(_))));
        assert!(parse_time_of_day("25:00:00").is_err());
    }

    #[test]
    fn test_parse_weekday() {
        assert_eq!(parse_weekday("Monday").unwrap(), Weekday::Mon);
        assert_eq!(parse_weekday("sunday").unwrap(), Weekday::Sun);
        assert_eq!(parse_weekday(" Fri ").unwrap(), Weekday::Fri);
        assert!(matches!(parse_weekday("Mondi"), Err(RouteError::UnknownWeekday(_))));
    }

    #[test]
    fn test_wrapping_range_rejected() {
        assert!(TimeRange::parse("22:00:00", "06:00:00").unwrap().is_none());
    }

    #[test]
    fn test_is_day_restricted() {
        let now = monday_at(8, 0, 0);
        assert!(is_day_restricted(&now, &[Weekday::Mon, Weekday::Thu]));
        assert!(!is_day_restricted(&now, &[Weekday::Tue]));
        assert!(!is_day_restricted(&now, &[]));
    }

    #[test]
    fn test_is_within_time_range_inclusive() {
        let ranges = [range("07:00:00", "09:00:00")];
        assert!(is_within_time_range(&monday_at(7, 0, 0), &ranges));
        assert!(is_within_time_range(&monday_at(9, 0, 0), &ranges));
        assert!(!is_within_time_range(&monday_at(9, 0, 1), &ranges));
        assert!(!is_within_time_range(&monday_at(6, 59, 59), &ranges));
        assert!(!is_within_time_range(&monday_at(8, 0, 0), &[]));
    }

    #[test]
    fn test_is_within_time_range_ignores_subseconds() {
        let ranges = [range("07:00:00", "09:00:00")];
        let late = monday_at(9, 0, 0) + chrono::Duration::milliseconds(500);
        assert!(is_within_time_range(&late, &ranges));
    }

    #[test]
    fn test_is_within_any_range() {
        let ranges = [range("07:00:00", "09:00:00"), range("16:00:00", "18:00:00")];
        assert!(is_within_time_range(&monday_at(17, 0, 0), &ranges));
        assert!(!is_within_time_range(&monday_at(12, 0, 0), &ranges));
    }

    #[test]
    fn test_complement_empty() {
        assert_eq!(complement_time_ranges(&[]), vec![range("00:00:00", "23:59:59")]);
    }

    #[test]
    fn test_complement_single() {
        assert_eq!(
            complement_time_ranges(&[range("06:00:00", "08:00:00")]),
            vec![range("00:00:00", "06:00:00"), range("08:00:00", "23:59:59")]
        );
    }

    #[test]
    fn test_complement_unsorted_input() {
        let forbidden = [range("16:00:00", "18:00:00"), range("07:00:00", "09:00:00")];
        assert_eq!(
            complement_time_ranges(&forbidden),
            vec![
                range("00:00:00", "07:00:00"),
                range("09:00:00", "16:00:00"),
                range("18:00:00", "23:59:59"),
            ]
        );
    }

    #[test]
    fn test_complement_overlapping_merged() {
        let forbidden = [
            range("07:00:00", "10:00:00"),
            range("08:00:00", "09:00:00"),
            range("09:30:00", "11:00:00"),
        ];
        assert_eq!(
            complement_time_ranges(&forbidden),
            vec![range("00:00:00", "07:00:00"), range("11:00:00", "23:59:59")]
        );
    }

    #[test]
    fn test_complement_touching_day_edges() {
        let forbidden = [range("00:00:00", "06:00:00"), range("20:00:00", "23:59:59")];
        assert_eq!(complement_time_ranges(&forbidden), vec![range("06:00:00", "20:00:00")]);
    }

    #[test]
    fn test_schedule_is_restricted_at() {
        let schedule = RestrictionSchedule::new(vec![Weekday::Mon], vec![range("07:00:00", "09:00:00")]);
        assert!(schedule.is_restricted_at(&monday_at(8, 0, 0)));
        assert!(!schedule.is_restricted_at(&monday_at(10, 0, 0)));
        // Tuesday, same time
        assert!(!schedule.is_restricted_at(&(monday_at(8, 0, 0) + chrono::Duration::days(1))));
    }

    #[test]
    fn test_schedule_dedups_days() {
        let schedule = RestrictionSchedule::new(vec![Weekday::Mon, Weekday::Mon, Weekday::Fri], vec![]);
        assert_eq!(schedule.days, vec![Weekday::Mon, Weekday::Fri]);
    }

    #[test]
    fn test_allowed_windows_on() {
        let schedule = RestrictionSchedule::new(vec![Weekday::Mon], vec![range("07:00:00", "09:00:00")]);
        assert_eq!(schedule.allowed_windows_on(Weekday::Tue), vec![TimeRange::whole_day()]);
        assert_eq!(schedule.allowed_windows_on(Weekday::Mon).len(), 2);
    }

    #[test]
    fn test_next_restriction_start_same_day() {
        let schedule = RestrictionSchedule::new(
            vec![Weekday::Mon],
            vec![range("16:00:00", "18:00:00"), range("07:00:00", "09:00:00")],
        );
        assert_eq!(schedule.next_restriction_start(&monday_at(6, 0, 0)), Some(monday_at(7, 0, 0)));
        assert_eq!(schedule.next_restriction_start(&monday_at(10, 0, 0)), Some(monday_at(16, 0, 0)));
    }

    #[test]
    fn test_next_restriction_start_next_week() {
        let schedule = RestrictionSchedule::new(vec![Weekday::Mon], vec![range("07:00:00", "09:00:00")]);
        let expected = monday_at(7, 0, 0) + chrono::Duration::days(7);
        assert_eq!(schedule.next_restriction_start(&monday_at(8, 0, 0)), Some(expected));
    }

    #[test]
    fn test_next_restriction_start_none() {
        let schedule = RestrictionSchedule::new(vec![], vec![range("07:00:00", "09:00:00")]);
        assert_eq!(schedule.next_restriction_start(&monday_at(6, 0, 0)), None);
    }

    #[test]
    fn test_time_range_serde() {
        let r = range("07:00:00", "09:30:00");
        let json = serde_json::to_string(&r).unwrap();
        assert_eq!(json, r#"{"start":"07:00:00","end":"09:30:00"}"#);
        let back: TimeRange = serde_json::from_str(&json).unwrap();
        assert_eq!(back, r);
    }
}
