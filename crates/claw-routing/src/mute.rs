//! Named mute time intervals.
//!
//! A route may reference intervals by name in `mute_time_intervals`. The
//! definitions live outside the routing tree, in a [`TimeIntervalRegistry`].
//! Each interval is a list of [`TimeRangeSpec`]s; the interval covers an
//! instant when any of its ranges does, and a range covers an instant when
//! every field it sets (times, weekdays, days of month, months, years)
//! matches. All evaluation is in UTC.
//!
//! Unknown names are rejected when a tree is compiled
//! ([`MuteResolver::validate`]), never while routing.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Datelike, NaiveDate, Timelike, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::{Result, RoutingError};

const WEEKDAYS: [&str; 7] = [
    "monday",
    "tuesday",
    "wednesday",
    "thursday",
    "friday",
    "saturday",
    "sunday",
];

const MONTHS: [&str; 12] = [
    "january",
    "february",
    "march",
    "april",
    "may",
    "june",
    "july",
    "august",
    "september",
    "october",
    "november",
    "december",
];

const MINUTES_PER_DAY: u32 = 24 * 60;

/// A time-of-day window, `start_time` inclusive, `end_time` exclusive.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeOfDaySpec {
    /// `HH:MM`.
    pub start_time: String,
    /// `HH:MM`, up to `24:00`.
    pub end_time: String,
}

/// One recurring window. Unset fields match everything.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeRangeSpec {
    /// Time-of-day windows.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub times: Vec<TimeOfDaySpec>,
    /// `monday`, `saturday:sunday`, ...
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub weekdays: Vec<String>,
    /// `1`, `1:5`, `-1` (last day), `-3:-1`, ...
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub days_of_month: Vec<String>,
    /// `january:march`, `12`, ...
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub months: Vec<String>,
    /// `2024`, `2024:2026`, ...
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub years: Vec<String>,
}

/// A named interval definition as found in configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeIntervalSpec {
    /// Name routes refer to.
    pub name: String,
    /// Windows; the interval covers their union.
    #[serde(default)]
    pub time_intervals: Vec<TimeRangeSpec>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
struct TimeRange {
    times: Vec<(u32, u32)>,
    weekdays: Vec<(u32, u32)>,
    days_of_month: Vec<(i32, i32)>,
    months: Vec<(u32, u32)>,
    years: Vec<(i32, i32)>,
}

impl TimeRange {
    fn compile(spec: &TimeRangeSpec) -> Result<Self> {
        Ok(Self {
            times: spec
                .times
                .iter()
                .map(parse_time_of_day)
                .collect::<Result<_>>()?,
            weekdays: spec
                .weekdays
                .iter()
                .map(|s| parse_range(s, "weekday", |v| parse_named(v, &WEEKDAYS, 0)))
                .collect::<Result<_>>()?,
            days_of_month: spec
                .days_of_month
                .iter()
                .map(|s| parse_days_of_month(s))
                .collect::<Result<_>>()?,
            months: spec
                .months
                .iter()
                .map(|s| parse_range(s, "month", |v| parse_named(v, &MONTHS, 1)))
                .collect::<Result<_>>()?,
            years: spec
                .years
                .iter()
                .map(|s| parse_range(s, "year", |v| v.parse::<i32>().ok()))
                .collect::<Result<_>>()?,
        })
    }

    fn contains(&self, now: DateTime<Utc>) -> bool {
        let minute = now.hour() * 60 + now.minute();
        let weekday = now.weekday().num_days_from_monday();
        let month_len = days_in_month(now.year(), now.month());
        let day = i64::from(now.day());

        let in_times = self.times.is_empty()
            || self.times.iter().any(|&(s, e)| minute >= s && minute < e);
        let in_weekdays = self.weekdays.is_empty()
            || self.weekdays.iter().any(|&(s, e)| weekday >= s && weekday <= e);
        let in_days = self.days_of_month.is_empty()
            || self.days_of_month.iter().any(|&(s, e)| {
                let start = resolve_day(s, month_len);
                let end = resolve_day(e, month_len);
                day >= start && day <= end
            });
        let in_months = self.months.is_empty()
            || self.months.iter().any(|&(s, e)| now.month() >= s && now.month() <= e);
        let in_years = self.years.is_empty()
            || self.years.iter().any(|&(s, e)| now.year() >= s && now.year() <= e);

        in_times && in_weekdays && in_days && in_months && in_years
    }
}

/// A validated interval definition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimeInterval {
    name: String,
    ranges: Vec<TimeRange>,
}

impl TimeInterval {
    /// Validates a definition.
    ///
    /// # Errors
    ///
    /// Returns `RoutingError::Config` if the name is empty or any field is malformed.
    pub fn compile(spec: &TimeIntervalSpec) -> Result<Self> {
        if spec.name.is_empty() {
            return Err(RoutingError::config("time interval name cannot be empty"));
        }
        let ranges = spec
            .time_intervals
            .iter()
            .map(TimeRange::compile)
            .collect::<Result<Vec<_>>>()
            .map_err(|e| match e {
                RoutingError::Config { reason } => {
                    RoutingError::config(format!("time interval '{}': {reason}", spec.name))
                }
                other => other,
            })?;
        Ok(Self {
            name: spec.name.clone(),
            ranges,
        })
    }

    /// Interval name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns true if `now` falls inside any of the interval's windows.
    #[must_use]
    pub fn contains(&self, now: DateTime<Utc>) -> bool {
        self.ranges.iter().any(|r| r.contains(now))
    }
}

/// Looks up interval definitions by name.
pub trait TimeIntervalRegistry: Send + Sync + fmt::Debug {
    /// Returns the definition for `name`.
    fn get(&self, name: &str) -> Option<&TimeInterval>;
}

/// A fixed set of definitions, typically built from configuration.
#[derive(Debug, Clone, Default)]
pub struct StaticIntervalRegistry {
    intervals: HashMap<String, TimeInterval>,
}

impl StaticIntervalRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Validates and indexes a list of definitions.
    ///
    /// # Errors
    ///
    /// Returns `RoutingError::Config` on malformed or duplicate definitions.
    pub fn from_specs(specs: &[TimeIntervalSpec]) -> Result<Self> {
        let mut registry = Self::new();
        for spec in specs {
            registry.insert(TimeInterval::compile(spec)?)?;
        }
        Ok(registry)
    }

    /// Adds a definition.
    ///
    /// # Errors
    ///
    /// Returns `RoutingError::Config` if the name is already defined.
    pub fn insert(&mut self, interval: TimeInterval) -> Result<()> {
        if self.intervals.contains_key(interval.name()) {
            return Err(RoutingError::config(format!(
                "time interval '{}' is defined more than once",
                interval.name()
            )));
        }
        self.intervals.insert(interval.name.clone(), interval);
        Ok(())
    }

    /// Number of definitions.
    #[must_use]
    pub fn len(&self) -> usize {
        self.intervals.len()
    }

    /// Returns true if there are no definitions.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.intervals.is_empty()
    }
}

impl TimeIntervalRegistry for StaticIntervalRegistry {
    fn get(&self, name: &str) -> Option<&TimeInterval> {
        self.intervals.get(name)
    }
}

/// Answers "is this route muted now?" against a registry.
#[derive(Debug, Clone)]
pub struct MuteResolver {
    registry: Arc<dyn TimeIntervalRegistry>,
}

impl MuteResolver {
    /// Wraps a registry.
    #[must_use]
    pub fn new(registry: Arc<dyn TimeIntervalRegistry>) -> Self {
        Self { registry }
    }

    /// A resolver with no definitions; any reference fails validation.
    #[must_use]
    pub fn empty() -> Self {
        Self::new(Arc::new(StaticIntervalRegistry::new()))
    }

    /// Checks that every referenced name is defined.
    ///
    /// # Errors
    ///
    /// Returns `RoutingError::Config` naming the first unknown interval.
    pub fn validate(&self, names: &[String]) -> Result<()> {
        match names.iter().find(|n| self.registry.get(n).is_none()) {
            Some(unknown) => Err(RoutingError::config(format!(
                "unknown mute time interval '{unknown}'"
            ))),
            None => Ok(()),
        }
    }

    /// Returns true if `now` falls inside any of the named intervals.
    #[must_use]
    pub fn is_muted(&self, names: &[String], now: DateTime<Utc>) -> bool {
        names.iter().any(|name| match self.registry.get(name) {
            Some(interval) => interval.contains(now),
            None => {
                warn!(interval = %name, "mute time interval disappeared after validation");
                false
            }
        })
    }
}

impl Default for MuteResolver {
    fn default() -> Self {
        Self::empty()
    }
}

fn parse_range<T, F>(input: &str, what: &str, parse: F) -> Result<(T, T)>
where
    T: PartialOrd + Copy,
    F: Fn(&str) -> Option<T>,
{
    let invalid = || RoutingError::config(format!("invalid {what} range {input:?}"));
    let (start, end) = match input.split_once(':') {
        Some((s, e)) => (parse(s.trim()), parse(e.trim())),
        None => {
            let v = parse(input.trim());
            (v, v)
        }
    };
    let (start, end) = start.zip(end).ok_or_else(invalid)?;
    if start > end {
        return Err(invalid());
    }
    Ok((start, end))
}

fn parse_named(input: &str, names: &[&str], base: u32) -> Option<u32> {
    let lower = input.to_ascii_lowercase();
    if let Some(idx) = names.iter().position(|n| *n == lower) {
        return u32::try_from(idx).ok().map(|i| i + base);
    }
    // Numeric form only makes sense for months (1-12).
    if base == 1 {
        return lower
            .parse::<u32>()
            .ok()
            .filter(|m| (1..=12).contains(m));
    }
    None
}

fn parse_days_of_month(input: &str) -> Result<(i32, i32)> {
    let invalid = || RoutingError::config(format!("invalid day of month range {input:?}"));
    let parse = |v: &str| {
        v.trim()
            .parse::<i32>()
            .ok()
            .filter(|d| (1..=31).contains(d) || (-31..=-1).contains(d))
    };
    let (start, end) = match input.split_once(':') {
        Some((s, e)) => (parse(s), parse(e)),
        None => (parse(input), parse(input)),
    };
    let (start, end) = start.zip(end).ok_or_else(invalid)?;
    // Same-sign ranges can be checked statically; mixed ranges depend on the month.
    if start.signum() == end.signum() && start > end {
        return Err(invalid());
    }
    Ok((start, end))
}

fn parse_time_of_day(spec: &TimeOfDaySpec) -> Result<(u32, u32)> {
    let start = parse_clock(&spec.start_time)?;
    let end = parse_clock(&spec.end_time)?;
    if start >= end {
        return Err(RoutingError::config(format!(
            "time range {}-{} must end after it starts",
            spec.start_time, spec.end_time
        )));
    }
    Ok((start, end))
}

fn parse_clock(input: &str) -> Result<u32> {
    let invalid = || RoutingError::config(format!("invalid time of day {input:?}, expected HH:MM"));
    let (h, m) = input.split_once(':').ok_or_else(invalid)?;
    let h: u32 = h.parse().map_err(|_| invalid())?;
    let m: u32 = m.parse().map_err(|_| invalid())?;
    if m >= 60 {
        return Err(invalid());
    }
    h.checked_mul(60)
        .and_then(|v| v.checked_add(m))
        .filter(|total| *total <= MINUTES_PER_DAY)
        .ok_or_else(invalid)
}

fn days_in_month(year: i32, month: u32) -> u32 {
    let (next_year, next_month) = if month == 12 {
        (year + 1, 1)
    } else {
        (year, month + 1)
    };
    NaiveDate::from_ymd_opt(next_year, next_month, 1)
        .and_then(|d| d.pred_opt())
        .map_or(31, |d| d.day())
}

fn resolve_day(day: i32, month_len: u32) -> i64 {
    if day < 0 {
        i64::from(month_len) + 1 + i64::from(day)
    } else {
        i64::from(day)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(y: i32, mo: u32, d: u32, h: u32, mi: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, mo, d, h, mi, 0).unwrap()
    }

    fn interval(name: &str, range: TimeRangeSpec) -> TimeInterval {
        TimeInterval::compile(&TimeIntervalSpec {
            name: name.to_string(),
            time_intervals: vec![range],
        })
        .unwrap()
    }

    fn weekends() -> TimeInterval {
        interval(
            "weekends",
            TimeRangeSpec {
                weekdays: vec!["saturday:sunday".to_string()],
                ..TimeRangeSpec::default()
            },
        )
    }

    mod range_tests {
        use super::*;

        #[test]
        fn weekday_range() {
            let w = weekends();
            // 2024-01-06 is a Saturday.
            assert!(w.contains(at(2024, 1, 6, 12, 0)));
            assert!(w.contains(at(2024, 1, 7, 23, 59)));
            assert!(!w.contains(at(2024, 1, 8, 0, 0)));
        }

        #[test]
        fn times_are_end_exclusive() {
            let office = interval(
                "office",
                TimeRangeSpec {
                    times: vec![TimeOfDaySpec {
                        start_time: "09:00".to_string(),
                        end_time: "17:00".to_string(),
                    }],
                    ..TimeRangeSpec::default()
                },
            );
            assert!(!office.contains(at(2024, 3, 4, 8, 59)));
            assert!(office.contains(at(2024, 3, 4, 9, 0)));
            assert!(office.contains(at(2024, 3, 4, 16, 59)));
            assert!(!office.contains(at(2024, 3, 4, 17, 0)));
        }

        #[test]
        fn negative_days_count_from_month_end() {
            let last_day = interval(
                "last-day",
                TimeRangeSpec {
                    days_of_month: vec!["-1".to_string()],
                    ..TimeRangeSpec::default()
                },
            );
            assert!(last_day.contains(at(2024, 2, 29, 10, 0)));
            assert!(!last_day.contains(at(2024, 2, 28, 10, 0)));
            assert!(last_day.contains(at(2023, 2, 28, 10, 0)));
            assert!(last_day.contains(at(2024, 12, 31, 10, 0)));
        }

        #[test]
        fn months_by_name_and_number() {
            let q1 = interval(
                "q1",
                TimeRangeSpec {
                    months: vec!["january:march".to_string()],
                    ..TimeRangeSpec::default()
                },
            );
            let december = interval(
                "dec",
                TimeRangeSpec {
                    months: vec!["12".to_string()],
                    ..TimeRangeSpec::default()
                },
            );
            assert!(q1.contains(at(2024, 2, 10, 0, 0)));
            assert!(!q1.contains(at(2024, 4, 1, 0, 0)));
            assert!(december.contains(at(2024, 12, 25, 0, 0)));
        }

        #[test]
        fn all_fields_must_match() {
            let weekend_mornings_2024 = interval(
                "combo",
                TimeRangeSpec {
                    times: vec![TimeOfDaySpec {
                        start_time: "06:00".to_string(),
                        end_time: "12:00".to_string(),
                    }],
                    weekdays: vec!["saturday".to_string(), "sunday".to_string()],
                    years: vec!["2024".to_string()],
                    ..TimeRangeSpec::default()
                },
            );
            assert!(weekend_mornings_2024.contains(at(2024, 1, 6, 7, 0)));
            assert!(!weekend_mornings_2024.contains(at(2024, 1, 6, 13, 0)));
            assert!(!weekend_mornings_2024.contains(at(2024, 1, 5, 7, 0)));
            assert!(!weekend_mornings_2024.contains(at(2025, 1, 4, 7, 0)));
        }

        #[test]
        fn interval_is_union_of_ranges() {
            let spec = TimeIntervalSpec {
                name: "either".to_string(),
                time_intervals: vec![
                    TimeRangeSpec {
                        weekdays: vec!["monday".to_string()],
                        ..TimeRangeSpec::default()
                    },
                    TimeRangeSpec {
                        weekdays: vec!["friday".to_string()],
                        ..TimeRangeSpec::default()
                    },
                ],
            };
            let either = TimeInterval::compile(&spec).unwrap();
            assert!(either.contains(at(2024, 1, 8, 0, 0)));
            assert!(either.contains(at(2024, 1, 12, 0, 0)));
            assert!(!either.contains(at(2024, 1, 10, 0, 0)));
        }

        #[test]
        fn empty_range_matches_always() {
            let always = interval("always", TimeRangeSpec::default());
            assert!(always.contains(at(1999, 7, 4, 3, 33)));
        }
    }

    mod parse_tests {
        use super::*;

        fn compile_err(range: TimeRangeSpec) -> String {
            let spec = TimeIntervalSpec {
                name: "bad".to_string(),
                time_intervals: vec![range],
            };
            match TimeInterval::compile(&spec) {
                Err(RoutingError::Config { reason }) => reason,
                other => panic!("expected Config error, got {other:?}"),
            }
        }

        #[test]
        fn rejects_unknown_weekday() {
            let reason = compile_err(TimeRangeSpec {
                weekdays: vec!["funday".to_string()],
                ..TimeRangeSpec::default()
            });
            assert!(reason.contains("weekday"));
            assert!(reason.contains("'bad'"));
        }

        #[test]
        fn rejects_reversed_weekday_range() {
            compile_err(TimeRangeSpec {
                weekdays: vec!["friday:monday".to_string()],
                ..TimeRangeSpec::default()
            });
        }

        #[test]
        fn rejects_bad_times() {
            for (start, end) in [("25:00", "26:00"), ("10:00", "09:00"), ("9", "10:00"), ("09:60", "10:00")] {
                compile_err(TimeRangeSpec {
                    times: vec![TimeOfDaySpec {
                        start_time: start.to_string(),
                        end_time: end.to_string(),
                    }],
                    ..TimeRangeSpec::default()
                });
            }
        }

        #[test]
        fn accepts_end_of_day() {
            let spec = TimeIntervalSpec {
                name: "late".to_string(),
                time_intervals: vec![TimeRangeSpec {
                    times: vec![TimeOfDaySpec {
                        start_time: "22:00".to_string(),
                        end_time: "24:00".to_string(),
                    }],
                    ..TimeRangeSpec::default()
                }],
            };
            let late = TimeInterval::compile(&spec).unwrap();
            assert!(late.contains(at(2024, 1, 1, 23, 59)));
        }

        #[test]
        fn rejects_day_zero_and_out_of_range() {
            for day in ["0", "32", "-32", "5:2"] {
                compile_err(TimeRangeSpec {
                    days_of_month: vec![day.to_string()],
                    ..TimeRangeSpec::default()
                });
            }
        }

        #[test]
        fn rejects_empty_name() {
            let result = TimeInterval::compile(&TimeIntervalSpec::default());
            assert!(matches!(result, Err(RoutingError::Config { .. })));
        }
    }

    mod resolver_tests {
        use super::*;

        fn resolver() -> MuteResolver {
            let mut registry = StaticIntervalRegistry::new();
            registry.insert(weekends()).unwrap();
            MuteResolver::new(Arc::new(registry))
        }

        #[test]
        fn validate_rejects_unknown_name() {
            let r = resolver();
            assert!(r.validate(&["weekends".to_string()]).is_ok());
            match r.validate(&["weekends".to_string(), "holidays".to_string()]) {
                Err(RoutingError::Config { reason }) => assert!(reason.contains("holidays")),
                other => panic!("expected Config error, got {other:?}"),
            }
        }

        #[test]
        fn muted_if_any_interval_covers_now() {
            let r = resolver();
            let names = vec!["weekends".to_string()];
            assert!(r.is_muted(&names, at(2024, 1, 6, 12, 0)));
            assert!(!r.is_muted(&names, at(2024, 1, 9, 12, 0)));
            assert!(!r.is_muted(&[], at(2024, 1, 6, 12, 0)));
        }

        #[test]
        fn duplicate_definitions_rejected() {
            let spec = TimeIntervalSpec {
                name: "dup".to_string(),
                time_intervals: vec![],
            };
            let result = StaticIntervalRegistry::from_specs(&[spec.clone(), spec]);
            assert!(matches!(result, Err(RoutingError::Config { .. })));
        }
    }

    #[test]
    fn spec_deserializes_from_toml_shape() {
        let json = serde_json::json!({
            "name": "weekends",
            "time_intervals": [{"weekdays": ["saturday:sunday"]}]
        });
        let spec: TimeIntervalSpec = serde_json::from_value(json).unwrap();
        assert_eq!(spec.time_intervals[0].weekdays, vec!["saturday:sunday".to_string()]);
    }
}
