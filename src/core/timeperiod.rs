// src/core/timeperiod.rs

//! Weekday/time-of-day windows used for check and notification periods.

use chrono::{DateTime, Datelike, Timelike, Utc, Weekday};
use serde::{Deserialize, Serialize};

use crate::core::VigilError;

const DAY_SECONDS: f64 = 86_400.0;

/// A single weekly window: a set of weekdays and a `[start, end)` minute range.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimeRange {
    /// Weekday names, lowercase three-letter (`mon` .. `sun`).
    pub days: Vec<String>,
    /// Inclusive start, `HH:MM`.
    pub start: String,
    /// Exclusive end, `HH:MM`.
    pub end: String,
}

/// A time period is a union of weekly ranges. An empty range list means
/// "always inside", which is the default for both check and notification
/// periods.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TimePeriod {
    pub ranges: Vec<TimeRange>,
}

fn parse_weekday(name: &str) -> Result<Weekday, VigilError> {
    match name {
        "mon" => Ok(Weekday::Mon),
        "tue" => Ok(Weekday::Tue),
        "wed" => Ok(Weekday::Wed),
        "thu" => Ok(Weekday::Thu),
        "fri" => Ok(Weekday::Fri),
        "sat" => Ok(Weekday::Sat),
        "sun" => Ok(Weekday::Sun),
        other => Err(VigilError::Config(format!("invalid weekday '{other}'"))),
    }
}

fn parse_minute_of_day(hhmm: &str) -> Result<u32, VigilError> {
    let (h, m) = hhmm
        .split_once(':')
        .ok_or_else(|| VigilError::Config(format!("invalid time '{hhmm}', expected HH:MM")))?;
    let hours: u32 = h
        .parse()
        .map_err(|_| VigilError::Config(format!("invalid hour in '{hhmm}'")))?;
    let minutes: u32 = m
        .parse()
        .map_err(|_| VigilError::Config(format!("invalid minute in '{hhmm}'")))?;
    if hours > 24 || minutes > 59 || (hours == 24 && minutes != 0) {
        return Err(VigilError::Config(format!("time '{hhmm}' out of range")));
    }
    Ok(hours * 60 + minutes)
}

impl TimePeriod {
    /// Validates weekday names and time syntax once at config load.
    pub fn validate(&self) -> Result<(), VigilError> {
        for range in &self.ranges {
            if range.days.is_empty() {
                return Err(VigilError::Config(
                    "time range must name at least one weekday".into(),
                ));
            }
            for day in &range.days {
                parse_weekday(day)?;
            }
            let start = parse_minute_of_day(&range.start)?;
            let end = parse_minute_of_day(&range.end)?;
            if start >= end {
                return Err(VigilError::Config(format!(
                    "time range {}..{} is empty",
                    range.start, range.end
                )));
            }
        }
        Ok(())
    }

    /// Whether the given unix timestamp falls inside the period.
    pub fn contains(&self, ts: f64) -> bool {
        if self.ranges.is_empty() {
            return true;
        }
        let Some(at) = DateTime::<Utc>::from_timestamp(ts as i64, 0) else {
            return false;
        };
        let weekday = at.weekday();
        let minute = at.hour() * 60 + at.minute();
        self.ranges.iter().any(|range| {
            range
                .days
                .iter()
                .any(|d| parse_weekday(d).map(|w| w == weekday).unwrap_or(false))
                && parse_minute_of_day(&range.start).is_ok_and(|s| minute >= s)
                && parse_minute_of_day(&range.end).is_ok_and(|e| minute < e)
        })
    }

    /// The next timestamp at or after `ts` that is inside the period.
    /// Scans forward in one-minute steps bounded to one week; an always-closed
    /// period yields `ts + one week` so callers never busy-loop.
    pub fn next_inclusion(&self, ts: f64) -> f64 {
        if self.contains(ts) {
            return ts;
        }
        let mut probe = (ts / 60.0).ceil() * 60.0;
        let limit = ts + 7.0 * DAY_SECONDS;
        while probe < limit {
            if self.contains(probe) {
                return probe;
            }
            probe += 60.0;
        }
        limit
    }
}
