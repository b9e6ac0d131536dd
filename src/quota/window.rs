//! Time windows for quota counters.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Datelike, Duration, Months, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use crate::error::QuotaError;

const MILLIS_PER_SECOND: i64 = 1_000;
const MILLIS_PER_MINUTE: i64 = 60 * MILLIS_PER_SECOND;
const MILLIS_PER_HOUR: i64 = 60 * MILLIS_PER_MINUTE;
const MILLIS_PER_DAY: i64 = 24 * MILLIS_PER_HOUR;
const MILLIS_PER_WEEK: i64 = 7 * MILLIS_PER_DAY;

/// 1970-01-01 was a Thursday; weeks start on Sunday.
const EPOCH_DAYS_AFTER_SUNDAY: i64 = 4;

/// Time unit of a quota window.
///
/// Second through week are fixed-length windows aligned to the Unix epoch
/// (weeks start on Sunday). Month, quarter and year follow the UTC calendar.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TimeUnit {
    Second,
    Minute,
    Hour,
    Day,
    Week,
    Month,
    Quarter,
    Year,
}

impl TimeUnit {
    /// Every unit, shortest first.
    pub const ALL: [TimeUnit; 8] = [
        TimeUnit::Second,
        TimeUnit::Minute,
        TimeUnit::Hour,
        TimeUnit::Day,
        TimeUnit::Week,
        TimeUnit::Month,
        TimeUnit::Quarter,
        TimeUnit::Year,
    ];

    /// Lowercase name, as used in configuration files.
    pub fn as_str(&self) -> &'static str {
        match self {
            TimeUnit::Second => "second",
            TimeUnit::Minute => "minute",
            TimeUnit::Hour => "hour",
            TimeUnit::Day => "day",
            TimeUnit::Week => "week",
            TimeUnit::Month => "month",
            TimeUnit::Quarter => "quarter",
            TimeUnit::Year => "year",
        }
    }

    /// Length of one window in milliseconds.
    ///
    /// Computed by adding one unit to the Unix epoch, so calendar units
    /// resolve to their length at the epoch: 31 days for a month, 90 for a
    /// quarter and 365 for a year.
    pub fn duration_millis(&self) -> i64 {
        let epoch = DateTime::<Utc>::UNIX_EPOCH;
        (self.add_to(epoch) - epoch).num_milliseconds()
    }

    /// Start of the window enclosing `now`.
    pub fn window_start(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        let millis = now.timestamp_millis();
        match self {
            TimeUnit::Second => floor_millis(millis, MILLIS_PER_SECOND),
            TimeUnit::Minute => floor_millis(millis, MILLIS_PER_MINUTE),
            TimeUnit::Hour => floor_millis(millis, MILLIS_PER_HOUR),
            TimeUnit::Day => floor_millis(millis, MILLIS_PER_DAY),
            TimeUnit::Week => {
                let shifted = millis + EPOCH_DAYS_AFTER_SUNDAY * MILLIS_PER_DAY;
                floor_millis(shifted, MILLIS_PER_WEEK) - Duration::days(EPOCH_DAYS_AFTER_SUNDAY)
            }
            TimeUnit::Month => first_of_month(now.year(), now.month()),
            TimeUnit::Quarter => first_of_month(now.year(), (now.month0() / 3) * 3 + 1),
            TimeUnit::Year => first_of_month(now.year(), 1),
        }
    }

    /// End of the window starting at `window_start`, which is also the
    /// start of the next one.
    pub fn window_end(&self, window_start: DateTime<Utc>) -> DateTime<Utc> {
        self.add_to(window_start)
    }

    /// Add one unit to `instant`; calendar units keep the day of month.
    fn add_to(&self, instant: DateTime<Utc>) -> DateTime<Utc> {
        let added = match self {
            TimeUnit::Second => instant.checked_add_signed(Duration::seconds(1)),
            TimeUnit::Minute => instant.checked_add_signed(Duration::minutes(1)),
            TimeUnit::Hour => instant.checked_add_signed(Duration::hours(1)),
            TimeUnit::Day => instant.checked_add_signed(Duration::days(1)),
            TimeUnit::Week => instant.checked_add_signed(Duration::weeks(1)),
            TimeUnit::Month => instant.checked_add_months(Months::new(1)),
            TimeUnit::Quarter => instant.checked_add_months(Months::new(3)),
            TimeUnit::Year => instant.checked_add_months(Months::new(12)),
        };
        added.unwrap_or(DateTime::<Utc>::MAX_UTC)
    }
}

fn floor_millis(millis: i64, step: i64) -> DateTime<Utc> {
    let floored = millis - millis.rem_euclid(step);
    DateTime::<Utc>::from_timestamp_millis(floored).unwrap_or(DateTime::<Utc>::MIN_UTC)
}

fn first_of_month(year: i32, month: u32) -> DateTime<Utc> {
    NaiveDate::from_ymd_opt(year, month, 1)
        .and_then(|date| date.and_hms_opt(0, 0, 0))
        .map(|naive| naive.and_utc())
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

impl fmt::Display for TimeUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TimeUnit {
    type Err = QuotaError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        TimeUnit::ALL
            .into_iter()
            .find(|unit| unit.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| QuotaError::Config(format!("unknown time unit `{}`", s)))
    }
}
