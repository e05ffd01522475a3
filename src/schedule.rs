//! Start-time parsing and next-fire computation.
//!
//! A standup fires once a day at a wall-clock time in its own zone. The
//! stored form is a human string like `9:00am`; [`StartTime`] is its parsed
//! 24-hour value.

use std::fmt;
use std::str::FromStr;
use std::sync::LazyLock;

use chrono::{DateTime, NaiveTime, TimeDelta};
use chrono_tz::Tz;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::{Result, StandupError};
use crate::timezone::{Clock, TimeZoneClock};

static TIME_FORMAT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)(\d{1,2}):(\d{2})\s*(am|pm)").unwrap_or_else(|e| {
        unreachable!("start time pattern is a valid regex: {e}")
    })
});

/// Daily fire time in 24-hour form.
///
/// Serializes as its `9:00am` string and deserializes through [`StartTime::parse`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct StartTime {
    /// Hour of day (0-23).
    pub hour: u8,
    /// Minute of hour (0-59).
    pub minute: u8,
}

impl StartTime {
    /// Parse a `H:MM am|pm` string (case-insensitive, optional space).
    ///
    /// The 12-hour clock maps `12:xxam` to hour 0 and `12:xxpm` to hour 12.
    ///
    /// # Errors
    ///
    /// Returns [`StandupError::MalformedTimeString`] when the pattern does not
    /// match, or the hour is outside 1-12 or the minute outside 0-59.
    pub fn parse(raw: &str) -> Result<Self> {
        let malformed = || StandupError::MalformedTimeString(raw.to_owned());
        let caps = TIME_FORMAT.captures(raw).ok_or_else(malformed)?;

        let hour: u8 = caps[1].parse().map_err(|_| malformed())?;
        let minute: u8 = caps[2].parse().map_err(|_| malformed())?;
        if !(1..=12).contains(&hour) || minute > 59 {
            return Err(malformed());
        }

        let pm = caps[3].eq_ignore_ascii_case("pm");
        let hour = match (hour, pm) {
            (12, false) => 0,
            (12, true) => 12,
            (h, true) => h + 12,
            (h, false) => h,
        };

        Ok(Self { hour, minute })
    }

    /// Wall-clock time of day.
    pub fn as_naive_time(self) -> NaiveTime {
        NaiveTime::from_hms_opt(u32::from(self.hour), u32::from(self.minute), 0)
            .unwrap_or(NaiveTime::MIN)
    }
}

impl FromStr for StartTime {
    type Err = StandupError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl TryFrom<String> for StartTime {
    type Error = StandupError;

    fn try_from(raw: String) -> Result<Self> {
        Self::parse(&raw)
    }
}

impl From<StartTime> for String {
    fn from(start: StartTime) -> Self {
        start.to_string()
    }
}

impl fmt::Display for StartTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let meridiem = if self.hour < 12 { "am" } else { "pm" };
        let hour = match self.hour % 12 {
            0 => 12,
            h => h,
        };
        write!(f, "{hour}:{:02}{meridiem}", self.minute)
    }
}

/// Today's fire instant for `start` in `zone`.
pub fn standup_time_today(
    start: StartTime,
    zone: &TimeZoneClock,
    clock: &dyn Clock,
) -> DateTime<Tz> {
    time_on_day_of(start, zone, &zone.now(clock))
}

/// Whether today's fire instant is strictly in the past.
///
/// A clock reading exactly at the fire instant is not finished.
pub fn is_finished_today(start: StartTime, zone: &TimeZoneClock, clock: &dyn Clock) -> bool {
    let now = zone.now(clock);
    time_on_day_of(start, zone, &now) < now
}

/// The next fire instant: today's if it has not passed, else tomorrow's.
///
/// Tomorrow keeps the same wall-clock time across DST changes.
pub fn next_occurrence(
    start: StartTime,
    zone: &TimeZoneClock,
    clock: &dyn Clock,
) -> DateTime<Tz> {
    let now = zone.now(clock);
    let today = time_on_day_of(start, zone, &now);
    if today < now {
        let tomorrow = now.date_naive() + TimeDelta::days(1);
        zone.local(tomorrow, start.as_naive_time())
    } else {
        today
    }
}

// One clock read per computation so "today" and "now" agree.
fn time_on_day_of(start: StartTime, zone: &TimeZoneClock, now: &DateTime<Tz>) -> DateTime<Tz> {
    zone.local(now.date_naive(), start.as_naive_time())
}
