//! Timezone resolution and the injected clock capability.
//!
//! All schedule math runs against a [`TimeZoneClock`] for the standup's own
//! zone, fed by a [`Clock`] that supplies the current instant. Production
//! code uses [`SystemClock`]; tests substitute a [`FixedClock`].

use std::sync::atomic::{AtomicI64, Ordering};

use chrono::{
    DateTime, LocalResult, NaiveDate, NaiveDateTime, NaiveTime, Offset, TimeDelta, TimeZone, Utc,
};
use chrono_tz::Tz;

use crate::error::{Result, StandupError};

mod names;

/// Source of the current instant.
pub trait Clock: Send + Sync {
    /// Current UTC instant.
    fn now(&self) -> DateTime<Utc>;
}

/// Wall clock of the host.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Settable clock for deterministic tests and replays.
#[derive(Debug)]
pub struct FixedClock {
    millis: AtomicI64,
}

impl FixedClock {
    /// Clock frozen at `at`.
    pub fn new(at: DateTime<Utc>) -> Self {
        Self {
            millis: AtomicI64::new(at.timestamp_millis()),
        }
    }

    /// Clock frozen at a wall-clock time in `zone`.
    ///
    /// `None` when `hour` or `minute` is out of range.
    pub fn at_local(
        zone: &TimeZoneClock,
        date: NaiveDate,
        hour: u32,
        minute: u32,
    ) -> Option<Self> {
        let time = NaiveTime::from_hms_opt(hour, minute, 0)?;
        Some(Self::new(zone.local(date, time).with_timezone(&Utc)))
    }

    /// Move the clock to `at`.
    pub fn set(&self, at: DateTime<Utc>) {
        self.millis.store(at.timestamp_millis(), Ordering::SeqCst);
    }

    /// Move the clock forward by `delta`.
    pub fn advance(&self, delta: TimeDelta) {
        self.millis
            .fetch_add(delta.num_milliseconds(), Ordering::SeqCst);
    }
}

impl Clock for FixedClock {
    fn now(&self) -> DateTime<Utc> {
        DateTime::from_timestamp_millis(self.millis.load(Ordering::SeqCst)).unwrap_or_default()
    }
}

/// A resolved timezone that answers "now" and "today" for one standup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeZoneClock {
    tz: Tz,
    identifier: &'static str,
}

impl TimeZoneClock {
    /// Resolve a zone name (IANA identifier, legacy link, or friendly name).
    ///
    /// Matching is exact and case-sensitive.
    ///
    /// # Errors
    ///
    /// Returns [`StandupError::InvalidTimeZone`] for unrecognised names.
    pub fn resolve(name: &str) -> Result<Self> {
        let alias = names::FRIENDLY_NAMES
            .iter()
            .chain(names::LEGACY_LINKS)
            .find(|(alias, _)| *alias == name);
        let canonical = alias.map_or(name, |(_, target)| *target);

        let tz = canonical
            .parse::<Tz>()
            .map_err(|_| StandupError::InvalidTimeZone(name.to_owned()))?;
        let identifier = alias.map_or_else(|| tz.name(), |(_, target)| *target);
        Ok(Self { tz, identifier })
    }

    /// Canonical IANA identifier, e.g. `America/Chicago`.
    pub fn identifier(&self) -> &'static str {
        self.identifier
    }

    /// Underlying `chrono-tz` zone.
    pub fn tz(&self) -> Tz {
        self.tz
    }

    /// Current wall-clock time in this zone.
    pub fn now(&self, clock: &dyn Clock) -> DateTime<Tz> {
        clock.now().with_timezone(&self.tz)
    }

    /// Today's date in this zone.
    pub fn today(&self, clock: &dyn Clock) -> NaiveDate {
        self.now(clock).date_naive()
    }

    /// Tomorrow's date in this zone.
    pub fn tomorrow(&self, clock: &dyn Clock) -> NaiveDate {
        self.today(clock).succ_opt().unwrap_or(NaiveDate::MAX)
    }

    /// First instant of `date` in this zone.
    pub fn start_of_day(&self, date: NaiveDate) -> DateTime<Tz> {
        self.local(date, NaiveTime::MIN)
    }

    /// The instant at wall-clock `time` on `date` in this zone.
    ///
    /// Times skipped by a DST gap land the same distance past the gap;
    /// repeated times pick the earlier instant.
    pub fn local(&self, date: NaiveDate, time: NaiveTime) -> DateTime<Tz> {
        let naive = NaiveDateTime::new(date, time);
        match self.tz.from_local_datetime(&naive) {
            LocalResult::Single(at) => at,
            LocalResult::Ambiguous(earliest, _) => earliest,
            LocalResult::None => {
                let before_gap = self
                    .tz
                    .offset_from_utc_datetime(&(naive - TimeDelta::days(1)))
                    .fix();
                let utc = naive - TimeDelta::seconds(i64::from(before_gap.local_minus_utc()));
                self.tz.from_utc_datetime(&utc)
            }
        }
    }
}
