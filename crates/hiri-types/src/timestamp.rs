//! Wall-clock timestamps and calendar days.
//!
//! Sensor rows carry the device's local wall clock (`2025-03-14T08:15:00`).
//! [`Timestamp`] keeps that wall clock as written and never converts between
//! zones: a trailing `Z` or `±HH:MM` offset is accepted and dropped. The
//! [`Day`] of a timestamp is therefore the device-local calendar date, which is
//! the bucketing rule used by the day cache.

use core::fmt;
use core::str::FromStr;

#[cfg(feature = "serde")]
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use time::format_description::BorrowedFormatItem;
use time::macros::format_description;
use time::{Date, OffsetDateTime, PrimitiveDateTime, Time};

use crate::error::{ParseError, ParseResult};

/// A device wall-clock date-time without offset.
///
/// Ordering is chronological. The string form is
/// `YYYY-MM-DDTHH:MM:SS[.fraction]`.
///
/// # Examples
///
/// ```
/// use hiri_types::Timestamp;
///
/// let ts: Timestamp = "2025-03-14 08:15:00".parse().unwrap();
/// assert_eq!(ts.to_string(), "2025-03-14T08:15:00");
/// assert_eq!(ts.day().to_string(), "2025-03-14");
///
/// // Offsets are dropped, the wall clock is kept.
/// let ts: Timestamp = "2025-03-14T23:59:59-03:00".parse().unwrap();
/// assert_eq!(ts.day().to_string(), "2025-03-14");
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Timestamp(PrimitiveDateTime);

impl Timestamp {
    /// Wrap a primitive date-time.
    #[must_use]
    pub const fn new(datetime: PrimitiveDateTime) -> Self {
        Self(datetime)
    }

    /// The current UTC wall clock.
    #[must_use]
    pub fn now_utc() -> Self {
        let now = OffsetDateTime::now_utc();
        Self(PrimitiveDateTime::new(now.date(), now.time()))
    }

    /// Interpret Unix epoch seconds as a UTC wall clock.
    pub fn from_unix_utc(secs: i64) -> ParseResult<Self> {
        let dt = OffsetDateTime::from_unix_timestamp(secs)
            .map_err(|_| ParseError::InvalidTimestamp(secs.to_string()))?;
        Ok(Self(PrimitiveDateTime::new(dt.date(), dt.time())))
    }

    /// Midnight at the start of `day`.
    #[must_use]
    pub fn start_of_day(day: Day) -> Self {
        Self(PrimitiveDateTime::new(day.0, Time::MIDNIGHT))
    }

    /// Parse a query parameter: either an ISO-8601 date-time or integer
    /// epoch seconds.
    pub fn parse_query(value: &str) -> ParseResult<Self> {
        let trimmed = value.trim();
        if !trimmed.is_empty() && trimmed.bytes().all(|b| b.is_ascii_digit()) {
            let secs = trimmed
                .parse::<i64>()
                .map_err(|_| ParseError::InvalidTimestamp(value.to_string()))?;
            return Self::from_unix_utc(secs);
        }
        trimmed.parse()
    }

    /// The calendar day this timestamp falls on.
    #[must_use]
    pub fn day(&self) -> Day {
        Day(self.0.date())
    }

    /// The underlying date-time.
    #[must_use]
    pub const fn as_datetime(&self) -> PrimitiveDateTime {
        self.0
    }
}

/// `YYYY-MM-DD`.
const DATE: &[BorrowedFormatItem<'_>] = format_description!("[year]-[month]-[day]");

/// Canonical form without a fraction.
const DATETIME: &[BorrowedFormatItem<'_>] =
    format_description!("[year]-[month]-[day]T[hour]:[minute]:[second]");

/// Canonical form with the fraction, trailing zeros trimmed.
const DATETIME_FRACTION: &[BorrowedFormatItem<'_>] =
    format_description!("[year]-[month]-[day]T[hour]:[minute]:[second].[subsecond digits:1+]");

/// Accepted input: `T` or space separator, optional seconds and fraction,
/// optional `Z` or numeric offset (parsed, then ignored).
const DATETIME_INPUT: &[BorrowedFormatItem<'_>] = format_description!(
    "[year]-[month]-[day][first [T][ ]][hour]:[minute][optional [:[second][optional [.[subsecond digits:1+]]]]][optional [[first [Z][z][[offset_hour sign:mandatory][optional [:]][offset_minute]]]]]"
);

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let format = if self.0.nanosecond() == 0 {
            DATETIME
        } else {
            DATETIME_FRACTION
        };
        let text = self.0.format(format).map_err(|_| fmt::Error)?;
        f.write_str(&text)
    }
}

impl FromStr for Timestamp {
    type Err = ParseError;

    fn from_str(input: &str) -> ParseResult<Self> {
        let s = input.trim();
        if let Ok(date) = Date::parse(s, DATE) {
            return Ok(Self(PrimitiveDateTime::new(date, Time::MIDNIGHT)));
        }
        PrimitiveDateTime::parse(s, DATETIME_INPUT)
            .map(Self)
            .map_err(|_| ParseError::InvalidTimestamp(input.to_string()))
    }
}

#[cfg(feature = "serde")]
impl Serialize for Timestamp {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

#[cfg(feature = "serde")]
impl<'de> Deserialize<'de> for Timestamp {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// A calendar day (`YYYY-MM-DD`), the unit of cache partitioning.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Day(Date);

impl Day {
    /// Wrap a calendar date.
    #[must_use]
    pub const fn new(date: Date) -> Self {
        Self(date)
    }

    /// Today's date in UTC.
    #[must_use]
    pub fn today_utc() -> Self {
        Self(OffsetDateTime::now_utc().date())
    }

    /// The underlying date.
    #[must_use]
    pub const fn as_date(&self) -> Date {
        self.0
    }

    /// The following day, if representable.
    #[must_use]
    pub fn next(&self) -> Option<Self> {
        self.0.next_day().map(Self)
    }
}

impl fmt::Display for Day {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = self.0.format(DATE).map_err(|_| fmt::Error)?;
        f.write_str(&text)
    }
}

impl FromStr for Day {
    type Err = ParseError;

    fn from_str(s: &str) -> ParseResult<Self> {
        Date::parse(s.trim(), DATE)
            .map(Self)
            .map_err(|_| ParseError::InvalidDay(s.to_string()))
    }
}

#[cfg(feature = "serde")]
impl Serialize for Day {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

#[cfg(feature = "serde")]
impl<'de> Deserialize<'de> for Day {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_t_and_space_separators() {
        let a: Timestamp = "2025-09-01T12:34:56".parse().unwrap();
        let b: Timestamp = "2025-09-01 12:34:56".parse().unwrap();
        assert_eq!(a, b);
        assert_eq!(a.to_string(), "2025-09-01T12:34:56");
    }

    #[test]
    fn test_parse_fraction_roundtrips_trimmed() {
        let ts: Timestamp = "2025-09-01T12:34:56.250".parse().unwrap();
        assert_eq!(ts.as_datetime().nanosecond(), 250_000_000);
        assert_eq!(ts.to_string(), "2025-09-01T12:34:56.25");
    }

    #[test]
    fn test_parse_drops_offsets() {
        let utc: Timestamp = "2025-09-01T23:30:00Z".parse().unwrap();
        let minus: Timestamp = "2025-09-01T23:30:00-04:00".parse().unwrap();
        let plus: Timestamp = "2025-09-01T23:30:00+0200".parse().unwrap();
        assert_eq!(utc, minus);
        assert_eq!(utc, plus);
        assert_eq!(utc.day().to_string(), "2025-09-01");
    }

    #[test]
    fn test_parse_date_only_and_minutes_only() {
        let midnight: Timestamp = "2025-09-01".parse().unwrap();
        assert_eq!(midnight.to_string(), "2025-09-01T00:00:00");

        let no_seconds: Timestamp = "2025-09-01T07:05".parse().unwrap();
        assert_eq!(no_seconds.to_string(), "2025-09-01T07:05:00");
    }

    #[test]
    fn test_parse_rejects_garbage() {
        for bad in [
            "",
            "yesterday",
            "2025-13-01T00:00:00",
            "2025-02-30T00:00:00",
            "2025-09-01X12:00:00",
            "2025-09-01T25:00:00",
            "2025-09-01T12:00:00:00",
            "2025-09-01T12:00:00.abc",
        ] {
            assert!(bad.parse::<Timestamp>().is_err(), "accepted {bad:?}");
        }
    }

    #[test]
    fn test_parse_fraction_and_offset_together() {
        let ts: Timestamp = "2025-09-01 23:30:00.123456789+05:30".parse().unwrap();
        assert_eq!(ts.to_string(), "2025-09-01T23:30:00.123456789");

        let ts: Timestamp = "2025-09-01T23:30:00.5z".parse().unwrap();
        assert_eq!(ts.to_string(), "2025-09-01T23:30:00.5");

        let ts: Timestamp = "  2025-09-01T00:00:01  ".parse().unwrap();
        assert_eq!(ts.to_string(), "2025-09-01T00:00:01");
    }

    #[test]
    fn test_display_pads_every_field() {
        let ts: Timestamp = "0999-01-02T03:04:05".parse().unwrap();
        assert_eq!(ts.to_string(), "0999-01-02T03:04:05");
        assert_eq!(ts.day().to_string(), "0999-01-02");
    }

    #[test]
    fn test_parse_query_accepts_epoch_seconds() {
        let ts = Timestamp::parse_query("0").unwrap();
        assert_eq!(ts.to_string(), "1970-01-01T00:00:00");

        let ts = Timestamp::parse_query("1700000000").unwrap();
        assert_eq!(ts.to_string(), "2023-11-14T22:13:20");

        let iso = Timestamp::parse_query("2025-01-02T03:04:05").unwrap();
        assert_eq!(iso.to_string(), "2025-01-02T03:04:05");
    }

    #[test]
    fn test_ordering_is_chronological() {
        let earlier: Timestamp = "2025-09-01T09:59:59".parse().unwrap();
        let later: Timestamp = "2025-09-01T10:00:00".parse().unwrap();
        assert!(earlier < later);
    }

    #[test]
    fn test_day_parse_and_display() {
        let day: Day = "2025-02-28".parse().unwrap();
        assert_eq!(day.to_string(), "2025-02-28");
        assert_eq!(day.next().unwrap().to_string(), "2025-03-01");
        assert!("2025-2-28".parse::<Day>().is_err());
        assert!("2025-02-28T00:00".parse::<Day>().is_err());
    }

    #[test]
    fn test_start_of_day() {
        let day: Day = "2025-02-28".parse().unwrap();
        assert_eq!(Timestamp::start_of_day(day).to_string(), "2025-02-28T00:00:00");
    }

    #[cfg(feature = "serde")]
    #[test]
    fn test_serde_as_strings() {
        let ts: Timestamp = "2025-09-01T12:34:56".parse().unwrap();
        let json = serde_json::to_string(&ts).unwrap();
        assert_eq!(json, "\"2025-09-01T12:34:56\"");
        let back: Timestamp = serde_json::from_str(&json).unwrap();
        assert_eq!(back, ts);

        let bad: Result<Timestamp, _> = serde_json::from_str("\"nope\"");
        assert!(bad.is_err());
    }
}
