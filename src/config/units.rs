//! Human-readable sizes ("4G", "512 MiB") and timespans ("1h 30m", "2 days").
//!
//! Both are resolved once while the settings load; everything downstream only
//! ever sees plain byte counts and seconds.

use serde::de::{self, Deserializer, Visitor};
use std::fmt;
use thiserror::Error;

const KIB: f64 = 1024.0;

const MINUTE: u64 = 60;
const HOUR: u64 = 60 * MINUTE;
const DAY: u64 = 24 * HOUR;
const WEEK: u64 = 7 * DAY;
// A "year" is 52 weeks, same as humanfriendly.
const YEAR: u64 = 52 * WEEK;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum UnitParseError {
    #[error("invalid size '{0}' (expected something like '512M', '4 GiB' or a byte count)")]
    Size(String),

    #[error("invalid timespan '{0}' (expected something like '90', '5m', '1h 30m' or '2 days')")]
    Timespan(String),
}

/// Parse a size with binary multiples. A bare number is a byte count.
pub fn parse_size(input: &str) -> Result<u64, UnitParseError> {
    let err = || UnitParseError::Size(input.to_string());
    let s = input.trim();
    if s.is_empty() {
        return Err(err());
    }

    let split = s
        .find(|c: char| !(c.is_ascii_digit() || c == '.'))
        .unwrap_or(s.len());
    let (number, suffix) = s.split_at(split);
    let number: f64 = number.parse().map_err(|_| err())?;

    let exponent = match suffix.trim().to_ascii_lowercase().as_str() {
        "" | "b" | "byte" | "bytes" => 0,
        "k" | "kb" | "kib" => 1,
        "m" | "mb" | "mib" => 2,
        "g" | "gb" | "gib" => 3,
        "t" | "tb" | "tib" => 4,
        "p" | "pb" | "pib" => 5,
        _ => return Err(err()),
    };

    let bytes = number * KIB.powi(exponent);
    if !bytes.is_finite() || bytes > u64::MAX as f64 {
        return Err(err());
    }
    Ok(bytes.round() as u64)
}

/// Parse a timespan into whole seconds. Several `<number><unit>` groups may be
/// chained ("1h 30m"); a bare number is seconds.
pub fn parse_timespan(input: &str) -> Result<u64, UnitParseError> {
    let err = || UnitParseError::Timespan(input.to_string());
    let s = input.trim();
    if s.is_empty() {
        return Err(err());
    }

    let mut total: f64 = 0.0;
    let mut rest = s;
    while !rest.is_empty() {
        let split = rest
            .find(|c: char| !(c.is_ascii_digit() || c == '.'))
            .unwrap_or(rest.len());
        if split == 0 {
            return Err(err());
        }
        let number: f64 = rest[..split].parse().map_err(|_| err())?;
        rest = rest[split..].trim_start();

        let unit_len = rest
            .find(|c: char| !c.is_ascii_alphabetic())
            .unwrap_or(rest.len());
        let unit = rest[..unit_len].to_ascii_lowercase();
        rest = rest[unit_len..].trim_start_matches([' ', ',']);

        let multiplier = match unit.as_str() {
            "" | "s" | "sec" | "secs" | "second" | "seconds" => 1,
            "m" | "min" | "mins" | "minute" | "minutes" => MINUTE,
            "h" | "hour" | "hours" => HOUR,
            "d" | "day" | "days" => DAY,
            "w" | "week" | "weeks" => WEEK,
            "y" | "year" | "years" => YEAR,
            _ => return Err(err()),
        };
        total += number * multiplier as f64;
    }

    Ok(total.round() as u64)
}

/// Seconds for `count` of the retention units used in `logs.remove-after`.
pub fn seconds_of(count: u64, unit: RetentionUnit) -> u64 {
    let per = match unit {
        RetentionUnit::Seconds => 1,
        RetentionUnit::Minutes => MINUTE,
        RetentionUnit::Hours => HOUR,
        RetentionUnit::Days => DAY,
        RetentionUnit::Weeks => WEEK,
        RetentionUnit::Years => YEAR,
    };
    count.saturating_mul(per)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetentionUnit {
    Seconds,
    Minutes,
    Hours,
    Days,
    Weeks,
    Years,
}

// The config file accepts either an integer or a string for sizes and
// timespans; these visitors fold both into u64.

enum Kind {
    Size,
    Timespan,
}

struct UnitVisitor(Kind);

impl Visitor<'_> for UnitVisitor {
    type Value = u64;

    fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0 {
            Kind::Size => f.write_str("a byte count or a size string"),
            Kind::Timespan => f.write_str("a number of seconds or a timespan string"),
        }
    }

    fn visit_u64<E: de::Error>(self, v: u64) -> Result<u64, E> {
        Ok(v)
    }

    fn visit_i64<E: de::Error>(self, v: i64) -> Result<u64, E> {
        u64::try_from(v).map_err(|_| E::invalid_value(de::Unexpected::Signed(v), &self))
    }

    fn visit_str<E: de::Error>(self, v: &str) -> Result<u64, E> {
        match self.0 {
            Kind::Size => parse_size(v),
            Kind::Timespan => parse_timespan(v),
        }
        .map_err(E::custom)
    }
}

struct OptionalUnitVisitor(Kind);

impl<'de> Visitor<'de> for OptionalUnitVisitor {
    type Value = Option<u64>;

    fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("null, a number or a string")
    }

    fn visit_none<E: de::Error>(self) -> Result<Self::Value, E> {
        Ok(None)
    }

    fn visit_unit<E: de::Error>(self) -> Result<Self::Value, E> {
        Ok(None)
    }

    fn visit_some<D: Deserializer<'de>>(self, d: D) -> Result<Self::Value, D::Error> {
        d.deserialize_any(UnitVisitor(self.0)).map(Some)
    }
}

pub mod size {
    use super::*;

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<u64>, D::Error> {
        d.deserialize_option(OptionalUnitVisitor(Kind::Size))
    }
}

pub mod timespan {
    use super::*;

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<u64, D::Error> {
        d.deserialize_any(UnitVisitor(Kind::Timespan))
    }

    pub mod option {
        use super::super::*;

        pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<u64>, D::Error> {
            d.deserialize_option(OptionalUnitVisitor(Kind::Timespan))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_bare_bytes() {
        assert_eq!(parse_size("1024").unwrap(), 1024);
        assert_eq!(parse_size("0").unwrap(), 0);
    }

    #[test]
    fn test_parse_binary_suffixes() {
        assert_eq!(parse_size("1K").unwrap(), 1024);
        assert_eq!(parse_size("1 KiB").unwrap(), 1024);
        assert_eq!(parse_size("512mb").unwrap(), 512 * 1024 * 1024);
        assert_eq!(parse_size("4G").unwrap(), 4 * 1024 * 1024 * 1024);
        assert_eq!(parse_size("1.5 GiB").unwrap(), 3 * 512 * 1024 * 1024);
    }

    #[test]
    fn test_parse_size_rejects_garbage() {
        assert!(parse_size("").is_err());
        assert!(parse_size("lots").is_err());
        assert!(parse_size("12 parsecs").is_err());
        assert!(parse_size("-1G").is_err());
    }

    #[test]
    fn test_parse_timespans() {
        assert_eq!(parse_timespan("90").unwrap(), 90);
        assert_eq!(parse_timespan("90s").unwrap(), 90);
        assert_eq!(parse_timespan("5m").unwrap(), 300);
        assert_eq!(parse_timespan("1h 30m").unwrap(), 5400);
        assert_eq!(parse_timespan("2 days").unwrap(), 2 * DAY);
        assert_eq!(parse_timespan("1w").unwrap(), WEEK);
        assert_eq!(parse_timespan("1 year").unwrap(), YEAR);
    }

    #[test]
    fn test_parse_timespan_rejects_unknown_units() {
        assert!(parse_timespan("").is_err());
        assert!(parse_timespan("5 fortnights").is_err());
        assert!(parse_timespan("h").is_err());
    }

    #[test]
    fn test_retention_units() {
        assert_eq!(seconds_of(3, RetentionUnit::Seconds), 3);
        assert_eq!(seconds_of(2, RetentionUnit::Hours), 7200);
        assert_eq!(seconds_of(1, RetentionUnit::Years), 52 * 7 * 86400);
    }
}
