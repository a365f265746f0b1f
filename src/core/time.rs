//! Millisecond-precision UTC timestamps.
//!
//! `Timestamp` is the conflict-resolution primitive: last-writer-wins
//! compares these. Journal rendering is canonical (fixed zone, fixed
//! precision) so that identical logical state exports byte-identically.

use std::fmt;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;
use time::format_description::well_known::Rfc3339;
use time::macros::format_description;
use time::OffsetDateTime;

/// Milliseconds since the Unix epoch, UTC.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Timestamp(i64);

/// Canonical journal rendering: always three fractional digits, always `Z`.
const CANONICAL: &[time::format_description::BorrowedFormatItem<'static>] = format_description!(
    "[year]-[month]-[day]T[hour]:[minute]:[second].[subsecond digits:3]Z"
);

#[derive(Debug, Error)]
#[error("invalid timestamp {input:?}: {reason}")]
pub struct TimestampParseError {
    pub input: String,
    pub reason: String,
}

impl Timestamp {
    pub fn from_millis(ms: i64) -> Self {
        Timestamp(ms)
    }

    pub fn as_millis(self) -> i64 {
        self.0
    }

    pub fn now() -> Self {
        let now = OffsetDateTime::now_utc();
        Timestamp((now.unix_timestamp_nanos() / 1_000_000) as i64)
    }

    /// Render in the canonical journal form, e.g. `2026-08-02T10:00:00.000Z`.
    pub fn render(self) -> String {
        let dt = OffsetDateTime::from_unix_timestamp_nanos(self.0 as i128 * 1_000_000)
            .expect("millisecond timestamp in representable range");
        dt.format(&CANONICAL)
            .expect("canonical format cannot fail for UTC datetimes")
    }

    /// Parse any RFC3339 string; sub-millisecond precision is truncated.
    pub fn parse(input: &str) -> Result<Self, TimestampParseError> {
        let dt = OffsetDateTime::parse(input, &Rfc3339).map_err(|e| TimestampParseError {
            input: input.to_string(),
            reason: e.to_string(),
        })?;
        Ok(Timestamp((dt.unix_timestamp_nanos() / 1_000_000) as i64))
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.render())
    }
}

impl Serialize for Timestamp {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.render())
    }
}

impl<'de> Deserialize<'de> for Timestamp {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Timestamp::parse(&s).map_err(serde::de::Error::custom)
    }
}
