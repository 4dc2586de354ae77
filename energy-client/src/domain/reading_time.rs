//! Parsing and rendering of meter reading timestamps.
//!
//! Meters report either RFC 3339 timestamps or naive `YYYY-MM-DD HH:MM:SS`
//! wall-clock times. Naive times are kept as-is on the reading clock and
//! carry a zero UTC offset.

use time::{
    format_description::{well_known::Rfc3339, FormatItem},
    macros::format_description,
    OffsetDateTime, PrimitiveDateTime, UtcOffset,
};

const NAIVE_SPACE: &[FormatItem<'static>] =
    format_description!("[year]-[month]-[day] [hour]:[minute]:[second]");
const NAIVE_T: &[FormatItem<'static>] =
    format_description!("[year]-[month]-[day]T[hour]:[minute]:[second]");

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
#[error("unrecognised reading time '{0}'")]
pub struct ReadingTimeError(pub String);

pub fn parse_reading_time(raw: &str) -> Result<OffsetDateTime, ReadingTimeError> {
    let s = raw.trim();
    if let Ok(ts) = OffsetDateTime::parse(s, &Rfc3339) {
        return Ok(ts);
    }
    PrimitiveDateTime::parse(s, NAIVE_SPACE)
        .or_else(|_| PrimitiveDateTime::parse(s, NAIVE_T))
        .map(PrimitiveDateTime::assume_utc)
        .map_err(|_| ReadingTimeError(raw.to_string()))
}

/// Render `ts` as `YYYY-MM-DD HH:MM:SS` in the given display offset.
pub fn format_reading_time(ts: OffsetDateTime, offset: UtcOffset) -> String {
    ts.to_offset(offset)
        .format(NAIVE_SPACE)
        .unwrap_or_else(|_| ts.to_string())
}

#[cfg(feature = "serde")]
pub mod serde_format {
    use serde::{Deserialize, Deserializer, Serializer};
    use time::{format_description::well_known::Rfc3339, OffsetDateTime};

    pub fn serialize<S: Serializer>(ts: &OffsetDateTime, s: S) -> Result<S::Ok, S::Error> {
        let out = ts.format(&Rfc3339).map_err(serde::ser::Error::custom)?;
        s.serialize_str(&out)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<OffsetDateTime, D::Error> {
        let raw = String::deserialize(d)?;
        super::parse_reading_time(&raw).map_err(serde::de::Error::custom)
    }
}
