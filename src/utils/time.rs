//! Serde helpers for message timestamps.
//!
//! Timestamps are written as RFC 3339.  When reading, a timestamp without an offset (as many
//! backends emit, e.g. `2024-05-01T12:30:00.123456`) is taken to be UTC.

use serde::{Deserialize, Deserializer, Serializer};
use time::format_description::well_known::Rfc3339;
use time::macros::format_description;
use time::{OffsetDateTime, PrimitiveDateTime};

/// Parse an RFC 3339 timestamp, or a naive one in UTC.
pub fn parse(s: &str) -> Result<OffsetDateTime, time::error::Parse> {
    let naive = format_description!(
        "[year]-[month]-[day]T[hour]:[minute]:[second][optional [.[subsecond]]]"
    );
    match OffsetDateTime::parse(s, &Rfc3339) {
        Ok(datetime) => Ok(datetime),
        Err(err) => PrimitiveDateTime::parse(s, naive)
            .map(PrimitiveDateTime::assume_utc)
            .map_err(|_| err),
    }
}

/// Deserialize a timestamp string into an OffsetDateTime
pub fn deserialize<'de, D>(deserializer: D) -> Result<OffsetDateTime, D::Error>
where
    D: Deserializer<'de>,
{
    let s = String::deserialize(deserializer)?;
    parse(&s).map_err(serde::de::Error::custom)
}

/// Serialize an OffsetDateTime into an RFC 3339 formatted string
pub fn serialize<S>(datetime: &OffsetDateTime, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    let s = datetime
        .format(&Rfc3339)
        .map_err(serde::ser::Error::custom)?;
    serializer.serialize_str(&s)
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    #[test]
    fn parses_rfc3339() {
        assert_eq!(
            parse("2024-05-01T12:30:00+02:00").unwrap(),
            datetime!(2024-05-01 10:30:00 UTC)
        );
    }

    #[test]
    fn naive_timestamps_are_utc() {
        assert_eq!(
            parse("2024-05-01T12:30:00").unwrap(),
            datetime!(2024-05-01 12:30:00 UTC)
        );
        assert_eq!(
            parse("2024-05-01T12:30:00.250").unwrap(),
            datetime!(2024-05-01 12:30:00.25 UTC)
        );
    }

    #[test]
    fn rejects_garbage() {
        assert!(parse("yesterday").is_err());
        assert!(parse("2024-05-01").is_err());
    }
}
