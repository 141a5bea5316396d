//! Zone-less timestamp used inside payload envelopes.
//!
//! Peers exchange `YYYY-MM-DDTHH:MM:SS[.fffffffff]` with no offset suffix.
//! The fraction carries at most nine digits, trailing zeros are trimmed and
//! the dot is omitted entirely for whole seconds.

use std::fmt;

use chrono::{NaiveDate, NaiveDateTime, Timelike, Utc};
use serde::{de, Deserialize, Deserializer, Serialize, Serializer};

const SECONDS_FORMAT: &str = "%Y-%m-%dT%H:%M:%S";
const PARSE_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.f";

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Timestamp(pub NaiveDateTime);

impl Timestamp {
    pub fn now() -> Self {
        Self(Utc::now().naive_utc())
    }

    pub fn parse(s: &str) -> Result<Self, chrono::ParseError> {
        NaiveDateTime::parse_from_str(s, PARSE_FORMAT).map(Self)
    }
}

/// `0001-01-01T00:00:00`, the value peers use for an unset time.
impl Default for Timestamp {
    fn default() -> Self {
        Self(
            NaiveDate::from_ymd_opt(1, 1, 1)
                .and_then(|d| d.and_hms_opt(0, 0, 0))
                .unwrap_or_default(),
        )
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.format(SECONDS_FORMAT))?;
        // Leap-second nanos (>= 1e9) are clamped into the last representable fraction.
        let nanos = self.0.nanosecond().min(999_999_999);
        if nanos > 0 {
            let fraction = format!("{nanos:09}");
            write!(f, ".{}", fraction.trim_end_matches('0'))?;
        }
        Ok(())
    }
}

impl Serialize for Timestamp {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Timestamp {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Self::parse(&s).map_err(|e| de::Error::custom(format!("invalid timestamp {s:?}: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_microseconds_preserved_byte_identically() {
        let ts = Timestamp::parse("2024-01-02T03:04:05.123456").unwrap();
        assert_eq!(ts.to_string(), "2024-01-02T03:04:05.123456");
        let json = serde_json::to_string(&ts).unwrap();
        assert_eq!(json, "\"2024-01-02T03:04:05.123456\"");
    }

    #[test]
    fn test_whole_seconds_omit_fraction() {
        let ts = Timestamp::parse("2019-12-06T04:42:10").unwrap();
        assert_eq!(ts.to_string(), "2019-12-06T04:42:10");
        let ts = Timestamp::parse("2019-12-06T04:42:10.000").unwrap();
        assert_eq!(ts.to_string(), "2019-12-06T04:42:10");
    }

    #[test]
    fn test_trailing_zeros_trimmed() {
        let ts = Timestamp::parse("2019-12-06T04:42:10.500000000").unwrap();
        assert_eq!(ts.to_string(), "2019-12-06T04:42:10.5");
        let ts = Timestamp::parse("2019-12-06T04:42:10.000000001").unwrap();
        assert_eq!(ts.to_string(), "2019-12-06T04:42:10.000000001");
    }

    #[test]
    fn test_zone_suffix_rejected() {
        assert!(Timestamp::parse("2019-12-06T04:42:10Z").is_err());
        assert!(serde_json::from_str::<Timestamp>("\"not a time\"").is_err());
    }

    #[test]
    fn test_default_is_year_one() {
        assert_eq!(Timestamp::default().to_string(), "0001-01-01T00:00:00");
    }
}
