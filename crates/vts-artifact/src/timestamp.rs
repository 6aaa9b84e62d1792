//! Run timestamps
//!
//! A [`RunTimestamp`] is both the identity of a test run and its storage key.
//! It renders in two forms:
//!
//! - ISO-8601 with millisecond precision (`2024-01-01T00:00:00.000Z`), used in
//!   `data.json`
//! - the same text with `-`, `:` and `.` removed (`20240101T000000000Z`), used
//!   as a directory or file name
//!
//! Both forms are fixed-width, so lexicographic order equals chronological order.

use chrono::{DateTime, SubsecRound, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt::{self, Display, Formatter};
use std::str::FromStr;

const ISO_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.3fZ";

/// Length of the path form: `YYYYMMDDTHHMMSSmmmZ`
const PATH_FORM_LEN: usize = 19;

/// Instant at which a test run was produced, truncated to milliseconds
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RunTimestamp(DateTime<Utc>);

impl RunTimestamp {
    /// Wrap an instant, dropping sub-millisecond precision
    #[inline]
    #[must_use]
    pub fn new(instant: DateTime<Utc>) -> Self {
        Self(instant.trunc_subsecs(3))
    }

    /// Current instant
    #[inline]
    #[must_use]
    pub fn now() -> Self {
        Self::new(Utc::now())
    }

    /// ISO-8601 rendering, e.g. `2024-01-01T00:00:00.000Z`
    #[must_use]
    pub fn to_iso(&self) -> String {
        self.0.format(ISO_FORMAT).to_string()
    }

    /// Filesystem and URL safe rendering, e.g. `20240101T000000000Z`
    #[must_use]
    pub fn to_path_component(&self) -> String {
        self.to_iso().replace(['-', ':', '.'], "")
    }

    /// Parse a directory or file name produced by [`Self::to_path_component`]
    ///
    /// # Errors
    /// Returns error if `component` is not in the `YYYYMMDDTHHMMSSmmmZ` form
    pub fn from_path_component(component: &str) -> Result<Self, TimestampError> {
        let invalid = || TimestampError::InvalidPathComponent(component.to_string());

        let bytes = component.as_bytes();
        if bytes.len() != PATH_FORM_LEN || bytes[8] != b'T' || bytes[18] != b'Z' {
            return Err(invalid());
        }
        let digits_ok = bytes[..8]
            .iter()
            .chain(&bytes[9..18])
            .all(u8::is_ascii_digit);
        if !digits_ok {
            return Err(invalid());
        }

        let iso = format!(
            "{}-{}-{}T{}:{}:{}.{}Z",
            &component[0..4],
            &component[4..6],
            &component[6..8],
            &component[9..11],
            &component[11..13],
            &component[13..15],
            &component[15..18],
        );
        iso.parse().map_err(|_| invalid())
    }
}

impl Display for RunTimestamp {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_iso())
    }
}

impl FromStr for RunTimestamp {
    type Err = TimestampError;

    /// Accepts any RFC 3339 instant; offsets are normalised to UTC
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        DateTime::parse_from_rfc3339(s)
            .map(|dt| Self::new(dt.with_timezone(&Utc)))
            .map_err(|source| TimestampError::InvalidIso {
                value: s.to_string(),
                source,
            })
    }
}

impl From<DateTime<Utc>> for RunTimestamp {
    fn from(instant: DateTime<Utc>) -> Self {
        Self::new(instant)
    }
}

impl Serialize for RunTimestamp {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&self.to_iso())
    }
}

impl<'de> Deserialize<'de> for RunTimestamp {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

/// Errors parsing a run timestamp
#[derive(Debug, thiserror::Error)]
pub enum TimestampError {
    /// Not an RFC 3339 instant
    #[error("invalid timestamp '{value}': {source}")]
    InvalidIso {
        value: String,
        #[source]
        source: chrono::ParseError,
    },

    /// Not a run directory name
    #[error("invalid timestamp path component: '{0}'")]
    InvalidPathComponent(String),
}
