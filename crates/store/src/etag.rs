use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Opaque monotonic identifier assigned to every document and attachment
/// write. Totally ordered within a stream; documents and attachments have
/// separate streams. `Etag::ZERO` sorts before the first record.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Etag(u128);

impl Etag {
    /// The etag before the first record of a stream.
    pub const ZERO: Etag = Etag(0);

    /// Reconstructs an etag from its 16-byte big-endian form.
    pub fn from_bytes(bytes: [u8; 16]) -> Self {
        Etag(u128::from_be_bytes(bytes))
    }

    /// The 16-byte big-endian form used on the wire.
    pub fn to_bytes(self) -> [u8; 16] {
        self.0.to_be_bytes()
    }

    /// The next etag in the stream. Saturates at the maximum value so a
    /// pathological stream cannot wrap back before `ZERO`.
    pub fn next(self) -> Etag {
        Etag(self.0.saturating_add(1))
    }

    /// Whether this is the before-the-first-record etag.
    pub fn is_zero(self) -> bool {
        self.0 == 0
    }
}

impl From<u128> for Etag {
    fn from(raw: u128) -> Self {
        Etag(raw)
    }
}

impl fmt::Display for Etag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:032x}", self.0)
    }
}

/// Error returned when parsing a textual etag.
#[derive(Debug, thiserror::Error)]
#[error("invalid etag {0:?}: expected 32 hex digits")]
pub struct ParseEtagError(String);

impl FromStr for Etag {
    type Err = ParseEtagError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.len() != 32 {
            return Err(ParseEtagError(s.to_string()));
        }
        u128::from_str_radix(s, 16)
            .map(Etag)
            .map_err(|_| ParseEtagError(s.to_string()))
    }
}

impl Serialize for Etag {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Etag {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}
