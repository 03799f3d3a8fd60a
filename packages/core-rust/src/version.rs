//! Record version tokens.
//!
//! Every record revision carries a token of the form `"<counter>-<nonce>"`.
//! The counter increases by one per local write; the nonce is regenerated on
//! every write so that two clients producing the same counter concurrently
//! still resolve to a single winner.
//!
//! # Ordering
//!
//! Tokens are totally ordered: higher counter wins, and on equal counters the
//! lexicographically greater nonce wins. The nonce comparison is the
//! deterministic tie-break that makes last-write-wins converge across clients.

use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

use rand::Rng;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Error returned when a wire token cannot be parsed into a [`Version`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum VersionError {
    /// The token is missing the `-` separator or one of its halves.
    #[error("malformed version token `{0}`")]
    Malformed(String),
    /// The counter half is not a non-negative integer.
    #[error("invalid counter in version token `{0}`")]
    InvalidCounter(String),
}

/// A record version token: monotonically increasing counter plus random nonce.
///
/// Wire form is `"<counter>-<nonce>"`; it serializes through that form so
/// tokens embedded in JSON documents stay wire-compatible. The nonce may
/// itself contain `-`; parsing splits on the first separator only.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub struct Version {
    /// Write counter, incremented on every successful local write.
    pub counter: u64,
    /// Random identifier with at least 64 bits of entropy.
    pub nonce: String,
}

impl Version {
    /// Creates a version from explicit parts.
    #[must_use]
    pub fn new(counter: u64, nonce: impl Into<String>) -> Self {
        Self {
            counter,
            nonce: nonce.into(),
        }
    }

    /// Returns the successor version: counter + 1 with a fresh nonce.
    ///
    /// The result is strictly greater than `self` under the token ordering,
    /// regardless of which nonce is drawn.
    #[must_use]
    pub fn next(&self) -> Self {
        Self {
            counter: self.counter + 1,
            nonce: fresh_nonce(),
        }
    }
}

impl Ord for Version {
    fn cmp(&self, other: &Self) -> Ordering {
        self.counter
            .cmp(&other.counter)
            .then_with(|| self.nonce.cmp(&other.nonce))
    }
}

impl PartialOrd for Version {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.counter, self.nonce)
    }
}

impl FromStr for Version {
    type Err = VersionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (counter, nonce) = s
            .split_once('-')
            .ok_or_else(|| VersionError::Malformed(s.to_owned()))?;
        if counter.is_empty() || nonce.is_empty() {
            return Err(VersionError::Malformed(s.to_owned()));
        }
        let counter = counter
            .parse::<u64>()
            .map_err(|_| VersionError::InvalidCounter(s.to_owned()))?;
        Ok(Self {
            counter,
            nonce: nonce.to_owned(),
        })
    }
}

impl From<Version> for String {
    fn from(version: Version) -> Self {
        version.to_string()
    }
}

impl TryFrom<String> for Version {
    type Error = VersionError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

/// Generates a fresh 64-bit nonce, hex encoded.
#[must_use]
pub fn fresh_nonce() -> String {
    let bits: u64 = rand::rng().random();
    format!("{bits:016x}")
}
