//! # Filter Types
//!
//! Purpose: Typed values that travel between callers and the wire: filter
//! names, creation parameters, and the maps returned by `list` and `info`.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{BloomdError, BloomdResult};

/// Statistics of one filter as returned by `info`, keyed by stat name.
pub type FilterInfo = BTreeMap<String, String>;

/// Result of `list`: filter name to the rest of its stats line.
pub type FilterList = BTreeMap<String, String>;

/// Name of a filter on the server.
///
/// Names are written verbatim as the first argument of every filter command,
/// so they must be non-empty and contain no whitespace or control characters.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct FilterName(String);

impl FilterName {
    /// Validates and wraps a filter name.
    pub fn new(name: impl Into<String>) -> BloomdResult<Self> {
        let name = name.into();
        if is_wire_token(&name) {
            Ok(FilterName(name))
        } else {
            Err(BloomdError::InvalidFilterName(name))
        }
    }

    /// Returns the name as it appears on the wire.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for FilterName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for FilterName {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl FromStr for FilterName {
    type Err = BloomdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        FilterName::new(s)
    }
}

impl TryFrom<&str> for FilterName {
    type Error = BloomdError;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        FilterName::new(value)
    }
}

impl TryFrom<String> for FilterName {
    type Error = BloomdError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        FilterName::new(value)
    }
}

impl From<FilterName> for String {
    fn from(name: FilterName) -> Self {
        name.0
    }
}

/// Returns true when `token` can be sent as a single protocol argument.
pub(crate) fn is_wire_token(token: &str) -> bool {
    !token.is_empty() && !token.chars().any(|c| c.is_whitespace() || c.is_control())
}

/// Optional parameters for `create`.
///
/// Zero values mean "use the server default" and are left off the command.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct CreateParams {
    /// Expected number of keys.
    pub capacity: u64,
    /// Target false-positive probability.
    pub probability: f64,
    /// Keep the filter memory-only (no backing file).
    pub in_memory: bool,
}

impl CreateParams {
    /// Parameters with the given capacity and probability, persisted on disk.
    pub fn new(capacity: u64, probability: f64) -> Self {
        CreateParams {
            capacity,
            probability,
            in_memory: false,
        }
    }

    /// Marks the filter as memory-only.
    pub fn in_memory(mut self, in_memory: bool) -> Self {
        self.in_memory = in_memory;
        self
    }
}

/// Typed view of one `list` entry.
///
/// The server reports `<prob> <bytes> <capacity> <size>` after the name;
/// `FilterList` keeps that text verbatim and this type parses it on demand.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FilterStats {
    /// Configured false-positive probability.
    pub probability: f64,
    /// Bytes used by the filter.
    pub bytes: u64,
    /// Configured capacity.
    pub capacity: u64,
    /// Number of keys added.
    pub size: u64,
}

impl FilterStats {
    /// Parses the stats remainder of a `list` line.
    pub fn parse(stats: &str) -> BloomdResult<Self> {
        let mut fields = stats.split_whitespace();
        let malformed = || BloomdError::Protocol(format!("malformed filter stats {:?}", stats));

        let probability = fields
            .next()
            .and_then(|v| v.parse::<f64>().ok())
            .ok_or_else(malformed)?;
        let mut next_u64 = || {
            fields
                .next()
                .and_then(|v| v.parse::<u64>().ok())
                .ok_or_else(malformed)
        };
        let bytes = next_u64()?;
        let capacity = next_u64()?;
        let size = next_u64()?;

        if fields.next().is_some() {
            return Err(malformed());
        }
        Ok(FilterStats {
            probability,
            bytes,
            capacity,
            size,
        })
    }
}
