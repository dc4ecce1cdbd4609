//! Byte size parsing and representation.
//!
//! Used for disk quotas and the graph cleanup threshold:
//! - "128Mi", "1Gi", "2Ti" (binary)
//! - "100k", "512m", "1G" (decimal)
//! - "1024" (bytes)

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{StrataError, StrataResult};

/// A quantity of bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ByteSize(u64);

const KI: u64 = 1024;
const MI: u64 = 1024 * 1024;
const GI: u64 = 1024 * 1024 * 1024;

impl ByteSize {
    /// Create a size from bytes.
    #[must_use]
    pub const fn bytes(bytes: u64) -> Self {
        Self(bytes)
    }

    /// Create a size from mebibytes (MiB).
    #[must_use]
    pub const fn mebibytes(mib: u64) -> Self {
        Self(mib * MI)
    }

    /// Create a size from gibibytes (GiB).
    #[must_use]
    pub const fn gibibytes(gib: u64) -> Self {
        Self(gib * GI)
    }

    /// Get the raw byte count.
    #[must_use]
    pub const fn as_bytes(&self) -> u64 {
        self.0
    }

    /// Byte count as a signed quota, saturating at `i64::MAX`.
    #[must_use]
    pub fn as_quota(&self) -> i64 {
        i64::try_from(self.0).unwrap_or(i64::MAX)
    }

    /// Parse a size string.
    ///
    /// Binary suffixes (`Ki`, `Mi`, `Gi`, `Ti`) are powers of 1024, decimal
    /// suffixes (`k`, `m`/`M`, `g`/`G`, `t`/`T`) are powers of 1000. A plain
    /// number is bytes.
    ///
    /// # Errors
    ///
    /// Returns [`StrataError::Config`] if the string is not a size.
    pub fn parse(s: &str) -> StrataResult<Self> {
        let s = s.trim();

        let suffixes = [
            ("Ki", KI),
            ("Mi", MI),
            ("Gi", GI),
            ("Ti", GI * KI),
            ("k", 1000u64),
            ("m", 1000 * 1000),
            ("M", 1000 * 1000),
            ("g", 1000 * 1000 * 1000),
            ("G", 1000 * 1000 * 1000),
            ("t", 1000 * 1000 * 1000 * 1000),
            ("T", 1000 * 1000 * 1000 * 1000),
        ];

        let invalid = || StrataError::Config {
            message: format!("invalid byte size: {s}"),
        };

        for (suffix, multiplier) in suffixes {
            if let Some(stripped) = s.strip_suffix(suffix) {
                let value: u64 = stripped.trim().parse().map_err(|_| invalid())?;
                return value.checked_mul(multiplier).map(Self).ok_or_else(invalid);
            }
        }

        s.parse().map(Self).map_err(|_| invalid())
    }
}

impl fmt::Display for ByteSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0 >= GI && self.0 % GI == 0 {
            write!(f, "{}Gi", self.0 / GI)
        } else if self.0 >= MI && self.0 % MI == 0 {
            write!(f, "{}Mi", self.0 / MI)
        } else if self.0 >= KI && self.0 % KI == 0 {
            write!(f, "{}Ki", self.0 / KI)
        } else {
            write!(f, "{}", self.0)
        }
    }
}

impl FromStr for ByteSize {
    type Err = StrataError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}
