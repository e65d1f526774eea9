//! Image size and duration parsing.
//!
//! Sizes follow the cluster CLI convention:
//! - "512M", "20G", "1T" are binary units (MiB, GiB, TiB)
//! - "512Mi", "20Gi" are accepted as aliases
//! - a plain number is mebibytes
//!
//! Durations are sequences of number and unit pairs: "90s", "30m",
//! "12h", "7d", "2w", "1h30m". A plain number is seconds.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{RbdError, RbdResult};

const KI: u64 = 1024;
const MI: u64 = KI * 1024;
const GI: u64 = MI * 1024;
const TI: u64 = GI * 1024;

/// Provisioned size of an image, in bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ImageSize(u64);

impl ImageSize {
    /// Create a size from bytes.
    #[must_use]
    pub const fn from_bytes(bytes: u64) -> Self {
        Self(bytes)
    }

    /// Create a size from mebibytes.
    #[must_use]
    pub const fn from_mebibytes(mib: u64) -> Self {
        Self(mib * MI)
    }

    /// Create a size from gibibytes.
    #[must_use]
    pub const fn from_gibibytes(gib: u64) -> Self {
        Self(gib * GI)
    }

    /// Size in bytes.
    #[must_use]
    pub const fn as_bytes(&self) -> u64 {
        self.0
    }

    /// Size in mebibytes, rounded up.
    #[must_use]
    pub const fn as_mebibytes(&self) -> u64 {
        self.0.div_ceil(MI)
    }

    /// Render as a `--size` argument for the cluster CLI.
    #[must_use]
    pub fn to_cli_arg(&self) -> String {
        format!("{}M", self.as_mebibytes())
    }

    /// Parse a size string.
    ///
    /// # Errors
    ///
    /// Returns [`RbdError::InvalidQuantity`] for unknown suffixes, zero,
    /// or overflowing values.
    pub fn parse(s: &str) -> RbdResult<Self> {
        let s = s.trim();
        let invalid = || RbdError::InvalidQuantity {
            value: s.to_string(),
        };

        let suffixes = [
            ("Ki", KI),
            ("Mi", MI),
            ("Gi", GI),
            ("Ti", TI),
            ("K", KI),
            ("k", KI),
            ("M", MI),
            ("m", MI),
            ("G", GI),
            ("g", GI),
            ("T", TI),
            ("t", TI),
        ];

        let (digits, multiplier) = suffixes
            .iter()
            .find_map(|(suffix, multiplier)| {
                s.strip_suffix(suffix).map(|stripped| (stripped, *multiplier))
            })
            .unwrap_or((s, MI));

        let value: u64 = digits.parse().map_err(|_| invalid())?;
        let bytes = value.checked_mul(multiplier).ok_or_else(invalid)?;
        if bytes == 0 {
            return Err(invalid());
        }

        Ok(Self(bytes))
    }
}

impl fmt::Display for ImageSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0 >= TI && self.0 % TI == 0 {
            write!(f, "{}T", self.0 / TI)
        } else if self.0 >= GI && self.0 % GI == 0 {
            write!(f, "{}G", self.0 / GI)
        } else if self.0 >= MI && self.0 % MI == 0 {
            write!(f, "{}M", self.0 / MI)
        } else {
            write!(f, "{}B", self.0)
        }
    }
}

impl FromStr for ImageSize {
    type Err = RbdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

/// Parse a human duration such as "7d" or "1h30m".
///
/// # Errors
///
/// Returns [`RbdError::InvalidQuantity`] for empty input, unknown units
/// or overflow.
pub fn parse_duration(s: &str) -> RbdResult<Duration> {
    let s = s.trim();
    let invalid = || RbdError::InvalidQuantity {
        value: s.to_string(),
    };

    if s.is_empty() {
        return Err(invalid());
    }
    if let Ok(secs) = s.parse::<u64>() {
        return Ok(Duration::from_secs(secs));
    }

    let mut total: u64 = 0;
    let mut rest = s;
    while !rest.is_empty() {
        let split = rest.find(|c: char| !c.is_ascii_digit()).ok_or_else(invalid)?;
        let (digits, tail) = rest.split_at(split);
        let value: u64 = digits.parse().map_err(|_| invalid())?;

        let unit_len = tail.find(|c: char| c.is_ascii_digit()).unwrap_or(tail.len());
        let (unit, next) = tail.split_at(unit_len);
        let multiplier = match unit {
            "s" => 1,
            "m" => 60,
            "h" => 60 * 60,
            "d" => 24 * 60 * 60,
            "w" => 7 * 24 * 60 * 60,
            _ => return Err(invalid()),
        };

        total = value
            .checked_mul(multiplier)
            .and_then(|secs| total.checked_add(secs))
            .ok_or_else(invalid)?;
        rest = next;
    }

    Ok(Duration::from_secs(total))
}
