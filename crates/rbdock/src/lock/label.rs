//! Cooperative lock labels.
//!
//! Each lock entry's id carries its owner and expiry as
//! `<hostname>,<RFC 3339 timestamp with nanoseconds>`, e.g.
//! `node-a,2024-01-08T20:11:54.123456789Z`. A fixed lock uses the last
//! representable instant of year 9999.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, NaiveDate, SecondsFormat, Utc};
use rbdock_common::{RbdError, RbdResult};

/// Decoded lock entry id.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LockLabel {
    /// Host that owns the entry.
    pub holder: String,
    /// Instant after which the entry is stale.
    pub expires_at: DateTime<Utc>,
}

/// Expiry of fixed locks.
#[must_use]
pub fn never() -> DateTime<Utc> {
    NaiveDate::from_ymd_opt(9999, 12, 31)
        .and_then(|d| d.and_hms_nano_opt(23, 59, 59, 999_999_999))
        .map_or(DateTime::<Utc>::MAX_UTC, |naive| naive.and_utc())
}

impl LockLabel {
    /// Label for `holder` expiring at `expires_at`.
    #[must_use]
    pub fn new(holder: impl Into<String>, expires_at: DateTime<Utc>) -> Self {
        Self {
            holder: holder.into(),
            expires_at,
        }
    }

    /// Label that never expires.
    #[must_use]
    pub fn fixed(holder: impl Into<String>) -> Self {
        Self::new(holder, never())
    }

    /// True once `now` has reached the expiry.
    #[must_use]
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }

    /// True if this never expires.
    #[must_use]
    pub fn is_fixed(&self) -> bool {
        self.expires_at >= never()
    }

    /// Encode as a lock id.
    #[must_use]
    pub fn encode(&self) -> String {
        format!(
            "{},{}",
            self.holder,
            self.expires_at.to_rfc3339_opts(SecondsFormat::Nanos, true)
        )
    }
}

impl fmt::Display for LockLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.encode())
    }
}

impl FromStr for LockLabel {
    type Err = RbdError;

    fn from_str(id: &str) -> RbdResult<Self> {
        let malformed = |message: &str| RbdError::Parse {
            what: format!("lock label {id:?}"),
            message: message.to_string(),
        };

        let (holder, expires) = id
            .split_once(',')
            .ok_or_else(|| malformed("expected <hostname>,<timestamp>"))?;
        if holder.is_empty() {
            return Err(malformed("empty hostname"));
        }
        let expires_at = DateTime::parse_from_rfc3339(expires)
            .map_err(|e| malformed(&e.to_string()))?
            .with_timezone(&Utc);

        Ok(Self::new(holder, expires_at))
    }
}
