//! `pool/glob` image patterns and snapshot naming.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, SecondsFormat, Utc};
use rbdock_common::{ImageName, PoolName, RbdError};

use crate::cluster::SnapEntry;

/// Images of one pool whose names match a shell glob, e.g. `docker/db-*`.
#[derive(Debug, Clone)]
pub struct PoolPattern {
    pool: PoolName,
    glob: glob::Pattern,
}

impl PoolPattern {
    /// The pool to list.
    #[must_use]
    pub const fn pool(&self) -> &PoolName {
        &self.pool
    }

    /// True if `image` matches the glob.
    #[must_use]
    pub fn matches(&self, image: &ImageName) -> bool {
        self.glob.matches(image.as_str())
    }
}

impl FromStr for PoolPattern {
    type Err = RbdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = |message: String| RbdError::InvalidPattern {
            pattern: s.to_string(),
            message,
        };

        let (pool, glob) = s
            .split_once('/')
            .ok_or_else(|| invalid("expected pool/glob".to_string()))?;
        let pool = PoolName::new(pool).map_err(|e| invalid(e.to_string()))?;
        let glob = glob::Pattern::new(glob).map_err(|e| invalid(e.to_string()))?;

        Ok(Self { pool, glob })
    }
}

impl fmt::Display for PoolPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.pool, self.glob)
    }
}

/// Snapshot name `prefix`, or `prefix_<RFC3339 UTC seconds>` with a
/// timestamp.
#[must_use]
pub fn snapshot_name(prefix: &str, timestamp: bool, now: DateTime<Utc>) -> String {
    if timestamp {
        format!("{prefix}_{}", now.to_rfc3339_opts(SecondsFormat::Secs, true))
    } else {
        prefix.to_string()
    }
}

/// Creation time of a snapshot: the cluster metadata when present,
/// otherwise the timestamp in a `prefix_<RFC3339>` name.
#[must_use]
pub fn snapshot_created(entry: &SnapEntry, prefix: &str) -> Option<DateTime<Utc>> {
    if let Some(created) = entry.created.filter(|t| t.timestamp() > 0) {
        return Some(created.with_timezone(&Utc));
    }
    let stamp = entry.name.strip_prefix(prefix)?.strip_prefix('_')?;
    DateTime::parse_from_rfc3339(stamp)
        .ok()
        .map(|t| t.with_timezone(&Utc))
}
