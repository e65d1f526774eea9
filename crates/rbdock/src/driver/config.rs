//! Driver configuration.

use std::path::PathBuf;
use std::time::Duration;

use rbdock_common::{ImageSize, PoolName, RbdResult, RbdockPaths};

use crate::lock::DEFAULT_IDLE_GRACE;
use crate::system::MountOptions;

/// Volume driver configuration options.
#[derive(Debug, Clone)]
pub struct DriverConfig {
    /// Pool holding the volumes.
    pub pool: PoolName,
    /// Size of volumes created without a `size` option.
    pub default_size: ImageSize,
    /// Filesystem of volumes created without an `fs` option.
    pub default_filesystem: String,
    /// Mount root and procfs locations.
    pub paths: RbdockPaths,
    /// Cooperative lock TTL. Zero takes fixed locks.
    pub lock_ttl: Duration,
    /// Idle refresh cycles before a lock releases itself.
    pub idle_grace: u32,
    /// Reaper interval. Zero disables reaping.
    pub reap_interval: Duration,
    /// Tag on cooperative lock entries.
    pub lock_tag: String,
    /// Options for volume mounts.
    pub mount_options: MountOptions,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            pool: PoolName::default(),
            default_size: ImageSize::from_gibibytes(20),
            default_filesystem: "xfs".to_string(),
            paths: RbdockPaths::new(),
            lock_ttl: Duration::from_secs(60),
            idle_grace: DEFAULT_IDLE_GRACE,
            reap_interval: Duration::from_secs(30),
            lock_tag: "rbdock".to_string(),
            mount_options: MountOptions::volume_default(),
        }
    }
}

impl DriverConfig {
    /// Set the pool.
    ///
    /// # Errors
    ///
    /// Returns an error if `pool` is not a valid pool name.
    pub fn with_pool(mut self, pool: &str) -> RbdResult<Self> {
        self.pool = PoolName::new(pool)?;
        Ok(self)
    }

    /// Set the default size.
    #[must_use]
    pub const fn with_default_size(mut self, size: ImageSize) -> Self {
        self.default_size = size;
        self
    }

    /// Set the default filesystem.
    #[must_use]
    pub fn with_default_filesystem(mut self, fstype: impl Into<String>) -> Self {
        self.default_filesystem = fstype.into();
        self
    }

    /// Set the mount root.
    #[must_use]
    pub fn with_mount_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.paths.mount_root = root.into();
        self
    }

    /// Set the lock TTL.
    #[must_use]
    pub const fn with_lock_ttl(mut self, ttl: Duration) -> Self {
        self.lock_ttl = ttl;
        self
    }

    /// Set the idle grace.
    #[must_use]
    pub const fn with_idle_grace(mut self, cycles: u32) -> Self {
        self.idle_grace = cycles;
        self
    }

    /// Set the reaper interval.
    #[must_use]
    pub const fn with_reap_interval(mut self, interval: Duration) -> Self {
        self.reap_interval = interval;
        self
    }

    /// Set the lock tag.
    #[must_use]
    pub fn with_lock_tag(mut self, tag: impl Into<String>) -> Self {
        self.lock_tag = tag.into();
        self
    }

    /// Mountpoint of volume `name`.
    #[must_use]
    pub fn mountpoint(&self, name: &str) -> PathBuf {
        self.paths.mountpoint(name)
    }
}
