//! Cluster access.
//!
//! The [`Cluster`] trait is the seam between the device state machine and
//! the storage cluster. [`RbdCli`] implements it on top of the `rbd`
//! command line tool.

mod output;
mod rbd;

use std::path::{Path, PathBuf};

use chrono::{DateTime, Local};
use rbdock_common::{DevName, ImageName, ImageSize, PoolName, RbdResult};

pub use output::{parse_lock_list, parse_mappings, parse_showmapped_table};
pub use rbd::RbdCli;

/// Feature required for exclusive mapping.
pub const EXCLUSIVE_LOCK_FEATURE: &str = "exclusive-lock";

/// Metadata of an image or snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DevInfo {
    /// Image name.
    pub name: String,
    /// Provisioned size in bytes.
    pub size: u64,
    /// Enabled features.
    pub features: Vec<String>,
    /// Creation time, when the cluster reports one.
    pub created: Option<DateTime<Local>>,
}

impl DevInfo {
    /// True if `feature` is enabled.
    #[must_use]
    pub fn has_feature(&self, feature: &str) -> bool {
        self.features.iter().any(|f| f == feature)
    }
}

/// A kernel mapping of an image or snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mapping {
    /// Pool name.
    pub pool: String,
    /// Image name.
    pub image: String,
    /// Snapshot name, `None` for the image head.
    pub snap: Option<String>,
    /// Kernel device path.
    pub device: PathBuf,
}

impl Mapping {
    /// True if this maps exactly `dev`.
    #[must_use]
    pub fn is(&self, dev: &DevName) -> bool {
        self.pool == dev.pool().as_str()
            && self.image == dev.image_name().as_str()
            && self.snap.as_deref() == dev.snap().map(AsRef::as_ref)
    }
}

/// Block device driver used for mappings.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum DeviceType {
    /// Kernel RBD client (`/dev/rbdN`).
    Krbd,
    /// Userspace `rbd-nbd` (`/dev/nbdN`).
    #[default]
    Nbd,
}

impl DeviceType {
    /// Name accepted by `rbd device --device-type`.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Krbd => "krbd",
            Self::Nbd => "nbd",
        }
    }
}

impl std::str::FromStr for DeviceType {
    type Err = rbdock_common::RbdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "krbd" => Ok(Self::Krbd),
            "nbd" => Ok(Self::Nbd),
            other => Err(rbdock_common::RbdError::Config {
                message: format!("unknown device type {other:?}, expected krbd or nbd"),
            }),
        }
    }
}

/// How to map a device.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MapOptions {
    /// Take the cluster exclusive lock on map.
    pub exclusive: bool,
    /// Map read-only.
    pub read_only: bool,
}

impl MapOptions {
    /// Exclusive read-write mapping.
    #[must_use]
    pub const fn exclusive() -> Self {
        Self {
            exclusive: true,
            read_only: false,
        }
    }

    /// Shared read-only mapping.
    #[must_use]
    pub const fn read_only() -> Self {
        Self {
            exclusive: false,
            read_only: true,
        }
    }
}

/// One entry of an image's advisory lock list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockEntry {
    /// Lock id (our label for cooperative locks).
    pub id: String,
    /// Cluster client that added the entry, e.g. `client.4123`.
    pub locker: String,
    /// Client address.
    pub address: String,
}

/// One snapshot of an image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapEntry {
    /// Cluster snapshot id, increasing with creation order.
    pub id: u64,
    /// Snapshot name.
    pub name: String,
    /// Creation time, when the cluster reports one.
    pub created: Option<DateTime<Local>>,
}

/// Operations the driver needs from the storage cluster.
///
/// Implementations map cluster failures onto the typed errors of
/// [`rbdock_common::RbdError`] so callers can branch on them.
pub trait Cluster: Send + Sync {
    /// Image names in a pool.
    fn list_images(&self, pool: &PoolName) -> RbdResult<Vec<ImageName>>;

    /// Metadata of an image or snapshot. `NotFound` if absent.
    fn info(&self, dev: &DevName) -> RbdResult<DevInfo>;

    /// Create an image with the given features. `AlreadyExists` on conflict.
    fn create_image(&self, dev: &DevName, size: ImageSize, features: &[&str]) -> RbdResult<()>;

    /// Delete an image.
    fn remove_image(&self, dev: &DevName) -> RbdResult<()>;

    /// Enable an image feature. Already enabled is success.
    fn enable_feature(&self, dev: &DevName, feature: &str) -> RbdResult<()>;

    /// Map a device and return its kernel path.
    fn map(&self, dev: &DevName, options: MapOptions) -> RbdResult<PathBuf>;

    /// Unmap a kernel device. `DeviceBusy` if it is still open.
    fn unmap(&self, device: &Path, force: bool) -> RbdResult<()>;

    /// All kernel mappings on this host.
    fn mappings(&self) -> RbdResult<Vec<Mapping>>;

    /// Add a shared advisory lock entry.
    fn lock_add(&self, dev: &DevName, id: &str, tag: &str) -> RbdResult<()>;

    /// Remove an advisory lock entry.
    fn lock_remove(&self, dev: &DevName, id: &str, locker: &str) -> RbdResult<()>;

    /// Advisory lock entries of an image.
    fn lock_list(&self, dev: &DevName) -> RbdResult<Vec<LockEntry>>;

    /// Create a snapshot (`dev` names the snapshot).
    fn snap_create(&self, dev: &DevName) -> RbdResult<()>;

    /// Remove a snapshot (`dev` names the snapshot).
    fn snap_remove(&self, dev: &DevName) -> RbdResult<()>;

    /// Snapshots of an image in creation order.
    fn snap_list(&self, dev: &DevName) -> RbdResult<Vec<SnapEntry>>;
}
