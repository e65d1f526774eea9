//! Read-only point-in-time snapshots.

use std::path::PathBuf;

use rbdock_common::{DevName, RbdError, RbdResult, SnapName};
use rustix::mount::MountFlags;

use super::{Context, Dev, Image};
use crate::cluster::MapOptions;

/// A snapshot of an [`Image`]. Always mapped and mounted read-only.
#[derive(Debug, Clone)]
pub struct Snapshot {
    image: Image,
    name: DevName,
}

impl Snapshot {
    pub(super) fn new(image: Image, snap: SnapName) -> Self {
        let name = image.name().snapshot(snap);
        Self { image, name }
    }

    /// The image this is a snapshot of.
    #[must_use]
    pub const fn image(&self) -> &Image {
        &self.image
    }

    /// Snapshot name without pool and image.
    #[must_use]
    pub fn snap_name(&self) -> &str {
        self.name.snap().map_or("", |s| s.as_str())
    }
}

impl Dev for Snapshot {
    fn name(&self) -> &DevName {
        &self.name
    }

    fn context(&self) -> &Context {
        self.image.context()
    }

    fn request_mapping(&self) -> RbdResult<PathBuf> {
        self.context().cluster.map(&self.name, MapOptions::read_only())
    }

    fn mount_flags(&self, requested: MountFlags) -> MountFlags {
        requested | MountFlags::RDONLY
    }

    fn mount_data(&self, fstype: &str) -> String {
        // a read-only xfs mount cannot replay the log
        if fstype == "xfs" {
            "norecovery".to_string()
        } else {
            String::new()
        }
    }

    fn remove(&self) -> RbdResult<()> {
        if let Some(device) = self.device()? {
            return Err(RbdError::StillMapped {
                dev: self.name.to_string(),
                device: device.display().to_string(),
            });
        }
        self.context().cluster.snap_remove(&self.name)?;
        tracing::info!(snapshot = %self.name, "Removed snapshot");
        Ok(())
    }
}
