//! Read-write images.

use std::path::PathBuf;

use rbdock_common::{DevName, RbdError, RbdResult, SnapName};

use super::{Context, Dev, Snapshot};
use crate::cluster::{EXCLUSIVE_LOCK_FEATURE, MapOptions, SnapEntry};

/// A read-write image, mapped exclusively.
#[derive(Debug, Clone)]
pub struct Image {
    ctx: Context,
    name: DevName,
}

impl Image {
    /// Image `name`; a snapshot component is dropped.
    #[must_use]
    pub fn new(ctx: Context, name: DevName) -> Self {
        Self {
            ctx,
            name: name.parent(),
        }
    }

    /// Handle to snapshot `snap` of this image. Does not check existence.
    #[must_use]
    pub fn snapshot(&self, snap: SnapName) -> Snapshot {
        Snapshot::new(self.clone(), snap)
    }

    /// Snapshots of this image, oldest first.
    ///
    /// # Errors
    ///
    /// Returns the cluster error.
    pub fn snapshot_entries(&self) -> RbdResult<Vec<SnapEntry>> {
        self.ctx.cluster.snap_list(&self.name)
    }

    /// Snapshot handles, oldest first. Entries with names that are not
    /// valid snapshot names are skipped.
    ///
    /// # Errors
    ///
    /// Returns the cluster error.
    pub fn snapshots(&self) -> RbdResult<Vec<Snapshot>> {
        Ok(self
            .snapshot_entries()?
            .into_iter()
            .filter_map(|entry| match SnapName::new(entry.name) {
                Ok(snap) => Some(self.snapshot(snap)),
                Err(e) => {
                    tracing::warn!(image = %self.name, error = %e, "Skipping snapshot");
                    None
                }
            })
            .collect())
    }

    /// Create snapshot `snap` without coordinating with any mount.
    ///
    /// # Errors
    ///
    /// Returns [`RbdError::AlreadyExists`] if the name is taken.
    pub fn create_snapshot(&self, snap: SnapName) -> RbdResult<Snapshot> {
        let snapshot = self.snapshot(snap);
        self.ctx.cluster.snap_create(snapshot.name())?;
        tracing::info!(snapshot = %snapshot.name(), "Created snapshot");
        Ok(snapshot)
    }

    /// Create a filesystem-consistent snapshot of a mapped image.
    ///
    /// A locally mounted filesystem is frozen for the duration of the
    /// snapshot and always thawed afterwards. An unmounted image must not
    /// be mounted in any other namespace either.
    ///
    /// # Errors
    ///
    /// Returns [`RbdError::NotMapped`] if unmapped,
    /// [`RbdError::MountedElsewhere`] if only foreign mounts exist, or the
    /// freeze, snapshot or thaw error.
    pub fn create_consistent_snapshot(&self, snap: SnapName) -> RbdResult<Snapshot> {
        let device = self.require_device()?;
        let mounts = self.ctx.scanner.local_mounts(&device)?;

        let Some(mount) = mounts.first() else {
            self.ctx.scanner.ensure_not_mounted_elsewhere(&device, None)?;
            return self.create_snapshot(snap);
        };
        let mountpoint = &mount.mount_point;

        self.ctx.system.freeze(mountpoint)?;
        let created = self.create_snapshot(snap);
        let thawed = self.ctx.system.unfreeze(mountpoint);

        match (created, thawed) {
            (Ok(snapshot), Ok(())) => Ok(snapshot),
            (Err(e), Ok(())) => Err(e),
            (Ok(_), Err(e)) => Err(e),
            (Err(e), Err(thaw)) => {
                tracing::error!(
                    image = %self.name,
                    mountpoint = %mountpoint.display(),
                    error = %thaw,
                    "Failed to thaw filesystem"
                );
                Err(e)
            }
        }
    }
}

impl Dev for Image {
    fn name(&self) -> &DevName {
        &self.name
    }

    fn context(&self) -> &Context {
        &self.ctx
    }

    fn request_mapping(&self) -> RbdResult<PathBuf> {
        match self.ctx.cluster.map(&self.name, MapOptions::exclusive()) {
            Err(RbdError::ExclusiveLockNotEnabled { .. }) => {
                tracing::info!(image = %self.name, "Enabling exclusive-lock feature");
                self.ctx.cluster.enable_feature(&self.name, EXCLUSIVE_LOCK_FEATURE)?;
                self.ctx.cluster.map(&self.name, MapOptions::exclusive())
            }
            other => other,
        }
    }

    fn remove(&self) -> RbdResult<()> {
        if let Some(device) = self.device()? {
            return Err(RbdError::StillMapped {
                dev: self.name.to_string(),
                device: device.display().to_string(),
            });
        }
        self.ctx.cluster.remove_image(&self.name)?;
        tracing::info!(image = %self.name, "Removed image");
        Ok(())
    }
}
