//! Device state machine for images and snapshots.
//!
//! A device is always in one of three observed states: unmapped, mapped,
//! or mapped and mounted. Nothing is cached; every operation re-reads the
//! cluster mapping list and the kernel mount table before acting.
//!
//! Callers must serialize operations on one device themselves (see
//! [`crate::driver::DeviceLocks`]).

mod image;
mod pool;
mod snapshot;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use rbdock_common::{DevName, RbdError, RbdResult};
use rustix::mount::MountFlags;

pub use image::Image;
pub use pool::Pool;
pub use snapshot::Snapshot;

use crate::cluster::{Cluster, DevInfo, DeviceType, RbdCli};
use crate::namespace::{NamespaceScanner, ProcFs};
use crate::system::{LinuxSystem, System};

/// Collaborators shared by every device of a driver instance.
#[derive(Clone)]
pub struct Context {
    /// Storage cluster.
    pub cluster: Arc<dyn Cluster>,
    /// Local host.
    pub system: Arc<dyn System>,
    /// Mount namespace scanner.
    pub scanner: NamespaceScanner,
}

impl std::fmt::Debug for Context {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Context")
            .field("scanner", &self.scanner)
            .finish_non_exhaustive()
    }
}

impl Context {
    /// Bundle the collaborators.
    #[must_use]
    pub fn new(cluster: Arc<dyn Cluster>, system: Arc<dyn System>, scanner: NamespaceScanner) -> Self {
        Self {
            cluster,
            system,
            scanner,
        }
    }

    /// Collaborators of the real host: the `rbd` tool mapping through
    /// `device_type`, the util-linux tools and procfs at `proc_root`.
    ///
    /// # Errors
    ///
    /// Returns [`RbdError::ExecutableNotFound`] if a required tool is
    /// missing.
    pub fn host(device_type: DeviceType, proc_root: &Path) -> RbdResult<Self> {
        let cluster = RbdCli::locate()?.with_device_type(device_type);
        let system = LinuxSystem::locate(proc_root)?;
        Ok(Self::new(
            Arc::new(cluster),
            Arc::new(system),
            NamespaceScanner::new(Arc::new(ProcFs::new(proc_root))),
        ))
    }
}

/// Observed state of a device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DevState {
    /// No local mapping.
    Unmapped,
    /// Mapped but not mounted in our namespace.
    Mapped {
        /// Kernel device path.
        device: PathBuf,
    },
    /// Mapped and mounted in our namespace.
    Mounted {
        /// Kernel device path.
        device: PathBuf,
        /// Local mount points.
        mountpoints: Vec<PathBuf>,
    },
}

/// Operations shared by images and snapshots.
///
/// Implementors supply how to map and how to constrain mounts; the state
/// machine itself is provided.
pub trait Dev: Send + Sync {
    /// Device identity.
    fn name(&self) -> &DevName;

    /// Collaborators.
    fn context(&self) -> &Context;

    /// Ask the cluster for a new mapping.
    ///
    /// # Errors
    ///
    /// Returns the cluster error.
    fn request_mapping(&self) -> RbdResult<PathBuf>;

    /// Flags actually used for a mount requested with `requested`.
    fn mount_flags(&self, requested: MountFlags) -> MountFlags {
        requested
    }

    /// Filesystem specific mount data.
    fn mount_data(&self, _fstype: &str) -> String {
        String::new()
    }

    /// Delete the device from the cluster. Refuses while mapped.
    ///
    /// # Errors
    ///
    /// Returns [`RbdError::StillMapped`] if a local mapping exists.
    fn remove(&self) -> RbdResult<()>;

    /// Cluster metadata.
    ///
    /// # Errors
    ///
    /// Returns [`RbdError::NotFound`] if the device does not exist.
    fn info(&self) -> RbdResult<DevInfo> {
        self.context().cluster.info(self.name())
    }

    /// Current kernel device, if mapped.
    ///
    /// # Errors
    ///
    /// Returns an error if the mapping list cannot be read.
    fn device(&self) -> RbdResult<Option<PathBuf>> {
        Ok(self
            .context()
            .cluster
            .mappings()?
            .into_iter()
            .find(|m| m.is(self.name()))
            .map(|m| m.device))
    }

    /// Current kernel device.
    ///
    /// # Errors
    ///
    /// Returns [`RbdError::NotMapped`] if there is none.
    fn require_device(&self) -> RbdResult<PathBuf> {
        self.device()?.ok_or_else(|| RbdError::NotMapped {
            dev: self.name().to_string(),
        })
    }

    /// Mount points of the device in our namespace.
    ///
    /// # Errors
    ///
    /// Returns an error if the mapping list or mount table cannot be read.
    fn mountpoints(&self) -> RbdResult<Vec<PathBuf>> {
        let Some(device) = self.device()? else {
            return Ok(Vec::new());
        };
        Ok(self
            .context()
            .scanner
            .local_mounts(&device)?
            .into_iter()
            .map(|m| m.mount_point)
            .collect())
    }

    /// Observed state.
    ///
    /// # Errors
    ///
    /// Returns an error if the mapping list or mount table cannot be read.
    fn state(&self) -> RbdResult<DevState> {
        let Some(device) = self.device()? else {
            return Ok(DevState::Unmapped);
        };
        let mountpoints: Vec<PathBuf> = self
            .context()
            .scanner
            .local_mounts(&device)?
            .into_iter()
            .map(|m| m.mount_point)
            .collect();
        if mountpoints.is_empty() {
            Ok(DevState::Mapped { device })
        } else {
            Ok(DevState::Mounted {
                device,
                mountpoints,
            })
        }
    }

    /// True if mapped and mounted at `target` in our namespace.
    ///
    /// # Errors
    ///
    /// Returns an error if the mapping list or mount table cannot be read.
    fn is_mounted_at(&self, target: &Path) -> RbdResult<bool> {
        match self.device()? {
            Some(device) => self.context().scanner.is_mounted_at(&device, target),
            None => Ok(false),
        }
    }

    /// Filesystem type on the mapped device.
    ///
    /// # Errors
    ///
    /// Returns [`RbdError::NotMapped`] if unmapped.
    fn filesystem(&self) -> RbdResult<String> {
        let device = self.require_device()?;
        self.context().system.probe_filesystem(&device)
    }

    /// Map the device, returning the existing mapping if there is one.
    ///
    /// # Errors
    ///
    /// Returns the cluster error of the mapping request.
    fn map(&self) -> RbdResult<PathBuf> {
        if let Some(device) = self.device()? {
            tracing::debug!(dev = %self.name(), device = %device.display(), "Already mapped");
            return Ok(device);
        }
        let device = self.request_mapping()?;
        tracing::info!(dev = %self.name(), device = %device.display(), "Mapped");
        Ok(device)
    }

    /// Mount the mapped device at `target`. Probes the filesystem when
    /// `fstype` is `None`. Already mounted at `target` is success.
    ///
    /// # Errors
    ///
    /// Returns [`RbdError::NotMapped`] if unmapped, or the mount error.
    fn mount(&self, target: &Path, fstype: Option<&str>, flags: MountFlags) -> RbdResult<PathBuf> {
        let device = self.require_device()?;
        let ctx = self.context();

        if ctx.scanner.is_mounted_at(&device, target)? {
            tracing::debug!(dev = %self.name(), target = %target.display(), "Already mounted");
            return Ok(device);
        }

        let fstype = match fstype {
            Some(fstype) => fstype.to_string(),
            None => ctx.system.probe_filesystem(&device)?,
        };
        let flags = self.mount_flags(flags);
        let data = self.mount_data(&fstype);
        ctx.system.mount(&device, target, &fstype, flags, &data)?;

        tracing::info!(
            dev = %self.name(),
            device = %device.display(),
            target = %target.display(),
            fstype,
            "Mounted"
        );
        Ok(device)
    }

    /// Mount, mapping first if the device turns out to be unmapped.
    ///
    /// # Errors
    ///
    /// Returns the map or mount error.
    fn map_and_mount(&self, target: &Path, fstype: Option<&str>, flags: MountFlags) -> RbdResult<PathBuf> {
        match self.mount(target, fstype, flags) {
            Err(RbdError::NotMapped { .. }) => {
                self.map()?;
                self.mount(target, fstype, flags)
            }
            other => other,
        }
    }

    /// Unmount from `target`. Not mounted there is success.
    ///
    /// # Errors
    ///
    /// Returns the kernel unmount error.
    fn unmount(&self, target: &Path) -> RbdResult<()> {
        if !self.is_mounted_at(target)? {
            tracing::debug!(dev = %self.name(), target = %target.display(), "Not mounted");
            return Ok(());
        }
        self.context().system.unmount(target)?;
        tracing::info!(dev = %self.name(), target = %target.display(), "Unmounted");
        Ok(())
    }

    /// Remove the mapping. Unmapped is success.
    ///
    /// # Errors
    ///
    /// Returns [`RbdError::DeviceBusy`] if the device is still open.
    fn unmap(&self) -> RbdResult<()> {
        let Some(device) = self.device()? else {
            return Ok(());
        };
        self.context().cluster.unmap(&device, false)?;
        tracing::info!(dev = %self.name(), device = %device.display(), "Unmapped");
        Ok(())
    }

    /// Unmount from `target` and unmap, after confirming nothing outside
    /// `target` and its propagation peers still uses the device.
    ///
    /// On a conflict neither the unmount nor the unmap happens.
    ///
    /// # Errors
    ///
    /// Returns [`RbdError::MountedElsewhere`] on a conflict, otherwise the
    /// unmount or unmap error.
    fn unmount_and_unmap(&self, target: Option<&Path>) -> RbdResult<()> {
        let Some(device) = self.device()? else {
            return Ok(());
        };
        let ctx = self.context();

        ctx.scanner.ensure_not_mounted_elsewhere(&device, target)?;

        if let Some(target) = target {
            if ctx.scanner.is_mounted_at(&device, target)? {
                ctx.system.unmount(target)?;
                tracing::info!(dev = %self.name(), target = %target.display(), "Unmounted");
            }
        }

        ctx.cluster.unmap(&device, false)?;
        tracing::info!(dev = %self.name(), device = %device.display(), "Unmapped");
        Ok(())
    }
}
