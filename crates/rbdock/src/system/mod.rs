//! Host operations: kernel mounts, filesystem tools and processes.
//!
//! The [`System`] trait is the seam the device state machine uses for
//! everything that touches the local host rather than the cluster.

mod linux;

use std::path::Path;
use std::time::SystemTime;

use rbdock_common::{RbdError, RbdResult};
use rustix::mount::MountFlags;

pub use linux::LinuxSystem;

/// Mount options.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MountOptions {
    /// Read-only mount.
    pub readonly: bool,
    /// Do not update access times.
    pub noatime: bool,
    /// No exec.
    pub noexec: bool,
    /// No suid.
    pub nosuid: bool,
    /// No dev.
    pub nodev: bool,
}

impl MountOptions {
    /// Options for volume mounts.
    #[must_use]
    pub const fn volume_default() -> Self {
        Self {
            readonly: false,
            noatime: true,
            noexec: false,
            nosuid: false,
            nodev: false,
        }
    }

    /// Read-only variant of these options.
    #[must_use]
    pub const fn read_only(mut self) -> Self {
        self.readonly = true;
        self
    }

    /// Kernel mount flags for these options.
    #[must_use]
    pub fn flags(&self) -> MountFlags {
        let mut flags = MountFlags::empty();
        if self.readonly {
            flags |= MountFlags::RDONLY;
        }
        if self.noatime {
            flags |= MountFlags::NOATIME;
        }
        if self.noexec {
            flags |= MountFlags::NOEXEC;
        }
        if self.nosuid {
            flags |= MountFlags::NOSUID;
        }
        if self.nodev {
            flags |= MountFlags::NODEV;
        }
        flags
    }
}

/// Operations on the local host.
pub trait System: Send + Sync {
    /// Mount `device` on `target`, creating `target` if needed.
    fn mount(
        &self,
        device: &Path,
        target: &Path,
        fstype: &str,
        flags: MountFlags,
        data: &str,
    ) -> RbdResult<()>;

    /// Unmount whatever is mounted on `target`.
    fn unmount(&self, target: &Path) -> RbdResult<()>;

    /// Filesystem type on a block device.
    fn probe_filesystem(&self, device: &Path) -> RbdResult<String>;

    /// Create a filesystem on a block device.
    fn make_filesystem(&self, device: &Path, fstype: &str) -> RbdResult<()>;

    /// Suspend writes to the filesystem mounted at `mountpoint`.
    fn freeze(&self, mountpoint: &Path) -> RbdResult<()>;

    /// Resume writes to the filesystem mounted at `mountpoint`.
    fn unfreeze(&self, mountpoint: &Path) -> RbdResult<()>;

    /// Pids of local processes holding `device` open.
    fn holders(&self, device: &Path) -> RbdResult<Vec<u32>>;

    /// Kill a process.
    fn kill(&self, pid: u32) -> RbdResult<()>;

    /// Last modification time of a device node.
    fn last_modified(&self, device: &Path) -> RbdResult<SystemTime>;
}

/// This host's name, used to label cooperative locks.
///
/// # Errors
///
/// Returns an error if the kernel reports an empty or non UTF-8 name.
pub fn hostname() -> RbdResult<String> {
    let uname = rustix::system::uname();
    let name = uname
        .nodename()
        .to_str()
        .map_err(|e| RbdError::Config {
            message: format!("hostname is not valid UTF-8: {e}"),
        })?
        .to_string();

    if name.is_empty() || name.contains(',') {
        return Err(RbdError::Config {
            message: format!("unusable hostname {name:?}"),
        });
    }
    Ok(name)
}
