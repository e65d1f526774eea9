//! [`System`] for the real host.

use std::ffi::{CString, OsStr};
use std::fs;
use std::os::unix::fs::DirBuilderExt;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use rbdock_common::{RbdError, RbdResult};
use rustix::mount::{MountFlags, UnmountFlags, mount, unmount};

use super::System;
use crate::exec::Tool;

fn c_string(what: &str, value: &str) -> RbdResult<CString> {
    CString::new(value).map_err(|_| RbdError::Config {
        message: format!("{what} contains a NUL byte: {value:?}"),
    })
}

/// Host operations through syscalls and the util-linux tools.
#[derive(Debug, Clone)]
pub struct LinuxSystem {
    fsfreeze: Tool,
    blkid: Tool,
    proc_root: PathBuf,
}

impl LinuxSystem {
    /// Resolve `fsfreeze` and `blkid` on `PATH`.
    ///
    /// # Errors
    ///
    /// Returns [`RbdError::ExecutableNotFound`] if either is missing.
    pub fn locate(proc_root: impl Into<PathBuf>) -> RbdResult<Self> {
        Ok(Self {
            fsfreeze: Tool::locate("fsfreeze")?,
            blkid: Tool::locate("blkid")?,
            proc_root: proc_root.into(),
        })
    }
}

impl System for LinuxSystem {
    fn mount(
        &self,
        device: &Path,
        target: &Path,
        fstype: &str,
        flags: MountFlags,
        data: &str,
    ) -> RbdResult<()> {
        tracing::debug!(
            device = %device.display(),
            target = %target.display(),
            fstype,
            ?flags,
            data,
            "Mounting filesystem"
        );

        fs::DirBuilder::new()
            .recursive(true)
            .mode(0o755)
            .create(target)?;

        let fstype_c = c_string("filesystem type", fstype)?;
        let data_c = c_string("mount data", data)?;
        mount(device, target, fstype_c.as_c_str(), flags, data_c.as_c_str())
            .map_err(|e| RbdError::Io(e.into()))?;

        tracing::info!(device = %device.display(), target = %target.display(), "Mounted");
        Ok(())
    }

    fn unmount(&self, target: &Path) -> RbdResult<()> {
        tracing::debug!(target = %target.display(), "Unmounting filesystem");

        unmount(target, UnmountFlags::empty()).map_err(|e| RbdError::Io(e.into()))?;

        tracing::info!(target = %target.display(), "Unmounted");
        Ok(())
    }

    fn probe_filesystem(&self, device: &Path) -> RbdResult<String> {
        let out = self.blkid.output([
            OsStr::new("-s"),
            OsStr::new("TYPE"),
            OsStr::new("-o"),
            OsStr::new("value"),
            device.as_os_str(),
        ])?;
        let fstype = out.trim();
        if fstype.is_empty() {
            return Err(RbdError::Parse {
                what: "blkid output".to_string(),
                message: format!("no filesystem found on {}", device.display()),
            });
        }
        Ok(fstype.to_string())
    }

    fn make_filesystem(&self, device: &Path, fstype: &str) -> RbdResult<()> {
        let mkfs = Tool::locate(&format!("mkfs.{fstype}"))?;
        tracing::info!(device = %device.display(), fstype, "Creating filesystem");
        mkfs.output([device])?;
        Ok(())
    }

    fn freeze(&self, mountpoint: &Path) -> RbdResult<()> {
        self.fsfreeze.output([OsStr::new("-f"), mountpoint.as_os_str()])?;
        tracing::debug!(mountpoint = %mountpoint.display(), "Froze filesystem");
        Ok(())
    }

    fn unfreeze(&self, mountpoint: &Path) -> RbdResult<()> {
        self.fsfreeze.output([OsStr::new("-u"), mountpoint.as_os_str()])?;
        tracing::debug!(mountpoint = %mountpoint.display(), "Thawed filesystem");
        Ok(())
    }

    fn holders(&self, device: &Path) -> RbdResult<Vec<u32>> {
        let device = fs::canonicalize(device)?;
        let me = std::process::id();
        let mut pids = Vec::new();

        for entry in fs::read_dir(&self.proc_root)? {
            let entry = entry?;
            let Some(pid) = entry.file_name().to_str().and_then(|s| s.parse::<u32>().ok()) else {
                continue;
            };
            if pid == me {
                continue;
            }
            // processes may exit or deny access while we look
            let Ok(fds) = fs::read_dir(entry.path().join("fd")) else {
                continue;
            };
            let holds = fds
                .filter_map(Result::ok)
                .filter_map(|fd| fs::read_link(fd.path()).ok())
                .any(|target| target == device);
            if holds {
                pids.push(pid);
            }
        }

        Ok(pids)
    }

    #[allow(unsafe_code)]
    fn kill(&self, pid: u32) -> RbdResult<()> {
        let raw = i32::try_from(pid).map_err(|_| RbdError::Internal {
            message: format!("pid out of range: {pid}"),
        })?;

        tracing::warn!(pid, "Killing process holding device");

        // SAFETY: kill(2) has no memory safety preconditions.
        let rc = unsafe { libc::kill(raw, libc::SIGKILL) };
        if rc != 0 {
            let err = std::io::Error::last_os_error();
            if err.raw_os_error() != Some(libc::ESRCH) {
                return Err(err.into());
            }
        }
        Ok(())
    }

    fn last_modified(&self, device: &Path) -> RbdResult<SystemTime> {
        Ok(fs::metadata(device)?.modified()?)
    }
}
