//! Mount namespace inspection.
//!
//! Answers two questions about a mapped device:
//! - is it mounted at a given path in our own mount namespace
//! - is it mounted anywhere an unmount here would not reach
//!
//! The second one walks every process on the host, reads the mount table
//! of each distinct mount namespace once, and compares propagation peer
//! groups with our own mount.

pub mod mountinfo;

use std::collections::HashSet;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use rbdock_common::{RbdError, RbdResult};

pub use mountinfo::{MountInfo, MountTable, PeerGroup};

/// Access to per-process namespace data.
///
/// `None` selects the calling process.
pub trait ProcSource: Send + Sync {
    /// Mount namespace link text, e.g. `mnt:[4026531840]`.
    fn namespace(&self, pid: Option<u32>) -> io::Result<String>;

    /// Raw mountinfo of a process.
    fn mountinfo(&self, pid: Option<u32>) -> io::Result<String>;

    /// All visible pids.
    fn pids(&self) -> io::Result<Vec<u32>>;
}

/// [`ProcSource`] backed by procfs.
#[derive(Debug, Clone)]
pub struct ProcFs {
    root: PathBuf,
}

impl ProcFs {
    /// Use procfs mounted at `root`.
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn dir(&self, pid: Option<u32>) -> PathBuf {
        pid.map_or_else(|| self.root.join("self"), |pid| self.root.join(pid.to_string()))
    }
}

impl ProcSource for ProcFs {
    fn namespace(&self, pid: Option<u32>) -> io::Result<String> {
        let link = fs::read_link(self.dir(pid).join("ns/mnt"))?;
        Ok(link.to_string_lossy().into_owned())
    }

    fn mountinfo(&self, pid: Option<u32>) -> io::Result<String> {
        fs::read_to_string(self.dir(pid).join("mountinfo"))
    }

    fn pids(&self) -> io::Result<Vec<u32>> {
        let mut pids = Vec::new();
        for entry in fs::read_dir(&self.root)? {
            if let Some(pid) = entry?.file_name().to_str().and_then(|s| s.parse().ok()) {
                pids.push(pid);
            }
        }
        Ok(pids)
    }
}

/// Mount queries across namespaces.
#[derive(Clone)]
pub struct NamespaceScanner {
    proc: Arc<dyn ProcSource>,
}

impl std::fmt::Debug for NamespaceScanner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NamespaceScanner").finish_non_exhaustive()
    }
}

impl NamespaceScanner {
    /// Create a scanner over `proc`.
    #[must_use]
    pub fn new(proc: Arc<dyn ProcSource>) -> Self {
        Self { proc }
    }

    /// Mount table of our own namespace.
    ///
    /// # Errors
    ///
    /// Returns an error if it cannot be read or parsed.
    pub fn local_table(&self) -> RbdResult<MountTable> {
        MountTable::parse(&self.proc.mountinfo(None)?)
    }

    /// Mounts of `device` in our own namespace.
    ///
    /// # Errors
    ///
    /// Returns an error if the local mount table cannot be read or parsed.
    pub fn local_mounts(&self, device: &Path) -> RbdResult<Vec<MountInfo>> {
        Ok(self.local_table()?.for_device(device).cloned().collect())
    }

    /// True if `device` is mounted at `target` in our own namespace.
    ///
    /// # Errors
    ///
    /// Returns an error if the local mount table cannot be read or parsed.
    pub fn is_mounted_at(&self, device: &Path, target: &Path) -> RbdResult<bool> {
        Ok(self
            .local_table()?
            .for_device(device)
            .any(|m| m.mount_point == target))
    }

    /// Fail if `device` is mounted anywhere other than `except` in our own
    /// namespace, or in any other namespace that an unmount of `except`
    /// would not propagate to.
    ///
    /// Processes that vanish or deny access mid-scan are skipped. A
    /// malformed mount table fails the scan.
    ///
    /// # Errors
    ///
    /// Returns [`RbdError::MountedElsewhere`] on the first conflicting mount.
    pub fn ensure_not_mounted_elsewhere(&self, device: &Path, except: Option<&Path>) -> RbdResult<()> {
        let local = self.local_table()?;

        let mut ours: Option<&MountInfo> = None;
        for mount in local.for_device(device) {
            if except == Some(mount.mount_point.as_path()) {
                ours.get_or_insert(mount);
                continue;
            }
            return Err(conflict(device, mount, "this namespace"));
        }

        // unmount events travel through the peer group of the parent mount
        let our_group = ours
            .and_then(|m| local.parent_of(m))
            .map(MountInfo::peer_group)
            .unwrap_or_default();

        let own_ns = self.proc.namespace(None)?;
        let mut seen = HashSet::from([own_ns]);

        for pid in self.proc.pids()? {
            let ns = match self.proc.namespace(Some(pid)) {
                Ok(ns) => ns,
                Err(e) => {
                    tracing::trace!(pid, error = %e, "Skipping process");
                    continue;
                }
            };
            if !seen.insert(ns.clone()) {
                continue;
            }

            let text = match self.proc.mountinfo(Some(pid)) {
                Ok(text) => text,
                Err(e) => {
                    tracing::trace!(pid, error = %e, "Skipping process");
                    seen.remove(&ns);
                    continue;
                }
            };
            let table = MountTable::parse(&text)?;

            for mount in table.for_device(device) {
                let group = table
                    .parent_of(mount)
                    .map(MountInfo::peer_group)
                    .unwrap_or_default();
                if group.receives_from(&our_group) {
                    tracing::debug!(
                        device = %device.display(),
                        namespace = %ns,
                        mountpoint = %mount.mount_point.display(),
                        "Mount is a propagation peer of ours"
                    );
                    continue;
                }
                return Err(conflict(device, mount, &ns));
            }
        }

        Ok(())
    }
}

fn conflict(device: &Path, mount: &MountInfo, namespace: &str) -> RbdError {
    tracing::debug!(
        device = %device.display(),
        mountpoint = %mount.mount_point.display(),
        namespace,
        "Device is mounted elsewhere"
    );
    RbdError::MountedElsewhere {
        device: device.display().to_string(),
        mountpoint: mount.mount_point.display().to_string(),
        namespace: namespace.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeHost;

    const DEVICE: &str = "/dev/nbd0";
    const TARGET: &str = "/var/lib/docker-volumes/rbd/data";

    fn scanner(host: &Arc<FakeHost>) -> NamespaceScanner {
        NamespaceScanner::new(Arc::clone(host) as Arc<dyn ProcSource>)
    }

    #[test]
    fn unmounted_device_is_free() {
        let host = FakeHost::new();
        let scanner = scanner(&host);
        scanner
            .ensure_not_mounted_elsewhere(Path::new(DEVICE), Some(Path::new(TARGET)))
            .unwrap();
        assert!(!scanner.is_mounted_at(Path::new(DEVICE), Path::new(TARGET)).unwrap());
    }

    #[test]
    fn own_mount_is_tolerated() {
        let host = FakeHost::new();
        host.mount_local(DEVICE, TARGET);
        let scanner = scanner(&host);

        assert!(scanner.is_mounted_at(Path::new(DEVICE), Path::new(TARGET)).unwrap());
        scanner
            .ensure_not_mounted_elsewhere(Path::new(DEVICE), Some(Path::new(TARGET)))
            .unwrap();
    }

    #[test]
    fn second_local_mount_conflicts() {
        let host = FakeHost::new();
        host.mount_local(DEVICE, TARGET);
        host.mount_local(DEVICE, "/mnt/manual");

        let err = scanner(&host)
            .ensure_not_mounted_elsewhere(Path::new(DEVICE), Some(Path::new(TARGET)))
            .unwrap_err();
        match err {
            RbdError::MountedElsewhere { mountpoint, namespace, .. } => {
                assert_eq!(mountpoint, "/mnt/manual");
                assert_eq!(namespace, "this namespace");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn no_exception_means_any_mount_conflicts() {
        let host = FakeHost::new();
        host.mount_local(DEVICE, TARGET);
        let err = scanner(&host)
            .ensure_not_mounted_elsewhere(Path::new(DEVICE), None)
            .unwrap_err();
        assert!(err.is_safety_refusal());
    }

    #[test]
    fn slave_namespace_is_tolerated() {
        let host = FakeHost::new();
        host.mount_local(DEVICE, TARGET);
        // container namespace whose root is a slave of the host root
        host.add_namespace(100, "master:1");
        host.mount_in(100, DEVICE, "/data");

        scanner(&host)
            .ensure_not_mounted_elsewhere(Path::new(DEVICE), Some(Path::new(TARGET)))
            .unwrap();
    }

    #[test]
    fn shared_peer_namespace_is_tolerated() {
        let host = FakeHost::new();
        host.mount_local(DEVICE, TARGET);
        host.add_namespace(100, "shared:1");
        host.mount_in(100, DEVICE, "/data");

        scanner(&host)
            .ensure_not_mounted_elsewhere(Path::new(DEVICE), Some(Path::new(TARGET)))
            .unwrap();
    }

    #[test]
    fn private_namespace_conflicts() {
        let host = FakeHost::new();
        host.mount_local(DEVICE, TARGET);
        host.add_namespace(200, "shared:42");
        host.mount_in(200, DEVICE, "/data");

        let err = scanner(&host)
            .ensure_not_mounted_elsewhere(Path::new(DEVICE), Some(Path::new(TARGET)))
            .unwrap_err();
        match err {
            RbdError::MountedElsewhere { namespace, .. } => assert_eq!(namespace, "mnt:[200]"),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn foreign_mount_without_local_mount_conflicts() {
        let host = FakeHost::new();
        host.add_namespace(100, "master:1");
        host.mount_in(100, DEVICE, "/data");

        let err = scanner(&host)
            .ensure_not_mounted_elsewhere(Path::new(DEVICE), Some(Path::new(TARGET)))
            .unwrap_err();
        assert!(matches!(err, RbdError::MountedElsewhere { .. }));
    }

    #[test]
    fn vanished_processes_are_skipped() {
        let host = FakeHost::new();
        host.mount_local(DEVICE, TARGET);
        host.add_namespace(300, "shared:42");
        host.mount_in(300, DEVICE, "/data");
        host.vanish(300);

        scanner(&host)
            .ensure_not_mounted_elsewhere(Path::new(DEVICE), Some(Path::new(TARGET)))
            .unwrap();
    }

    #[test]
    fn malformed_foreign_table_fails_the_scan() {
        let host = FakeHost::new();
        host.add_namespace(400, "shared:1");
        host.corrupt_mountinfo(400);

        let err = scanner(&host)
            .ensure_not_mounted_elsewhere(Path::new(DEVICE), None)
            .unwrap_err();
        assert!(matches!(err, RbdError::Parse { .. }));
    }

    #[test]
    fn procfs_reads_own_namespace() {
        let proc = ProcFs::new("/proc");
        let ns = proc.namespace(None).unwrap();
        assert!(ns.starts_with("mnt:["));
        assert!(MountTable::parse(&proc.mountinfo(None).unwrap()).is_ok());
        assert!(proc.pids().unwrap().contains(&std::process::id()));
    }
}
