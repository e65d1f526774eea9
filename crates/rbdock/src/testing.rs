//! In-memory cluster and host used by unit tests.
//!
//! [`FakeCluster`] keeps images, snapshots, mappings and lock entries.
//! [`FakeHost`] keeps the mount tables of our own and any number of
//! foreign mount namespaces. Both record every mutating call.

#![allow(dead_code)]

use std::collections::{BTreeMap, HashMap, HashSet};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;

use chrono::{DateTime, Local};
use parking_lot::Mutex;
use rbdock_common::{DevName, ImageName, ImageSize, PoolName, RbdError, RbdResult};
use rustix::mount::MountFlags;

use crate::cluster::{
    Cluster, DevInfo, EXCLUSIVE_LOCK_FEATURE, LockEntry, MapOptions, Mapping, SnapEntry,
};
use crate::dev::Context;
use crate::namespace::{NamespaceScanner, ProcSource};
use crate::system::System;

fn injected(op: &str) -> RbdError {
    RbdError::Command {
        program: "fake".to_string(),
        args: op.to_string(),
        code: Some(1),
        stderr: "injected failure".to_string(),
    }
}

#[derive(Debug, Default)]
struct FakeImage {
    size: u64,
    features: Vec<String>,
    snaps: Vec<SnapEntry>,
    locks: Vec<LockEntry>,
}

#[derive(Debug, Default)]
struct ClusterState {
    images: BTreeMap<String, FakeImage>,
    mappings: Vec<Mapping>,
    next_snap_id: u64,
    calls: Vec<String>,
    failures: HashSet<String>,
    exclusive_taken: HashSet<String>,
    busy: HashSet<PathBuf>,
}

impl ClusterState {
    fn record(&mut self, op: &str, target: impl std::fmt::Display) -> RbdResult<()> {
        self.calls.push(format!("{op} {target}"));
        if self.failures.remove(op) {
            return Err(injected(op));
        }
        Ok(())
    }

    fn image(&mut self, dev: &DevName) -> RbdResult<&mut FakeImage> {
        self.images
            .get_mut(&dev.parent().to_string())
            .ok_or_else(|| RbdError::NotFound {
                kind: "image",
                name: dev.parent().to_string(),
            })
    }
}

/// In-memory [`Cluster`].
#[derive(Debug, Default)]
pub struct FakeCluster {
    state: Mutex<ClusterState>,
}

impl FakeCluster {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Add a 1 GiB image with the exclusive-lock feature.
    pub fn add_image(&self, spec: &str) {
        self.state.lock().images.insert(
            spec.to_string(),
            FakeImage {
                size: ImageSize::from_gibibytes(1).as_bytes(),
                features: vec![EXCLUSIVE_LOCK_FEATURE.to_string()],
                ..FakeImage::default()
            },
        );
    }

    /// Add an image without any features.
    pub fn add_plain_image(&self, spec: &str) {
        self.state.lock().images.insert(
            spec.to_string(),
            FakeImage {
                size: ImageSize::from_gibibytes(1).as_bytes(),
                ..FakeImage::default()
            },
        );
    }

    pub fn has_image(&self, spec: &str) -> bool {
        self.state.lock().images.contains_key(spec)
    }

    pub fn features(&self, spec: &str) -> Vec<String> {
        self.state
            .lock()
            .images
            .get(spec)
            .map(|i| i.features.clone())
            .unwrap_or_default()
    }

    /// Add a snapshot, `spec` as `pool/image@snap`.
    pub fn add_snapshot(&self, spec: &str, created: Option<DateTime<Local>>) {
        let dev: DevName = spec.parse().unwrap();
        let mut state = self.state.lock();
        state.next_snap_id += 1;
        let id = state.next_snap_id;
        state
            .image(&dev)
            .unwrap()
            .snaps
            .push(SnapEntry {
                id,
                name: dev.snap().unwrap().to_string(),
                created,
            });
    }

    pub fn snapshots(&self, image: &str) -> Vec<String> {
        self.state
            .lock()
            .images
            .get(image)
            .map(|i| i.snaps.iter().map(|s| s.name.clone()).collect())
            .unwrap_or_default()
    }

    pub fn add_lock(&self, image: &str, id: &str, locker: &str) {
        self.state
            .lock()
            .images
            .get_mut(image)
            .unwrap()
            .locks
            .push(LockEntry {
                id: id.to_string(),
                locker: locker.to_string(),
                address: "10.0.0.1:0/1".to_string(),
            });
    }

    pub fn lock_ids(&self, image: &str) -> Vec<String> {
        self.state
            .lock()
            .images
            .get(image)
            .map(|i| i.locks.iter().map(|l| l.id.clone()).collect())
            .unwrap_or_default()
    }

    /// Create a mapping without recording a call, as if left by an
    /// earlier process.
    pub fn premap(&self, spec: &str) -> PathBuf {
        let dev: DevName = spec.parse().unwrap();
        let mut state = self.state.lock();
        Self::insert_mapping(&mut state, &dev)
    }

    // lowest free index, like the kernel
    fn insert_mapping(state: &mut ClusterState, dev: &DevName) -> PathBuf {
        let device = (0..)
            .map(|n| PathBuf::from(format!("/dev/nbd{n}")))
            .find(|path| !state.mappings.iter().any(|m| &m.device == path))
            .unwrap_or_default();
        state.mappings.push(Mapping {
            pool: dev.pool().to_string(),
            image: dev.image_name().to_string(),
            snap: dev.snap().map(ToString::to_string),
            device: device.clone(),
        });
        device
    }

    pub fn mapped_device(&self, spec: &str) -> Option<PathBuf> {
        let dev: DevName = spec.parse().unwrap();
        self.state
            .lock()
            .mappings
            .iter()
            .find(|m| m.is(&dev))
            .map(|m| m.device.clone())
    }

    /// Fail the next call of `op`, e.g. `"lock list"`.
    pub fn fail_next(&self, op: &str) {
        self.state.lock().failures.insert(op.to_string());
    }

    /// Make exclusive maps of `spec` fail as if another client held it.
    pub fn take_exclusive(&self, spec: &str) {
        self.state.lock().exclusive_taken.insert(spec.to_string());
    }

    /// Make unmap of `device` fail as busy unless forced.
    pub fn set_busy(&self, device: &Path) {
        self.state.lock().busy.insert(device.to_path_buf());
    }

    pub fn calls(&self) -> Vec<String> {
        self.state.lock().calls.clone()
    }

    pub fn count_calls(&self, prefix: &str) -> usize {
        self.state
            .lock()
            .calls
            .iter()
            .filter(|c| c.starts_with(prefix))
            .count()
    }
}

impl Cluster for FakeCluster {
    fn list_images(&self, pool: &PoolName) -> RbdResult<Vec<ImageName>> {
        let mut state = self.state.lock();
        state.record("list", pool)?;
        let prefix = format!("{pool}/");
        Ok(state
            .images
            .keys()
            .filter_map(|k| k.strip_prefix(&prefix))
            .filter_map(|name| ImageName::new(name).ok())
            .collect())
    }

    fn info(&self, dev: &DevName) -> RbdResult<DevInfo> {
        let mut state = self.state.lock();
        state.record("info", dev)?;
        let image = state.image(dev)?;
        let created = match dev.snap() {
            Some(snap) => {
                image
                    .snaps
                    .iter()
                    .find(|s| s.name == snap.as_str())
                    .ok_or_else(|| RbdError::NotFound {
                        kind: "snapshot",
                        name: dev.to_string(),
                    })?
                    .created
            }
            None => None,
        };
        Ok(DevInfo {
            name: dev.image_name().to_string(),
            size: image.size,
            features: image.features.clone(),
            created,
        })
    }

    fn create_image(&self, dev: &DevName, size: ImageSize, features: &[&str]) -> RbdResult<()> {
        let mut state = self.state.lock();
        state.record("create", dev)?;
        let key = dev.to_string();
        if state.images.contains_key(&key) {
            return Err(RbdError::AlreadyExists {
                kind: "image",
                name: key,
            });
        }
        state.images.insert(
            key,
            FakeImage {
                size: size.as_bytes(),
                features: features.iter().map(ToString::to_string).collect(),
                ..FakeImage::default()
            },
        );
        Ok(())
    }

    fn remove_image(&self, dev: &DevName) -> RbdResult<()> {
        let mut state = self.state.lock();
        state.record("remove", dev)?;
        state
            .images
            .remove(&dev.to_string())
            .map(drop)
            .ok_or_else(|| RbdError::NotFound {
                kind: "image",
                name: dev.to_string(),
            })
    }

    fn enable_feature(&self, dev: &DevName, feature: &str) -> RbdResult<()> {
        let mut state = self.state.lock();
        state.record("feature enable", dev)?;
        let image = state.image(dev)?;
        if !image.features.iter().any(|f| f == feature) {
            image.features.push(feature.to_string());
        }
        Ok(())
    }

    fn map(&self, dev: &DevName, options: MapOptions) -> RbdResult<PathBuf> {
        let mut state = self.state.lock();
        state.record("map", dev)?;
        let image = state.image(dev)?;
        if let Some(snap) = dev.snap() {
            if !image.snaps.iter().any(|s| s.name == snap.as_str()) {
                return Err(RbdError::NotFound {
                    kind: "snapshot",
                    name: dev.to_string(),
                });
            }
        }
        if options.exclusive {
            if !image.features.iter().any(|f| f == EXCLUSIVE_LOCK_FEATURE) {
                return Err(RbdError::ExclusiveLockNotEnabled {
                    dev: dev.to_string(),
                });
            }
            if state.exclusive_taken.contains(&dev.to_string()) {
                return Err(RbdError::ExclusiveLockTaken {
                    dev: dev.to_string(),
                });
            }
        }
        Ok(Self::insert_mapping(&mut state, dev))
    }

    fn unmap(&self, device: &Path, force: bool) -> RbdResult<()> {
        let mut state = self.state.lock();
        state.record("unmap", device.display())?;
        if !force && state.busy.contains(device) {
            return Err(RbdError::DeviceBusy {
                device: device.display().to_string(),
            });
        }
        let before = state.mappings.len();
        state.mappings.retain(|m| m.device != device);
        if state.mappings.len() == before {
            return Err(RbdError::NotFound {
                kind: "mapping",
                name: device.display().to_string(),
            });
        }
        Ok(())
    }

    fn mappings(&self) -> RbdResult<Vec<Mapping>> {
        let mut state = self.state.lock();
        if state.failures.remove("showmapped") {
            return Err(injected("showmapped"));
        }
        Ok(state.mappings.clone())
    }

    fn lock_add(&self, dev: &DevName, id: &str, tag: &str) -> RbdResult<()> {
        let mut state = self.state.lock();
        state.record("lock add", format!("{dev} {tag}"))?;
        let image = state.image(dev)?;
        if image.locks.iter().any(|l| l.id == id) {
            return Err(RbdError::AlreadyExists {
                kind: "lock",
                name: id.to_string(),
            });
        }
        image.locks.push(LockEntry {
            id: id.to_string(),
            locker: "client.1".to_string(),
            address: "10.0.0.1:0/1".to_string(),
        });
        Ok(())
    }

    fn lock_remove(&self, dev: &DevName, id: &str, locker: &str) -> RbdResult<()> {
        let mut state = self.state.lock();
        state.record("lock remove", format!("{dev} {locker}"))?;
        let image = state.image(dev)?;
        let before = image.locks.len();
        image.locks.retain(|l| !(l.id == id && l.locker == locker));
        if image.locks.len() == before {
            return Err(RbdError::NotFound {
                kind: "lock",
                name: id.to_string(),
            });
        }
        Ok(())
    }

    fn lock_list(&self, dev: &DevName) -> RbdResult<Vec<LockEntry>> {
        let mut state = self.state.lock();
        if state.failures.remove("lock list") {
            return Err(injected("lock list"));
        }
        Ok(state.image(dev)?.locks.clone())
    }

    fn snap_create(&self, dev: &DevName) -> RbdResult<()> {
        let mut state = self.state.lock();
        state.record("snap create", dev)?;
        state.next_snap_id += 1;
        let id = state.next_snap_id;
        let name = dev
            .snap()
            .map(ToString::to_string)
            .ok_or_else(|| RbdError::Internal {
                message: "snapshot name missing".to_string(),
            })?;
        let image = state.image(dev)?;
        if image.snaps.iter().any(|s| s.name == name) {
            return Err(RbdError::AlreadyExists {
                kind: "snapshot",
                name: dev.to_string(),
            });
        }
        image.snaps.push(SnapEntry {
            id,
            name,
            created: Some(Local::now()),
        });
        Ok(())
    }

    fn snap_remove(&self, dev: &DevName) -> RbdResult<()> {
        let mut state = self.state.lock();
        state.record("snap remove", dev)?;
        let name = dev.snap().map(ToString::to_string).unwrap_or_default();
        let image = state.image(dev)?;
        let before = image.snaps.len();
        image.snaps.retain(|s| s.name != name);
        if image.snaps.len() == before {
            return Err(RbdError::NotFound {
                kind: "snapshot",
                name: dev.to_string(),
            });
        }
        Ok(())
    }

    fn snap_list(&self, dev: &DevName) -> RbdResult<Vec<SnapEntry>> {
        let mut state = self.state.lock();
        let mut snaps = state.image(dev)?.snaps.clone();
        snaps.sort_by_key(|s| s.id);
        Ok(snaps)
    }
}

#[derive(Debug, Clone)]
struct FakeMount {
    id: u32,
    device: PathBuf,
    target: PathBuf,
    fstype: String,
    flags: MountFlags,
    data: String,
}

#[derive(Debug)]
struct FakeNamespace {
    id: String,
    root_tag: String,
    mounts: Vec<FakeMount>,
}

impl FakeNamespace {
    fn new(id: String, root_tag: &str) -> Self {
        Self {
            id,
            root_tag: root_tag.to_string(),
            mounts: Vec::new(),
        }
    }

    fn render(&self) -> String {
        let mut out = format!(
            "1 0 8:1 / / rw,relatime {} - ext4 /dev/sda1 rw\n",
            self.root_tag
        );
        for m in &self.mounts {
            let ro = if m.flags.contains(MountFlags::RDONLY) { "ro" } else { "rw" };
            let target = m.target.display().to_string().replace(' ', "\\040");
            out.push_str(&format!(
                "{} 1 43:{} / {target} {ro},relatime - {} {} {ro}\n",
                m.id,
                m.id,
                m.fstype,
                m.device.display()
            ));
        }
        out
    }
}

#[derive(Debug)]
struct HostState {
    own: FakeNamespace,
    foreign: BTreeMap<u32, FakeNamespace>,
    next_mount_id: u32,
    vanished: HashSet<u32>,
    corrupt: HashSet<u32>,
    filesystems: HashMap<PathBuf, String>,
    holders: HashMap<PathBuf, Vec<u32>>,
    mtimes: HashMap<PathBuf, SystemTime>,
    calls: Vec<String>,
    failures: HashSet<String>,
}

impl HostState {
    fn record(&mut self, op: &str, target: impl std::fmt::Display) -> RbdResult<()> {
        self.calls.push(format!("{op} {target}"));
        if self.failures.remove(op) {
            return Err(injected(op));
        }
        Ok(())
    }

    fn add_mount(&mut self, pid: Option<u32>, device: &Path, target: &Path, fstype: &str, flags: MountFlags, data: &str) {
        self.next_mount_id += 1;
        let mount = FakeMount {
            id: self.next_mount_id,
            device: device.to_path_buf(),
            target: target.to_path_buf(),
            fstype: fstype.to_string(),
            flags,
            data: data.to_string(),
        };
        match pid {
            None => self.own.mounts.push(mount),
            Some(pid) => self
                .foreign
                .get_mut(&pid)
                .expect("namespace not added")
                .mounts
                .push(mount),
        }
    }
}

/// In-memory [`System`] and [`ProcSource`].
///
/// Our own namespace is `mnt:[1]` with a root mount in peer group 1.
#[derive(Debug)]
pub struct FakeHost {
    state: Mutex<HostState>,
}

impl FakeHost {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(HostState {
                own: FakeNamespace::new("mnt:[1]".to_string(), "shared:1"),
                foreign: BTreeMap::new(),
                next_mount_id: 100,
                vanished: HashSet::new(),
                corrupt: HashSet::new(),
                filesystems: HashMap::new(),
                holders: HashMap::new(),
                mtimes: HashMap::new(),
                calls: Vec::new(),
                failures: HashSet::new(),
            }),
        })
    }

    /// Mount in our own namespace without recording a call.
    pub fn mount_local(&self, device: &str, target: &str) {
        self.state
            .lock()
            .add_mount(None, Path::new(device), Path::new(target), "xfs", MountFlags::empty(), "");
    }

    /// Add a process `pid` in its own namespace `mnt:[pid]` whose root
    /// mount carries `root_tag`, e.g. `master:1`.
    pub fn add_namespace(&self, pid: u32, root_tag: &str) {
        self.state
            .lock()
            .foreign
            .insert(pid, FakeNamespace::new(format!("mnt:[{pid}]"), root_tag));
    }

    pub fn mount_in(&self, pid: u32, device: &str, target: &str) {
        self.state
            .lock()
            .add_mount(Some(pid), Path::new(device), Path::new(target), "xfs", MountFlags::empty(), "");
    }

    /// The process exits between listing and reading.
    pub fn vanish(&self, pid: u32) {
        self.state.lock().vanished.insert(pid);
    }

    pub fn corrupt_mountinfo(&self, pid: u32) {
        self.state.lock().corrupt.insert(pid);
    }

    pub fn set_filesystem(&self, device: &Path, fstype: &str) {
        self.state
            .lock()
            .filesystems
            .insert(device.to_path_buf(), fstype.to_string());
    }

    pub fn set_holders(&self, device: &Path, pids: Vec<u32>) {
        self.state.lock().holders.insert(device.to_path_buf(), pids);
    }

    pub fn set_last_modified(&self, device: &Path, at: SystemTime) {
        self.state.lock().mtimes.insert(device.to_path_buf(), at);
    }

    /// Fail the next call of `op`, e.g. `"freeze"`.
    pub fn fail_next(&self, op: &str) {
        self.state.lock().failures.insert(op.to_string());
    }

    /// Flags and data of our own mount at `target`.
    pub fn local_mount(&self, target: &Path) -> Option<(MountFlags, String)> {
        self.state
            .lock()
            .own
            .mounts
            .iter()
            .find(|m| m.target == target)
            .map(|m| (m.flags, m.data.clone()))
    }

    pub fn calls(&self) -> Vec<String> {
        self.state.lock().calls.clone()
    }

    pub fn count_calls(&self, prefix: &str) -> usize {
        self.state
            .lock()
            .calls
            .iter()
            .filter(|c| c.starts_with(prefix))
            .count()
    }
}

impl System for FakeHost {
    fn mount(
        &self,
        device: &Path,
        target: &Path,
        fstype: &str,
        flags: MountFlags,
        data: &str,
    ) -> RbdResult<()> {
        let mut state = self.state.lock();
        state.record("mount", format!("{} {}", device.display(), target.display()))?;
        state.add_mount(None, device, target, fstype, flags, data);
        Ok(())
    }

    fn unmount(&self, target: &Path) -> RbdResult<()> {
        let mut state = self.state.lock();
        state.record("unmount", target.display())?;
        let Some(pos) = state.own.mounts.iter().rposition(|m| m.target == target) else {
            return Err(io::Error::from_raw_os_error(libc::EINVAL).into());
        };
        state.own.mounts.remove(pos);
        Ok(())
    }

    fn probe_filesystem(&self, device: &Path) -> RbdResult<String> {
        self.state
            .lock()
            .filesystems
            .get(device)
            .cloned()
            .ok_or_else(|| RbdError::Parse {
                what: "blkid output".to_string(),
                message: format!("no filesystem found on {}", device.display()),
            })
    }

    fn make_filesystem(&self, device: &Path, fstype: &str) -> RbdResult<()> {
        let mut state = self.state.lock();
        state.record("mkfs", format!("{fstype} {}", device.display()))?;
        state.filesystems.insert(device.to_path_buf(), fstype.to_string());
        Ok(())
    }

    fn freeze(&self, mountpoint: &Path) -> RbdResult<()> {
        self.state.lock().record("freeze", mountpoint.display())
    }

    fn unfreeze(&self, mountpoint: &Path) -> RbdResult<()> {
        self.state.lock().record("unfreeze", mountpoint.display())
    }

    fn holders(&self, device: &Path) -> RbdResult<Vec<u32>> {
        Ok(self.state.lock().holders.get(device).cloned().unwrap_or_default())
    }

    fn kill(&self, pid: u32) -> RbdResult<()> {
        let mut state = self.state.lock();
        state.record("kill", pid)?;
        for pids in state.holders.values_mut() {
            pids.retain(|p| *p != pid);
        }
        Ok(())
    }

    fn last_modified(&self, device: &Path) -> RbdResult<SystemTime> {
        Ok(self
            .state
            .lock()
            .mtimes
            .get(device)
            .copied()
            .unwrap_or_else(SystemTime::now))
    }
}

impl ProcSource for FakeHost {
    fn namespace(&self, pid: Option<u32>) -> io::Result<String> {
        let state = self.state.lock();
        match pid {
            None | Some(1) => Ok(state.own.id.clone()),
            Some(pid) if state.vanished.contains(&pid) => {
                Err(io::Error::from_raw_os_error(libc::ENOENT))
            }
            Some(pid) => state
                .foreign
                .get(&pid)
                .map(|ns| ns.id.clone())
                .ok_or_else(|| io::Error::from_raw_os_error(libc::ENOENT)),
        }
    }

    fn mountinfo(&self, pid: Option<u32>) -> io::Result<String> {
        let state = self.state.lock();
        match pid {
            None | Some(1) => Ok(state.own.render()),
            Some(pid) if state.corrupt.contains(&pid) => Ok("garbage line\n".to_string()),
            Some(pid) => state
                .foreign
                .get(&pid)
                .map(FakeNamespace::render)
                .ok_or_else(|| io::Error::from_raw_os_error(libc::ENOENT)),
        }
    }

    fn pids(&self) -> io::Result<Vec<u32>> {
        let state = self.state.lock();
        let mut pids = vec![1];
        pids.extend(state.foreign.keys().copied());
        Ok(pids)
    }
}

/// A [`Context`] over a fresh fake cluster and host.
pub fn context() -> (Arc<FakeCluster>, Arc<FakeHost>, Context) {
    let cluster = FakeCluster::new();
    let host = FakeHost::new();
    let ctx = Context::new(
        Arc::clone(&cluster) as Arc<dyn Cluster>,
        Arc::clone(&host) as Arc<dyn System>,
        NamespaceScanner::new(Arc::clone(&host) as Arc<dyn ProcSource>),
    );
    (cluster, host, ctx)
}
