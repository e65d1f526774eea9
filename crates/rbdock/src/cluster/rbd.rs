//! [`Cluster`] implementation over the `rbd` command line tool.

use std::path::{Path, PathBuf};

use rbdock_common::{DevName, ImageName, ImageSize, PoolName, RbdError, RbdResult};

use super::output::{parse_info, parse_lock_list, parse_mappings, parse_snap_list};
use super::{Cluster, DevInfo, DeviceType, LockEntry, MapOptions, Mapping, SnapEntry};
use crate::exec::{Captured, Tool};

const FEATURE_NOT_ENABLED: &str = "exclusive-lock feature is not enabled";
const LOCK_HELD_ELSEWHERE: &str = "(30) Read-only file system";

/// Cluster access through the `rbd` executable.
#[derive(Debug, Clone)]
pub struct RbdCli {
    rbd: Tool,
    device_type: DeviceType,
}

impl RbdCli {
    /// Resolve `rbd` on `PATH`.
    ///
    /// # Errors
    ///
    /// Returns [`RbdError::ExecutableNotFound`] if it is missing.
    pub fn locate() -> RbdResult<Self> {
        Ok(Self::new(Tool::locate("rbd")?))
    }

    /// Use an already resolved tool.
    #[must_use]
    pub const fn new(rbd: Tool) -> Self {
        Self {
            rbd,
            device_type: DeviceType::Nbd,
        }
    }

    /// Set the block device driver used for mappings.
    #[must_use]
    pub const fn with_device_type(mut self, device_type: DeviceType) -> Self {
        self.device_type = device_type;
        self
    }

    fn run(&self, args: &[&str], classify: impl FnOnce(&Captured) -> Option<RbdError>) -> RbdResult<String> {
        let captured = self.rbd.run(args)?;
        if captured.success() {
            return Ok(captured.stdout);
        }
        match classify(&captured) {
            Some(err) => Err(err),
            None => Err(captured.into_error(&self.rbd)),
        }
    }
}

fn not_found(kind: &'static str, name: &impl ToString) -> impl FnOnce(&Captured) -> Option<RbdError> {
    let name = name.to_string();
    move |c| (c.code == Some(libc::ENOENT)).then(|| RbdError::NotFound { kind, name })
}

fn kind_of(dev: &DevName) -> &'static str {
    if dev.is_snapshot() { "snapshot" } else { "image" }
}

impl Cluster for RbdCli {
    fn list_images(&self, pool: &PoolName) -> RbdResult<Vec<ImageName>> {
        let out = self.run(
            &["--format", "json", "ls", pool.as_str()],
            not_found("pool", pool),
        )?;
        let names: Vec<String> = if out.trim().is_empty() {
            Vec::new()
        } else {
            serde_json::from_str(&out)?
        };

        Ok(names
            .into_iter()
            .filter_map(|name| match ImageName::new(name.as_str()) {
                Ok(image) => Some(image),
                Err(e) => {
                    tracing::warn!(pool = %pool, image = %name, error = %e, "Skipping image with unsupported name");
                    None
                }
            })
            .collect())
    }

    fn info(&self, dev: &DevName) -> RbdResult<DevInfo> {
        let spec = dev.to_string();
        let out = self.run(&["--format", "json", "info", &spec], not_found(kind_of(dev), dev))?;
        parse_info(&out)
    }

    fn create_image(&self, dev: &DevName, size: ImageSize, features: &[&str]) -> RbdResult<()> {
        let spec = dev.to_string();
        let size = size.to_cli_arg();
        let mut args = vec!["create", spec.as_str(), "--size", size.as_str()];
        for feature in features {
            args.extend(["--image-feature", *feature]);
        }

        self.run(&args, |c| {
            (c.code == Some(libc::EEXIST)).then(|| RbdError::AlreadyExists {
                kind: "image",
                name: spec.clone(),
            })
        })?;
        tracing::info!(image = %dev, %size, "Created image");
        Ok(())
    }

    fn remove_image(&self, dev: &DevName) -> RbdResult<()> {
        let spec = dev.to_string();
        self.run(&["remove", "--no-progress", &spec], |c| match c.code {
            Some(libc::ENOENT) => Some(RbdError::NotFound {
                kind: "image",
                name: spec.clone(),
            }),
            Some(libc::EBUSY) => Some(RbdError::DeviceBusy {
                device: spec.clone(),
            }),
            _ => None,
        })?;
        tracing::info!(image = %dev, "Removed image");
        Ok(())
    }

    fn enable_feature(&self, dev: &DevName, feature: &str) -> RbdResult<()> {
        let spec = dev.to_string();
        let captured = self.rbd.run(["feature", "enable", spec.as_str(), feature])?;
        match captured.code {
            Some(0) => {
                tracing::info!(image = %dev, feature, "Enabled image feature");
                Ok(())
            }
            // already enabled
            Some(libc::EINVAL) => Ok(()),
            _ => Err(captured.into_error(&self.rbd)),
        }
    }

    fn map(&self, dev: &DevName, options: MapOptions) -> RbdResult<PathBuf> {
        let spec = dev.to_string();
        let mut args = vec!["device", "map", "-t", self.device_type.as_str()];
        if options.exclusive {
            args.push("--exclusive");
        }
        if options.read_only {
            args.push("--read-only");
        }
        args.push(&spec);

        let out = self.run(&args, |c| {
            if c.failed_with(libc::EINVAL, FEATURE_NOT_ENABLED) {
                Some(RbdError::ExclusiveLockNotEnabled { dev: spec.clone() })
            } else if c.failed_with(libc::EINVAL, LOCK_HELD_ELSEWHERE) || c.code == Some(libc::EROFS) {
                Some(RbdError::ExclusiveLockTaken { dev: spec.clone() })
            } else if c.code == Some(libc::ENOENT) {
                Some(RbdError::NotFound {
                    kind: kind_of(dev),
                    name: spec.clone(),
                })
            } else {
                None
            }
        })?;

        let device = out.trim();
        if device.is_empty() {
            return Err(RbdError::Parse {
                what: "device map output".to_string(),
                message: format!("no device path printed for {spec}"),
            });
        }
        tracing::info!(dev = %dev, device, "Mapped device");
        Ok(PathBuf::from(device))
    }

    fn unmap(&self, device: &Path, force: bool) -> RbdResult<()> {
        let path = device.to_string_lossy();
        let mut args = vec!["device", "unmap", "-t", self.device_type.as_str()];
        if force {
            args.extend(["-o", "force"]);
        }
        args.push(&path);

        self.run(&args, |c| {
            (c.code == Some(libc::EBUSY)).then(|| RbdError::DeviceBusy {
                device: path.to_string(),
            })
        })?;
        tracing::info!(device = %device.display(), force, "Unmapped device");
        Ok(())
    }

    fn mappings(&self) -> RbdResult<Vec<Mapping>> {
        let out = self.run(
            &["device", "list", "-t", self.device_type.as_str(), "--format", "json"],
            |_| None,
        )?;
        parse_mappings(&out)
    }

    fn lock_add(&self, dev: &DevName, id: &str, tag: &str) -> RbdResult<()> {
        let spec = dev.to_string();
        self.run(&["lock", "add", "--shared", tag, &spec, id], |c| match c.code {
            Some(libc::EEXIST) => Some(RbdError::AlreadyExists {
                kind: "lock",
                name: id.to_string(),
            }),
            Some(libc::ENOENT) => Some(RbdError::NotFound {
                kind: "image",
                name: spec.clone(),
            }),
            _ => None,
        })?;
        Ok(())
    }

    fn lock_remove(&self, dev: &DevName, id: &str, locker: &str) -> RbdResult<()> {
        let spec = dev.to_string();
        self.run(&["lock", "remove", &spec, id, locker], not_found("lock", &id))?;
        Ok(())
    }

    fn lock_list(&self, dev: &DevName) -> RbdResult<Vec<LockEntry>> {
        let spec = dev.to_string();
        let out = self.run(&["--format", "json", "lock", "list", &spec], not_found("image", dev))?;
        parse_lock_list(&out)
    }

    fn snap_create(&self, dev: &DevName) -> RbdResult<()> {
        let spec = dev.to_string();
        self.run(&["snap", "create", "--no-progress", &spec], |c| match c.code {
            Some(libc::EEXIST) => Some(RbdError::AlreadyExists {
                kind: "snapshot",
                name: spec.clone(),
            }),
            Some(libc::ENOENT) => Some(RbdError::NotFound {
                kind: "image",
                name: dev.parent().to_string(),
            }),
            _ => None,
        })?;
        tracing::info!(snapshot = %dev, "Created snapshot");
        Ok(())
    }

    fn snap_remove(&self, dev: &DevName) -> RbdResult<()> {
        let spec = dev.to_string();
        self.run(&["snap", "remove", "--no-progress", &spec], |c| match c.code {
            Some(libc::ENOENT) => Some(RbdError::NotFound {
                kind: "snapshot",
                name: spec.clone(),
            }),
            Some(libc::EBUSY) => Some(RbdError::DeviceBusy {
                device: spec.clone(),
            }),
            _ => None,
        })?;
        tracing::info!(snapshot = %dev, "Removed snapshot");
        Ok(())
    }

    fn snap_list(&self, dev: &DevName) -> RbdResult<Vec<SnapEntry>> {
        let spec = dev.parent().to_string();
        let out = self.run(&["--format", "json", "snap", "list", &spec], not_found("image", &spec))?;
        parse_snap_list(&out)
    }
}
