//! The volume driver.
//!
//! [`RbdDriver`] turns volume requests into device state machine
//! operations. It owns all per-process state: the per-device mutexes, the
//! container ids using each volume, the cooperative locks this host holds
//! and the in-flight counter used at shutdown.

mod config;
mod recovery;
mod registry;

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use rbdock_common::{DevName, ImageName, ImageSize, RbdError, RbdResult};

pub use config::DriverConfig;
pub use registry::{DeviceLocks, InFlight, InFlightGuard, MountUsers, RECOVERED_USER};

use crate::dev::{Context, Dev, Image, Pool};
use crate::lock::{Lock, LockManager};

/// Visibility of volumes across hosts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scope {
    /// Volumes are visible on every host.
    Global,
    /// Volumes exist on one host only.
    Local,
}

impl Scope {
    /// Protocol name of the scope.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Global => "global",
            Self::Local => "local",
        }
    }
}

/// Driver capabilities.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Capabilities {
    /// Volume scope.
    pub scope: Scope,
}

/// Options of a create request.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CreateOptions {
    /// Image size, the configured default when unset.
    pub size: Option<ImageSize>,
    /// Filesystem, the configured default when unset.
    pub filesystem: Option<String>,
}

impl CreateOptions {
    /// Parse request options. Recognizes `size` and `fs`; other keys are
    /// ignored.
    ///
    /// # Errors
    ///
    /// Returns an error if `size` is not a valid quantity.
    pub fn from_map(options: &HashMap<String, String>) -> RbdResult<Self> {
        let mut parsed = Self::default();
        for (key, value) in options {
            match key.as_str() {
                "size" if !value.is_empty() => parsed.size = Some(ImageSize::parse(value)?),
                "fs" if !value.is_empty() => parsed.filesystem = Some(value.clone()),
                "size" | "fs" => {}
                other => tracing::debug!(option = other, "Ignoring unknown volume option"),
            }
        }
        Ok(parsed)
    }
}

/// A volume as reported to the protocol layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Volume {
    /// Volume name (the image name).
    pub name: String,
    /// Mountpoint, if mounted on this host.
    pub mountpoint: Option<PathBuf>,
}

/// Operations a volume plugin protocol layer calls.
pub trait VolumeDriver: Send + Sync {
    /// Create and format a volume.
    ///
    /// # Errors
    ///
    /// Returns [`RbdError::AlreadyExists`] if the volume exists.
    fn create(&self, name: &str, options: &CreateOptions) -> RbdResult<()>;

    /// All volumes.
    ///
    /// # Errors
    ///
    /// Returns the cluster error.
    fn list(&self) -> RbdResult<Vec<Volume>>;

    /// One volume with its mountpoint.
    ///
    /// # Errors
    ///
    /// Returns [`RbdError::NotFound`] if it does not exist.
    fn get(&self, name: &str) -> RbdResult<Volume>;

    /// Delete a volume.
    ///
    /// # Errors
    ///
    /// Returns [`RbdError::StillMapped`] while it is mapped.
    fn remove(&self, name: &str) -> RbdResult<()>;

    /// Mountpoint if mounted on this host.
    ///
    /// # Errors
    ///
    /// Returns [`RbdError::NotFound`] if it does not exist.
    fn path(&self, name: &str) -> RbdResult<Option<PathBuf>>;

    /// Mount for container `id` and return the mountpoint.
    ///
    /// # Errors
    ///
    /// Returns a lock, map or mount error.
    fn mount(&self, name: &str, id: &str) -> RbdResult<PathBuf>;

    /// Release the mount of container `id`.
    ///
    /// # Errors
    ///
    /// Returns [`RbdError::MountedElsewhere`] if the last user leaves but
    /// the device is still mounted in another namespace.
    fn unmount(&self, name: &str, id: &str) -> RbdResult<()>;

    /// Driver capabilities.
    fn capabilities(&self) -> Capabilities;
}

/// Volume driver backed by images of one pool.
pub struct RbdDriver {
    config: DriverConfig,
    pool: Pool,
    locks: LockManager,
    devices: DeviceLocks,
    users: Arc<MountUsers>,
    held: DashMap<DevName, Lock>,
    in_flight: InFlight,
}

impl std::fmt::Debug for RbdDriver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RbdDriver")
            .field("config", &self.config)
            .field("locks", &self.locks)
            .field("held", &self.held.len())
            .finish_non_exhaustive()
    }
}

impl RbdDriver {
    /// Create a driver for `config.pool`, locking as `hostname`.
    #[must_use]
    pub fn new(config: DriverConfig, ctx: Context, hostname: impl Into<String>) -> Self {
        let locks = LockManager::new(Arc::clone(&ctx.cluster), hostname, config.lock_tag.clone())
            .with_idle_grace(config.idle_grace);
        let pool = Pool::new(ctx, config.pool.clone());

        Self {
            config,
            pool,
            locks,
            devices: DeviceLocks::new(),
            users: Arc::new(MountUsers::new()),
            held: DashMap::new(),
            in_flight: InFlight::new(),
        }
    }

    /// Driver configuration.
    #[must_use]
    pub const fn config(&self) -> &DriverConfig {
        &self.config
    }

    /// Volume operations currently running.
    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.in_flight.count()
    }

    /// Number of container ids using volume `name`.
    #[must_use]
    pub fn users(&self, name: &str) -> usize {
        ImageName::new(name).map_or(0, |image| self.users.count(&self.dev(image)))
    }

    fn dev(&self, image: ImageName) -> DevName {
        DevName::image(self.config.pool.clone(), image)
    }

    fn image(&self, name: &str) -> RbdResult<Image> {
        Ok(self.pool.image(ImageName::new(name)?))
    }

    fn mountpoint(&self, image: &Image) -> PathBuf {
        self.config.mountpoint(image.name().image_name().as_str())
    }

    /// Make sure this host holds the cooperative lock of `image`.
    fn ensure_lock(&self, image: &Image) -> RbdResult<()> {
        let dev = image.name();
        if self.held.get(dev).is_some_and(|lock| !lock.is_released()) {
            return Ok(());
        }

        let probe = Some(self.users.probe(dev));
        let lock = if image.device()?.is_some() {
            // mapped here already, so any lock entry of ours is ours to keep
            if let Some(holder) = self.locks.foreign_holder(dev)? {
                return Err(RbdError::LockContention {
                    dev: dev.to_string(),
                    holder: holder.holder,
                    expires: holder.expires_at.to_rfc3339(),
                });
            }
            self.locks.inherit(dev, self.config.lock_ttl, probe)?
        } else {
            self.locks.acquire(dev, self.config.lock_ttl, probe)?
        };

        self.held.insert(dev.clone(), lock);
        Ok(())
    }

    /// Undo a failed first mount. A mapping made by the failed call is
    /// removed before the lock goes; if that fails the lock is kept.
    fn roll_back_mount(&self, image: &Image, mountpoint: &Path, was_mapped: bool) {
        if !was_mapped {
            if let Err(e) = image.unmount_and_unmap(Some(mountpoint)) {
                tracing::error!(
                    image = %image.name(),
                    error = %e,
                    "Failed to unmap after failed mount, keeping lock"
                );
                return;
            }
        }
        self.release_lock(image.name());
    }

    fn release_lock(&self, dev: &DevName) {
        if let Some((_, lock)) = self.held.remove(dev) {
            if let Err(e) = lock.release() {
                tracing::warn!(dev = %dev, error = %e, "Failed to release lock");
            }
        }
    }
}

impl VolumeDriver for RbdDriver {
    fn create(&self, name: &str, options: &CreateOptions) -> RbdResult<()> {
        let image = ImageName::new(name)?;
        let dev = self.dev(image.clone());
        let _op = self.in_flight.enter();
        let _guard = self.devices.lock(&dev);

        let size = options.size.unwrap_or(self.config.default_size);
        let fstype = options
            .filesystem
            .as_deref()
            .unwrap_or(&self.config.default_filesystem);

        tracing::debug!(image = %dev, size = %size, fstype, "Create");
        self.pool.create_image(image, size, fstype)?;
        Ok(())
    }

    fn list(&self) -> RbdResult<Vec<Volume>> {
        Ok(self
            .pool
            .images()?
            .into_iter()
            .map(|image| Volume {
                name: image.name().image_name().to_string(),
                mountpoint: None,
            })
            .collect())
    }

    fn get(&self, name: &str) -> RbdResult<Volume> {
        let image = self.image(name)?;
        let _guard = self.devices.lock(image.name());

        image.info()?;
        let mountpoint = self.mountpoint(&image);
        let mounted = match image.is_mounted_at(&mountpoint) {
            Ok(mounted) => mounted,
            Err(e) => {
                tracing::debug!(image = %image.name(), error = %e, "Could not determine mount state");
                false
            }
        };

        Ok(Volume {
            name: name.to_string(),
            mountpoint: mounted.then_some(mountpoint),
        })
    }

    fn remove(&self, name: &str) -> RbdResult<()> {
        let image = self.image(name)?;
        let _op = self.in_flight.enter();
        let _guard = self.devices.lock(image.name());

        image.info()?;
        image.remove()
    }

    fn path(&self, name: &str) -> RbdResult<Option<PathBuf>> {
        let image = self.image(name)?;
        let _guard = self.devices.lock(image.name());

        image.info()?;
        let mountpoint = self.mountpoint(&image);
        Ok(image.is_mounted_at(&mountpoint)?.then_some(mountpoint))
    }

    fn mount(&self, name: &str, id: &str) -> RbdResult<PathBuf> {
        let image = self.image(name)?;
        let dev = image.name().clone();
        let _op = self.in_flight.enter();
        let _guard = self.devices.lock(&dev);
        let mountpoint = self.mountpoint(&image);

        if self.users.count(&dev) > 0 && image.is_mounted_at(&mountpoint)? {
            self.users.add(&dev, id);
            tracing::debug!(image = %dev, id, users = self.users.count(&dev), "Volume already mounted");
            return Ok(mountpoint);
        }

        image.info()?;
        let was_mapped = image.device()?.is_some();
        self.users.add(&dev, id);

        let mounted = self.ensure_lock(&image).and_then(|()| {
            image.map_and_mount(&mountpoint, None, self.config.mount_options.flags())
        });
        if let Err(e) = mounted {
            tracing::warn!(image = %dev, id, error = %e, "Mount failed, rolling back");
            if self.users.remove(&dev, id) == 0 {
                self.roll_back_mount(&image, &mountpoint, was_mapped);
            }
            return Err(e);
        }

        tracing::info!(image = %dev, id, mountpoint = %mountpoint.display(), "Volume mounted");
        Ok(mountpoint)
    }

    fn unmount(&self, name: &str, id: &str) -> RbdResult<()> {
        let image = self.image(name)?;
        let dev = image.name().clone();
        let _op = self.in_flight.enter();
        let _guard = self.devices.lock(&dev);

        let remaining = self.users.remove(&dev, id);
        if remaining > 0 {
            tracing::debug!(image = %dev, id, users = remaining, "Volume still in use");
            return Ok(());
        }

        let mountpoint = self.mountpoint(&image);
        if let Err(e) = image.unmount_and_unmap(Some(&mountpoint)) {
            if e.is_safety_refusal() {
                tracing::warn!(image = %dev, error = %e, "Volume still in use elsewhere, leaving it mapped");
            }
            return Err(e);
        }

        self.release_lock(&dev);
        tracing::info!(image = %dev, id, "Volume unmounted");
        Ok(())
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            scope: Scope::Global,
        }
    }
}

/// Recommended wait for in-flight operations at shutdown.
pub const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);
