//! Startup recovery, idle reaping and shutdown.

use std::path::Path;
use std::time::{Duration, SystemTime};

use rbdock_common::{RbdError, RbdResult};

use super::{RECOVERED_USER, RbdDriver};
use crate::dev::{Dev, Image};
use crate::lock::LockLabel;

impl RbdDriver {
    /// Take over the volumes this host has mapped from an earlier process.
    ///
    /// Every mapped image of the pool gets its lock inherited, and images
    /// mounted at their mountpoint are registered with [`RECOVERED_USER`].
    /// A mapping locked by another host is torn down: its holders are
    /// killed and the device is force-unmapped.
    ///
    /// Returns the number of volumes taken over.
    ///
    /// # Errors
    ///
    /// Returns [`RbdError::PartialBatchFailure`] with every volume that
    /// could not be recovered; the others are recovered regardless.
    pub fn recover(&self) -> RbdResult<usize> {
        let mut recovered = 0;
        let mut errors = Vec::new();

        for (image, device) in self.pool.mapped_images()? {
            let _guard = self.devices.lock(image.name());
            match self.recover_one(&image, &device) {
                Ok(true) => recovered += 1,
                Ok(false) => {}
                Err(e) => {
                    tracing::warn!(image = %image.name(), error = %e, "Failed to recover volume");
                    errors.push(e);
                }
            }
        }

        tracing::info!(pool = %self.config.pool, recovered, "Recovery complete");
        RbdError::from_batch(errors)?;
        Ok(recovered)
    }

    fn recover_one(&self, image: &Image, device: &Path) -> RbdResult<bool> {
        let dev = image.name();
        if let Some(holder) = self.locks.foreign_holder(dev)? {
            self.evict(image, device, &holder)?;
            return Ok(false);
        }

        let mountpoint = self.mountpoint(image);
        if image.is_mounted_at(&mountpoint)? {
            self.users.add(dev, RECOVERED_USER);
        }

        let lock = self
            .locks
            .inherit(dev, self.config.lock_ttl, Some(self.users.probe(dev)))?;
        self.held.insert(dev.clone(), lock);

        tracing::info!(
            image = %dev,
            device = %device.display(),
            users = self.users.count(dev),
            "Recovered volume"
        );
        Ok(true)
    }

    fn evict(&self, image: &Image, device: &Path, holder: &LockLabel) -> RbdResult<()> {
        tracing::error!(
            image = %image.name(),
            device = %device.display(),
            holder = %holder.holder,
            "Mapped volume is locked by another host, force unmapping"
        );

        let system = &image.context().system;
        for pid in system.holders(device)? {
            if let Err(e) = system.kill(pid) {
                tracing::warn!(pid, error = %e, "Failed to kill device holder");
            }
        }

        image.context().cluster.unmap(device, true)
    }

    /// Unmount and unmap volumes nobody in this process uses and whose
    /// device was last written before `older_than`.
    ///
    /// Volumes still mounted in another namespace are left alone. Returns
    /// the number of volumes released.
    ///
    /// # Errors
    ///
    /// Returns an error if the mapping list cannot be read. Failures on
    /// single volumes are logged and skipped.
    pub fn reap(&self, older_than: SystemTime) -> RbdResult<usize> {
        let _op = self.in_flight.enter();
        let mut reaped = 0;

        for (image, device) in self.pool.mapped_images()? {
            let dev = image.name();
            if self.users.count(dev) > 0 {
                continue;
            }

            let _guard = self.devices.lock(dev);
            if self.users.count(dev) > 0 {
                continue;
            }

            match self.reap_one(&image, &device, older_than) {
                Ok(true) => reaped += 1,
                Ok(false) => {}
                Err(RbdError::MountedElsewhere { .. }) => {
                    tracing::debug!(image = %dev, "Still mounted elsewhere, not reaping");
                }
                Err(e) => tracing::warn!(image = %dev, error = %e, "Failed to reap volume"),
            }
        }

        if reaped > 0 {
            tracing::info!(pool = %self.config.pool, reaped, "Reaped idle volumes");
        }
        Ok(reaped)
    }

    fn reap_one(&self, image: &Image, device: &Path, older_than: SystemTime) -> RbdResult<bool> {
        let modified = image.context().system.last_modified(device)?;
        if modified >= older_than {
            return Ok(false);
        }

        let mountpoint = self.mountpoint(image);
        image.unmount_and_unmap(Some(&mountpoint))?;
        self.release_lock(image.name());
        tracing::info!(image = %image.name(), device = %device.display(), "Reaped volume");
        Ok(true)
    }

    /// Wait up to `timeout` for running volume operations to finish.
    /// Returns false if some were still running.
    ///
    /// Held locks stay registered on the cluster so the next process can
    /// inherit them.
    #[must_use]
    pub fn shutdown(&self, timeout: Duration) -> bool {
        let running = self.in_flight.count();
        if running > 0 {
            tracing::info!(running, "Waiting for volume operations to finish");
        }
        let idle = self.in_flight.wait_idle(timeout);
        if !idle {
            tracing::warn!(running = self.in_flight.count(), "Shutting down with operations in flight");
        }
        idle
    }
}
