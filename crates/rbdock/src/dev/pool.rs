//! Pools and image provisioning.

use std::path::PathBuf;

use rbdock_common::{DevName, ImageName, ImageSize, PoolName, RbdResult};

use super::{Context, Dev, Image};
use crate::cluster::{EXCLUSIVE_LOCK_FEATURE, MapOptions};

/// A storage pool.
#[derive(Debug, Clone)]
pub struct Pool {
    ctx: Context,
    name: PoolName,
}

impl Pool {
    /// Pool `name`.
    #[must_use]
    pub const fn new(ctx: Context, name: PoolName) -> Self {
        Self { ctx, name }
    }

    /// Pool name.
    #[must_use]
    pub const fn name(&self) -> &PoolName {
        &self.name
    }

    /// Handle to image `name`. Does not check existence.
    #[must_use]
    pub fn image(&self, name: ImageName) -> Image {
        Image::new(self.ctx.clone(), DevName::image(self.name.clone(), name))
    }

    /// All images in the pool.
    ///
    /// # Errors
    ///
    /// Returns the cluster error.
    pub fn images(&self) -> RbdResult<Vec<Image>> {
        Ok(self
            .ctx
            .cluster
            .list_images(&self.name)?
            .into_iter()
            .map(|name| self.image(name))
            .collect())
    }

    /// Image `name`, verified to exist.
    ///
    /// # Errors
    ///
    /// Returns [`rbdock_common::RbdError::NotFound`] if it does not.
    pub fn get_image(&self, name: ImageName) -> RbdResult<Image> {
        let image = self.image(name);
        image.info()?;
        Ok(image)
    }

    /// Images of this pool mapped on this host, with their devices.
    /// Snapshot mappings are not included.
    ///
    /// # Errors
    ///
    /// Returns an error if the mapping list cannot be read.
    pub fn mapped_images(&self) -> RbdResult<Vec<(Image, PathBuf)>> {
        let mut mapped = Vec::new();
        for mapping in self.ctx.cluster.mappings()? {
            if mapping.pool != self.name.as_str() || mapping.snap.is_some() {
                continue;
            }
            match ImageName::new(mapping.image) {
                Ok(name) => mapped.push((self.image(name), mapping.device)),
                Err(e) => tracing::warn!(pool = %self.name, error = %e, "Skipping mapping"),
            }
        }
        Ok(mapped)
    }

    /// Create image `name` with the exclusive-lock feature and format it.
    ///
    /// The image is mapped only for formatting and unmapped again.
    ///
    /// # Errors
    ///
    /// Returns [`rbdock_common::RbdError::AlreadyExists`] if the name is
    /// taken, or the map, format or unmap error.
    pub fn create_image(&self, name: ImageName, size: ImageSize, fstype: &str) -> RbdResult<Image> {
        let image = self.image(name);
        let dev = image.name().clone();

        self.ctx
            .cluster
            .create_image(&dev, size, &[EXCLUSIVE_LOCK_FEATURE])?;
        tracing::info!(image = %dev, size = %size, "Created image");

        let device = self.ctx.cluster.map(&dev, MapOptions::default())?;
        let formatted = self.ctx.system.make_filesystem(&device, fstype);
        let unmapped = self.ctx.cluster.unmap(&device, false);

        if let Err(e) = &unmapped {
            tracing::warn!(image = %dev, device = %device.display(), error = %e, "Failed to unmap after format");
        }
        formatted?;
        unmapped?;

        tracing::info!(image = %dev, fstype, "Formatted image");
        Ok(image)
    }
}
