//! Standard filesystem paths for rbdock.

use std::path::{Path, PathBuf};

use once_cell::sync::Lazy;

/// Default root directory under which volumes are mounted.
pub static RBD_VOLUME_DIR: Lazy<PathBuf> = Lazy::new(|| {
    std::env::var("RBD_VOLUME_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/var/lib/docker-volumes/rbd"))
});

/// Default procfs mount.
pub static PROC_ROOT: Lazy<PathBuf> = Lazy::new(|| PathBuf::from("/proc"));

/// Standard paths used by the volume driver.
#[derive(Debug, Clone)]
pub struct RbdockPaths {
    /// Mount root (default: /var/lib/docker-volumes/rbd).
    pub mount_root: PathBuf,
    /// procfs root (default: /proc).
    pub proc_root: PathBuf,
}

impl RbdockPaths {
    /// Create paths with default locations.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create paths with a custom mount root.
    #[must_use]
    pub fn with_mount_root(root: impl Into<PathBuf>) -> Self {
        Self {
            mount_root: root.into(),
            proc_root: PROC_ROOT.clone(),
        }
    }

    /// Mountpoint of an image: `<root>/<image>`.
    #[must_use]
    pub fn mountpoint(&self, image: &str) -> PathBuf {
        self.mount_root.join(image)
    }

    /// The procfs root.
    #[must_use]
    pub fn proc_root(&self) -> &Path {
        &self.proc_root
    }

    /// Create the mount root.
    ///
    /// # Errors
    ///
    /// Returns an error if directory creation fails.
    pub fn create_dirs(&self) -> std::io::Result<()> {
        std::fs::create_dir_all(&self.mount_root)
    }
}

impl Default for RbdockPaths {
    fn default() -> Self {
        Self {
            mount_root: RBD_VOLUME_DIR.clone(),
            proc_root: PROC_ROOT.clone(),
        }
    }
}
