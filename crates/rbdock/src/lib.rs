//! # rbdock
//!
//! Ceph RBD images as Docker volumes.
//!
//! ## Features
//!
//! - **Cooperative locking**: TTL-based lock entries on each image, refreshed
//!   in the background and reaped when their holder disappears
//! - **Namespace-aware unmounting**: a device is never unmapped while any
//!   other mount namespace still has it mounted
//! - **Reference counting**: one mapping per volume, shared by every
//!   container using it
//! - **Consistent snapshots**: filesystems are frozen around each snapshot
//!
//! ## Usage
//!
//! ```no_run
//! use rbdock::dev::Context;
//! use rbdock::driver::{CreateOptions, DriverConfig, RbdDriver, VolumeDriver};
//!
//! # fn example() -> rbdock_common::RbdResult<()> {
//! let config = DriverConfig::default();
//! let ctx = Context::host(Default::default(), &config.paths.proc_root)?;
//! let driver = RbdDriver::new(config, ctx, rbdock::system::hostname()?);
//!
//! driver.create("data", &CreateOptions::default())?;
//! let mountpoint = driver.mount("data", "container-1")?;
//! println!("mounted at {}", mountpoint.display());
//! driver.unmount("data", "container-1")?;
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]

pub mod cluster;
pub mod dev;
pub mod driver;
pub mod exec;
pub mod lock;
pub mod namespace;
pub mod snap;
pub mod system;

#[cfg(test)]
pub(crate) mod testing;

pub use dev::{Context, Dev, Image, Snapshot};
pub use driver::{RbdDriver, VolumeDriver};
pub use snap::SnapshotOrchestrator;
