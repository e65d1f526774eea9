//! # rbdock-common
//!
//! Shared utilities and types for the rbdock volume driver.
//!
//! This crate provides common functionality used across all rbdock crates:
//! - Validated pool, image and snapshot names
//! - Image size and duration parsing
//! - Standard filesystem paths
//! - Common error types

#![warn(missing_docs)]

pub mod error;
pub mod name;
pub mod paths;
pub mod size;

pub use error::{RbdError, RbdResult};
pub use name::{DevName, ImageName, PoolName, SnapName};
pub use paths::RbdockPaths;
pub use size::{ImageSize, parse_duration};
