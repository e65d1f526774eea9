//! Common error types for rbdock.

use miette::Diagnostic;
use thiserror::Error;

/// Result type alias using [`RbdError`].
pub type RbdResult<T> = Result<T, RbdError>;

/// Common errors across rbdock.
#[derive(Error, Diagnostic, Debug)]
pub enum RbdError {
    /// The named pool, image, snapshot or lock entry does not exist.
    #[error("{kind} not found: {name}")]
    #[diagnostic(code(rbdock::not_found))]
    NotFound {
        /// What was looked up ("image", "snapshot", "pool", ...).
        kind: &'static str,
        /// The name that was not found.
        name: String,
    },

    /// The named image or snapshot already exists.
    #[error("{kind} already exists: {name}")]
    #[diagnostic(code(rbdock::already_exists))]
    AlreadyExists {
        /// What was created ("image", "snapshot", ...).
        kind: &'static str,
        /// The conflicting name.
        name: String,
    },

    /// The operation needs a local mapping and there is none.
    #[error("{dev} is not mapped")]
    #[diagnostic(
        code(rbdock::dev::not_mapped),
        help("Map the device before mounting or probing it")
    )]
    NotMapped {
        /// The device identity.
        dev: String,
    },

    /// The device is mounted somewhere an unmount or unmap here would disturb.
    #[error("{device} is mounted at {mountpoint} in {namespace}")]
    #[diagnostic(
        code(rbdock::dev::mounted_elsewhere),
        help("Unmount the device from the other mount namespace first")
    )]
    MountedElsewhere {
        /// Kernel device path.
        device: String,
        /// Where the conflicting mount lives.
        mountpoint: String,
        /// The namespace holding the mount ("this namespace" or an ns link).
        namespace: String,
    },

    /// The image lacks the exclusive-lock feature.
    #[error("exclusive-lock feature is not enabled on {dev}")]
    #[diagnostic(code(rbdock::cluster::exclusive_lock_not_enabled))]
    ExclusiveLockNotEnabled {
        /// The device identity.
        dev: String,
    },

    /// Another client holds the cluster exclusive lock.
    #[error("exclusive lock on {dev} is held by another client")]
    #[diagnostic(
        code(rbdock::cluster::exclusive_lock_taken),
        help("The volume is mapped on another host")
    )]
    ExclusiveLockTaken {
        /// The device identity.
        dev: String,
    },

    /// The kernel refused because the device is in use.
    #[error("device busy: {device}")]
    #[diagnostic(code(rbdock::dev::busy))]
    DeviceBusy {
        /// Kernel device path or device identity.
        device: String,
    },

    /// Image removal refused while a mapping exists.
    #[error("{dev} is still mapped at {device}")]
    #[diagnostic(code(rbdock::dev::still_mapped), help("Unmap the image before removing it"))]
    StillMapped {
        /// The device identity.
        dev: String,
        /// Kernel device path.
        device: String,
    },

    /// Another unexpired cooperative lock entry exists.
    #[error("{dev} is locked by {holder} until {expires}")]
    #[diagnostic(
        code(rbdock::lock::contention),
        help("Wait for the holder to release the volume or for its lock to expire")
    )]
    LockContention {
        /// The device identity.
        dev: String,
        /// Hostname (or raw locker) of the holder.
        holder: String,
        /// Expiry of the conflicting entry.
        expires: String,
    },

    /// Malformed external output or label.
    #[error("Failed to parse {what}: {message}")]
    #[diagnostic(code(rbdock::parse))]
    Parse {
        /// What was being parsed.
        what: String,
        /// Why parsing failed.
        message: String,
    },

    /// One or more items of a batch failed.
    #[error("{} of the batch failed: {}", .errors.len(), summarize(.errors))]
    #[diagnostic(code(rbdock::batch))]
    PartialBatchFailure {
        /// Every individual failure.
        #[related]
        errors: Vec<RbdError>,
    },

    /// An external command exited unsuccessfully.
    #[error("{program} {args} failed ({}): {stderr}", exit_code(.code))]
    #[diagnostic(code(rbdock::command))]
    Command {
        /// Program name.
        program: String,
        /// Joined arguments.
        args: String,
        /// Exit code, if the process exited normally.
        code: Option<i32>,
        /// Trimmed standard error.
        stderr: String,
    },

    /// A required executable is missing from `PATH`.
    #[error("Executable not found: {name}")]
    #[diagnostic(
        code(rbdock::executable_not_found),
        help("Install the package providing it and make sure it is on PATH")
    )]
    ExecutableNotFound {
        /// Executable name.
        name: String,
    },

    /// Invalid pool, image or snapshot name.
    #[error("Invalid {kind} name {name:?}: {reason}")]
    #[diagnostic(code(rbdock::invalid_name))]
    InvalidName {
        /// The kind of name.
        kind: &'static str,
        /// The rejected name.
        name: String,
        /// Why it was rejected.
        reason: &'static str,
    },

    /// Invalid size or duration.
    #[error("Invalid quantity: {value}")]
    #[diagnostic(
        code(rbdock::invalid_quantity),
        help("Use formats like '512M', '20G', '1Ti' for sizes and '90s', '12h', '7d' for durations")
    )]
    InvalidQuantity {
        /// The invalid value.
        value: String,
    },

    /// Invalid image pattern.
    #[error("Invalid pattern {pattern:?}: {message}")]
    #[diagnostic(code(rbdock::invalid_pattern), help("Patterns look like 'pool/glob', e.g. 'docker/db-*'"))]
    InvalidPattern {
        /// The rejected pattern.
        pattern: String,
        /// Why it was rejected.
        message: String,
    },

    /// I/O error.
    #[error("I/O error: {0}")]
    #[diagnostic(code(rbdock::io))]
    Io(#[from] std::io::Error),

    /// Serialization error.
    #[error("Serialization error: {0}")]
    #[diagnostic(code(rbdock::serialization))]
    Serialization(String),

    /// Configuration error.
    #[error("Configuration error: {message}")]
    #[diagnostic(code(rbdock::config))]
    Config {
        /// The error message.
        message: String,
    },

    /// Internal error (should not happen).
    #[error("Internal error: {message}")]
    #[diagnostic(code(rbdock::internal))]
    Internal {
        /// The error message.
        message: String,
    },
}

impl RbdError {
    /// True for errors that refuse an action to protect other users of a
    /// device. These must reach the caller and never be swallowed.
    #[must_use]
    pub const fn is_safety_refusal(&self) -> bool {
        matches!(
            self,
            Self::MountedElsewhere { .. }
                | Self::LockContention { .. }
                | Self::ExclusiveLockTaken { .. }
                | Self::StillMapped { .. }
        )
    }

    /// True when the error reports a missing object.
    #[must_use]
    pub const fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    /// Fold collected failures into a single result.
    ///
    /// # Errors
    ///
    /// Returns [`RbdError::PartialBatchFailure`] when `errors` is non-empty.
    pub fn from_batch(errors: Vec<Self>) -> RbdResult<()> {
        if errors.is_empty() {
            Ok(())
        } else {
            Err(Self::PartialBatchFailure { errors })
        }
    }
}

impl From<serde_json::Error> for RbdError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

fn summarize(errors: &[RbdError]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

fn exit_code(code: &Option<i32>) -> String {
    match code {
        Some(c) => format!("exit {c}"),
        None => "killed by signal".to_string(),
    }
}
