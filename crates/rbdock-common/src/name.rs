//! Pool, image and snapshot name validation.
//!
//! Names end up as arguments of the cluster CLI and as path components of
//! mountpoints, so anything that could be read as a flag, a separator or a
//! path traversal is rejected up front.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::{RbdError, RbdResult};

/// Maximum length of any name component.
pub const MAX_NAME_LENGTH: usize = 255;

fn validate(kind: &'static str, name: &str) -> RbdResult<()> {
    let reject = |reason| {
        Err(RbdError::InvalidName {
            kind,
            name: name.to_string(),
            reason,
        })
    };

    if name.is_empty() {
        return reject("must not be empty");
    }
    if name.len() > MAX_NAME_LENGTH {
        return reject("must be at most 255 bytes");
    }
    if name.starts_with('-') {
        return reject("must not start with '-'");
    }
    if name == "." || name == ".." {
        return reject("must not be a relative path component");
    }
    if name.contains(['/', '@']) {
        return reject("must not contain '/' or '@'");
    }
    if name.chars().any(|c| c.is_whitespace() || c.is_control()) {
        return reject("must not contain whitespace or control characters");
    }

    Ok(())
}

macro_rules! name_type {
    ($(#[$meta:meta])* $ty:ident, $kind:literal) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(try_from = "String", into = "String")]
        pub struct $ty(String);

        impl $ty {
            /// Create a name, validating the format.
            ///
            /// # Errors
            ///
            /// Returns [`RbdError::InvalidName`] if the name is rejected.
            pub fn new(name: impl Into<String>) -> RbdResult<Self> {
                let name = name.into();
                validate($kind, &name)?;
                Ok(Self(name))
            }

            /// Get the name as a string slice.
            #[must_use]
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl FromStr for $ty {
            type Err = RbdError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Self::new(s)
            }
        }

        impl TryFrom<String> for $ty {
            type Error = RbdError;

            fn try_from(s: String) -> Result<Self, Self::Error> {
                Self::new(s)
            }
        }

        impl From<$ty> for String {
            fn from(name: $ty) -> Self {
                name.0
            }
        }

        impl AsRef<str> for $ty {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }
    };
}

name_type!(
    /// A validated storage pool name.
    PoolName,
    "pool"
);

/// Pool used when none is configured.
pub const DEFAULT_POOL: &str = "docker";

impl Default for PoolName {
    fn default() -> Self {
        Self(DEFAULT_POOL.to_string())
    }
}

name_type!(
    /// A validated image name, unique within its pool.
    ImageName,
    "image"
);

name_type!(
    /// A validated snapshot name, unique within its image.
    SnapName,
    "snapshot"
);

/// Full identity of a block device: `pool/image` or `pool/image@snapshot`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DevName {
    pool: PoolName,
    image: ImageName,
    snap: Option<SnapName>,
}

impl DevName {
    /// Identity of an image.
    #[must_use]
    pub const fn image(pool: PoolName, image: ImageName) -> Self {
        Self {
            pool,
            image,
            snap: None,
        }
    }

    /// Identity of a snapshot of this image.
    #[must_use]
    pub fn snapshot(&self, snap: SnapName) -> Self {
        Self {
            pool: self.pool.clone(),
            image: self.image.clone(),
            snap: Some(snap),
        }
    }

    /// The pool component.
    #[must_use]
    pub const fn pool(&self) -> &PoolName {
        &self.pool
    }

    /// The image component.
    #[must_use]
    pub const fn image_name(&self) -> &ImageName {
        &self.image
    }

    /// The snapshot component, if this names a snapshot.
    #[must_use]
    pub const fn snap(&self) -> Option<&SnapName> {
        self.snap.as_ref()
    }

    /// Identity of the parent image (drops the snapshot component).
    #[must_use]
    pub fn parent(&self) -> Self {
        Self::image(self.pool.clone(), self.image.clone())
    }

    /// True if this names a snapshot.
    #[must_use]
    pub const fn is_snapshot(&self) -> bool {
        self.snap.is_some()
    }
}

impl fmt::Display for DevName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.pool, self.image)?;
        if let Some(snap) = &self.snap {
            write!(f, "@{snap}")?;
        }
        Ok(())
    }
}

impl FromStr for DevName {
    type Err = RbdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (pool, rest) = s.split_once('/').ok_or_else(|| RbdError::InvalidName {
            kind: "device",
            name: s.to_string(),
            reason: "expected pool/image[@snapshot]",
        })?;
        let (image, snap) = match rest.split_once('@') {
            Some((image, snap)) => (image, Some(SnapName::new(snap)?)),
            None => (rest, None),
        };

        Ok(Self {
            pool: PoolName::new(pool)?,
            image: ImageName::new(image)?,
            snap,
        })
    }
}
