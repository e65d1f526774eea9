//! `/proc/<pid>/mountinfo` parsing.
//!
//! Each line has the form
//!
//! ```text
//! 36 35 98:0 /mnt1 /mnt2 rw,noatime master:1 - ext3 /dev/root rw,errors=continue
//! (1)(2)(3)   (4)   (5)      (6)      (7)   (8) (9)   (10)         (11)
//! ```
//!
//! Fields (7) are zero or more optional tags terminated by a lone `-`.
//! Path fields escape space, tab, newline and backslash as octal `\ooo`.

use std::ffi::OsString;
use std::os::unix::ffi::OsStringExt;
use std::path::{Path, PathBuf};

use rbdock_common::{RbdError, RbdResult};

/// One mount of a mount table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountInfo {
    /// Unique mount id.
    pub id: u32,
    /// Id of the parent mount.
    pub parent_id: u32,
    /// Device major number.
    pub major: u32,
    /// Device minor number.
    pub minor: u32,
    /// Root of the mount within its filesystem.
    pub root: PathBuf,
    /// Mount point relative to the process root.
    pub mount_point: PathBuf,
    /// Per-mount options.
    pub options: String,
    /// Peer group this mount shares events with.
    pub shared: Option<u32>,
    /// Peer group this mount receives events from.
    pub master: Option<u32>,
    /// Closest dominant peer group, when not a direct master.
    pub propagate_from: Option<u32>,
    /// Mount is unbindable.
    pub unbindable: bool,
    /// Filesystem type.
    pub fs_type: String,
    /// Mount source, usually the device path.
    pub source: String,
    /// Per-superblock options.
    pub super_options: String,
}

/// Propagation peer group of a mount.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PeerGroup {
    /// `shared:N` id.
    pub shared: Option<u32>,
    /// `master:N` id.
    pub master: Option<u32>,
}

impl MountInfo {
    /// True if this mount's source is `device`.
    #[must_use]
    pub fn is_device(&self, device: &Path) -> bool {
        Path::new(&self.source) == device
    }

    /// Propagation settings of this mount.
    #[must_use]
    pub const fn peer_group(&self) -> PeerGroup {
        PeerGroup {
            shared: self.shared,
            master: self.master,
        }
    }
}

impl PeerGroup {
    /// True if mount events in the shared group `ours` reach this group.
    #[must_use]
    pub fn receives_from(&self, ours: &Self) -> bool {
        match ours.shared {
            Some(id) => self.shared == Some(id) || self.master == Some(id),
            None => false,
        }
    }
}

fn malformed(line: &str, reason: &str) -> RbdError {
    RbdError::Parse {
        what: "mountinfo line".to_string(),
        message: format!("{reason}: {line:?}"),
    }
}

/// Decode the octal escapes the kernel applies to path fields.
#[must_use]
pub fn unescape(field: &str) -> Vec<u8> {
    let bytes = field.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'\\' && i + 3 < bytes.len() {
            let digits = &bytes[i + 1..i + 4];
            if digits.iter().all(|b| (b'0'..=b'7').contains(b)) {
                let value = digits
                    .iter()
                    .fold(0u32, |acc, b| acc * 8 + u32::from(b - b'0'));
                if let Ok(byte) = u8::try_from(value) {
                    out.push(byte);
                    i += 4;
                    continue;
                }
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    out
}

fn path_field(field: &str) -> PathBuf {
    PathBuf::from(OsString::from_vec(unescape(field)))
}

fn number(line: &str, field: Option<&str>, name: &str) -> RbdResult<u32> {
    field
        .ok_or_else(|| malformed(line, &format!("missing {name}")))?
        .parse()
        .map_err(|_| malformed(line, &format!("invalid {name}")))
}

impl std::str::FromStr for MountInfo {
    type Err = RbdError;

    fn from_str(line: &str) -> Result<Self, Self::Err> {
        let (left, right) = line
            .split_once(" - ")
            .ok_or_else(|| malformed(line, "missing separator"))?;

        let mut fields = left.split_whitespace();
        let id = number(line, fields.next(), "mount id")?;
        let parent_id = number(line, fields.next(), "parent id")?;

        let dev = fields
            .next()
            .ok_or_else(|| malformed(line, "missing major:minor"))?;
        let (major, minor) = dev
            .split_once(':')
            .ok_or_else(|| malformed(line, "invalid major:minor"))?;
        let major = number(line, Some(major), "major")?;
        let minor = number(line, Some(minor), "minor")?;

        let root = path_field(fields.next().ok_or_else(|| malformed(line, "missing root"))?);
        let mount_point = path_field(
            fields
                .next()
                .ok_or_else(|| malformed(line, "missing mount point"))?,
        );
        let options = fields
            .next()
            .ok_or_else(|| malformed(line, "missing mount options"))?
            .to_string();

        let mut info = Self {
            id,
            parent_id,
            major,
            minor,
            root,
            mount_point,
            options,
            shared: None,
            master: None,
            propagate_from: None,
            unbindable: false,
            fs_type: String::new(),
            source: String::new(),
            super_options: String::new(),
        };

        for tag in fields {
            match tag.split_once(':') {
                Some(("shared", value)) => info.shared = Some(number(line, Some(value), "shared")?),
                Some(("master", value)) => info.master = Some(number(line, Some(value), "master")?),
                Some(("propagate_from", value)) => {
                    info.propagate_from = Some(number(line, Some(value), "propagate_from")?);
                }
                None if tag == "unbindable" => info.unbindable = true,
                // tags added by newer kernels
                _ => {}
            }
        }

        let mut fields = right.split_whitespace();
        info.fs_type = fields
            .next()
            .ok_or_else(|| malformed(line, "missing filesystem type"))?
            .to_string();
        info.source = String::from_utf8_lossy(&unescape(
            fields.next().ok_or_else(|| malformed(line, "missing source"))?,
        ))
        .into_owned();
        info.super_options = fields.next().unwrap_or_default().to_string();

        Ok(info)
    }
}

/// A parsed mount table of one mount namespace.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MountTable {
    mounts: Vec<MountInfo>,
}

impl MountTable {
    /// Parse a whole mountinfo file. Any malformed line fails the parse.
    ///
    /// # Errors
    ///
    /// Returns [`RbdError::Parse`] naming the first malformed line.
    pub fn parse(text: &str) -> RbdResult<Self> {
        let mounts = text
            .lines()
            .filter(|line| !line.trim().is_empty())
            .map(str::parse)
            .collect::<RbdResult<Vec<MountInfo>>>()?;
        Ok(Self { mounts })
    }

    /// Mounts whose source is `device`.
    pub fn for_device<'a>(&'a self, device: &'a Path) -> impl Iterator<Item = &'a MountInfo> + 'a {
        self.mounts.iter().filter(move |m| m.is_device(device))
    }

    /// Mount by id.
    #[must_use]
    pub fn get(&self, id: u32) -> Option<&MountInfo> {
        self.mounts.iter().find(|m| m.id == id)
    }

    /// Parent of a mount, if it is visible in this table.
    #[must_use]
    pub fn parent_of(&self, mount: &MountInfo) -> Option<&MountInfo> {
        self.get(mount.parent_id)
    }

    /// Number of mounts.
    #[must_use]
    pub fn len(&self) -> usize {
        self.mounts.len()
    }

    /// True if the table has no mounts.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.mounts.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TABLE: &str = "\
22 1 0:21 / /proc rw,nosuid,nodev,noexec,relatime shared:5 - proc proc rw
1 0 8:1 / / rw,relatime shared:1 - ext4 /dev/sda1 rw
310 1 43:0 / /var/lib/docker-volumes/rbd/data rw,noatime shared:160 - xfs /dev/nbd0 rw,attr2
311 1 43:16 / /mnt/with\\040space ro master:1 propagate_from:3 unbindable - xfs /dev/nbd1 ro
";

    #[test]
    fn parse_line() {
        let m: MountInfo = "36 35 98:0 /mnt1 /mnt2 rw,noatime master:1 - ext3 /dev/root rw,errors=continue"
            .parse()
            .unwrap();
        assert_eq!(m.id, 36);
        assert_eq!(m.parent_id, 35);
        assert_eq!((m.major, m.minor), (98, 0));
        assert_eq!(m.root, PathBuf::from("/mnt1"));
        assert_eq!(m.mount_point, PathBuf::from("/mnt2"));
        assert_eq!(m.options, "rw,noatime");
        assert_eq!(m.master, Some(1));
        assert_eq!(m.shared, None);
        assert_eq!(m.fs_type, "ext3");
        assert_eq!(m.source, "/dev/root");
        assert_eq!(m.super_options, "rw,errors=continue");
    }

    #[test]
    fn parse_table() {
        let table = MountTable::parse(TABLE).unwrap();
        assert_eq!(table.len(), 4);

        let nbd1 = table.for_device(Path::new("/dev/nbd1")).next().unwrap();
        assert_eq!(nbd1.mount_point, PathBuf::from("/mnt/with space"));
        assert_eq!(nbd1.master, Some(1));
        assert_eq!(nbd1.propagate_from, Some(3));
        assert!(nbd1.unbindable);

        let parent = table.parent_of(nbd1).unwrap();
        assert_eq!(parent.mount_point, PathBuf::from("/"));
        assert_eq!(parent.shared, Some(1));
    }

    #[test]
    fn malformed_lines_fail_the_table() {
        assert!(MountTable::parse("1 0 8:1 / / rw shared:1 ext4 /dev/sda1 rw\n").is_err());
        assert!(MountTable::parse("x 0 8:1 / / rw - ext4 /dev/sda1 rw\n").is_err());
        assert!(MountTable::parse("1 0 81 / / rw - ext4 /dev/sda1 rw\n").is_err());
        assert!(MountTable::parse("1 0 8:1 / / rw shared:x - ext4 /dev/sda1 rw\n").is_err());
        assert!(MountTable::parse("1 0 8:1 / / rw - ext4\n").is_err());
        assert!(MountTable::parse("1 0 8:1 /\n").is_err());
    }

    #[test]
    fn unknown_tags_are_ignored() {
        let m: MountInfo = "1 0 8:1 / / rw future:9 - ext4 /dev/sda1 rw".parse().unwrap();
        assert_eq!(m.peer_group(), PeerGroup::default());
    }

    #[test]
    fn unescape_octal() {
        assert_eq!(unescape("a\\040b"), b"a b");
        assert_eq!(unescape("tab\\011"), b"tab\t");
        assert_eq!(unescape("back\\134slash"), b"back\\slash");
        assert_eq!(unescape("short\\04"), b"short\\04");
        assert_eq!(unescape("plain"), b"plain");
    }

    #[test]
    fn peer_group_propagation() {
        let ours = PeerGroup { shared: Some(7), master: None };
        assert!(PeerGroup { shared: Some(7), master: None }.receives_from(&ours));
        assert!(PeerGroup { shared: None, master: Some(7) }.receives_from(&ours));
        assert!(!PeerGroup { shared: Some(8), master: Some(9) }.receives_from(&ours));
        assert!(!PeerGroup::default().receives_from(&PeerGroup::default()));
    }
}
