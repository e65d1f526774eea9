//! Parsers for kernel and cluster output through the public API.

use std::path::{Path, PathBuf};

use chrono::{Duration, Utc};
use proptest::prelude::*;
use rbdock::cluster::{parse_lock_list, parse_mappings};
use rbdock::lock::LockLabel;
use rbdock::namespace::{MountInfo, MountTable};

const CONTAINER_TABLE: &str = "\
1790 1600 0:318 / / rw,relatime master:1 - overlay overlay rw,lowerdir=/l,upperdir=/u
1791 1790 0:320 / /proc rw,nosuid,nodev,noexec,relatime - proc proc rw
1830 1790 43:0 / /data rw,noatime master:1 - xfs /dev/nbd0 rw,attr2,inode64
";

#[test]
fn container_mount_table() {
    let table = MountTable::parse(CONTAINER_TABLE).unwrap();
    assert_eq!(table.len(), 3);

    let data: Vec<&MountInfo> = table.for_device(Path::new("/dev/nbd0")).collect();
    assert_eq!(data.len(), 1);
    assert_eq!(data[0].mount_point, PathBuf::from("/data"));
    assert_eq!(data[0].fs_type, "xfs");

    let parent = table.parent_of(data[0]).unwrap();
    assert_eq!(parent.master, Some(1));
    assert_eq!(parent.shared, None);
}

#[test]
fn one_bad_line_fails_the_table() {
    let text = format!("{CONTAINER_TABLE}garbage\n");
    assert!(MountTable::parse(&text).is_err());
}

#[test]
fn json_and_table_mappings_agree() {
    let json = r#"[{"id":"0","pool":"docker","namespace":"","name":"data","snap":"-","device":"/dev/nbd0"}]"#;
    let table = "\
id  pool    namespace  image  snap  device
0   docker             data   -     /dev/nbd0
";
    assert_eq!(parse_mappings(json).unwrap(), parse_mappings(table).unwrap());
}

#[test]
fn lock_list_shapes() {
    let keyed = r#"{"node-a,2024-01-08T20:11:54Z":{"locker":"client.4123","address":"10.0.0.1:0/1"}}"#;
    let listed = r#"[{"id":"node-a,2024-01-08T20:11:54Z","locker":"client.4123","address":"10.0.0.1:0/1"}]"#;

    let locks = parse_lock_list(keyed).unwrap();
    assert_eq!(locks, parse_lock_list(listed).unwrap());

    let label: LockLabel = locks[0].id.parse().unwrap();
    assert_eq!(label.holder, "node-a");
    assert!(label.is_expired(Utc::now()));
}

#[test]
fn lock_label_expiry() {
    let now = Utc::now();
    let live = LockLabel::new("node-a", now + Duration::seconds(30));
    assert!(!live.is_expired(now));
    assert!(LockLabel::fixed("node-a").is_fixed());
    assert!("auto 1234".parse::<LockLabel>().is_err());
}

fn escape(path: &str) -> String {
    path.replace('\\', "\\134")
        .replace(' ', "\\040")
        .replace('\t', "\\011")
        .replace('\n', "\\012")
}

proptest! {
    #[test]
    fn mount_points_survive_escaping(name in "[a-z0-9 \\t\\\\_.-]{1,24}") {
        let target = format!("/mnt/{name}");
        let line = format!("40 1 43:1 / {} rw - xfs /dev/nbd1 rw\n", escape(&target));

        let table = MountTable::parse(&line).unwrap();
        let mount = table.for_device(Path::new("/dev/nbd1")).next().unwrap();
        prop_assert_eq!(&mount.mount_point, &PathBuf::from(&target));
    }
}
