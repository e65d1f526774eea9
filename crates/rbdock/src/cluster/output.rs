//! Decoding of `rbd` command output.

use std::collections::BTreeMap;
use std::path::PathBuf;

use chrono::{DateTime, Local, NaiveDateTime, TimeZone};
use rbdock_common::{RbdError, RbdResult};
use serde::Deserialize;

use super::{DevInfo, LockEntry, Mapping, SnapEntry};

/// `rbd` prints timestamps in C `asctime` form, e.g. `Mon Jan  8 20:11:54 2024`.
const ASCTIME: &str = "%a %b %e %H:%M:%S %Y";

fn parse_error(what: &str, message: impl ToString) -> RbdError {
    RbdError::Parse {
        what: what.to_string(),
        message: message.to_string(),
    }
}

/// Parse an `asctime` timestamp in local time. Empty or unparsable input
/// yields `None`.
pub(crate) fn parse_timestamp(s: &str) -> Option<DateTime<Local>> {
    let normalized = s.split_whitespace().collect::<Vec<_>>().join(" ");
    if normalized.is_empty() {
        return None;
    }
    let naive = NaiveDateTime::parse_from_str(&normalized, ASCTIME).ok()?;
    Local.from_local_datetime(&naive).earliest()
}

#[derive(Deserialize)]
struct InfoJson {
    name: String,
    size: u64,
    #[serde(default)]
    features: Vec<String>,
    #[serde(default)]
    create_timestamp: Option<String>,
}

pub(crate) fn parse_info(text: &str) -> RbdResult<DevInfo> {
    let info: InfoJson = serde_json::from_str(text)?;
    Ok(DevInfo {
        name: info.name,
        size: info.size,
        features: info.features,
        created: info.create_timestamp.as_deref().and_then(parse_timestamp),
    })
}

#[derive(Deserialize)]
struct MappingJson {
    pool: String,
    #[serde(alias = "image")]
    name: String,
    #[serde(default)]
    snap: Option<String>,
    device: String,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum MappingsJson {
    List(Vec<MappingJson>),
    Keyed(BTreeMap<String, MappingJson>),
}

fn snap_column(snap: Option<String>) -> Option<String> {
    snap.filter(|s| !s.is_empty() && s != "-")
}

/// Parse the mapped device listing, JSON or columnar.
///
/// # Errors
///
/// Returns a parse error for output in neither form.
pub fn parse_mappings(text: &str) -> RbdResult<Vec<Mapping>> {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return Ok(Vec::new());
    }
    if !trimmed.starts_with(['[', '{']) {
        return parse_showmapped_table(trimmed);
    }

    let entries = match serde_json::from_str::<MappingsJson>(trimmed)? {
        MappingsJson::List(list) => list,
        MappingsJson::Keyed(map) => map.into_values().collect(),
    };

    Ok(entries
        .into_iter()
        .map(|m| Mapping {
            pool: m.pool,
            image: m.name,
            snap: snap_column(m.snap),
            device: PathBuf::from(m.device),
        })
        .collect())
}

/// Parse the columnar `showmapped` table.
///
/// Columns are located by the start offset of each header, so empty cells
/// (an unset namespace, say) do not shift the columns that follow.
///
/// # Errors
///
/// Returns a parse error if the header lacks a required column.
pub fn parse_showmapped_table(text: &str) -> RbdResult<Vec<Mapping>> {
    let mut lines = text.lines().filter(|l| !l.trim().is_empty());
    let Some(header) = lines.next() else {
        return Ok(Vec::new());
    };

    let mut columns: Vec<(&str, usize)> = Vec::new();
    let mut offset = 0;
    for token in header.split_whitespace() {
        let start = header[offset..]
            .find(token)
            .map(|i| i + offset)
            .ok_or_else(|| parse_error("showmapped header", header))?;
        columns.push((token, start));
        offset = start + token.len();
    }

    let position = |name: &str| columns.iter().position(|(token, _)| *token == name);
    let missing = |name: &str| parse_error("showmapped header", format!("missing {name} column"));
    let pool = position("pool").ok_or_else(|| missing("pool"))?;
    let image = position("image")
        .or_else(|| position("name"))
        .ok_or_else(|| missing("image"))?;
    let snap = position("snap").ok_or_else(|| missing("snap"))?;
    let device = position("device").ok_or_else(|| missing("device"))?;

    lines
        .map(|line| {
            let cell = |index: usize| {
                let start = columns[index].1.min(line.len());
                let end = columns
                    .get(index + 1)
                    .map_or(line.len(), |(_, next)| (*next).min(line.len()));
                line.get(start..end).map(str::trim).unwrap_or_default()
            };

            let device = cell(device);
            if device.is_empty() {
                return Err(parse_error("showmapped row", line));
            }
            Ok(Mapping {
                pool: cell(pool).to_string(),
                image: cell(image).to_string(),
                snap: snap_column(Some(cell(snap).to_string())),
                device: PathBuf::from(device),
            })
        })
        .collect()
}

#[derive(Deserialize)]
struct LockJson {
    #[serde(default)]
    id: Option<String>,
    locker: String,
    #[serde(default)]
    address: String,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum LocksJson {
    List(Vec<LockJson>),
    Keyed(BTreeMap<String, LockJson>),
}

/// Parse the advisory lock listing in either JSON shape.
///
/// # Errors
///
/// Returns a parse error for malformed JSON or list entries without an id.
pub fn parse_lock_list(text: &str) -> RbdResult<Vec<LockEntry>> {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return Ok(Vec::new());
    }

    match serde_json::from_str::<LocksJson>(trimmed)? {
        LocksJson::Keyed(map) => Ok(map
            .into_iter()
            .map(|(id, lock)| LockEntry {
                id,
                locker: lock.locker,
                address: lock.address,
            })
            .collect()),
        LocksJson::List(list) => list
            .into_iter()
            .map(|lock| {
                let id = lock
                    .id
                    .ok_or_else(|| parse_error("lock list", "entry without id"))?;
                Ok(LockEntry {
                    id,
                    locker: lock.locker,
                    address: lock.address,
                })
            })
            .collect(),
    }
}

#[derive(Deserialize)]
struct SnapJson {
    id: u64,
    name: String,
    #[serde(default)]
    timestamp: Option<String>,
}

pub(crate) fn parse_snap_list(text: &str) -> RbdResult<Vec<SnapEntry>> {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return Ok(Vec::new());
    }

    let mut snaps: Vec<SnapEntry> = serde_json::from_str::<Vec<SnapJson>>(trimmed)?
        .into_iter()
        .map(|s| SnapEntry {
            id: s.id,
            name: s.name,
            created: s.timestamp.as_deref().and_then(parse_timestamp),
        })
        .collect();
    snaps.sort_by_key(|s| s.id);
    Ok(snaps)
}
