//! Subordinate id lookup (`/etc/subuid`, `/etc/subgid`).
//!
//! Each table line is `name-or-id:base:size`. The first line naming the user
//! (by login name or numeric id) whose range holds at least
//! [`MIN_SUBID_RANGE`] ids supplies the base offset.

use std::path::{Path, PathBuf};

use crate::{Error, Identity, Result};

/// Smallest subordinate range accepted for remapping.
pub const MIN_SUBID_RANGE: u64 = 65536;

const SUBUID_PATH: &str = "/etc/subuid";
const SUBGID_PATH: &str = "/etc/subgid";

/// Locations of the uid and gid mapping tables.
#[derive(Debug, Clone)]
pub struct SubidTables {
    uid_table: PathBuf,
    gid_table: PathBuf,
}

impl Default for SubidTables {
    fn default() -> Self {
        Self::new(SUBUID_PATH, SUBGID_PATH)
    }
}

impl SubidTables {
    /// Uses the given table files instead of the system ones.
    pub fn new(uid_table: impl Into<PathBuf>, gid_table: impl Into<PathBuf>) -> Self {
        Self {
            uid_table: uid_table.into(),
            gid_table: gid_table.into(),
        }
    }

    /// Returns `(base_uid, base_gid)` for `user`.
    pub fn resolve(&self, user: &Identity) -> Result<(u32, u32)> {
        let uid = lookup(&self.uid_table, &user.name, user.uid)?;
        let gid = lookup(&self.gid_table, &user.name, user.gid)?;
        Ok((uid, gid))
    }
}

fn lookup(table: &Path, name: &str, id: u32) -> Result<u32> {
    let content = std::fs::read_to_string(table).map_err(|e| Error::Subid {
        path: table.to_path_buf(),
        reason: e.to_string(),
    })?;
    parse_table(&content, name, id).map_err(|reason| Error::Subid {
        path: table.to_path_buf(),
        reason,
    })
}

/// Scans a mapping table for the first qualifying range of `name`/`id`.
fn parse_table(content: &str, name: &str, id: u32) -> std::result::Result<u32, String> {
    let id = id.to_string();
    for (n, line) in content.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        let fields: Vec<&str> = line.split(':').collect();
        let [owner, base, size] = fields[..] else {
            return Err(format!("line {}: expected 3 fields, got {}", n + 1, fields.len()));
        };
        if owner != name && owner != id {
            continue;
        }
        let size: u64 = size
            .parse()
            .map_err(|_| format!("line {}: invalid range size {size:?}", n + 1))?;
        if size < MIN_SUBID_RANGE {
            continue;
        }
        return base
            .parse()
            .map_err(|_| format!("line {}: invalid range base {base:?}", n + 1));
    }
    Err(format!(
        "no range of at least {MIN_SUBID_RANGE} ids for user {name}"
    ))
}
