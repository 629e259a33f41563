// SPDX-License-Identifier: Apache-2.0
//! Snapshot naming and the newest-first snapshot list (component C2).

use crate::clock::Clock;
use crate::error::{Error, Result};
use chrono::{DateTime, Utc};
use regex::Regex;
use std::path::Path;
use std::sync::OnceLock;

/// The reserved prefix that marks a snapshot as ours.
pub const PREFIX: &str = "zipper_";

fn snapshot_name_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r"^zipper_([0-9]{4}-[0-9]{2}-[0-9]{2}T[0-9]{2}:[0-9]{2}:[0-9]{2})_([A-Za-z0-9]+)(_full|_incr)?$",
        )
        .expect("static regex is valid")
    })
}

/// A parsed backup snapshot name, with or without its owning file system.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackupSnapshot {
    pub file_system_name: Option<String>,
    pub timestamp: String,
    pub backupset_name: String,
    pub legacy_suffix: Option<String>,
}

impl BackupSnapshot {
    /// Parse a raw name, either `fs@zipper_...` or a bare `zipper_...`.
    pub fn parse(raw: &str) -> Result<BackupSnapshot> {
        let (file_system_name, snap_name) = Self::split_zfs_snapshot_name(raw)?;
        let caps = snapshot_name_re()
            .captures(snap_name)
            .ok_or_else(|| Error::Parse(format!("not a zipper snapshot name: {raw:?}")))?;
        let timestamp = caps.get(1).unwrap().as_str().to_string();
        let backupset_name = caps.get(2).unwrap().as_str().to_string();
        let legacy_suffix = caps.get(3).map(|m| m.as_str().trim_start_matches('_').to_string());

        let file_system_name = file_system_name.map(|fs| normalize_fs(&fs));

        Ok(BackupSnapshot {
            file_system_name,
            timestamp,
            backupset_name,
            legacy_suffix,
        })
    }

    /// True iff the portion of `raw` after any `@` starts with [`PREFIX`].
    pub fn is_ours(raw: &str) -> bool {
        let base = match raw.find('@') {
            Some(idx) => &raw[idx + 1..],
            None => raw,
        };
        base.starts_with(PREFIX)
    }

    fn split_zfs_snapshot_name(raw: &str) -> Result<(Option<String>, &str)> {
        let parts: Vec<&str> = raw.splitn(2, '@').collect();
        match parts.len() {
            1 => Ok((None, parts[0])),
            2 => Ok((Some(parts[0].to_string()), parts[1])),
            _ => Err(Error::Parse(format!(
                "invalid snapshot name {raw:?}, expected zero or one '@'"
            ))),
        }
    }

    /// Clone this snapshot's identity, rebinding it to a new file system.
    pub fn with_file_system(&self, new_fs: &str) -> BackupSnapshot {
        BackupSnapshot {
            file_system_name: Some(normalize_fs(new_fs)),
            timestamp: self.timestamp.clone(),
            backupset_name: self.backupset_name.clone(),
            legacy_suffix: self.legacy_suffix.clone(),
        }
    }

    /// Clone this snapshot's identity with no file system bound.
    pub fn without_file_system(&self) -> BackupSnapshot {
        BackupSnapshot {
            file_system_name: None,
            timestamp: self.timestamp.clone(),
            backupset_name: self.backupset_name.clone(),
            legacy_suffix: self.legacy_suffix.clone(),
        }
    }

    /// Stamp a brand new snapshot at the current time, sleeping first to
    /// guarantee uniqueness across rapid successive calls.
    pub async fn create_current(
        backupset_name: &str,
        file_system: Option<&str>,
        clock: &dyn Clock,
    ) -> BackupSnapshot {
        clock.wait_for_unique_tick().await;
        let now = clock.now_gmt();
        BackupSnapshot {
            file_system_name: file_system.map(normalize_fs),
            timestamp: format_gmt(now),
            backupset_name: backupset_name.to_string(),
            legacy_suffix: None,
        }
    }

    /// Serialize without the file-system prefix; this is the identity used
    /// for common-ancestor comparisons.
    pub fn format_without_fs(&self) -> String {
        match &self.legacy_suffix {
            Some(suffix) => format!("{PREFIX}{}_{}_{}", self.timestamp, self.backupset_name, suffix),
            None => format!("{PREFIX}{}_{}", self.timestamp, self.backupset_name),
        }
    }

    /// Serialize with the file-system prefix, if any.
    pub fn format_with_fs(&self) -> String {
        match &self.file_system_name {
            Some(fs) => format!("{fs}@{}", self.format_without_fs()),
            None => self.format_without_fs(),
        }
    }
}

impl std::fmt::Display for BackupSnapshot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.format_with_fs())
    }
}

fn format_gmt(dt: DateTime<Utc>) -> String {
    dt.format("%Y-%m-%dT%H:%M:%S").to_string()
}

/// Collapse duplicate slashes and strip a trailing slash, without touching
/// the leading `/` if present (ZFS dataset names are generally un-rooted,
/// but this matches `os.path.normpath`'s behavior for our purposes).
fn normalize_fs(name: &str) -> String {
    let normalized = Path::new(name)
        .components()
        .collect::<std::path::PathBuf>();
    let s = normalized.to_string_lossy().to_string();
    if s.is_empty() {
        ".".to_string()
    } else {
        s
    }
}

/// A per-file-system, newest-first list of [`BackupSnapshot`]s. A struct
/// wrapping a `Vec`, not a subclass of one.
#[derive(Debug, Clone, Default)]
pub struct SnapshotList {
    snapshots: Vec<BackupSnapshot>,
}

impl SnapshotList {
    pub fn new(snapshots: Vec<BackupSnapshot>) -> SnapshotList {
        SnapshotList { snapshots }
    }

    /// Build from raw ZFS snapshot names, oldest to newest (as returned by
    /// `zfs list -s creation`). Non-`zipper_` names are dropped silently.
    pub fn from_zfs_snapshots_oldest_first<I, S>(names: I) -> Result<SnapshotList>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut snapshots = Vec::new();
        for name in names {
            let name = name.as_ref();
            if BackupSnapshot::is_ours(name) {
                snapshots.push(BackupSnapshot::parse(name)?);
            }
        }
        snapshots.reverse();
        Ok(SnapshotList { snapshots })
    }

    pub fn len(&self) -> usize {
        self.snapshots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.snapshots.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &BackupSnapshot> {
        self.snapshots.iter()
    }

    pub fn get(&self, idx: usize) -> Option<&BackupSnapshot> {
        self.snapshots.get(idx)
    }

    pub fn newest(&self) -> Option<&BackupSnapshot> {
        self.snapshots.first()
    }

    pub fn oldest(&self) -> Option<&BackupSnapshot> {
        self.snapshots.last()
    }

    /// Find the index of the snapshot whose file-system-less name matches.
    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.snapshots
            .iter()
            .position(|s| s.format_without_fs() == name)
    }

    pub fn find(&self, name: &str) -> Option<&BackupSnapshot> {
        self.index_of(name).map(|idx| &self.snapshots[idx])
    }

    /// Return the newest snapshot in `self` whose file-system-less name
    /// also occurs in `other`.
    pub fn find_newest_common<'a>(&'a self, other: &SnapshotList) -> Option<&'a BackupSnapshot> {
        self.snapshots
            .iter()
            .find(|s| other.find(&s.format_without_fs()).is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip_new_name() {
        let raw = "tank/a@zipper_2001-01-01T00:00:00_myset";
        let snap = BackupSnapshot::parse(raw).unwrap();
        assert_eq!(snap.format_with_fs(), raw);
        assert_eq!(snap.legacy_suffix, None);
    }

    #[test]
    fn round_trip_legacy_suffix() {
        let raw = "zipper_2001-01-01T00:00:00_myset_full";
        let snap = BackupSnapshot::parse(raw).unwrap();
        assert_eq!(snap.format_without_fs(), raw);
        assert_eq!(snap.legacy_suffix.as_deref(), Some("full"));
    }

    #[test]
    fn qualify_only_changes_fs() {
        let raw = "zipper_2001-01-01T00:00:00_myset";
        let unqualified = BackupSnapshot::parse(raw).unwrap();
        let qualified = unqualified.with_file_system("tank/a");
        assert_eq!(qualified.timestamp, unqualified.timestamp);
        assert_eq!(qualified.backupset_name, unqualified.backupset_name);
        assert_eq!(qualified.legacy_suffix, unqualified.legacy_suffix);
        assert_eq!(qualified.file_system_name.as_deref(), Some("tank/a"));
    }

    #[test]
    fn is_ours_detects_prefix_with_and_without_fs() {
        assert!(BackupSnapshot::is_ours(
            "tank/a@zipper_2001-01-01T00:00:00_set"
        ));
        assert!(BackupSnapshot::is_ours("zipper_2001-01-01T00:00:00_set"));
        assert!(!BackupSnapshot::is_ours("tank/a@manual-snap"));
    }

    #[test]
    fn rejects_bad_name() {
        assert!(BackupSnapshot::parse("tank/a@not_ours").is_err());
        assert!(BackupSnapshot::parse("a@b@c").is_err());
    }

    #[test]
    fn strays_are_dropped_by_snapshot_list() {
        let list = SnapshotList::from_zfs_snapshots_oldest_first([
            "manual-snap",
            "zipper_2001-01-01T00:00:00_set",
        ])
        .unwrap();
        assert_eq!(list.len(), 1);
    }

    #[test]
    fn snapshot_list_is_newest_first() {
        let list = SnapshotList::from_zfs_snapshots_oldest_first([
            "zipper_2001-01-01T00:00:00_set",
            "zipper_2002-01-01T00:00:00_set",
        ])
        .unwrap();
        assert_eq!(list.newest().unwrap().timestamp, "2002-01-01T00:00:00");
        assert_eq!(list.oldest().unwrap().timestamp, "2001-01-01T00:00:00");
    }

    #[test]
    fn find_newest_common_ignores_file_system() {
        let source = SnapshotList::from_zfs_snapshots_oldest_first([
            "a/b@zipper_2001-01-01T00:00:00_set",
            "a/b@zipper_2002-01-01T00:00:00_set",
        ])
        .unwrap();
        let backup = SnapshotList::from_zfs_snapshots_oldest_first([
            "poolX/a/b@zipper_2001-01-01T00:00:00_set",
        ])
        .unwrap();
        let common = source.find_newest_common(&backup).unwrap();
        assert_eq!(common.timestamp, "2001-01-01T00:00:00");
    }
}
