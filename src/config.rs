// SPDX-License-Identifier: Apache-2.0
//! Configuration model (component C4) and YAML loading (§4.5).

use crate::error::{Error, Result};
use chrono::Utc;
use serde::Deserialize;
use std::collections::HashSet;
use std::fs::File;
use std::path::{Path, PathBuf};

/// A source dataset identifier. Immutable; path-normalized at construction.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SourceFileSystemConf {
    pub name: String,
}

impl SourceFileSystemConf {
    pub fn new(name: &str) -> SourceFileSystemConf {
        SourceFileSystemConf {
            name: normalize(name),
        }
    }
}

/// Configuration of one removable backup pool.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BackupPoolConf {
    pub name: String,
}

impl BackupPoolConf {
    pub fn new(name: &str) -> BackupPoolConf {
        BackupPoolConf {
            name: name.to_string(),
        }
    }

    /// The mirror file-system name on this pool for a given source file
    /// system: `<poolName>/<sourceFsName>`, path-normalized.
    pub fn determine_backup_file_system_name(&self, source_fs_name: &str) -> String {
        normalize(&format!("{}/{}", self.name, source_fs_name))
    }
}

/// A named group binding source file systems to a pool rotation.
#[derive(Debug, Clone)]
pub struct BackupSetConf {
    pub name: String,
    pub source_file_systems: Vec<SourceFileSystemConf>,
    pub backup_pools: Vec<BackupPoolConf>,
}

impl BackupSetConf {
    pub fn new(
        name: &str,
        source_file_systems: Vec<String>,
        backup_pools: Vec<String>,
    ) -> Result<BackupSetConf> {
        if name.is_empty() || !name.chars().all(|c| c.is_ascii_alphanumeric()) {
            return Err(Error::Config(format!(
                "backup set name must be non-empty and alphanumeric, got {name:?}"
            )));
        }

        let mut seen_fs = HashSet::new();
        let mut fs_confs = Vec::with_capacity(source_file_systems.len());
        for fs in source_file_systems {
            let conf = SourceFileSystemConf::new(&fs);
            if !seen_fs.insert(conf.name.clone()) {
                return Err(Error::Config(format!(
                    "duplicate source file system {:?} in backup set {name:?}",
                    conf.name
                )));
            }
            fs_confs.push(conf);
        }

        let mut seen_pool = HashSet::new();
        let mut pool_confs = Vec::with_capacity(backup_pools.len());
        for pool in backup_pools {
            if !seen_pool.insert(pool.clone()) {
                return Err(Error::Config(format!(
                    "duplicate backup pool {pool:?} in backup set {name:?}"
                )));
            }
            pool_confs.push(BackupPoolConf::new(&pool));
        }

        if pool_confs.is_empty() {
            return Err(Error::Config(format!(
                "backup set {name:?} has no backup pools"
            )));
        }

        Ok(BackupSetConf {
            name: name.to_string(),
            source_file_systems: fs_confs,
            backup_pools: pool_confs,
        })
    }

    pub fn backup_pool_names(&self) -> Vec<String> {
        self.backup_pools.iter().map(|p| p.name.clone()).collect()
    }

    pub fn get_source_file_system(&self, name: &str) -> Option<&SourceFileSystemConf> {
        let normalized = normalize(name);
        self.source_file_systems
            .iter()
            .find(|fs| fs.name == normalized)
    }
}

/// Top-level configuration.
#[derive(Debug, Clone)]
pub struct BackupConf {
    pub backup_sets: Vec<BackupSetConf>,
    pub lock_file: PathBuf,
    pub record_file: PathBuf,
    pub allow_degraded: bool,
}

impl BackupConf {
    pub fn get_backup_set(&self, name: &str) -> Result<&BackupSetConf> {
        self.backup_sets
            .iter()
            .find(|s| s.name == name)
            .ok_or_else(|| Error::Config(format!("unknown backup set: {name:?}")))
    }

    /// Load and validate from a YAML file at `path`.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<BackupConf> {
        let file = File::open(path.as_ref())
            .map_err(|e| Error::Config(format!("cannot open {:?}: {e}", path.as_ref())))?;
        let wire: ConfigFile = serde_yaml::from_reader(file)
            .map_err(|e| Error::Config(format!("invalid configuration: {e}")))?;
        wire.into_domain()
    }
}

/// Plain deserialization target; distinct from the validated domain
/// structs above so a YAML syntax error and an invariant violation are
/// both reported as `Error::Config` but never leave partially-validated
/// domain state behind.
#[derive(Debug, Deserialize)]
struct ConfigFile {
    #[serde(rename = "lockFile", default = "default_lock_file")]
    lock_file: String,
    #[serde(rename = "recordFilePattern")]
    record_file_pattern: String,
    #[serde(rename = "allowDegraded", default)]
    allow_degraded: bool,
    #[serde(rename = "backupSets")]
    backup_sets: Vec<WireBackupSet>,
}

fn default_lock_file() -> String {
    "/var/run/zipper.lock".to_string()
}

#[derive(Debug, Deserialize)]
struct WireBackupSet {
    name: String,
    #[serde(rename = "sourceFileSystems")]
    source_file_systems: Vec<String>,
    #[serde(rename = "backupPools")]
    backup_pools: Vec<String>,
}

impl ConfigFile {
    fn into_domain(self) -> Result<BackupConf> {
        if self.backup_sets.is_empty() {
            return Err(Error::Config("configuration has no backup sets".into()));
        }

        let mut seen_names = HashSet::new();
        let mut backup_sets = Vec::with_capacity(self.backup_sets.len());
        for wire in self.backup_sets {
            if !seen_names.insert(wire.name.clone()) {
                return Err(Error::Config(format!(
                    "duplicate backup set name: {:?}",
                    wire.name
                )));
            }
            backup_sets.push(BackupSetConf::new(
                &wire.name,
                wire.source_file_systems,
                wire.backup_pools,
            )?);
        }

        let record_file = Utc::now().format(&self.record_file_pattern).to_string();

        Ok(BackupConf {
            backup_sets,
            lock_file: PathBuf::from(self.lock_file),
            record_file: PathBuf::from(record_file),
            allow_degraded: self.allow_degraded,
        })
    }
}

fn normalize(name: &str) -> String {
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

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backup_pool_derives_mirror_name() {
        let pool = BackupPoolConf::new("bp1");
        assert_eq!(
            pool.determine_backup_file_system_name("tank/home"),
            "bp1/tank/home"
        );
    }

    #[test]
    fn rejects_non_alphanumeric_set_name() {
        assert!(BackupSetConf::new("home_set", vec!["tank/a".into()], vec!["bp1".into()]).is_err());
    }

    #[test]
    fn rejects_duplicate_source_fs() {
        let err = BackupSetConf::new(
            "home",
            vec!["tank/a".into(), "tank/a".into()],
            vec!["bp1".into()],
        )
        .unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn rejects_duplicate_pool() {
        let err = BackupSetConf::new(
            "home",
            vec!["tank/a".into()],
            vec!["bp1".into(), "bp1".into()],
        )
        .unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn loads_minimal_yaml() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("conf.yaml");
        std::fs::write(
            &path,
            r#"
lockFile: /tmp/zipper.lock
recordFilePattern: "/tmp/zipper-%Y.tsv"
backupSets:
  - name: home
    sourceFileSystems: [tank/home]
    backupPools: [bp1, bp2]
"#,
        )
        .unwrap();

        let conf = BackupConf::load(&path).unwrap();
        assert_eq!(conf.backup_sets.len(), 1);
        assert_eq!(conf.backup_sets[0].name, "home");
        assert_eq!(conf.backup_sets[0].backup_pool_names(), vec!["bp1", "bp2"]);
        assert!(!conf.allow_degraded);
    }

    #[test]
    fn rejects_empty_backup_sets() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("conf.yaml");
        std::fs::write(
            &path,
            r#"
recordFilePattern: "/tmp/zipper-%Y.tsv"
backupSets: []
"#,
        )
        .unwrap();
        assert!(BackupConf::load(&path).is_err());
    }
}
