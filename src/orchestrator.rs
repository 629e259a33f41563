// SPDX-License-Identifier: Apache-2.0
//! The backup-set orchestrator (component C6): picks a pool from the
//! configured rotation, imports/exports it around the run, and drives one
//! `FsBackup` per source file system.

use crate::clock::Clock;
use crate::config::BackupSetConf;
use crate::error::{Error, Result};
use crate::planner::FsBackup;
use crate::recorder::Recorder;
use crate::snapshot::{BackupSnapshot, SnapshotList};
use crate::zfs::{Pool, ZfsDriver};

pub struct BackupSetOrchestrator<'a> {
    driver: &'a dyn ZfsDriver,
    recorder: &'a mut Recorder,
    clock: &'a dyn Clock,
    backup_set: &'a BackupSetConf,
    allow_degraded: bool,
}

struct ChosenPool {
    pool: Pool,
    needs_import: bool,
}

impl<'a> BackupSetOrchestrator<'a> {
    pub fn new(
        driver: &'a dyn ZfsDriver,
        recorder: &'a mut Recorder,
        clock: &'a dyn Clock,
        backup_set: &'a BackupSetConf,
        allow_degraded: bool,
    ) -> BackupSetOrchestrator<'a> {
        BackupSetOrchestrator {
            driver,
            recorder,
            clock,
            backup_set,
            allow_degraded,
        }
    }

    /// Full backup: select a pool, import it if needed, run every source
    /// file system (or the given subset) through the planner, then export
    /// the pool again if we were the one who imported it.
    pub async fn backup(&mut self, source_fs_subset: Option<&[String]>) -> Result<()> {
        let chosen = self.select_pool().await?;

        if chosen.needs_import {
            self.driver.import_pool(&chosen.pool.name).await?;
        }

        let run_result = self.run_file_systems(&chosen.pool.name, source_fs_subset).await;

        if chosen.needs_import {
            // Unconditional release, success or error, mirroring a
            // try/finally around the import. A failure here surfaces only
            // if the run itself otherwise succeeded, so a real backup
            // error is never masked by a subsequent export problem.
            let export_result = self.driver.export_pool(&chosen.pool.name, false).await;
            if run_result.is_ok() {
                export_result?;
            }
        }

        run_result
    }

    /// Seed source-side snapshots without touching any backup pool: used
    /// to prime a rotation member that is not yet plugged in.
    pub async fn snap_only(&mut self, source_fs_subset: Option<&[String]>) -> Result<()> {
        for fs in self.selected_file_systems(source_fs_subset) {
            let raw = self.driver.list_snapshots(&fs.name).await?;
            let existing =
                SnapshotList::from_zfs_snapshots_oldest_first(raw.iter().map(|s| s.full_name.as_str()))?;
            if existing.is_empty() {
                let snap =
                    BackupSnapshot::create_current(&self.backup_set.name, Some(&fs.name), self.clock)
                        .await;
                self.driver.create_snapshot(&snap.format_with_fs()).await?;
            }
        }
        Ok(())
    }

    async fn run_file_systems(
        &mut self,
        pool_name: &str,
        source_fs_subset: Option<&[String]>,
    ) -> Result<()> {
        for fs in self.selected_file_systems(source_fs_subset) {
            let backup_fs_name = self
                .backup_set
                .backup_pools
                .iter()
                .find(|p| p.name == pool_name)
                .expect("chosen pool is a member of this backup set's rotation")
                .determine_backup_file_system_name(&fs.name);

            let mut planner = FsBackup::new(
                self.driver,
                self.recorder,
                self.clock,
                &self.backup_set.name,
                pool_name,
                &fs.name,
                &backup_fs_name,
            )
            .await?;
            planner.backup().await?;
        }
        Ok(())
    }

    fn selected_file_systems(
        &self,
        subset: Option<&[String]>,
    ) -> Vec<crate::config::SourceFileSystemConf> {
        match subset {
            None => self.backup_set.source_file_systems.clone(),
            Some(names) => self
                .backup_set
                .source_file_systems
                .iter()
                .filter(|fs| names.iter().any(|n| n == &fs.name))
                .cloned()
                .collect(),
        }
    }

    async fn select_pool(&self) -> Result<ChosenPool> {
        let rotation = self.backup_set.backup_pool_names();

        let imported = self.usable_pools(self.driver.list_pools().await?, &rotation);
        let (candidates, needs_import) = if !imported.is_empty() {
            (imported, false)
        } else {
            let exported = self.usable_pools(self.driver.list_exported_pools().await?, &rotation);
            (exported, true)
        };

        match candidates.len() {
            0 => Err(Error::NoPoolAvailable {
                backup_set: self.backup_set.name.clone(),
                pools: rotation,
            }),
            1 => {
                let pool = candidates.into_iter().next().unwrap();
                if matches!(pool.health, crate::zfs::PoolHealth::Degraded) && !self.allow_degraded {
                    return Err(Error::PoolDegraded {
                        backup_set: self.backup_set.name.clone(),
                        pool: pool.name,
                    });
                }
                Ok(ChosenPool { pool, needs_import })
            }
            _ => Err(Error::AmbiguousPool {
                backup_set: self.backup_set.name.clone(),
                pools: candidates.into_iter().map(|p| p.name).collect(),
            }),
        }
    }

    fn usable_pools(&self, pools: Vec<Pool>, rotation: &[String]) -> Vec<Pool> {
        pools
            .into_iter()
            .filter(|p| rotation.contains(&p.name) && p.health.is_usable())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::TestClock;
    use crate::config::BackupSetConf;
    use crate::zfs::{FileSystem, PoolHealth, SendInfo, Snapshot};
    use async_trait::async_trait;
    use chrono::{TimeZone, Utc};
    use tempfile::tempdir;

    struct PoolOnlyDriver {
        imported: Vec<Pool>,
        exported: Vec<Pool>,
    }

    #[async_trait]
    impl ZfsDriver for PoolOnlyDriver {
        async fn list_pools(&self) -> Result<Vec<Pool>> {
            Ok(self.imported.clone())
        }

        async fn list_exported_pools(&self) -> Result<Vec<Pool>> {
            Ok(self.exported.clone())
        }

        async fn import_pool(&self, _name: &str) -> Result<()> {
            Ok(())
        }

        async fn export_pool(&self, _name: &str, _force: bool) -> Result<()> {
            Ok(())
        }

        async fn find_file_system(&self, _name: &str) -> Result<Option<FileSystem>> {
            Ok(None)
        }

        async fn list_file_systems(&self, _pool: &str) -> Result<Vec<FileSystem>> {
            Ok(vec![])
        }

        async fn create_file_system(&self, _name: &str) -> Result<()> {
            Ok(())
        }

        async fn list_snapshots(&self, _fs_name: &str) -> Result<Vec<Snapshot>> {
            Ok(vec![])
        }

        async fn create_snapshot(&self, _full_name: &str) -> Result<()> {
            Ok(())
        }

        async fn destroy_snapshot(&self, _full_name: &str) -> Result<()> {
            Ok(())
        }

        async fn rename_snapshot(&self, _old: &str, _new: &str) -> Result<()> {
            Ok(())
        }

        async fn send_recv_full(&self, _src_snap: &str, _dst_snap: &str) -> Result<SendInfo> {
            Ok(SendInfo { size: 0 })
        }

        async fn send_recv_incr(
            &self,
            _base_snap: &str,
            _src_snap: &str,
            _dst_snap: &str,
        ) -> Result<SendInfo> {
            Ok(SendInfo { size: 0 })
        }
    }

    fn pool(name: &str, health: PoolHealth, imported: bool) -> Pool {
        Pool {
            name: name.to_string(),
            health,
            imported,
        }
    }

    fn two_pool_set() -> BackupSetConf {
        BackupSetConf::new(
            "set",
            vec!["tank/fs1".to_string()],
            vec!["bp1".to_string(), "bp2".to_string()],
        )
        .unwrap()
    }

    async fn select(driver: &PoolOnlyDriver, set: &BackupSetConf, allow_degraded: bool) -> Result<()> {
        let clock = TestClock::new(Utc.timestamp_opt(0, 0).unwrap());
        let dir = tempdir().unwrap();
        let mut recorder = Recorder::open(dir.path().join("rec.tsv")).unwrap();
        let mut orch = BackupSetOrchestrator::new(driver, &mut recorder, &clock, set, allow_degraded);
        orch.select_pool().await.map(|_| ())
    }

    #[tokio::test]
    async fn imported_pool_is_preferred_over_exported() {
        let driver = PoolOnlyDriver {
            imported: vec![pool("bp1", PoolHealth::Online, true)],
            exported: vec![pool("bp2", PoolHealth::Online, false)],
        };
        let set = two_pool_set();
        let clock = TestClock::new(Utc.timestamp_opt(0, 0).unwrap());
        let dir = tempdir().unwrap();
        let mut recorder = Recorder::open(dir.path().join("rec.tsv")).unwrap();
        let orch = BackupSetOrchestrator::new(&driver, &mut recorder, &clock, &set, false);
        let chosen = orch.select_pool().await.unwrap();
        assert_eq!(chosen.pool.name, "bp1");
        assert!(!chosen.needs_import);
    }

    #[tokio::test]
    async fn falls_back_to_exported_when_none_imported() {
        let driver = PoolOnlyDriver {
            imported: vec![],
            exported: vec![pool("bp2", PoolHealth::Online, false)],
        };
        let set = two_pool_set();
        let clock = TestClock::new(Utc.timestamp_opt(0, 0).unwrap());
        let dir = tempdir().unwrap();
        let mut recorder = Recorder::open(dir.path().join("rec.tsv")).unwrap();
        let orch = BackupSetOrchestrator::new(&driver, &mut recorder, &clock, &set, false);
        let chosen = orch.select_pool().await.unwrap();
        assert_eq!(chosen.pool.name, "bp2");
        assert!(chosen.needs_import);
    }

    #[tokio::test]
    async fn two_imported_pools_are_ambiguous() {
        let driver = PoolOnlyDriver {
            imported: vec![
                pool("bp1", PoolHealth::Online, true),
                pool("bp2", PoolHealth::Online, true),
            ],
            exported: vec![],
        };
        let set = two_pool_set();
        let err = select(&driver, &set, false).await.unwrap_err();
        assert!(matches!(err, Error::AmbiguousPool { .. }));
    }

    #[tokio::test]
    async fn degraded_pool_rejected_without_allow_degraded() {
        let driver = PoolOnlyDriver {
            imported: vec![pool("bp1", PoolHealth::Degraded, true)],
            exported: vec![],
        };
        let set = two_pool_set();
        let err = select(&driver, &set, false).await.unwrap_err();
        assert!(matches!(err, Error::PoolDegraded { .. }));
    }

    #[tokio::test]
    async fn degraded_pool_accepted_with_allow_degraded() {
        let driver = PoolOnlyDriver {
            imported: vec![pool("bp1", PoolHealth::Degraded, true)],
            exported: vec![],
        };
        let set = two_pool_set();
        assert!(select(&driver, &set, true).await.is_ok());
    }

    #[tokio::test]
    async fn zero_pools_is_fatal() {
        let driver = PoolOnlyDriver {
            imported: vec![],
            exported: vec![],
        };
        let set = two_pool_set();
        let err = select(&driver, &set, false).await.unwrap_err();
        assert!(matches!(err, Error::NoPoolAvailable { .. }));
    }
}
