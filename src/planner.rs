// SPDX-License-Identifier: Apache-2.0
//! The per-file-system backup planner (component C5): decides and executes
//! the full/incremental send sequence that brings one backup file system
//! up to date with its source.

use crate::clock::Clock;
use crate::error::{Error, Result};
use crate::recorder::{Record, Recorder};
use crate::snapshot::{BackupSnapshot, SnapshotList};
use crate::zfs::ZfsDriver;

const TMP_SUFFIX: &str = ".tmp";

/// Plans and runs the backup of one source file system onto one chosen
/// backup pool (or, with no pool, just maintains the source-side snapshot
/// chain; see `Orchestrator::snap_only`).
pub struct FsBackup<'a> {
    driver: &'a dyn ZfsDriver,
    recorder: &'a mut Recorder,
    clock: &'a dyn Clock,
    backup_set: &'a str,
    backup_pool: &'a str,
    source_fs: String,
    backup_fs: String,
}

impl<'a> FsBackup<'a> {
    /// Materializes the destination dataset (creating it with intermediate
    /// parents if absent) and constructs a planner ready to run.
    pub async fn new(
        driver: &'a dyn ZfsDriver,
        recorder: &'a mut Recorder,
        clock: &'a dyn Clock,
        backup_set: &'a str,
        backup_pool: &'a str,
        source_fs: &str,
        backup_fs: &str,
    ) -> Result<FsBackup<'a>> {
        if driver.find_file_system(backup_fs).await?.is_none() {
            driver.create_file_system(backup_fs).await?;
        }

        Ok(FsBackup {
            driver,
            recorder,
            clock,
            backup_set,
            backup_pool,
            source_fs: source_fs.to_string(),
            backup_fs: backup_fs.to_string(),
        })
    }

    /// Run the full plan: orphan `.tmp` recovery, then exactly one of
    /// P1/P2/P3. On any error, records an `error` row naming this file
    /// system and re-raises the same error value.
    pub async fn backup(&mut self) -> Result<()> {
        let now = self.now_str();
        match self.backup_inner().await {
            Ok(()) => Ok(()),
            Err(err) => {
                self.recorder.record_error(
                    &now,
                    self.backup_set,
                    self.backup_pool,
                    &err.to_string(),
                    &self.source_fs,
                    "",
                    "",
                )?;
                Err(err)
            }
        }
    }

    async fn backup_inner(&mut self) -> Result<()> {
        self.recover_orphans().await?;

        let source = self.source_snapshots().await?;
        let backup = self.backup_snapshots().await?;

        if source.is_empty() {
            // P1: pristine source.
            let new_snap = self.create_source_snapshot().await?;
            self.full_send(&new_snap).await?;
            return Ok(());
        }

        match source.find_newest_common(&backup) {
            None => {
                // P2: no common ancestor; full-send the oldest source
                // snapshot, then catch up from it.
                let oldest = source
                    .oldest()
                    .expect("non-empty source list has an oldest element")
                    .clone();
                self.full_send(&oldest).await?;
                self.catch_up(&source, &oldest).await?;
                self.stamp_new_incremental(&source).await?;
            }
            Some(common) => {
                // P3: catch up from the common ancestor, then stamp and
                // send one more incremental from the latest source
                // snapshot at the time catch-up began.
                let common = common.clone();
                self.catch_up(&source, &common).await?;
                self.stamp_new_incremental(&source).await?;
            }
        }

        Ok(())
    }

    /// P4 subroutine: incrementally send every source snapshot strictly
    /// newer than `reference`, oldest to newest, chaining each off the
    /// previous one.
    async fn catch_up(&mut self, source: &SnapshotList, reference: &BackupSnapshot) -> Result<()> {
        let ref_name = reference.format_without_fs();
        let idx = source
            .index_of(&ref_name)
            .ok_or_else(|| Error::State(format!("reference snapshot {ref_name} vanished from source list")))?;

        // source is newest-first; everything with a lower index is newer
        // than `reference`. Walk oldest-to-newest for chaining.
        let mut newer: Vec<&BackupSnapshot> = (0..idx).map(|i| source.get(i).unwrap()).collect();
        newer.reverse();

        let mut prev = reference.clone();
        for snap in newer {
            self.incremental_send(&prev, snap).await?;
            prev = snap.clone();
        }
        Ok(())
    }

    /// Stamp a fresh source snapshot and send it incrementally based on the
    /// newest source snapshot that existed before the stamp.
    async fn stamp_new_incremental(&mut self, source_before: &SnapshotList) -> Result<()> {
        let prev = source_before
            .newest()
            .expect("source has at least one snapshot by the time a new one is stamped")
            .clone();
        let new_snap = self.create_source_snapshot().await?;
        self.incremental_send(&prev, &new_snap).await?;
        Ok(())
    }

    /// Orphan `.tmp` names never match the snapshot-name regex (it has no
    /// `.tmp` allowance), so this scans the raw, unparsed snapshot list
    /// directly rather than going through `SnapshotList`, which would
    /// otherwise reject them before they could be cleaned up. Scoped to our
    /// own `zipper_`-prefixed snapshots so an unrelated `.tmp`-suffixed
    /// snapshot a user left on the same dataset is never touched.
    async fn recover_orphans(&mut self) -> Result<()> {
        let raw = self.driver.list_snapshots(&self.backup_fs).await?;
        for snap in raw {
            if snap.full_name.ends_with(TMP_SUFFIX) && BackupSnapshot::is_ours(&snap.full_name) {
                self.driver
                    .destroy_snapshot(&snap.full_name)
                    .await
                    .map_err(|e| {
                        Error::State(format!("failed to destroy orphan {}: {e}", snap.full_name))
                    })?;
                let now = self.now_str();
                self.recorder.record(
                    &now,
                    &Record {
                        backup_set: self.backup_set,
                        backup_pool: self.backup_pool,
                        action: "destroytmp",
                        backup_snap: &snap.full_name,
                        ..Default::default()
                    },
                )?;
            }
        }
        Ok(())
    }

    async fn source_snapshots(&self) -> Result<SnapshotList> {
        let raw = self.driver.list_snapshots(&self.source_fs).await?;
        SnapshotList::from_zfs_snapshots_oldest_first(raw.iter().map(|s| s.full_name.as_str()))
    }

    async fn backup_snapshots(&self) -> Result<SnapshotList> {
        let raw = self.driver.list_snapshots(&self.backup_fs).await?;
        SnapshotList::from_zfs_snapshots_oldest_first(raw.iter().map(|s| s.full_name.as_str()))
    }

    async fn create_source_snapshot(&mut self) -> Result<BackupSnapshot> {
        let snap =
            BackupSnapshot::create_current(self.backup_set, Some(&self.source_fs), self.clock)
                .await;
        self.driver.create_snapshot(&snap.format_with_fs()).await?;
        Ok(snap)
    }

    /// Send `snap` (a source-side snapshot) to the backup pool as a full
    /// stream, via the atomic temp-name/rename receive protocol.
    async fn full_send(&mut self, snap: &BackupSnapshot) -> Result<()> {
        let backup_snap = snap.with_file_system(&self.backup_fs);
        let final_name = backup_snap.format_with_fs();
        let tmp_name = format!("{final_name}{TMP_SUFFIX}");

        let info = self
            .driver
            .send_recv_full(&snap.format_with_fs(), &tmp_name)
            .await?;
        self.driver.rename_snapshot(&tmp_name, &final_name).await?;

        let now = self.now_str();
        self.recorder.record(
            &now,
            &Record {
                backup_set: self.backup_set,
                backup_pool: self.backup_pool,
                action: "full",
                src1_snap: &snap.format_with_fs(),
                backup_snap: &final_name,
                size: &info.size.to_string(),
                ..Default::default()
            },
        )?;
        Ok(())
    }

    /// Send the delta from `base` (already present on the backup) to `src`
    /// (a newer source snapshot), via the same temp-name/rename protocol.
    async fn incremental_send(&mut self, base: &BackupSnapshot, src: &BackupSnapshot) -> Result<()> {
        let backup_snap = src.with_file_system(&self.backup_fs);
        let final_name = backup_snap.format_with_fs();
        let tmp_name = format!("{final_name}{TMP_SUFFIX}");
        let base_backup = base.with_file_system(&self.backup_fs);

        let info = self
            .driver
            .send_recv_incr(
                &base_backup.format_with_fs(),
                &src.format_with_fs(),
                &tmp_name,
            )
            .await?;
        self.driver.rename_snapshot(&tmp_name, &final_name).await?;

        let now = self.now_str();
        self.recorder.record(
            &now,
            &Record {
                backup_set: self.backup_set,
                backup_pool: self.backup_pool,
                action: "incr",
                src1_snap: &base.format_with_fs(),
                src2_snap: &src.format_with_fs(),
                backup_snap: &final_name,
                size: &info.size.to_string(),
                ..Default::default()
            },
        )?;
        Ok(())
    }

    fn now_str(&self) -> String {
        self.clock.now_gmt().format("%Y-%m-%dT%H:%M:%S").to_string()
    }
}
