// SPDX-License-Identifier: Apache-2.0
//! The ZFS driver (component C1): a minimal capability boundary over the
//! `zpool`/`zfs` CLIs, expressed as an async trait so the planner and
//! orchestrator can be driven against a fake in tests.

use crate::error::{Error, Result};
use async_trait::async_trait;
use std::io::Read;
use std::process::{Command as StdCommand, ExitStatus, Stdio as StdStdio};
use tempfile::NamedTempFile;
use tokio::process::Command;
use tokio::task;

const ZFS: &str = "zfs";
const ZPOOL: &str = "zpool";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolHealth {
    Online,
    Degraded,
    Faulted,
    Offline,
    Removed,
    Unavail,
}

impl PoolHealth {
    fn parse(s: &str) -> Result<PoolHealth> {
        match s {
            "ONLINE" => Ok(PoolHealth::Online),
            "DEGRADED" => Ok(PoolHealth::Degraded),
            "FAULTED" => Ok(PoolHealth::Faulted),
            "OFFLINE" => Ok(PoolHealth::Offline),
            "REMOVED" => Ok(PoolHealth::Removed),
            "UNAVAIL" => Ok(PoolHealth::Unavail),
            other => Err(Error::Parse(format!("unknown pool health: {other:?}"))),
        }
    }

    pub fn is_usable(&self) -> bool {
        matches!(self, PoolHealth::Online | PoolHealth::Degraded)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pool {
    pub name: String,
    pub health: PoolHealth,
    pub imported: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileSystem {
    pub name: String,
    pub mountpoint: Option<String>,
    pub mounted: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Snapshot {
    pub full_name: String,
    pub file_system: String,
    pub snap_name: String,
}

/// The parsed `zfs send -P` descriptor: row 0 carries the operation kind
/// and arguments, row 1 (`size <n>`) the estimated byte count.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SendInfo {
    pub size: u64,
}

impl SendInfo {
    pub fn parse_full(stderr: &str) -> Result<SendInfo> {
        let rows = parse_p_rows(stderr)?;
        let first = rows
            .first()
            .ok_or_else(|| Error::Parse("empty send -P output".into()))?;
        if first.first().map(String::as_str) != Some("full") {
            return Err(Error::Parse(format!(
                "expected full send descriptor, got {first:?}"
            )));
        }
        Ok(SendInfo {
            size: size_row(&rows)?,
        })
    }

    pub fn parse_incr(stderr: &str) -> Result<SendInfo> {
        let rows = parse_p_rows(stderr)?;
        let first = rows
            .first()
            .ok_or_else(|| Error::Parse("empty send -P output".into()))?;
        if first.first().map(String::as_str) != Some("incremental") {
            return Err(Error::Parse(format!(
                "expected incremental send descriptor, got {first:?}"
            )));
        }
        if first.len() != 3 && first.len() != 4 {
            return Err(Error::Parse(format!(
                "incremental descriptor has unexpected column count: {first:?}"
            )));
        }
        Ok(SendInfo {
            size: size_row(&rows)?,
        })
    }
}

fn parse_p_rows(stderr: &str) -> Result<Vec<Vec<String>>> {
    Ok(stderr
        .lines()
        .map(|line| line.split('\t').map(str::to_string).collect())
        .collect())
}

fn size_row(rows: &[Vec<String>]) -> Result<u64> {
    let row = rows
        .get(1)
        .ok_or_else(|| Error::Parse("missing size row in send -P output".into()))?;
    if row.first().map(String::as_str) != Some("size") {
        return Err(Error::Parse(format!("expected size row, got {row:?}")));
    }
    row.get(1)
        .ok_or_else(|| Error::Parse("size row missing value".into()))?
        .parse()
        .map_err(|_| Error::Parse(format!("non-numeric size in {row:?}")))
}

/// Capability boundary over the `zpool`/`zfs` CLIs.
#[async_trait]
pub trait ZfsDriver: Send + Sync {
    async fn list_pools(&self) -> Result<Vec<Pool>>;
    async fn list_exported_pools(&self) -> Result<Vec<Pool>>;

    async fn find_pool(&self, name: &str) -> Result<Option<Pool>> {
        for pool in self.list_pools().await? {
            if pool.name == name {
                return Ok(Some(pool));
            }
        }
        for pool in self.list_exported_pools().await? {
            if pool.name == name {
                return Ok(Some(pool));
            }
        }
        Ok(None)
    }

    async fn import_pool(&self, name: &str) -> Result<()>;
    async fn export_pool(&self, name: &str, force: bool) -> Result<()>;

    async fn find_file_system(&self, name: &str) -> Result<Option<FileSystem>>;
    async fn list_file_systems(&self, pool: &str) -> Result<Vec<FileSystem>>;
    async fn create_file_system(&self, name: &str) -> Result<()>;

    /// Ordered oldest-to-newest by creation time.
    async fn list_snapshots(&self, fs_name: &str) -> Result<Vec<Snapshot>>;
    async fn create_snapshot(&self, full_name: &str) -> Result<()>;
    async fn destroy_snapshot(&self, full_name: &str) -> Result<()>;
    async fn rename_snapshot(&self, old: &str, new: &str) -> Result<()>;

    async fn send_recv_full(&self, src_snap: &str, dst_snap: &str) -> Result<SendInfo>;
    async fn send_recv_incr(
        &self,
        base_snap: &str,
        src_snap: &str,
        dst_snap: &str,
    ) -> Result<SendInfo>;
}

/// Real implementation, backed by subprocesses.
#[derive(Debug, Default, Clone)]
pub struct RealZfsDriver;

impl RealZfsDriver {
    pub fn new() -> RealZfsDriver {
        RealZfsDriver
    }

    async fn run(&self, argv: &[&str]) -> Result<String> {
        let out = Command::new(argv[0])
            .args(&argv[1..])
            .stdin(StdStdio::null())
            .output()
            .await?;
        if !out.status.success() {
            return Err(Error::ZfsCommand {
                argv: argv.iter().map(|s| s.to_string()).collect(),
                status: Some(out.status),
                stderr: String::from_utf8_lossy(&out.stderr).into_owned(),
            });
        }
        Ok(String::from_utf8_lossy(&out.stdout).into_owned())
    }

    async fn status_only(&self, argv: &[&str]) -> Result<()> {
        let status = Command::new(argv[0])
            .args(&argv[1..])
            .stdin(StdStdio::null())
            .stdout(StdStdio::null())
            .stderr(StdStdio::piped())
            .spawn()?
            .wait_with_output()
            .await?;
        if !status.status.success() {
            return Err(Error::ZfsCommand {
                argv: argv.iter().map(|s| s.to_string()).collect(),
                status: Some(status.status),
                stderr: String::from_utf8_lossy(&status.stderr).into_owned(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl ZfsDriver for RealZfsDriver {
    async fn list_pools(&self) -> Result<Vec<Pool>> {
        let out = self
            .run(&[ZPOOL, "list", "-H", "-o", "name,health"])
            .await?;
        let mut pools = Vec::new();
        for line in out.lines() {
            let fields: Vec<&str> = line.split('\t').collect();
            if fields.len() != 2 {
                return Err(Error::Parse(format!(
                    "unexpected `zpool list` line: {line:?}"
                )));
            }
            pools.push(Pool {
                name: fields[0].to_string(),
                health: PoolHealth::parse(fields[1])?,
                imported: true,
            });
        }
        Ok(pools)
    }

    async fn list_exported_pools(&self) -> Result<Vec<Pool>> {
        let out = self.run(&[ZPOOL, "import"]).await.or_else(|err| match err {
            Error::ZfsCommand { stderr, .. } if stderr.contains("no pools available") => {
                Ok(String::new())
            }
            other => Err(other),
        })?;

        let mut pools = Vec::new();
        let mut name: Option<String> = None;
        for line in out.lines() {
            let trimmed = line.trim();
            if let Some(rest) = trimmed.strip_prefix("pool:") {
                if let Some(n) = name.take() {
                    return Err(Error::Parse(format!(
                        "`zpool import` stanza for {n:?} missing a state: line"
                    )));
                }
                name = Some(rest.trim().to_string());
            } else if let Some(rest) = trimmed.strip_prefix("state:") {
                let n = name.take().ok_or_else(|| {
                    Error::Parse("`zpool import` state: line with no preceding pool:".into())
                })?;
                pools.push(Pool {
                    name: n,
                    health: PoolHealth::parse(rest.trim())?,
                    imported: false,
                });
            }
        }
        Ok(pools)
    }

    async fn import_pool(&self, name: &str) -> Result<()> {
        self.status_only(&[ZPOOL, "import", name]).await
    }

    async fn export_pool(&self, name: &str, force: bool) -> Result<()> {
        if force {
            self.status_only(&[ZPOOL, "export", "-f", name]).await
        } else {
            self.status_only(&[ZPOOL, "export", name]).await
        }
    }

    async fn find_file_system(&self, name: &str) -> Result<Option<FileSystem>> {
        let pool = name.split('/').next().unwrap_or(name);
        let systems = self.list_file_systems(pool).await?;
        Ok(systems.into_iter().find(|fs| fs.name == name))
    }

    async fn list_file_systems(&self, pool: &str) -> Result<Vec<FileSystem>> {
        let out = self
            .run(&[
                ZFS,
                "list",
                "-Hr",
                "-t",
                "filesystem",
                "-o",
                "name,mountpoint,mounted",
                pool,
            ])
            .await?;
        let mut systems = Vec::new();
        for line in out.lines() {
            let fields: Vec<&str> = line.split('\t').collect();
            if fields.len() != 3 {
                return Err(Error::Parse(format!("unexpected `zfs list` line: {line:?}")));
            }
            let mountpoint = if fields[1] == "-" {
                None
            } else {
                Some(fields[1].to_string())
            };
            systems.push(FileSystem {
                name: fields[0].to_string(),
                mountpoint,
                mounted: fields[2] == "yes",
            });
        }
        Ok(systems)
    }

    async fn create_file_system(&self, name: &str) -> Result<()> {
        self.status_only(&[ZFS, "create", "-p", name]).await
    }

    async fn list_snapshots(&self, fs_name: &str) -> Result<Vec<Snapshot>> {
        let out = self
            .run(&[
                ZFS, "list", "-Hd", "1", "-t", "snapshot", "-o", "name", "-s", "creation", fs_name,
            ])
            .await?;
        let mut snaps = Vec::new();
        for line in out.lines() {
            let (fs, snap) = line.split_once('@').ok_or_else(|| {
                Error::Parse(format!("snapshot name missing '@': {line:?}"))
            })?;
            snaps.push(Snapshot {
                full_name: line.to_string(),
                file_system: fs.to_string(),
                snap_name: snap.to_string(),
            });
        }
        Ok(snaps)
    }

    async fn create_snapshot(&self, full_name: &str) -> Result<()> {
        self.status_only(&[ZFS, "snapshot", full_name]).await
    }

    async fn destroy_snapshot(&self, full_name: &str) -> Result<()> {
        self.status_only(&[ZFS, "destroy", "-fp", full_name]).await
    }

    async fn rename_snapshot(&self, old: &str, new: &str) -> Result<()> {
        self.status_only(&[ZFS, "rename", old, new]).await
    }

    async fn send_recv_full(&self, src_snap: &str, dst_snap: &str) -> Result<SendInfo> {
        let stderr = run_pipeline(
            &[ZFS, "send", "-P", src_snap],
            &[ZFS, "receive", "-F", dst_snap],
        )
        .await?;
        SendInfo::parse_full(&stderr)
    }

    async fn send_recv_incr(
        &self,
        base_snap: &str,
        src_snap: &str,
        dst_snap: &str,
    ) -> Result<SendInfo> {
        let stderr = run_pipeline(
            &[ZFS, "send", "-P", "-i", base_snap, src_snap],
            &[ZFS, "receive", dst_snap],
        )
        .await?;
        SendInfo::parse_incr(&stderr)
    }
}

/// Run `send_argv | recv_argv`, capturing each side's stderr to a temp file
/// (matching the original `cmdrunner.AsyncProc` one-temp-file-per-child
/// design) and returning the sender's stderr (the `send -P` descriptor) on
/// success. The sender's piped stdout is moved directly into the receiver's
/// stdin, single-owner handoff, so the parent holds no lingering copy and a
/// `SIGPIPE` can propagate if the receiver exits early. Both children are
/// always waited, never left as zombies. The actual spawn/wait is blocking
/// `std::process` work, run on a blocking task so the async driver
/// interface never blocks the runtime.
async fn run_pipeline(send_argv: &[&str], recv_argv: &[&str]) -> Result<String> {
    let send_argv: Vec<String> = send_argv.iter().map(|s| s.to_string()).collect();
    let recv_argv: Vec<String> = recv_argv.iter().map(|s| s.to_string()).collect();

    task::spawn_blocking(move || run_pipeline_blocking(&send_argv, &recv_argv))
        .await
        .map_err(|e| Error::State(format!("pipeline task panicked: {e}")))?
}

fn run_pipeline_blocking(send_argv: &[String], recv_argv: &[String]) -> Result<String> {
    let mut send_err = NamedTempFile::new()?;
    let mut recv_err = NamedTempFile::new()?;

    let mut sender = StdCommand::new(&send_argv[0])
        .args(&send_argv[1..])
        .stdin(StdStdio::null())
        .stdout(StdStdio::piped())
        .stderr(send_err.reopen()?)
        .spawn()?;

    // Single-owner handoff: the sender's stdout is moved straight into the
    // receiver's stdin, so only the receiver's `Command` ever closes it.
    let receiver_stdin = StdStdio::from(sender.stdout.take().expect("piped stdout"));

    let mut receiver = StdCommand::new(&recv_argv[0])
        .args(&recv_argv[1..])
        .stdin(receiver_stdin)
        .stdout(StdStdio::null())
        .stderr(recv_err.reopen()?)
        .spawn()?;

    let send_status = sender.wait()?;
    let recv_status = receiver.wait()?;

    let send_stderr = read_temp_file(&mut send_err)?;
    let recv_stderr = read_temp_file(&mut recv_err)?;

    if !send_status.success() || !recv_status.success() {
        return Err(Error::Pipeline {
            send: status_error(send_argv, send_status, &send_stderr),
            receive: status_error(recv_argv, recv_status, &recv_stderr),
        });
    }

    Ok(send_stderr)
}

fn status_error(argv: &[String], status: ExitStatus, stderr: &str) -> Option<Box<Error>> {
    if status.success() {
        return None;
    }
    Some(Box::new(Error::ZfsCommand {
        argv: argv.to_vec(),
        status: Some(status),
        stderr: stderr.to_string(),
    }))
}

fn read_temp_file(file: &mut NamedTempFile) -> Result<String> {
    let mut buf = String::new();
    let mut handle = file.reopen()?;
    handle.read_to_string(&mut buf)?;
    Ok(buf)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_full_send_descriptor() {
        let stderr = "full\tsrcPool/fs1@zipper_2001-01-01T00:00:00_set\t50000\nsize\t50000\n";
        let info = SendInfo::parse_full(stderr).unwrap();
        assert_eq!(info.size, 50000);
    }

    #[test]
    fn parses_incremental_send_descriptor() {
        let stderr =
            "incremental\tzipper_a\tzipper_b\t12345\nsize\t12345\n";
        let info = SendInfo::parse_incr(stderr).unwrap();
        assert_eq!(info.size, 12345);
    }

    #[test]
    fn parses_incremental_send_descriptor_three_columns() {
        let stderr = "incremental\tzipper_b\t777\nsize\t777\n";
        let info = SendInfo::parse_incr(stderr).unwrap();
        assert_eq!(info.size, 777);
    }

    #[test]
    fn rejects_wrong_descriptor_kind() {
        assert!(SendInfo::parse_full("incremental\ta\tb\t1\nsize\t1\n").is_err());
        assert!(SendInfo::parse_incr("full\ta\t1\nsize\t1\n").is_err());
    }

    #[test]
    fn pool_health_round_trips_known_values() {
        for s in ["ONLINE", "DEGRADED", "FAULTED", "OFFLINE", "REMOVED", "UNAVAIL"] {
            assert!(PoolHealth::parse(s).is_ok());
        }
        assert!(PoolHealth::parse("WEIRD").is_err());
    }

    #[test]
    fn only_online_and_degraded_are_usable() {
        assert!(PoolHealth::Online.is_usable());
        assert!(PoolHealth::Degraded.is_usable());
        assert!(!PoolHealth::Faulted.is_usable());
        assert!(!PoolHealth::Offline.is_usable());
    }
}
