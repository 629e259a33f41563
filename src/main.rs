// SPDX-License-Identifier: Apache-2.0
//! Entry point: flag parsing, logging init, dispatch, exit codes.

use clap::Parser;
use zipper::cli::Cli;
use zipper::clock::SystemClock;
use zipper::config::BackupConf;
use zipper::error::Error;
use zipper::lock::LockGuard;
use zipper::orchestrator::BackupSetOrchestrator;
use zipper::recorder::Recorder;
use zipper::zfs::RealZfsDriver;

#[tokio::main(flavor = "current_thread")]
async fn main() {
    let cli = Cli::parse();
    env_logger::Builder::new()
        .filter_level(cli.verbose_level.as_filter())
        .init();

    std::process::exit(run(cli).await);
}

async fn run(cli: Cli) -> i32 {
    let conf = match BackupConf::load(&cli.conf) {
        Ok(conf) => conf,
        Err(err) => {
            log::error!("configuration error: {err}");
            return 2;
        }
    };

    let _lock = match LockGuard::acquire(&conf.lock_file) {
        Ok(lock) => lock,
        Err(err) => {
            log::error!("{err}");
            return 2;
        }
    };

    let backup_set_name = match cli.backup_set.as_deref() {
        Some(name) => name,
        None if conf.backup_sets.len() == 1 => conf.backup_sets[0].name.as_str(),
        None => {
            log::error!("multiple backup sets configured; a backup set name is required");
            return 2;
        }
    };

    let backup_set = match conf.get_backup_set(backup_set_name) {
        Ok(set) => set,
        Err(err) => {
            log::error!("{err}");
            return 2;
        }
    };

    let mut recorder = match Recorder::open(&conf.record_file) {
        Ok(recorder) => recorder,
        Err(err) => {
            log::error!("failed to open record file: {err}");
            return 2;
        }
    };

    let driver = RealZfsDriver::new();
    let clock = SystemClock;
    let allow_degraded = cli.allow_degraded || conf.allow_degraded;
    let mut orchestrator =
        BackupSetOrchestrator::new(&driver, &mut recorder, &clock, backup_set, allow_degraded);

    let subset = cli.source_fs_subset();
    let result = if cli.snap_only {
        orchestrator.snap_only(subset.as_deref()).await
    } else {
        orchestrator.backup(subset.as_deref()).await
    };

    match result {
        Ok(()) => 0,
        Err(err @ (Error::Config(_) | Error::LockHeld { .. })) => {
            log::error!("{err}");
            2
        }
        Err(err) => {
            log::error!("backup run failed: {err}");
            1
        }
    }
}
