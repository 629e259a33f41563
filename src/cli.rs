// SPDX-License-Identifier: Apache-2.0
//! Command-line surface (component C9, part 1): flag parsing.

use clap::{Parser, ValueEnum};

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Verbosity {
    Debug,
    Info,
    Warning,
    Error,
}

impl Verbosity {
    pub fn as_filter(self) -> log::LevelFilter {
        match self {
            Verbosity::Debug => log::LevelFilter::Debug,
            Verbosity::Info => log::LevelFilter::Info,
            Verbosity::Warning => log::LevelFilter::Warn,
            Verbosity::Error => log::LevelFilter::Error,
        }
    }
}

/// Rotating, incremental ZFS backups across a pool rotation.
#[derive(Debug, Parser)]
#[command(name = "zipper", version, about)]
pub struct Cli {
    /// Path to the YAML configuration file.
    #[arg(long, default_value = "zipper.yaml")]
    pub conf: String,

    /// Restrict the run to these source file systems (repeatable).
    #[arg(long = "source-file-system")]
    pub source_file_system: Vec<String>,

    /// Create source snapshots only; do not touch any backup pool.
    #[arg(long)]
    pub snap_only: bool,

    /// Log verbosity.
    #[arg(long, value_enum, default_value = "info")]
    pub verbose_level: Verbosity,

    /// Override the configured allowDegraded for this run.
    #[arg(long)]
    pub allow_degraded: bool,

    /// The backup set to run. Optional if the configuration defines only one.
    pub backup_set: Option<String>,
}

impl Cli {
    pub fn source_fs_subset(&self) -> Option<Vec<String>> {
        if self.source_file_system.is_empty() {
            None
        } else {
            Some(self.source_file_system.clone())
        }
    }
}
