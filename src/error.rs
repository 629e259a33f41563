// SPDX-License-Identifier: Apache-2.0
//! The single tagged error sum for the whole crate.

use std::process::ExitStatus;

/// Every fallible operation in this crate returns through this type.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("no backup pool available for backup set {backup_set} (rotation: {pools:?})")]
    NoPoolAvailable {
        backup_set: String,
        pools: Vec<String>,
    },

    #[error("ambiguous backup pool for backup set {backup_set}: {pools:?} are all usable")]
    AmbiguousPool {
        backup_set: String,
        pools: Vec<String>,
    },

    #[error(
        "backup pool {pool} for backup set {backup_set} is DEGRADED and allowDegraded is not set"
    )]
    PoolDegraded { backup_set: String, pool: String },

    #[error("command failed: {} (exit {}): {stderr}", argv.join(" "), status.map(|s| s.to_string()).unwrap_or_else(|| "?".into()))]
    ZfsCommand {
        argv: Vec<String>,
        status: Option<ExitStatus>,
        stderr: String,
    },

    #[error("send|receive pipeline failed: send={send:?} receive={receive:?}")]
    Pipeline {
        send: Option<Box<Error>>,
        receive: Option<Box<Error>>,
    },

    #[error("parse error: {0}")]
    Parse(String),

    #[error("internal state error (likely a bug): {0}")]
    State(String),

    #[error("lock file {path} is already held by another process")]
    LockHeld { path: String },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
