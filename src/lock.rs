// SPDX-License-Identifier: Apache-2.0
//! Process-wide advisory single-instance lock (component C7).

use crate::error::{Error, Result};
use fs2::FileExt;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

/// Holds an exclusive, non-blocking advisory lock for the process lifetime.
/// Contention is a fatal startup condition: acquisition never blocks and
/// never retries.
pub struct LockGuard {
    file: File,
    path: PathBuf,
}

impl LockGuard {
    pub fn acquire<P: AsRef<Path>>(path: P) -> Result<LockGuard> {
        let path = path.as_ref().to_path_buf();
        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .open(&path)?;

        file.try_lock_exclusive().map_err(|_| Error::LockHeld {
            path: path.display().to_string(),
        })?;

        file.set_len(0)?;
        write!(file, "{}", std::process::id())?;
        file.flush()?;

        Ok(LockGuard { file, path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        let _ = self.file.unlock();
    }
}
