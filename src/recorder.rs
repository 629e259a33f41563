// SPDX-License-Identifier: Apache-2.0
//! Append-only TSV history of backup actions (component C3).

use crate::error::Result;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

const HEADER: &[&str] = &[
    "time",
    "backupSet",
    "backupPool",
    "action",
    "src1Snap",
    "src2Snap",
    "backupSnap",
    "size",
    "exception",
    "info",
];

/// One row to be appended to the record file. All string fields are
/// sanitized of tabs/newlines before being written.
#[derive(Debug, Clone, Default)]
pub struct Record<'a> {
    pub backup_set: &'a str,
    pub backup_pool: &'a str,
    pub action: &'a str,
    pub src1_snap: &'a str,
    pub src2_snap: &'a str,
    pub backup_snap: &'a str,
    pub size: &'a str,
    pub exception: &'a str,
    pub info: &'a str,
}

pub struct Recorder {
    file: Option<File>,
    path: PathBuf,
}

impl Recorder {
    /// Open (creating parent directories and the file as needed) a
    /// recorder for `path`. Writes the header exactly once, only if the
    /// file was empty at open time.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Recorder> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                fs::create_dir_all(parent)?;
            }
        }

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .read(true)
            .open(&path)?;
        let is_empty = file.metadata()?.len() == 0;
        if is_empty {
            write_line(&mut file, &HEADER.join("\t"))?;
        }

        Ok(Recorder {
            file: Some(file),
            path,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one action row, flushing and fsyncing before returning.
    pub fn record(&mut self, time: &str, rec: &Record<'_>) -> Result<()> {
        let fields = [
            time,
            rec.backup_set,
            rec.backup_pool,
            rec.action,
            rec.src1_snap,
            rec.src2_snap,
            rec.backup_snap,
            rec.size,
            rec.exception,
            rec.info,
        ];
        let sanitized: Vec<String> = fields.iter().map(|f| sanitize(f)).collect();
        let line = sanitized.join("\t");
        if let Some(file) = self.file.as_mut() {
            write_line(file, &line)?;
        }
        Ok(())
    }

    /// Record an `error` row; the exception message has all whitespace
    /// collapsed to single spaces.
    pub fn record_error(
        &mut self,
        time: &str,
        backup_set: &str,
        backup_pool: &str,
        exception: &str,
        src1_snap: &str,
        src2_snap: &str,
        backup_snap: &str,
    ) -> Result<()> {
        let collapsed = collapse_whitespace(exception);
        self.record(
            time,
            &Record {
                backup_set,
                backup_pool,
                action: "error",
                src1_snap,
                src2_snap,
                backup_snap,
                size: "",
                exception: &collapsed,
                info: "",
            },
        )
    }

    /// Idempotent close: a second call is a no-op.
    pub fn close(&mut self) {
        self.file = None;
    }
}

impl Drop for Recorder {
    fn drop(&mut self) {
        self.close();
    }
}

fn write_line(file: &mut File, line: &str) -> Result<()> {
    writeln!(file, "{line}")?;
    file.flush()?;
    file.sync_data()?;
    Ok(())
}

fn sanitize(field: &str) -> String {
    field.replace(['\t', '\n'], " ")
}

fn collapse_whitespace(s: &str) -> String {
    s.split_whitespace().collect::<Vec<_>>().join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;
    use tempfile::tempdir;

    fn read_to_string(path: &Path) -> String {
        let mut s = String::new();
        File::open(path).unwrap().read_to_string(&mut s).unwrap();
        s
    }

    #[test]
    fn writes_header_once_on_fresh_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("rec.tsv");

        {
            let mut rec = Recorder::open(&path).unwrap();
            rec.record(
                "t0",
                &Record {
                    backup_set: "set",
                    backup_pool: "pool",
                    action: "full",
                    src1_snap: "src",
                    ..Default::default()
                },
            )
            .unwrap();
        }

        let contents = read_to_string(&path);
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0], HEADER.join("\t"));
    }

    #[test]
    fn reopening_existing_nonempty_file_does_not_rewrite_header() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("rec.tsv");

        {
            let mut rec = Recorder::open(&path).unwrap();
            rec.record("t0", &Record::default()).unwrap();
        }
        {
            let mut rec = Recorder::open(&path).unwrap();
            rec.record("t1", &Record::default()).unwrap();
        }

        let contents = read_to_string(&path);
        assert_eq!(contents.matches(&HEADER.join("\t")).count(), 1);
        assert_eq!(contents.lines().count(), 3);
    }

    #[test]
    fn error_rows_collapse_whitespace_in_exception() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("rec.tsv");
        let mut rec = Recorder::open(&path).unwrap();
        rec.record_error("t0", "set", "pool", "bad\nthing\thappened", "", "", "")
            .unwrap();
        let contents = read_to_string(&path);
        let last = contents.lines().last().unwrap();
        assert!(last.contains("bad thing happened"));
        assert!(!last.contains('\n'));
    }

    #[test]
    fn close_is_idempotent() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("rec.tsv");
        let mut rec = Recorder::open(&path).unwrap();
        rec.close();
        rec.close();
    }

    #[test]
    fn creates_parent_directories() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested/deep/rec.tsv");
        let _rec = Recorder::open(&path).unwrap();
        assert!(path.exists());
    }
}
