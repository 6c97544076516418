//! Append-only structured audit log.
//!
//! One JSON object per line; writes are flushed before the call returns so
//! an audit entry exists by the time its operation is acknowledged.

use std::{
    fs::{File, OpenOptions},
    io::{self, BufRead, BufReader, Write},
    path::{Path, PathBuf},
    time::{SystemTime, UNIX_EPOCH},
};

use log::warn;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AuditEventKind {
    AuthSuccess,
    AuthFailure,
    DocRead,
    DocWrite,
    DocDelete,
    DbCreate,
    DbDelete,
    CollectionCreate,
    CollectionDelete,
    PermissionCheckFailure,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEntry {
    /// Microseconds since the Unix epoch.
    pub timestamp_micros: i64,
    /// Token id or another stable actor identifier; never the raw secret.
    pub actor: String,
    pub kind: AuditEventKind,
    /// E.g. `db/collection/doc_id`.
    pub resource: String,
    pub success: bool,
    pub detail: String,
}

impl AuditEntry {
    pub fn now(
        actor: impl Into<String>,
        kind: AuditEventKind,
        resource: impl Into<String>,
        success: bool,
        detail: impl Into<String>,
    ) -> Self {
        let timestamp_micros = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_micros() as i64)
            .unwrap_or(0);
        Self {
            timestamp_micros,
            actor: actor.into(),
            kind,
            resource: resource.into(),
            success,
            detail: detail.into(),
        }
    }
}

pub struct AuditLog {
    path: PathBuf,
    file: Mutex<File>,
}

impl AuditLog {
    pub fn open(path: impl Into<PathBuf>) -> io::Result<Self> {
        let path = path.into();
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        Ok(Self {
            path,
            file: Mutex::new(file),
        })
    }

    pub fn append(&self, entry: &AuditEntry) -> io::Result<()> {
        let mut line = serde_json::to_vec(entry)?;
        line.push(b'\n');
        let mut file = self.file.lock();
        file.write_all(&line)?;
        file.flush()
    }

    /// Entries with `lo_micros <= timestamp <= hi_micros`, in file order.
    /// Unparseable lines are skipped with a warning, so one torn write
    /// cannot hide the rest of the log.
    pub fn read_range(&self, lo_micros: i64, hi_micros: i64) -> io::Result<Vec<AuditEntry>> {
        let reader = BufReader::new(File::open(&self.path)?);
        let mut entries = Vec::new();
        for line in reader.lines() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<AuditEntry>(&line) {
                Ok(entry) => {
                    if entry.timestamp_micros >= lo_micros && entry.timestamp_micros <= hi_micros {
                        entries.push(entry);
                    }
                }
                Err(err) => warn!("audit log {}: skipping bad line: {err}", self.path.display()),
            }
        }
        Ok(entries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn append_and_range_read() {
        let dir = tempfile::tempdir().unwrap();
        let log = AuditLog::open(dir.path().join("audit.log")).unwrap();

        let mut entries = Vec::new();
        for (i, kind) in [
            AuditEventKind::AuthSuccess,
            AuditEventKind::DocWrite,
            AuditEventKind::DocDelete,
        ]
        .into_iter()
        .enumerate()
        {
            let entry = AuditEntry {
                timestamp_micros: (i as i64 + 1) * 1000,
                actor: "tok-1".into(),
                kind,
                resource: format!("app/users/u{i}"),
                success: true,
                detail: String::new(),
            };
            log.append(&entry).unwrap();
            entries.push(entry);
        }

        assert_eq!(log.read_range(0, i64::MAX).unwrap(), entries);
        assert_eq!(log.read_range(1500, 2500).unwrap(), entries[1..2].to_vec());
        assert!(log.read_range(10_000, 20_000).unwrap().is_empty());
    }

    #[test]
    fn bad_lines_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("audit.log");
        let log = AuditLog::open(&path).unwrap();
        log.append(&AuditEntry::now(
            "tok-1",
            AuditEventKind::AuthFailure,
            "-",
            false,
            "bad token",
        ))
        .unwrap();
        std::fs::OpenOptions::new()
            .append(true)
            .open(&path)
            .unwrap()
            .write_all(b"{torn json\n")
            .unwrap();
        log.append(&AuditEntry::now(
            "tok-2",
            AuditEventKind::AuthSuccess,
            "-",
            true,
            "",
        ))
        .unwrap();

        let entries = log.read_range(0, i64::MAX).unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[1].actor, "tok-2");
    }
}
