//! Exclusive run lock next to a ledger file.

use crate::config::LedgerConfig;
use crate::error::{RelayError, Result};
use chrono::{DateTime, Utc};
use fs2::FileExt;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Held for the duration of a run that appends to a ledger.
///
/// Backed by an advisory `flock`-style lock on `<ledger>.lock`, so it is
/// released by the OS if the process dies.
#[derive(Debug)]
pub struct RunLock {
    file: File,
    path: PathBuf,
    run_id: String,
    started_at: DateTime<Utc>,
}

/// Lock file path for a ledger.
pub fn lock_path(ledger_path: &Path) -> PathBuf {
    let mut name = ledger_path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(".");
    name.push(LedgerConfig::LOCK_SUFFIX);
    ledger_path.with_file_name(name)
}

impl RunLock {
    /// Take the lock without blocking; fails with `RunLocked` if another
    /// run holds it.
    pub fn acquire(ledger_path: &Path) -> Result<Self> {
        let path = lock_path(ledger_path);
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                fs::create_dir_all(parent).map_err(|e| RelayError::io_with_path(e, parent))?;
            }
        }

        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)
            .map_err(|e| RelayError::io_with_path(e, &path))?;

        if let Err(e) = file.try_lock_exclusive() {
            if e.kind() == std::io::ErrorKind::WouldBlock
                || e.raw_os_error() == fs2::lock_contended_error().raw_os_error()
            {
                return Err(RelayError::RunLocked {
                    path: ledger_path.to_path_buf(),
                });
            }
            return Err(RelayError::io_with_path(e, &path));
        }

        let run_id = uuid::Uuid::new_v4().to_string();
        let started_at = Utc::now();

        file.set_len(0)
            .and_then(|_| writeln!(file, "{} {}", run_id, started_at.to_rfc3339()))
            .map_err(|e| RelayError::io_with_path(e, &path))?;

        info!("Acquired run lock {} (run {})", path.display(), run_id);
        Ok(Self {
            file,
            path,
            run_id,
            started_at,
        })
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for RunLock {
    fn drop(&mut self) {
        if let Err(e) = FileExt::unlock(&self.file) {
            warn!("Failed to release run lock {}: {}", self.path.display(), e);
        } else {
            debug!("Released run lock {}", self.path.display());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_lock_path_appends_suffix() {
        assert_eq!(
            lock_path(Path::new("/tmp/out/migration.csv")),
            PathBuf::from("/tmp/out/migration.csv.lock")
        );
    }

    #[test]
    fn test_second_acquire_fails_until_released() {
        let tmp = TempDir::new().unwrap();
        let ledger = tmp.path().join("migration.csv");

        let first = RunLock::acquire(&ledger).unwrap();
        let contents = fs::read_to_string(first.path()).unwrap();
        assert!(contents.starts_with(first.run_id()));

        let err = RunLock::acquire(&ledger).unwrap_err();
        assert!(matches!(err, RelayError::RunLocked { .. }));

        drop(first);
        assert!(RunLock::acquire(&ledger).is_ok());
    }
}
