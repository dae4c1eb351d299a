//! Ledger directory management.
//!
//! ```text
//! <db_path>/
//! ├─ SNAPSHOT          # Committed tables and sequences
//! └─ LOCK              # Advisory lock for single-writer
//! ```
//!
//! The LOCK file ensures only one process owns the ledger at a time.

use crate::error::{CoreError, CoreResult};
use crate::snapshot::Snapshot;
use fs2::FileExt;
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

const SNAPSHOT_FILE: &str = "SNAPSHOT";
const SNAPSHOT_TEMP: &str = "SNAPSHOT.tmp";
const LOCK_FILE: &str = "LOCK";

/// Owns a ledger directory and its lock.
#[derive(Debug)]
pub struct DatabaseDir {
    path: PathBuf,
    _lock_file: File,
}

impl DatabaseDir {
    /// Opens or creates a ledger directory.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - The directory doesn't exist and `create_if_missing` is false
    /// - Another process holds the lock (returns `DatabaseLocked`)
    /// - I/O errors occur
    pub fn open(path: &Path, create_if_missing: bool) -> CoreResult<Self> {
        if !path.exists() {
            if create_if_missing {
                fs::create_dir_all(path)?;
            } else {
                return Err(CoreError::invalid_format(format!(
                    "ledger directory does not exist: {}",
                    path.display()
                )));
            }
        }
        if !path.is_dir() {
            return Err(CoreError::invalid_format(format!(
                "path is not a directory: {}",
                path.display()
            )));
        }

        let lock_file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path.join(LOCK_FILE))?;
        if lock_file.try_lock_exclusive().is_err() {
            return Err(CoreError::DatabaseLocked);
        }

        Ok(Self {
            path: path.to_path_buf(),
            _lock_file: lock_file,
        })
    }

    /// Returns the ledger directory.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Returns the path of the SNAPSHOT file.
    #[must_use]
    pub fn snapshot_path(&self) -> PathBuf {
        self.path.join(SNAPSHOT_FILE)
    }

    /// Loads the snapshot, or `None` for a new ledger.
    pub fn load_snapshot(&self) -> CoreResult<Option<Snapshot>> {
        read_snapshot(&self.snapshot_path())
    }

    /// Saves encoded snapshot bytes atomically.
    ///
    /// Writes a temporary file, syncs it, renames it over SNAPSHOT and
    /// syncs the directory.
    pub(crate) fn save_snapshot_bytes(&self, data: &[u8]) -> CoreResult<()> {
        let temp_path = self.path.join(SNAPSHOT_TEMP);
        let mut file = File::create(&temp_path)?;
        file.write_all(data)?;
        file.sync_all()?;
        drop(file);

        fs::rename(&temp_path, self.snapshot_path())?;
        self.sync_directory()
    }

    #[cfg(unix)]
    fn sync_directory(&self) -> CoreResult<()> {
        File::open(&self.path)?.sync_all()?;
        Ok(())
    }

    #[cfg(not(unix))]
    fn sync_directory(&self) -> CoreResult<()> {
        Ok(())
    }
}

/// Reads a snapshot without taking the directory lock.
///
/// Used by read-only tooling while an engine may own the directory.
pub fn read_snapshot(path: &Path) -> CoreResult<Option<Snapshot>> {
    if !path.exists() {
        return Ok(None);
    }
    let mut data = Vec::new();
    File::open(path)?.read_to_end(&mut data)?;
    if data.is_empty() {
        return Ok(None);
    }
    Snapshot::decode(&data).map(Some)
}
