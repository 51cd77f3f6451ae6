//! Database directory management.
//!
//! ```text
//! <db_path>/
//! ├─ MANIFEST          # channel count, byte order, format version
//! ├─ LOCK              # advisory lock for single-process access
//! ├─ channel_0/        # data files and transactions log of channel 0
//! └─ channel_1/
//! ```
//!
//! The LOCK file ensures only one process opens the database at a time.

use crate::error::{CoreError, CoreResult};
use crate::manifest::Manifest;
use fs2::FileExt;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

const MANIFEST_FILE: &str = "MANIFEST";
const LOCK_FILE: &str = "LOCK";
/// Temporary file for atomic manifest writes.
const MANIFEST_TEMP: &str = "MANIFEST.tmp";

/// An open database directory holding the exclusive lock.
///
/// The lock is released when the value is dropped.
#[derive(Debug)]
pub struct DatabaseDir {
    path: PathBuf,
    _lock_file: File,
}

impl DatabaseDir {
    /// Opens or creates a database directory and takes its lock.
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
                    "database directory does not exist: {}",
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

    /// Returns the path to the database directory.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Returns the path to the MANIFEST file.
    #[must_use]
    pub fn manifest_path(&self) -> PathBuf {
        self.path.join(MANIFEST_FILE)
    }

    /// Loads the manifest, or `None` for a new database.
    pub fn load_manifest(&self) -> CoreResult<Option<Manifest>> {
        read_manifest(&self.path)
    }

    /// Saves the manifest atomically: temp file, sync, rename, directory
    /// sync.
    pub fn save_manifest(&self, manifest: &Manifest) -> CoreResult<()> {
        write_manifest(&self.path, manifest)
    }

    /// Checks if this is a new (empty) database directory.
    #[must_use]
    pub fn is_new_database(&self) -> bool {
        !self.manifest_path().exists()
    }
}

/// Reads the manifest of the database at `path` without taking the lock.
///
/// Returns `None` if there is no manifest or it is empty.
pub fn read_manifest(path: &Path) -> CoreResult<Option<Manifest>> {
    let manifest_path = path.join(MANIFEST_FILE);
    if !manifest_path.exists() {
        return Ok(None);
    }
    let data = fs::read(&manifest_path)?;
    if data.is_empty() {
        return Ok(None);
    }
    Manifest::decode(&data).map(Some)
}

pub(crate) fn write_manifest(path: &Path, manifest: &Manifest) -> CoreResult<()> {
    let temp_path = path.join(MANIFEST_TEMP);
    let mut file = File::create(&temp_path)?;
    file.write_all(&manifest.encode())?;
    file.sync_all()?;
    drop(file);
    fs::rename(&temp_path, path.join(MANIFEST_FILE))?;
    sync_directory(path)
}

#[cfg(unix)]
fn sync_directory(path: &Path) -> CoreResult<()> {
    File::open(path)?.sync_all()?;
    Ok(())
}

#[cfg(not(unix))]
fn sync_directory(_path: &Path) -> CoreResult<()> {
    // NTFS journals metadata; directories cannot be fsynced there.
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::ByteOrder;
    use tempfile::tempdir;

    #[test]
    fn open_creates_directory() {
        let temp = tempdir().unwrap();
        let db_path = temp.path().join("new_db");
        let dir = DatabaseDir::open(&db_path, true).unwrap();
        assert!(db_path.is_dir());
        assert!(dir.is_new_database());
    }

    #[test]
    fn open_fails_if_not_exists_and_no_create() {
        let temp = tempdir().unwrap();
        assert!(DatabaseDir::open(&temp.path().join("missing"), false).is_err());
    }

    #[test]
    fn lock_prevents_second_open() {
        let temp = tempdir().unwrap();
        let db_path = temp.path().join("locked_db");
        let _dir = DatabaseDir::open(&db_path, true).unwrap();
        assert!(matches!(
            DatabaseDir::open(&db_path, true),
            Err(CoreError::DatabaseLocked)
        ));
    }

    #[test]
    fn lock_released_on_drop() {
        let temp = tempdir().unwrap();
        let db_path = temp.path().join("reopen_db");
        drop(DatabaseDir::open(&db_path, true).unwrap());
        assert!(DatabaseDir::open(&db_path, true).is_ok());
    }

    #[test]
    fn manifest_round_trip() {
        let temp = tempdir().unwrap();
        let dir = DatabaseDir::open(temp.path(), true).unwrap();
        assert!(dir.load_manifest().unwrap().is_none());

        let manifest = Manifest::new(4, ByteOrder::Big);
        dir.save_manifest(&manifest).unwrap();
        assert!(!dir.is_new_database());
        assert_eq!(dir.load_manifest().unwrap(), Some(manifest));
        assert_eq!(read_manifest(temp.path()).unwrap(), Some(manifest));
        assert!(!temp.path().join(MANIFEST_TEMP).exists());
    }
}
