//! Replica directory management.
//!
//! Layout of a replica's work directory:
//!
//! ```text
//! <work_dir>/
//! ├─ LOCK              # Advisory lock, one replica per directory
//! ├─ SERVICE           # Name of the owning service
//! ├─ replicator.log    # Replicator log
//! └─ backup_staging/   # Snapshots while their backup callback runs
//! ```

use crate::error::{CoreError, CoreResult};
use crate::name::ServiceName;
use fs2::FileExt;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

const LOCK_FILE: &str = "LOCK";
const SERVICE_FILE: &str = "SERVICE";
const SERVICE_TEMP: &str = "SERVICE.tmp";
const LOG_FILE: &str = "replicator.log";
const STAGING_DIR: &str = "backup_staging";

/// A locked replica work directory.
///
/// The lock is held until the value is dropped.
#[derive(Debug)]
pub(crate) struct ReplicaDir {
    path: PathBuf,
    _lock_file: File,
}

impl ReplicaDir {
    /// Creates the directory if needed and locks it.
    ///
    /// # Errors
    ///
    /// Fails with `ReplicaLocked` if another replica holds the lock.
    pub(crate) fn open(path: &Path) -> CoreResult<Self> {
        fs::create_dir_all(path)?;
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
            return Err(CoreError::ReplicaLocked {
                path: path.to_path_buf(),
            });
        }

        Ok(Self {
            path: path.to_path_buf(),
            _lock_file: lock_file,
        })
    }

    pub(crate) fn path(&self) -> &Path {
        &self.path
    }

    pub(crate) fn log_path(&self) -> PathBuf {
        self.path.join(LOG_FILE)
    }

    pub(crate) fn staging_dir(&self) -> PathBuf {
        self.path.join(STAGING_DIR)
    }

    /// The stored service name, if one was saved.
    pub(crate) fn load_service_name(&self) -> CoreResult<Option<String>> {
        let path = self.path.join(SERVICE_FILE);
        if !path.exists() {
            return Ok(None);
        }
        Ok(Some(fs::read_to_string(path)?.trim_end().to_string()))
    }

    /// Saves the service name with write-then-rename.
    pub(crate) fn save_service_name(&self, service: &ServiceName) -> CoreResult<()> {
        let temp_path = self.path.join(SERVICE_TEMP);
        let mut file = File::create(&temp_path)?;
        writeln!(file, "{service}")?;
        file.sync_all()?;
        drop(file);

        fs::rename(&temp_path, self.path.join(SERVICE_FILE))?;
        self.sync_directory()
    }

    /// Deletes the log, service file and staging area. The lock stays held.
    pub(crate) fn remove_state(&self) -> CoreResult<()> {
        for file in [LOG_FILE, SERVICE_FILE, SERVICE_TEMP] {
            let path = self.path.join(file);
            if path.exists() {
                fs::remove_file(path)?;
            }
        }
        let staging = self.staging_dir();
        if staging.exists() {
            fs::remove_dir_all(staging)?;
        }
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
