//! End-to-end backup generation.
//!
//! A generator creates a replica in a log folder, registers one dictionary,
//! fills it through [`populate_dictionary`], takes a full backup and copies
//! the snapshot to `<log folder>/BackupContainer/<uuid>` before dropping the
//! replica.

use crate::error::{GeneratorError, GeneratorResult};
use crate::naming::{RandomServiceNames, ServiceNameGenerator};
use crate::populate::populate_dictionary;
use crate::user::{User, UserSerializer};
use relcoll_core::{
    BackupInfo, CancellationToken, CoreError, CoreResult, OpenMode, Replica, ReplicaConfig,
    StateProviderKind, StateProviderName, StateSerializer, TransactionalReplicator,
};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use uuid::Uuid;

/// Name of the populated dictionary.
pub const DICTIONARY_NAME: &str = "urn:testDictionary";

/// Folder under the log folder that receives copied snapshots.
pub const BACKUP_CONTAINER: &str = "BackupContainer";

/// Shape of the generated data.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GeneratorOptions {
    /// First key written.
    pub start_key: i64,
    /// Number of transactions.
    pub batch_count: u32,
    /// Keys added per transaction.
    pub batch_size: u32,
}

impl Default for GeneratorOptions {
    fn default() -> Self {
        Self {
            start_key: 0,
            batch_count: 8,
            batch_size: 8,
        }
    }
}

impl GeneratorOptions {
    /// Creates options with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the first key.
    #[must_use]
    pub const fn start_key(mut self, key: i64) -> Self {
        self.start_key = key;
        self
    }

    /// Sets the number of transactions.
    #[must_use]
    pub const fn batch_count(mut self, count: u32) -> Self {
        self.batch_count = count;
        self
    }

    /// Sets the keys added per transaction.
    #[must_use]
    pub const fn batch_size(mut self, size: u32) -> Self {
        self.batch_size = size;
        self
    }
}

/// Generates backups into a log folder.
pub struct BackupGenerator<N = RandomServiceNames> {
    log_folder: PathBuf,
    names: N,
    options: GeneratorOptions,
}

impl BackupGenerator<RandomServiceNames> {
    /// Creates a generator with random service names.
    #[must_use]
    pub fn new(log_folder: impl AsRef<Path>) -> Self {
        Self::with_names(log_folder, RandomServiceNames::new())
    }
}

impl<N: ServiceNameGenerator> BackupGenerator<N> {
    /// Creates a generator using `names` for each replica.
    #[must_use]
    pub fn with_names(log_folder: impl AsRef<Path>, names: N) -> Self {
        Self {
            log_folder: log_folder.as_ref().to_path_buf(),
            names,
            options: GeneratorOptions::default(),
        }
    }

    /// Replaces the data shape.
    #[must_use]
    pub fn options(mut self, options: GeneratorOptions) -> Self {
        self.options = options;
        self
    }

    /// Returns the log folder.
    #[must_use]
    pub fn log_folder(&self) -> &Path {
        &self.log_folder
    }

    /// Generates a backup of [`User`] values.
    pub fn generate_user_data(&mut self) -> GeneratorResult<PathBuf> {
        self.generate_with_value_type(User::default(), Arc::new(UserSerializer))
    }

    /// Generates a backup where every entry holds `value`.
    ///
    /// The log folder is wiped first. Returns the copied snapshot directory.
    pub fn generate_with_value_type<V>(
        &mut self,
        value: V,
        serializer: Arc<dyn StateSerializer<V>>,
    ) -> GeneratorResult<PathBuf>
    where
        V: Clone + Send + Sync + 'static,
    {
        reset_dir(&self.log_folder)?;

        let service = self.names.next_name()?;
        tracing::info!(%service, folder = %self.log_folder.display(), "generating backup");
        let replica = Replica::with_defaults(ReplicaConfig::new(&self.log_folder, service))?;

        let replicator = replica.replicator();
        replicator.try_add_state_serializer::<V>(serializer);

        let outcome = self.run(&replica, &replicator, &value);
        let dropped = replica.drop_replica();
        let copied = outcome?;
        dropped?;

        tracing::info!(path = %copied.display(), "backup copied");
        Ok(copied)
    }

    fn run<V>(
        &self,
        replica: &Replica,
        replicator: &Arc<TransactionalReplicator>,
        value: &V,
    ) -> GeneratorResult<PathBuf>
    where
        V: Clone + Send + Sync + 'static,
    {
        replica.open(OpenMode::New)?;
        replica.promote()?;
        expect_providers(replicator, "before registration", 0)?;

        let name = StateProviderName::new(DICTIONARY_NAME)?;
        replicator.transaction(|txn| {
            replicator.add_state_provider(txn, name.clone(), StateProviderKind::Dictionary)
        })?;
        expect_providers(
            replicator,
            "after registration",
            replicator.config().entries_per_collection(),
        )?;

        populate_dictionary(
            replicator,
            &name,
            self.options.start_key,
            self.options.batch_count,
            self.options.batch_size,
            value,
        )?;

        let container = self.log_folder.join(BACKUP_CONTAINER);
        let mut copied = None;
        replicator.backup(|info: &BackupInfo, cancel: &CancellationToken| -> CoreResult<bool> {
            if cancel.is_cancelled() {
                return Ok(false);
            }
            let target = container.join(Uuid::new_v4().simple().to_string());
            copy_dir(&info.directory, &target)?;
            copied = Some(target);
            Ok(true)
        })?;

        copied.ok_or(GeneratorError::NothingCopied)
    }
}

fn expect_providers(
    replicator: &TransactionalReplicator,
    stage: &str,
    expected: usize,
) -> CoreResult<()> {
    let actual = replicator.enumerate_providers(false)?.len();
    if actual == expected {
        Ok(())
    } else {
        Err(CoreError::consistency_violation(
            format!("state manager {stage}"),
            expected as u64,
            actual as u64,
        ))
    }
}

fn reset_dir(path: &Path) -> GeneratorResult<()> {
    if path.exists() {
        fs::remove_dir_all(path).map_err(|e| GeneratorError::io(path, e))?;
    }
    fs::create_dir_all(path).map_err(|e| GeneratorError::io(path, e))
}

/// Recursively copies `from` into a new directory `to`.
pub fn copy_dir(from: &Path, to: &Path) -> io::Result<()> {
    fs::create_dir_all(to)?;
    for entry in fs::read_dir(from)? {
        let entry = entry?;
        let target = to.join(entry.file_name());
        if entry.file_type()?.is_dir() {
            copy_dir(&entry.path(), &target)?;
        } else {
            fs::copy(entry.path(), &target)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::naming::SequentialServiceNames;
    use tempfile::tempdir;

    #[test]
    fn copy_dir_copies_nested_files() {
        let temp = tempdir().unwrap();
        let from = temp.path().join("from");
        fs::create_dir_all(from.join("providers")).unwrap();
        fs::write(from.join("backup.json"), b"{}").unwrap();
        fs::write(from.join("providers/2.chk"), b"data").unwrap();

        let to = temp.path().join("to");
        copy_dir(&from, &to).unwrap();
        assert_eq!(fs::read(to.join("providers/2.chk")).unwrap(), b"data");
    }

    #[test]
    fn reset_dir_clears_previous_contents() {
        let temp = tempdir().unwrap();
        let folder = temp.path().join("log");
        fs::create_dir_all(&folder).unwrap();
        fs::write(folder.join("stale"), b"x").unwrap();

        reset_dir(&folder).unwrap();
        assert!(folder.exists());
        assert!(!folder.join("stale").exists());
    }

    #[test]
    fn options_builder() {
        let options = GeneratorOptions::new().start_key(10).batch_count(2).batch_size(3);
        assert_eq!(
            options,
            GeneratorOptions {
                start_key: 10,
                batch_count: 2,
                batch_size: 3
            }
        );
    }

    #[test]
    fn generated_snapshot_lands_in_the_container() {
        let temp = tempdir().unwrap();
        let mut generator =
            BackupGenerator::with_names(temp.path(), SequentialServiceNames::default())
                .options(GeneratorOptions::new().batch_count(2).batch_size(2));

        let copied = generator
            .generate_with_value_type(5u64, Arc::new(relcoll_core::CborSerializer::<u64>::new()))
            .unwrap();
        assert_eq!(copied.parent().unwrap(), temp.path().join(BACKUP_CONTAINER));
        assert_eq!(copied.file_name().unwrap().len(), 32);
        assert!(copied.join("backup.json").exists());
    }
}
