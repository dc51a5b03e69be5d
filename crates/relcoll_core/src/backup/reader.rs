//! Reads and validates a snapshot directory.

use super::format::{
    checkpoint_file, decode_checkpoint, decode_registry, BackupMetadata, FORMAT_VERSION,
    METADATA_FILE, REGISTRY_FILE,
};
use crate::error::{CoreError, CoreResult};
use crate::key::DictionaryKey;
use crate::name::StateProviderName;
use crate::provider::{ProviderEntry, StateProviderKind};
use crate::serializer::StateSerializer;
use crate::state_manager::ProviderInfo;
use crate::types::ProviderId;
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

/// A validated backup snapshot loaded into memory.
///
/// Opening checks every file's framing and checksum, that the registry
/// matches the metadata, and that each checkpoint belongs to a registered
/// provider.
#[derive(Debug)]
pub struct BackupReader {
    directory: PathBuf,
    metadata: BackupMetadata,
    providers: Vec<ProviderInfo>,
    entries: HashMap<ProviderId, Vec<ProviderEntry>>,
}

impl BackupReader {
    /// Opens the snapshot in `directory`.
    pub fn open(directory: impl AsRef<Path>) -> CoreResult<Self> {
        let directory = directory.as_ref().to_path_buf();

        let metadata: BackupMetadata =
            serde_json::from_slice(&fs::read(directory.join(METADATA_FILE))?)?;
        if metadata.format_version != FORMAT_VERSION {
            return Err(CoreError::invalid_format(format!(
                "unsupported backup format version: {}",
                metadata.format_version
            )));
        }

        let providers = decode_registry(&fs::read(directory.join(REGISTRY_FILE))?)?;
        if providers.len() != metadata.provider_count {
            return Err(CoreError::invalid_format(format!(
                "provider count mismatch: metadata says {}, registry has {}",
                metadata.provider_count,
                providers.len()
            )));
        }

        let mut entries = HashMap::new();
        for file in &metadata.checkpoint_files {
            let (id, provider_entries) = decode_checkpoint(&fs::read(directory.join(file))?)?;
            if checkpoint_file(id) != *file {
                return Err(CoreError::invalid_format(format!(
                    "{file} holds entries of {id}"
                )));
            }
            if !providers.iter().any(|p| p.id == id) {
                return Err(CoreError::invalid_format(format!(
                    "{file} belongs to unregistered provider {id}"
                )));
            }
            entries.insert(id, provider_entries);
        }

        Ok(Self {
            directory,
            metadata,
            providers,
            entries,
        })
    }

    /// The snapshot directory.
    #[must_use]
    pub fn directory(&self) -> &Path {
        &self.directory
    }

    /// Contents of `backup.json`.
    #[must_use]
    pub fn metadata(&self) -> &BackupMetadata {
        &self.metadata
    }

    /// Registered providers in registration order.
    #[must_use]
    pub fn providers(&self) -> &[ProviderInfo] {
        &self.providers
    }

    /// Looks up a provider by name.
    pub fn provider(&self, name: &StateProviderName) -> CoreResult<&ProviderInfo> {
        self.providers
            .iter()
            .find(|p| &p.name == name)
            .ok_or_else(|| CoreError::not_found(name))
    }

    /// Raw entries of a collection, wherever they are stored.
    pub fn entries(&self, name: &StateProviderName) -> CoreResult<&[ProviderEntry]> {
        let info = self.provider(name)?;
        let holder = self
            .providers
            .iter()
            .find(|p| p.parent == Some(info.id))
            .map_or(info.id, |child| child.id);
        Ok(self.entries.get(&holder).map_or(&[], Vec::as_slice))
    }

    /// Number of entries in a collection.
    pub fn entry_count(&self, name: &StateProviderName) -> CoreResult<usize> {
        Ok(self.entries(name)?.len())
    }

    /// Decoded entries of a dictionary in key order.
    pub fn dictionary_entries<K, V>(
        &self,
        name: &StateProviderName,
        serializer: &dyn StateSerializer<V>,
    ) -> CoreResult<Vec<(K, V)>>
    where
        K: DictionaryKey,
    {
        self.expect_kind(name, StateProviderKind::Dictionary)?;
        self.entries(name)?
            .iter()
            .map(|e| Ok((K::decode_key(&e.key)?, serializer.read(&e.value)?)))
            .collect()
    }

    /// Decoded items of a queue from head to tail.
    pub fn queue_items<T>(
        &self,
        name: &StateProviderName,
        serializer: &dyn StateSerializer<T>,
    ) -> CoreResult<Vec<T>> {
        let info = self.provider(name)?;
        if !info.kind.is_queue() {
            return Err(CoreError::KindMismatch {
                name: name.to_string(),
                expected: StateProviderKind::Queue,
                actual: info.kind,
            });
        }
        self.entries(name)?
            .iter()
            .map(|e| serializer.read(&e.value))
            .collect()
    }

    fn expect_kind(&self, name: &StateProviderName, expected: StateProviderKind) -> CoreResult<()> {
        let actual = self.provider(name)?.kind;
        if actual != expected {
            return Err(CoreError::KindMismatch {
                name: name.to_string(),
                expected,
                actual,
            });
        }
        Ok(())
    }
}
