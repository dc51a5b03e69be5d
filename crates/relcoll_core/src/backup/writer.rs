//! Writes a snapshot directory.

use super::format::{
    checkpoint_file, encode_checkpoint, encode_registry, BackupMetadata, FORMAT_VERSION,
    METADATA_FILE, PROVIDERS_DIR, REGISTRY_FILE,
};
use super::BackupOption;
use crate::error::CoreResult;
use crate::state_manager::{ProviderInfo, ProviderSnapshot};
use crate::types::SequenceNumber;
use std::fs;
use std::path::Path;
use uuid::Uuid;

/// Writes `snapshot` into `directory`, which must not exist yet.
pub(crate) fn write_snapshot(
    directory: &Path,
    backup_id: Uuid,
    sequence: SequenceNumber,
    created_at_ms: u64,
    snapshot: &[ProviderSnapshot],
) -> CoreResult<BackupMetadata> {
    fs::create_dir_all(directory.join(PROVIDERS_DIR))?;

    let registry: Vec<ProviderInfo> = snapshot.iter().map(|p| p.info.clone()).collect();
    fs::write(directory.join(REGISTRY_FILE), encode_registry(&registry)?)?;

    let mut checkpoint_files = Vec::new();
    for provider in snapshot {
        if let Some(entries) = &provider.entries {
            let file = checkpoint_file(provider.info.id);
            fs::write(
                directory.join(&file),
                encode_checkpoint(provider.info.id, entries)?,
            )?;
            checkpoint_files.push(file);
        }
    }

    let metadata = BackupMetadata {
        format_version: FORMAT_VERSION,
        backup_id,
        option: BackupOption::Full,
        sequence: sequence.as_u64(),
        created_at_ms,
        provider_count: registry.len(),
        checkpoint_files,
    };
    fs::write(
        directory.join(METADATA_FILE),
        serde_json::to_vec_pretty(&metadata)?,
    )?;

    tracing::debug!(
        path = %directory.display(),
        providers = metadata.provider_count,
        checkpoints = metadata.checkpoint_files.len(),
        "wrote backup snapshot"
    );
    Ok(metadata)
}
