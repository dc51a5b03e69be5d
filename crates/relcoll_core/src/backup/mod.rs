//! Backups of a replica's committed state.
//!
//! A backup is a snapshot directory written under the replicator's staging
//! area and handed to a [`BackupCallback`]. The callback copies or uploads
//! it; the staging directory is removed once the callback returns.
//!
//! ## Snapshot Layout
//!
//! ```text
//! <backup id>/
//!     backup.json            metadata (serde_json)
//!     state_manager.chk      provider registry
//!     providers/<id>.chk     entries of each data-holding provider
//! ```
//!
//! Both binary file kinds are framed as
//!
//! ```text
//! | magic (4) | version (2) | body (N) | crc32 (4) |
//! ```

mod format;
mod reader;
mod writer;

pub use format::BackupMetadata;
pub use reader::BackupReader;
pub(crate) use writer::write_snapshot;

use crate::error::CoreResult;
use crate::types::SequenceNumber;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// What a backup covers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackupOption {
    /// Every committed provider and entry.
    Full,
}

/// Describes a backup handed to a callback.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackupInfo {
    /// Unique ID of this backup.
    pub backup_id: Uuid,
    /// Snapshot directory. Only valid while the callback runs.
    pub directory: PathBuf,
    /// Backup scope.
    pub option: BackupOption,
    /// Committed sequence the snapshot was taken at.
    pub sequence: SequenceNumber,
    /// Registered providers captured, implicit children included.
    pub provider_count: usize,
    /// Unix timestamp in milliseconds.
    pub created_at_ms: u64,
}

/// Receives a finished snapshot.
///
/// Invoked exactly once per backup, synchronously. Return `Ok(true)` once
/// the snapshot is safely stored, `Ok(false)` to report failure. Long
/// running callbacks should check `cancel` and return early when it is set.
pub trait BackupCallback {
    /// Handles the snapshot described by `info`.
    fn on_backup(&mut self, info: &BackupInfo, cancel: &CancellationToken) -> CoreResult<bool>;
}

impl<F> BackupCallback for F
where
    F: FnMut(&BackupInfo, &CancellationToken) -> CoreResult<bool>,
{
    fn on_backup(&mut self, info: &BackupInfo, cancel: &CancellationToken) -> CoreResult<bool> {
        self(info, cancel)
    }
}
