//! Error types for relcoll core.

use crate::provider::StateProviderKind;
use std::io;
use std::path::PathBuf;
use thiserror::Error;
use uuid::Uuid;

/// Result type for core operations.
pub type CoreResult<T> = Result<T, CoreError>;

/// Errors that can occur in relcoll core operations.
#[derive(Debug, Error)]
pub enum CoreError {
    /// Storage backend error.
    #[error("storage error: {0}")]
    Storage(#[from] relcoll_storage::StorageError),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Backup metadata could not be encoded or decoded.
    #[error("backup metadata error: {0}")]
    Json(#[from] serde_json::Error),

    /// A value serializer failed.
    #[error("codec error: {message}")]
    Codec {
        /// Description of the failure.
        message: String,
    },

    /// The replicator log is corrupted.
    #[error("log corruption: {message}")]
    LogCorruption {
        /// Description of the corruption.
        message: String,
    },

    /// Checksum mismatch detected.
    #[error("checksum mismatch: expected {expected:08x}, got {actual:08x}")]
    ChecksumMismatch {
        /// Expected checksum.
        expected: u32,
        /// Actual checksum.
        actual: u32,
    },

    /// A persisted file has an unexpected layout.
    #[error("invalid format: {message}")]
    InvalidFormat {
        /// Description of the format issue.
        message: String,
    },

    /// Operation attempted in the wrong lifecycle state.
    #[error("invalid state: {message}")]
    InvalidState {
        /// Description of why the operation is not allowed.
        message: String,
    },

    /// A state provider or service name is malformed.
    #[error("invalid name {name:?}: {reason}")]
    InvalidName {
        /// The rejected name.
        name: String,
        /// Why it was rejected.
        reason: String,
    },

    /// A state provider with this name is already registered.
    #[error("state provider already exists: {name}")]
    DuplicateName {
        /// The conflicting name.
        name: String,
    },

    /// No state provider is registered under this name.
    #[error("state provider not found: {name}")]
    NotFound {
        /// The name looked up.
        name: String,
    },

    /// The provider exists but is not of the requested kind.
    #[error("state provider {name} is a {actual}, not a {expected}")]
    KindMismatch {
        /// The provider name.
        name: String,
        /// Kind the caller asked for.
        expected: StateProviderKind,
        /// Kind actually registered.
        actual: StateProviderKind,
    },

    /// Dictionary add on a key that is already present.
    #[error("key already exists in {name}")]
    KeyExists {
        /// The dictionary name.
        name: String,
    },

    /// No serializer was registered for a value type.
    #[error("no state serializer registered for {type_name}")]
    SerializerNotRegistered {
        /// Rust type name of the value.
        type_name: &'static str,
    },

    /// An observed count did not match the committed-state invariant.
    #[error("consistency violation {stage}: expected {expected}, observed {actual}")]
    ConsistencyViolation {
        /// Where the check ran.
        stage: String,
        /// Expected value.
        expected: u64,
        /// Observed value.
        actual: u64,
    },

    /// Another backup is still in flight.
    #[error("a backup is already in progress")]
    BackupInProgress,

    /// The backup callback reported failure.
    #[error("backup {backup_id} was rejected by its callback")]
    BackupRejected {
        /// The rejected backup.
        backup_id: Uuid,
    },

    /// The backup was cancelled by its caller.
    #[error("backup {backup_id} was cancelled")]
    BackupCancelled {
        /// The cancelled backup.
        backup_id: Uuid,
    },

    /// Another process holds the replica directory.
    #[error("replica directory locked: {}", path.display())]
    ReplicaLocked {
        /// The locked directory.
        path: PathBuf,
    },
}

impl CoreError {
    /// Creates a codec error.
    pub fn codec(message: impl Into<String>) -> Self {
        Self::Codec {
            message: message.into(),
        }
    }

    /// Creates a log corruption error.
    pub fn log_corruption(message: impl Into<String>) -> Self {
        Self::LogCorruption {
            message: message.into(),
        }
    }

    /// Creates an invalid format error.
    pub fn invalid_format(message: impl Into<String>) -> Self {
        Self::InvalidFormat {
            message: message.into(),
        }
    }

    /// Creates an invalid state error.
    pub fn invalid_state(message: impl Into<String>) -> Self {
        Self::InvalidState {
            message: message.into(),
        }
    }

    /// Creates an invalid name error.
    pub fn invalid_name(name: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidName {
            name: name.into(),
            reason: reason.into(),
        }
    }

    /// Creates a duplicate name error.
    pub fn duplicate_name(name: impl ToString) -> Self {
        Self::DuplicateName {
            name: name.to_string(),
        }
    }

    /// Creates a not found error.
    pub fn not_found(name: impl ToString) -> Self {
        Self::NotFound {
            name: name.to_string(),
        }
    }

    /// Creates a key exists error.
    pub fn key_exists(name: impl ToString) -> Self {
        Self::KeyExists {
            name: name.to_string(),
        }
    }

    /// Creates a consistency violation.
    pub fn consistency_violation(stage: impl Into<String>, expected: u64, actual: u64) -> Self {
        Self::ConsistencyViolation {
            stage: stage.into(),
            expected,
            actual,
        }
    }

    /// Returns true for lifecycle errors.
    #[must_use]
    pub fn is_invalid_state(&self) -> bool {
        matches!(self, Self::InvalidState { .. })
    }
}
