//! Error types for the backup generator.

use relcoll_core::CoreError;
use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Result type for generator operations.
pub type GeneratorResult<T> = Result<T, GeneratorError>;

/// Errors raised while generating a backup.
#[derive(Debug, Error)]
pub enum GeneratorError {
    /// The replica or one of its collections failed.
    #[error(transparent)]
    Core(#[from] CoreError),

    /// Preparing the log folder failed.
    #[error("I/O error on {}: {source}", path.display())]
    Io {
        /// Path being prepared.
        path: PathBuf,
        /// Underlying error.
        source: io::Error,
    },

    /// The backup callback ran but nothing was copied.
    #[error("backup completed without a copied snapshot")]
    NothingCopied,
}

impl GeneratorError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}
