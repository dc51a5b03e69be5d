//! Storage backend trait.

use crate::error::StorageResult;

/// An append-only byte store holding a replicator log.
///
/// # Invariants
///
/// - `append` returns the offset the bytes were written at
/// - `read_at` returns exactly the bytes previously appended there
/// - after `flush` returns, appended bytes survive process exit
/// - `truncate` only shrinks; it is how a torn log tail is cut off
pub trait StorageBackend: Send + Sync {
    /// Reads `len` bytes starting at `offset`.
    ///
    /// # Errors
    ///
    /// Fails with `ReadPastEnd` if the range is not fully stored.
    fn read_at(&self, offset: u64, len: usize) -> StorageResult<Vec<u8>>;

    /// Appends `data` and returns the offset it starts at.
    fn append(&mut self, data: &[u8]) -> StorageResult<u64>;

    /// Pushes appended bytes to durable storage.
    fn flush(&mut self) -> StorageResult<()>;

    /// Current size in bytes, which is where the next append lands.
    fn size(&self) -> StorageResult<u64>;

    /// Flushes data and file metadata.
    fn sync(&mut self) -> StorageResult<()>;

    /// Cuts the store down to `new_size` bytes.
    ///
    /// # Errors
    ///
    /// Fails with `TruncateBeyondEnd` if `new_size` exceeds the current size.
    fn truncate(&mut self, new_size: u64) -> StorageResult<()>;

    /// Reads every stored byte.
    fn read_all(&self) -> StorageResult<Vec<u8>> {
        let size = self.size()?;
        let len = usize::try_from(size).map_err(|_| crate::StorageError::ReadPastEnd {
            offset: 0,
            len: usize::MAX,
            size,
        })?;
        self.read_at(0, len)
    }
}
