//! Storage doubles shared by unit tests.

use parking_lot::Mutex;
use relcoll_storage::{StorageBackend, StorageError, StorageResult};
use std::io;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

/// In-memory log whose bytes outlive the backend and whose `sync` and
/// `truncate` can be made to fail.
#[derive(Debug, Clone, Default)]
pub(crate) struct SharedBackend {
    data: Arc<Mutex<Vec<u8>>>,
    failing_syncs: Arc<AtomicUsize>,
    failing_truncate: Arc<AtomicBool>,
}

impl SharedBackend {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Makes the next `count` syncs fail.
    pub(crate) fn fail_syncs(&self, count: usize) {
        self.failing_syncs.store(count, Ordering::SeqCst);
    }

    pub(crate) fn fail_truncate(&self, on: bool) {
        self.failing_truncate.store(on, Ordering::SeqCst);
    }

    pub(crate) fn len(&self) -> usize {
        self.data.lock().len()
    }

    fn injected(what: &str) -> StorageError {
        StorageError::Io(io::Error::other(format!("injected {what} failure")))
    }
}

impl StorageBackend for SharedBackend {
    fn read_at(&self, offset: u64, len: usize) -> StorageResult<Vec<u8>> {
        let data = self.data.lock();
        let size = data.len() as u64;
        if offset.saturating_add(len as u64) > size {
            return Err(StorageError::ReadPastEnd { offset, len, size });
        }
        let start = offset as usize;
        Ok(data[start..start + len].to_vec())
    }

    fn append(&mut self, new_data: &[u8]) -> StorageResult<u64> {
        let mut data = self.data.lock();
        let offset = data.len() as u64;
        data.extend_from_slice(new_data);
        Ok(offset)
    }

    fn flush(&mut self) -> StorageResult<()> {
        Ok(())
    }

    fn size(&self) -> StorageResult<u64> {
        Ok(self.data.lock().len() as u64)
    }

    fn sync(&mut self) -> StorageResult<()> {
        let pending = self.failing_syncs.load(Ordering::SeqCst);
        if pending > 0 {
            self.failing_syncs.store(pending - 1, Ordering::SeqCst);
            return Err(Self::injected("sync"));
        }
        Ok(())
    }

    fn truncate(&mut self, new_size: u64) -> StorageResult<()> {
        if self.failing_truncate.load(Ordering::SeqCst) {
            return Err(Self::injected("truncate"));
        }
        let mut data = self.data.lock();
        let size = data.len() as u64;
        if new_size > size {
            return Err(StorageError::TruncateBeyondEnd {
                requested: new_size,
                size,
            });
        }
        data.truncate(new_size as usize);
        Ok(())
    }
}
