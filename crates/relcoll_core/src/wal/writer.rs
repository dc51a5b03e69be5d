//! Log writer and recovery reader.

use crate::error::{CoreError, CoreResult};
use crate::wal::record::{compute_crc32, LogRecord, LogRecordType, LOG_MAGIC, LOG_VERSION};
use parking_lot::Mutex;
use relcoll_storage::StorageBackend;
use std::sync::atomic::{AtomicBool, Ordering};

/// magic (4) + version (2) + type (1) + length (4)
const HEADER_SIZE: usize = 11;

const CRC_SIZE: usize = 4;

/// Records read back from the log at open.
#[derive(Debug, Default)]
pub struct RecoveredLog {
    /// Complete records in log order, with their offsets.
    pub records: Vec<(u64, LogRecord)>,
    /// Bytes of torn tail that were cut off.
    pub truncated_bytes: u64,
}

/// Append-only replicator log over a storage backend.
pub struct ReplicatorLog {
    backend: Mutex<Box<dyn StorageBackend>>,
    sync_on_commit: bool,
    /// Set when a failed append could not be rolled back.
    failed: AtomicBool,
}

impl ReplicatorLog {
    /// Creates a log over `backend`.
    pub fn new(backend: Box<dyn StorageBackend>, sync_on_commit: bool) -> Self {
        Self {
            backend: Mutex::new(backend),
            sync_on_commit,
            failed: AtomicBool::new(false),
        }
    }

    /// Encodes one record with its envelope.
    pub fn encode(record: &LogRecord) -> CoreResult<Vec<u8>> {
        let payload = record.encode_payload()?;
        let len = u32::try_from(payload.len())
            .map_err(|_| CoreError::codec("log record payload too large"))?;

        let mut data = Vec::with_capacity(HEADER_SIZE + payload.len() + CRC_SIZE);
        data.extend_from_slice(&LOG_MAGIC);
        data.extend_from_slice(&LOG_VERSION.to_le_bytes());
        data.push(record.record_type().as_byte());
        data.extend_from_slice(&len.to_le_bytes());
        data.extend_from_slice(&payload);

        let crc = compute_crc32(&data);
        data.extend_from_slice(&crc.to_le_bytes());
        Ok(data)
    }

    /// Appends a whole transaction in one write.
    ///
    /// Returns the offset of the first record. If the write or the flush
    /// fails, the log is cut back to that offset before the error is
    /// returned. When the cut fails too, the log is marked failed and
    /// refuses further appends.
    pub fn append_batch(&self, records: &[LogRecord]) -> CoreResult<u64> {
        let mut data = Vec::new();
        for record in records {
            data.extend_from_slice(&Self::encode(record)?);
        }

        let mut backend = self.backend.lock();
        if self.is_failed() {
            return Err(CoreError::invalid_state(
                "replicator log holds an unfinished append",
            ));
        }
        let offset = backend.size()?;

        let written = backend.append(&data).and_then(|_| {
            if self.sync_on_commit {
                backend.sync()
            } else {
                backend.flush()
            }
        });
        if let Err(e) = written {
            self.cut_back(backend.as_mut(), offset);
            return Err(e.into());
        }
        Ok(offset)
    }

    /// Removes everything appended at or after `offset`.
    ///
    /// Used when a logged transaction cannot be applied. Marks the log
    /// failed if the bytes cannot be removed.
    pub fn roll_back(&self, offset: u64) {
        let mut backend = self.backend.lock();
        self.cut_back(backend.as_mut(), offset);
    }

    /// Whether an append is stuck in the log.
    #[must_use]
    pub fn is_failed(&self) -> bool {
        self.failed.load(Ordering::SeqCst)
    }

    fn cut_back(&self, backend: &mut dyn StorageBackend, offset: u64) {
        let result = match backend.size() {
            Ok(size) if size <= offset => Ok(()),
            Ok(_) => backend.truncate(offset).and_then(|()| backend.sync()),
            Err(e) => Err(e),
        };
        match result {
            Ok(()) => tracing::warn!(offset, "rolled back replicator log"),
            Err(e) => {
                tracing::error!(offset, error = %e, "failed to roll back replicator log");
                self.failed.store(true, Ordering::SeqCst);
            }
        }
    }

    /// Flushes all pending writes.
    pub fn flush(&self) -> CoreResult<()> {
        self.backend.lock().flush()?;
        Ok(())
    }

    /// Returns the current log size.
    pub fn size(&self) -> CoreResult<u64> {
        Ok(self.backend.lock().size()?)
    }

    /// Reads every complete record and cuts off a torn tail.
    ///
    /// # Errors
    ///
    /// Fails on checksum mismatch, bad magic, unknown record type or an
    /// unsupported version.
    pub fn recover(&self) -> CoreResult<RecoveredLog> {
        let mut backend = self.backend.lock();
        let data = backend.read_all()?;
        let (records, valid_end) = parse_records(&data)?;

        let truncated_bytes = data.len() as u64 - valid_end;
        if truncated_bytes > 0 {
            tracing::warn!(
                valid_end,
                truncated_bytes,
                "cutting torn tail off replicator log"
            );
            backend.truncate(valid_end)?;
            backend.sync()?;
        }

        Ok(RecoveredLog {
            records,
            truncated_bytes,
        })
    }
}

impl std::fmt::Debug for ReplicatorLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReplicatorLog")
            .field("sync_on_commit", &self.sync_on_commit)
            .finish_non_exhaustive()
    }
}

/// Parses records until the data ends or a record is incomplete.
///
/// Returns the records and the offset just past the last complete one.
fn parse_records(data: &[u8]) -> CoreResult<(Vec<(u64, LogRecord)>, u64)> {
    let mut records = Vec::new();
    let mut offset = 0usize;

    while data.len() - offset >= HEADER_SIZE {
        let header = &data[offset..offset + HEADER_SIZE];

        if header[0..4] != LOG_MAGIC {
            return Err(CoreError::log_corruption(format!(
                "invalid magic at offset {offset}"
            )));
        }

        let version = u16::from_le_bytes([header[4], header[5]]);
        if version > LOG_VERSION {
            return Err(CoreError::log_corruption(format!(
                "unsupported version {version} at offset {offset}"
            )));
        }

        let type_byte = header[6];
        let record_type = LogRecordType::from_byte(type_byte).ok_or_else(|| {
            CoreError::log_corruption(format!(
                "unknown record type {type_byte} at offset {offset}"
            ))
        })?;

        let len = u32::from_le_bytes([header[7], header[8], header[9], header[10]]) as usize;
        let total = HEADER_SIZE + len + CRC_SIZE;
        if data.len() - offset < total {
            break;
        }

        let body_end = offset + HEADER_SIZE + len;
        let stored = u32::from_le_bytes([
            data[body_end],
            data[body_end + 1],
            data[body_end + 2],
            data[body_end + 3],
        ]);
        let computed = compute_crc32(&data[offset..body_end]);
        if stored != computed {
            return Err(CoreError::ChecksumMismatch {
                expected: stored,
                actual: computed,
            });
        }

        let record = LogRecord::decode_payload(record_type, &data[offset + HEADER_SIZE..body_end])?;
        records.push((offset as u64, record));
        offset += total;
    }

    Ok((records, offset as u64))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::ProviderOp;
    use crate::types::{ProviderId, SequenceNumber, TransactionId};
    use crate::test_support::SharedBackend;
    use relcoll_storage::InMemoryBackend;

    fn transaction(txid: u64, seq: u64) -> Vec<LogRecord> {
        let txid = TransactionId::new(txid);
        vec![
            LogRecord::Begin { txid },
            LogRecord::Write {
                txid,
                provider: ProviderId::new(2),
                op: ProviderOp::Enqueue { value: vec![1, 2] },
            },
            LogRecord::Commit {
                txid,
                sequence: SequenceNumber::new(seq),
            },
        ]
    }

    #[test]
    fn failed_sync_leaves_no_trace() {
        let backend = SharedBackend::new();
        let log = ReplicatorLog::new(Box::new(backend.clone()), true);
        log.append_batch(&transaction(1, 1)).unwrap();
        let committed = backend.len();

        backend.fail_syncs(1);
        assert!(log.append_batch(&transaction(2, 2)).is_err());
        assert_eq!(backend.len(), committed);
        assert!(!log.is_failed());

        log.append_batch(&transaction(3, 2)).unwrap();
        let txids: Vec<_> = log
            .recover()
            .unwrap()
            .records
            .iter()
            .map(|(_, r)| r.txid().as_u64())
            .collect();
        assert_eq!(txids, vec![1, 1, 1, 3, 3, 3]);
    }

    #[test]
    fn unremovable_append_fails_the_log() {
        let backend = SharedBackend::new();
        let log = ReplicatorLog::new(Box::new(backend.clone()), true);

        backend.fail_syncs(1);
        backend.fail_truncate(true);
        assert!(log.append_batch(&transaction(1, 1)).is_err());
        assert!(log.is_failed());

        backend.fail_truncate(false);
        assert!(log
            .append_batch(&transaction(2, 1))
            .unwrap_err()
            .is_invalid_state());
    }

    fn log_with(data: Vec<u8>) -> ReplicatorLog {
        ReplicatorLog::new(Box::new(InMemoryBackend::with_data(data)), false)
    }

    #[test]
    fn append_and_recover() {
        let log = ReplicatorLog::new(Box::new(InMemoryBackend::new()), true);
        log.append_batch(&transaction(1, 1)).unwrap();
        log.append_batch(&transaction(2, 2)).unwrap();

        let recovered = log.recover().unwrap();
        assert_eq!(recovered.records.len(), 6);
        assert_eq!(recovered.truncated_bytes, 0);
        assert_eq!(recovered.records[3].1, LogRecord::Begin { txid: TransactionId::new(2) });
    }

    #[test]
    fn torn_tail_is_cut_off() {
        let mut data = Vec::new();
        for record in transaction(1, 1) {
            data.extend(ReplicatorLog::encode(&record).unwrap());
        }
        let complete = data.len() as u64;
        let torn = ReplicatorLog::encode(&LogRecord::Begin {
            txid: TransactionId::new(2),
        })
        .unwrap();
        data.extend_from_slice(&torn[..torn.len() - 3]);

        let log = log_with(data);
        let recovered = log.recover().unwrap();
        assert_eq!(recovered.records.len(), 3);
        assert_eq!(recovered.truncated_bytes, torn.len() as u64 - 3);
        assert_eq!(log.size().unwrap(), complete);
    }

    #[test]
    fn short_header_is_cut_off() {
        let mut data = ReplicatorLog::encode(&LogRecord::Begin {
            txid: TransactionId::new(1),
        })
        .unwrap();
        data.extend_from_slice(&LOG_MAGIC);
        let recovered = log_with(data).recover().unwrap();
        assert_eq!(recovered.records.len(), 1);
        assert_eq!(recovered.truncated_bytes, 4);
    }

    #[test]
    fn crc_mismatch_is_fatal() {
        let mut data = ReplicatorLog::encode(&LogRecord::Begin {
            txid: TransactionId::new(1),
        })
        .unwrap();
        data[HEADER_SIZE] ^= 0xFF;
        assert!(matches!(
            log_with(data).recover(),
            Err(CoreError::ChecksumMismatch { .. })
        ));
    }

    #[test]
    fn bad_magic_is_fatal() {
        let mut data = ReplicatorLog::encode(&LogRecord::Begin {
            txid: TransactionId::new(1),
        })
        .unwrap();
        data[0] = b'X';
        assert!(matches!(
            log_with(data).recover(),
            Err(CoreError::LogCorruption { .. })
        ));
    }
}
