//! Log record types and serialization.

use crate::error::{CoreError, CoreResult};
use crate::name::StateProviderName;
use crate::provider::{ProviderOp, StateProviderKind};
use crate::types::{ProviderId, SequenceNumber, TransactionId};

/// Magic bytes identifying a log record.
pub const LOG_MAGIC: [u8; 4] = *b"RCLG";

/// Current log format version.
pub const LOG_VERSION: u16 = 1;

/// Type of log record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum LogRecordType {
    /// Begin a transaction.
    Begin = 1,
    /// Register a state provider.
    AddProvider = 2,
    /// Insert a new dictionary key.
    DictionaryAdd = 3,
    /// Insert or overwrite a dictionary key.
    DictionarySet = 4,
    /// Remove a dictionary key.
    DictionaryRemove = 5,
    /// Append a queue item.
    Enqueue = 6,
    /// Drop the head queue item.
    Dequeue = 7,
    /// Commit a transaction.
    Commit = 8,
}

impl LogRecordType {
    /// Converts a byte to a record type.
    pub fn from_byte(b: u8) -> Option<Self> {
        match b {
            1 => Some(Self::Begin),
            2 => Some(Self::AddProvider),
            3 => Some(Self::DictionaryAdd),
            4 => Some(Self::DictionarySet),
            5 => Some(Self::DictionaryRemove),
            6 => Some(Self::Enqueue),
            7 => Some(Self::Dequeue),
            8 => Some(Self::Commit),
            _ => None,
        }
    }

    /// Converts the record type to a byte.
    #[must_use]
    pub const fn as_byte(self) -> u8 {
        self as u8
    }
}

/// A record in the replicator log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogRecord {
    /// Begin a transaction.
    Begin {
        /// Transaction ID.
        txid: TransactionId,
    },

    /// Register a state provider.
    AddProvider {
        /// Transaction ID.
        txid: TransactionId,
        /// ID assigned to the provider.
        id: ProviderId,
        /// ID assigned to its data store child, if one is registered.
        data_store: Option<ProviderId>,
        /// Collection kind.
        kind: StateProviderKind,
        /// Provider name.
        name: StateProviderName,
    },

    /// Mutate the entries of a provider.
    Write {
        /// Transaction ID.
        txid: TransactionId,
        /// Provider the op targets.
        provider: ProviderId,
        /// The mutation.
        op: ProviderOp,
    },

    /// Commit a transaction.
    Commit {
        /// Transaction ID.
        txid: TransactionId,
        /// Sequence number assigned to this commit.
        sequence: SequenceNumber,
    },
}

impl LogRecord {
    /// Returns the record type.
    #[must_use]
    pub fn record_type(&self) -> LogRecordType {
        match self {
            Self::Begin { .. } => LogRecordType::Begin,
            Self::AddProvider { .. } => LogRecordType::AddProvider,
            Self::Write { op, .. } => match op {
                ProviderOp::Add { .. } => LogRecordType::DictionaryAdd,
                ProviderOp::Set { .. } => LogRecordType::DictionarySet,
                ProviderOp::Remove { .. } => LogRecordType::DictionaryRemove,
                ProviderOp::Enqueue { .. } => LogRecordType::Enqueue,
                ProviderOp::Dequeue => LogRecordType::Dequeue,
            },
            Self::Commit { .. } => LogRecordType::Commit,
        }
    }

    /// Returns the transaction this record belongs to.
    #[must_use]
    pub fn txid(&self) -> TransactionId {
        match self {
            Self::Begin { txid }
            | Self::AddProvider { txid, .. }
            | Self::Write { txid, .. }
            | Self::Commit { txid, .. } => *txid,
        }
    }

    /// Serializes the record payload (without envelope).
    pub fn encode_payload(&self) -> CoreResult<Vec<u8>> {
        let mut buf = Vec::new();
        buf.extend_from_slice(&self.txid().as_u64().to_le_bytes());

        match self {
            Self::Begin { .. } => {}

            Self::AddProvider {
                id,
                data_store,
                kind,
                name,
                ..
            } => {
                buf.extend_from_slice(&id.as_u64().to_le_bytes());
                match data_store {
                    Some(child) => {
                        buf.push(1);
                        buf.extend_from_slice(&child.as_u64().to_le_bytes());
                    }
                    None => buf.push(0),
                }
                buf.push(kind.as_byte());
                put_bytes(&mut buf, name.as_str().as_bytes())?;
            }

            Self::Write { provider, op, .. } => {
                buf.extend_from_slice(&provider.as_u64().to_le_bytes());
                match op {
                    ProviderOp::Add { key, value } | ProviderOp::Set { key, value } => {
                        put_bytes(&mut buf, key)?;
                        put_bytes(&mut buf, value)?;
                    }
                    ProviderOp::Remove { key } => put_bytes(&mut buf, key)?,
                    ProviderOp::Enqueue { value } => put_bytes(&mut buf, value)?,
                    ProviderOp::Dequeue => {}
                }
            }

            Self::Commit { sequence, .. } => {
                buf.extend_from_slice(&sequence.as_u64().to_le_bytes());
            }
        }

        Ok(buf)
    }

    /// Deserializes a record from its type and payload.
    pub fn decode_payload(record_type: LogRecordType, payload: &[u8]) -> CoreResult<Self> {
        let mut reader = PayloadReader::new(payload);
        let txid = TransactionId::new(reader.u64()?);

        let record = match record_type {
            LogRecordType::Begin => Self::Begin { txid },

            LogRecordType::AddProvider => {
                let id = ProviderId::new(reader.u64()?);
                let data_store = match reader.u8()? {
                    0 => None,
                    1 => Some(ProviderId::new(reader.u64()?)),
                    flag => {
                        return Err(CoreError::log_corruption(format!(
                            "invalid data store flag {flag}"
                        )))
                    }
                };
                let kind_byte = reader.u8()?;
                let kind = StateProviderKind::from_byte(kind_byte).ok_or_else(|| {
                    CoreError::log_corruption(format!("unknown provider kind {kind_byte}"))
                })?;
                let raw = String::from_utf8(reader.bytes()?)
                    .map_err(|_| CoreError::log_corruption("provider name is not UTF-8"))?;
                let name = StateProviderName::new(raw)
                    .map_err(|e| CoreError::log_corruption(e.to_string()))?;
                Self::AddProvider {
                    txid,
                    id,
                    data_store,
                    kind,
                    name,
                }
            }

            LogRecordType::DictionaryAdd
            | LogRecordType::DictionarySet
            | LogRecordType::DictionaryRemove
            | LogRecordType::Enqueue
            | LogRecordType::Dequeue => {
                let provider = ProviderId::new(reader.u64()?);
                let op = match record_type {
                    LogRecordType::DictionaryAdd => ProviderOp::Add {
                        key: reader.bytes()?,
                        value: reader.bytes()?,
                    },
                    LogRecordType::DictionarySet => ProviderOp::Set {
                        key: reader.bytes()?,
                        value: reader.bytes()?,
                    },
                    LogRecordType::DictionaryRemove => ProviderOp::Remove {
                        key: reader.bytes()?,
                    },
                    LogRecordType::Enqueue => ProviderOp::Enqueue {
                        value: reader.bytes()?,
                    },
                    _ => ProviderOp::Dequeue,
                };
                Self::Write { txid, provider, op }
            }

            LogRecordType::Commit => Self::Commit {
                txid,
                sequence: SequenceNumber::new(reader.u64()?),
            },
        };

        reader.finish(record_type)?;
        Ok(record)
    }
}

fn put_bytes(buf: &mut Vec<u8>, data: &[u8]) -> CoreResult<()> {
    let len = u32::try_from(data.len())
        .map_err(|_| CoreError::codec(format!("field too large: {} bytes", data.len())))?;
    buf.extend_from_slice(&len.to_le_bytes());
    buf.extend_from_slice(data);
    Ok(())
}

struct PayloadReader<'a> {
    payload: &'a [u8],
    cursor: usize,
}

impl<'a> PayloadReader<'a> {
    fn new(payload: &'a [u8]) -> Self {
        Self { payload, cursor: 0 }
    }

    fn take(&mut self, len: usize) -> CoreResult<&'a [u8]> {
        let end = self
            .cursor
            .checked_add(len)
            .filter(|&end| end <= self.payload.len())
            .ok_or_else(|| CoreError::log_corruption("unexpected end of payload"))?;
        let slice = &self.payload[self.cursor..end];
        self.cursor = end;
        Ok(slice)
    }

    fn u8(&mut self) -> CoreResult<u8> {
        Ok(self.take(1)?[0])
    }

    fn u64(&mut self) -> CoreResult<u64> {
        let bytes: [u8; 8] = self
            .take(8)?
            .try_into()
            .map_err(|_| CoreError::log_corruption("invalid u64"))?;
        Ok(u64::from_le_bytes(bytes))
    }

    fn bytes(&mut self) -> CoreResult<Vec<u8>> {
        let len: [u8; 4] = self
            .take(4)?
            .try_into()
            .map_err(|_| CoreError::log_corruption("invalid length"))?;
        Ok(self.take(u32::from_le_bytes(len) as usize)?.to_vec())
    }

    fn finish(&self, record_type: LogRecordType) -> CoreResult<()> {
        if self.cursor != self.payload.len() {
            return Err(CoreError::log_corruption(format!(
                "trailing bytes in {record_type:?} record: expected {} bytes, got {}",
                self.cursor,
                self.payload.len()
            )));
        }
        Ok(())
    }
}

/// Computes CRC32 checksum for data.
pub fn compute_crc32(data: &[u8]) -> u32 {
    // IEEE polynomial, reflected
    const CRC32_TABLE: [u32; 256] = {
        let mut table = [0u32; 256];
        let mut i = 0;
        while i < 256 {
            let mut crc = i as u32;
            let mut j = 0;
            while j < 8 {
                if crc & 1 != 0 {
                    crc = (crc >> 1) ^ 0xEDB8_8320;
                } else {
                    crc >>= 1;
                }
                j += 1;
            }
            table[i] = crc;
            i += 1;
        }
        table
    };

    let mut crc = 0xFFFF_FFFF_u32;
    for &byte in data {
        let index = ((crc ^ u32::from(byte)) & 0xFF) as usize;
        crc = (crc >> 8) ^ CRC32_TABLE[index];
    }
    !crc
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(record: LogRecord) {
        let payload = record.encode_payload().unwrap();
        let decoded = LogRecord::decode_payload(record.record_type(), &payload).unwrap();
        assert_eq!(record, decoded);
    }

    #[test]
    fn add_provider_with_and_without_child() {
        let name = StateProviderName::new("urn:testDictionary").unwrap();
        roundtrip(LogRecord::AddProvider {
            txid: TransactionId::new(3),
            id: ProviderId::new(1),
            data_store: Some(ProviderId::new(2)),
            kind: StateProviderKind::Dictionary,
            name: name.clone(),
        });
        roundtrip(LogRecord::AddProvider {
            txid: TransactionId::new(3),
            id: ProviderId::new(1),
            data_store: None,
            kind: StateProviderKind::Queue,
            name,
        });
    }

    #[test]
    fn write_ops_map_to_their_record_types() {
        let cases = [
            (
                ProviderOp::Add {
                    key: vec![1],
                    value: vec![2, 3],
                },
                LogRecordType::DictionaryAdd,
            ),
            (
                ProviderOp::Set {
                    key: vec![1],
                    value: vec![],
                },
                LogRecordType::DictionarySet,
            ),
            (ProviderOp::Remove { key: vec![9] }, LogRecordType::DictionaryRemove),
            (ProviderOp::Enqueue { value: vec![4] }, LogRecordType::Enqueue),
            (ProviderOp::Dequeue, LogRecordType::Dequeue),
        ];
        for (op, expected) in cases {
            let record = LogRecord::Write {
                txid: TransactionId::new(1),
                provider: ProviderId::new(2),
                op,
            };
            assert_eq!(record.record_type(), expected);
            roundtrip(record);
        }
    }

    #[test]
    fn trailing_bytes_are_corruption() {
        let record = LogRecord::Commit {
            txid: TransactionId::new(7),
            sequence: SequenceNumber::new(100),
        };
        let mut payload = record.encode_payload().unwrap();
        payload.push(0);
        assert!(matches!(
            LogRecord::decode_payload(LogRecordType::Commit, &payload),
            Err(CoreError::LogCorruption { .. })
        ));
    }

    #[test]
    fn short_payload_is_corruption() {
        assert!(LogRecord::decode_payload(LogRecordType::Begin, &[1, 2]).is_err());
    }

    #[test]
    fn crc32_known_value() {
        assert_eq!(compute_crc32(b"123456789"), 0xCBF4_3926);
    }
}
