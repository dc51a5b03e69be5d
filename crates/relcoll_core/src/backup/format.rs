//! On-disk format of snapshot files.

use crate::backup::BackupOption;
use crate::error::{CoreError, CoreResult};
use crate::name::StateProviderName;
use crate::provider::{ProviderEntry, StateProviderKind};
use crate::state_manager::ProviderInfo;
use crate::types::ProviderId;
use crate::wal::compute_crc32;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub(crate) const METADATA_FILE: &str = "backup.json";
pub(crate) const REGISTRY_FILE: &str = "state_manager.chk";
pub(crate) const PROVIDERS_DIR: &str = "providers";

/// Version written to `backup.json`.
pub(crate) const FORMAT_VERSION: u16 = 1;

const REGISTRY_MAGIC: [u8; 4] = *b"RCSM";
const CHECKPOINT_MAGIC: [u8; 4] = *b"RCCK";
const FILE_VERSION: u16 = 1;
/// magic + version
const HEADER_SIZE: usize = 6;
const FOOTER_SIZE: usize = 4;

/// Contents of `backup.json`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupMetadata {
    /// Snapshot format version.
    pub format_version: u16,
    /// Unique ID of the backup.
    pub backup_id: Uuid,
    /// Backup scope.
    pub option: BackupOption,
    /// Committed sequence at snapshot time.
    pub sequence: u64,
    /// Unix timestamp in milliseconds.
    pub created_at_ms: u64,
    /// Registered providers, implicit children included.
    pub provider_count: usize,
    /// Checkpoint files relative to the snapshot directory.
    pub checkpoint_files: Vec<String>,
}

/// Relative path of a provider checkpoint.
pub(crate) fn checkpoint_file(id: ProviderId) -> String {
    format!("{PROVIDERS_DIR}/{}.chk", id.as_u64())
}

pub(crate) fn encode_registry(providers: &[ProviderInfo]) -> CoreResult<Vec<u8>> {
    let mut data = header(REGISTRY_MAGIC);
    put_u32(&mut data, providers.len())?;
    for info in providers {
        data.extend_from_slice(&info.id.as_u64().to_le_bytes());
        match info.parent {
            Some(parent) => {
                data.push(1);
                data.extend_from_slice(&parent.as_u64().to_le_bytes());
            }
            None => data.push(0),
        }
        data.push(info.kind.as_byte());
        put_bytes(&mut data, info.name.as_str().as_bytes())?;
    }
    Ok(seal(data))
}

pub(crate) fn decode_registry(data: &[u8]) -> CoreResult<Vec<ProviderInfo>> {
    let mut cursor = Cursor::new(unseal(data, REGISTRY_MAGIC)?);
    let count = cursor.u32()? as usize;
    let mut providers = Vec::with_capacity(count.min(1024));
    for _ in 0..count {
        let id = ProviderId::new(cursor.u64()?);
        let parent = match cursor.u8()? {
            0 => None,
            1 => Some(ProviderId::new(cursor.u64()?)),
            flag => return Err(CoreError::invalid_format(format!("invalid parent flag {flag}"))),
        };
        let kind_byte = cursor.u8()?;
        let kind = StateProviderKind::from_byte(kind_byte)
            .ok_or_else(|| CoreError::invalid_format(format!("unknown provider kind {kind_byte}")))?;
        let raw = String::from_utf8(cursor.bytes()?)
            .map_err(|_| CoreError::invalid_format("provider name is not UTF-8"))?;
        let name = StateProviderName::new(raw)?;
        providers.push(ProviderInfo {
            id,
            name,
            kind,
            parent,
        });
    }
    cursor.finish()?;
    Ok(providers)
}

pub(crate) fn encode_checkpoint(id: ProviderId, entries: &[ProviderEntry]) -> CoreResult<Vec<u8>> {
    let mut data = header(CHECKPOINT_MAGIC);
    data.extend_from_slice(&id.as_u64().to_le_bytes());
    put_u32(&mut data, entries.len())?;
    for entry in entries {
        put_bytes(&mut data, &entry.key)?;
        put_bytes(&mut data, &entry.value)?;
    }
    Ok(seal(data))
}

pub(crate) fn decode_checkpoint(data: &[u8]) -> CoreResult<(ProviderId, Vec<ProviderEntry>)> {
    let mut cursor = Cursor::new(unseal(data, CHECKPOINT_MAGIC)?);
    let id = ProviderId::new(cursor.u64()?);
    let count = cursor.u32()? as usize;
    let mut entries = Vec::with_capacity(count.min(4096));
    for _ in 0..count {
        let key = cursor.bytes()?;
        let value = cursor.bytes()?;
        entries.push(ProviderEntry::new(key, value));
    }
    cursor.finish()?;
    Ok((id, entries))
}

fn header(magic: [u8; 4]) -> Vec<u8> {
    let mut data = Vec::new();
    data.extend_from_slice(&magic);
    data.extend_from_slice(&FILE_VERSION.to_le_bytes());
    data
}

fn seal(mut data: Vec<u8>) -> Vec<u8> {
    let crc = compute_crc32(&data);
    data.extend_from_slice(&crc.to_le_bytes());
    data
}

/// Checks framing and checksum, returning the body.
fn unseal(data: &[u8], magic: [u8; 4]) -> CoreResult<&[u8]> {
    if data.len() < HEADER_SIZE + FOOTER_SIZE {
        return Err(CoreError::invalid_format("checkpoint file too small"));
    }
    if data[0..4] != magic {
        return Err(CoreError::invalid_format("invalid checkpoint magic"));
    }
    let version = u16::from_le_bytes([data[4], data[5]]);
    if version != FILE_VERSION {
        return Err(CoreError::invalid_format(format!(
            "unsupported checkpoint version: {version}"
        )));
    }

    let footer = data.len() - FOOTER_SIZE;
    let stored = u32::from_le_bytes([data[footer], data[footer + 1], data[footer + 2], data[footer + 3]]);
    let computed = compute_crc32(&data[..footer]);
    if stored != computed {
        return Err(CoreError::ChecksumMismatch {
            expected: stored,
            actual: computed,
        });
    }
    Ok(&data[HEADER_SIZE..footer])
}

fn put_u32(data: &mut Vec<u8>, value: usize) -> CoreResult<()> {
    let value = u32::try_from(value)
        .map_err(|_| CoreError::invalid_format(format!("{value} does not fit in a u32")))?;
    data.extend_from_slice(&value.to_le_bytes());
    Ok(())
}

fn put_bytes(data: &mut Vec<u8>, bytes: &[u8]) -> CoreResult<()> {
    put_u32(data, bytes.len())?;
    data.extend_from_slice(bytes);
    Ok(())
}

struct Cursor<'a> {
    body: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(body: &'a [u8]) -> Self {
        Self { body, pos: 0 }
    }

    fn take(&mut self, len: usize) -> CoreResult<&'a [u8]> {
        let end = self
            .pos
            .checked_add(len)
            .filter(|&end| end <= self.body.len())
            .ok_or_else(|| CoreError::invalid_format("unexpected end of checkpoint"))?;
        let slice = &self.body[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    fn u8(&mut self) -> CoreResult<u8> {
        Ok(self.take(1)?[0])
    }

    fn u32(&mut self) -> CoreResult<u32> {
        let b = self.take(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn u64(&mut self) -> CoreResult<u64> {
        let b = self.take(8)?;
        Ok(u64::from_le_bytes([b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7]]))
    }

    fn bytes(&mut self) -> CoreResult<Vec<u8>> {
        let len = self.u32()? as usize;
        Ok(self.take(len)?.to_vec())
    }

    fn finish(&self) -> CoreResult<()> {
        if self.pos != self.body.len() {
            return Err(CoreError::invalid_format(format!(
                "{} trailing bytes in checkpoint",
                self.body.len() - self.pos
            )));
        }
        Ok(())
    }
}
