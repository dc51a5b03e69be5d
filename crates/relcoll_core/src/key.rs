//! Order-preserving key encodings for reliable dictionaries.

use crate::error::{CoreError, CoreResult};

/// A type usable as a reliable dictionary key.
///
/// Encodings preserve order: for any `a < b`, `a.encode_key() < b.encode_key()`
/// byte-wise. Committed entries and backups are therefore key ordered.
pub trait DictionaryKey: Sized + Clone + Send + Sync + 'static {
    /// Encodes the key.
    fn encode_key(&self) -> Vec<u8>;

    /// Decodes a key produced by [`DictionaryKey::encode_key`].
    fn decode_key(bytes: &[u8]) -> CoreResult<Self>;
}

fn fixed<const N: usize>(bytes: &[u8]) -> CoreResult<[u8; N]> {
    bytes
        .try_into()
        .map_err(|_| CoreError::codec(format!("expected {N} key bytes, got {}", bytes.len())))
}

impl DictionaryKey for u64 {
    fn encode_key(&self) -> Vec<u8> {
        self.to_be_bytes().to_vec()
    }

    fn decode_key(bytes: &[u8]) -> CoreResult<Self> {
        Ok(Self::from_be_bytes(fixed(bytes)?))
    }
}

impl DictionaryKey for u32 {
    fn encode_key(&self) -> Vec<u8> {
        self.to_be_bytes().to_vec()
    }

    fn decode_key(bytes: &[u8]) -> CoreResult<Self> {
        Ok(Self::from_be_bytes(fixed(bytes)?))
    }
}

impl DictionaryKey for i64 {
    fn encode_key(&self) -> Vec<u8> {
        // Flipping the sign bit maps i64 order onto u64 order.
        ((*self as u64) ^ (1 << 63)).to_be_bytes().to_vec()
    }

    fn decode_key(bytes: &[u8]) -> CoreResult<Self> {
        Ok((u64::from_be_bytes(fixed(bytes)?) ^ (1 << 63)) as i64)
    }
}

impl DictionaryKey for String {
    fn encode_key(&self) -> Vec<u8> {
        self.as_bytes().to_vec()
    }

    fn decode_key(bytes: &[u8]) -> CoreResult<Self> {
        String::from_utf8(bytes.to_vec()).map_err(|e| CoreError::codec(e.to_string()))
    }
}
