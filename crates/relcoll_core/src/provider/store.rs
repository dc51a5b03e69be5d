//! Built-in provider stores.

use super::{unsupported_op, ProviderEntry, ProviderOp, StateProvider, StateProviderKind};
use crate::error::{CoreError, CoreResult};
use std::collections::{BTreeMap, VecDeque};

/// Ordered key/value store behind a reliable dictionary.
#[derive(Debug, Default)]
pub struct DictionaryStore {
    entries: BTreeMap<Vec<u8>, Vec<u8>>,
}

impl DictionaryStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl StateProvider for DictionaryStore {
    fn kind(&self) -> StateProviderKind {
        StateProviderKind::Dictionary
    }

    fn count(&self) -> u64 {
        self.entries.len() as u64
    }

    fn get(&self, key: &[u8]) -> Option<&[u8]> {
        self.entries.get(key).map(Vec::as_slice)
    }

    fn apply(&mut self, op: &ProviderOp) -> CoreResult<()> {
        match op {
            ProviderOp::Add { key, value } => {
                if self.entries.contains_key(key) {
                    return Err(CoreError::invalid_state("add on a key that is already present"));
                }
                self.entries.insert(key.clone(), value.clone());
            }
            ProviderOp::Set { key, value } => {
                self.entries.insert(key.clone(), value.clone());
            }
            ProviderOp::Remove { key } => {
                self.entries.remove(key);
            }
            ProviderOp::Enqueue { .. } | ProviderOp::Dequeue => {
                return Err(unsupported_op(self.kind(), op));
            }
        }
        Ok(())
    }

    fn entries(&self) -> Vec<ProviderEntry> {
        self.entries
            .iter()
            .map(|(k, v)| ProviderEntry::new(k.clone(), v.clone()))
            .collect()
    }
}

/// FIFO store behind a reliable queue.
#[derive(Debug)]
pub struct QueueStore {
    kind: StateProviderKind,
    items: VecDeque<Vec<u8>>,
}

impl QueueStore {
    /// Creates an empty queue of the given kind.
    #[must_use]
    pub fn new(kind: StateProviderKind) -> Self {
        Self {
            kind,
            items: VecDeque::new(),
        }
    }

    /// Encodes a position from the head as an entry key.
    #[must_use]
    pub fn position_key(position: u64) -> [u8; 8] {
        position.to_be_bytes()
    }

    fn decode_position(key: &[u8]) -> Option<usize> {
        let bytes: [u8; 8] = key.try_into().ok()?;
        usize::try_from(u64::from_be_bytes(bytes)).ok()
    }
}

impl StateProvider for QueueStore {
    fn kind(&self) -> StateProviderKind {
        self.kind
    }

    fn count(&self) -> u64 {
        self.items.len() as u64
    }

    fn get(&self, key: &[u8]) -> Option<&[u8]> {
        let position = Self::decode_position(key)?;
        self.items.get(position).map(Vec::as_slice)
    }

    fn apply(&mut self, op: &ProviderOp) -> CoreResult<()> {
        match op {
            ProviderOp::Enqueue { value } => self.items.push_back(value.clone()),
            ProviderOp::Dequeue => {
                if self.items.pop_front().is_none() {
                    return Err(CoreError::invalid_state("dequeue from an empty queue"));
                }
            }
            _ => return Err(unsupported_op(self.kind, op)),
        }
        Ok(())
    }

    fn entries(&self) -> Vec<ProviderEntry> {
        self.items
            .iter()
            .enumerate()
            .map(|(i, v)| ProviderEntry::new(Self::position_key(i as u64).to_vec(), v.clone()))
            .collect()
    }
}
