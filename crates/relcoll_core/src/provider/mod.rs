//! State providers: the in-memory stores behind reliable collections.
//!
//! A state provider holds the committed contents of one collection as raw
//! key/value bytes. Providers never see uncommitted data; the replicator
//! applies an operation only after its commit record is durable.

mod factory;
mod store;

pub use factory::{DefaultStateProviderFactory, StateProviderFactory};
pub use store::{DictionaryStore, QueueStore};

use crate::error::{CoreError, CoreResult};
use std::fmt;

/// Kind of a registered state provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum StateProviderKind {
    /// Key/value dictionary with unique keys.
    Dictionary = 1,
    /// FIFO queue.
    Queue = 2,
    /// FIFO queue without cross-transaction ordering guarantees.
    ConcurrentQueue = 3,
    /// Implicit child holding the entries of a collection.
    DataStore = 4,
}

impl StateProviderKind {
    /// Converts a byte to a provider kind.
    pub fn from_byte(b: u8) -> Option<Self> {
        match b {
            1 => Some(Self::Dictionary),
            2 => Some(Self::Queue),
            3 => Some(Self::ConcurrentQueue),
            4 => Some(Self::DataStore),
            _ => None,
        }
    }

    /// Converts the kind to a byte.
    #[must_use]
    pub const fn as_byte(self) -> u8 {
        self as u8
    }

    /// Whether users can register this kind directly.
    #[must_use]
    pub const fn is_collection(self) -> bool {
        !matches!(self, Self::DataStore)
    }

    /// Whether this kind stores FIFO items.
    #[must_use]
    pub const fn is_queue(self) -> bool {
        matches!(self, Self::Queue | Self::ConcurrentQueue)
    }
}

impl fmt::Display for StateProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Dictionary => "dictionary",
            Self::Queue => "queue",
            Self::ConcurrentQueue => "concurrent queue",
            Self::DataStore => "data store",
        };
        f.write_str(name)
    }
}

/// One committed entry of a provider.
///
/// For queues the key is the big-endian position from the head.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderEntry {
    /// Encoded key.
    pub key: Vec<u8>,
    /// Serialized value.
    pub value: Vec<u8>,
}

impl ProviderEntry {
    /// Creates an entry.
    pub fn new(key: Vec<u8>, value: Vec<u8>) -> Self {
        Self { key, value }
    }
}

/// A mutation applied to a provider at commit or replay.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProviderOp {
    /// Insert a key that must not exist.
    Add {
        /// Encoded key.
        key: Vec<u8>,
        /// Serialized value.
        value: Vec<u8>,
    },
    /// Insert or overwrite a key.
    Set {
        /// Encoded key.
        key: Vec<u8>,
        /// Serialized value.
        value: Vec<u8>,
    },
    /// Remove a key if present.
    Remove {
        /// Encoded key.
        key: Vec<u8>,
    },
    /// Append an item to the tail.
    Enqueue {
        /// Serialized item.
        value: Vec<u8>,
    },
    /// Drop the head item.
    Dequeue,
}

impl ProviderOp {
    /// Whether the op is a dictionary mutation.
    #[must_use]
    pub fn is_dictionary_op(&self) -> bool {
        matches!(self, Self::Add { .. } | Self::Set { .. } | Self::Remove { .. })
    }
}

/// In-memory store behind a collection.
pub trait StateProvider: Send + Sync + fmt::Debug {
    /// Shape of the stored data.
    fn kind(&self) -> StateProviderKind;

    /// Number of committed entries.
    fn count(&self) -> u64;

    /// Looks up a committed entry by key.
    fn get(&self, key: &[u8]) -> Option<&[u8]>;

    /// Applies a committed mutation.
    ///
    /// # Errors
    ///
    /// Fails if the op does not fit the provider kind or its precondition
    /// does not hold (add on a present key, dequeue on an empty queue).
    fn apply(&mut self, op: &ProviderOp) -> CoreResult<()>;

    /// All committed entries in key order.
    fn entries(&self) -> Vec<ProviderEntry>;

    /// Replaces the contents with `entries`.
    fn load(&mut self, entries: Vec<ProviderEntry>) -> CoreResult<()> {
        for entry in entries {
            let op = if self.kind().is_queue() {
                ProviderOp::Enqueue { value: entry.value }
            } else {
                ProviderOp::Add {
                    key: entry.key,
                    value: entry.value,
                }
            };
            self.apply(&op)?;
        }
        Ok(())
    }
}

pub(crate) fn unsupported_op(kind: StateProviderKind, op: &ProviderOp) -> CoreError {
    CoreError::invalid_state(format!("{op:?} is not supported by a {kind}"))
}
