//! Reliable dictionary handle.

use crate::error::{CoreError, CoreResult};
use crate::key::DictionaryKey;
use crate::name::StateProviderName;
use crate::provider::ProviderOp;
use crate::replicator::TransactionalReplicator;
use crate::serializer::StateSerializer;
use crate::state_manager::ProviderInfo;
use crate::transaction::Transaction;
use crate::types::ProviderId;
use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;

/// A typed, transactional key/value collection.
///
/// Writes are staged in a [`Transaction`] and become visible to
/// [`get`](Self::get), [`count`](Self::count) and
/// [`entries`](Self::entries) only once the replicator commits it.
/// [`try_get`](Self::try_get) additionally sees the transaction's own
/// staged writes.
///
/// # Example
///
/// ```rust,ignore
/// let users = replicator.dictionary::<u64, User>(&name)?;
/// replicator.transaction(|txn| users.add(txn, 1, user))?;
/// assert_eq!(users.count()?, 1);
/// ```
pub struct ReliableDictionary<K, V> {
    replicator: Arc<TransactionalReplicator>,
    info: ProviderInfo,
    serializer: Arc<dyn StateSerializer<V>>,
    _marker: PhantomData<fn() -> K>,
}

impl<K, V> ReliableDictionary<K, V>
where
    K: DictionaryKey,
    V: Send + Sync + 'static,
{
    pub(crate) fn new(
        replicator: Arc<TransactionalReplicator>,
        info: ProviderInfo,
        serializer: Arc<dyn StateSerializer<V>>,
    ) -> Self {
        Self {
            replicator,
            info,
            serializer,
            _marker: PhantomData,
        }
    }

    /// Returns the provider ID.
    #[must_use]
    pub fn id(&self) -> ProviderId {
        self.info.id
    }

    /// Returns the dictionary name.
    #[must_use]
    pub fn name(&self) -> &StateProviderName {
        &self.info.name
    }

    /// Stages the insertion of a new key.
    ///
    /// Fails with `KeyExists` if the key is committed or already staged in
    /// `txn`.
    pub fn add(&self, txn: &mut Transaction, key: K, value: V) -> CoreResult<()> {
        txn.ensure_active()?;
        let key = key.encode_key();
        if self.lookup(txn, &key)?.is_some() {
            return Err(CoreError::key_exists(&self.info.name));
        }
        let value = self.serializer.write(&value)?;
        self.replicator
            .stage(txn, self.info.id, ProviderOp::Add { key, value })
    }

    /// Stages an insert or overwrite.
    pub fn set(&self, txn: &mut Transaction, key: K, value: V) -> CoreResult<()> {
        let value = self.serializer.write(&value)?;
        self.replicator.stage(
            txn,
            self.info.id,
            ProviderOp::Set {
                key: key.encode_key(),
                value,
            },
        )
    }

    /// Stages the removal of a key, returning the value it had in `txn`.
    pub fn try_remove(&self, txn: &mut Transaction, key: &K) -> CoreResult<Option<V>> {
        txn.ensure_active()?;
        let key = key.encode_key();
        let Some(bytes) = self.lookup(txn, &key)? else {
            return Ok(None);
        };
        let previous = self.serializer.read(&bytes)?;
        self.replicator
            .stage(txn, self.info.id, ProviderOp::Remove { key })?;
        Ok(Some(previous))
    }

    /// Reads a key as `txn` sees it, staged writes included.
    pub fn try_get(&self, txn: &Transaction, key: &K) -> CoreResult<Option<V>> {
        txn.ensure_active()?;
        self.lookup(txn, &key.encode_key())?
            .map(|bytes| self.serializer.read(&bytes))
            .transpose()
    }

    fn lookup(&self, txn: &Transaction, key: &[u8]) -> CoreResult<Option<Vec<u8>>> {
        match txn.staged_value(self.info.id, key) {
            Some(staged) => Ok(staged.map(<[u8]>::to_vec)),
            None => self.replicator.committed_get(self.info.id, key),
        }
    }

    /// Reads a committed value.
    pub fn get(&self, key: &K) -> CoreResult<Option<V>> {
        self.replicator
            .committed_get(self.info.id, &key.encode_key())?
            .map(|bytes| self.serializer.read(&bytes))
            .transpose()
    }

    /// Whether a key is committed.
    pub fn contains_key(&self, key: &K) -> CoreResult<bool> {
        Ok(self
            .replicator
            .committed_get(self.info.id, &key.encode_key())?
            .is_some())
    }

    /// Number of committed entries.
    pub fn count(&self) -> CoreResult<u64> {
        self.replicator.committed_count(self.info.id)
    }

    /// Number of entries as `txn` sees them.
    pub fn count_in(&self, txn: &Transaction) -> CoreResult<u64> {
        let committed = self.count()?;
        let delta = txn.staged_count_delta(self.info.id, |key| {
            self.replicator
                .committed_get(self.info.id, key)
                .map(|v| v.is_some())
                .unwrap_or(false)
        });
        Ok(committed.saturating_add_signed(delta))
    }

    /// Committed entries in key order.
    pub fn entries(&self) -> CoreResult<Vec<(K, V)>> {
        self.replicator
            .committed_entries(self.info.id)?
            .into_iter()
            .map(|e| Ok((K::decode_key(&e.key)?, self.serializer.read(&e.value)?)))
            .collect()
    }
}

impl<K, V> fmt::Debug for ReliableDictionary<K, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReliableDictionary")
            .field("id", &self.info.id)
            .field("name", &self.info.name)
            .finish()
    }
}
