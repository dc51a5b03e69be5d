//! Transaction state.

use crate::error::{CoreError, CoreResult};
use crate::name::StateProviderName;
use crate::provider::{ProviderOp, StateProviderKind};
use crate::types::{ProviderId, TransactionId};
use std::collections::{HashMap, HashSet};

/// State of a transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionState {
    /// Transaction is active and can stage operations.
    Active,
    /// Transaction has been committed.
    Committed,
    /// Transaction has been aborted.
    Aborted,
}

/// An operation staged in a transaction, in staging order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PendingOp {
    /// Register a state provider.
    AddProvider {
        /// Name of the new provider.
        name: StateProviderName,
        /// Collection kind.
        kind: StateProviderKind,
    },
    /// Mutate a committed provider.
    Write {
        /// Target provider (the collection, not its data store).
        provider: ProviderId,
        /// The mutation.
        op: ProviderOp,
    },
}

/// A transaction against the replicator.
///
/// Dictionary writes are also kept in an overlay so the transaction reads
/// its own writes. Queue dequeues are tracked per provider as a count of
/// items consumed from the head.
#[derive(Debug)]
pub struct Transaction {
    id: TransactionId,
    state: TransactionState,
    ops: Vec<PendingOp>,
    /// (provider, key) -> staged value, `None` for a staged removal.
    overlay: HashMap<(ProviderId, Vec<u8>), Option<Vec<u8>>>,
    /// Names claimed by staged registrations, implicit children included.
    staged_names: HashSet<StateProviderName>,
    dequeued: HashMap<ProviderId, u64>,
    enqueued: HashMap<ProviderId, Vec<Vec<u8>>>,
}

impl Transaction {
    pub(crate) fn new(id: TransactionId) -> Self {
        Self {
            id,
            state: TransactionState::Active,
            ops: Vec::new(),
            overlay: HashMap::new(),
            staged_names: HashSet::new(),
            dequeued: HashMap::new(),
            enqueued: HashMap::new(),
        }
    }

    /// Returns the transaction ID.
    #[must_use]
    pub fn id(&self) -> TransactionId {
        self.id
    }

    /// Returns the current state.
    #[must_use]
    pub fn state(&self) -> TransactionState {
        self.state
    }

    /// Checks if the transaction is still active.
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.state == TransactionState::Active
    }

    /// Staged operations in staging order.
    #[must_use]
    pub fn pending_ops(&self) -> &[PendingOp] {
        &self.ops
    }

    /// Returns the number of staged operations.
    #[must_use]
    pub fn op_count(&self) -> usize {
        self.ops.len()
    }

    pub(crate) fn ensure_active(&self) -> CoreResult<()> {
        match self.state {
            TransactionState::Active => Ok(()),
            TransactionState::Committed => {
                Err(CoreError::invalid_state("transaction already committed"))
            }
            TransactionState::Aborted => Err(CoreError::invalid_state("transaction already aborted")),
        }
    }

    /// Whether `name` is claimed by a staged registration.
    pub(crate) fn has_staged_name(&self, name: &StateProviderName) -> bool {
        self.staged_names.contains(name)
    }

    pub(crate) fn stage_provider(
        &mut self,
        name: StateProviderName,
        kind: StateProviderKind,
        claimed: Vec<StateProviderName>,
    ) -> CoreResult<()> {
        self.ensure_active()?;
        self.staged_names.extend(claimed);
        self.ops.push(PendingOp::AddProvider { name, kind });
        Ok(())
    }

    pub(crate) fn stage_write(&mut self, provider: ProviderId, op: ProviderOp) -> CoreResult<()> {
        self.ensure_active()?;
        match &op {
            ProviderOp::Add { key, value } | ProviderOp::Set { key, value } => {
                self.overlay
                    .insert((provider, key.clone()), Some(value.clone()));
            }
            ProviderOp::Remove { key } => {
                self.overlay.insert((provider, key.clone()), None);
            }
            ProviderOp::Enqueue { value } => {
                self.enqueued.entry(provider).or_default().push(value.clone());
            }
            ProviderOp::Dequeue => {
                *self.dequeued.entry(provider).or_default() += 1;
            }
        }
        self.ops.push(PendingOp::Write { provider, op });
        Ok(())
    }

    /// Staged value for a dictionary key.
    ///
    /// `None` if the key is untouched, `Some(None)` if it was removed.
    pub(crate) fn staged_value(&self, provider: ProviderId, key: &[u8]) -> Option<Option<&[u8]>> {
        self.overlay
            .get(&(provider, key.to_vec()))
            .map(|v| v.as_deref())
    }

    /// Net change this transaction makes to a dictionary's count, given a
    /// predicate telling whether a key is committed.
    pub(crate) fn staged_count_delta(
        &self,
        provider: ProviderId,
        committed: impl Fn(&[u8]) -> bool,
    ) -> i64 {
        self.overlay
            .iter()
            .filter(|((p, _), _)| *p == provider)
            .map(|((_, key), value)| match (committed(key), value.is_some()) {
                (false, true) => 1,
                (true, false) => -1,
                _ => 0,
            })
            .sum()
    }

    /// Items this transaction consumed from the head of a queue.
    pub(crate) fn dequeued(&self, provider: ProviderId) -> u64 {
        self.dequeued.get(&provider).copied().unwrap_or(0)
    }

    /// Items this transaction appended to a queue.
    pub(crate) fn enqueued(&self, provider: ProviderId) -> &[Vec<u8>] {
        self.enqueued.get(&provider).map_or(&[], Vec::as_slice)
    }

    pub(crate) fn mark_committed(&mut self) {
        self.state = TransactionState::Committed;
    }

    pub(crate) fn mark_aborted(&mut self) {
        self.state = TransactionState::Aborted;
        self.clear();
    }

    fn clear(&mut self) {
        self.ops.clear();
        self.overlay.clear();
        self.staged_names.clear();
        self.dequeued.clear();
        self.enqueued.clear();
    }
}

impl Drop for Transaction {
    fn drop(&mut self) {
        if self.is_active() && !self.ops.is_empty() {
            tracing::warn!(
                txid = %self.id,
                ops = self.ops.len(),
                "discarding uncommitted transaction"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn set(key: &[u8], value: &[u8]) -> ProviderOp {
        ProviderOp::Set {
            key: key.to_vec(),
            value: value.to_vec(),
        }
    }

    #[test]
    fn new_transaction_is_active() {
        let txn = Transaction::new(TransactionId::new(1));
        assert!(txn.is_active());
        assert_eq!(txn.op_count(), 0);
    }

    #[test]
    fn overlay_reads_own_writes() {
        let provider = ProviderId::new(1);
        let mut txn = Transaction::new(TransactionId::new(1));
        txn.stage_write(provider, set(b"k", b"v")).unwrap();
        assert_eq!(txn.staged_value(provider, b"k"), Some(Some(&b"v"[..])));

        txn.stage_write(provider, ProviderOp::Remove { key: b"k".to_vec() })
            .unwrap();
        assert_eq!(txn.staged_value(provider, b"k"), Some(None));
        assert_eq!(txn.staged_value(provider, b"other"), None);
        assert_eq!(txn.op_count(), 2);
    }

    #[test]
    fn count_delta_accounts_for_committed_keys() {
        let provider = ProviderId::new(1);
        let mut txn = Transaction::new(TransactionId::new(1));
        txn.stage_write(provider, set(b"new", b"1")).unwrap();
        txn.stage_write(provider, set(b"old", b"2")).unwrap();
        txn.stage_write(provider, ProviderOp::Remove { key: b"gone".to_vec() })
            .unwrap();

        let delta = txn.staged_count_delta(provider, |k| k == b"old" || k == b"gone");
        assert_eq!(delta, 0);
    }

    #[test]
    fn aborted_transaction_rejects_ops() {
        let mut txn = Transaction::new(TransactionId::new(1));
        txn.mark_aborted();
        let err = txn.stage_write(ProviderId::new(1), ProviderOp::Dequeue).unwrap_err();
        assert!(err.is_invalid_state());
    }

    #[test]
    fn committed_transaction_rejects_ops() {
        let mut txn = Transaction::new(TransactionId::new(1));
        txn.mark_committed();
        assert!(txn.ensure_active().is_err());
    }

    #[test]
    fn queue_tracking() {
        let provider = ProviderId::new(4);
        let mut txn = Transaction::new(TransactionId::new(1));
        txn.stage_write(provider, ProviderOp::Enqueue { value: vec![1] })
            .unwrap();
        txn.stage_write(provider, ProviderOp::Dequeue).unwrap();
        assert_eq!(txn.enqueued(provider), &[vec![1u8]][..]);
        assert_eq!(txn.dequeued(provider), 1);
        assert_eq!(txn.dequeued(ProviderId::new(5)), 0);
    }
}
