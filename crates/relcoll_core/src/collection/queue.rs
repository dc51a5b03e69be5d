//! Reliable queue handle.

use crate::error::CoreResult;
use crate::name::StateProviderName;
use crate::provider::{ProviderOp, QueueStore};
use crate::replicator::TransactionalReplicator;
use crate::serializer::StateSerializer;
use crate::state_manager::ProviderInfo;
use crate::transaction::Transaction;
use crate::types::ProviderId;
use std::fmt;
use std::sync::Arc;

/// A typed, transactional FIFO queue.
///
/// A transaction dequeues committed items from the head first, then the
/// items it enqueued itself.
pub struct ReliableQueue<T> {
    replicator: Arc<TransactionalReplicator>,
    info: ProviderInfo,
    serializer: Arc<dyn StateSerializer<T>>,
}

impl<T> ReliableQueue<T>
where
    T: Send + Sync + 'static,
{
    pub(crate) fn new(
        replicator: Arc<TransactionalReplicator>,
        info: ProviderInfo,
        serializer: Arc<dyn StateSerializer<T>>,
    ) -> Self {
        Self {
            replicator,
            info,
            serializer,
        }
    }

    /// Returns the provider ID.
    #[must_use]
    pub fn id(&self) -> ProviderId {
        self.info.id
    }

    /// Returns the queue name.
    #[must_use]
    pub fn name(&self) -> &StateProviderName {
        &self.info.name
    }

    /// Stages an item at the tail.
    pub fn enqueue(&self, txn: &mut Transaction, item: T) -> CoreResult<()> {
        let value = self.serializer.write(&item)?;
        self.replicator
            .stage(txn, self.info.id, ProviderOp::Enqueue { value })
    }

    /// Stages the removal of the head item and returns it.
    pub fn try_dequeue(&self, txn: &mut Transaction) -> CoreResult<Option<T>> {
        let Some(item) = self.peek_bytes(txn)? else {
            return Ok(None);
        };
        let item = self.serializer.read(&item)?;
        self.replicator.stage(txn, self.info.id, ProviderOp::Dequeue)?;
        Ok(Some(item))
    }

    /// Returns the item `try_dequeue` would return, without staging anything.
    pub fn try_peek(&self, txn: &Transaction) -> CoreResult<Option<T>> {
        self.peek_bytes(txn)?
            .map(|bytes| self.serializer.read(&bytes))
            .transpose()
    }

    fn peek_bytes(&self, txn: &Transaction) -> CoreResult<Option<Vec<u8>>> {
        txn.ensure_active()?;
        let consumed = txn.dequeued(self.info.id);
        let committed = self.replicator.committed_count(self.info.id)?;
        if consumed < committed {
            return self
                .replicator
                .committed_get(self.info.id, &QueueStore::position_key(consumed));
        }
        let own = usize::try_from(consumed - committed).unwrap_or(usize::MAX);
        Ok(txn.enqueued(self.info.id).get(own).cloned())
    }

    /// Number of committed items.
    pub fn count(&self) -> CoreResult<u64> {
        self.replicator.committed_count(self.info.id)
    }

    /// Committed items from head to tail.
    pub fn entries(&self) -> CoreResult<Vec<T>> {
        self.replicator
            .committed_entries(self.info.id)?
            .into_iter()
            .map(|e| self.serializer.read(&e.value))
            .collect()
    }
}

impl<T> fmt::Debug for ReliableQueue<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReliableQueue")
            .field("id", &self.info.id)
            .field("name", &self.info.name)
            .field("kind", &self.info.kind)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ReplicatorConfig;
    use crate::provider::StateProviderKind;
    use crate::replica::OpenMode;
    use crate::serializer::CborSerializer;
    use relcoll_storage::InMemoryBackend;
    use tempfile::{tempdir, TempDir};

    fn setup(kind: StateProviderKind) -> (TempDir, Arc<TransactionalReplicator>, ReliableQueue<u32>) {
        let temp = tempdir().unwrap();
        let replicator = Arc::new(TransactionalReplicator::new(
            ReplicatorConfig::default(),
            temp.path(),
        ));
        replicator.try_add_state_serializer::<u32>(Arc::new(CborSerializer::<u32>::new()));
        replicator
            .open(OpenMode::New, Box::new(InMemoryBackend::new()))
            .unwrap();
        replicator.promote().unwrap();

        let name = StateProviderName::new("urn:testQueue").unwrap();
        replicator
            .transaction(|txn| replicator.add_state_provider(txn, name.clone(), kind))
            .unwrap();
        let queue = replicator.queue(&name).unwrap();
        (temp, replicator, queue)
    }

    #[test]
    fn fifo_across_commits() {
        let (_temp, replicator, queue) = setup(StateProviderKind::Queue);
        replicator
            .transaction(|txn| {
                for i in 1..=3 {
                    queue.enqueue(txn, i)?;
                }
                Ok(())
            })
            .unwrap();
        assert_eq!(queue.entries().unwrap(), vec![1, 2, 3]);

        let mut txn = replicator.create_transaction().unwrap();
        assert_eq!(queue.try_peek(&txn).unwrap(), Some(1));
        assert_eq!(queue.try_dequeue(&mut txn).unwrap(), Some(1));
        assert_eq!(queue.try_dequeue(&mut txn).unwrap(), Some(2));
        assert_eq!(queue.count().unwrap(), 3);
        replicator.commit(&mut txn).unwrap();

        assert_eq!(queue.entries().unwrap(), vec![3]);
    }

    #[test]
    fn dequeue_reaches_own_enqueues() {
        let (_temp, replicator, queue) = setup(StateProviderKind::ConcurrentQueue);
        let mut txn = replicator.create_transaction().unwrap();
        assert_eq!(queue.try_dequeue(&mut txn).unwrap(), None);

        queue.enqueue(&mut txn, 10).unwrap();
        queue.enqueue(&mut txn, 11).unwrap();
        assert_eq!(queue.try_dequeue(&mut txn).unwrap(), Some(10));
        replicator.commit(&mut txn).unwrap();

        assert_eq!(queue.entries().unwrap(), vec![11]);
    }

    #[test]
    fn aborted_dequeue_leaves_queue_untouched() {
        let (_temp, replicator, queue) = setup(StateProviderKind::Queue);
        replicator.transaction(|txn| queue.enqueue(txn, 7)).unwrap();

        let mut txn = replicator.create_transaction().unwrap();
        queue.try_dequeue(&mut txn).unwrap();
        replicator.abort(&mut txn).unwrap();
        assert_eq!(queue.count().unwrap(), 1);
    }

    #[test]
    fn competing_dequeue_fails_at_commit() {
        let (_temp, replicator, queue) = setup(StateProviderKind::Queue);
        replicator.transaction(|txn| queue.enqueue(txn, 7)).unwrap();

        let mut first = replicator.create_transaction().unwrap();
        let mut second = replicator.create_transaction().unwrap();
        assert_eq!(queue.try_dequeue(&mut first).unwrap(), Some(7));
        assert_eq!(queue.try_dequeue(&mut second).unwrap(), Some(7));

        replicator.commit(&mut first).unwrap();
        assert!(replicator.commit(&mut second).unwrap_err().is_invalid_state());
        assert_eq!(queue.count().unwrap(), 0);
    }
}
