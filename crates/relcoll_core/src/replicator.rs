//! Transactional replicator.
//!
//! Owns the replicator log, the state manager and the serializer registry.
//! All writes go through [`TransactionalReplicator::commit`]: staged ops are
//! validated, logged, flushed and only then applied, so readers never see
//! uncommitted state.

use crate::backup::{write_snapshot, BackupCallback, BackupInfo, BackupOption};
use crate::collection::{ReliableDictionary, ReliableQueue};
use crate::config::ReplicatorConfig;
use crate::error::{CoreError, CoreResult};
use crate::key::DictionaryKey;
use crate::name::StateProviderName;
use crate::provider::{
    DefaultStateProviderFactory, ProviderEntry, ProviderOp, StateProviderFactory,
    StateProviderKind,
};
use crate::replica::OpenMode;
use crate::serializer::{SerializerRegistry, StateSerializer};
use crate::state_manager::{ProviderInfo, StateManager};
use crate::transaction::Transaction;
use crate::types::{ProviderId, SequenceNumber, TransactionId};
use crate::wal::{LogRecord, ReplicatorLog};
use parking_lot::{Mutex, RwLock};
use relcoll_storage::StorageBackend;
use std::collections::HashMap;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Lifecycle of a replicator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplicatorStatus {
    /// Constructed; serializers may be registered.
    Created,
    /// Log opened and replayed; reads allowed.
    Opened,
    /// Accepting writes and backups.
    Primary,
    /// Closed; nothing allowed.
    Closed,
}

/// Coordinates transactions, state providers and backups for one replica.
pub struct TransactionalReplicator {
    config: ReplicatorConfig,
    status: RwLock<ReplicatorStatus>,
    log: RwLock<Option<ReplicatorLog>>,
    state: RwLock<StateManager>,
    serializers: SerializerRegistry,
    next_txid: AtomicU64,
    committed_seq: AtomicU64,
    /// Serializes commits and snapshot production.
    commit_lock: Mutex<()>,
    backup_active: AtomicBool,
    staging_root: PathBuf,
}

impl TransactionalReplicator {
    /// Creates a replicator with the built-in provider stores.
    ///
    /// Backup snapshots are staged under `staging_root`.
    pub fn new(config: ReplicatorConfig, staging_root: impl Into<PathBuf>) -> Self {
        Self::with_factory(config, Arc::new(DefaultStateProviderFactory), staging_root)
    }

    /// Creates a replicator whose provider stores come from `factory`.
    pub fn with_factory(
        config: ReplicatorConfig,
        factory: Arc<dyn StateProviderFactory>,
        staging_root: impl Into<PathBuf>,
    ) -> Self {
        let state = StateManager::new(
            factory,
            config.data_store_children,
            config.data_store_segment.clone(),
        );
        Self {
            config,
            status: RwLock::new(ReplicatorStatus::Created),
            log: RwLock::new(None),
            state: RwLock::new(state),
            serializers: SerializerRegistry::new(),
            next_txid: AtomicU64::new(1),
            committed_seq: AtomicU64::new(0),
            commit_lock: Mutex::new(()),
            backup_active: AtomicBool::new(false),
            staging_root: staging_root.into(),
        }
    }

    /// Returns the configuration.
    #[must_use]
    pub fn config(&self) -> &ReplicatorConfig {
        &self.config
    }

    /// Returns the lifecycle status.
    #[must_use]
    pub fn status(&self) -> ReplicatorStatus {
        *self.status.read()
    }

    /// Returns the last committed sequence.
    #[must_use]
    pub fn committed_seq(&self) -> SequenceNumber {
        SequenceNumber::new(self.committed_seq.load(Ordering::SeqCst))
    }

    /// Whether a backup is in flight.
    #[must_use]
    pub fn is_backup_in_progress(&self) -> bool {
        self.backup_active.load(Ordering::SeqCst)
    }

    /// Registers a value serializer for `T`.
    ///
    /// Returns `false` if one was already registered; the first one stays.
    pub fn try_add_state_serializer<T: 'static>(
        &self,
        serializer: Arc<dyn StateSerializer<T>>,
    ) -> bool {
        self.serializers.try_add(serializer)
    }

    /// Returns the serializer registered for `T`.
    pub fn state_serializer<T: 'static>(&self) -> CoreResult<Arc<dyn StateSerializer<T>>> {
        self.serializers.get::<T>()
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    /// Opens the replicator log.
    ///
    /// `New` requires an empty log. `Existing` replays every committed
    /// transaction and discards the rest.
    pub fn open(&self, mode: OpenMode, backend: Box<dyn StorageBackend>) -> CoreResult<()> {
        let mut status = self.status.write();
        if *status != ReplicatorStatus::Created {
            return Err(CoreError::invalid_state(format!(
                "cannot open a replicator that is {status:?}"
            )));
        }

        let log = ReplicatorLog::new(backend, self.config.sync_on_commit);
        match mode {
            OpenMode::New => {
                if log.size()? != 0 {
                    return Err(CoreError::invalid_state(
                        "replicator log is not empty; open it as existing",
                    ));
                }
            }
            OpenMode::Existing => self.replay(&log)?,
        }

        *self.log.write() = Some(log);
        *status = ReplicatorStatus::Opened;
        tracing::info!(?mode, sequence = %self.committed_seq(), "replicator opened");
        Ok(())
    }

    fn replay(&self, log: &ReplicatorLog) -> CoreResult<()> {
        let recovered = log.recover()?;
        let mut state = self.state.write();
        let mut pending: HashMap<TransactionId, Vec<LogRecord>> = HashMap::new();
        let mut max_txid = 0;
        let mut replayed = 0usize;

        for (offset, record) in recovered.records {
            let txid = record.txid();
            max_txid = max_txid.max(txid.as_u64());
            match record {
                LogRecord::Commit { sequence, .. } => {
                    for op in pending.remove(&txid).unwrap_or_default() {
                        state.apply(&op).map_err(|e| {
                            CoreError::log_corruption(format!(
                                "replaying {txid} at offset {offset}: {e}"
                            ))
                        })?;
                    }
                    self.committed_seq.store(sequence.as_u64(), Ordering::SeqCst);
                    replayed += 1;
                }
                other => pending.entry(txid).or_default().push(other),
            }
        }

        if !pending.is_empty() {
            tracing::warn!(
                discarded = pending.len(),
                "discarding transactions without a commit record"
            );
        }
        self.next_txid.store(max_txid + 1, Ordering::SeqCst);
        tracing::debug!(
            transactions = replayed,
            providers = state.len(),
            "replayed replicator log"
        );
        Ok(())
    }

    /// Makes the replicator accept writes and backups.
    pub fn promote(&self) -> CoreResult<()> {
        let mut status = self.status.write();
        if *status != ReplicatorStatus::Opened {
            return Err(CoreError::invalid_state(format!(
                "cannot promote a replicator that is {status:?}"
            )));
        }
        *status = ReplicatorStatus::Primary;
        tracing::info!("replicator promoted to primary");
        Ok(())
    }

    /// Flushes the log and stops accepting operations.
    pub fn close(&self) -> CoreResult<()> {
        let mut status = self.status.write();
        if *status == ReplicatorStatus::Closed {
            return Ok(());
        }
        if let Some(log) = self.log.write().take() {
            log.flush()?;
        }
        *status = ReplicatorStatus::Closed;
        tracing::info!("replicator closed");
        Ok(())
    }

    fn fail(&self, reason: &str) {
        tracing::error!(reason, "replicator closed after a failed commit");
        *self.status.write() = ReplicatorStatus::Closed;
    }

    fn ensure_primary(&self) -> CoreResult<()> {
        match self.status() {
            ReplicatorStatus::Primary => Ok(()),
            other => Err(CoreError::invalid_state(format!(
                "replicator is {other:?}, not primary"
            ))),
        }
    }

    fn ensure_readable(&self) -> CoreResult<()> {
        match self.status() {
            ReplicatorStatus::Opened | ReplicatorStatus::Primary => Ok(()),
            other => Err(CoreError::invalid_state(format!(
                "replicator is {other:?}"
            ))),
        }
    }

    // ========================================================================
    // Transactions
    // ========================================================================

    /// Creates a new active transaction.
    pub fn create_transaction(&self) -> CoreResult<Transaction> {
        self.ensure_primary()?;
        let txid = TransactionId::new(self.next_txid.fetch_add(1, Ordering::SeqCst));
        Ok(Transaction::new(txid))
    }

    /// Commits a transaction.
    ///
    /// After this returns, the changes are durable and visible. If anything
    /// fails after validation started, the transaction is aborted and the
    /// committed state is unchanged.
    pub fn commit(&self, txn: &mut Transaction) -> CoreResult<SequenceNumber> {
        txn.ensure_active()?;
        match self.commit_inner(txn) {
            Ok(sequence) => Ok(sequence),
            Err(e) => {
                tracing::warn!(txid = %txn.id(), error = %e, "commit failed; transaction aborted");
                txn.mark_aborted();
                Err(e)
            }
        }
    }

    fn commit_inner(&self, txn: &mut Transaction) -> CoreResult<SequenceNumber> {
        self.ensure_primary()?;

        let _commit_guard = self.commit_lock.lock();
        if txn.op_count() == 0 {
            txn.mark_committed();
            return Ok(self.committed_seq());
        }

        let mut state = self.state.write();
        state.validate(txn)?;

        let sequence = self.committed_seq().next();
        let records = state.plan_commit(txn, sequence);
        let mut prepared = state.prepare_stores(&records)?;

        let failure = {
            let log = self.log.read();
            let log = log
                .as_ref()
                .ok_or_else(|| CoreError::invalid_state("replicator log is not open"))?;
            let failure = match log.append_batch(&records) {
                Err(e) => Some((
                    e,
                    log.is_failed()
                        .then_some("commit could not be removed from the log"),
                )),
                Ok(offset) => records
                    .iter()
                    .find_map(|record| state.apply_prepared(record, &mut prepared).err())
                    .map(|e| {
                        // Committed state is partly updated; only a reopen repairs it.
                        log.roll_back(offset);
                        (e, Some("logged commit could not be applied"))
                    }),
            };
            failure
        };
        if let Some((e, reason)) = failure {
            if let Some(reason) = reason {
                self.fail(reason);
            }
            return Err(e);
        }

        self.committed_seq.store(sequence.as_u64(), Ordering::SeqCst);
        txn.mark_committed();

        tracing::debug!(txid = %txn.id(), %sequence, ops = txn.op_count(), "committed");
        Ok(sequence)
    }

    /// Aborts a transaction, discarding its staged operations.
    pub fn abort(&self, txn: &mut Transaction) -> CoreResult<()> {
        txn.ensure_active()?;
        txn.mark_aborted();
        tracing::debug!(txid = %txn.id(), "aborted");
        Ok(())
    }

    /// Executes a function within a transaction.
    ///
    /// If the function returns `Ok`, the transaction is committed.
    /// If it returns `Err`, the transaction is aborted.
    pub fn transaction<F, T>(&self, f: F) -> CoreResult<T>
    where
        F: FnOnce(&mut Transaction) -> CoreResult<T>,
    {
        let mut txn = self.create_transaction()?;
        match f(&mut txn) {
            Ok(value) => {
                self.commit(&mut txn)?;
                Ok(value)
            }
            Err(e) => {
                if txn.is_active() {
                    txn.mark_aborted();
                }
                Err(e)
            }
        }
    }

    // ========================================================================
    // State providers
    // ========================================================================

    /// Stages the registration of a collection.
    ///
    /// Fails at once with `DuplicateName` if the name, or the name of its
    /// implicit data store, is committed or staged in `txn`. Checked again
    /// at commit.
    pub fn add_state_provider(
        &self,
        txn: &mut Transaction,
        name: StateProviderName,
        kind: StateProviderKind,
    ) -> CoreResult<()> {
        self.ensure_primary()?;
        txn.ensure_active()?;
        if !kind.is_collection() {
            return Err(CoreError::invalid_state(format!(
                "{name}: a {kind} cannot be registered directly"
            )));
        }

        let claimed = {
            let state = self.state.read();
            let claimed = state.claimed_names(&name)?;
            if let Some(taken) = claimed
                .iter()
                .find(|n| state.lookup(n).is_some() || txn.has_staged_name(n))
            {
                return Err(CoreError::duplicate_name(taken));
            }
            claimed
        };
        txn.stage_provider(name, kind, claimed)
    }

    /// Committed providers in registration order.
    ///
    /// With `parents_only`, implicit data store children are left out.
    pub fn enumerate_providers(&self, parents_only: bool) -> CoreResult<Vec<ProviderInfo>> {
        self.ensure_readable()?;
        Ok(self.state.read().enumerate(parents_only))
    }

    /// Looks up a committed provider.
    #[must_use]
    pub fn try_get_state_provider(&self, name: &StateProviderName) -> Option<ProviderInfo> {
        self.state.read().lookup(name).cloned()
    }

    /// Looks up a committed provider, failing with `NotFound`.
    pub fn get_state_provider(&self, name: &StateProviderName) -> CoreResult<ProviderInfo> {
        self.try_get_state_provider(name)
            .ok_or_else(|| CoreError::not_found(name))
    }

    /// Typed handle to a committed dictionary.
    pub fn dictionary<K, V>(self: &Arc<Self>, name: &StateProviderName) -> CoreResult<ReliableDictionary<K, V>>
    where
        K: DictionaryKey,
        V: Send + Sync + 'static,
    {
        let info = self.get_state_provider(name)?;
        if info.kind != StateProviderKind::Dictionary {
            return Err(CoreError::KindMismatch {
                name: name.to_string(),
                expected: StateProviderKind::Dictionary,
                actual: info.kind,
            });
        }
        let serializer = self.serializers.get::<V>()?;
        Ok(ReliableDictionary::new(Arc::clone(self), info, serializer))
    }

    /// Typed handle to a committed queue or concurrent queue.
    pub fn queue<T>(self: &Arc<Self>, name: &StateProviderName) -> CoreResult<ReliableQueue<T>>
    where
        T: Send + Sync + 'static,
    {
        let info = self.get_state_provider(name)?;
        if !info.kind.is_queue() {
            return Err(CoreError::KindMismatch {
                name: name.to_string(),
                expected: StateProviderKind::Queue,
                actual: info.kind,
            });
        }
        let serializer = self.serializers.get::<T>()?;
        Ok(ReliableQueue::new(Arc::clone(self), info, serializer))
    }

    pub(crate) fn stage(
        &self,
        txn: &mut Transaction,
        provider: ProviderId,
        op: ProviderOp,
    ) -> CoreResult<()> {
        txn.ensure_active()?;
        self.ensure_primary()?;
        txn.stage_write(provider, op)
    }

    pub(crate) fn committed_count(&self, provider: ProviderId) -> CoreResult<u64> {
        self.ensure_readable()?;
        Ok(self.state.read().store(provider)?.count())
    }

    pub(crate) fn committed_get(&self, provider: ProviderId, key: &[u8]) -> CoreResult<Option<Vec<u8>>> {
        self.ensure_readable()?;
        Ok(self.state.read().store(provider)?.get(key).map(<[u8]>::to_vec))
    }

    pub(crate) fn committed_entries(&self, provider: ProviderId) -> CoreResult<Vec<ProviderEntry>> {
        self.ensure_readable()?;
        Ok(self.state.read().store(provider)?.entries())
    }

    // ========================================================================
    // Backup
    // ========================================================================

    /// Takes a full backup and hands it to `callback`.
    pub fn backup<C: BackupCallback>(&self, callback: C) -> CoreResult<BackupInfo> {
        self.backup_with_cancellation(callback, CancellationToken::new())
    }

    /// Takes a full backup that `cancel` can abandon.
    ///
    /// The snapshot is produced under the commit lock, so it reflects exactly
    /// the committed sequence. The callback runs after the lock is released.
    /// A second backup while one is in flight fails with `BackupInProgress`.
    pub fn backup_with_cancellation<C: BackupCallback>(
        &self,
        mut callback: C,
        cancel: CancellationToken,
    ) -> CoreResult<BackupInfo> {
        self.ensure_primary()?;
        if self
            .backup_active
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(CoreError::BackupInProgress);
        }
        let _active = BackupGuard(&self.backup_active);

        let backup_id = Uuid::new_v4();
        if cancel.is_cancelled() {
            tracing::warn!(%backup_id, "backup cancelled before snapshot");
            return Err(CoreError::BackupCancelled { backup_id });
        }

        let (sequence, snapshot) = {
            let _commit_guard = self.commit_lock.lock();
            (self.committed_seq(), self.state.read().snapshot())
        };

        let staging = StagingDir(self.staging_root.join(backup_id.simple().to_string()));
        let created_at_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis();
        let created_at_ms = u64::try_from(created_at_ms).unwrap_or(u64::MAX);
        let metadata = write_snapshot(staging.path(), backup_id, sequence, created_at_ms, &snapshot)?;

        let info = BackupInfo {
            backup_id,
            directory: staging.path().to_path_buf(),
            option: BackupOption::Full,
            sequence,
            provider_count: metadata.provider_count,
            created_at_ms,
        };
        tracing::info!(%backup_id, %sequence, providers = info.provider_count, "backup snapshot ready");

        let outcome = callback.on_backup(&info, &cancel);
        drop(staging);

        if cancel.is_cancelled() {
            tracing::warn!(%backup_id, "backup cancelled");
            return Err(CoreError::BackupCancelled { backup_id });
        }
        if outcome? {
            tracing::info!(%backup_id, "backup completed");
            Ok(info)
        } else {
            tracing::warn!(%backup_id, "backup rejected by callback");
            Err(CoreError::BackupRejected { backup_id })
        }
    }
}

impl fmt::Debug for TransactionalReplicator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransactionalReplicator")
            .field("status", &self.status())
            .field("committed_seq", &self.committed_seq())
            .field("backup_active", &self.is_backup_in_progress())
            .finish_non_exhaustive()
    }
}

/// Clears the in-flight flag when a backup ends.
struct BackupGuard<'a>(&'a AtomicBool);

impl Drop for BackupGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Removes a backup's staging directory when dropped.
struct StagingDir(PathBuf);

impl StagingDir {
    fn path(&self) -> &Path {
        &self.0
    }
}

impl Drop for StagingDir {
    fn drop(&mut self) {
        if self.0.exists() {
            if let Err(e) = fs::remove_dir_all(&self.0) {
                tracing::warn!(path = %self.0.display(), error = %e, "failed to remove backup staging directory");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backup::BackupReader;
    use crate::serializer::CborSerializer;
    use crate::test_support::SharedBackend;
    use relcoll_storage::InMemoryBackend;
    use tempfile::{tempdir, TempDir};

    fn name(raw: &str) -> StateProviderName {
        StateProviderName::new(raw).unwrap()
    }

    fn primary(config: ReplicatorConfig) -> (TempDir, Arc<TransactionalReplicator>) {
        let temp = tempdir().unwrap();
        let replicator = Arc::new(TransactionalReplicator::new(
            config,
            temp.path().join("staging"),
        ));
        replicator.try_add_state_serializer::<String>(Arc::new(CborSerializer::<String>::new()));
        replicator
            .open(OpenMode::New, Box::new(InMemoryBackend::new()))
            .unwrap();
        replicator.promote().unwrap();
        (temp, replicator)
    }

    fn register(replicator: &TransactionalReplicator, raw: &str, kind: StateProviderKind) {
        replicator
            .transaction(|txn| replicator.add_state_provider(txn, name(raw), kind))
            .unwrap();
    }

    #[test]
    fn lifecycle_order_is_enforced() {
        let temp = tempdir().unwrap();
        let replicator = TransactionalReplicator::new(ReplicatorConfig::default(), temp.path());
        assert!(replicator.promote().unwrap_err().is_invalid_state());
        assert!(replicator.create_transaction().unwrap_err().is_invalid_state());

        replicator
            .open(OpenMode::New, Box::new(InMemoryBackend::new()))
            .unwrap();
        assert!(replicator
            .open(OpenMode::New, Box::new(InMemoryBackend::new()))
            .is_err());
        assert!(replicator.create_transaction().is_err());
        replicator.promote().unwrap();
        assert_eq!(replicator.status(), ReplicatorStatus::Primary);

        replicator.close().unwrap();
        assert!(replicator.enumerate_providers(false).is_err());
    }

    #[test]
    fn registration_is_visible_only_after_commit() {
        let (_temp, replicator) = primary(ReplicatorConfig::default());
        assert!(replicator.enumerate_providers(false).unwrap().is_empty());

        let mut txn = replicator.create_transaction().unwrap();
        replicator
            .add_state_provider(&mut txn, name("urn:testDictionary"), StateProviderKind::Dictionary)
            .unwrap();
        assert!(replicator.enumerate_providers(false).unwrap().is_empty());

        replicator.commit(&mut txn).unwrap();
        assert_eq!(replicator.enumerate_providers(false).unwrap().len(), 2);
        assert_eq!(replicator.enumerate_providers(true).unwrap().len(), 1);
    }

    #[test]
    fn duplicate_names_fail_immediately() {
        let (_temp, replicator) = primary(ReplicatorConfig::default());
        register(&replicator, "urn:d", StateProviderKind::Dictionary);

        let mut txn = replicator.create_transaction().unwrap();
        assert!(matches!(
            replicator.add_state_provider(&mut txn, name("urn:d"), StateProviderKind::Queue),
            Err(CoreError::DuplicateName { .. })
        ));
        assert!(matches!(
            replicator.add_state_provider(&mut txn, name("urn:d/dataStore"), StateProviderKind::Queue),
            Err(CoreError::DuplicateName { .. })
        ));

        replicator
            .add_state_provider(&mut txn, name("urn:e"), StateProviderKind::Queue)
            .unwrap();
        assert!(matches!(
            replicator.add_state_provider(&mut txn, name("urn:e"), StateProviderKind::Queue),
            Err(CoreError::DuplicateName { .. })
        ));
        replicator.abort(&mut txn).unwrap();
    }

    #[test]
    fn concurrent_registration_fails_at_commit() {
        let (_temp, replicator) = primary(ReplicatorConfig::default());
        let mut first = replicator.create_transaction().unwrap();
        let mut second = replicator.create_transaction().unwrap();
        for txn in [&mut first, &mut second] {
            replicator
                .add_state_provider(txn, name("urn:d"), StateProviderKind::Dictionary)
                .unwrap();
        }

        replicator.commit(&mut first).unwrap();
        assert!(matches!(
            replicator.commit(&mut second),
            Err(CoreError::DuplicateName { .. })
        ));
        assert!(!second.is_active());
        assert_eq!(replicator.enumerate_providers(false).unwrap().len(), 2);
    }

    #[test]
    fn double_commit_is_invalid_state() {
        let (_temp, replicator) = primary(ReplicatorConfig::default());
        let mut txn = replicator.create_transaction().unwrap();
        replicator
            .add_state_provider(&mut txn, name("urn:d"), StateProviderKind::Dictionary)
            .unwrap();
        replicator.commit(&mut txn).unwrap();
        assert!(replicator.commit(&mut txn).unwrap_err().is_invalid_state());
        assert!(replicator.abort(&mut txn).unwrap_err().is_invalid_state());
    }

    #[test]
    fn dropped_transaction_has_no_effect() {
        let (_temp, replicator) = primary(ReplicatorConfig::default());
        {
            let mut txn = replicator.create_transaction().unwrap();
            replicator
                .add_state_provider(&mut txn, name("urn:d"), StateProviderKind::Dictionary)
                .unwrap();
        }
        assert!(replicator.enumerate_providers(false).unwrap().is_empty());
        assert_eq!(replicator.committed_seq(), SequenceNumber::new(0));
    }

    #[test]
    fn transaction_closure_aborts_on_error() {
        let (_temp, replicator) = primary(ReplicatorConfig::default());
        let result: CoreResult<()> = replicator.transaction(|txn| {
            replicator.add_state_provider(txn, name("urn:d"), StateProviderKind::Dictionary)?;
            Err(CoreError::invalid_state("changed my mind"))
        });
        assert!(result.is_err());
        assert!(replicator.try_get_state_provider(&name("urn:d")).is_none());
    }

    #[test]
    fn typed_handles_check_kind_and_serializer() {
        let (_temp, replicator) = primary(ReplicatorConfig::default());
        register(&replicator, "urn:d", StateProviderKind::Dictionary);
        register(&replicator, "urn:q", StateProviderKind::Queue);

        assert!(replicator.dictionary::<u64, String>(&name("urn:d")).is_ok());
        assert!(matches!(
            replicator.dictionary::<u64, String>(&name("urn:q")),
            Err(CoreError::KindMismatch { .. })
        ));
        assert!(matches!(
            replicator.queue::<String>(&name("urn:d")),
            Err(CoreError::KindMismatch { .. })
        ));
        assert!(matches!(
            replicator.dictionary::<u64, u32>(&name("urn:d")),
            Err(CoreError::SerializerNotRegistered { .. })
        ));
        assert!(matches!(
            replicator.dictionary::<u64, String>(&name("urn:missing")),
            Err(CoreError::NotFound { .. })
        ));
    }

    #[test]
    fn backup_snapshot_matches_committed_state() {
        let (temp, replicator) = primary(ReplicatorConfig::default());
        register(&replicator, "urn:d", StateProviderKind::Dictionary);
        let dict = replicator.dictionary::<u64, String>(&name("urn:d")).unwrap();
        replicator
            .transaction(|txn| {
                for k in 0..5u64 {
                    dict.add(txn, k, format!("v{k}"))?;
                }
                Ok(())
            })
            .unwrap();

        let mut seen = None;
        let info = replicator
            .backup(|info: &BackupInfo, _: &CancellationToken| -> CoreResult<bool> {
                let reader = BackupReader::open(&info.directory)?;
                seen = Some(reader.entry_count(&name("urn:d"))?);
                Ok(true)
            })
            .unwrap();

        assert_eq!(seen, Some(5));
        assert_eq!(info.provider_count, 2);
        // 2020-01-01T00:00:00Z
        assert!(info.created_at_ms > 1_577_836_800_000);
        assert_eq!(info.sequence, replicator.committed_seq());
        assert!(!info.directory.exists());
        assert!(!temp.path().join("staging").join(info.backup_id.simple().to_string()).exists());
        assert!(!replicator.is_backup_in_progress());
    }

    #[test]
    fn rejected_backup_reports_failure() {
        let (_temp, replicator) = primary(ReplicatorConfig::default());
        let err = replicator
            .backup(|_: &BackupInfo, _: &CancellationToken| -> CoreResult<bool> { Ok(false) })
            .unwrap_err();
        assert!(matches!(err, CoreError::BackupRejected { .. }));
        assert!(!replicator.is_backup_in_progress());
    }

    #[test]
    fn callback_error_propagates() {
        let (_temp, replicator) = primary(ReplicatorConfig::default());
        let err = replicator
            .backup(|_: &BackupInfo, _: &CancellationToken| -> CoreResult<bool> {
                Err(CoreError::codec("upload failed"))
            })
            .unwrap_err();
        assert!(matches!(err, CoreError::Codec { .. }));
    }

    #[test]
    fn cancelled_before_start_never_calls_back() {
        let (_temp, replicator) = primary(ReplicatorConfig::default());
        let token = CancellationToken::new();
        token.cancel();

        let mut called = false;
        let err = replicator
            .backup_with_cancellation(
                |_: &BackupInfo, _: &CancellationToken| -> CoreResult<bool> {
                    called = true;
                    Ok(true)
                },
                token,
            )
            .unwrap_err();
        assert!(matches!(err, CoreError::BackupCancelled { .. }));
        assert!(!called);
    }

    #[test]
    fn cancelled_during_callback() {
        let (_temp, replicator) = primary(ReplicatorConfig::default());
        let err = replicator
            .backup_with_cancellation(
                |_: &BackupInfo, cancel: &CancellationToken| -> CoreResult<bool> {
                    cancel.cancel();
                    assert!(cancel.is_cancelled());
                    Ok(true)
                },
                CancellationToken::new(),
            )
            .unwrap_err();
        assert!(matches!(err, CoreError::BackupCancelled { .. }));
    }

    #[test]
    fn second_backup_while_one_is_running_is_rejected() {
        let (_temp, replicator) = primary(ReplicatorConfig::default());
        let inner = Arc::clone(&replicator);
        let info = replicator
            .backup(move |_: &BackupInfo, _: &CancellationToken| -> CoreResult<bool> {
                let nested =
                    inner.backup(|_: &BackupInfo, _: &CancellationToken| -> CoreResult<bool> { Ok(true) });
                assert!(matches!(nested, Err(CoreError::BackupInProgress)));
                Ok(true)
            })
            .unwrap();
        assert_eq!(info.sequence, SequenceNumber::new(0));
    }

    #[test]
    fn reopen_replays_committed_transactions() {
        let temp = tempdir().unwrap();
        let log_path = temp.path().join("replicator.log");
        {
            let replicator = Arc::new(TransactionalReplicator::new(
                ReplicatorConfig::default(),
                temp.path(),
            ));
            replicator.try_add_state_serializer::<String>(Arc::new(CborSerializer::<String>::new()));
            replicator
                .open(
                    OpenMode::New,
                    Box::new(relcoll_storage::FileBackend::open(&log_path).unwrap()),
                )
                .unwrap();
            replicator.promote().unwrap();
            register(&replicator, "urn:d", StateProviderKind::Dictionary);
            let dict = replicator.dictionary::<u64, String>(&name("urn:d")).unwrap();
            replicator
                .transaction(|txn| dict.add(txn, 7, "seven".to_string()))
                .unwrap();

            let mut uncommitted = replicator.create_transaction().unwrap();
            dict.add(&mut uncommitted, 8, "eight".to_string()).unwrap();
            replicator.close().unwrap();
        }

        let replicator = Arc::new(TransactionalReplicator::new(
            ReplicatorConfig::default(),
            temp.path(),
        ));
        replicator.try_add_state_serializer::<String>(Arc::new(CborSerializer::<String>::new()));
        replicator
            .open(
                OpenMode::Existing,
                Box::new(relcoll_storage::FileBackend::open(&log_path).unwrap()),
            )
            .unwrap();
        assert_eq!(replicator.committed_seq(), SequenceNumber::new(2));
        assert_eq!(replicator.enumerate_providers(false).unwrap().len(), 2);

        let dict = replicator.dictionary::<u64, String>(&name("urn:d")).unwrap();
        assert_eq!(dict.count().unwrap(), 1);
        assert_eq!(dict.get(&7).unwrap(), Some("seven".to_string()));

        replicator.promote().unwrap();
        let mut txn = replicator.create_transaction().unwrap();
        assert!(txn.id() > TransactionId::new(2));
        replicator.abort(&mut txn).unwrap();
    }

    fn open_shared(
        backend: &SharedBackend,
        mode: OpenMode,
        factory: Arc<dyn StateProviderFactory>,
    ) -> (TempDir, Arc<TransactionalReplicator>) {
        let temp = tempdir().unwrap();
        let replicator = Arc::new(TransactionalReplicator::with_factory(
            ReplicatorConfig::default(),
            factory,
            temp.path(),
        ));
        replicator.try_add_state_serializer::<String>(Arc::new(CborSerializer::<String>::new()));
        replicator.open(mode, Box::new(backend.clone())).unwrap();
        replicator.promote().unwrap();
        (temp, replicator)
    }

    #[test]
    fn commit_that_fails_to_sync_is_not_replayed() {
        let backend = SharedBackend::new();
        {
            let (_temp, replicator) =
                open_shared(&backend, OpenMode::New, Arc::new(DefaultStateProviderFactory));
            register(&replicator, "urn:d", StateProviderKind::Dictionary);
            let dict = replicator.dictionary::<u64, String>(&name("urn:d")).unwrap();

            backend.fail_syncs(1);
            let mut txn = replicator.create_transaction().unwrap();
            dict.add(&mut txn, 1, "ghost".to_string()).unwrap();
            assert!(replicator.commit(&mut txn).is_err());
            assert_eq!(txn.state(), crate::transaction::TransactionState::Aborted);
            assert_eq!(dict.count().unwrap(), 0);
            assert_eq!(replicator.committed_seq(), SequenceNumber::new(1));
            assert_eq!(replicator.status(), ReplicatorStatus::Primary);

            replicator
                .transaction(|txn| dict.add(txn, 1, "real".to_string()))
                .unwrap();
            replicator.close().unwrap();
        }

        let (_temp, replicator) =
            open_shared(&backend, OpenMode::Existing, Arc::new(DefaultStateProviderFactory));
        let dict = replicator.dictionary::<u64, String>(&name("urn:d")).unwrap();
        assert_eq!(dict.count().unwrap(), 1);
        assert_eq!(dict.get(&1).unwrap(), Some("real".to_string()));
        assert_eq!(replicator.committed_seq(), SequenceNumber::new(2));
    }

    #[test]
    fn commit_stuck_in_the_log_closes_the_replicator() {
        let backend = SharedBackend::new();
        let (_temp, replicator) =
            open_shared(&backend, OpenMode::New, Arc::new(DefaultStateProviderFactory));

        backend.fail_syncs(1);
        backend.fail_truncate(true);
        let mut txn = replicator.create_transaction().unwrap();
        replicator
            .add_state_provider(&mut txn, name("urn:d"), StateProviderKind::Dictionary)
            .unwrap();
        assert!(replicator.commit(&mut txn).is_err());

        assert_eq!(replicator.status(), ReplicatorStatus::Closed);
        assert!(replicator.create_transaction().unwrap_err().is_invalid_state());
    }

    #[test]
    fn failing_factory_rejects_the_whole_registration() {
        let factory = |n: &StateProviderName, kind: StateProviderKind| -> CoreResult<Box<dyn crate::provider::StateProvider>> {
            if n.as_str().starts_with("urn:bad") {
                Err(CoreError::invalid_state("factory refused"))
            } else {
                DefaultStateProviderFactory.create(n, kind)
            }
        };
        let factory: Arc<dyn StateProviderFactory> = Arc::new(factory);
        let backend = SharedBackend::new();
        {
            let (_temp, replicator) = open_shared(&backend, OpenMode::New, Arc::clone(&factory));

            let mut txn = replicator.create_transaction().unwrap();
            replicator
                .add_state_provider(&mut txn, name("urn:good"), StateProviderKind::Dictionary)
                .unwrap();
            replicator
                .add_state_provider(&mut txn, name("urn:bad"), StateProviderKind::Queue)
                .unwrap();
            assert!(replicator.commit(&mut txn).is_err());
            assert!(replicator.enumerate_providers(false).unwrap().is_empty());
            assert_eq!(backend.len(), 0);
            assert_eq!(replicator.status(), ReplicatorStatus::Primary);

            register(&replicator, "urn:good", StateProviderKind::Dictionary);
            replicator.close().unwrap();
        }

        let (_temp, replicator) = open_shared(&backend, OpenMode::Existing, factory);
        let names: Vec<_> = replicator
            .enumerate_providers(true)
            .unwrap()
            .into_iter()
            .map(|p| p.name.to_string())
            .collect();
        assert_eq!(names, vec!["urn:good"]);
    }

    #[test]
    fn new_mode_refuses_a_non_empty_log() {
        let temp = tempdir().unwrap();
        let replicator = TransactionalReplicator::new(ReplicatorConfig::default(), temp.path());
        let backend = InMemoryBackend::with_data(vec![1, 2, 3]);
        assert!(replicator.open(OpenMode::New, Box::new(backend)).unwrap_err().is_invalid_state());
    }
}
