//! State manager: the registry of state providers in a replica.
//!
//! Records are kept in registration order. When data store children are
//! enabled every collection owns an implicit `DataStore` child and its
//! entries live in the child's store; otherwise they live in the
//! collection's own store. Callers always address the collection.

use crate::error::{CoreError, CoreResult};
use crate::name::StateProviderName;
use crate::provider::{ProviderEntry, ProviderOp, StateProvider, StateProviderFactory, StateProviderKind};
use crate::transaction::{PendingOp, Transaction};
use crate::types::{ProviderId, SequenceNumber, TransactionId};
use crate::wal::LogRecord;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;

/// A registered state provider.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderInfo {
    /// Assigned at commit.
    pub id: ProviderId,
    /// Unique name.
    pub name: StateProviderName,
    /// Provider kind.
    pub kind: StateProviderKind,
    /// Owning collection, for implicit children.
    pub parent: Option<ProviderId>,
}

impl ProviderInfo {
    /// Whether this is a top-level registration.
    #[must_use]
    pub fn is_parent(&self) -> bool {
        self.parent.is_none()
    }
}

/// A provider as captured by a backup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderSnapshot {
    /// The registry record.
    pub info: ProviderInfo,
    /// Entries, for providers that hold data.
    pub entries: Option<Vec<ProviderEntry>>,
}

/// Stores created ahead of a commit, keyed by holding provider.
pub(crate) type PreparedStores = HashMap<ProviderId, Box<dyn StateProvider>>;

/// Registry of the committed state providers and their stores.
pub struct StateManager {
    factory: Arc<dyn StateProviderFactory>,
    data_store_children: bool,
    data_store_segment: String,
    records: Vec<ProviderInfo>,
    by_name: HashMap<StateProviderName, usize>,
    by_id: HashMap<ProviderId, usize>,
    /// collection -> provider whose store holds its entries
    holders: HashMap<ProviderId, ProviderId>,
    stores: HashMap<ProviderId, Box<dyn StateProvider>>,
    next_id: u64,
}

impl StateManager {
    pub(crate) fn new(
        factory: Arc<dyn StateProviderFactory>,
        data_store_children: bool,
        data_store_segment: impl Into<String>,
    ) -> Self {
        Self {
            factory,
            data_store_children,
            data_store_segment: data_store_segment.into(),
            records: Vec::new(),
            by_name: HashMap::new(),
            by_id: HashMap::new(),
            holders: HashMap::new(),
            stores: HashMap::new(),
            next_id: 1,
        }
    }

    /// Number of registered providers, implicit children included.
    #[must_use]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Whether nothing is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Registered providers in registration order.
    #[must_use]
    pub fn enumerate(&self, parents_only: bool) -> Vec<ProviderInfo> {
        self.records
            .iter()
            .filter(|info| !parents_only || info.is_parent())
            .cloned()
            .collect()
    }

    /// Looks up a provider by name.
    #[must_use]
    pub fn lookup(&self, name: &StateProviderName) -> Option<&ProviderInfo> {
        self.by_name.get(name).map(|&i| &self.records[i])
    }

    /// Looks up a provider by ID.
    #[must_use]
    pub fn lookup_id(&self, id: ProviderId) -> Option<&ProviderInfo> {
        self.by_id.get(&id).map(|&i| &self.records[i])
    }

    /// Names a registration of `name` would claim.
    pub(crate) fn claimed_names(&self, name: &StateProviderName) -> CoreResult<Vec<StateProviderName>> {
        let mut names = vec![name.clone()];
        if self.data_store_children {
            names.push(name.child(&self.data_store_segment)?);
        }
        Ok(names)
    }

    /// Store holding a collection's committed entries.
    pub(crate) fn store(&self, collection: ProviderId) -> CoreResult<&dyn StateProvider> {
        self.holders
            .get(&collection)
            .and_then(|holder| self.stores.get(holder))
            .map(|store| store.as_ref())
            .ok_or_else(|| CoreError::not_found(collection))
    }

    /// Checks staged operations against committed state, in staging order.
    pub(crate) fn validate(&self, txn: &Transaction) -> CoreResult<()> {
        let mut names: HashSet<StateProviderName> = HashSet::new();
        // (provider, key) -> present after the ops seen so far
        let mut keys: HashMap<(ProviderId, &[u8]), bool> = HashMap::new();
        let mut lengths: HashMap<ProviderId, u64> = HashMap::new();

        for pending in txn.pending_ops() {
            match pending {
                PendingOp::AddProvider { name, kind } => {
                    if !kind.is_collection() {
                        return Err(CoreError::invalid_state(format!(
                            "{name}: a {kind} cannot be registered directly"
                        )));
                    }
                    for claimed in self.claimed_names(name)? {
                        if self.by_name.contains_key(&claimed) || !names.insert(claimed.clone()) {
                            return Err(CoreError::duplicate_name(claimed));
                        }
                    }
                }

                PendingOp::Write { provider, op } => {
                    let info = self
                        .lookup_id(*provider)
                        .ok_or_else(|| CoreError::not_found(provider))?;
                    let store = self.store(*provider)?;

                    let fits = if op.is_dictionary_op() {
                        info.kind == StateProviderKind::Dictionary
                    } else {
                        info.kind.is_queue()
                    };
                    if !fits {
                        return Err(CoreError::invalid_state(format!(
                            "{} cannot apply {op:?}",
                            info.name
                        )));
                    }

                    match op {
                        ProviderOp::Add { key, .. } => {
                            let present = keys
                                .entry((*provider, key.as_slice()))
                                .or_insert_with(|| store.get(key).is_some());
                            if *present {
                                return Err(CoreError::key_exists(&info.name));
                            }
                            *present = true;
                        }
                        ProviderOp::Set { key, .. } => {
                            keys.insert((*provider, key.as_slice()), true);
                        }
                        ProviderOp::Remove { key } => {
                            keys.insert((*provider, key.as_slice()), false);
                        }
                        ProviderOp::Enqueue { .. } => {
                            *lengths.entry(*provider).or_insert_with(|| store.count()) += 1;
                        }
                        ProviderOp::Dequeue => {
                            let len = lengths.entry(*provider).or_insert_with(|| store.count());
                            if *len == 0 {
                                return Err(CoreError::invalid_state(format!(
                                    "{}: dequeue from an empty queue",
                                    info.name
                                )));
                            }
                            *len -= 1;
                        }
                    }
                }
            }
        }
        Ok(())
    }

    /// Builds the log records for a validated transaction, assigning
    /// provider IDs to staged registrations.
    pub(crate) fn plan_commit(
        &mut self,
        txn: &Transaction,
        sequence: SequenceNumber,
    ) -> Vec<LogRecord> {
        let txid: TransactionId = txn.id();
        let mut records = Vec::with_capacity(txn.op_count() + 2);
        records.push(LogRecord::Begin { txid });

        for pending in txn.pending_ops() {
            let record = match pending {
                PendingOp::AddProvider { name, kind } => {
                    let id = self.allocate_id();
                    let data_store = self.data_store_children.then(|| self.allocate_id());
                    LogRecord::AddProvider {
                        txid,
                        id,
                        data_store,
                        kind: *kind,
                        name: name.clone(),
                    }
                }
                PendingOp::Write { provider, op } => LogRecord::Write {
                    txid,
                    provider: *provider,
                    op: op.clone(),
                },
            };
            records.push(record);
        }

        records.push(LogRecord::Commit { txid, sequence });
        records
    }

    fn allocate_id(&mut self) -> ProviderId {
        let id = ProviderId::new(self.next_id);
        self.next_id += 1;
        id
    }

    /// Creates the stores a planned commit registers, keyed by the
    /// provider that will hold them.
    ///
    /// Runs before the commit is logged so a failing factory rejects the
    /// transaction instead of breaking a logged one.
    pub(crate) fn prepare_stores(&self, records: &[LogRecord]) -> CoreResult<PreparedStores> {
        let mut stores = PreparedStores::new();
        for record in records {
            if let LogRecord::AddProvider {
                id,
                data_store,
                kind,
                name,
                ..
            } = record
            {
                let (holder, holder_name) = self.holder_of(*id, *data_store, name)?;
                stores.insert(holder, self.factory.create(&holder_name, *kind)?);
            }
        }
        Ok(stores)
    }

    fn holder_of(
        &self,
        id: ProviderId,
        data_store: Option<ProviderId>,
        name: &StateProviderName,
    ) -> CoreResult<(ProviderId, StateProviderName)> {
        match data_store {
            Some(child) => Ok((child, name.child(&self.data_store_segment)?)),
            None => Ok((id, name.clone())),
        }
    }

    /// Applies one record replayed from the log.
    pub(crate) fn apply(&mut self, record: &LogRecord) -> CoreResult<()> {
        self.apply_prepared(record, &mut PreparedStores::new())
    }

    /// Applies one committed record, taking new stores from `prepared`
    /// and creating any that are missing.
    pub(crate) fn apply_prepared(
        &mut self,
        record: &LogRecord,
        prepared: &mut PreparedStores,
    ) -> CoreResult<()> {
        match record {
            LogRecord::Begin { .. } | LogRecord::Commit { .. } => Ok(()),

            LogRecord::AddProvider {
                id,
                data_store,
                kind,
                name,
                ..
            } => {
                if self.by_name.contains_key(name) || self.by_id.contains_key(id) {
                    return Err(CoreError::duplicate_name(name));
                }

                let (holder, holder_name) = self.holder_of(*id, *data_store, name)?;
                let store = match prepared.remove(&holder) {
                    Some(store) => store,
                    None => self.factory.create(&holder_name, *kind)?,
                };

                self.insert(ProviderInfo {
                    id: *id,
                    name: name.clone(),
                    kind: *kind,
                    parent: None,
                });
                if let Some(child) = data_store {
                    self.insert(ProviderInfo {
                        id: *child,
                        name: holder_name,
                        kind: StateProviderKind::DataStore,
                        parent: Some(*id),
                    });
                }
                self.holders.insert(*id, holder);
                self.stores.insert(holder, store);

                let highest = data_store.unwrap_or(*id).as_u64().max(id.as_u64());
                self.next_id = self.next_id.max(highest + 1);
                Ok(())
            }

            LogRecord::Write { provider, op, .. } => {
                let holder = self
                    .holders
                    .get(provider)
                    .copied()
                    .ok_or_else(|| CoreError::not_found(provider))?;
                let store = self
                    .stores
                    .get_mut(&holder)
                    .ok_or_else(|| CoreError::not_found(holder))?;
                store.apply(op)
            }
        }
    }

    fn insert(&mut self, info: ProviderInfo) {
        let index = self.records.len();
        self.by_name.insert(info.name.clone(), index);
        self.by_id.insert(info.id, index);
        self.records.push(info);
    }

    /// Copies every record and the entries of every data-holding store.
    #[must_use]
    pub fn snapshot(&self) -> Vec<ProviderSnapshot> {
        self.records
            .iter()
            .map(|info| ProviderSnapshot {
                info: info.clone(),
                entries: self.stores.get(&info.id).map(|store| store.entries()),
            })
            .collect()
    }
}

impl fmt::Debug for StateManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StateManager")
            .field("providers", &self.records.len())
            .field("data_store_children", &self.data_store_children)
            .finish_non_exhaustive()
    }
}
