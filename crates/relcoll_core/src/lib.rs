//! # relcoll core
//!
//! Reliable collections hosted by a single transactional replica.
//!
//! This crate provides:
//! - Transactions that stage writes and publish them atomically on commit
//! - Reliable dictionaries, queues and concurrent queues (state providers)
//! - A state manager registering named providers inside transactions
//! - A replicator log for durability and reopen
//! - Consistent backups handed to a caller-supplied callback
//! - A reader for exported backup folders
//!
//! ```rust,ignore
//! use relcoll_core::{OpenMode, Replica, ReplicaConfig, StateProviderKind, StateProviderName};
//!
//! let replica = Replica::with_defaults(ReplicaConfig::new(work_dir, service_name))?;
//! let replicator = replica.replicator();
//! replica.open(OpenMode::New)?;
//! replica.promote()?;
//!
//! let name = StateProviderName::new("urn:orders")?;
//! replicator.transaction(|txn| {
//!     replicator.add_state_provider(txn, name.clone(), StateProviderKind::Dictionary)
//! })?;
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod backup;
mod collection;
mod config;
mod dir;
mod error;
mod key;
mod name;
mod provider;
mod replica;
mod replicator;
mod serializer;
mod state_manager;
#[cfg(test)]
mod test_support;
mod transaction;
mod types;
pub mod wal;

pub use backup::{BackupCallback, BackupInfo, BackupMetadata, BackupOption, BackupReader};
pub use collection::{ReliableDictionary, ReliableQueue};
pub use config::{ReplicaConfig, ReplicatorConfig};
pub use error::{CoreError, CoreResult};
pub use key::DictionaryKey;
pub use name::{ServiceName, StateProviderName};
pub use provider::{
    DefaultStateProviderFactory, DictionaryStore, ProviderEntry, ProviderOp, QueueStore,
    StateProvider, StateProviderFactory, StateProviderKind,
};
pub use replica::{DataLossHandler, NoDataLoss, OpenMode, Replica, ReplicaState};
pub use replicator::{ReplicatorStatus, TransactionalReplicator};
pub use serializer::{CborSerializer, SerializerRegistry, StateSerializer};
pub use state_manager::{ProviderInfo, ProviderSnapshot, StateManager};
pub use tokio_util::sync::CancellationToken;
pub use transaction::{PendingOp, Transaction, TransactionState};
pub use types::{ProviderId, SequenceNumber, TransactionId};

/// Crate version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
