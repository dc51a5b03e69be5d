//! Transactions staged against the replicator.
//!
//! A transaction collects registrations and provider mutations. Nothing it
//! stages is visible to other readers until the replicator commits it.

mod state;

pub use state::{PendingOp, Transaction, TransactionState};
