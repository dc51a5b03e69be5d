//! Replicator log: the write-ahead log behind every commit.
//!
//! Every committed transaction is written as `Begin`, one record per
//! operation, then `Commit`, and flushed before any provider sees it.
//! Opening an existing replica replays the log from the start.
//!
//! ## Record Format
//!
//! ```text
//! | magic (4) | version (2) | type (1) | length (4) | payload (N) | crc32 (4) |
//! ```
//!
//! ## Recovery Policy
//!
//! A torn tail (incomplete header or payload) is a crash mid-write: the
//! partial bytes are cut off and replay proceeds with the complete records
//! before them. Transactions without a `Commit` record are discarded.
//!
//! CRC mismatches, bad magic, unknown record types and future versions are
//! fatal. The replica does not open.

mod record;
mod writer;

pub use record::{compute_crc32, LogRecord, LogRecordType, LOG_MAGIC, LOG_VERSION};
pub use writer::{RecoveredLog, ReplicatorLog};
