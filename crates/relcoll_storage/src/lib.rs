//! # relcoll storage
//!
//! Byte-store backends underneath the replicator log of a relcoll replica.
//!
//! Backends are **opaque**: they append, read back, flush and truncate
//! bytes. Record framing, checksums and replay belong to `relcoll_core`.
//!
//! ## Available Backends
//!
//! - [`FileBackend`] - the replica's on-disk log file
//! - [`InMemoryBackend`] - volatile replicas and tests
//!
//! ## Example
//!
//! ```rust
//! use relcoll_storage::{InMemoryBackend, StorageBackend};
//!
//! let mut log = InMemoryBackend::new();
//! let offset = log.append(b"commit").unwrap();
//! assert_eq!(log.read_at(offset, 6).unwrap(), b"commit");
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod backend;
mod error;
mod file;
mod memory;

pub use backend::StorageBackend;
pub use error::{StorageError, StorageResult};
pub use file::FileBackend;
pub use memory::InMemoryBackend;
