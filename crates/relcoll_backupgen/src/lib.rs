//! # relcoll backup generator
//!
//! Produces reliable-collection backups for parser and restore tests.
//!
//! ```rust,ignore
//! use relcoll_backupgen::BackupGenerator;
//!
//! let copied = BackupGenerator::new("/tmp/backupgen").generate_user_data()?;
//! println!("snapshot copied to {}", copied.display());
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod error;
mod generator;
mod naming;
mod populate;
mod user;

pub use error::{GeneratorError, GeneratorResult};
pub use generator::{copy_dir, BackupGenerator, GeneratorOptions, BACKUP_CONTAINER, DICTIONARY_NAME};
pub use naming::{RandomServiceNames, SequentialServiceNames, ServiceNameGenerator, SERVICE_NAME_BASE};
pub use populate::populate_dictionary;
pub use user::{count_users, Address, User, UserSerializer};
