//! Typed handles to reliable collections.

mod dictionary;
mod queue;

pub use dictionary::ReliableDictionary;
pub use queue::ReliableQueue;
