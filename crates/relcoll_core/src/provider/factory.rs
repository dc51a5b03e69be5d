//! Creation of provider stores.

use super::{DictionaryStore, QueueStore, StateProvider, StateProviderKind};
use crate::error::{CoreError, CoreResult};
use crate::name::StateProviderName;

/// Creates the store that holds a collection's entries.
///
/// The replicator calls this when a registration commits and again for every
/// registration replayed from the log. `kind` is always the collection kind,
/// even when the store is attached to the collection's data store child.
pub trait StateProviderFactory: Send + Sync {
    /// Creates an empty store for `name`.
    fn create(
        &self,
        name: &StateProviderName,
        kind: StateProviderKind,
    ) -> CoreResult<Box<dyn StateProvider>>;
}

impl<F> StateProviderFactory for F
where
    F: Fn(&StateProviderName, StateProviderKind) -> CoreResult<Box<dyn StateProvider>>
        + Send
        + Sync,
{
    fn create(
        &self,
        name: &StateProviderName,
        kind: StateProviderKind,
    ) -> CoreResult<Box<dyn StateProvider>> {
        self(name, kind)
    }
}

/// Factory for the built-in stores.
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultStateProviderFactory;

impl StateProviderFactory for DefaultStateProviderFactory {
    fn create(
        &self,
        name: &StateProviderName,
        kind: StateProviderKind,
    ) -> CoreResult<Box<dyn StateProvider>> {
        match kind {
            StateProviderKind::Dictionary => Ok(Box::new(DictionaryStore::new())),
            StateProviderKind::Queue | StateProviderKind::ConcurrentQueue => {
                Ok(Box::new(QueueStore::new(kind)))
            }
            StateProviderKind::DataStore => Err(CoreError::invalid_state(format!(
                "{name}: a data store cannot be created on its own"
            ))),
        }
    }
}
