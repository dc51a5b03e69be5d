//! Value serializers and the per-replicator serializer registry.

use crate::error::{CoreError, CoreResult};
use parking_lot::RwLock;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;

/// Converts values of `T` to and from the bytes stored in a provider.
pub trait StateSerializer<T>: Send + Sync {
    /// Serializes a value.
    fn write(&self, value: &T) -> CoreResult<Vec<u8>>;

    /// Deserializes a value.
    fn read(&self, bytes: &[u8]) -> CoreResult<T>;
}

/// CBOR serializer for any serde type.
pub struct CborSerializer<T>(PhantomData<fn() -> T>);

impl<T> CborSerializer<T> {
    /// Creates the serializer.
    #[must_use]
    pub const fn new() -> Self {
        Self(PhantomData)
    }
}

impl<T> Default for CborSerializer<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> fmt::Debug for CborSerializer<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CborSerializer<{}>", std::any::type_name::<T>())
    }
}

impl<T> StateSerializer<T> for CborSerializer<T>
where
    T: Serialize + DeserializeOwned,
{
    fn write(&self, value: &T) -> CoreResult<Vec<u8>> {
        let mut buf = Vec::new();
        ciborium::ser::into_writer(value, &mut buf).map_err(|e| CoreError::codec(e.to_string()))?;
        Ok(buf)
    }

    fn read(&self, bytes: &[u8]) -> CoreResult<T> {
        ciborium::de::from_reader(bytes).map_err(|e| CoreError::codec(e.to_string()))
    }
}

struct Registered {
    type_name: &'static str,
    serializer: Box<dyn Any + Send + Sync>,
}

/// Serializers keyed by value type.
///
/// Each type can be registered once; later registrations are ignored and
/// reported as `false`.
#[derive(Default)]
pub struct SerializerRegistry {
    serializers: RwLock<HashMap<TypeId, Registered>>,
}

impl SerializerRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `serializer` for `T` unless one is already present.
    pub fn try_add<T: 'static>(&self, serializer: Arc<dyn StateSerializer<T>>) -> bool {
        let mut serializers = self.serializers.write();
        if serializers.contains_key(&TypeId::of::<T>()) {
            return false;
        }
        serializers.insert(
            TypeId::of::<T>(),
            Registered {
                type_name: std::any::type_name::<T>(),
                serializer: Box::new(serializer),
            },
        );
        true
    }

    /// Returns the serializer registered for `T`.
    pub fn get<T: 'static>(&self) -> CoreResult<Arc<dyn StateSerializer<T>>> {
        self.serializers
            .read()
            .get(&TypeId::of::<T>())
            .and_then(|r| r.serializer.downcast_ref::<Arc<dyn StateSerializer<T>>>())
            .cloned()
            .ok_or(CoreError::SerializerNotRegistered {
                type_name: std::any::type_name::<T>(),
            })
    }

    /// Whether a serializer for `T` is registered.
    #[must_use]
    pub fn contains<T: 'static>(&self) -> bool {
        self.serializers.read().contains_key(&TypeId::of::<T>())
    }

    /// Names of the registered types.
    #[must_use]
    pub fn type_names(&self) -> Vec<&'static str> {
        self.serializers.read().values().map(|r| r.type_name).collect()
    }
}

impl fmt::Debug for SerializerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SerializerRegistry")
            .field("types", &self.type_names())
            .finish()
    }
}
