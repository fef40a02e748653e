//! Keyed function tables.
//!
//! Each message type is a plain value plus up to three functions registered
//! under its [`MessageId`]: one to serialize it, one to deserialize it and one
//! to handle it. The tables erase the concrete type so one server can carry
//! any number of message types; the typed `register` methods put it back.
use std::{
    any::{Any, TypeId, type_name},
    collections::HashMap,
    sync::Arc,
};

use parking_lot::RwLock;
use thiserror::Error;

use super::{CodecError, MessageId};
use crate::net::ConnectionId;

pub type SerializeFn = Arc<dyn Fn(&dyn Any) -> Result<Vec<u8>, CodecError> + Send + Sync>;
pub type DeserializeFn =
    Arc<dyn Fn(&[u8]) -> Result<Box<dyn Any + Send>, CodecError> + Send + Sync>;
pub type HandlerFn =
    Arc<dyn Fn(ConnectionId, Box<dyn Any + Send>) -> Result<(), HandlerError> + Send + Sync>;

/// Failure reported by a message handler. Any failure drops the connection.
#[derive(Debug, Error)]
pub enum HandlerError {
    #[error("{0}")]
    Failed(String),

    #[error("handler expected a {expected}")]
    TypeMismatch { expected: &'static str },
}

impl HandlerError {
    pub fn new(reason: impl Into<String>) -> Self {
        Self::Failed(reason.into())
    }
}

/// Map from message key to a value; re-registering a key replaces it.
#[derive(Debug)]
pub struct Registry<V> {
    entries: RwLock<HashMap<MessageId, V>>,
}

impl<V> Default for Registry<V> {
    fn default() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
        }
    }
}

impl<V: Clone> Registry<V> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, id: MessageId, value: V) -> Option<V> {
        self.entries.write().insert(id, value)
    }

    pub fn get(&self, id: MessageId) -> Option<V> {
        self.entries.read().get(&id).cloned()
    }

    pub fn contains(&self, id: MessageId) -> bool {
        self.entries.read().contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

/// Serializers, plus the key each Rust type was last registered under.
#[derive(Default)]
pub struct SerializerRegistry {
    serializers: Registry<SerializeFn>,
    keys: RwLock<HashMap<TypeId, MessageId>>,
}

impl SerializerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<T, F>(&self, id: MessageId, serializer: F)
    where
        T: Any,
        F: Fn(&T) -> Result<Vec<u8>, CodecError> + Send + Sync + 'static,
    {
        let erased: SerializeFn = Arc::new(move |value: &dyn Any| {
            let value = value.downcast_ref::<T>().ok_or(CodecError::TypeMismatch {
                expected: type_name::<T>(),
            })?;
            serializer(value)
        });

        self.serializers.insert(id, erased);
        self.keys.write().insert(TypeId::of::<T>(), id);
    }

    pub fn get(&self, id: MessageId) -> Option<SerializeFn> {
        self.serializers.get(id)
    }

    /// Key most recently registered for values of type `T`.
    pub fn key_for<T: Any>(&self) -> Option<MessageId> {
        self.keys.read().get(&TypeId::of::<T>()).copied()
    }

    pub fn len(&self) -> usize {
        self.serializers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.serializers.is_empty()
    }
}

#[derive(Default)]
pub struct DeserializerRegistry {
    deserializers: Registry<DeserializeFn>,
}

impl DeserializerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<T, F>(&self, id: MessageId, deserializer: F)
    where
        T: Any + Send,
        F: Fn(&[u8]) -> Result<T, CodecError> + Send + Sync + 'static,
    {
        let erased: DeserializeFn = Arc::new(move |payload: &[u8]| {
            deserializer(payload).map(|value| Box::new(value) as Box<dyn Any + Send>)
        });
        self.deserializers.insert(id, erased);
    }

    pub fn get(&self, id: MessageId) -> Option<DeserializeFn> {
        self.deserializers.get(id)
    }

    pub fn contains(&self, id: MessageId) -> bool {
        self.deserializers.contains(id)
    }
}

#[derive(Default)]
pub struct HandlerRegistry {
    handlers: Registry<HandlerFn>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<T, F>(&self, id: MessageId, handler: F)
    where
        T: Any + Send,
        F: Fn(ConnectionId, T) -> Result<(), HandlerError> + Send + Sync + 'static,
    {
        let erased: HandlerFn =
            Arc::new(move |connection: ConnectionId, value: Box<dyn Any + Send>| {
                let value = value
                    .downcast::<T>()
                    .map_err(|_| HandlerError::TypeMismatch {
                        expected: type_name::<T>(),
                    })?;
                handler(connection, *value)
            });
        self.handlers.insert(id, erased);
    }

    pub fn get(&self, id: MessageId) -> Option<HandlerFn> {
        self.handlers.get(id)
    }

    pub fn contains(&self, id: MessageId) -> bool {
        self.handlers.contains(id)
    }
}
