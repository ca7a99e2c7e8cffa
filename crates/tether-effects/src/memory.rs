//! In-memory persistence strategy
//!
//! Gives a shared value a process-lifetime identity without durability: every
//! cell created from the same key aliases one live value, and nothing
//! survives a restart.

use std::fmt;
use std::marker::PhantomData;

use tether_core::{PersistenceId, PersistenceKey, Result, Retention, SaveContext, SharedValue};

/// Key naming an in-memory shared value.
pub struct InMemoryKey<V> {
    key: String,
    _value: PhantomData<fn() -> V>,
}

impl<V> InMemoryKey<V> {
    /// Key for the value named `key`.
    pub fn new(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            _value: PhantomData,
        }
    }

    /// The key name.
    pub fn name(&self) -> &str {
        &self.key
    }
}

impl<V> Clone for InMemoryKey<V> {
    fn clone(&self) -> Self {
        Self::new(self.key.clone())
    }
}

impl<V> fmt::Debug for InMemoryKey<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("InMemoryKey").field(&self.key).finish()
    }
}

impl<V> PartialEq for InMemoryKey<V> {
    fn eq(&self, other: &Self) -> bool {
        self.key == other.key
    }
}

impl<V> Eq for InMemoryKey<V> {}

impl<V: SharedValue> PersistenceKey for InMemoryKey<V> {
    type Value = V;

    fn id(&self) -> PersistenceId {
        PersistenceId::new("in_memory", self.key.clone())
    }

    fn load(&self, _initial: Option<&V>) -> Option<V> {
        None
    }

    fn save(&self, _value: &V, _context: SaveContext) -> Result<()> {
        Ok(())
    }

    fn retention(&self) -> Retention {
        Retention::Process
    }
}
