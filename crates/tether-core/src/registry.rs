//! Identity map from persistence keys to backing references.
//!
//! Two shared cells created from equal keys must alias the same reference.
//! The registry holds weak entries so that a reference is released with its
//! last cell, except for keys whose [`Retention`] asks to be pinned for the
//! lifetime of the registry.

use std::any::{type_name, Any};
use std::collections::HashMap;
use std::fmt;
use std::panic::Location;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use crate::errors::{Result, TetherError};
use crate::persistence::{PersistenceId, PersistenceKey, Retention};
use crate::reference::Reference;

type AnyReference = Arc<dyn Any + Send + Sync>;

struct Entry {
    reference: Weak<dyn Any + Send + Sync>,
    pinned: Option<AnyReference>,
}

/// Deduplicates persisted references by [`PersistenceId`].
#[derive(Default)]
pub struct ReferenceRegistry {
    entries: Mutex<HashMap<PersistenceId, Entry>>,
}

impl fmt::Debug for ReferenceRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReferenceRegistry")
            .field("entries", &self.entries.lock().len())
            .finish()
    }
}

impl ReferenceRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Resolve the reference for `key`, creating and loading it on first use.
    ///
    /// `initial` supplies the default value and only runs on creation. Fails
    /// with [`TetherError::TypeMismatch`] if the identity is already bound to
    /// a different value type.
    pub(crate) fn resolve<K, F>(
        &self,
        key: K,
        initial: F,
        location: &'static Location<'static>,
    ) -> Result<Arc<Reference<K::Value>>>
    where
        K: PersistenceKey,
        F: FnOnce(&K) -> Result<K::Value>,
    {
        let id = key.id();
        let mut entries = self.entries.lock();
        if let Some(existing) = entries.get(&id).and_then(|entry| entry.reference.upgrade()) {
            return existing
                .downcast::<Reference<K::Value>>()
                .map_err(|_| {
                    TetherError::type_mismatch(format!(
                        "{id} is already bound to a different type than {}",
                        type_name::<K::Value>()
                    ))
                });
        }

        let initial = initial(&key)?;
        let retention = key.retention();
        let reference = Reference::persisted(Arc::new(key), initial, location);
        let erased: AnyReference = reference.clone();
        entries.insert(
            id.clone(),
            Entry {
                reference: Arc::downgrade(&erased),
                pinned: (retention == Retention::Process).then_some(erased),
            },
        );
        entries.retain(|_, entry| entry.reference.strong_count() > 0);
        tracing::debug!(%id, ?retention, "registered reference");
        Ok(reference)
    }

    /// Whether a live reference is bound to `id`.
    pub fn contains(&self, id: &PersistenceId) -> bool {
        self.entries
            .lock()
            .get(id)
            .is_some_and(|entry| entry.reference.strong_count() > 0)
    }

    /// Number of live references.
    pub fn len(&self) -> usize {
        self.entries
            .lock()
            .values()
            .filter(|entry| entry.reference.strong_count() > 0)
            .count()
    }

    /// Whether no live reference is registered.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Forget every entry, releasing pinned references.
    pub fn clear(&self) {
        let drained: Vec<Entry> = self.entries.lock().drain().map(|(_, entry)| entry).collect();
        // Pinned references may report on drop; release them outside the lock.
        drop(drained);
    }
}

/// Resolve `key` in the current scope's registry.
pub(crate) fn resolve_current<K, F>(
    key: K,
    initial: F,
    location: &'static Location<'static>,
) -> Result<Arc<Reference<K::Value>>>
where
    K: PersistenceKey,
    F: FnOnce(&K) -> Result<K::Value>,
{
    crate::Dependencies::current()
        .registry()
        .resolve(key, initial, location)
}
