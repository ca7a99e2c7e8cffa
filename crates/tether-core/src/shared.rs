//! Shared cells: lightweight handles onto a backing reference.
//!
//! A [`Shared<V>`] pairs a backing reference with a derivation path. Cloning a
//! cell is cheap and every clone observes the same value. Projections derive
//! cells for members of the value; all of them read and write through the one
//! reference at the root.
//!
//! ```rust
//! use tether_core::{lens, Shared};
//!
//! #[derive(Debug, Clone, PartialEq)]
//! struct Counter { count: i64 }
//!
//! let counter = Shared::new(Counter { count: 0 });
//! let count = counter.project(lens!(Counter, count));
//! count.write(3);
//! assert_eq!(counter.read(), Counter { count: 3 });
//! ```

use std::fmt;
use std::panic::Location;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::bridge::UpdateStream;
use crate::errors::{Result, TetherError};
use crate::issue::{describe_difference, report_issue};
use crate::lens::Lens;
use crate::persistence::PersistenceKey;
use crate::reference::{Access, Observation, Reference, ReferenceId, RootAccess, SharedValue};
use crate::registry::resolve_current;
use crate::tracker::asserting_all;

/// Member of a parent value reached through a lens.
///
/// Partial paths remember the last value they resolved to, so a cell whose
/// element later disappears keeps reading that value while its writes are
/// dropped.
struct Projection<P, V> {
    parent: Arc<dyn Access<P>>,
    lens: Lens<P, V>,
    last_known: Mutex<V>,
}

impl<P: SharedValue, V: SharedValue> Projection<P, V> {
    fn remember(&self, value: &V) {
        if self.lens.is_partial() {
            self.last_known.lock().clone_from(value);
        }
    }
}

impl<P: SharedValue, V: SharedValue> Access<V> for Projection<P, V> {
    fn get(&self) -> V {
        let mut found = None;
        self.parent
            .visit(&mut |parent| found = self.lens.get(parent).cloned());
        match found {
            Some(value) => {
                self.remember(&value);
                value
            }
            None => self.last_known.lock().clone(),
        }
    }

    fn visit(&self, visit: &mut dyn FnMut(&V)) {
        let mut resolved = false;
        self.parent.visit(&mut |parent| {
            if let Some(value) = self.lens.get(parent) {
                resolved = true;
                self.remember(value);
                visit(value);
            }
        });
        if !resolved {
            visit(&*self.last_known.lock());
        }
    }

    fn modify(&self, modify: &mut dyn FnMut(&mut V) -> bool) -> bool {
        self.parent
            .modify(&mut |parent| match self.lens.get_mut(parent) {
                Some(value) => {
                    let changed = modify(&mut *value);
                    if changed {
                        self.remember(value);
                    }
                    changed
                }
                None => false,
            })
    }

    fn visit_snapshot(&self, visit: &mut dyn FnMut(&mut V, &V)) -> bool {
        self.parent.visit_snapshot(&mut |snapshot, current| {
            if let (Some(snapshot), Some(current)) =
                (self.lens.get_mut(snapshot), self.lens.get(current))
            {
                visit(snapshot, current);
            }
        })
    }
}

/// Handle to shared, optionally persisted state.
pub struct Shared<V: SharedValue> {
    access: Arc<dyn Access<V>>,
    root: Arc<dyn RootAccess>,
}

impl<V: SharedValue> Clone for Shared<V> {
    fn clone(&self) -> Self {
        Self {
            access: self.access.clone(),
            root: self.root.clone(),
        }
    }
}

impl<V: SharedValue> fmt::Debug for Shared<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Shared")
            .field("reference", &self.root.id())
            .field("value", &self.read())
            .finish()
    }
}

impl<V: SharedValue + Default> Default for Shared<V> {
    #[track_caller]
    fn default() -> Self {
        Self::new(V::default())
    }
}

impl<V: SharedValue> Shared<V> {
    /// A cell over a fresh, unpersisted value.
    #[track_caller]
    pub fn new(value: V) -> Self {
        Self::from_reference(Reference::new(value, Location::caller()))
    }

    /// A cell bound to `key`, starting from `default` when nothing is
    /// persisted yet.
    ///
    /// Cells created from keys with equal identities share one reference.
    #[track_caller]
    pub fn persisted<K>(key: K, default: V) -> Self
    where
        K: PersistenceKey<Value = V>,
    {
        let location = Location::caller();
        let fallback = default.clone();
        match resolve_current(key, move |_| Ok(default), location) {
            Ok(reference) => Self::from_reference(reference),
            Err(error) => {
                report_issue(error.to_string(), location);
                Self::from_reference(Reference::new(fallback, location))
            }
        }
    }

    /// A cell bound to `key` that requires a persisted value to exist.
    ///
    /// Fails with [`TetherError::NotFound`] when the strategy has nothing
    /// stored and no live reference is bound to the key.
    #[track_caller]
    pub fn require<K>(key: K) -> Result<Self>
    where
        K: PersistenceKey<Value = V>,
    {
        let reference = resolve_current(
            key,
            |key| {
                key.load(None)
                    .ok_or_else(|| TetherError::not_found(format!("no value stored for {}", key.id())))
            },
            Location::caller(),
        )?;
        Ok(Self::from_reference(reference))
    }

    fn from_reference(reference: Arc<Reference<V>>) -> Self {
        Self {
            access: reference.clone(),
            root: reference,
        }
    }

    /// Current value.
    ///
    /// Inside an assertion replay this is the expected value being built
    /// rather than the live one.
    pub fn read(&self) -> V {
        self.access.get()
    }

    /// Replace the value.
    ///
    /// Writes through a projection whose path no longer resolves are dropped.
    pub fn write(&self, value: V) {
        let mut pending = Some(value);
        let applied = self.access.modify(&mut |slot| match pending.take() {
            Some(value) => {
                *slot = value;
                true
            }
            None => false,
        });
        if !applied {
            tracing::debug!(reference = %self.root.id(), "write dropped: path does not resolve");
        }
    }

    /// Read, modify, and write back while holding the reference's lock.
    ///
    /// The body may read and write this cell (or any cell over the same
    /// reference) again without deadlocking. The value is only written back
    /// if the body changed it.
    pub fn with_lock<R>(&self, body: impl FnOnce(&mut V) -> R) -> R {
        let _lock = self.root.hold();
        let mut value = self.read();
        let before = value.clone();
        let result = body(&mut value);
        if value != before {
            self.write(value);
        }
        result
    }

    /// Derive a cell for a member that is always present.
    ///
    /// # Panics
    ///
    /// Panics if `lens` does not resolve against the current value. Use
    /// [`Shared::project_optional`] for members that may be absent.
    #[track_caller]
    pub fn project<W: SharedValue>(&self, lens: Lens<V, W>) -> Shared<W> {
        match self.project_optional(lens) {
            Some(shared) => shared,
            None => panic!("projected path does not resolve against {:?}", self.read()),
        }
    }

    /// Derive a cell for a member that may be absent, or `None` if it is
    /// absent right now.
    pub fn project_optional<W: SharedValue>(&self, lens: Lens<V, W>) -> Option<Shared<W>> {
        let mut captured = None;
        self.access
            .visit(&mut |value| captured = lens.get(value).cloned());
        let last_known = captured?;
        Some(Shared {
            access: Arc::new(Projection {
                parent: self.access.clone(),
                lens,
                last_known: Mutex::new(last_known),
            }),
            root: self.root.clone(),
        })
    }

    /// Assert the change made since tracking began.
    ///
    /// `expect` receives the pre-change value and must turn it into the value
    /// the cell holds now. Reports an issue when nothing changed or when the
    /// expectation does not match, and in both cases accepts the live value
    /// so later assertions start from it.
    #[track_caller]
    pub fn assert(&self, expect: impl FnOnce(&mut V)) {
        let location = Location::caller();
        let mut pair = None;
        self.access.visit_snapshot(&mut |snapshot, current| {
            pair = Some((snapshot.clone(), current.clone()));
        });
        let Some((mut expected, actual)) = pair.filter(|(snapshot, current)| snapshot != current)
        else {
            report_issue("Expected changes, but none occurred.", location);
            return;
        };

        asserting_all(|| expect(&mut expected));
        if expected != actual {
            report_issue(
                describe_difference("A state change does not match expectation:", &expected, &actual),
                location,
            );
        }
        self.accept_live_value();
    }

    /// Accept the pending change to this cell without asserting it.
    #[track_caller]
    pub fn skip_changes(&self) {
        let mut skipped = false;
        self.access.visit_snapshot(&mut |snapshot, current| {
            if snapshot != current {
                skipped = true;
                snapshot.clone_from(current);
            }
        });
        if !skipped {
            report_issue("Expected changes to skip, but none occurred.", Location::caller());
        }
    }

    fn accept_live_value(&self) {
        self.access
            .visit_snapshot(&mut |snapshot, current| snapshot.clone_from(current));
    }

    /// Re-read the value from the persistence strategy.
    ///
    /// The loaded value replaces the live one like an external change. With
    /// nothing stored the cell returns to its default.
    pub fn load(&self) {
        self.root.reload();
    }

    /// Save the current value immediately, bypassing any debounce.
    pub fn save(&self) -> Result<()> {
        self.root.save()
    }

    /// Whether this cell is backed by a persistence strategy.
    pub fn is_persisted(&self) -> bool {
        self.root.is_persisted()
    }

    /// Call `observer` with each new, distinct value of this cell.
    ///
    /// The observation keeps the backing reference alive until dropped.
    pub fn subscribe(&self, observer: impl Fn(&V) + Send + Sync + 'static) -> Observation {
        let access = self.access.clone();
        let last = Mutex::new(self.read());
        self.root.observe(Arc::new(move || {
            let value = access.get();
            {
                let mut last = last.lock();
                if *last == value {
                    return;
                }
                last.clone_from(&value);
            }
            observer(&value);
        }))
    }

    /// Stream of each new, distinct value of this cell.
    pub fn updates(&self) -> UpdateStream<V> {
        UpdateStream::new(|sender| {
            self.subscribe(move |value| {
                sender.send(value.clone());
            })
        })
    }

    /// Read-only view of this cell.
    pub fn reader(&self) -> SharedReader<V> {
        SharedReader {
            shared: self.clone(),
        }
    }

    /// Identity of the backing reference.
    pub fn reference_id(&self) -> ReferenceId {
        self.root.id()
    }

    /// Whether both cells share a backing reference.
    pub fn same_reference<W: SharedValue>(&self, other: &Shared<W>) -> bool {
        self.root.id() == other.root.id()
    }
}

/// Read-only handle to shared state.
pub struct SharedReader<V: SharedValue> {
    shared: Shared<V>,
}

impl<V: SharedValue> Clone for SharedReader<V> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

impl<V: SharedValue> fmt::Debug for SharedReader<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("SharedReader").field(&self.shared).finish()
    }
}

impl<V: SharedValue> From<Shared<V>> for SharedReader<V> {
    fn from(shared: Shared<V>) -> Self {
        Self { shared }
    }
}

impl<V: SharedValue> SharedReader<V> {
    /// Current value.
    pub fn read(&self) -> V {
        self.shared.read()
    }

    /// Read-only view of an always-present member.
    #[track_caller]
    pub fn project<W: SharedValue>(&self, lens: Lens<V, W>) -> SharedReader<W> {
        self.shared.project(lens).reader()
    }

    /// Read-only view of a member that may be absent.
    pub fn project_optional<W: SharedValue>(&self, lens: Lens<V, W>) -> Option<SharedReader<W>> {
        self.shared.project_optional(lens).map(|shared| shared.reader())
    }

    /// Call `observer` with each new, distinct value.
    pub fn subscribe(&self, observer: impl Fn(&V) + Send + Sync + 'static) -> Observation {
        self.shared.subscribe(observer)
    }

    /// Stream of each new, distinct value.
    pub fn updates(&self) -> UpdateStream<V> {
        self.shared.updates()
    }

    /// Re-read the value from the persistence strategy.
    pub fn load(&self) {
        self.shared.load();
    }
}
