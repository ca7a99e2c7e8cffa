//! Backing store for shared state.
//!
//! A [`Reference`] owns the live value of a shared cell, the optional
//! pre-write snapshot used by change tracking, and the persistence strategy
//! (if any) the value is mirrored to. Shared cells and their projections are
//! thin handles onto a reference; a reference is never exposed directly.
//!
//! ## Locking
//!
//! Every reference carries a reentrant mutex so that `Shared::with_lock`
//! bodies may read and write the same cell again on the same thread. The
//! inner `RefCell` is only ever borrowed for the duration of a single
//! internal operation; user closures and observers run outside any borrow.

use std::any::type_name;
use std::cell::RefCell;
use std::fmt;
use std::panic::Location;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::{Mutex, ReentrantMutex};

use crate::dependencies::Dependencies;
use crate::errors::Result;
use crate::issue::{describe_difference, report_issue, Issue, IssueReporter};
use crate::persistence::{
    PersistenceKey, SaveContext, SharedSubscriber, SharedSubscription, SubscriberUpdate,
};
use crate::tracker::{Exhaustivity, TrackedReference};

/// Bound satisfied by every value that can live in a shared cell.
pub trait SharedValue: Clone + PartialEq + fmt::Debug + Send + Sync + 'static {}

impl<T> SharedValue for T where T: Clone + PartialEq + fmt::Debug + Send + Sync + 'static {}

static NEXT_REFERENCE_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique identity of a backing reference.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ReferenceId(u64);

impl ReferenceId {
    pub(crate) fn next() -> Self {
        Self(NEXT_REFERENCE_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for ReferenceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ref#{}", self.0)
    }
}

type ObserverFn = Arc<dyn Fn() + Send + Sync>;

#[derive(Default)]
pub(crate) struct ObserverList {
    next: AtomicU64,
    entries: Mutex<Vec<(u64, ObserverFn)>>,
}

impl ObserverList {
    fn insert(self: &Arc<Self>, observer: ObserverFn) -> Observation {
        let id = self.next.fetch_add(1, Ordering::Relaxed);
        self.entries.lock().push((id, observer));
        Observation {
            list: Arc::downgrade(self),
            id,
        }
    }

    fn notify(&self) {
        let observers: Vec<ObserverFn> = self
            .entries
            .lock()
            .iter()
            .map(|(_, observer)| observer.clone())
            .collect();
        for observer in observers {
            observer();
        }
    }

    fn len(&self) -> usize {
        self.entries.lock().len()
    }
}

/// Registration of a change observer. Unregisters on drop.
#[must_use = "dropping an observation stops it"]
pub struct Observation {
    list: Weak<ObserverList>,
    id: u64,
}

impl fmt::Debug for Observation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Observation").field("id", &self.id).finish()
    }
}

impl Drop for Observation {
    fn drop(&mut self) {
        if let Some(list) = self.list.upgrade() {
            list.entries.lock().retain(|(id, _)| *id != self.id);
        }
    }
}

/// A held reference lock, released on drop.
pub(crate) trait HeldLock {}

impl<T> HeldLock for T {}

/// Operations on a reference that do not depend on the value type.
pub(crate) trait RootAccess: Send + Sync {
    fn id(&self) -> ReferenceId;
    fn location(&self) -> &'static Location<'static>;
    fn description(&self) -> String;
    fn hold(&self) -> Box<dyn HeldLock + '_>;
    fn observe(&self, observer: ObserverFn) -> Observation;
    fn reload(&self);
    fn save(&self) -> Result<()>;
    fn is_persisted(&self) -> bool;
}

/// Typed access to a value somewhere below a reference.
///
/// Implemented by [`Reference`] for the root and by projections for members.
pub(crate) trait Access<V>: Send + Sync {
    /// The value a read should observe.
    fn get(&self) -> V;

    /// Call `visit` exactly once with the value a read should observe.
    fn visit(&self, visit: &mut dyn FnMut(&V));

    /// Apply `modify` to the live value. `modify` returns whether it changed
    /// anything; the result is whether the write took effect.
    fn modify(&self, modify: &mut dyn FnMut(&mut V) -> bool) -> bool;

    /// Call `visit` with `(snapshot, live)` when a snapshot is outstanding.
    /// Returns whether one was.
    fn visit_snapshot(&self, visit: &mut dyn FnMut(&mut V, &V)) -> bool;
}

struct ReferenceState<V> {
    current: V,
    snapshot: Option<V>,
    exhaustivity: Exhaustivity,
    reporter: Option<Arc<dyn IssueReporter>>,
    version: u64,
}

/// The single authoritative holder of a shared value.
pub struct Reference<V: SharedValue> {
    id: ReferenceId,
    this: Weak<Reference<V>>,
    state: ReentrantMutex<RefCell<ReferenceState<V>>>,
    initial: V,
    key: Option<Arc<dyn PersistenceKey<Value = V>>>,
    subscription: Mutex<Option<SharedSubscription>>,
    observers: Arc<ObserverList>,
    location: &'static Location<'static>,
}

impl<V: SharedValue> fmt::Debug for Reference<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let guard = self.state.lock();
        let state = guard.borrow();
        f.debug_struct("Reference")
            .field("id", &self.id)
            .field("key", &self.key.as_ref().map(|key| key.id()))
            .field("value", &state.current)
            .field("tracked", &state.snapshot.is_some())
            .finish()
    }
}

impl<V: SharedValue> Reference<V> {
    /// An unpersisted reference holding `value`.
    pub(crate) fn new(value: V, location: &'static Location<'static>) -> Arc<Self> {
        Self::build(value.clone(), value, None, location)
    }

    /// A reference bound to `key`, loaded from it and subscribed to its
    /// external changes.
    pub(crate) fn persisted(
        key: Arc<dyn PersistenceKey<Value = V>>,
        initial: V,
        location: &'static Location<'static>,
    ) -> Arc<Self> {
        let loaded = key.load(Some(&initial));
        let current = loaded.unwrap_or_else(|| initial.clone());
        let reference = Self::build(current, initial.clone(), Some(key.clone()), location);

        let weak = Arc::downgrade(&reference);
        let subscriber = SharedSubscriber::new(move |update| {
            if let Some(reference) = weak.upgrade() {
                reference.apply_external(update);
            }
        });
        let subscription = key.subscribe(Some(initial), subscriber);
        *reference.subscription.lock() = Some(subscription);
        tracing::debug!(id = %reference.id, key = %key.id(), "bound persisted reference");
        reference
    }

    fn build(
        current: V,
        initial: V,
        key: Option<Arc<dyn PersistenceKey<Value = V>>>,
        location: &'static Location<'static>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            id: ReferenceId::next(),
            this: this.clone(),
            state: ReentrantMutex::new(RefCell::new(ReferenceState {
                current,
                snapshot: None,
                exhaustivity: Exhaustivity::On,
                reporter: None,
                version: 0,
            })),
            initial,
            key,
            subscription: Mutex::new(None),
            observers: Arc::new(ObserverList::default()),
            location,
        })
    }

    /// Reference identity.
    pub fn id(&self) -> ReferenceId {
        self.id
    }

    /// Number of live writes applied so far.
    pub fn version(&self) -> u64 {
        self.state.lock().borrow().version
    }

    /// Number of registered change observers.
    pub fn observer_count(&self) -> usize {
        self.observers.len()
    }

    /// Apply a value pushed by the persistence strategy.
    ///
    /// External values are ground truth: they replace the live value and any
    /// outstanding snapshot, so they never count as unasserted changes.
    fn apply_external(&self, update: SubscriberUpdate<V>) {
        let value = match update {
            SubscriberUpdate::Value(value) => value,
            SubscriberUpdate::Reset => self.initial.clone(),
        };
        let guard = self.state.lock();
        {
            let mut state = guard.borrow_mut();
            if state.current == value {
                return;
            }
            if let Some(snapshot) = state.snapshot.as_mut() {
                *snapshot = value.clone();
            }
            state.current = value;
            state.version += 1;
        }
        tracing::trace!(id = %self.id, "applied external update");
        drop(guard);
        self.observers.notify();
    }

    /// Start tracking under the active trackers of `deps`.
    fn begin_tracking(&self, deps: &Dependencies, state: &mut ReferenceState<V>) {
        state.exhaustivity = deps
            .trackers()
            .iter()
            .map(|tracker| tracker.exhaustivity())
            .max()
            .unwrap_or_default();
        state.reporter = Some(deps.reporter());
        self.register_with_trackers(deps);
    }

    fn register_with_trackers(&self, deps: &Dependencies) {
        let weak: Weak<dyn TrackedReference> = self.this.clone();
        for tracker in deps.trackers() {
            tracker.register(self.id, weak.clone());
        }
    }
}

impl<V: SharedValue> RootAccess for Reference<V> {
    fn id(&self) -> ReferenceId {
        self.id
    }

    fn location(&self) -> &'static Location<'static> {
        self.location
    }

    fn description(&self) -> String {
        match &self.key {
            Some(key) => format!("Shared<{}>({})", type_name::<V>(), key.id()),
            None => format!("Shared<{}>", type_name::<V>()),
        }
    }

    fn hold(&self) -> Box<dyn HeldLock + '_> {
        Box::new(self.state.lock())
    }

    fn observe(&self, observer: ObserverFn) -> Observation {
        self.observers.insert(observer)
    }

    fn reload(&self) {
        let Some(key) = &self.key else {
            return;
        };
        match key.load(Some(&self.initial)) {
            Some(value) => self.apply_external(SubscriberUpdate::Value(value)),
            None => self.apply_external(SubscriberUpdate::Reset),
        }
    }

    fn save(&self) -> Result<()> {
        let Some(key) = &self.key else {
            return Ok(());
        };
        let guard = self.state.lock();
        let value = guard.borrow().current.clone();
        key.save(&value, SaveContext::UserInitiated)
    }

    fn is_persisted(&self) -> bool {
        self.key.is_some()
    }
}

impl<V: SharedValue> Access<V> for Reference<V> {
    fn get(&self) -> V {
        let asserting = Dependencies::current().is_asserting();
        let guard = self.state.lock();
        let state = guard.borrow();
        match (&state.snapshot, asserting) {
            (Some(snapshot), true) => snapshot.clone(),
            _ => state.current.clone(),
        }
    }

    fn visit(&self, visit: &mut dyn FnMut(&V)) {
        let asserting = Dependencies::current().is_asserting();
        let guard = self.state.lock();
        let state = guard.borrow();
        match (&state.snapshot, asserting) {
            (Some(snapshot), true) => visit(snapshot),
            _ => visit(&state.current),
        }
    }

    fn modify(&self, modify: &mut dyn FnMut(&mut V) -> bool) -> bool {
        let deps = Dependencies::current();
        let guard = self.state.lock();
        let saved = {
            let mut state = guard.borrow_mut();
            let state = &mut *state;

            if deps.is_asserting() {
                if state.snapshot.is_none() {
                    state.snapshot = Some(state.current.clone());
                    self.begin_tracking(&deps, state);
                }
                return state.snapshot.as_mut().is_some_and(|target| modify(target));
            }

            if deps.trackers().is_empty() {
                if !modify(&mut state.current) {
                    return false;
                }
                state.snapshot = None;
            } else if state.snapshot.is_some() {
                if !modify(&mut state.current) {
                    return false;
                }
            } else {
                let before = state.current.clone();
                if !modify(&mut state.current) {
                    return false;
                }
                state.snapshot = Some(before);
                self.begin_tracking(&deps, state);
            }
            state.version += 1;
            self.key.as_ref().map(|_| state.current.clone())
        };

        if let (Some(key), Some(value)) = (&self.key, saved) {
            if let Err(error) = key.save(&value, SaveContext::DidSet) {
                tracing::warn!(id = %self.id, key = %key.id(), %error, "save after write failed");
            }
        }
        drop(guard);
        self.observers.notify();
        true
    }

    fn visit_snapshot(&self, visit: &mut dyn FnMut(&mut V, &V)) -> bool {
        let guard = self.state.lock();
        let mut state = guard.borrow_mut();
        let ReferenceState {
            current, snapshot, ..
        } = &mut *state;
        let Some(value) = snapshot.as_mut() else {
            return false;
        };
        visit(value, current);
        if value == current {
            *snapshot = None;
        }
        true
    }
}

impl<V: SharedValue> TrackedReference for Reference<V> {
    fn description(&self) -> String {
        RootAccess::description(self)
    }

    fn location(&self) -> &'static Location<'static> {
        self.location
    }

    fn has_changes(&self) -> bool {
        let guard = self.state.lock();
        let state = guard.borrow();
        state
            .snapshot
            .as_ref()
            .is_some_and(|snapshot| *snapshot != state.current)
    }

    fn take_unasserted_change(&self) -> Option<String> {
        let guard = self.state.lock();
        let mut state = guard.borrow_mut();
        let snapshot = state.snapshot.take()?;
        (snapshot != state.current)
            .then(|| describe_difference("State was changed:", &snapshot, &state.current))
    }
}

impl<V: SharedValue> Drop for Reference<V> {
    fn drop(&mut self) {
        let state = self.state.get_mut().get_mut();
        let Some(snapshot) = state.snapshot.take() else {
            return;
        };
        if snapshot == state.current {
            return;
        }
        let (current, exhaustivity) = (state.current.clone(), state.exhaustivity);
        let reporter = state.reporter.take();
        let message = format!(
            "{} was changed while tracked but never asserted\n\n{}",
            RootAccess::description(self),
            describe_difference("State was changed:", &snapshot, &current)
        );
        match (exhaustivity, reporter) {
            // The scope that tracked the change may already be gone.
            (Exhaustivity::On, Some(reporter)) => reporter.report(Issue {
                message,
                location: self.location,
            }),
            (Exhaustivity::On, None) => report_issue(message, self.location),
            (Exhaustivity::OffWithReporting, _) => tracing::warn!("{message}"),
            (Exhaustivity::Off, _) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dependencies::with_dependencies;
    use crate::issue::RecordingReporter;
    use crate::tracker::ChangeTracker;

    fn read<V: SharedValue>(reference: &Reference<V>) -> V {
        reference.get()
    }

    fn write<V: SharedValue>(reference: &Reference<V>, value: V) -> bool {
        let mut value = Some(value);
        reference.modify(&mut |slot| {
            *slot = value.take().unwrap();
            true
        })
    }

    #[test]
    fn untracked_write_replaces_value() {
        with_dependencies(
            |_| Dependencies::isolated(),
            || {
                let reference = Reference::new(1, Location::caller());
                assert!(write(&reference, 2));
                assert_eq!(read(&reference), 2);
                assert_eq!(reference.version(), 1);
                assert!(!reference.has_changes());
            },
        );
    }

    #[test]
    fn tracked_write_snapshots_once() {
        let tracker = ChangeTracker::new();
        with_dependencies(
            |_| Dependencies::isolated().with_tracker(tracker.clone()),
            || {
                let reference = Reference::new(1, Location::caller());
                write(&reference, 2);
                write(&reference, 3);
                let mut seen = None;
                reference.visit_snapshot(&mut |snapshot, current| {
                    seen = Some((*snapshot, *current));
                });
                assert_eq!(seen, Some((1, 3)));
                assert_eq!(tracker.dirty_count(), 1);
                tracker.reset_changes();
                assert!(!reference.has_changes());
            },
        );
    }

    #[test]
    fn asserting_write_touches_snapshot_only() {
        let tracker = ChangeTracker::new();
        with_dependencies(
            |_| Dependencies::isolated().with_tracker(tracker.clone()),
            || {
                let reference = Reference::new(1, Location::caller());
                write(&reference, 2);
                tracker.asserting(|| {
                    write(&reference, 2);
                    assert_eq!(read(&reference), 2);
                });
                assert_eq!(reference.version(), 1);
                assert!(!reference.has_changes());
            },
        );
    }

    #[test]
    fn external_update_rebases_snapshot() {
        let tracker = ChangeTracker::new();
        with_dependencies(
            |_| Dependencies::isolated().with_tracker(tracker.clone()),
            || {
                let reference = Reference::new(1, Location::caller());
                write(&reference, 2);
                reference.apply_external(SubscriberUpdate::Value(9));
                assert_eq!(read(&reference), 9);
                assert!(!reference.has_changes());
            },
        );
    }

    #[test]
    fn observers_fire_on_write_and_stop_on_drop() {
        with_dependencies(
            |_| Dependencies::isolated(),
            || {
                let count = Arc::new(AtomicU64::new(0));
                let reference = Reference::new(0, Location::caller());
                let counter = count.clone();
                let observation = reference.observe(Arc::new(move || {
                    counter.fetch_add(1, Ordering::SeqCst);
                }));
                write(&reference, 1);
                drop(observation);
                write(&reference, 2);
                assert_eq!(count.load(Ordering::SeqCst), 1);
                assert_eq!(reference.observer_count(), 0);
            },
        );
    }

    #[test]
    fn dropping_dirty_reference_reports() {
        let recorder = RecordingReporter::new();
        let tracker = ChangeTracker::new();
        with_dependencies(
            |_| {
                Dependencies::isolated()
                    .with_reporter(recorder.clone())
                    .with_tracker(tracker.clone())
            },
            || {
                let reference = Reference::new(String::from("a"), Location::caller());
                write(&reference, String::from("b"));
                drop(reference);
            },
        );
        let issues = recorder.take();
        assert_eq!(issues.len(), 1);
        assert!(issues[0].message.contains("never asserted"));
    }

    #[test]
    fn dirty_reference_outliving_its_scope_reports_to_that_scope() {
        let recorder = RecordingReporter::new();
        let tracker = ChangeTracker::new();
        let reference = with_dependencies(
            |_| {
                Dependencies::isolated()
                    .with_reporter(recorder.clone())
                    .with_tracker(tracker.clone())
            },
            || {
                let reference = Reference::new(1, Location::caller());
                write(&reference, 2);
                reference
            },
        );
        drop(reference);
        let issues = recorder.take();
        assert_eq!(issues.len(), 1);
        assert!(issues[0].message.contains("never asserted"));
    }

    #[test]
    fn replayed_write_without_snapshot_registers_with_tracker() {
        let recorder = RecordingReporter::new();
        let tracker = ChangeTracker::new();
        with_dependencies(
            |_| {
                Dependencies::isolated()
                    .with_reporter(recorder.clone())
                    .with_tracker(tracker.clone())
            },
            || {
                let reference = Reference::new(1, Location::caller());
                tracker.asserting(|| {
                    write(&reference, 5);
                });
                assert_eq!(tracker.dirty_count(), 1);
                assert!(tracker.has_changes());
                assert_eq!(read(&reference), 1);
                tracker.reset_changes();
                assert!(!reference.has_changes());
            },
        );
        assert!(recorder.is_empty());
    }
}
