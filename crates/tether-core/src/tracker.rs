//! Exhaustive change tracking.
//!
//! While a [`ChangeTracker`] is armed, the first write to any shared reference
//! preserves that reference's pre-write value as a snapshot and records the
//! reference as dirty. Every dirty reference must then be either asserted
//! (`Shared::assert`) or explicitly skipped (`Shared::skip_changes`) before the
//! tracker is disarmed; anything left over is reported as an issue with a diff.
//!
//! Trackers nest. Writes register with every tracker active in the current
//! [`Dependencies`] scope, and a nested tracker starts from a copy of its
//! parent's dirty set.

use std::collections::BTreeMap;
use std::fmt;
use std::panic::Location;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use crate::dependencies::{DependencyGuard, Dependencies};
use crate::issue::report_issue;
use crate::reference::ReferenceId;

/// How strictly unasserted changes are treated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub enum Exhaustivity {
    /// Unasserted changes are discarded silently.
    Off,
    /// Unasserted changes are logged but do not fail.
    OffWithReporting,
    /// Unasserted changes are reported as issues.
    #[default]
    On,
}

/// Type-erased view of a reference with a pending snapshot.
pub(crate) trait TrackedReference: Send + Sync {
    /// Human-readable identity for failure messages.
    fn description(&self) -> String;

    /// Where the reference was declared.
    fn location(&self) -> &'static Location<'static>;

    /// Whether a snapshot is outstanding and differs from the live value.
    fn has_changes(&self) -> bool;

    /// Clear the snapshot, returning a diff if it differed from the live value.
    fn take_unasserted_change(&self) -> Option<String>;
}

struct TrackerState {
    changes: Mutex<BTreeMap<ReferenceId, Weak<dyn TrackedReference>>>,
    asserting: AtomicBool,
    exhaustivity: Exhaustivity,
}

/// Cheaply clonable handle to a change-tracking session.
#[derive(Clone)]
pub struct ChangeTracker {
    state: Arc<TrackerState>,
}

impl fmt::Debug for ChangeTracker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChangeTracker")
            .field("dirty", &self.state.changes.lock().len())
            .field("asserting", &self.is_asserting())
            .field("exhaustivity", &self.state.exhaustivity)
            .finish()
    }
}

impl Default for ChangeTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl ChangeTracker {
    /// An exhaustive tracker with no recorded changes.
    pub fn new() -> Self {
        Self::with_exhaustivity(Exhaustivity::On)
    }

    /// A tracker with the given strictness.
    pub fn with_exhaustivity(exhaustivity: Exhaustivity) -> Self {
        Self::from_changes(BTreeMap::new(), exhaustivity)
    }

    fn from_changes(
        changes: BTreeMap<ReferenceId, Weak<dyn TrackedReference>>,
        exhaustivity: Exhaustivity,
    ) -> Self {
        Self {
            state: Arc::new(TrackerState {
                changes: Mutex::new(changes),
                asserting: AtomicBool::new(false),
                exhaustivity,
            }),
        }
    }

    /// A child tracker that starts with this tracker's dirty set.
    pub fn nested(&self) -> Self {
        Self::from_changes(self.state.changes.lock().clone(), self.state.exhaustivity)
    }

    /// This tracker's strictness.
    pub fn exhaustivity(&self) -> Exhaustivity {
        self.state.exhaustivity
    }

    /// Whether both handles point at the same tracking session.
    pub fn ptr_eq(&self, other: &ChangeTracker) -> bool {
        Arc::ptr_eq(&self.state, &other.state)
    }

    /// Activate the tracker on this thread until the guard drops.
    ///
    /// Dropping the guard checks that every change was asserted.
    #[track_caller]
    pub fn arm(&self) -> TrackerGuard {
        let scope = Dependencies::inherited().with_tracker(self.clone()).enter();
        tracing::debug!(dirty = self.dirty_count(), "change tracker armed");
        TrackerGuard {
            tracker: self.clone(),
            location: Location::caller(),
            _scope: scope,
        }
    }

    /// Run `body` with the tracker active, leaving changes pending.
    pub fn track<R>(&self, body: impl FnOnce() -> R) -> R {
        let _scope = Dependencies::inherited().with_tracker(self.clone()).enter();
        body()
    }

    /// Run `body` in assertion mode: writes land on snapshots and reads
    /// observe snapshots.
    pub fn asserting<R>(&self, body: impl FnOnce() -> R) -> R {
        let previous = self.state.asserting.swap(true, Ordering::SeqCst);
        let _reset = AssertingReset {
            tracker: self,
            previous,
        };
        body()
    }

    /// Whether the tracker is currently in assertion mode.
    pub fn is_asserting(&self) -> bool {
        self.state.asserting.load(Ordering::SeqCst)
    }

    /// Whether any tracked reference still differs from its snapshot.
    pub fn has_changes(&self) -> bool {
        self.live_references()
            .iter()
            .any(|reference| reference.has_changes())
    }

    /// Number of references recorded as dirty and still alive.
    pub fn dirty_count(&self) -> usize {
        self.live_references()
            .iter()
            .filter(|reference| reference.has_changes())
            .count()
    }

    /// Report every unasserted change and clear all snapshots.
    #[track_caller]
    pub fn assert_unchanged(&self) {
        self.assert_unchanged_at(Location::caller());
    }

    pub(crate) fn assert_unchanged_at(&self, location: &'static Location<'static>) {
        let references: Vec<_> = std::mem::take(&mut *self.state.changes.lock())
            .into_values()
            .filter_map(|weak| weak.upgrade())
            .collect();
        for reference in references {
            let Some(diff) = reference.take_unasserted_change() else {
                continue;
            };
            let declared = reference.location();
            let message = format!(
                "Tracked changes to {} (declared at {}:{}) were not asserted\n\n{}",
                reference.description(),
                declared.file(),
                declared.line(),
                diff
            );
            match self.state.exhaustivity {
                Exhaustivity::On => report_issue(message, location),
                Exhaustivity::OffWithReporting => {
                    tracing::warn!(
                        file = location.file(),
                        line = location.line(),
                        "{message}"
                    );
                }
                Exhaustivity::Off => {}
            }
        }
    }

    /// Discard every pending change without reporting.
    pub fn reset_changes(&self) {
        let references: Vec<_> = std::mem::take(&mut *self.state.changes.lock())
            .into_values()
            .filter_map(|weak| weak.upgrade())
            .collect();
        for reference in references {
            let _ = reference.take_unasserted_change();
        }
    }

    pub(crate) fn register(&self, id: ReferenceId, reference: Weak<dyn TrackedReference>) {
        self.state.changes.lock().entry(id).or_insert(reference);
    }

    fn live_references(&self) -> Vec<Arc<dyn TrackedReference>> {
        self.state
            .changes
            .lock()
            .values()
            .filter_map(Weak::upgrade)
            .collect()
    }
}

struct AssertingReset<'a> {
    tracker: &'a ChangeTracker,
    previous: bool,
}

impl Drop for AssertingReset<'_> {
    fn drop(&mut self) {
        self.tracker
            .state
            .asserting
            .store(self.previous, Ordering::SeqCst);
    }
}

/// Run `body` with every tracker active on this thread in assertion mode.
pub(crate) fn asserting_all<R>(body: impl FnOnce() -> R) -> R {
    let deps = Dependencies::current();
    let resets: Vec<_> = deps
        .trackers()
        .iter()
        .map(|tracker| AssertingReset {
            tracker,
            previous: tracker.state.asserting.swap(true, Ordering::SeqCst),
        })
        .collect();
    let result = body();
    drop(resets);
    result
}

/// Armed tracker. Asserts that nothing is left unasserted when dropped.
#[must_use = "the tracker is disarmed when the guard is dropped"]
pub struct TrackerGuard {
    tracker: ChangeTracker,
    location: &'static Location<'static>,
    _scope: DependencyGuard,
}

impl TrackerGuard {
    /// The armed tracker.
    pub fn tracker(&self) -> &ChangeTracker {
        &self.tracker
    }

    /// Disarm now. Equivalent to dropping the guard.
    pub fn disarm(self) {}
}

impl fmt::Debug for TrackerGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TrackerGuard")
            .field("tracker", &self.tracker)
            .finish_non_exhaustive()
    }
}

impl Drop for TrackerGuard {
    fn drop(&mut self) {
        // Runs while the scope (and its reporter) is still active.
        self.tracker.assert_unchanged_at(self.location);
        tracing::debug!("change tracker disarmed");
    }
}
