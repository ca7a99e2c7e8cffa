//! Scoped dependency container.
//!
//! Every shared cell resolves its registry, its active change trackers, and
//! its issue reporter from the innermost [`Dependencies`] scope on the current
//! thread, falling back to a process-wide default. Tests enter isolated
//! scopes so that references, trackers, and failures never leak between test
//! cases.
//!
//! Strategy handlers can stash their own overrides (a settings store, a file
//! storage) in the type-keyed extension map.

use std::any::{Any, TypeId};
use std::cell::RefCell;
use std::collections::HashMap;
use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;

use once_cell::sync::Lazy;

use crate::issue::{IssueReporter, PanicReporter};
use crate::registry::ReferenceRegistry;
use crate::tracker::ChangeTracker;

static DEFAULT: Lazy<Arc<Dependencies>> = Lazy::new(|| Arc::new(Dependencies::isolated()));

thread_local! {
    static SCOPES: RefCell<Vec<Arc<Dependencies>>> = const { RefCell::new(Vec::new()) };
}

/// Values the shared-state machinery resolves at use sites.
#[derive(Clone)]
pub struct Dependencies {
    registry: Arc<ReferenceRegistry>,
    trackers: Vec<ChangeTracker>,
    reporter: Arc<dyn IssueReporter>,
    extensions: HashMap<TypeId, Arc<dyn Any + Send + Sync>>,
}

impl fmt::Debug for Dependencies {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dependencies")
            .field("registry", &self.registry)
            .field("trackers", &self.trackers.len())
            .field("extensions", &self.extensions.len())
            .finish_non_exhaustive()
    }
}

impl Default for Dependencies {
    fn default() -> Self {
        Self::isolated()
    }
}

impl Dependencies {
    /// A fresh container: empty registry, no trackers, panicking reporter.
    pub fn isolated() -> Self {
        Self {
            registry: Arc::new(ReferenceRegistry::new()),
            trackers: Vec::new(),
            reporter: Arc::new(PanicReporter),
            extensions: HashMap::new(),
        }
    }

    /// The innermost scope on this thread, or the process default.
    ///
    /// Falls back to the default while the scope stack is being torn down.
    pub fn current() -> Arc<Dependencies> {
        SCOPES
            .try_with(|scopes| {
                scopes
                    .try_borrow()
                    .ok()
                    .and_then(|scopes| scopes.last().cloned())
            })
            .ok()
            .flatten()
            .unwrap_or_else(|| DEFAULT.clone())
    }

    /// Copy of the current scope, for building a nested one.
    pub fn inherited() -> Self {
        Self::current().as_ref().clone()
    }

    /// Replace the reference registry.
    pub fn with_registry(mut self, registry: Arc<ReferenceRegistry>) -> Self {
        self.registry = registry;
        self
    }

    /// Replace the issue reporter.
    pub fn with_reporter(mut self, reporter: impl IssueReporter + 'static) -> Self {
        self.reporter = Arc::new(reporter);
        self
    }

    /// Activate `tracker` on top of any already active ones.
    pub fn with_tracker(mut self, tracker: ChangeTracker) -> Self {
        if !self.trackers.iter().any(|active| active.ptr_eq(&tracker)) {
            self.trackers.push(tracker);
        }
        self
    }

    /// Drop all active trackers.
    pub fn without_trackers(mut self) -> Self {
        self.trackers.clear();
        self
    }

    /// Store an override keyed by its type.
    pub fn with_value<T>(mut self, value: T) -> Self
    where
        T: Clone + Send + Sync + 'static,
    {
        self.extensions.insert(TypeId::of::<T>(), Arc::new(value));
        self
    }

    /// Look up an override by type.
    pub fn value<T>(&self) -> Option<T>
    where
        T: Clone + Send + Sync + 'static,
    {
        self.extensions
            .get(&TypeId::of::<T>())
            .and_then(|value| value.downcast_ref::<T>())
            .cloned()
    }

    /// Registry that deduplicates persisted references.
    pub fn registry(&self) -> Arc<ReferenceRegistry> {
        self.registry.clone()
    }

    /// Reporter for exhaustiveness failures.
    pub fn reporter(&self) -> Arc<dyn IssueReporter> {
        self.reporter.clone()
    }

    /// Active change trackers, outermost first.
    pub fn trackers(&self) -> &[ChangeTracker] {
        &self.trackers
    }

    /// Whether any active tracker is in assertion mode.
    pub fn is_asserting(&self) -> bool {
        self.trackers.iter().any(ChangeTracker::is_asserting)
    }

    /// Push this container as the innermost scope until the guard drops.
    pub fn enter(self) -> DependencyGuard {
        let depth = SCOPES.with(|scopes| {
            let mut scopes = scopes.borrow_mut();
            scopes.push(Arc::new(self));
            scopes.len()
        });
        DependencyGuard {
            depth,
            _not_send: PhantomData,
        }
    }
}

/// Keeps a dependency scope active on the current thread.
#[must_use = "the scope ends when the guard is dropped"]
pub struct DependencyGuard {
    depth: usize,
    _not_send: PhantomData<*const ()>,
}

impl fmt::Debug for DependencyGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DependencyGuard")
            .field("depth", &self.depth)
            .finish()
    }
}

impl Drop for DependencyGuard {
    fn drop(&mut self) {
        // Guards dropped out of order still unwind every scope above them.
        // Popped scopes are released after the borrow ends: their registries
        // may drop references that report through `Dependencies::current`.
        let popped = SCOPES
            .try_with(|scopes| match scopes.try_borrow_mut() {
                Ok(mut scopes) => {
                    let keep = self.depth.saturating_sub(1).min(scopes.len());
                    scopes.split_off(keep)
                }
                Err(_) => Vec::new(),
            })
            .unwrap_or_default();
        drop(popped);
    }
}

/// Run `body` with a scope derived from the current one by `configure`.
pub fn with_dependencies<R>(
    configure: impl FnOnce(Dependencies) -> Dependencies,
    body: impl FnOnce() -> R,
) -> R {
    let _guard = configure(Dependencies::inherited()).enter();
    body()
}
