//! One-stop isolated environment for shared-state tests.
//!
//! [`TestDependencies`] bundles a fresh reference registry, an in-memory
//! settings store, an in-memory file storage on a virtual clock, effects
//! configuration and a change tracker. [`TestDependencies::run`] enters all of
//! it, arms the tracker, and checks exhaustiveness when the body returns.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tether_core::{ChangeTracker, Dependencies, DependencyGuard, Exhaustivity, ReferenceRegistry};
use tether_effects::{EffectsConfig, Lifecycle, SettingsStore, SharedFileStorage};

use crate::file_storage::InMemoryFileStorage;
use crate::scheduler::TestScheduler;

/// Isolated registry, stores, clock and tracker for one test.
#[derive(Clone)]
pub struct TestDependencies {
    /// Registry every shared value in the test resolves through
    pub registry: Arc<ReferenceRegistry>,
    /// Tracker armed by [`TestDependencies::run`]
    pub tracker: ChangeTracker,
    /// Settings store bound as the current store
    pub settings: SettingsStore,
    /// File storage bound as the current storage
    pub files: InMemoryFileStorage,
    /// Configuration bound as the current configuration
    pub config: EffectsConfig,
}

impl fmt::Debug for TestDependencies {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TestDependencies")
            .field("tracker", &self.tracker)
            .field("files", &self.files)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl Default for TestDependencies {
    fn default() -> Self {
        Self::new()
    }
}

impl TestDependencies {
    /// Fully exhaustive environment with a one second file debounce.
    pub fn new() -> Self {
        Self::with_exhaustivity(Exhaustivity::On)
    }

    /// Environment whose tracker uses `exhaustivity`.
    pub fn with_exhaustivity(exhaustivity: Exhaustivity) -> Self {
        Self {
            registry: Arc::new(ReferenceRegistry::new()),
            tracker: ChangeTracker::with_exhaustivity(exhaustivity),
            settings: SettingsStore::in_memory(),
            files: InMemoryFileStorage::new(),
            config: EffectsConfig {
                file_debounce_ms: 1_000,
                settings_path: None,
            },
        }
    }

    /// Replace the file debounce window.
    pub fn with_file_debounce(mut self, debounce: Duration) -> Self {
        self.config.file_debounce_ms = u64::try_from(debounce.as_millis()).unwrap_or(u64::MAX);
        self
    }

    /// The container without the tracker, inheriting the current reporter.
    pub fn dependencies(&self) -> Dependencies {
        let files: SharedFileStorage = self.files.shared();
        Dependencies::inherited()
            .without_trackers()
            .with_registry(self.registry.clone())
            .with_value(self.settings.clone())
            .with_value(files)
            .with_value(self.config.clone())
            .with_value(self.files.lifecycle().clone())
    }

    /// Enter the environment without arming the tracker.
    pub fn enter(&self) -> DependencyGuard {
        self.dependencies().enter()
    }

    /// Run `body` in the environment with the tracker armed. Changes left
    /// unasserted when `body` returns are reported as issues.
    #[track_caller]
    pub fn run<R>(&self, body: impl FnOnce() -> R) -> R {
        let _scope = self.enter();
        let armed = self.tracker.arm();
        let result = body();
        drop(armed);
        result
    }

    /// The virtual clock file writes wait on.
    pub fn scheduler(&self) -> &TestScheduler {
        self.files.scheduler()
    }

    /// The lifecycle bound in the environment.
    pub fn lifecycle(&self) -> &Lifecycle {
        self.files.lifecycle()
    }

    /// Move the virtual clock forward.
    pub fn advance(&self, by: Duration) -> usize {
        self.files.advance(by)
    }
}
