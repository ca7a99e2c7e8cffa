//! Host lifecycle signal.
//!
//! The host announces that the process is about to be suspended (sent to the
//! background, put to sleep) by calling [`Lifecycle::will_suspend`]. File
//! strategies flush pending debounced writes when they hear it.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use once_cell::sync::Lazy;
use parking_lot::Mutex;
use tether_core::Dependencies;

type SuspendObserver = Arc<dyn Fn() + Send + Sync>;

static PROCESS: Lazy<Lifecycle> = Lazy::new(Lifecycle::new);

#[derive(Default)]
struct Observers {
    next: AtomicU64,
    entries: Mutex<Vec<(u64, SuspendObserver)>>,
}

/// Broadcasts the "about to suspend" signal.
#[derive(Clone, Default)]
pub struct Lifecycle {
    observers: Arc<Observers>,
}

impl fmt::Debug for Lifecycle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Lifecycle")
            .field("observers", &self.observer_count())
            .finish()
    }
}

impl Lifecycle {
    /// A lifecycle with no observers.
    pub fn new() -> Self {
        Self::default()
    }

    /// The process-wide lifecycle the host signals by default.
    pub fn process() -> Self {
        PROCESS.clone()
    }

    /// The lifecycle bound in the current dependency scope, or the process
    /// lifecycle.
    pub fn current() -> Self {
        Dependencies::current()
            .value::<Lifecycle>()
            .unwrap_or_else(Self::process)
    }

    /// Run `observer` whenever the host is about to suspend.
    pub fn on_will_suspend(&self, observer: impl Fn() + Send + Sync + 'static) -> SuspendObservation {
        let id = self.observers.next.fetch_add(1, Ordering::Relaxed);
        self.observers
            .entries
            .lock()
            .push((id, Arc::new(observer)));
        SuspendObservation {
            observers: Arc::downgrade(&self.observers),
            id,
        }
    }

    /// Announce that the host is about to suspend.
    pub fn will_suspend(&self) {
        let observers: Vec<SuspendObserver> = self
            .observers
            .entries
            .lock()
            .iter()
            .map(|(_, observer)| observer.clone())
            .collect();
        tracing::debug!(observers = observers.len(), "host will suspend");
        for observer in observers {
            observer();
        }
    }

    /// Number of registered observers.
    pub fn observer_count(&self) -> usize {
        self.observers.entries.lock().len()
    }
}

/// Registration of a suspend observer. Unregisters on drop.
#[must_use = "dropping the observation unregisters it"]
pub struct SuspendObservation {
    observers: Weak<Observers>,
    id: u64,
}

impl fmt::Debug for SuspendObservation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SuspendObservation")
            .field("id", &self.id)
            .finish()
    }
}

impl Drop for SuspendObservation {
    fn drop(&mut self) {
        if let Some(observers) = self.observers.upgrade() {
            observers.entries.lock().retain(|(id, _)| *id != self.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn observers_hear_suspend_until_dropped() {
        let lifecycle = Lifecycle::new();
        let heard = Arc::new(AtomicUsize::new(0));
        let counter = heard.clone();
        let observation = lifecycle.on_will_suspend(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        lifecycle.will_suspend();
        drop(observation);
        lifecycle.will_suspend();
        assert_eq!(heard.load(Ordering::SeqCst), 1);
        assert_eq!(lifecycle.observer_count(), 0);
    }

    #[test]
    fn current_prefers_scoped_lifecycle() {
        let scoped = Lifecycle::new();
        tether_core::with_dependencies(
            |deps| deps.with_value(scoped.clone()),
            || {
                let _observation = Lifecycle::current().on_will_suspend(|| {});
                assert_eq!(scoped.observer_count(), 1);
            },
        );
    }
}
