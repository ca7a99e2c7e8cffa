//! Persistence strategy contract.
//!
//! A [`PersistenceKey`] describes where a shared value lives outside the
//! process: how to load it, how to save it, and how to learn about changes
//! made behind our back. Keys are values; two keys with equal
//! [`PersistenceId`]s resolve to the same backing reference.
//!
//! # Effect Classification
//!
//! - **Category**: Infrastructure Effect
//! - **Implementation**: `tether-effects` (in-memory, settings store, file)
//! - **Usage**: `Shared::persisted`, `Shared::require`

use std::fmt;
use std::sync::Arc;

use crate::bridge::UpdateStream;
use crate::errors::Result;
use crate::reference::SharedValue;

/// Identity of a persistence strategy instance.
///
/// `kind` names the strategy, `key` the location within it, and `scope`
/// distinguishes separate store instances (two settings stores, two file
/// systems) that happen to use the same key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PersistenceId {
    kind: &'static str,
    key: String,
    scope: Option<String>,
}

impl PersistenceId {
    /// Create an identity for `key` within strategy `kind`.
    pub fn new(kind: &'static str, key: impl Into<String>) -> Self {
        Self {
            kind,
            key: key.into(),
            scope: None,
        }
    }

    /// Restrict the identity to one store instance.
    pub fn scoped(mut self, scope: impl Into<String>) -> Self {
        self.scope = Some(scope.into());
        self
    }

    /// Strategy kind, e.g. `"file"`.
    pub fn kind(&self) -> &'static str {
        self.kind
    }

    /// Key within the strategy.
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Store instance, if scoped.
    pub fn scope(&self) -> Option<&str> {
        self.scope.as_deref()
    }
}

impl fmt::Display for PersistenceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.scope {
            Some(scope) => write!(f, "{}:{}@{}", self.kind, self.key, scope),
            None => write!(f, "{}:{}", self.kind, self.key),
        }
    }
}

/// Why a save is happening.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SaveContext {
    /// Implicit save after a write through a shared cell. Strategies may
    /// debounce or coalesce.
    DidSet,
    /// Explicit `Shared::save`. Strategies must write immediately.
    UserInitiated,
}

/// How long the registry keeps a reference alive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Retention {
    /// Dropped with its last shared cell.
    #[default]
    WhileReferenced,
    /// Kept for the lifetime of the owning registry.
    Process,
}

/// A value pushed from a strategy's change notification.
#[derive(Debug, Clone, PartialEq)]
pub enum SubscriberUpdate<V> {
    /// The store now holds this value.
    Value(V),
    /// The store no longer holds a value; fall back to the initial one.
    Reset,
}

/// Callback end of a strategy subscription.
pub struct SharedSubscriber<V> {
    callback: Arc<dyn Fn(SubscriberUpdate<V>) + Send + Sync>,
}

impl<V> Clone for SharedSubscriber<V> {
    fn clone(&self) -> Self {
        Self {
            callback: self.callback.clone(),
        }
    }
}

impl<V> fmt::Debug for SharedSubscriber<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SharedSubscriber").finish_non_exhaustive()
    }
}

impl<V> SharedSubscriber<V> {
    /// Wrap a callback.
    pub fn new(callback: impl Fn(SubscriberUpdate<V>) + Send + Sync + 'static) -> Self {
        Self {
            callback: Arc::new(callback),
        }
    }

    /// Push a freshly loaded value.
    pub fn yield_value(&self, value: V) {
        (self.callback)(SubscriberUpdate::Value(value));
    }

    /// Signal that the persisted value is gone.
    pub fn yield_initial(&self) {
        (self.callback)(SubscriberUpdate::Reset);
    }
}

/// Cancellation handle for a strategy subscription. Cancels on drop.
#[must_use = "dropping a subscription cancels it"]
pub struct SharedSubscription {
    cancel: Option<Box<dyn FnOnce() + Send>>,
}

impl SharedSubscription {
    /// Subscription that runs `cancel` when dropped.
    pub fn new(cancel: impl FnOnce() + Send + 'static) -> Self {
        Self {
            cancel: Some(Box::new(cancel)),
        }
    }

    /// Subscription with nothing to cancel.
    pub fn empty() -> Self {
        Self { cancel: None }
    }

    /// Cancel now instead of on drop.
    pub fn cancel(mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}

impl fmt::Debug for SharedSubscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SharedSubscription")
            .field("active", &self.cancel.is_some())
            .finish()
    }
}

impl Drop for SharedSubscription {
    fn drop(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}

/// Pluggable load/save/subscribe interface backing a shared value.
pub trait PersistenceKey: Send + Sync + 'static {
    /// The persisted value type.
    type Value: SharedValue;

    /// Identity used to deduplicate backing references.
    fn id(&self) -> PersistenceId;

    /// Load the persisted value. `None` means "use the caller's default";
    /// decode failures are reported the same way.
    fn load(&self, initial: Option<&Self::Value>) -> Option<Self::Value>;

    /// Persist `value`.
    fn save(&self, value: &Self::Value, context: SaveContext) -> Result<()>;

    /// Observe changes made outside this process' writes.
    ///
    /// The default strategy never changes behind our back.
    fn subscribe(
        &self,
        initial: Option<Self::Value>,
        subscriber: SharedSubscriber<Self::Value>,
    ) -> SharedSubscription {
        let _ = (initial, subscriber);
        SharedSubscription::empty()
    }

    /// Registry retention policy for references bound to this key.
    fn retention(&self) -> Retention {
        Retention::WhileReferenced
    }

    /// External changes as an asynchronous stream.
    fn updates(&self, initial: Option<Self::Value>) -> UpdateStream<SubscriberUpdate<Self::Value>> {
        UpdateStream::new(|sender| {
            self.subscribe(
                initial,
                SharedSubscriber::new(move |update| {
                    sender.send(update);
                }),
            )
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    #[test]
    fn identity_display_and_scope() {
        let id = PersistenceId::new("file", "/tmp/a.json");
        assert_eq!(id.to_string(), "file:/tmp/a.json");
        let scoped = id.clone().scoped("fs-1");
        assert_eq!(scoped.to_string(), "file:/tmp/a.json@fs-1");
        assert_ne!(id, scoped);
        assert_eq!(scoped.scope(), Some("fs-1"));
    }

    #[test]
    fn subscription_cancels_on_drop() {
        let cancelled = Arc::new(AtomicBool::new(false));
        let flag = cancelled.clone();
        let subscription = SharedSubscription::new(move || flag.store(true, Ordering::SeqCst));
        assert!(!cancelled.load(Ordering::SeqCst));
        drop(subscription);
        assert!(cancelled.load(Ordering::SeqCst));
    }

    #[test]
    fn subscriber_forwards_updates() {
        let seen = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let sink = seen.clone();
        let subscriber = SharedSubscriber::new(move |update| sink.lock().push(update));
        subscriber.yield_value(3);
        subscriber.yield_initial();
        assert_eq!(
            *seen.lock(),
            vec![SubscriberUpdate::Value(3), SubscriberUpdate::Reset]
        );
    }
}
