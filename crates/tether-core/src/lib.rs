//! Tether Core - Shared State Foundation
//!
//! This crate provides the runtime-agnostic half of tether: shared cells over
//! backing references, derivation paths, the persistence strategy contract,
//! and exhaustive change tracking for tests. Concrete strategies (settings
//! store, files) live in `tether-effects`; deterministic substitutes live in
//! `tether-testkit`.
//!
//! # Architecture
//!
//! ## Shared State
//! - `Shared<V>`: cheap handle = (backing reference, derivation path)
//! - `Lens<R, V>`: composable field / optional / index / key accessor
//! - `SharedReader<V>`: read-only view
//!
//! ## Persistence
//! - `PersistenceKey`: load / save / subscribe contract
//! - `ReferenceRegistry`: one backing reference per persistence identity
//! - `UpdateStream<T>`: callback registrations as `futures::Stream`
//!
//! ## Change Tracking
//! - `ChangeTracker`: snapshots pre-write state while armed
//! - `Shared::assert` / `Shared::skip_changes`: settle each change
//! - `IssueReporter`: where unsettled changes are reported
//!
//! ## Context
//! - `Dependencies`: scoped registry, trackers, reporter and overrides

#![forbid(unsafe_code)]

/// Unified error handling
pub mod errors;

/// Derivation paths
pub mod lens;

/// Exhaustiveness failure reporting
pub mod issue;

/// Persistence strategy contract
pub mod persistence;

/// Callback-to-stream bridge
pub mod bridge;

/// Scoped dependency container
pub mod dependencies;

/// Backing references
pub mod reference;

/// Identity map of persisted references
pub mod registry;

/// Shared cells and read-only views
pub mod shared;

/// Exhaustive change tracking
pub mod tracker;

pub use bridge::{UpdateSender, UpdateStream};
pub use dependencies::{with_dependencies, Dependencies, DependencyGuard};
pub use errors::{Result, TetherError};
pub use issue::{report_issue, Issue, IssueReporter, PanicReporter, RecordingReporter};
pub use lens::Lens;
pub use persistence::{
    PersistenceId, PersistenceKey, Retention, SaveContext, SharedSubscriber, SharedSubscription,
    SubscriberUpdate,
};
pub use reference::{Observation, ReferenceId, SharedValue};
pub use registry::ReferenceRegistry;
pub use shared::{Shared, SharedReader};
pub use tracker::{ChangeTracker, Exhaustivity, TrackerGuard};
