//! Tether Effects - Production Persistence Strategies
//!
//! Concrete implementations of the `tether_core::PersistenceKey` contract
//! plus the infrastructure they need.
//!
//! # Strategies
//!
//! - `InMemoryKey`: process-lifetime identity, no durability
//! - `SettingsKey`: one entry in a typed key-value `SettingsStore`
//! - `FileKey`: JSON document on a `FileStorage`, debounced and watched
//!
//! # Infrastructure
//!
//! - `Scheduler` / `WorkItem`: cancellable delayed work
//! - `Lifecycle`: host "about to suspend" signal
//! - `EffectsConfig`: debounce window and settings location
//!
//! Everything that touches the outside world is looked up through the current
//! `tether_core::Dependencies` scope first, so tests can substitute it.

#![forbid(unsafe_code)]

/// Effects configuration
pub mod config;

/// File persistence strategy
pub mod file;

/// Host lifecycle signal
pub mod lifecycle;

/// In-memory persistence strategy
pub mod memory;

/// Delayed work
pub mod scheduler;

/// Settings store and its persistence strategy
pub mod settings;

pub use config::{EffectsConfig, ENV_FILE_DEBOUNCE_MS, ENV_SETTINGS_PATH};
pub use file::{
    current_storage, FileEvent, FileKey, FileStorage, FileWatcher, LiveFileStorage,
    SharedFileStorage,
};
pub use lifecycle::{Lifecycle, SuspendObservation};
pub use memory::InMemoryKey;
pub use scheduler::{LiveScheduler, Scheduler, WorkItem};
pub use settings::{SettingsKey, SettingsObservation, SettingsRepresentable, SettingsStore, SettingsValue};
