//! File persistence strategy
//!
//! [`FileKey`] persists a serde value as one JSON document at a path. Writes
//! made through the key are debounced: each save cancels the pending write
//! and schedules a new one, so a burst of saves costs a single write of the
//! last value. Pending writes are flushed early when the host announces it is
//! about to suspend, on explicit saves, and when the key goes away.
//!
//! The filesystem itself sits behind [`FileStorage`] so tests can swap in a
//! deterministic in-memory table with a virtual clock.
//!
//! # Effect Classification
//!
//! - **Category**: Infrastructure Effect
//! - **Implementation**: `std::fs` with atomic rename, `notify` watcher, tokio timer thread
//! - **Usage**: Documents and larger structured state

use std::fmt;
use std::marker::PhantomData;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use notify::event::{AccessKind, AccessMode, Event, EventKind};
use notify::{RecursiveMode, Watcher};
use once_cell::sync::{Lazy, OnceCell};
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tether_core::{
    Dependencies, PersistenceId, PersistenceKey, Result, SaveContext, SharedSubscriber,
    SharedSubscription, SharedValue, TetherError,
};

use crate::config::EffectsConfig;
use crate::lifecycle::{Lifecycle, SuspendObservation};
use crate::scheduler::{LiveScheduler, Scheduler, WorkItem};

/// What happened to a watched file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileEvent {
    /// Contents were written, or the file was created or renamed into place
    Changed,
    /// The file no longer exists
    Removed,
}

/// Callback invoked for each event on a watched file.
pub type FileWatcher = Arc<dyn Fn(FileEvent) + Send + Sync>;

/// Shared handle to a file storage, as bound in a dependency scope.
pub type SharedFileStorage = Arc<dyn FileStorage>;

/// Filesystem, timer and lifecycle access used by [`FileKey`].
pub trait FileStorage: Send + Sync {
    /// Identity of the underlying filesystem. Keys on storages with the same
    /// identity and path share one backing reference.
    fn id(&self) -> String;

    /// Create `path` and any missing parents.
    fn create_directory(&self, path: &Path) -> Result<()>;

    /// Whether a file exists at `path`.
    fn file_exists(&self, path: &Path) -> bool;

    /// Read the whole file.
    fn load(&self, path: &Path) -> Result<Vec<u8>>;

    /// Replace the file's contents.
    fn save(&self, path: &Path, bytes: &[u8]) -> Result<()>;

    /// Delete the file.
    fn remove(&self, path: &Path) -> Result<()>;

    /// Run `work` after `delay` unless it is cancelled or flushed first.
    fn schedule_after(&self, delay: Duration, work: WorkItem);

    /// Run `observer` when the host is about to suspend.
    fn on_will_suspend(&self, observer: Arc<dyn Fn() + Send + Sync>) -> SuspendObservation;

    /// Report changes to the file at `path` until the subscription drops.
    fn watch(&self, path: &Path, watcher: FileWatcher) -> Result<SharedSubscription>;
}

static STANDARD: Lazy<LiveFileStorage> = Lazy::new(|| LiveFileStorage::new(Lifecycle::process()));

/// The storage bound in the current dependency scope, or the process-wide
/// live filesystem.
pub fn current_storage() -> SharedFileStorage {
    Dependencies::current()
        .value::<SharedFileStorage>()
        .unwrap_or_else(|| Arc::new(STANDARD.clone()))
}

struct LiveInner {
    scheduler: OnceCell<Option<LiveScheduler>>,
    lifecycle: Lifecycle,
    scheduled: Mutex<Vec<WorkItem>>,
}

impl LiveInner {
    fn scheduler(&self) -> Option<&LiveScheduler> {
        self.scheduler
            .get_or_init(|| match LiveScheduler::new() {
                Ok(scheduler) => Some(scheduler),
                Err(error) => {
                    tracing::warn!(%error, "timer thread unavailable, file writes run immediately");
                    None
                }
            })
            .as_ref()
    }

    fn flush(&self) -> usize {
        let pending = std::mem::take(&mut *self.scheduled.lock());
        pending.iter().filter(|work| work.run()).count()
    }
}

impl Drop for LiveInner {
    fn drop(&mut self) {
        let flushed = self.flush();
        if flushed > 0 {
            tracing::debug!(flushed, "flushed pending file writes on drop");
        }
    }
}

/// The real filesystem.
///
/// Writes go to a sibling temporary file that is renamed over the target, so
/// readers and watchers never observe a half-written document.
#[derive(Clone)]
pub struct LiveFileStorage {
    inner: Arc<LiveInner>,
}

impl fmt::Debug for LiveFileStorage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LiveFileStorage")
            .field("pending", &self.pending_count())
            .finish()
    }
}

impl LiveFileStorage {
    /// Live storage listening to `lifecycle` for suspend signals.
    pub fn new(lifecycle: Lifecycle) -> Self {
        Self {
            inner: Arc::new(LiveInner {
                scheduler: OnceCell::new(),
                lifecycle,
                scheduled: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Run every pending scheduled write now.
    pub fn flush(&self) -> usize {
        self.inner.flush()
    }

    /// Number of scheduled writes that have not run yet.
    pub fn pending_count(&self) -> usize {
        self.inner
            .scheduled
            .lock()
            .iter()
            .filter(|work| work.is_pending())
            .count()
    }
}

fn temporary_path(path: &Path) -> PathBuf {
    let name = path
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default();
    path.with_file_name(format!(".{name}.tether-tmp"))
}

impl FileStorage for LiveFileStorage {
    fn id(&self) -> String {
        "fs".to_string()
    }

    fn create_directory(&self, path: &Path) -> Result<()> {
        std::fs::create_dir_all(path)?;
        Ok(())
    }

    fn file_exists(&self, path: &Path) -> bool {
        path.is_file()
    }

    fn load(&self, path: &Path) -> Result<Vec<u8>> {
        Ok(std::fs::read(path)?)
    }

    fn save(&self, path: &Path, bytes: &[u8]) -> Result<()> {
        if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let temporary = temporary_path(path);
        std::fs::write(&temporary, bytes)?;
        std::fs::rename(&temporary, path)?;
        Ok(())
    }

    fn remove(&self, path: &Path) -> Result<()> {
        std::fs::remove_file(path)?;
        Ok(())
    }

    fn schedule_after(&self, delay: Duration, work: WorkItem) {
        {
            let mut scheduled = self.inner.scheduled.lock();
            scheduled.retain(WorkItem::is_pending);
            scheduled.push(work.clone());
        }
        match self.inner.scheduler() {
            Some(scheduler) => scheduler.schedule_after(delay, work),
            None => {
                work.run();
            }
        }
    }

    fn on_will_suspend(&self, observer: Arc<dyn Fn() + Send + Sync>) -> SuspendObservation {
        self.inner.lifecycle.on_will_suspend(move || observer())
    }

    fn watch(&self, path: &Path, watcher: FileWatcher) -> Result<SharedSubscription> {
        watch_path(path, watcher)
    }
}

/// Watch the parent directory of `path` and report events for `path` only.
///
/// The parent directory must exist; the file itself need not.
pub(crate) fn watch_path(path: &Path, watcher: FileWatcher) -> Result<SharedSubscription> {
    let file_name = path
        .file_name()
        .ok_or_else(|| TetherError::storage(format!("{} has no file name", path.display())))?
        .to_owned();
    let parent = match path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
        Some(parent) => parent.canonicalize()?,
        None => std::env::current_dir()?,
    };
    let target = parent.join(file_name);

    let watched = target.clone();
    let mut notifier = notify::recommended_watcher(move |event: notify::Result<Event>| {
        let event = match event {
            Ok(event) => event,
            Err(error) => {
                tracing::warn!(path = ?watched, %error, "file watch error");
                return;
            }
        };
        let relevant = match event.kind {
            EventKind::Access(AccessKind::Close(AccessMode::Write)) => true,
            EventKind::Access(_) => false,
            _ => true,
        };
        if !relevant || !event.paths.contains(&watched) {
            return;
        }
        if watched.is_file() {
            watcher(FileEvent::Changed);
        } else {
            watcher(FileEvent::Removed);
        }
    })
    .map_err(|error| TetherError::storage(format!("cannot create file watcher: {error}")))?;
    notifier
        .watch(&parent, RecursiveMode::NonRecursive)
        .map_err(|error| {
            TetherError::storage(format!("cannot watch {}: {error}", parent.display()))
        })?;
    tracing::debug!(path = ?target, "watching file");

    Ok(SharedSubscription::new(move || drop(notifier)))
}

/// Bookkeeping shared between a key and the writes it has scheduled.
#[derive(Default)]
struct WriteState {
    watching: AtomicBool,
    is_setting: AtomicBool,
    last_written: Mutex<Option<Vec<u8>>>,
}

impl WriteState {
    fn write(&self, storage: &dyn FileStorage, path: &Path, bytes: Vec<u8>) -> Result<()> {
        if self.watching.load(Ordering::SeqCst) {
            self.is_setting.store(true, Ordering::SeqCst);
        }
        *self.last_written.lock() = Some(bytes.clone());
        let result = storage.save(path, &bytes);
        if result.is_err() {
            self.is_setting.store(false, Ordering::SeqCst);
        }
        result
    }

    /// Whether `bytes` echo the last write made through this key. Anything
    /// else is an external change and ends the echo window.
    fn is_own_write(&self, bytes: &[u8]) -> bool {
        let mut last_written = self.last_written.lock();
        if last_written.as_deref() == Some(bytes) {
            return true;
        }
        *last_written = None;
        false
    }

    fn forget_own_write(&self) {
        *self.last_written.lock() = None;
    }
}

struct FileKeyState {
    path: PathBuf,
    storage: SharedFileStorage,
    debounce: Duration,
    pending: Mutex<Option<WorkItem>>,
    queued: Arc<Mutex<Option<Vec<u8>>>>,
    writes: Arc<WriteState>,
    _suspend: Mutex<Option<SuspendObservation>>,
}

impl FileKeyState {
    fn flush(&self) -> bool {
        let pending = self.pending.lock().take();
        pending.is_some_and(|work| work.run())
    }

    fn cancel_pending(&self) {
        if let Some(work) = self.pending.lock().take() {
            work.cancel();
        }
        self.queued.lock().take();
    }
}

impl Drop for FileKeyState {
    fn drop(&mut self) {
        if self.flush() {
            tracing::debug!(path = ?self.path, "flushed pending write on drop");
        }
    }
}

/// Persists a shared value as a JSON file.
pub struct FileKey<V> {
    state: Arc<FileKeyState>,
    _value: PhantomData<fn() -> V>,
}

impl<V> Clone for FileKey<V> {
    fn clone(&self) -> Self {
        Self {
            state: self.state.clone(),
            _value: PhantomData,
        }
    }
}

impl<V> fmt::Debug for FileKey<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FileKey")
            .field("path", &self.state.path)
            .field("debounce", &self.state.debounce)
            .finish()
    }
}

impl<V> FileKey<V> {
    /// Key for `path` on the current storage with the configured debounce.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self::with_storage(path, current_storage())
    }

    /// Key for `path` on an explicit storage with the configured debounce.
    pub fn with_storage(path: impl Into<PathBuf>, storage: SharedFileStorage) -> Self {
        Self::build(path.into(), storage, EffectsConfig::current().file_debounce())
    }

    /// Replace the debounce window.
    ///
    /// Only meaningful before the key is used; a key that already has a
    /// pending write keeps its schedule.
    pub fn with_debounce(self, debounce: Duration) -> Self {
        Self::build(self.state.path.clone(), self.state.storage.clone(), debounce)
    }

    fn build(path: PathBuf, storage: SharedFileStorage, debounce: Duration) -> Self {
        let state = Arc::new(FileKeyState {
            path,
            storage,
            debounce,
            pending: Mutex::new(None),
            queued: Arc::new(Mutex::new(None)),
            writes: Arc::new(WriteState::default()),
            _suspend: Mutex::new(None),
        });
        let weak: Weak<FileKeyState> = Arc::downgrade(&state);
        let observation = state.storage.on_will_suspend(Arc::new(move || {
            if let Some(state) = weak.upgrade() {
                if state.flush() {
                    tracing::debug!(path = ?state.path, "flushed pending write on suspend");
                }
            }
        }));
        *state._suspend.lock() = Some(observation);
        Self {
            state,
            _value: PhantomData,
        }
    }

    /// The persisted file.
    pub fn path(&self) -> &Path {
        &self.state.path
    }

    /// Debounce window for implicit saves.
    pub fn debounce(&self) -> Duration {
        self.state.debounce
    }

    /// Whether a debounced write is waiting to run.
    pub fn has_pending_write(&self) -> bool {
        self.state
            .pending
            .lock()
            .as_ref()
            .is_some_and(WorkItem::is_pending)
    }

    /// Run the pending write, if any, now.
    pub fn flush(&self) -> bool {
        self.state.flush()
    }
}

fn decode<V: DeserializeOwned>(path: &Path, bytes: &[u8]) -> Option<V> {
    if bytes.is_empty() {
        return None;
    }
    match serde_json::from_slice(bytes) {
        Ok(value) => Some(value),
        Err(error) => {
            tracing::warn!(path = ?path, %error, "ignoring undecodable file contents");
            None
        }
    }
}

impl<V> PersistenceKey for FileKey<V>
where
    V: SharedValue + Serialize + DeserializeOwned,
{
    type Value = V;

    fn id(&self) -> PersistenceId {
        PersistenceId::new("file", self.state.path.display().to_string())
            .scoped(self.state.storage.id())
    }

    fn load(&self, _initial: Option<&V>) -> Option<V> {
        let state = &self.state;
        if !state.storage.file_exists(&state.path) {
            return None;
        }
        match state.storage.load(&state.path) {
            Ok(bytes) => decode(&state.path, &bytes),
            Err(error) => {
                tracing::warn!(path = ?state.path, %error, "failed to read persisted file");
                None
            }
        }
    }

    fn save(&self, value: &V, context: SaveContext) -> Result<()> {
        let bytes = serde_json::to_vec_pretty(value)
            .map_err(|error| TetherError::encoding(error.to_string()))?;
        let state = &self.state;

        match context {
            SaveContext::UserInitiated => {
                state.cancel_pending();
                state.writes.write(state.storage.as_ref(), &state.path, bytes)
            }
            SaveContext::DidSet => {
                // A write already waiting picks up the newest bytes.
                *state.queued.lock() = Some(bytes);
                let mut pending = state.pending.lock();
                if pending.as_ref().is_some_and(WorkItem::is_pending) {
                    return Ok(());
                }
                let storage = state.storage.clone();
                let path = state.path.clone();
                let writes = state.writes.clone();
                let queued = state.queued.clone();
                let work = WorkItem::new(move || {
                    let Some(bytes) = queued.lock().take() else {
                        return;
                    };
                    if let Err(error) = writes.write(storage.as_ref(), &path, bytes) {
                        tracing::warn!(path = ?path, %error, "debounced file write failed");
                    }
                });
                *pending = Some(work.clone());
                drop(pending);
                tracing::debug!(path = ?state.path, debounce = ?state.debounce, "scheduled file write");
                state.storage.schedule_after(state.debounce, work);
                Ok(())
            }
        }
    }

    fn subscribe(&self, _initial: Option<V>, subscriber: SharedSubscriber<V>) -> SharedSubscription {
        let state = &self.state;
        let storage = state.storage.clone();
        let path = state.path.clone();

        if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
            if let Err(error) = storage.create_directory(parent) {
                tracing::warn!(path = ?parent, %error, "cannot create directory for watched file");
                return SharedSubscription::empty();
            }
        }
        if !storage.file_exists(&path) {
            if let Err(error) = storage.save(&path, &[]) {
                tracing::warn!(path = ?path, %error, "cannot create watched file");
                return SharedSubscription::empty();
            }
        }

        let writes = state.writes.clone();
        let watched_storage = Arc::downgrade(&storage);
        let watched_path = path.clone();
        let watcher: FileWatcher = Arc::new(move |event| match event {
            FileEvent::Removed => {
                writes.forget_own_write();
                subscriber.yield_initial();
            }
            FileEvent::Changed => {
                if writes.is_setting.swap(false, Ordering::SeqCst) {
                    return;
                }
                let Some(storage) = watched_storage.upgrade() else {
                    return;
                };
                let bytes = match storage.load(&watched_path) {
                    Ok(bytes) => bytes,
                    Err(error) => {
                        tracing::warn!(path = ?watched_path, %error, "cannot reload changed file");
                        return;
                    }
                };
                if writes.is_own_write(&bytes) {
                    return;
                }
                if bytes.is_empty() {
                    subscriber.yield_initial();
                } else if let Some(value) = decode(&watched_path, &bytes) {
                    subscriber.yield_value(value);
                }
            }
        });

        match storage.watch(&path, watcher) {
            Ok(watch) => {
                state.writes.watching.store(true, Ordering::SeqCst);
                let writes = state.writes.clone();
                SharedSubscription::new(move || {
                    writes.watching.store(false, Ordering::SeqCst);
                    writes.is_setting.store(false, Ordering::SeqCst);
                    drop(watch);
                })
            }
            Err(error) => {
                tracing::warn!(path = ?path, %error, "cannot watch file, external changes are ignored");
                SharedSubscription::empty()
            }
        }
    }
}
