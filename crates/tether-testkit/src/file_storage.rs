//! In-memory file storage.
//!
//! Same contract as the live filesystem: writes notify watchers synchronously,
//! scheduled writes wait on a [`TestScheduler`], and suspend observers hang off
//! a private [`Lifecycle`]. Nothing touches the disk.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use tether_core::{Result, SharedSubscription, TetherError};
use tether_effects::{
    FileEvent, FileStorage, FileWatcher, Lifecycle, Scheduler, SharedFileStorage,
    SuspendObservation, WorkItem,
};

use crate::scheduler::TestScheduler;

static NEXT_ID: AtomicU64 = AtomicU64::new(0);

struct WatchEntry {
    id: u64,
    path: PathBuf,
    watcher: FileWatcher,
}

#[derive(Default)]
struct Tables {
    files: HashMap<PathBuf, Vec<u8>>,
    directories: HashSet<PathBuf>,
    writes: HashMap<PathBuf, usize>,
}

struct Inner {
    id: String,
    tables: Mutex<Tables>,
    watchers: Mutex<Vec<WatchEntry>>,
    next_watch: AtomicU64,
    scheduler: TestScheduler,
    lifecycle: Lifecycle,
}

/// Deterministic file storage over a path-to-bytes table.
#[derive(Clone)]
pub struct InMemoryFileStorage {
    inner: Arc<Inner>,
}

impl fmt::Debug for InMemoryFileStorage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InMemoryFileStorage")
            .field("id", &self.inner.id)
            .field("files", &self.inner.tables.lock().files.len())
            .finish_non_exhaustive()
    }
}

impl Default for InMemoryFileStorage {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryFileStorage {
    /// Empty storage with its own clock and lifecycle.
    pub fn new() -> Self {
        Self::with_scheduler(TestScheduler::new())
    }

    /// Empty storage driven by `scheduler`.
    pub fn with_scheduler(scheduler: TestScheduler) -> Self {
        let id = NEXT_ID.fetch_add(1, Ordering::Relaxed);
        Self {
            inner: Arc::new(Inner {
                id: format!("memory-{id}"),
                tables: Mutex::new(Tables::default()),
                watchers: Mutex::new(Vec::new()),
                next_watch: AtomicU64::new(0),
                scheduler,
                lifecycle: Lifecycle::new(),
            }),
        }
    }

    /// This storage as a dependency value.
    pub fn shared(&self) -> SharedFileStorage {
        Arc::new(self.clone())
    }

    /// The clock scheduled writes wait on.
    pub fn scheduler(&self) -> &TestScheduler {
        &self.inner.scheduler
    }

    /// The lifecycle suspend observers register with.
    pub fn lifecycle(&self) -> &Lifecycle {
        &self.inner.lifecycle
    }

    /// Move the clock forward, running due writes.
    pub fn advance(&self, by: Duration) -> usize {
        self.inner.scheduler.advance(by)
    }

    /// Announce that the host is about to suspend.
    pub fn simulate_suspend(&self) {
        self.inner.lifecycle.will_suspend();
    }

    /// Current contents of `path`.
    pub fn contents(&self, path: impl AsRef<Path>) -> Option<Vec<u8>> {
        self.inner.tables.lock().files.get(path.as_ref()).cloned()
    }

    /// Contents of `path` decoded as UTF-8.
    pub fn contents_string(&self, path: impl AsRef<Path>) -> Option<String> {
        self.contents(path)
            .map(|bytes| String::from_utf8_lossy(&bytes).into_owned())
    }

    /// Number of writes made through [`FileStorage::save`] to `path`.
    pub fn write_count(&self, path: impl AsRef<Path>) -> usize {
        self.inner
            .tables
            .lock()
            .writes
            .get(path.as_ref())
            .copied()
            .unwrap_or(0)
    }

    /// Number of writes across every path.
    pub fn total_writes(&self) -> usize {
        self.inner.tables.lock().writes.values().sum()
    }

    /// Number of active watches on `path`.
    pub fn watcher_count(&self, path: impl AsRef<Path>) -> usize {
        let path = path.as_ref();
        self.inner
            .watchers
            .lock()
            .iter()
            .filter(|entry| entry.path == path)
            .count()
    }

    /// Change `path` as another process would, bypassing write counters.
    pub fn write_externally(&self, path: impl AsRef<Path>, bytes: impl Into<Vec<u8>>) {
        let path = path.as_ref();
        self.inner
            .tables
            .lock()
            .files
            .insert(path.to_path_buf(), bytes.into());
        self.notify(path, FileEvent::Changed);
    }

    /// Delete `path` as another process would.
    pub fn remove_externally(&self, path: impl AsRef<Path>) {
        let path = path.as_ref();
        let removed = self.inner.tables.lock().files.remove(path).is_some();
        if removed {
            self.notify(path, FileEvent::Removed);
        }
    }

    fn notify(&self, path: &Path, event: FileEvent) {
        let watchers: Vec<FileWatcher> = self
            .inner
            .watchers
            .lock()
            .iter()
            .filter(|entry| entry.path == path)
            .map(|entry| entry.watcher.clone())
            .collect();
        for watcher in watchers {
            watcher(event);
        }
    }
}

impl FileStorage for InMemoryFileStorage {
    fn id(&self) -> String {
        self.inner.id.clone()
    }

    fn create_directory(&self, path: &Path) -> Result<()> {
        let mut tables = self.inner.tables.lock();
        for ancestor in path.ancestors() {
            if !ancestor.as_os_str().is_empty() {
                tables.directories.insert(ancestor.to_path_buf());
            }
        }
        Ok(())
    }

    fn file_exists(&self, path: &Path) -> bool {
        self.inner.tables.lock().files.contains_key(path)
    }

    fn load(&self, path: &Path) -> Result<Vec<u8>> {
        self.contents(path)
            .ok_or_else(|| TetherError::not_found(format!("{} does not exist", path.display())))
    }

    fn save(&self, path: &Path, bytes: &[u8]) -> Result<()> {
        {
            let mut tables = self.inner.tables.lock();
            tables.files.insert(path.to_path_buf(), bytes.to_vec());
            *tables.writes.entry(path.to_path_buf()).or_insert(0) += 1;
        }
        self.notify(path, FileEvent::Changed);
        Ok(())
    }

    fn remove(&self, path: &Path) -> Result<()> {
        let removed = self.inner.tables.lock().files.remove(path).is_some();
        if !removed {
            return Err(TetherError::not_found(format!("{} does not exist", path.display())));
        }
        self.notify(path, FileEvent::Removed);
        Ok(())
    }

    fn schedule_after(&self, delay: Duration, work: WorkItem) {
        self.inner.scheduler.schedule_after(delay, work);
    }

    fn on_will_suspend(&self, observer: Arc<dyn Fn() + Send + Sync>) -> SuspendObservation {
        self.inner.lifecycle.on_will_suspend(move || observer())
    }

    fn watch(&self, path: &Path, watcher: FileWatcher) -> Result<SharedSubscription> {
        let id = self.inner.next_watch.fetch_add(1, Ordering::Relaxed);
        self.inner.watchers.lock().push(WatchEntry {
            id,
            path: path.to_path_buf(),
            watcher,
        });
        let inner: Weak<Inner> = Arc::downgrade(&self.inner);
        Ok(SharedSubscription::new(move || {
            if let Some(inner) = inner.upgrade() {
                inner.watchers.lock().retain(|entry| entry.id != id);
            }
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn save_counts_and_notifies() {
        let storage = InMemoryFileStorage::new();
        let path = Path::new("/docs/a.json");
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = events.clone();
        let watch = storage
            .watch(path, Arc::new(move |event| sink.lock().push(event)))
            .unwrap();

        storage.save(path, b"{}").unwrap();
        storage.write_externally(path, b"[]".to_vec());
        storage.remove_externally(path);
        assert_eq!(
            *events.lock(),
            vec![FileEvent::Changed, FileEvent::Changed, FileEvent::Removed]
        );
        assert_eq!(storage.write_count(path), 1);

        drop(watch);
        assert_eq!(storage.watcher_count(path), 0);
        storage.save(path, b"{}").unwrap();
        assert_eq!(events.lock().len(), 3);
    }

    #[test]
    fn missing_file_is_not_found() {
        let storage = InMemoryFileStorage::new();
        assert!(matches!(
            storage.load(Path::new("/nope")),
            Err(TetherError::NotFound { .. })
        ));
        assert!(storage.remove(Path::new("/nope")).is_err());
    }

    #[test]
    fn storages_have_distinct_identities() {
        assert_ne!(
            InMemoryFileStorage::new().id(),
            InMemoryFileStorage::new().id()
        );
    }
}
