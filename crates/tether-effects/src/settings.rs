//! Key-value settings store and its persistence strategy
//!
//! [`SettingsStore`] is a small typed key-value store (booleans, integers,
//! doubles, strings, URLs, binary blobs) with per-key change observers. It can
//! live purely in memory or mirror itself to a JSON file. A mirrored store
//! watches its file and re-reads it when another process edits it, notifying
//! observers of every key whose value changed.
//!
//! [`SettingsKey`] binds a shared value to one entry. Writes made through the
//! key are flagged on the writing thread so that the store's synchronous
//! change notification is not mistaken for an external change.
//!
//! # Effect Classification
//!
//! - **Category**: Infrastructure Effect
//! - **Implementation**: In-memory map with optional JSON file mirror
//! - **Usage**: User preferences and small scalar state

use std::cell::Cell;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use once_cell::sync::Lazy;
use parking_lot::{Mutex, RwLock};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tether_core::{
    Dependencies, PersistenceId, PersistenceKey, Result, SaveContext, SharedSubscriber,
    SharedSubscription, SharedValue, TetherError,
};
use url::Url;
use uuid::Uuid;

use crate::config::EffectsConfig;
use crate::file::{watch_path, FileEvent, FileWatcher};

thread_local! {
    static IS_SETTING: Cell<bool> = const { Cell::new(false) };
}

static STANDARD: Lazy<SettingsStore> = Lazy::new(|| {
    let config = EffectsConfig::from_env().unwrap_or_else(|error| {
        tracing::warn!(%error, "ignoring invalid environment configuration");
        EffectsConfig::default()
    });
    match config.settings_path {
        Some(path) => SettingsStore::open(&path).unwrap_or_else(|error| {
            tracing::warn!(path = ?path, %error, "falling back to in-memory settings store");
            SettingsStore::in_memory()
        }),
        None => SettingsStore::in_memory(),
    }
});

/// A value as stored in the settings store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum SettingsValue {
    /// Boolean flag
    Bool(bool),
    /// Signed integer
    Integer(i64),
    /// Floating point number
    Double(f64),
    /// UTF-8 string
    String(String),
    /// URL
    Url(Url),
    /// Opaque bytes (also used for JSON-encoded values)
    Data(Vec<u8>),
}

type SettingsObserver = Arc<dyn Fn(Option<&SettingsValue>) + Send + Sync>;

struct ObserverEntry {
    id: u64,
    key: String,
    observer: SettingsObserver,
}

struct StoreInner {
    id: Uuid,
    values: RwLock<BTreeMap<String, SettingsValue>>,
    observers: Mutex<Vec<ObserverEntry>>,
    next_observer: AtomicU64,
    path: Option<PathBuf>,
    // Serializes file mirroring and reloads. Holds the bytes last mirrored.
    write_lock: Mutex<Option<Vec<u8>>>,
    watch: Mutex<Option<SharedSubscription>>,
}

/// Typed key-value store with per-key observers.
#[derive(Clone)]
pub struct SettingsStore {
    inner: Arc<StoreInner>,
}

impl fmt::Debug for SettingsStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SettingsStore")
            .field("id", &self.inner.id)
            .field("path", &self.inner.path)
            .field("keys", &self.inner.values.read().len())
            .finish()
    }
}

impl PartialEq for SettingsStore {
    fn eq(&self, other: &Self) -> bool {
        self.inner.id == other.inner.id
    }
}

impl Eq for SettingsStore {}

impl SettingsStore {
    fn with_contents(values: BTreeMap<String, SettingsValue>, path: Option<PathBuf>) -> Self {
        Self {
            inner: Arc::new(StoreInner {
                id: Uuid::new_v4(),
                values: RwLock::new(values),
                observers: Mutex::new(Vec::new()),
                next_observer: AtomicU64::new(0),
                path,
                write_lock: Mutex::new(None),
                watch: Mutex::new(None),
            }),
        }
    }

    /// A store that lives only in memory.
    pub fn in_memory() -> Self {
        Self::with_contents(BTreeMap::new(), None)
    }

    /// A store mirrored to the JSON file at `path`, loading it if present
    /// and watching it for changes made outside the process.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let bytes = read_mirror(&path)?;
        let values = decode_mirror(&bytes)?;
        tracing::debug!(path = ?path, keys = values.len(), "opened settings store");
        let store = Self::with_contents(values, Some(path.clone()));
        *store.inner.write_lock.lock() = Some(bytes);

        if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let weak = Arc::downgrade(&store.inner);
        let watcher: FileWatcher = Arc::new(move |_: FileEvent| {
            if let Some(inner) = weak.upgrade() {
                SettingsStore { inner }.reload();
            }
        });
        match watch_path(&path, watcher) {
            Ok(watch) => *store.inner.watch.lock() = Some(watch),
            Err(error) => {
                tracing::warn!(path = ?path, %error, "cannot watch settings file, external changes are ignored");
            }
        }
        Ok(store)
    }

    /// The process-wide store, located by [`EffectsConfig::settings_path`].
    pub fn standard() -> Self {
        STANDARD.clone()
    }

    /// The store bound in the current dependency scope, or the standard one.
    pub fn current() -> Self {
        Dependencies::current()
            .value::<SettingsStore>()
            .unwrap_or_else(Self::standard)
    }

    /// Store instance identity.
    pub fn id(&self) -> Uuid {
        self.inner.id
    }

    /// Backing file, if mirrored.
    pub fn path(&self) -> Option<&Path> {
        self.inner.path.as_deref()
    }

    /// Value stored under `key`.
    pub fn get(&self, key: &str) -> Option<SettingsValue> {
        self.inner.values.read().get(key).cloned()
    }

    /// Every stored key, sorted.
    pub fn keys(&self) -> Vec<String> {
        self.inner.values.read().keys().cloned().collect()
    }

    /// Store `value` under `key` and notify its observers.
    pub fn set(&self, key: &str, value: SettingsValue) -> Result<()> {
        let changed = {
            let mut values = self.inner.values.write();
            values.insert(key.to_string(), value.clone()).as_ref() != Some(&value)
        };
        if !changed {
            return Ok(());
        }
        let persisted = self.persist();
        self.notify(key, Some(&value));
        persisted
    }

    /// Remove `key` and notify its observers.
    pub fn remove(&self, key: &str) -> Result<()> {
        let removed = self.inner.values.write().remove(key).is_some();
        if !removed {
            return Ok(());
        }
        let persisted = self.persist();
        self.notify(key, None);
        persisted
    }

    /// Call `observer` with the new value of `key` after every change.
    pub fn observe(
        &self,
        key: &str,
        observer: impl Fn(Option<&SettingsValue>) + Send + Sync + 'static,
    ) -> SettingsObservation {
        let id = self.inner.next_observer.fetch_add(1, Ordering::Relaxed);
        self.inner.observers.lock().push(ObserverEntry {
            id,
            key: key.to_string(),
            observer: Arc::new(observer),
        });
        SettingsObservation {
            store: Arc::downgrade(&self.inner),
            id,
        }
    }

    fn notify(&self, key: &str, value: Option<&SettingsValue>) {
        let observers: Vec<SettingsObserver> = self
            .inner
            .observers
            .lock()
            .iter()
            .filter(|entry| entry.key == key)
            .map(|entry| entry.observer.clone())
            .collect();
        for observer in observers {
            observer(value);
        }
    }

    fn persist(&self) -> Result<()> {
        let Some(path) = &self.inner.path else {
            return Ok(());
        };
        let mut mirrored = self.inner.write_lock.lock();
        let bytes = serde_json::to_vec_pretty(&*self.inner.values.read())
            .map_err(|error| TetherError::encoding(error.to_string()))?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let staging = path.with_extension("tmp");
        std::fs::write(&staging, &bytes)?;
        *mirrored = Some(bytes);
        std::fs::rename(&staging, path)?;
        Ok(())
    }

    /// Re-read the mirror after a file event and notify every changed key.
    fn reload(&self) {
        let Some(path) = &self.inner.path else {
            return;
        };
        let changes = {
            let mut mirrored = self.inner.write_lock.lock();
            let bytes = match read_mirror(path) {
                Ok(bytes) => bytes,
                Err(error) => {
                    tracing::warn!(path = ?path, %error, "cannot reload settings file");
                    return;
                }
            };
            if mirrored.as_deref() == Some(bytes.as_slice()) {
                return;
            }
            let reloaded = match decode_mirror(&bytes) {
                Ok(values) => values,
                Err(error) => {
                    tracing::warn!(path = ?path, %error, "ignoring undecodable settings file");
                    return;
                }
            };
            *mirrored = Some(bytes);

            let mut values = self.inner.values.write();
            let changes: Vec<(String, Option<SettingsValue>)> = values
                .keys()
                .chain(reloaded.keys())
                .collect::<BTreeSet<_>>()
                .into_iter()
                .filter(|key| values.get(*key) != reloaded.get(*key))
                .map(|key| (key.clone(), reloaded.get(key).cloned()))
                .collect();
            *values = reloaded;
            changes
        };
        if !changes.is_empty() {
            tracing::debug!(path = ?path, changed = changes.len(), "reloaded settings file");
        }
        for (key, value) in changes {
            self.notify(&key, value.as_ref());
        }
    }
}

fn read_mirror(path: &Path) -> Result<Vec<u8>> {
    match std::fs::read(path) {
        Ok(bytes) => Ok(bytes),
        Err(error) if error.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
        Err(error) => Err(error.into()),
    }
}

fn decode_mirror(bytes: &[u8]) -> Result<BTreeMap<String, SettingsValue>> {
    if bytes.is_empty() {
        return Ok(BTreeMap::new());
    }
    Ok(serde_json::from_slice(bytes)?)
}

/// Registration of a settings observer. Unregisters on drop.
#[must_use = "dropping the observation unregisters it"]
pub struct SettingsObservation {
    store: Weak<StoreInner>,
    id: u64,
}

impl fmt::Debug for SettingsObservation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SettingsObservation")
            .field("id", &self.id)
            .finish()
    }
}

impl Drop for SettingsObservation {
    fn drop(&mut self) {
        if let Some(store) = self.store.upgrade() {
            store.observers.lock().retain(|entry| entry.id != self.id);
        }
    }
}

/// Conversion between a Rust value and a stored settings value.
pub trait SettingsRepresentable: Sized {
    /// Encode for storage. `None` removes the key.
    fn to_settings(&self) -> Option<SettingsValue>;

    /// Decode a stored value, `None` if it has the wrong type.
    fn from_settings(value: &SettingsValue) -> Option<Self>;
}

impl SettingsRepresentable for bool {
    fn to_settings(&self) -> Option<SettingsValue> {
        Some(SettingsValue::Bool(*self))
    }

    fn from_settings(value: &SettingsValue) -> Option<Self> {
        match value {
            SettingsValue::Bool(flag) => Some(*flag),
            _ => None,
        }
    }
}

macro_rules! integer_representable {
    ($($ty:ty),+) => {
        $(
            impl SettingsRepresentable for $ty {
                fn to_settings(&self) -> Option<SettingsValue> {
                    i64::try_from(*self).ok().map(SettingsValue::Integer)
                }

                fn from_settings(value: &SettingsValue) -> Option<Self> {
                    match value {
                        SettingsValue::Integer(number) => <$ty>::try_from(*number).ok(),
                        _ => None,
                    }
                }
            }
        )+
    };
}

integer_representable!(i8, i16, i32, i64, u8, u16, u32, u64, usize);

impl SettingsRepresentable for f64 {
    fn to_settings(&self) -> Option<SettingsValue> {
        Some(SettingsValue::Double(*self))
    }

    fn from_settings(value: &SettingsValue) -> Option<Self> {
        match value {
            SettingsValue::Double(number) => Some(*number),
            SettingsValue::Integer(number) => Some(*number as f64),
            _ => None,
        }
    }
}

impl SettingsRepresentable for String {
    fn to_settings(&self) -> Option<SettingsValue> {
        Some(SettingsValue::String(self.clone()))
    }

    fn from_settings(value: &SettingsValue) -> Option<Self> {
        match value {
            SettingsValue::String(text) => Some(text.clone()),
            _ => None,
        }
    }
}

impl SettingsRepresentable for Url {
    fn to_settings(&self) -> Option<SettingsValue> {
        Some(SettingsValue::Url(self.clone()))
    }

    fn from_settings(value: &SettingsValue) -> Option<Self> {
        match value {
            SettingsValue::Url(url) => Some(url.clone()),
            SettingsValue::String(text) => Url::parse(text).ok(),
            _ => None,
        }
    }
}

impl SettingsRepresentable for Vec<u8> {
    fn to_settings(&self) -> Option<SettingsValue> {
        Some(SettingsValue::Data(self.clone()))
    }

    fn from_settings(value: &SettingsValue) -> Option<Self> {
        match value {
            SettingsValue::Data(bytes) => Some(bytes.clone()),
            _ => None,
        }
    }
}

impl<T: SettingsRepresentable> SettingsRepresentable for Option<T> {
    fn to_settings(&self) -> Option<SettingsValue> {
        self.as_ref().and_then(T::to_settings)
    }

    fn from_settings(value: &SettingsValue) -> Option<Self> {
        T::from_settings(value).map(Some)
    }
}

/// Implement [`SettingsRepresentable`] for a fieldless enum stored by raw
/// string or integer value.
///
/// ```rust
/// use tether_effects::raw_representable;
///
/// #[derive(Debug, Clone, Copy, PartialEq)]
/// enum Theme { Light, Dark }
///
/// raw_representable!(Theme as String {
///     Theme::Light => "light",
///     Theme::Dark => "dark",
/// });
/// ```
#[macro_export]
macro_rules! raw_representable {
    ($ty:ty as String { $($variant:path => $raw:literal),+ $(,)? }) => {
        impl $crate::settings::SettingsRepresentable for $ty {
            fn to_settings(&self) -> Option<$crate::settings::SettingsValue> {
                let raw = match self {
                    $($variant => $raw,)+
                };
                Some($crate::settings::SettingsValue::String(raw.to_string()))
            }

            fn from_settings(value: &$crate::settings::SettingsValue) -> Option<Self> {
                match value {
                    $crate::settings::SettingsValue::String(raw) => match raw.as_str() {
                        $($raw => Some($variant),)+
                        _ => None,
                    },
                    _ => None,
                }
            }
        }
    };
    ($ty:ty as i64 { $($variant:path => $raw:literal),+ $(,)? }) => {
        impl $crate::settings::SettingsRepresentable for $ty {
            fn to_settings(&self) -> Option<$crate::settings::SettingsValue> {
                let raw: i64 = match self {
                    $($variant => $raw,)+
                };
                Some($crate::settings::SettingsValue::Integer(raw))
            }

            fn from_settings(value: &$crate::settings::SettingsValue) -> Option<Self> {
                match value {
                    $crate::settings::SettingsValue::Integer(raw) => match *raw {
                        $($raw => Some($variant),)+
                        _ => None,
                    },
                    _ => None,
                }
            }
        }
    };
}

type Encode<V> = fn(&V) -> Result<Option<SettingsValue>>;
type Decode<V> = fn(&SettingsValue) -> Option<V>;

/// Persistence strategy binding a shared value to one settings entry.
pub struct SettingsKey<V> {
    key: String,
    store: SettingsStore,
    encode: Encode<V>,
    decode: Decode<V>,
}

impl<V> Clone for SettingsKey<V> {
    fn clone(&self) -> Self {
        Self {
            key: self.key.clone(),
            store: self.store.clone(),
            encode: self.encode,
            decode: self.decode,
        }
    }
}

impl<V> fmt::Debug for SettingsKey<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SettingsKey")
            .field("key", &self.key)
            .field("store", &self.store.id())
            .finish()
    }
}

impl<V> PartialEq for SettingsKey<V> {
    fn eq(&self, other: &Self) -> bool {
        self.key == other.key && self.store == other.store
    }
}

impl<V> Eq for SettingsKey<V> {}

fn encode_representable<V: SettingsRepresentable>(value: &V) -> Result<Option<SettingsValue>> {
    Ok(value.to_settings())
}

fn decode_representable<V: SettingsRepresentable>(value: &SettingsValue) -> Option<V> {
    V::from_settings(value)
}

fn encode_json<V: Serialize>(value: &V) -> Result<Option<SettingsValue>> {
    serde_json::to_vec(value)
        .map(|bytes| Some(SettingsValue::Data(bytes)))
        .map_err(|error| TetherError::encoding(error.to_string()))
}

fn decode_json<V: DeserializeOwned>(value: &SettingsValue) -> Option<V> {
    let decoded = match value {
        SettingsValue::Data(bytes) => serde_json::from_slice(bytes),
        SettingsValue::String(text) => serde_json::from_str(text),
        _ => return None,
    };
    decoded
        .map_err(|error| tracing::warn!(%error, "ignoring undecodable settings value"))
        .ok()
}

impl<V: SettingsRepresentable> SettingsKey<V> {
    /// Key `key` in the current scope's settings store.
    pub fn new(key: impl Into<String>) -> Self {
        Self::in_store(key, SettingsStore::current())
    }

    /// Key `key` in a specific store.
    pub fn in_store(key: impl Into<String>, store: SettingsStore) -> Self {
        Self {
            key: key.into(),
            store,
            encode: encode_representable::<V>,
            decode: decode_representable::<V>,
        }
    }
}

impl<V: Serialize + DeserializeOwned> SettingsKey<V> {
    /// Key `key` holding a JSON-encoded value in the current scope's store.
    pub fn json(key: impl Into<String>) -> Self {
        Self::json_in_store(key, SettingsStore::current())
    }

    /// Key `key` holding a JSON-encoded value in a specific store.
    pub fn json_in_store(key: impl Into<String>, store: SettingsStore) -> Self {
        Self {
            key: key.into(),
            store,
            encode: encode_json::<V>,
            decode: decode_json::<V>,
        }
    }
}

impl<V> SettingsKey<V> {
    /// The entry name.
    pub fn name(&self) -> &str {
        &self.key
    }

    /// The store this key lives in.
    pub fn store(&self) -> &SettingsStore {
        &self.store
    }
}

struct SettingGuard {
    previous: bool,
}

impl SettingGuard {
    fn enter() -> Self {
        Self {
            previous: IS_SETTING.with(|flag| flag.replace(true)),
        }
    }
}

impl Drop for SettingGuard {
    fn drop(&mut self) {
        IS_SETTING.with(|flag| flag.set(self.previous));
    }
}

impl<V: SharedValue> PersistenceKey for SettingsKey<V> {
    type Value = V;

    fn id(&self) -> PersistenceId {
        PersistenceId::new("settings", self.key.clone()).scoped(self.store.id().to_string())
    }

    fn load(&self, _initial: Option<&V>) -> Option<V> {
        self.store
            .get(&self.key)
            .and_then(|value| (self.decode)(&value))
    }

    fn save(&self, value: &V, _context: SaveContext) -> Result<()> {
        let encoded = (self.encode)(value)?;
        let _setting = SettingGuard::enter();
        match encoded {
            Some(encoded) => self.store.set(&self.key, encoded),
            None => self.store.remove(&self.key),
        }
    }

    fn subscribe(&self, _initial: Option<V>, subscriber: SharedSubscriber<V>) -> SharedSubscription {
        let decode = self.decode;
        let key = self.key.clone();
        let observation = self.store.observe(&self.key, move |value| {
            if IS_SETTING.with(Cell::get) {
                return;
            }
            match value.map(decode) {
                Some(Some(decoded)) => subscriber.yield_value(decoded),
                Some(None) => {
                    tracing::debug!(key = %key, "stored value has the wrong type, using initial");
                    subscriber.yield_initial();
                }
                None => subscriber.yield_initial(),
            }
        });
        SharedSubscription::new(move || drop(observation))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tether_core::{with_dependencies, Shared, SubscriberUpdate};

    #[derive(Debug, Clone, Copy, PartialEq)]
    enum Theme {
        Light,
        Dark,
    }

    crate::raw_representable!(Theme as String {
        Theme::Light => "light",
        Theme::Dark => "dark",
    });

    #[derive(Debug, Clone, Copy, PartialEq)]
    enum Level {
        Low,
        High,
    }

    crate::raw_representable!(Level as i64 {
        Level::Low => 1,
        Level::High => 2,
    });

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Window {
        width: u32,
        height: u32,
    }

    fn scoped<R>(store: &SettingsStore, body: impl FnOnce() -> R) -> R {
        with_dependencies(|_| Dependencies::isolated().with_value(store.clone()), body)
    }

    #[test]
    fn scalar_round_trip() {
        let store = SettingsStore::in_memory();
        scoped(&store, || {
            let flag = SettingsKey::<bool>::new("flag");
            flag.save(&true, SaveContext::DidSet).unwrap();
            assert_eq!(flag.load(None), Some(true));

            let url = SettingsKey::<Url>::new("home");
            let home = Url::parse("https://example.com/").unwrap();
            url.save(&home, SaveContext::DidSet).unwrap();
            assert_eq!(url.load(None), Some(home));
        });
    }

    #[test]
    fn wrong_type_loads_nothing() {
        let store = SettingsStore::in_memory();
        store.set("count", SettingsValue::String("many".into())).unwrap();
        assert_eq!(SettingsKey::<i64>::in_store("count", store).load(None), None);
    }

    #[test]
    fn optional_none_removes_key() {
        let store = SettingsStore::in_memory();
        let key = SettingsKey::<Option<String>>::in_store("name", store.clone());
        key.save(&Some("a".into()), SaveContext::DidSet).unwrap();
        assert_eq!(key.load(None), Some(Some("a".into())));
        key.save(&None, SaveContext::DidSet).unwrap();
        assert!(store.get("name").is_none());
    }

    #[test]
    fn raw_representable_enums() {
        let store = SettingsStore::in_memory();
        let theme = SettingsKey::<Theme>::in_store("theme", store.clone());
        theme.save(&Theme::Dark, SaveContext::DidSet).unwrap();
        assert_eq!(store.get("theme"), Some(SettingsValue::String("dark".into())));
        assert_eq!(theme.load(None), Some(Theme::Dark));
        assert_eq!(Theme::from_settings(&SettingsValue::String("light".into())), Some(Theme::Light));

        let level = SettingsKey::<Level>::in_store("level", store.clone());
        level.save(&Level::High, SaveContext::DidSet).unwrap();
        assert_eq!(store.get("level"), Some(SettingsValue::Integer(2)));
        assert_eq!(Level::from_settings(&SettingsValue::Integer(1)), Some(Level::Low));
        assert_eq!(Level::from_settings(&SettingsValue::Integer(3)), None);
    }

    #[test]
    fn json_values_are_stored_as_data() {
        let store = SettingsStore::in_memory();
        let key = SettingsKey::<Window>::json_in_store("window", store.clone());
        let window = Window {
            width: 800,
            height: 600,
        };
        key.save(&window, SaveContext::DidSet).unwrap();
        assert!(matches!(store.get("window"), Some(SettingsValue::Data(_))));
        assert_eq!(key.load(None), Some(window));
    }

    #[test]
    fn own_writes_are_not_echoed() {
        let store = SettingsStore::in_memory();
        let key = SettingsKey::<i64>::in_store("count", store.clone());
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let _subscription = key.subscribe(
            None,
            SharedSubscriber::new(move |update| sink.lock().push(update)),
        );

        key.save(&1, SaveContext::DidSet).unwrap();
        store.set("count", SettingsValue::Integer(2)).unwrap();
        store.remove("count").unwrap();
        assert_eq!(
            *seen.lock(),
            vec![SubscriberUpdate::Value(2), SubscriberUpdate::Reset]
        );
    }

    #[test]
    fn identity_is_per_store() {
        let first = SettingsStore::in_memory();
        let second = SettingsStore::in_memory();
        let a = SettingsKey::<bool>::in_store("flag", first.clone());
        let b = SettingsKey::<bool>::in_store("flag", first);
        let c = SettingsKey::<bool>::in_store("flag", second);
        assert_eq!(a.id(), b.id());
        assert_ne!(a.id(), c.id());
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn shared_cell_follows_external_changes() {
        let store = SettingsStore::in_memory();
        scoped(&store, || {
            let count = Shared::persisted(SettingsKey::<i64>::new("count"), 0);
            count.write(5);
            assert_eq!(store.get("count"), Some(SettingsValue::Integer(5)));

            store.set("count", SettingsValue::Integer(9)).unwrap();
            assert_eq!(count.read(), 9);

            store.remove("count").unwrap();
            assert_eq!(count.read(), 0);
        });
    }

    #[test]
    fn file_backed_store_reloads() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("settings.json");
        {
            let store = SettingsStore::open(&path).unwrap();
            store.set("greeting", SettingsValue::String("hi".into())).unwrap();
            store.set("volume", SettingsValue::Double(0.5)).unwrap();
        }
        let reopened = SettingsStore::open(&path).unwrap();
        assert_eq!(reopened.get("greeting"), Some(SettingsValue::String("hi".into())));
        assert_eq!(reopened.keys(), vec!["greeting".to_string(), "volume".to_string()]);
    }
    fn wait_for(mut condition: impl FnMut() -> bool) -> bool {
        let deadline = std::time::Instant::now() + std::time::Duration::from_secs(5);
        while std::time::Instant::now() < deadline {
            if condition() {
                return true;
            }
            std::thread::sleep(std::time::Duration::from_millis(20));
        }
        condition()
    }

    fn write_settings(path: &Path, entries: &[(&str, SettingsValue)]) {
        let values: BTreeMap<String, SettingsValue> = entries
            .iter()
            .map(|(key, value)| (key.to_string(), value.clone()))
            .collect();
        std::fs::write(path, serde_json::to_vec_pretty(&values).unwrap()).unwrap();
    }

    #[test]
    fn file_backed_store_follows_edits_from_outside() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        let store = SettingsStore::open(&path).unwrap();
        scoped(&store, || {
            let volume = Shared::persisted(SettingsKey::<i64>::new("volume"), 0);
            let theme = Shared::persisted(SettingsKey::<String>::new("theme"), "light".to_string());
            volume.write(3);

            write_settings(
                &path,
                &[
                    ("volume", SettingsValue::Integer(7)),
                    ("theme", SettingsValue::String("dark".into())),
                ],
            );
            assert!(wait_for(|| volume.read() == 7 && theme.read() == "dark"));
            assert_eq!(store.get("volume"), Some(SettingsValue::Integer(7)));

            write_settings(&path, &[("volume", SettingsValue::Integer(7))]);
            assert!(wait_for(|| theme.read() == "light" && volume.read() == 7));
            assert_eq!(store.get("theme"), None);
        });
    }

    #[test]
    fn own_mirror_writes_do_not_notify() {
        let dir = tempfile::tempdir().unwrap();
        let store = SettingsStore::open(dir.path().join("settings.json")).unwrap();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let _observation = store.observe("flag", move |value| sink.lock().push(value.cloned()));

        store.set("flag", SettingsValue::Bool(true)).unwrap();
        std::thread::sleep(std::time::Duration::from_millis(200));
        assert_eq!(*seen.lock(), vec![Some(SettingsValue::Bool(true))]);
    }
}
