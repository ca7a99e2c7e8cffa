//! Derivation paths from a root value down to a nested member.
//!
//! A [`Lens<R, V>`] is a pair of borrowing accessors, `&R -> Option<&V>` and
//! `&mut R -> Option<&mut V>`, composed once at construction time. Total
//! lenses (struct fields) always resolve; partial lenses (optional unwrap,
//! collection index, map entry) may not, in which case reads yield `None` and
//! writes are dropped.
//!
//! Accessors borrow rather than clone, so walking a composed path never copies
//! the root value.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::hash::Hash;
use std::sync::Arc;

type Getter<R, V> = Arc<dyn for<'a> Fn(&'a R) -> Option<&'a V> + Send + Sync>;
type GetterMut<R, V> = Arc<dyn for<'a> Fn(&'a mut R) -> Option<&'a mut V> + Send + Sync>;

fn getter<R, V, F>(f: F) -> Getter<R, V>
where
    F: for<'a> Fn(&'a R) -> Option<&'a V> + Send + Sync + 'static,
{
    Arc::new(f)
}

fn getter_mut<R, V, F>(f: F) -> GetterMut<R, V>
where
    F: for<'a> Fn(&'a mut R) -> Option<&'a mut V> + Send + Sync + 'static,
{
    Arc::new(f)
}

/// Composable accessor from a root value `R` to a member `V`.
pub struct Lens<R, V> {
    get: Getter<R, V>,
    get_mut: GetterMut<R, V>,
    partial: bool,
}

impl<R, V> Clone for Lens<R, V> {
    fn clone(&self) -> Self {
        Self {
            get: self.get.clone(),
            get_mut: self.get_mut.clone(),
            partial: self.partial,
        }
    }
}

impl<R, V> fmt::Debug for Lens<R, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Lens")
            .field("root", &std::any::type_name::<R>())
            .field("value", &std::any::type_name::<V>())
            .field("partial", &self.partial)
            .finish()
    }
}

impl<R: 'static> Lens<R, R> {
    /// The lens that focuses on the whole root.
    pub fn identity() -> Self {
        Self {
            get: getter(|root: &R| Some(root)),
            get_mut: getter_mut(|root: &mut R| Some(root)),
            partial: false,
        }
    }
}

impl<R: 'static, V: 'static> Lens<R, V> {
    /// Total lens over a struct field (or any always-present member).
    pub fn field<G, M>(get: G, get_mut: M) -> Self
    where
        G: for<'a> Fn(&'a R) -> &'a V + Send + Sync + 'static,
        M: for<'a> Fn(&'a mut R) -> &'a mut V + Send + Sync + 'static,
    {
        Self {
            get: getter(move |root: &R| Some(get(root))),
            get_mut: getter_mut(move |root: &mut R| Some(get_mut(root))),
            partial: false,
        }
    }

    /// Partial lens over a member that may be absent.
    pub fn optional<G, M>(get: G, get_mut: M) -> Self
    where
        G: for<'a> Fn(&'a R) -> Option<&'a V> + Send + Sync + 'static,
        M: for<'a> Fn(&'a mut R) -> Option<&'a mut V> + Send + Sync + 'static,
    {
        Self {
            get: getter(get),
            get_mut: getter_mut(get_mut),
            partial: true,
        }
    }

    /// Append `next` to this path.
    ///
    /// The result is partial if either side is.
    pub fn then<W: 'static>(self, next: Lens<V, W>) -> Lens<R, W> {
        let (outer, inner) = (self.get, next.get);
        let (outer_mut, inner_mut) = (self.get_mut, next.get_mut);
        Lens {
            get: getter(move |root: &R| outer(root).and_then(|value| inner(value))),
            get_mut: getter_mut(move |root: &mut R| {
                outer_mut(root).and_then(|value| inner_mut(value))
            }),
            partial: self.partial || next.partial,
        }
    }

    /// Resolve the member, if present.
    pub fn get<'a>(&self, root: &'a R) -> Option<&'a V> {
        (self.get)(root)
    }

    /// Resolve the member mutably, if present.
    pub fn get_mut<'a>(&self, root: &'a mut R) -> Option<&'a mut V> {
        (self.get_mut)(root)
    }

    /// Replace the member. Returns `false` when the path does not resolve.
    pub fn set(&self, root: &mut R, value: V) -> bool {
        match (self.get_mut)(root) {
            Some(slot) => {
                *slot = value;
                true
            }
            None => false,
        }
    }

    /// Whether the path can fail to resolve.
    pub fn is_partial(&self) -> bool {
        self.partial
    }
}

impl<V: 'static> Lens<Option<V>, V> {
    /// Unwrap an optional member.
    pub fn some() -> Self {
        Self::optional(|root: &Option<V>| root.as_ref(), |root: &mut Option<V>| root.as_mut())
    }
}

impl<V: 'static> Lens<Vec<V>, V> {
    /// Element at `index`, absent when out of bounds.
    pub fn index(index: usize) -> Self {
        Self::optional(
            move |root: &Vec<V>| root.get(index),
            move |root: &mut Vec<V>| root.get_mut(index),
        )
    }
}

impl<K, V> Lens<BTreeMap<K, V>, V>
where
    K: Ord + Clone + Send + Sync + 'static,
    V: 'static,
{
    /// Entry at `key` in an ordered map.
    pub fn key(key: K) -> Self {
        let lookup = key.clone();
        Self::optional(
            move |root: &BTreeMap<K, V>| root.get(&lookup),
            move |root: &mut BTreeMap<K, V>| root.get_mut(&key),
        )
    }
}

impl<K, V> Lens<HashMap<K, V>, V>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: 'static,
{
    /// Entry at `key` in a hash map.
    pub fn hashed_key(key: K) -> Self {
        let lookup = key.clone();
        Self::optional(
            move |root: &HashMap<K, V>| root.get(&lookup),
            move |root: &mut HashMap<K, V>| root.get_mut(&key),
        )
    }
}

/// Build a total field lens from a path expression.
///
/// ```rust
/// use tether_core::lens;
///
/// struct Theme { accent: u8 }
/// struct Settings { theme: Theme }
///
/// let accent = lens!(Settings, theme.accent);
/// let settings = Settings { theme: Theme { accent: 3 } };
/// assert_eq!(accent.get(&settings), Some(&3));
/// ```
#[macro_export]
macro_rules! lens {
    ($root:ty, $($field:tt).+) => {
        $crate::Lens::<$root, _>::field(
            |root: &$root| &root.$($field).+,
            |root: &mut $root| &mut root.$($field).+,
        )
    };
}
