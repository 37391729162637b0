use std::borrow::Borrow;
use std::fmt;
use std::ops::RangeBounds;
use std::sync::Arc;

use im::OrdMap;

type ReleaseFn<K, V> = Box<dyn FnOnce(&K, &V) + Send + Sync>;

struct Entry<K, V> {
    key: K,
    value: V,
    release: Option<ReleaseFn<K, V>>,
}

impl<K, V> Drop for Entry<K, V> {
    fn drop(&mut self) {
        if let Some(release) = self.release.take() {
            release(&self.key, &self.value);
        }
    }
}

/// An ordered copy-on-write map.
///
/// `clone` is O(1): both maps share the underlying B-tree and diverge node by node as they are
/// mutated. An entry may carry a release callback, which runs once the entry is no longer
/// reachable from any clone (it was replaced or deleted everywhere, or every map holding it was
/// dropped).
pub struct PersistentMap<K, V> {
    root: OrdMap<K, Arc<Entry<K, V>>>,
}

impl<K: Ord + Clone, V> PersistentMap<K, V> {
    pub fn new() -> Self {
        Self {
            root: OrdMap::new(),
        }
    }

    pub fn get<Q>(&self, key: &Q) -> Option<&V>
    where
        K: Borrow<Q>,
        Q: Ord + ?Sized,
    {
        self.root.get(key).map(|entry| &entry.value)
    }

    pub fn contains_key<Q>(&self, key: &Q) -> bool
    where
        K: Borrow<Q>,
        Q: Ord + ?Sized,
    {
        self.root.contains_key(key)
    }

    pub fn set(&mut self, key: K, value: V) {
        self.insert_entry(key, value, None);
    }

    /// Inserts `value`, arranging for `release` to run when the entry is evicted from every clone.
    pub fn set_with_release(
        &mut self,
        key: K,
        value: V,
        release: impl FnOnce(&K, &V) + Send + Sync + 'static,
    ) {
        self.insert_entry(key, value, Some(Box::new(release)));
    }

    fn insert_entry(&mut self, key: K, value: V, release: Option<ReleaseFn<K, V>>) {
        let entry = Arc::new(Entry {
            key: key.clone(),
            value,
            release,
        });
        self.root.insert(key, entry);
    }

    /// Removes `key`, returning whether it was present.
    pub fn delete<Q>(&mut self, key: &Q) -> bool
    where
        K: Borrow<Q>,
        Q: Ord + ?Sized,
    {
        self.root.remove(key).is_some()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&K, &V)> + '_ {
        self.root.iter().map(|(key, entry)| (key, &entry.value))
    }

    pub fn range<R>(&self, range: R) -> impl Iterator<Item = (&K, &V)> + '_
    where
        R: RangeBounds<K>,
    {
        self.root
            .range::<R, K>(range)
            .map(|(key, entry)| (key, &entry.value))
    }

    pub fn keys(&self) -> impl Iterator<Item = &K> + '_ {
        self.root.keys()
    }

    pub fn len(&self) -> usize {
        self.root.len()
    }

    pub fn is_empty(&self) -> bool {
        self.root.is_empty()
    }

    /// Drops this map, releasing every entry not shared with another clone.
    pub fn destroy(self) {
        drop(self);
    }
}

impl<K: Ord + Clone, V> Clone for PersistentMap<K, V> {
    fn clone(&self) -> Self {
        Self {
            root: self.root.clone(),
        }
    }
}

impl<K: Ord + Clone, V> Default for PersistentMap<K, V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: Ord + Clone + fmt::Debug, V: fmt::Debug> fmt::Debug for PersistentMap<K, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map().entries(self.iter()).finish()
    }
}

impl<K: Ord + Clone, V> FromIterator<(K, V)> for PersistentMap<K, V> {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut map = Self::new();
        for (key, value) in iter {
            map.set(key, value);
        }
        map
    }
}
