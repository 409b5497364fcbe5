use super::base_cache::BaseCache;

use std::{
    hash::{BuildHasher, Hash},
    sync::Arc,
};

/// A view of a [`Cache`][cache-struct] as a concurrent map. Created by
/// [`Cache::as_map`][as-map-method].
///
/// Writes through the view are visible to the cache and vice versa. The view
/// never calls the loader; a key that is still loading reads as absent.
///
/// [cache-struct]: ./struct.Cache.html
/// [as-map-method]: ./struct.Cache.html#method.as_map
pub struct MapView<'a, K, V, S> {
    base: &'a BaseCache<K, V, S>,
}

impl<'a, K, V, S> MapView<'a, K, V, S> {
    pub(crate) fn new(base: &'a BaseCache<K, V, S>) -> Self {
        Self { base }
    }
}

impl<'a, K, V, S> MapView<'a, K, V, S>
where
    K: Hash + Eq + Send + Sync + 'static,
    V: Send + Sync + 'static,
    S: BuildHasher + Clone + Send + Sync + 'static,
{
    pub fn get(&self, key: &K) -> Option<Arc<V>> {
        self.base.get_if_present(key)
    }

    pub fn contains_key(&self, key: &K) -> bool {
        self.base.contains_key(key)
    }

    /// Inserts the value, and returns the previous one. Replacing a value is
    /// reported to the removal listener with `RemovalCause::Replaced`.
    pub fn insert(&self, key: impl Into<Arc<K>>, value: impl Into<Arc<V>>) -> Option<Arc<V>> {
        self.base.put(key.into(), value.into())
    }

    /// Inserts the value unless the key has a value already. Returns the existing
    /// value, or `None` if the value was inserted.
    pub fn put_if_absent(
        &self,
        key: impl Into<Arc<K>>,
        value: impl Into<Arc<V>>,
    ) -> Option<Arc<V>> {
        self.base.put_if_absent(key.into(), value.into())
    }

    /// Removes the key, and returns its value.
    pub fn remove(&self, key: &K) -> Option<Arc<V>> {
        self.base.invalidate(key)
    }

    /// Returns the number of entries, including the ones that have expired but
    /// not been removed yet.
    pub fn len(&self) -> usize {
        self.base.entry_count() as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns a snapshot of the keys of the live entries.
    pub fn keys(&self) -> Vec<Arc<K>> {
        self.base
            .live_entries()
            .into_iter()
            .map(|(k, _)| k)
            .collect()
    }

    /// Returns an iterator over a snapshot of the live entries. Changes made
    /// after this call are not reflected.
    pub fn iter(&self) -> impl Iterator<Item = (Arc<K>, Arc<V>)> {
        self.base.live_entries().into_iter()
    }

    pub fn clear(&self) {
        self.base.invalidate_all();
    }
}

#[cfg(test)]
mod tests {
    use crate::{
        notification::{DeliveryMode, RemovalCause},
        sync::{from_fn, Cache},
    };

    use parking_lot::Mutex;
    use std::sync::Arc;

    #[test]
    fn view_reads_and_writes_the_cache() {
        let causes = Arc::new(Mutex::new(Vec::new()));
        let cache = {
            let causes = Arc::clone(&causes);
            Cache::builder()
                .removal_listener(
                    move |n| causes.lock().push(n.cause()),
                    DeliveryMode::Immediate,
                )
                .build(from_fn(|key: &&str| Ok(key.len())))
                .expect("valid config")
        };
        let map = cache.as_map();
        assert!(map.is_empty());

        assert_eq!(map.insert("a", 1), None);
        assert_eq!(map.insert("a", 2).as_deref(), Some(&1));
        assert_eq!(cache.get_if_present(&"a").as_deref(), Some(&2));

        assert_eq!(map.put_if_absent("a", 3).as_deref(), Some(&2));
        assert_eq!(map.put_if_absent("bb", 3), None);
        assert_eq!(map.len(), 2);

        // The view never loads.
        assert_eq!(map.get(&"ccc"), None);
        assert!(!map.contains_key(&"ccc"));

        let mut keys = map.keys().into_iter().map(|k| *k).collect::<Vec<_>>();
        keys.sort_unstable();
        assert_eq!(keys, vec!["a", "bb"]);
        assert_eq!(map.iter().map(|(_, v)| *v).sum::<usize>(), 5);

        assert_eq!(map.remove(&"a").as_deref(), Some(&2));
        assert_eq!(map.remove(&"a"), None);
        map.clear();
        assert!(map.is_empty());

        assert_eq!(
            *causes.lock(),
            vec![
                RemovalCause::Replaced,
                RemovalCause::Explicit,
                RemovalCause::Explicit
            ]
        );
    }
}
