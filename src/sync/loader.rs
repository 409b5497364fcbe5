use std::{collections::HashMap, fmt, sync::Arc};

use crate::common::error::BoxError;

/// Computes the values of a loading [`Cache`][cache].
///
/// Only `load` is required. A loader that can fetch many keys at once more
/// cheaply than one by one should also implement `load_all`; a loader that can
/// compute a new value from the old one should implement `reload`.
///
/// The loader is called without holding any lock of the cache, so it may call
/// back into the cache for _other_ keys. Requesting the key it is computing
/// fails with [`LoadError::RecursiveLoad`][recursive].
///
/// [cache]: ./struct.Cache.html
/// [recursive]: ../enum.LoadError.html#variant.RecursiveLoad
pub trait CacheLoader<K, V>: Send + Sync + 'static {
    /// Computes the value for `key`.
    fn load(&self, key: &K) -> Result<V, BoxError>;

    /// Computes the values for `keys` with a single call.
    ///
    /// Returns `None` if bulk loading is not supported (the default), in which
    /// case the cache calls `load` for each key. The returned map must contain
    /// every requested key; it may contain additional keys, which will be cached
    /// if they are not present yet.
    fn load_all(&self, keys: &[Arc<K>]) -> Option<Result<HashMap<K, V>, BoxError>> {
        let _ = keys;
        None
    }

    /// Computes a new value for an entry that is being refreshed. The old value
    /// stays in the cache until this returns. Defaults to `load`.
    fn reload(&self, key: &K, old_value: &Arc<V>) -> Result<V, BoxError> {
        let _ = old_value;
        self.load(key)
    }
}

/// Creates a [`CacheLoader`](./trait.CacheLoader.html) from a closure.
///
/// # Example
///
/// ```rust
/// use loadcache::sync::{from_fn, Cache};
///
/// let cache = Cache::builder()
///     .max_capacity(100)
///     .build(from_fn(|key: &String| Ok(key.len())))
///     .unwrap();
///
/// assert_eq!(*cache.get("four".to_string()).unwrap(), 4);
/// ```
pub fn from_fn<K, V, F>(f: F) -> FnLoader<F>
where
    F: Fn(&K) -> Result<V, BoxError> + Send + Sync + 'static,
{
    FnLoader { f }
}

/// A [`CacheLoader`](./trait.CacheLoader.html) that calls a closure. Created by
/// [`from_fn`](./fn.from_fn.html).
#[derive(Clone)]
pub struct FnLoader<F> {
    f: F,
}

impl<F> fmt::Debug for FnLoader<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FnLoader").finish_non_exhaustive()
    }
}

impl<K, V, F> CacheLoader<K, V> for FnLoader<F>
where
    F: Fn(&K) -> Result<V, BoxError> + Send + Sync + 'static,
{
    fn load(&self, key: &K) -> Result<V, BoxError> {
        (self.f)(key)
    }
}

#[cfg(test)]
mod tests {
    use super::{from_fn, CacheLoader};
    use std::sync::Arc;

    #[test]
    fn closure_loader_uses_defaults() {
        let loader = from_fn(|key: &u32| Ok(key * 2));
        assert_eq!(loader.load(&2).ok(), Some(4));
        assert!(loader.load_all(&[Arc::new(1)]).is_none());
        assert_eq!(loader.reload(&3, &Arc::new(0)).ok(), Some(6));
    }
}
