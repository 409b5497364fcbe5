use super::{base_cache::BaseCache, map_view::MapView, CacheBuilder, CacheConfig, CacheLoader};
use crate::{common::error::BoxError, stats::CacheStats, ConfigError, LoadError, Policy};

use std::{
    collections::{hash_map::RandomState, HashMap},
    fmt,
    hash::{BuildHasher, Hash},
    sync::Arc,
};

/// A thread-safe, bounded, self-loading in-memory cache.
///
/// A `Cache` is created with a [`CacheLoader`][loader-trait]. On a miss,
/// [`get`](#method.get) calls the loader, stores the value and returns it.
/// Concurrent misses on the same key call the loader only once; the other calls
/// wait for that load and receive the same value, or the same error.
///
/// The key space is split into segments. Each segment has its own lock, table and
/// recency orders, so operations on keys in different segments proceed in parallel.
/// The loader is never called while a segment lock is held.
///
/// Values are stored and returned as `Arc<V>`, so reading a value never clones it.
///
/// # Examples
///
/// Here's an example of reading and updating a cache by using multiple threads:
///
/// ```rust
/// use loadcache::sync::{from_fn, Cache};
///
/// use std::thread;
///
/// fn value(n: usize) -> String {
///     format!("value {}", n)
/// }
///
/// const NUM_THREADS: usize = 16;
/// const NUM_KEYS_PER_THREAD: usize = 64;
///
/// // Create a cache that can store up to 10,000 entries, and computes missing
/// // values with the `value` function.
/// let cache = Cache::builder()
///     .max_capacity(10_000)
///     .build(from_fn(|key: &usize| Ok(value(*key))))
///     .unwrap();
///
/// // Spawn threads and read and update the cache simultaneously.
/// let threads: Vec<_> = (0..NUM_THREADS)
///     .map(|i| {
///         // To share the same cache across the threads, clone it.
///         // This is a cheap operation.
///         let my_cache = cache.clone();
///         let start = i * NUM_KEYS_PER_THREAD;
///         let end = (i + 1) * NUM_KEYS_PER_THREAD;
///
///         thread::spawn(move || {
///             for key in start..end {
///                 // get() loads the missing value.
///                 assert_eq!(*my_cache.get(key).unwrap(), value(key));
///             }
///
///             // Invalidate every 4 element of the loaded entries.
///             for key in (start..end).step_by(4) {
///                 my_cache.invalidate(&key);
///             }
///         })
///     })
///     .collect();
///
/// // Wait for all threads to complete.
/// threads.into_iter().for_each(|t| t.join().expect("Failed"));
///
/// // Verify the result.
/// for key in 0..(NUM_THREADS * NUM_KEYS_PER_THREAD) {
///     if key % 4 == 0 {
///         assert_eq!(cache.get_if_present(&key), None);
///     } else {
///         assert_eq!(*cache.get_if_present(&key).unwrap(), value(key));
///     }
/// }
/// ```
///
/// # Size-based Eviction
///
/// ```rust
/// use loadcache::sync::{from_fn, Cache};
/// use std::convert::TryInto;
///
/// // Evict based on the number of entries in the cache.
/// let cache = Cache::builder()
///     // Up to 10,000 entries.
///     .max_capacity(10_000)
///     .build(from_fn(|key: &u32| Ok(key.to_string())))
///     .unwrap();
/// cache.get(1).unwrap();
///
/// // Evict based on the byte length of strings in the cache.
/// let cache = Cache::builder()
///     // A weigher closure takes &K and &V and returns a u32
///     // representing the relative size of the entry.
///     .weigher(|_key, value: &String| -> u32 {
///         value.len().try_into().unwrap_or(u32::MAX)
///     })
///     // This cache will hold up to 32MiB of values.
///     .max_weight(32 * 1024 * 1024)
///     .build(from_fn(|key: &u32| Ok(key.to_string())))
///     .unwrap();
/// cache.put(2, "two".to_string());
/// ```
///
/// When a write pushes a segment over its share of the capacity, the least
/// recently used entries of the segment are evicted. An entry heavier than the
/// whole share is admitted, and evicted by the next write to the segment.
///
/// # Time-based Expirations and Refresh
///
/// - **Time to live**: A cached entry will be expired after the specified duration
///   past from `put` or load.
/// - **Time to idle**: A cached entry will be expired after the specified duration
///   past from `get` or `put`.
/// - **Refresh after write**: The first read of an entry older than the specified
///   duration returns the current value at once, and reloads the entry on a
///   background thread.
///
/// Expired entries are removed when they are read, by the maintenance work that
/// writes (and every 64th read) of a segment carry out, and by
/// [`clean_up`](#method.clean_up).
///
/// # Removal Notifications
///
/// A removal listener receives a [`RemovalNotification`][notification] for every
/// entry that is removed, with a [`RemovalCause`][cause]. The listener is called
/// after the segment lock is released (`DeliveryMode::Immediate`), or on a worker
/// thread (`DeliveryMode::Queued`).
///
/// # Thread Safety
///
/// - `Cache<K, V, S>` requires trait bounds `Send`, `Sync` and `'static` for `K`
///   (key), `V` (value) and `S` (hasher state).
/// - `Cache<K, V, S>` will implement `Send` and `Sync`.
///
/// Cloning is a cheap operation for `Cache` as it only creates a thread-safe
/// reference-counted pointer to the internal data structures.
///
/// # Hashing Algorithm
///
/// By default, `Cache` uses the same hashing algorithm as
/// `std::collections::HashMap`. It can be replaced with the
/// [`build_with_hasher`][build-with-hasher-method] method of the `CacheBuilder`.
///
/// [loader-trait]: ./trait.CacheLoader.html
/// [notification]: ../notification/struct.RemovalNotification.html
/// [cause]: ../notification/enum.RemovalCause.html
/// [build-with-hasher-method]: ./struct.CacheBuilder.html#method.build_with_hasher
pub struct Cache<K, V, S = RandomState> {
    base: BaseCache<K, V, S>,
}

impl<K, V, S> Clone for Cache<K, V, S> {
    /// Makes a clone of this shared cache.
    ///
    /// This operation is cheap as it only creates a thread-safe reference counted
    /// pointer to the shared internal data structures.
    fn clone(&self) -> Self {
        Self {
            base: self.base.clone(),
        }
    }
}

impl<K, V, S> fmt::Debug for Cache<K, V, S>
where
    K: fmt::Debug + Hash + Eq + Send + Sync + 'static,
    V: fmt::Debug + Send + Sync + 'static,
    S: BuildHasher + Clone + Send + Sync + 'static,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut d_map = f.debug_map();

        for (k, v) in self.base.live_entries() {
            d_map.entry(&k, &v);
        }

        d_map.finish()
    }
}

impl<K, V> Cache<K, V, RandomState>
where
    K: Hash + Eq + Send + Sync + 'static,
    V: Send + Sync + 'static,
{
    /// Returns a [`CacheBuilder`][builder-struct], which can build a `Cache` with
    /// various configuration knobs.
    ///
    /// [builder-struct]: ./struct.CacheBuilder.html
    pub fn builder() -> CacheBuilder<K, V> {
        CacheBuilder::default()
    }

    /// Constructs a new `Cache<K, V>` from a complete configuration.
    ///
    /// # Errors
    ///
    /// Returns a [`ConfigError`](../enum.ConfigError.html) if the configuration is
    /// invalid. The configuration is validated only here.
    pub fn with_config(
        config: CacheConfig<K, V>,
        loader: impl CacheLoader<K, V>,
    ) -> Result<Self, ConfigError> {
        Self::with_config_and_hasher(config, loader, RandomState::default())
    }
}

impl<K, V, S> Cache<K, V, S>
where
    K: Hash + Eq + Send + Sync + 'static,
    V: Send + Sync + 'static,
    S: BuildHasher + Clone + Send + Sync + 'static,
{
    /// Constructs a new `Cache<K, V, S>` from a complete configuration and a
    /// hasher.
    ///
    /// # Errors
    ///
    /// Returns a [`ConfigError`](../enum.ConfigError.html) if the configuration is
    /// invalid.
    pub fn with_config_and_hasher(
        config: CacheConfig<K, V>,
        loader: impl CacheLoader<K, V>,
        build_hasher: S,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self {
            base: BaseCache::new(config, Box::new(loader), build_hasher),
        })
    }

    /// Returns the name of the cache.
    pub fn name(&self) -> Option<&str> {
        self.base.name()
    }

    /// Returns a read-only cache policy of this cache.
    ///
    /// At this time, cache policy cannot be modified after cache creation.
    pub fn policy(&self) -> Policy {
        self.base.policy()
    }

    /// Returns a snapshot of the statistics of this cache.
    pub fn stats(&self) -> CacheStats {
        self.base.stats()
    }

    /// Returns the number of entries in this cache. Entries that have expired or
    /// been collected but not removed yet are counted.
    pub fn entry_count(&self) -> u64 {
        self.base.entry_count()
    }

    /// Returns the total weighted size of entries in this cache.
    pub fn weighted_size(&self) -> u64 {
        self.base.weighted_size()
    }

    /// Returns the value corresponding to the key, loading it with the loader of
    /// the cache if it is not present.
    ///
    /// Only one load runs for a key at a time. A call that finds the key being
    /// loaded waits for that load, and gets its value or its error.
    ///
    /// # Errors
    ///
    /// - [`LoadError::Failed`][failed] if the loader returned an error. Errors are
    ///   not cached.
    /// - [`LoadError::RecursiveLoad`][recursive] if called from the loader for the
    ///   same key.
    ///
    /// # Panics
    ///
    /// Panics when the loader panics. Only the caller whose call ran the loader
    /// gets the panic. Other calls waiting for the same key start over.
    ///
    /// [failed]: ../enum.LoadError.html#variant.Failed
    /// [recursive]: ../enum.LoadError.html#variant.RecursiveLoad
    pub fn get(&self, key: impl Into<Arc<K>>) -> Result<Arc<V>, LoadError> {
        self.base.get(&key.into())
    }

    /// Returns the value corresponding to the key if it is present. Never loads.
    ///
    /// With weak keys, `key` must be the referent of the `Arc` the entry was
    /// created with, as keys are compared by identity.
    pub fn get_if_present(&self, key: &K) -> Option<Arc<V>> {
        self.base.get_if_present(key)
    }

    /// Returns the values for `keys`, loading the missing ones.
    ///
    /// If the loader implements [`load_all`][load-all], the missing keys are
    /// loaded with a single call. Otherwise `load` is called for each of them.
    ///
    /// # Errors
    ///
    /// Fails with the first loader error, or with
    /// [`LoadError::IncompleteBulkLoad`][incomplete] if the bulk loader did not
    /// return a value for every missing key. The values that were loaded stay in
    /// the cache.
    ///
    /// [load-all]: ./trait.CacheLoader.html#method.load_all
    /// [incomplete]: ../enum.LoadError.html#variant.IncompleteBulkLoad
    pub fn get_all<I>(&self, keys: I) -> Result<HashMap<Arc<K>, Arc<V>>, LoadError>
    where
        I: IntoIterator,
        I::Item: Into<Arc<K>>,
    {
        self.base.get_all(keys.into_iter().map(Into::into))
    }

    /// Returns the value corresponding to the key, computing it with `init` if it
    /// is not present. The loader of the cache is not called.
    ///
    /// This method prevents to evaluate the init closure multiple times on the same
    /// key even if the method is concurrently called by many threads; only one of
    /// the calls evaluates its closure, and other calls wait for that closure to
    /// complete.
    ///
    /// # Example
    ///
    /// ```rust
    /// use loadcache::sync::{from_fn, Cache};
    /// use std::{sync::Arc, thread};
    ///
    /// const TEN_MIB: usize = 10 * 1024 * 1024; // 10MiB
    /// let cache = Cache::builder()
    ///     .max_capacity(100)
    ///     .build(from_fn(|_key: &&str| Ok(Vec::new())))
    ///     .unwrap();
    ///
    /// // Spawn four threads.
    /// let threads: Vec<_> = (0..4_u8)
    ///     .map(|task_id| {
    ///         let my_cache = cache.clone();
    ///         thread::spawn(move || {
    ///             // Although all four threads will call `get_with` at the same
    ///             // time, the `init` closure must be evaluated only once.
    ///             let value = my_cache
    ///                 .get_with("key1", || {
    ///                     println!("Thread {} inserting a value.", task_id);
    ///                     vec![0u8; TEN_MIB]
    ///                 })
    ///                 .unwrap();
    ///
    ///             // Ensure the value exists now.
    ///             assert_eq!(value.len(), TEN_MIB);
    ///             assert!(my_cache.get_if_present(&"key1").is_some());
    ///         })
    ///     })
    ///     .collect();
    ///
    /// // Wait all threads to complete.
    /// threads
    ///     .into_iter()
    ///     .for_each(|t| t.join().expect("Thread failed"));
    /// ```
    ///
    /// # Errors
    ///
    /// [`LoadError::RecursiveLoad`][recursive] if called from an `init` closure
    /// for the same key.
    ///
    /// # Panics
    ///
    /// This method panics when the `init` closure has been panicked. When it
    /// happens, only the caller whose `init` closure panicked will get the panic.
    /// If there are other calls in progress, this method will restart and resolve
    /// one of the remaining `init` closures.
    ///
    /// [recursive]: ../enum.LoadError.html#variant.RecursiveLoad
    pub fn get_with(
        &self,
        key: impl Into<Arc<K>>,
        init: impl FnOnce() -> V,
    ) -> Result<Arc<V>, LoadError> {
        self.base.get_with_init(&key.into(), || Ok(init()))
    }

    /// Like [`get_with`](#method.get_with), but the `init` closure may fail. The
    /// error is handed to every call waiting for the same key, and is not cached.
    ///
    /// # Errors
    ///
    /// [`LoadError::Failed`][failed] wrapping the error of `init`.
    ///
    /// [failed]: ../enum.LoadError.html#variant.Failed
    pub fn try_get_with<F, E>(&self, key: impl Into<Arc<K>>, init: F) -> Result<Arc<V>, LoadError>
    where
        F: FnOnce() -> Result<V, E>,
        E: Into<BoxError>,
    {
        self.base
            .get_with_init(&key.into(), || init().map_err(Into::into))
    }

    /// Inserts a key-value pair into the cache.
    ///
    /// If the cache has this key present, the value is updated, and the listener
    /// is notified with `RemovalCause::Replaced`. A load in flight for the key is
    /// superseded: its result is returned to its callers but not stored.
    pub fn put(&self, key: impl Into<Arc<K>>, value: impl Into<Arc<V>>) {
        self.base.put(key.into(), value.into());
    }

    /// Returns `true` if the cache contains a live value for the key. Unlike
    /// `get_if_present`, this does not count as an access.
    pub fn contains_key(&self, key: &K) -> bool {
        self.base.contains_key(key)
    }

    /// Discards any cached value for the key.
    ///
    /// A load in flight for the key is not cancelled, but its result will not be
    /// stored.
    pub fn invalidate(&self, key: &K) {
        self.base.invalidate(key);
    }

    /// Discards any cached values for the keys.
    pub fn invalidate_many<'a>(&self, keys: impl IntoIterator<Item = &'a K>)
    where
        K: 'a,
    {
        for key in keys {
            self.base.invalidate(key);
        }
    }

    /// Discards all cached values.
    ///
    /// Every removed entry is reported to the removal listener with
    /// `RemovalCause::Explicit`.
    pub fn invalidate_all(&self) {
        self.base.invalidate_all();
    }

    /// Reloads the value for the key on a background thread. The current value
    /// stays readable until the reload completes, and is kept if the reload
    /// fails. A key that is not present is loaded in the background.
    ///
    /// Does nothing if a load or a reload for the key is already in flight.
    pub fn refresh(&self, key: impl Into<Arc<K>>) {
        self.base.refresh(key.into());
    }

    /// Returns a view of the cache as a concurrent map. Reads and writes through
    /// the view act on the cache directly, and never call the loader.
    pub fn as_map(&self) -> MapView<'_, K, V, S> {
        MapView::new(&self.base)
    }

    /// Performs any pending maintenance: removes every expired entry, and every
    /// entry whose weak key or value was collected.
    pub fn clean_up(&self) {
        self.base.clean_up();
    }

    /// Removes the soft values that are not referenced outside of the cache, and
    /// returns the number of removed entries.
    ///
    /// Call this when the application is short of memory. It has no effect unless
    /// the cache was built with `soft_values`.
    pub fn reclaim_soft_values(&self) -> usize {
        self.base.reclaim_soft_values()
    }
}

// To see the debug prints, run test as `cargo test -- --nocapture`
#[cfg(test)]
mod tests {
    use super::Cache;
    use crate::{
        notification::{DeliveryMode, RemovalCause, RemovalNotification},
        sync::{from_fn, CacheLoader},
        BoxError, Clock, LoadError,
    };

    use parking_lot::Mutex;
    use std::{
        collections::HashMap,
        sync::{
            atomic::{AtomicUsize, Ordering},
            mpsc, Arc, Barrier,
        },
        thread,
        time::{Duration, Instant},
    };

    type Removals = Arc<Mutex<Vec<(u32, RemovalCause)>>>;

    fn recording_listener(
        removals: &Removals,
    ) -> impl Fn(RemovalNotification<u32, u32>) + Send + Sync + 'static {
        let removals = Arc::clone(removals);
        move |n| {
            let key = n.key().map_or(u32::MAX, |k| **k);
            removals.lock().push((key, n.cause()));
        }
    }

    fn counting_loader(counter: &Arc<AtomicUsize>) -> impl CacheLoader<u32, u32> {
        let counter = Arc::clone(counter);
        from_fn(move |key: &u32| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(key * 10)
        })
    }

    fn wait_until(mut cond: impl FnMut() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !cond() {
            assert!(Instant::now() < deadline, "timed out");
            thread::sleep(Duration::from_millis(5));
        }
    }

    #[test]
    fn basic_single_thread() {
        let loads = Arc::new(AtomicUsize::default());
        let cache = Cache::builder()
            .max_capacity(100)
            .build(counting_loader(&loads))
            .expect("valid config");

        assert_eq!(*cache.get(1).expect("loaded"), 10);
        assert_eq!(*cache.get(1).expect("cached"), 10);
        assert_eq!(loads.load(Ordering::SeqCst), 1);

        assert_eq!(cache.get_if_present(&2), None);
        cache.put(2, 7);
        assert_eq!(cache.get_if_present(&2).as_deref(), Some(&7));
        assert_eq!(cache.entry_count(), 2);

        cache.invalidate(&1);
        assert_eq!(cache.get_if_present(&1), None);
        assert_eq!(*cache.get(1).expect("reloaded"), 10);
        assert_eq!(loads.load(Ordering::SeqCst), 2);

        let stats = cache.stats();
        assert_eq!(stats.hit_count(), 2);
        assert_eq!(stats.miss_count(), 4);
        assert_eq!(stats.load_success_count(), 2);
        assert_eq!(stats.load_failure_count(), 0);
    }

    #[test]
    fn loads_at_most_once_per_key() {
        const NUM_THREADS: usize = 8;

        let loads = Arc::new(AtomicUsize::default());
        let loader = {
            let loads = Arc::clone(&loads);
            from_fn(move |key: &u32| {
                loads.fetch_add(1, Ordering::SeqCst);
                thread::sleep(Duration::from_millis(50));
                Ok(format!("value {key}"))
            })
        };
        let cache = Cache::builder().build(loader).expect("valid config");
        let barrier = Arc::new(Barrier::new(NUM_THREADS));

        let handles = (0..NUM_THREADS)
            .map(|_| {
                let cache = cache.clone();
                let barrier = Arc::clone(&barrier);
                thread::spawn(move || {
                    barrier.wait();
                    cache.get(1).expect("loaded")
                })
            })
            .collect::<Vec<_>>();

        let values = handles
            .into_iter()
            .map(|h| h.join().expect("thread panicked"))
            .collect::<Vec<_>>();

        assert_eq!(loads.load(Ordering::SeqCst), 1);
        assert!(values.iter().all(|v| Arc::ptr_eq(v, &values[0])));
        assert_eq!(*values[0], "value 1");
    }

    #[test]
    fn load_failure_is_shared_and_not_cached() {
        let loads = Arc::new(AtomicUsize::default());
        let loader = {
            let loads = Arc::clone(&loads);
            from_fn(move |_key: &u32| -> Result<u32, BoxError> {
                if loads.fetch_add(1, Ordering::SeqCst) == 0 {
                    thread::sleep(Duration::from_millis(50));
                    Err("database is down".into())
                } else {
                    Ok(1)
                }
            })
        };
        let cache = Cache::builder().build(loader).expect("valid config");

        let waiter = {
            let cache = cache.clone();
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(10));
                cache.get(1)
            })
        };

        let e = cache.get(1).expect_err("the first load fails");
        assert!(e.is_loader_failure());
        assert_eq!(e.to_string(), "failed to load the value: database is down");
        assert!(waiter.join().expect("thread panicked").is_err());

        assert_eq!(cache.get_if_present(&1), None);
        assert_eq!(*cache.get(1).expect("loaded"), 1);
        assert_eq!(loads.load(Ordering::SeqCst), 2);
        assert_eq!(cache.stats().load_failure_count(), 1);
    }

    #[test]
    fn evicts_least_recently_used() {
        let removals = Removals::default();
        let cache = Cache::builder()
            .max_capacity(2)
            .removal_listener(recording_listener(&removals), DeliveryMode::Immediate)
            .build(counting_loader(&Arc::default()))
            .expect("valid config");

        cache.put(1, 1);
        cache.put(2, 2);
        assert!(cache.get_if_present(&1).is_some());
        cache.put(3, 3);

        assert!(cache.contains_key(&1));
        assert!(!cache.contains_key(&2));
        assert!(cache.contains_key(&3));
        assert_eq!(*removals.lock(), vec![(2, RemovalCause::Size)]);
        assert_eq!(cache.stats().eviction_count(), 1);
    }

    #[test]
    fn size_aware_eviction() {
        let weigher = |_k: &&str, v: &(&str, u32)| v.1;

        let alice = ("alice", 10);
        let bob = ("bob", 15);
        let bill = ("bill", 20);
        let cindy = ("cindy", 5);
        let david = ("david", 15);

        let cache = Cache::builder()
            .max_weight(31)
            .weigher(weigher)
            .build(from_fn(|_k: &&str| Ok(("?", 1))))
            .expect("valid config");
        assert_eq!(cache.policy().num_segments(), 1);

        cache.put("a", alice);
        cache.put("b", bob);
        cache.put("c", cindy);
        assert_eq!(cache.weighted_size(), 30);
        // order (LRU -> MRU): a, b, c

        assert!(cache.get_if_present(&"a").is_some());
        // order: b, c, a

        // To enter "d" (weight: 15), it needs to evict "b" (w: 15).
        cache.put("d", david);
        assert!(!cache.contains_key(&"b"));
        assert_eq!(cache.weighted_size(), 30);
        // order: c, a, d

        // Update "a" with "bill" (w: 10 -> 20). This evicts "c" and "d".
        cache.put("a", bill);
        assert!(!cache.contains_key(&"c"));
        assert!(!cache.contains_key(&"d"));
        assert_eq!(cache.get_if_present(&"a").as_deref(), Some(&bill));
        assert_eq!(cache.entry_count(), 1);
        assert_eq!(cache.weighted_size(), 20);
    }

    #[test]
    fn capacity_is_bounded_across_segments() {
        let cache = Cache::builder()
            .max_capacity(100)
            .concurrency_level(4)
            .build(counting_loader(&Arc::default()))
            .expect("valid config");
        assert_eq!(cache.policy().num_segments(), 4);

        for key in 0..1_000 {
            cache.get(key).expect("loaded");
            assert!(cache.entry_count() <= 100);
        }
        assert_eq!(cache.stats().eviction_count(), 1_000 - cache.entry_count());
    }

    #[test]
    fn time_to_live() {
        let (clock, mock) = Clock::mock();
        let loads = Arc::new(AtomicUsize::default());
        let removals = Removals::default();
        let cache = Cache::builder()
            .time_to_live(Duration::from_secs(10))
            .clock(clock)
            .removal_listener(recording_listener(&removals), DeliveryMode::Immediate)
            .build(counting_loader(&loads))
            .expect("valid config");

        cache.get(1).expect("loaded");

        mock.increment(Duration::from_secs(5)); // 5 secs from the start.
        cache.get(1).expect("hit");
        assert_eq!(loads.load(Ordering::SeqCst), 1);

        // Reading does not extend the life of the entry.
        mock.increment(Duration::from_secs(6)); // 11 secs.
        assert!(!cache.contains_key(&1));
        cache.get(1).expect("reloaded");
        assert_eq!(loads.load(Ordering::SeqCst), 2);
        assert_eq!(*removals.lock(), vec![(1, RemovalCause::Expired)]);

        cache.put(2, 2);
        mock.increment(Duration::from_secs(10)); // 21 secs.
        cache.clean_up();
        assert_eq!(cache.entry_count(), 0);
        assert_eq!(removals.lock().len(), 3);
        assert_eq!(cache.stats().eviction_count(), 3);
    }

    #[test]
    fn invalidate_removes_expired_entries() {
        let (clock, mock) = Clock::mock();
        let removals = Removals::default();
        let cache = Cache::builder()
            .concurrency_level(1)
            .time_to_live(Duration::from_secs(10))
            .clock(clock)
            .removal_listener(recording_listener(&removals), DeliveryMode::Immediate)
            .build(counting_loader(&Arc::default()))
            .expect("valid config");

        cache.put(1, 1);
        mock.increment(Duration::from_secs(11));

        // Key 2 was never cached.
        cache.invalidate(&2);
        assert_eq!(*removals.lock(), vec![(1, RemovalCause::Expired)]);
        assert_eq!(cache.entry_count(), 0);
    }

    #[test]
    fn time_to_idle() {
        let (clock, mock) = Clock::mock();
        let cache = Cache::builder()
            .time_to_idle(Duration::from_secs(10))
            .clock(clock)
            .build(counting_loader(&Arc::default()))
            .expect("valid config");

        cache.put(1, 1);
        cache.put(2, 2);

        mock.increment(Duration::from_secs(5)); // 5 secs from the start.
        assert!(cache.get_if_present(&1).is_some());

        mock.increment(Duration::from_secs(5)); // 10 secs.
        assert!(cache.get_if_present(&1).is_some());
        assert!(cache.get_if_present(&2).is_none());

        mock.increment(Duration::from_secs(10)); // 20 secs.
        cache.clean_up();
        assert_eq!(cache.entry_count(), 0);
    }

    #[test]
    fn refresh_after_write_does_not_block_readers() {
        let (clock, mock) = Clock::mock();
        let reloads = Arc::new(AtomicUsize::default());
        let removals = Removals::default();

        struct SlowReloader(Arc<AtomicUsize>);

        impl CacheLoader<u32, u32> for SlowReloader {
            fn load(&self, _key: &u32) -> Result<u32, BoxError> {
                Ok(1)
            }

            fn reload(&self, _key: &u32, old_value: &Arc<u32>) -> Result<u32, BoxError> {
                self.0.fetch_add(1, Ordering::SeqCst);
                thread::sleep(Duration::from_millis(200));
                Ok(**old_value + 1)
            }
        }

        let cache = Cache::builder()
            .refresh_after_write(Duration::from_secs(1))
            .clock(clock)
            .removal_listener(recording_listener(&removals), DeliveryMode::Immediate)
            .build(SlowReloader(Arc::clone(&reloads)))
            .expect("valid config");

        assert_eq!(*cache.get(1).expect("loaded"), 1);
        mock.increment(Duration::from_secs(2));

        let start = Instant::now();
        assert_eq!(*cache.get(1).expect("stale value"), 1);
        assert_eq!(*cache.get(1).expect("stale value"), 1);
        assert!(start.elapsed() < Duration::from_millis(150));

        wait_until(|| cache.get_if_present(&1).as_deref() == Some(&2));
        assert_eq!(reloads.load(Ordering::SeqCst), 1);
        assert_eq!(*removals.lock(), vec![(1, RemovalCause::Replaced)]);
    }

    #[test]
    fn failed_refresh_keeps_the_value() {
        let (clock, mock) = Clock::mock();
        let attempts = Arc::new(AtomicUsize::default());
        let loader = {
            let attempts = Arc::clone(&attempts);
            from_fn(move |_key: &u32| -> Result<u32, BoxError> {
                if attempts.fetch_add(1, Ordering::SeqCst) == 0 {
                    Ok(1)
                } else {
                    Err("unavailable".into())
                }
            })
        };
        let cache = Cache::builder()
            .refresh_after_write(Duration::from_secs(1))
            .clock(clock)
            .build(loader)
            .expect("valid config");

        cache.get(1).expect("loaded");
        mock.increment(Duration::from_secs(2));
        assert_eq!(*cache.get(1).expect("stale value"), 1);

        wait_until(|| cache.stats().load_failure_count() == 1);
        assert_eq!(*cache.get(1).expect("kept value"), 1);
    }

    #[test]
    fn explicit_refresh() {
        let loads = Arc::new(AtomicUsize::default());
        let cache = Cache::builder()
            .build(counting_loader(&loads))
            .expect("valid config");

        // Absent keys are loaded in the background.
        cache.refresh(3);
        wait_until(|| cache.contains_key(&3));

        cache.put(1, 1);
        cache.refresh(1);
        wait_until(|| cache.get_if_present(&1).as_deref() == Some(&10));
        assert_eq!(loads.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn removal_causes() {
        let removals = Removals::default();
        let cache = Cache::builder()
            .max_capacity(2)
            .removal_listener(recording_listener(&removals), DeliveryMode::Immediate)
            .build(counting_loader(&Arc::default()))
            .expect("valid config");

        cache.put(1, 1);
        cache.put(1, 2);
        cache.invalidate(&1);
        cache.put(2, 2);
        cache.put(3, 3);
        cache.put(4, 4);
        cache.invalidate_all();

        let mut removals = removals.lock().clone();
        // invalidate_all does not remove the entries in any particular order.
        removals[3..].sort_unstable_by_key(|(k, _)| *k);
        assert_eq!(
            removals,
            vec![
                (1, RemovalCause::Replaced),
                (1, RemovalCause::Explicit),
                (2, RemovalCause::Size),
                (3, RemovalCause::Explicit),
                (4, RemovalCause::Explicit),
            ]
        );
    }

    #[test]
    fn round_trip() {
        let cache = Cache::builder()
            .build(counting_loader(&Arc::default()))
            .expect("valid config");
        cache.put(5, 55);
        assert_eq!(cache.get_if_present(&5).as_deref(), Some(&55));
        assert_eq!(*cache.get(5).expect("cached"), 55);
    }

    #[test]
    fn recursive_load_is_detected() {
        let cache = Cache::builder()
            .build(counting_loader(&Arc::default()))
            .expect("valid config");

        let inner_result = Mutex::new(None);
        let value = cache.get_with(1, || {
            *inner_result.lock() = Some(cache.get(1));
            // Other keys can be requested.
            *cache.get(2).expect("loaded") + 1
        });

        assert_eq!(value.ok().as_deref(), Some(&21));
        assert!(matches!(
            inner_result.lock().take(),
            Some(Err(LoadError::RecursiveLoad))
        ));
    }

    #[test]
    fn invalidate_during_load_discards_the_result() {
        let (started_tx, started_rx) = mpsc::channel();
        let (release_tx, release_rx) = mpsc::channel::<()>();
        let (started_tx, release_rx) = (Mutex::new(started_tx), Mutex::new(release_rx));

        let cache = Cache::builder()
            .build(from_fn(move |key: &u32| {
                started_tx.lock().send(()).ok();
                release_rx.lock().recv().ok();
                Ok(*key)
            }))
            .expect("valid config");

        let loading = {
            let cache = cache.clone();
            thread::spawn(move || cache.get(1))
        };
        started_rx.recv().expect("load started");
        cache.invalidate(&1);
        release_tx.send(()).expect("loader waiting");

        let value = loading.join().expect("thread panicked").expect("loaded");
        assert_eq!(*value, 1);
        assert!(!cache.contains_key(&1));
        assert_eq!(cache.entry_count(), 0);
    }

    #[test]
    fn put_supersedes_load_in_flight() {
        let (started_tx, started_rx) = mpsc::channel();
        let (release_tx, release_rx) = mpsc::channel::<()>();
        let (started_tx, release_rx) = (Mutex::new(started_tx), Mutex::new(release_rx));

        let cache = Cache::builder()
            .build(from_fn(move |_key: &u32| {
                started_tx.lock().send(()).ok();
                release_rx.lock().recv().ok();
                Ok(100)
            }))
            .expect("valid config");

        let loading = {
            let cache = cache.clone();
            thread::spawn(move || cache.get(1))
        };
        started_rx.recv().expect("load started");
        cache.put(1, 5);
        release_tx.send(()).expect("loader waiting");

        assert_eq!(*loading.join().expect("thread panicked").expect("loaded"), 100);
        assert_eq!(cache.get_if_present(&1).as_deref(), Some(&5));
    }

    struct BulkLoader {
        requested: Mutex<Vec<u32>>,
        omit: Option<u32>,
    }

    impl CacheLoader<u32, u32> for BulkLoader {
        fn load(&self, key: &u32) -> Result<u32, BoxError> {
            Ok(*key)
        }

        fn load_all(&self, keys: &[Arc<u32>]) -> Option<Result<HashMap<u32, u32>, BoxError>> {
            self.requested.lock().extend(keys.iter().map(|k| **k));
            let mut map = keys
                .iter()
                .filter(|k| Some(***k) != self.omit)
                .map(|k| (**k, **k * 100))
                .collect::<HashMap<_, _>>();
            map.insert(999, 0);
            Some(Ok(map))
        }
    }

    #[test]
    fn get_all_uses_the_bulk_loader() {
        let cache = Cache::builder()
            .build(BulkLoader {
                requested: Mutex::default(),
                omit: None,
            })
            .expect("valid config");
        cache.put(1, 1);

        let values = cache.get_all([1, 2, 3, 2]).expect("loaded");
        assert_eq!(values.len(), 3);
        assert_eq!(values.get(&1).map(|v| **v), Some(1));
        assert_eq!(values.get(&2).map(|v| **v), Some(200));
        assert_eq!(values.get(&3).map(|v| **v), Some(300));

        // Extra entries are stored too.
        assert!(cache.contains_key(&999));
        assert_eq!(cache.entry_count(), 4);
        assert_eq!(cache.stats().load_success_count(), 1);
    }

    #[test]
    fn get_all_detects_incomplete_bulk_load() {
        let loader = BulkLoader {
            requested: Mutex::default(),
            omit: Some(3),
        };
        let cache = Cache::builder().build(loader).expect("valid config");

        let result = cache.get_all([2, 3]);
        assert!(matches!(result, Err(LoadError::IncompleteBulkLoad)));
        assert!(cache.contains_key(&2));
        assert!(!cache.contains_key(&3));

        // Nothing is left loading.
        assert_eq!(*cache.get(3).expect("loaded"), 3);
    }

    #[test]
    fn get_all_falls_back_to_load() {
        let loads = Arc::new(AtomicUsize::default());
        let cache = Cache::builder()
            .build(counting_loader(&loads))
            .expect("valid config");

        let values = cache.get_all(0..5).expect("loaded");
        assert_eq!(values.len(), 5);
        assert_eq!(loads.load(Ordering::SeqCst), 5);
        assert_eq!(values.get(&4).map(|v| **v), Some(40));
    }

    #[test]
    fn get_all_loads_keys_that_depend_on_each_other() {
        let slot: Arc<Mutex<Option<Cache<u64, u64>>>> = Arc::default();
        let loads = Arc::new(AtomicUsize::default());
        let cache = {
            let slot = Arc::clone(&slot);
            let loads = Arc::clone(&loads);
            Cache::builder()
                .build(from_fn(move |n: &u64| {
                    loads.fetch_add(1, Ordering::SeqCst);
                    if *n < 2 {
                        return Ok(*n);
                    }
                    let cache = slot.lock().clone().ok_or("no cache")?;
                    Ok(*cache.get(n - 1)? + *cache.get(n - 2)?)
                }))
                .expect("valid config")
        };
        *slot.lock() = Some(cache.clone());

        let values = cache.get_all([22, 21, 20]).expect("loaded");
        assert_eq!(values.get(&22).map(|v| **v), Some(17_711));
        assert_eq!(values.get(&21).map(|v| **v), Some(10_946));
        assert_eq!(values.get(&20).map(|v| **v), Some(6_765));
        // Every number was computed once.
        assert_eq!(loads.load(Ordering::SeqCst), 23);
        assert_eq!(cache.entry_count(), 23);

        // A key still cannot load itself through a batch.
        let inner_result = Mutex::new(None);
        let value = cache.get_with(30, || {
            *inner_result.lock() = Some(cache.get_all([30]).map(|values| values.len()));
            0
        });
        assert_eq!(value.ok().as_deref(), Some(&0));
        assert!(matches!(
            inner_result.lock().take(),
            Some(Err(LoadError::RecursiveLoad))
        ));

        slot.lock().take();
    }

    #[test]
    fn weak_values_are_collected() {
        let removals = Removals::default();
        let cache = Cache::builder()
            .weak_values()
            .removal_listener(recording_listener(&removals), DeliveryMode::Immediate)
            .build(counting_loader(&Arc::default()))
            .expect("valid config");

        let kept = Arc::new(1);
        cache.put(1, Arc::clone(&kept));
        cache.put(2, Arc::new(2));

        assert_eq!(cache.get_if_present(&1).as_deref(), Some(&1));
        assert_eq!(cache.get_if_present(&2), None);
        cache.clean_up();

        assert_eq!(cache.entry_count(), 1);
        assert_eq!(*removals.lock(), vec![(2, RemovalCause::Collected)]);
        drop(kept);
    }

    #[test]
    fn weak_keys_are_compared_by_identity() {
        let cache: Cache<String, u32> = Cache::builder()
            .weak_keys()
            .build(from_fn(|key: &String| Ok(key.len() as u32)))
            .expect("valid config");

        let key = Arc::new("alice".to_string());
        cache.put(Arc::clone(&key), 1);
        assert_eq!(cache.get_if_present(&key).as_deref(), Some(&1));
        assert_eq!(cache.get_if_present(&"alice".to_string()), None);

        drop(key);
        cache.clean_up();
        assert_eq!(cache.entry_count(), 0);
    }

    #[test]
    fn soft_values_are_reclaimed_on_demand() {
        let cache = Cache::builder()
            .soft_values()
            .build(counting_loader(&Arc::default()))
            .expect("valid config");

        let held = cache.get(1).expect("loaded");
        cache.get(2).expect("loaded");
        cache.clean_up();
        assert_eq!(cache.entry_count(), 2);

        assert_eq!(cache.reclaim_soft_values(), 1);
        assert!(cache.contains_key(&1));
        assert!(!cache.contains_key(&2));
        drop(held);
    }

    #[test]
    fn listener_panic_does_not_undo_removal() {
        let calls = Arc::new(AtomicUsize::default());
        let listener = {
            let calls = Arc::clone(&calls);
            move |_n: RemovalNotification<u32, u32>| {
                if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                    panic!("listener panicked");
                }
            }
        };
        let cache = Cache::builder()
            .removal_listener(listener, DeliveryMode::Immediate)
            .build(counting_loader(&Arc::default()))
            .expect("valid config");

        cache.put(1, 1);
        cache.put(2, 2);
        cache.invalidate(&1);
        cache.invalidate(&2);

        assert_eq!(cache.entry_count(), 0);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn handle_panic_in_get_with() {
        let cache = Cache::builder()
            .build(counting_loader(&Arc::default()))
            .expect("valid config");
        let barrier = Arc::new(Barrier::new(2));
        {
            let cache_ref = cache.clone();
            let barrier_ref = barrier.clone();
            thread::spawn(move || {
                let _ = cache_ref.get_with(1, || {
                    barrier_ref.wait();
                    thread::sleep(Duration::from_millis(50));
                    panic!("Panic during get_with");
                });
            });
        }

        barrier.wait();
        assert_eq!(cache.get_with(1, || 5).ok().as_deref(), Some(&5));
    }

    #[test]
    fn get_all_retries_after_panic_in_other_load() {
        let loads = Arc::new(AtomicUsize::default());
        let cache = Cache::builder()
            .build(counting_loader(&loads))
            .expect("valid config");
        let barrier = Arc::new(Barrier::new(2));
        let handle = {
            let cache_ref = cache.clone();
            let barrier_ref = barrier.clone();
            thread::spawn(move || {
                let _ = cache_ref.get_with(1, || {
                    barrier_ref.wait();
                    thread::sleep(Duration::from_millis(50));
                    panic!("Panic during get_with");
                });
            })
        };

        // Waits for the panicking load, then loads the key itself.
        barrier.wait();
        let values = cache.get_all([1, 2]).expect("loaded");
        assert_eq!(values.get(&1).map(|v| **v), Some(10));
        assert_eq!(values.get(&2).map(|v| **v), Some(20));
        assert_eq!(loads.load(Ordering::SeqCst), 2);
        assert!(handle.join().is_err());
    }

    #[test]
    fn try_get_with() {
        let cache = Cache::builder()
            .build(counting_loader(&Arc::default()))
            .expect("valid config");

        let result = cache.try_get_with(1, || "x".parse::<u32>());
        assert!(matches!(result, Err(LoadError::Failed(_))));
        assert!(!cache.contains_key(&1));

        let result = cache.try_get_with(1, || "7".parse::<u32>());
        assert_eq!(result.ok().as_deref(), Some(&7));
    }
}
