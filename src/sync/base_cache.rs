use super::{
    entry::{key_id, Expiry, KeyLookup, KeyRef},
    housekeeper::Budget,
    refresher::Refresher,
    segment::{Lookup, RefreshTicket, Removals, Segment, SegmentConfig, SegmentInner},
    value_initializer::{run_init, InitResult, Waiter},
    CacheConfig, CacheLoader,
};
use crate::{
    common::{concurrent::constants::MIN_SEGMENT_WEIGHT, error::BoxError, time::Instant},
    notification::{notifier::RemovalNotifier, RemovalCause, RemovalNotification},
    policy::{Policy, ValueStrength},
    stats::{stats_counter::StatsCounter, CacheStats},
    Clock, LoadError, Weigher,
};

use once_cell::sync::OnceCell;
use parking_lot::MutexGuard;
use std::{
    collections::{hash_map::RandomState, HashMap, HashSet},
    hash::{BuildHasher, Hash, Hasher},
    panic::{catch_unwind, resume_unwind, AssertUnwindSafe},
    sync::{Arc, Weak},
};
use triomphe::Arc as TrioArc;

/// The result of looking up a key on the loading path.
enum Reservation<V> {
    Hit(Arc<V>),
    /// Another call is loading the key.
    Loading(TrioArc<Waiter<V>>),
    /// The current call installed the placeholder and has to run the load.
    Owned {
        generation: u64,
        waiter: TrioArc<Waiter<V>>,
    },
}

pub(crate) struct BaseCache<K, V, S = RandomState> {
    pub(crate) inner: Arc<Inner<K, V, S>>,
}

impl<K, V, S> Clone for BaseCache<K, V, S> {
    /// Makes a clone of this shared cache.
    ///
    /// This operation is cheap as it only creates thread-safe reference counted
    /// pointers to the shared internal data structures.
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<K, V, S> BaseCache<K, V, S>
where
    K: Hash + Eq + Send + Sync + 'static,
    V: Send + Sync + 'static,
    S: BuildHasher + Clone + Send + Sync + 'static,
{
    pub(crate) fn new(
        config: CacheConfig<K, V>,
        loader: Box<dyn CacheLoader<K, V>>,
        build_hasher: S,
    ) -> Self {
        Self {
            inner: Arc::new(Inner::new(config, loader, build_hasher)),
        }
    }

    pub(crate) fn name(&self) -> Option<&str> {
        self.inner.name.as_deref()
    }

    pub(crate) fn policy(&self) -> Policy {
        self.inner.policy.clone()
    }

    pub(crate) fn stats(&self) -> CacheStats {
        self.inner.stats.snapshot()
    }

    pub(crate) fn entry_count(&self) -> u64 {
        self.inner
            .segments
            .iter()
            .map(|s| s.lock().entry_count)
            .sum()
    }

    pub(crate) fn weighted_size(&self) -> u64 {
        self.inner
            .segments
            .iter()
            .map(|s| s.lock().weighted_size)
            .sum()
    }

    /// Returns the value for `key`, calling the loader on a miss.
    pub(crate) fn get(&self, key: &Arc<K>) -> Result<Arc<V>, LoadError> {
        let loader = &self.inner.loader;
        self.get_with_init(key, || loader.load(key))
    }

    /// Returns the value for `key`, calling `init` on a miss. Concurrent misses
    /// on the same key share a single call of `init`.
    ///
    /// If the load this call waited for panicked, the call starts over, and may
    /// run its own `init`.
    pub(crate) fn get_with_init(
        &self,
        key: &Arc<K>,
        init: impl FnOnce() -> Result<V, BoxError>,
    ) -> Result<Arc<V>, LoadError> {
        let mut init = Some(init);
        loop {
            let (generation, waiter) = match self.lookup_or_reserve(key) {
                Reservation::Hit(value) => return Ok(value),
                Reservation::Loading(waiter) => match take_over(&waiter) {
                    Some(generation) => (generation, waiter),
                    None => match self.inner.wait_for(&waiter) {
                        Err(LoadError::LoaderPanicked) => continue,
                        result => return result,
                    },
                },
                Reservation::Owned { generation, waiter } => (generation, waiter),
            };

            let init = match init.take() {
                Some(init) => init,
                None => unreachable!("get_with_init - the init closure was already called"),
            };
            let init_result = run_init(&self.inner.clock, &self.inner.stats, self.name(), init);
            return match self.inner.finish_load(key, generation, &waiter, init_result) {
                InitResult::Initialized(value) => Ok(value),
                InitResult::InitErr(e) => Err(e),
                InitResult::Panicked(payload) => resume_unwind(payload),
            };
        }
    }

    fn lookup_or_reserve(&self, key: &Arc<K>) -> Reservation<V> {
        let inner = &self.inner;
        let lookup = inner.key_lookup(key);
        let segment = inner.segment(lookup.hash);
        let mut removals = Removals::new();

        let mut guard = segment.lock();
        let now = inner.clock.now();
        match guard.get(&lookup, now, &mut removals) {
            Lookup::Hit { value, refresh } => {
                if segment.should_maintain_on_read() {
                    guard.run_maintenance(now, Budget::batch(), &mut removals);
                }
                inner.unlock_and_notify(guard, removals);
                inner.stats.record_hits(1);
                if let Some(ticket) = refresh {
                    self.schedule_reload(ticket);
                }
                Reservation::Hit(value)
            }
            Lookup::Loading(waiter) => {
                inner.unlock_and_notify(guard, removals);
                inner.stats.record_misses(1);
                Reservation::Loading(waiter)
            }
            Lookup::Absent => {
                let waiter = TrioArc::new(Waiter::new());
                let generation = guard.insert_placeholder(
                    lookup.hash,
                    KeyRef::new(key, inner.weak_keys),
                    TrioArc::clone(&waiter),
                );
                inner.unlock_and_notify(guard, removals);
                inner.stats.record_misses(1);
                Reservation::Owned { generation, waiter }
            }
        }
    }

    /// Returns the live value for `key` without loading it. A key that is still
    /// loading is reported as absent.
    pub(crate) fn get_if_present(&self, key: &K) -> Option<Arc<V>> {
        let inner = &self.inner;
        let lookup = inner.key_lookup(key);
        let segment = inner.segment(lookup.hash);
        let mut removals = Removals::new();

        let mut guard = segment.lock();
        let now = inner.clock.now();
        let found = guard.get(&lookup, now, &mut removals);
        if segment.should_maintain_on_read() {
            guard.run_maintenance(now, Budget::batch(), &mut removals);
        }
        inner.unlock_and_notify(guard, removals);

        match found {
            Lookup::Hit { value, refresh } => {
                inner.stats.record_hits(1);
                if let Some(ticket) = refresh {
                    self.schedule_reload(ticket);
                }
                Some(value)
            }
            Lookup::Loading(_) | Lookup::Absent => {
                inner.stats.record_misses(1);
                None
            }
        }
    }

    pub(crate) fn contains_key(&self, key: &K) -> bool {
        let inner = &self.inner;
        let lookup = inner.key_lookup(key);
        let guard = inner.segment(lookup.hash).lock();
        guard.peek(&lookup, inner.clock.now()).is_some()
    }

    /// Returns the values for `keys`, loading the missing ones. Uses the bulk
    /// loader when the loader supports it.
    pub(crate) fn get_all(
        &self,
        keys: impl IntoIterator<Item = Arc<K>>,
    ) -> Result<HashMap<Arc<K>, Arc<V>>, LoadError> {
        let mut result = HashMap::new();
        let mut pending = Vec::new();
        let mut owned = Vec::new();
        let mut is_recursive = false;
        let mut seen = HashSet::new();

        for key in keys {
            if !seen.insert(Arc::clone(&key)) {
                continue;
            }
            match self.lookup_or_reserve(&key) {
                Reservation::Hit(value) => {
                    result.insert(key, value);
                }
                Reservation::Loading(waiter) if waiter.is_owned_by_current_thread() => {
                    match waiter.claim() {
                        Some(generation) => owned.push((key, generation, waiter)),
                        None => is_recursive = true,
                    }
                }
                Reservation::Loading(waiter) => pending.push((key, waiter)),
                Reservation::Owned { generation, waiter } => owned.push((key, generation, waiter)),
            }
        }

        if is_recursive {
            for (key, generation, waiter) in owned {
                self.inner
                    .abandon_load(&key, generation, &waiter, LoadError::RecursiveLoad);
            }
            self.inner.log_recursive_load();
            return Err(LoadError::RecursiveLoad);
        }

        if !owned.is_empty() {
            self.load_owned(owned, &mut result)?;
        }

        for (key, waiter) in pending {
            let value = match waiter.wait() {
                // The other load panicked. Load the key again.
                Err(LoadError::LoaderPanicked) => self.get(&key)?,
                result => result?,
            };
            result.insert(key, value);
        }
        Ok(result)
    }

    /// Loads the keys whose placeholders this call installed, and publishes the
    /// results.
    fn load_owned(
        &self,
        owned: Vec<(Arc<K>, u64, TrioArc<Waiter<V>>)>,
        result: &mut HashMap<Arc<K>, Arc<V>>,
    ) -> Result<(), LoadError> {
        let inner = &self.inner;
        let loader = &inner.loader;
        let keys = owned.iter().map(|(k, ..)| Arc::clone(k)).collect::<Vec<_>>();

        let start = inner.clock.fast_now();
        // Catching panic is safe here as we do not try to evaluate the closure again.
        let bulk = catch_unwind(AssertUnwindSafe(|| loader.load_all(&keys)));
        let elapsed = inner.clock.fast_now().saturating_duration_since(start);
        let nanos = Instant::duration_to_saturating_nanoseconds(elapsed);

        match bulk {
            Err(payload) => {
                inner.stats.record_load_failure(nanos);
                for (key, generation, waiter) in owned {
                    inner.abandon_load(&key, generation, &waiter, LoadError::LoaderPanicked);
                }
                resume_unwind(payload)
            }
            // Bulk loading is not supported. Load the keys one by one. The loader
            // may request another key of this batch, in which case the nested
            // call takes over the load of that key.
            Ok(None) => {
                for (_, generation, waiter) in &owned {
                    waiter.defer(*generation);
                }

                let mut first_error = None;
                let mut owned = owned.into_iter();
                while let Some((key, _, waiter)) = owned.next() {
                    let generation = match waiter.claim() {
                        Some(generation) => generation,
                        // Loaded by a nested call.
                        None => {
                            match waiter.wait() {
                                Ok(value) => {
                                    result.insert(key, value);
                                }
                                Err(e) => {
                                    first_error.get_or_insert(e);
                                }
                            }
                            continue;
                        }
                    };
                    let init_result =
                        run_init(&inner.clock, &inner.stats, self.name(), || loader.load(&key));
                    match inner.finish_load(&key, generation, &waiter, init_result) {
                        InitResult::Initialized(value) => {
                            result.insert(key, value);
                        }
                        InitResult::InitErr(e) => {
                            first_error.get_or_insert(e);
                        }
                        InitResult::Panicked(payload) => {
                            for (key, _, waiter) in owned {
                                if let Some(generation) = waiter.claim() {
                                    inner.abandon_load(
                                        &key,
                                        generation,
                                        &waiter,
                                        LoadError::LoaderPanicked,
                                    );
                                }
                            }
                            resume_unwind(payload)
                        }
                    }
                }
                first_error.map_or(Ok(()), Err)
            }
            Ok(Some(Err(e))) => {
                inner.stats.record_load_failure(nanos);
                let error = LoadError::failed(e);
                for (key, generation, waiter) in owned {
                    inner.abandon_load(&key, generation, &waiter, error.clone());
                }
                Err(error)
            }
            Ok(Some(Ok(mut loaded))) => {
                inner.stats.record_load_success(nanos);
                let mut is_incomplete = false;
                for (key, generation, waiter) in owned {
                    match loaded.remove(key.as_ref()) {
                        Some(value) => {
                            let value = Arc::new(value);
                            inner.publish(&key, generation, &value);
                            waiter.set(Ok(Arc::clone(&value)));
                            result.insert(key, value);
                        }
                        None => {
                            is_incomplete = true;
                            inner.abandon_load(
                                &key,
                                generation,
                                &waiter,
                                LoadError::IncompleteBulkLoad,
                            );
                        }
                    }
                }

                // The extra entries would be unreachable with weak keys, and
                // collected at once with weak values.
                if !inner.weak_keys && inner.policy.value_strength() != ValueStrength::Weak {
                    for (key, value) in loaded {
                        self.put_if_absent(Arc::new(key), Arc::new(value));
                    }
                }

                if is_incomplete {
                    #[cfg(feature = "logging")]
                    log::warn!(
                        "{}The bulk loader did not return a value for every requested key",
                        inner.log_prefix()
                    );
                    return Err(LoadError::IncompleteBulkLoad);
                }
                Ok(())
            }
        }
    }

    /// Inserts or replaces the value, and returns the previous live value.
    pub(crate) fn put(&self, key: Arc<K>, value: Arc<V>) -> Option<Arc<V>> {
        let inner = &self.inner;
        let weight = inner.weigh(&key, &value);
        let lookup = inner.key_lookup(&key);
        let mut removals = Removals::new();

        let mut guard = inner.segment(lookup.hash).lock();
        let now = inner.clock.now();
        let previous = guard.put(&lookup, &key, &value, weight, now, &mut removals);
        guard.run_maintenance(now, Budget::batch(), &mut removals);
        inner.unlock_and_notify(guard, removals);
        previous
    }

    /// Inserts the value unless the key has a live value, which is returned
    /// instead.
    pub(crate) fn put_if_absent(&self, key: Arc<K>, value: Arc<V>) -> Option<Arc<V>> {
        let inner = &self.inner;
        let weight = inner.weigh(&key, &value);
        let lookup = inner.key_lookup(&key);
        let mut removals = Removals::new();

        let mut guard = inner.segment(lookup.hash).lock();
        let now = inner.clock.now();
        if let Some(existing) = guard.peek(&lookup, now) {
            return Some(existing);
        }
        guard.put(&lookup, &key, &value, weight, now, &mut removals);
        guard.run_maintenance(now, Budget::batch(), &mut removals);
        inner.unlock_and_notify(guard, removals);
        None
    }

    /// Removes the key, and returns its value if it was still reachable. A load
    /// in flight for the key is not cancelled, but its result is discarded.
    pub(crate) fn invalidate(&self, key: &K) -> Option<Arc<V>> {
        let inner = &self.inner;
        let lookup = inner.key_lookup(key);
        let mut removals = Removals::new();

        let mut guard = inner.segment(lookup.hash).lock();
        let removed = guard.remove(&lookup, RemovalCause::Explicit, &mut removals);
        guard.run_maintenance(inner.clock.now(), Budget::batch(), &mut removals);
        inner.unlock_and_notify(guard, removals);
        removed
    }

    pub(crate) fn invalidate_all(&self) {
        let inner = &self.inner;
        for segment in inner.segments.iter() {
            let mut removals = Removals::new();
            let mut guard = segment.lock();
            guard.clear(&mut removals);
            inner.unlock_and_notify(guard, removals);
        }
    }

    /// Reloads the value of `key` in the background. The current value stays
    /// readable until the reload completes. An absent key is loaded in the
    /// background.
    pub(crate) fn refresh(&self, key: Arc<K>) {
        let inner = &self.inner;
        let lookup = inner.key_lookup(&key);

        let (ticket, is_absent) = {
            let mut guard = inner.segment(lookup.hash).lock();
            let now = inner.clock.now();
            let ticket = guard.begin_refresh(&lookup, now);
            let is_absent = ticket.is_none()
                && !guard.is_loading(&lookup)
                && guard.peek(&lookup, now).is_none();
            (ticket, is_absent)
        };

        if let Some(ticket) = ticket {
            self.schedule_reload(ticket);
        } else if is_absent {
            let weak = Arc::downgrade(&self.inner);
            self.inner.refresher().execute(move || {
                if let Some(inner) = weak.upgrade() {
                    let cache = BaseCache { inner };
                    // Catching panic is safe here as the pool thread only reports it.
                    let result = catch_unwind(AssertUnwindSafe(|| cache.get(&key)));
                    if !matches!(result, Ok(Ok(_))) {
                        cache.inner.log_refresh_failure();
                    }
                }
            });
        }
    }

    fn schedule_reload(&self, ticket: RefreshTicket<K, V>) {
        let weak: Weak<Inner<K, V, S>> = Arc::downgrade(&self.inner);
        self.inner.refresher().execute(move || {
            if let Some(inner) = weak.upgrade() {
                inner.reload(ticket);
            }
        });
    }

    /// Runs a full maintenance pass on every segment, and makes sure that the
    /// queued removal notifications are being delivered.
    pub(crate) fn clean_up(&self) {
        let inner = &self.inner;
        for segment in inner.segments.iter() {
            let mut removals = Removals::new();
            let mut guard = segment.lock();
            let now = inner.clock.now();
            guard.run_maintenance(now, Budget::Unlimited, &mut removals);
            inner.unlock_and_notify(guard, removals);
        }
        if let Some(notifier) = &inner.removal_notifier {
            notifier.sync();
        }
    }

    pub(crate) fn reclaim_soft_values(&self) -> usize {
        let inner = &self.inner;
        let mut count = 0;
        for segment in inner.segments.iter() {
            let mut removals = Removals::new();
            let mut guard = segment.lock();
            count += guard.reclaim_soft_values(&mut removals);
            inner.unlock_and_notify(guard, removals);
        }
        count
    }

    /// Returns a snapshot of the live entries.
    pub(crate) fn live_entries(&self) -> Vec<(Arc<K>, Arc<V>)> {
        let inner = &self.inner;
        let mut entries = Vec::new();
        for segment in inner.segments.iter() {
            let guard = segment.lock();
            entries.extend(guard.live_entries(inner.clock.now()));
        }
        entries
    }
}

pub(crate) struct Inner<K, V, S> {
    name: Option<String>,
    segments: Box<[Segment<K, V>]>,
    segment_mask: usize,
    build_hasher: S,
    loader: Box<dyn CacheLoader<K, V>>,
    weigher: Option<Weigher<K, V>>,
    weak_keys: bool,
    removal_notifier: Option<RemovalNotifier<K, V>>,
    refresher: OnceCell<Refresher>,
    stats: StatsCounter,
    clock: Clock,
    policy: Policy,
}

impl<K, V, S> Inner<K, V, S>
where
    K: Hash + Eq + Send + Sync + 'static,
    V: Send + Sync + 'static,
    S: BuildHasher,
{
    fn new(config: CacheConfig<K, V>, loader: Box<dyn CacheLoader<K, V>>, build_hasher: S) -> Self {
        let max_weight = config.max_capacity.or(config.max_weight);
        let num_segments = num_segments(config.concurrency_level, max_weight);
        let n = num_segments as u64;
        let expiry = Expiry {
            time_to_live: config.time_to_live,
            time_to_idle: config.time_to_idle,
        };
        let value_strength = config.value_strength();

        let segments = (0..num_segments)
            .map(|i| {
                // The shares sum up to the configured maximum.
                let share = max_weight.map(|max| max / n + u64::from((i as u64) < max % n));
                Segment::new(SegmentConfig {
                    max_weight: share,
                    expiry,
                    refresh_after_write: config.refresh_after_write,
                    weak_keys: config.weak_keys,
                    value_strength,
                    initial_capacity: config.initial_capacity.map_or(0, |c| c / num_segments),
                })
            })
            .collect::<Box<[_]>>();

        let policy = Policy::new(
            config.max_capacity,
            config.max_weight,
            num_segments,
            config.time_to_live,
            config.time_to_idle,
            config.refresh_after_write,
            config.weak_keys,
            value_strength,
        );
        let removal_notifier = config.removal_listener.map(|listener| {
            RemovalNotifier::new(listener, config.delivery_mode, config.name.clone())
        });

        Self {
            name: config.name,
            segments,
            segment_mask: num_segments - 1,
            build_hasher,
            loader,
            weigher: config.weigher,
            weak_keys: config.weak_keys,
            removal_notifier,
            refresher: OnceCell::new(),
            stats: StatsCounter::default(),
            clock: config.clock,
            policy,
        }
    }

    fn hash<Q: Hash + ?Sized>(&self, key: &Q) -> u64 {
        let mut hasher = self.build_hasher.build_hasher();
        key.hash(&mut hasher);
        hasher.finish()
    }

    /// Weak keys are found by identity, so they are hashed by their address.
    fn key_lookup<'a>(&self, key: &'a K) -> KeyLookup<'a, K> {
        if self.weak_keys {
            let id = key_id(key);
            KeyLookup::by_id(self.hash(&id), id)
        } else {
            KeyLookup::by_value(self.hash(key), key)
        }
    }

    /// Picks the segment from the middle bits of the hash. The table of the
    /// segment uses the top and the bottom bits.
    fn segment(&self, hash: u64) -> &Segment<K, V> {
        &self.segments[((hash >> 32) as usize) & self.segment_mask]
    }

    fn weigh(&self, key: &K, value: &V) -> u32 {
        self.weigher.as_ref().map_or(1, |w| w(key, value))
    }

    fn refresher(&self) -> &Refresher {
        self.refresher.get_or_init(Refresher::new)
    }

    /// Releases the segment lock, then records and delivers the removals.
    ///
    /// Queued notifications are enqueued before the lock is released, so the
    /// notifications for a key keep the order of its removals.
    fn unlock_and_notify(
        &self,
        guard: MutexGuard<'_, SegmentInner<K, V>>,
        removals: Removals<K, V>,
    ) {
        for removed in &removals {
            self.stats.record_removal(removed.weight, removed.cause);
        }

        match &self.removal_notifier {
            Some(notifier) if !notifier.is_blocking() => {
                for r in removals {
                    notifier.notify(RemovalNotification::new(r.key, r.value, r.cause));
                }
                drop(guard);
            }
            Some(notifier) => {
                drop(guard);
                for r in removals {
                    notifier.notify(RemovalNotification::new(r.key, r.value, r.cause));
                }
            }
            None => {
                // Drop the removed values after releasing the lock.
                drop(guard);
                drop(removals);
            }
        }
    }

    fn wait_for(&self, waiter: &Waiter<V>) -> Result<Arc<V>, LoadError> {
        if waiter.is_owned_by_current_thread() {
            self.log_recursive_load();
            return Err(LoadError::RecursiveLoad);
        }
        waiter.wait()
    }

    /// Publishes the outcome of a load to the segment and to the waiters.
    fn finish_load(
        &self,
        key: &Arc<K>,
        generation: u64,
        waiter: &Waiter<V>,
        init_result: InitResult<V>,
    ) -> InitResult<Arc<V>> {
        match init_result {
            InitResult::Initialized(value) => {
                let value = Arc::new(value);
                self.publish(key, generation, &value);
                waiter.set(Ok(Arc::clone(&value)));
                InitResult::Initialized(value)
            }
            InitResult::InitErr(e) => {
                self.abandon_load(key, generation, waiter, e.clone());
                InitResult::InitErr(e)
            }
            InitResult::Panicked(payload) => {
                self.abandon_load(key, generation, waiter, LoadError::LoaderPanicked);
                InitResult::Panicked(payload)
            }
        }
    }

    /// Stores a loaded value. Nothing is stored if the key was invalidated or
    /// written while loading.
    fn publish(&self, key: &Arc<K>, generation: u64, value: &Arc<V>) {
        let weight = self.weigh(key, value);
        let lookup = self.key_lookup(key);
        let mut removals = Removals::new();

        let mut guard = self.segment(lookup.hash).lock();
        let now = self.clock.now();
        if guard.publish(&lookup, generation, value, weight, now, &mut removals) {
            guard.run_maintenance(now, Budget::batch(), &mut removals);
        }
        self.unlock_and_notify(guard, removals);
    }

    fn abandon_load(&self, key: &Arc<K>, generation: u64, waiter: &Waiter<V>, error: LoadError) {
        let lookup = self.key_lookup(key);
        self.segment(lookup.hash).lock().abandon(&lookup, generation);
        waiter.set(Err(error));
    }

    /// Runs on a refresher thread.
    fn reload(&self, ticket: RefreshTicket<K, V>) {
        let RefreshTicket {
            key,
            generation,
            old_value,
        } = ticket;
        let loader = &self.loader;
        let init_result = run_init(&self.clock, &self.stats, self.name.as_deref(), || {
            loader.reload(&key, &old_value)
        });

        let lookup = self.key_lookup(&key);
        let segment = self.segment(lookup.hash);
        match init_result {
            InitResult::Initialized(value) => {
                let value = Arc::new(value);
                let weight = self.weigh(&key, &value);
                let mut removals = Removals::new();

                let mut guard = segment.lock();
                let now = self.clock.now();
                if guard.replace_refreshed(&lookup, generation, &value, weight, now, &mut removals)
                {
                    guard.run_maintenance(now, Budget::batch(), &mut removals);
                }
                self.unlock_and_notify(guard, removals);
            }
            InitResult::InitErr(_) => {
                self.log_refresh_failure();
                segment.lock().cancel_refresh(&lookup, generation);
            }
            // Already logged by run_init.
            InitResult::Panicked(_) => segment.lock().cancel_refresh(&lookup, generation),
        }
    }
}

impl<K, V, S> Inner<K, V, S> {
    #[cfg(feature = "logging")]
    fn log_prefix(&self) -> String {
        self.name
            .as_ref()
            .map(|name| format!("[{name}] "))
            .unwrap_or_default()
    }

    fn log_recursive_load(&self) {
        #[cfg(feature = "logging")]
        log::error!(
            "{}Recursive load detected: the loader requested the key it is computing",
            self.log_prefix()
        );
    }

    fn log_refresh_failure(&self) {
        #[cfg(feature = "logging")]
        log::warn!(
            "{}A background refresh failed. Keeping the current value",
            self.log_prefix()
        );
    }
}

/// Takes over a load that a `get_all` on this thread reserved but has not
/// started, and returns its generation.
fn take_over<V>(waiter: &Waiter<V>) -> Option<u64> {
    if waiter.is_owned_by_current_thread() {
        waiter.claim()
    } else {
        None
    }
}

/// Returns the number of segments: a power of two that reaches the concurrency
/// level, unless a bounded cache would leave a segment fewer than
/// `MIN_SEGMENT_WEIGHT` units.
fn num_segments(concurrency_level: usize, max_weight: Option<u64>) -> usize {
    let mut n = 1_usize;
    while n < concurrency_level
        && max_weight.map_or(true, |max| (n as u64 * 2) * MIN_SEGMENT_WEIGHT <= max)
    {
        n *= 2;
    }
    n
}
