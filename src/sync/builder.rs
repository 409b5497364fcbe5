use super::{Cache, CacheLoader};
use crate::{
    common::{builder_utils::ensure_duration, concurrent::constants::DEFAULT_CONCURRENCY_LEVEL},
    notification::{DeliveryMode, RemovalListener, RemovalNotification},
    policy::ValueStrength,
    Clock, ConfigError, Weigher,
};

use std::{
    collections::hash_map::RandomState,
    fmt,
    hash::{BuildHasher, Hash},
    sync::Arc,
    time::Duration,
};

/// The complete configuration of a [`Cache`][cache-struct]. Validated once by
/// [`Cache::with_config`][with-config].
///
/// Start from `CacheConfig::default()` (unbounded, no expiration, strong keys and
/// values) and set the fields you need, or use the fluent
/// [`CacheBuilder`][builder-struct].
///
/// [cache-struct]: ./struct.Cache.html
/// [with-config]: ./struct.Cache.html#method.with_config
/// [builder-struct]: ./struct.CacheBuilder.html
pub struct CacheConfig<K, V> {
    /// The name of the cache. Used in log messages.
    pub name: Option<String>,
    /// The maximum number of entries. Mutually exclusive with `max_weight`.
    pub max_capacity: Option<u64>,
    /// The maximum total weight of the entries, as measured by `weigher`.
    pub max_weight: Option<u64>,
    pub weigher: Option<Weigher<K, V>>,
    /// Entries expire this long after they were written.
    pub time_to_live: Option<Duration>,
    /// Entries expire this long after they were last read or written.
    pub time_to_idle: Option<Duration>,
    /// Reads of entries older than this (by write time) trigger a background
    /// reload, and keep returning the current value meanwhile.
    pub refresh_after_write: Option<Duration>,
    pub weak_keys: bool,
    pub weak_values: bool,
    pub soft_values: bool,
    pub removal_listener: Option<RemovalListener<K, V>>,
    pub delivery_mode: DeliveryMode,
    /// A hint for the number of segments.
    pub concurrency_level: usize,
    pub initial_capacity: Option<usize>,
    pub clock: Clock,
}

impl<K, V> Default for CacheConfig<K, V> {
    fn default() -> Self {
        Self {
            name: None,
            max_capacity: None,
            max_weight: None,
            weigher: None,
            time_to_live: None,
            time_to_idle: None,
            refresh_after_write: None,
            weak_keys: false,
            weak_values: false,
            soft_values: false,
            removal_listener: None,
            delivery_mode: DeliveryMode::default(),
            concurrency_level: DEFAULT_CONCURRENCY_LEVEL,
            initial_capacity: None,
            clock: Clock::default(),
        }
    }
}

impl<K, V> Clone for CacheConfig<K, V> {
    fn clone(&self) -> Self {
        Self {
            name: self.name.clone(),
            weigher: self.weigher.clone(),
            removal_listener: self.removal_listener.clone(),
            clock: self.clock.clone(),
            ..*self
        }
    }
}

impl<K, V> fmt::Debug for CacheConfig<K, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CacheConfig")
            .field("name", &self.name)
            .field("max_capacity", &self.max_capacity)
            .field("max_weight", &self.max_weight)
            .field("weigher", &self.weigher.as_ref().map(|_| ".."))
            .field("time_to_live", &self.time_to_live)
            .field("time_to_idle", &self.time_to_idle)
            .field("refresh_after_write", &self.refresh_after_write)
            .field("weak_keys", &self.weak_keys)
            .field("weak_values", &self.weak_values)
            .field("soft_values", &self.soft_values)
            .field(
                "removal_listener",
                &self.removal_listener.as_ref().map(|_| ".."),
            )
            .field("delivery_mode", &self.delivery_mode)
            .field("concurrency_level", &self.concurrency_level)
            .field("initial_capacity", &self.initial_capacity)
            .field("clock", &self.clock)
            .finish()
    }
}

impl<K, V> CacheConfig<K, V> {
    pub(crate) fn validate(&self) -> Result<(), ConfigError> {
        if self.max_capacity.is_some() && self.max_weight.is_some() {
            return Err(ConfigError::SizeAndWeightBothSet);
        }
        match (&self.weigher, self.max_weight) {
            (Some(_), None) => return Err(ConfigError::WeigherWithoutMaxWeight),
            (None, Some(_)) => return Err(ConfigError::MaxWeightWithoutWeigher),
            _ => (),
        }
        if self.weak_values && self.soft_values {
            return Err(ConfigError::WeakAndSoftValues);
        }
        if self.concurrency_level == 0 {
            return Err(ConfigError::ZeroConcurrencyLevel);
        }
        ensure_duration(
            "time_to_live",
            self.time_to_live,
            ConfigError::ZeroTimeToLive,
        )?;
        ensure_duration(
            "time_to_idle",
            self.time_to_idle,
            ConfigError::ZeroTimeToIdle,
        )?;
        ensure_duration(
            "refresh_after_write",
            self.refresh_after_write,
            ConfigError::ZeroRefreshInterval,
        )
    }

    pub(crate) fn value_strength(&self) -> ValueStrength {
        if self.weak_values {
            ValueStrength::Weak
        } else if self.soft_values {
            ValueStrength::Soft
        } else {
            ValueStrength::Strong
        }
    }
}

/// Builds a [`Cache`][cache-struct] with various configuration knobs.
///
/// [cache-struct]: ./struct.Cache.html
///
/// # Examples
///
/// ```rust
/// use loadcache::sync::{from_fn, Cache};
/// use std::time::Duration;
///
/// let cache = Cache::builder()
///     // Max 10,000 entries
///     .max_capacity(10_000)
///     // Time to live (TTL): 30 minutes
///     .time_to_live(Duration::from_secs(30 * 60))
///     // Time to idle (TTI):  5 minutes
///     .time_to_idle(Duration::from_secs(5 * 60))
///     // Create the cache.
///     .build(from_fn(|key: &u64| Ok(key.to_string())))
///     .unwrap();
///
/// // This entry will expire after 5 minutes (TTI) if there is no get().
/// let zero = cache.get(0).unwrap();
/// assert_eq!(*zero, "0");
///
/// // This get() will extend the entry life for another 5 minutes.
/// cache.get(0).unwrap();
///
/// // Even though we keep calling get(), the entry will expire
/// // after 30 minutes (TTL) from the first get().
/// ```
#[must_use]
pub struct CacheBuilder<K, V> {
    config: CacheConfig<K, V>,
}

impl<K, V> Default for CacheBuilder<K, V> {
    fn default() -> Self {
        Self {
            config: CacheConfig::default(),
        }
    }
}

impl<K, V> CacheBuilder<K, V>
where
    K: Eq + Hash + Send + Sync + 'static,
    V: Send + Sync + 'static,
{
    /// Construct a new `CacheBuilder` that will be used to build a `Cache`
    /// holding up to `max_capacity` entries.
    pub fn new(max_capacity: u64) -> Self {
        Self::default().max_capacity(max_capacity)
    }

    /// Builds a `Cache<K, V>` that computes missing values with `loader`.
    ///
    /// # Errors
    ///
    /// Returns a [`ConfigError`](../enum.ConfigError.html) if the configuration is
    /// invalid, e.g. both `max_capacity` and `max_weight` are set.
    pub fn build(
        self,
        loader: impl CacheLoader<K, V>,
    ) -> Result<Cache<K, V, RandomState>, ConfigError> {
        Cache::with_config(self.config, loader)
    }

    /// Builds a `Cache<K, V, S>` with the given `hasher`.
    ///
    /// # Errors
    ///
    /// Returns a [`ConfigError`](../enum.ConfigError.html) if the configuration is
    /// invalid.
    pub fn build_with_hasher<S>(
        self,
        loader: impl CacheLoader<K, V>,
        hasher: S,
    ) -> Result<Cache<K, V, S>, ConfigError>
    where
        S: BuildHasher + Clone + Send + Sync + 'static,
    {
        Cache::with_config_and_hasher(self.config, loader, hasher)
    }
}

impl<K, V> CacheBuilder<K, V> {
    /// Sets the name of the cache. Log messages of the cache will be prefixed by
    /// the name.
    pub fn name(mut self, name: &str) -> Self {
        self.config.name = Some(name.to_string());
        self
    }

    /// Sets the max capacity of the cache, in number of entries.
    pub fn max_capacity(mut self, max_capacity: u64) -> Self {
        self.config.max_capacity = Some(max_capacity);
        self
    }

    /// Sets the max total weight of the cache. Requires a `weigher`.
    pub fn max_weight(mut self, max_weight: u64) -> Self {
        self.config.max_weight = Some(max_weight);
        self
    }

    /// Sets the initial capacity (number of entries) of the cache.
    pub fn initial_capacity(mut self, number_of_entries: usize) -> Self {
        self.config.initial_capacity = Some(number_of_entries);
        self
    }

    /// Sets the weigher closure to the cache.
    ///
    /// The closure should take `&K` and `&V` as the arguments and return a `u32`
    /// representing the relative size of the entry.
    pub fn weigher(mut self, weigher: impl Fn(&K, &V) -> u32 + Send + Sync + 'static) -> Self {
        self.config.weigher = Some(Arc::new(weigher));
        self
    }

    /// Sets the time to live of the cache.
    ///
    /// A cached entry will be expired after the specified duration past from
    /// `put` or load.
    pub fn time_to_live(mut self, duration: Duration) -> Self {
        self.config.time_to_live = Some(duration);
        self
    }

    /// Sets the time to idle of the cache.
    ///
    /// A cached entry will be expired after the specified duration past from
    /// `get` or `put`.
    pub fn time_to_idle(mut self, duration: Duration) -> Self {
        self.config.time_to_idle = Some(duration);
        self
    }

    /// Sets the refresh interval of the cache.
    ///
    /// The first read of an entry older than `duration` (by write time) returns
    /// the current value and triggers a reload on a background thread.
    pub fn refresh_after_write(mut self, duration: Duration) -> Self {
        self.config.refresh_after_write = Some(duration);
        self
    }

    /// Holds the keys weakly. Keys are then compared by identity, so callers
    /// should keep and reuse the `Arc<K>` they inserted.
    pub fn weak_keys(mut self) -> Self {
        self.config.weak_keys = true;
        self
    }

    /// Holds the values weakly.
    pub fn weak_values(mut self) -> Self {
        self.config.weak_values = true;
        self
    }

    /// Holds the values softly. See `Cache::reclaim_soft_values`.
    pub fn soft_values(mut self) -> Self {
        self.config.soft_values = true;
        self
    }

    /// Sets the removal listener closure, and delivers the notifications with
    /// the given `mode`.
    pub fn removal_listener(
        mut self,
        listener: impl Fn(RemovalNotification<K, V>) + Send + Sync + 'static,
        mode: DeliveryMode,
    ) -> Self {
        self.config.removal_listener = Some(Arc::new(listener));
        self.config.delivery_mode = mode;
        self
    }

    /// Sets the hint for the number of segments. Defaults to 4.
    pub fn concurrency_level(mut self, level: usize) -> Self {
        self.config.concurrency_level = level;
        self
    }

    /// Sets the clock of the cache. Mostly useful with `Clock::mock` in tests.
    pub fn clock(mut self, clock: Clock) -> Self {
        self.config.clock = clock;
        self
    }

    /// Returns the configuration filled so far.
    pub fn config(&self) -> &CacheConfig<K, V> {
        &self.config
    }
}
