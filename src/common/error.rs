use std::{error::Error, sync::Arc};

/// The error type a [`CacheLoader`][loader] returns when it fails to compute a
/// value.
///
/// [loader]: ./sync/trait.CacheLoader.html
pub type BoxError = Box<dyn Error + Send + Sync + 'static>;

/// The error type for the loading methods of the cache, such as
/// [`Cache::get`][get-method] and [`Cache::get_all`][get-all-method].
///
/// `LoadError` is cheap to clone; the same error is handed to every caller that
/// was waiting for the failed load.
///
/// [get-method]: ./sync/struct.Cache.html#method.get
/// [get-all-method]: ./sync/struct.Cache.html#method.get_all
#[derive(thiserror::Error, Debug, Clone)]
pub enum LoadError {
    /// The loader returned an error. The error is not cached; the next call for
    /// the same key will invoke the loader again.
    #[error("failed to load the value: {0}")]
    Failed(#[source] Arc<dyn Error + Send + Sync + 'static>),

    /// The loader for a key called back into the cache for the same key, on the
    /// same thread, while that key was still loading.
    #[error("recursive load detected: the loader requested the key it is computing")]
    RecursiveLoad,

    /// The bulk loader did not return a value for one of the requested keys.
    #[error("the bulk loader did not return a value for a requested key")]
    IncompleteBulkLoad,

    /// The loader panicked while another caller was waiting for its result.
    #[error("the loader panicked while computing the value")]
    LoaderPanicked,
}

impl LoadError {
    pub(crate) fn failed(error: BoxError) -> Self {
        Self::Failed(Arc::from(error))
    }

    /// Returns `true` if this error was produced by the loader itself.
    pub fn is_loader_failure(&self) -> bool {
        matches!(self, Self::Failed(_))
    }
}

/// The error type returned when a cache is constructed with an invalid
/// [`CacheConfig`][config].
///
/// [config]: ./sync/struct.CacheConfig.html
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("max_capacity and max_weight cannot be set at the same time")]
    SizeAndWeightBothSet,

    #[error("a weigher requires max_weight to be set")]
    WeigherWithoutMaxWeight,

    #[error("max_weight requires a weigher to be set")]
    MaxWeightWithoutWeigher,

    #[error("weak_values and soft_values cannot be set at the same time")]
    WeakAndSoftValues,

    #[error("time_to_live must be longer than zero")]
    ZeroTimeToLive,

    #[error("time_to_idle must be longer than zero")]
    ZeroTimeToIdle,

    #[error("refresh_after_write must be longer than zero")]
    ZeroRefreshInterval,

    #[error("concurrency_level must be greater than zero")]
    ZeroConcurrencyLevel,

    #[error("{0} is longer than 1000 years")]
    DurationTooLong(&'static str),
}
