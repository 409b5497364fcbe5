pub(crate) mod builder_utils;
pub(crate) mod concurrent;
pub(crate) mod deque;
pub(crate) mod error;
pub(crate) mod time;

use std::{num::NonZeroUsize, thread::available_parallelism};

/// A weigher closure takes `&K` and `&V` and returns the relative size of the
/// entry as a `u32`.
pub type Weigher<K, V> = std::sync::Arc<dyn Fn(&K, &V) -> u32 + Send + Sync + 'static>;

pub(crate) fn num_cpus() -> usize {
    available_parallelism().map(NonZeroUsize::get).unwrap_or(1)
}
