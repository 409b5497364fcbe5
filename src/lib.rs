#![warn(clippy::all)]
#![warn(rust_2018_idioms)]

//! `loadcache` is a bounded, concurrent, self-loading in-memory cache library.
//!
//! A cache is created with a _loader_: a function (or a [`CacheLoader`][loader]
//! implementation) that computes the value of a key. Reading a key that is not
//! cached calls the loader, stores the value and returns it. Concurrent reads of
//! the same missing key call the loader only once.
//!
//! # Features
//!
//! - Thread-safe, segmented storage. Each segment is guarded by its own lock; the
//!   loader never runs while a lock is held.
//! - At most one load per key at a time, with detection of recursive loads and
//!   bulk loading through [`CacheLoader::load_all`][load-all].
//! - Size-based eviction of the least recently used entries, bounded by the
//!   number of entries or by their total weight.
//! - Expiration policies:
//!   - Time to live
//!   - Time to idle
//! - Refresh after write: stale entries are reloaded in the background while
//!   readers keep getting the current value.
//! - Weak keys, weak values and soft values.
//! - Removal listener, called immediately or from a worker thread, with the
//!   [`RemovalCause`][cause] of each removal.
//! - Hit, miss, load and eviction statistics.
//!
//! # Example
//!
//! ```rust
//! use loadcache::sync::{from_fn, Cache};
//! use std::time::Duration;
//!
//! let cache = Cache::builder()
//!     .max_capacity(10_000)
//!     .time_to_live(Duration::from_secs(30 * 60))
//!     .build(from_fn(|id: &u64| Ok(format!("user-{id}"))))
//!     .unwrap();
//!
//! // The first get() calls the loader.
//! assert_eq!(*cache.get(42).unwrap(), "user-42");
//! // The second one is a hit.
//! assert_eq!(*cache.get(42).unwrap(), "user-42");
//!
//! let stats = cache.stats();
//! assert_eq!(stats.hit_count(), 1);
//! assert_eq!(stats.load_success_count(), 1);
//! ```
//!
//! # Minimum Supported Rust Versions
//!
//! This crate's minimum supported Rust version (MSRV) is 1.65.
//!
//! [loader]: ./sync/trait.CacheLoader.html
//! [load-all]: ./sync/trait.CacheLoader.html#method.load_all
//! [cause]: ./notification/enum.RemovalCause.html

pub(crate) mod common;
pub mod notification;
pub(crate) mod policy;
pub(crate) mod stats;
pub mod sync;

pub use common::{
    error::{BoxError, ConfigError, LoadError},
    time::{Clock, Mock},
    Weigher,
};
pub use notification::{DeliveryMode, RemovalCause, RemovalListener, RemovalNotification};
pub use policy::{Policy, ValueStrength};
pub use stats::CacheStats;
