//! Provides a thread-safe, concurrent, self-loading cache.

pub(crate) mod base_cache;
mod builder;
mod cache;
pub(crate) mod entry;
pub(crate) mod housekeeper;
mod loader;
mod map_view;
mod refresher;
pub(crate) mod segment;
pub(crate) mod value_initializer;

pub use {
    builder::{CacheBuilder, CacheConfig},
    cache::Cache,
    loader::{from_fn, CacheLoader, FnLoader},
    map_view::MapView,
};
