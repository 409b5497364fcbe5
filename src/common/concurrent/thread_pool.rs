use once_cell::sync::Lazy;
use parking_lot::{RwLock, RwLockUpgradableReadGuard};
use scheduled_thread_pool::ScheduledThreadPool;
use std::{collections::HashMap, sync::Arc};

static REGISTRY: Lazy<ThreadPoolRegistry> = Lazy::new(ThreadPoolRegistry::default);

#[derive(Clone, Copy, Hash, PartialEq, Eq, PartialOrd, Ord, Debug)]
pub(crate) enum PoolName {
    RemovalNotifier,
    Refresher,
}

impl PoolName {
    fn thread_name_template(&self) -> &'static str {
        match self {
            PoolName::RemovalNotifier => "loadcache-notifier-{}",
            PoolName::Refresher => "loadcache-refresher-{}",
        }
    }
}

pub(crate) struct ThreadPool {
    pub(crate) name: PoolName,
    pub(crate) pool: ScheduledThreadPool,
}

impl ThreadPool {
    fn new(name: PoolName, num_threads: usize) -> Self {
        let pool = ScheduledThreadPool::builder()
            .num_threads(num_threads)
            .thread_name_pattern(name.thread_name_template())
            .build();
        Self { name, pool }
    }
}

/// Worker pools are shared by all caches in the process. A pool is created on
/// the first `acquire_pool` and dropped when the last cache releases it.
#[derive(Default)]
pub(crate) struct ThreadPoolRegistry {
    pools: RwLock<HashMap<PoolName, Arc<ThreadPool>>>,
}

impl ThreadPoolRegistry {
    pub(crate) fn acquire_pool(name: PoolName) -> Arc<ThreadPool> {
        let pools = REGISTRY.pools.upgradable_read();
        if let Some(pool) = pools.get(&name) {
            return Arc::clone(pool);
        }
        let mut pools = RwLockUpgradableReadGuard::upgrade(pools);
        let pool = pools
            .entry(name)
            .or_insert_with(|| Arc::new(ThreadPool::new(name, crate::common::num_cpus())));
        Arc::clone(pool)
    }

    /// Drops the registry's pool once `pool` and the registry hold the only
    /// references to it.
    pub(crate) fn release_pool(pool: &Arc<ThreadPool>) {
        let mut pools = REGISTRY.pools.write();
        let unused = pools
            .get(&pool.name)
            .map_or(false, |p| Arc::ptr_eq(p, pool) && Arc::strong_count(p) <= 2);
        if unused {
            pools.remove(&pool.name);
        }
    }
}
