use std::sync::Arc;

use crate::common::concurrent::thread_pool::{PoolName, ThreadPool, ThreadPoolRegistry};

/// Runs background reloads on the shared refresher pool. The pool is acquired
/// when the first refresh of a cache is scheduled.
pub(crate) struct Refresher {
    thread_pool: Arc<ThreadPool>,
}

impl Drop for Refresher {
    fn drop(&mut self) {
        ThreadPoolRegistry::release_pool(&self.thread_pool);
    }
}

impl Refresher {
    pub(crate) fn new() -> Self {
        Self {
            thread_pool: ThreadPoolRegistry::acquire_pool(PoolName::Refresher),
        }
    }

    pub(crate) fn execute(&self, job: impl FnOnce() + Send + 'static) {
        self.thread_pool.pool.execute(job);
    }
}
