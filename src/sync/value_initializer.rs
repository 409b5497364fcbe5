use parking_lot::{Condvar, Mutex};
use std::{
    any::Any,
    panic::{catch_unwind, AssertUnwindSafe},
    sync::Arc,
    thread::{self, ThreadId},
};

use crate::{
    common::{error::BoxError, time::Clock},
    stats::stats_counter::StatsCounter,
    LoadError,
};

type WaiterValue<V> = Option<Result<Arc<V>, LoadError>>;

/// The handle shared by the thread that runs a load and the threads that wait
/// for its result. Stored in the `Loading` slot of the key's bucket.
pub(crate) struct Waiter<V> {
    owner: ThreadId,
    /// The generation of a reserved load that has not started yet. The owner
    /// thread may take the load over from a nested call.
    deferred: Mutex<Option<u64>>,
    value: Mutex<WaiterValue<V>>,
    cond: Condvar,
}

impl<V> Waiter<V> {
    pub(crate) fn new() -> Self {
        Self {
            owner: thread::current().id(),
            deferred: Mutex::new(None),
            value: Mutex::new(None),
            cond: Condvar::new(),
        }
    }

    /// Marks the reserved load as not started.
    pub(crate) fn defer(&self, generation: u64) {
        *self.deferred.lock() = Some(generation);
    }

    /// Starts a deferred load, and returns its generation. Returns `None` if the
    /// load was not deferred, or was started already.
    pub(crate) fn claim(&self) -> Option<u64> {
        self.deferred.lock().take()
    }

    /// Returns `true` if the current thread is the one running the load. Waiting
    /// on our own load would never return.
    pub(crate) fn is_owned_by_current_thread(&self) -> bool {
        self.owner == thread::current().id()
    }

    /// Blocks until the owner publishes the result.
    pub(crate) fn wait(&self) -> Result<Arc<V>, LoadError> {
        let mut lock = self.value.lock();
        loop {
            if let Some(result) = &*lock {
                return result.clone();
            }
            self.cond.wait(&mut lock);
        }
    }

    pub(crate) fn set(&self, result: Result<Arc<V>, LoadError>) {
        *self.value.lock() = Some(result);
        self.cond.notify_all();
    }
}

pub(crate) enum InitResult<V> {
    Initialized(V),
    InitErr(LoadError),
    Panicked(Box<dyn Any + Send + 'static>),
}

/// Runs the `init` closure, catching a panic, and records the outcome and the
/// time spent in the statistics.
pub(crate) fn run_init<V>(
    clock: &Clock,
    stats: &StatsCounter,
    _cache_name: Option<&str>,
    init: impl FnOnce() -> Result<V, BoxError>,
) -> InitResult<V> {
    let start = clock.fast_now();
    // Catching panic is safe here as we do not try to evaluate the closure again.
    let result = catch_unwind(AssertUnwindSafe(init));
    let elapsed = clock.fast_now().saturating_duration_since(start);
    let nanos = crate::common::time::Instant::duration_to_saturating_nanoseconds(elapsed);

    match result {
        Ok(Ok(value)) => {
            stats.record_load_success(nanos);
            InitResult::Initialized(value)
        }
        Ok(Err(e)) => {
            stats.record_load_failure(nanos);
            InitResult::InitErr(LoadError::failed(e))
        }
        Err(payload) => {
            stats.record_load_failure(nanos);
            #[cfg(feature = "logging")]
            {
                let cn = _cache_name
                    .map(|name| format!("[{name}] "))
                    .unwrap_or_default();
                log::warn!("{cn}The loader panicked");
            }
            InitResult::Panicked(payload)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{run_init, InitResult, Waiter};
    use crate::{common::time::Clock, stats::stats_counter::StatsCounter, LoadError};
    use std::{
        sync::Arc,
        thread,
        time::Duration,
    };

    #[test]
    fn waiters_receive_the_published_value() {
        let waiter = Arc::new(Waiter::<u32>::new());
        assert!(waiter.is_owned_by_current_thread());

        let handles = (0..4)
            .map(|_| {
                let waiter = Arc::clone(&waiter);
                thread::spawn(move || {
                    assert!(!waiter.is_owned_by_current_thread());
                    waiter.wait().map(|v| *v)
                })
            })
            .collect::<Vec<_>>();

        thread::sleep(Duration::from_millis(20));
        waiter.set(Ok(Arc::new(7)));

        for h in handles {
            assert_eq!(h.join().expect("thread panicked").ok(), Some(7));
        }
        // Late waiters get the result too.
        assert_eq!(waiter.wait().ok().as_deref(), Some(&7));
    }

    #[test]
    fn deferred_load_is_claimed_once() {
        let waiter = Waiter::<u32>::new();
        assert_eq!(waiter.claim(), None);

        waiter.defer(3);
        assert_eq!(waiter.claim(), Some(3));
        assert_eq!(waiter.claim(), None);
    }

    #[test]
    fn waiters_receive_the_error() {
        let waiter = Waiter::<u32>::new();
        waiter.set(Err(LoadError::LoaderPanicked));
        assert!(matches!(waiter.wait(), Err(LoadError::LoaderPanicked)));
    }

    #[test]
    fn run_init_records_stats() {
        let (clock, _mock) = Clock::mock();
        let stats = StatsCounter::default();

        let r = run_init(&clock, &stats, None, || Ok(1));
        assert!(matches!(r, InitResult::Initialized(1)));

        let r = run_init::<u32>(&clock, &stats, None, || Err("boom".into()));
        assert!(matches!(r, InitResult::InitErr(LoadError::Failed(_))));

        let r = run_init::<u32>(&clock, &stats, None, || panic!("boom"));
        assert!(matches!(r, InitResult::Panicked(_)));

        let snapshot = stats.snapshot();
        assert_eq!(snapshot.load_success_count(), 1);
        assert_eq!(snapshot.load_failure_count(), 2);
    }
}
