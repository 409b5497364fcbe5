use super::CacheStats;
use crate::notification::RemovalCause;

use std::sync::atomic::{AtomicUsize, Ordering};

use crossbeam_utils::{atomic::AtomicCell, CachePadded};
use once_cell::sync::Lazy;

fn saturating_add(counter: &AtomicCell<u64>, value: u64) {
    let mut v0 = counter.load();
    loop {
        let v1 = v0.saturating_add(value);
        match counter.compare_exchange(v0, v1) {
            Ok(_) => break,
            Err(v2) => v0 = v2,
        }
    }
}

#[derive(Default)]
struct Counters {
    hit_count: AtomicCell<u64>,
    miss_count: AtomicCell<u64>,
    load_success_count: AtomicCell<u64>,
    load_failure_count: AtomicCell<u64>,
    total_load_time_nanos: AtomicCell<u64>,
    eviction_count: AtomicCell<u64>,
    eviction_weight: AtomicCell<u64>,
}

impl Counters {
    fn snapshot(&self) -> CacheStats {
        let mut stats = CacheStats::default();
        stats
            .set_req_counts(self.hit_count.load(), self.miss_count.load())
            .set_load_counts(
                self.load_success_count.load(),
                self.load_failure_count.load(),
                self.total_load_time_nanos.load(),
            )
            .set_eviction_counts(self.eviction_count.load(), self.eviction_weight.load());
        stats
    }
}

/// Lock-free statistics counters, striped across the processors to reduce
/// contention on the cache lines.
pub(crate) struct StatsCounter {
    counters: Box<[CachePadded<Counters>]>,
}

static NUM_COUNTERS: Lazy<usize> = Lazy::new(crate::common::num_cpus);

impl Default for StatsCounter {
    fn default() -> Self {
        let counters = std::iter::repeat_with(Counters::default)
            .map(CachePadded::new)
            .take(*NUM_COUNTERS)
            .collect::<Vec<_>>()
            .into_boxed_slice();
        Self { counters }
    }
}

impl StatsCounter {
    /// Returns the counters for the current thread.
    fn counter(&self) -> &Counters {
        thread_local! { static MY_INDEX: usize = next_index() };
        MY_INDEX.with(|i| &self.counters[*i % self.counters.len()])
    }

    pub(crate) fn record_hits(&self, count: u32) {
        saturating_add(&self.counter().hit_count, count as u64);
    }

    pub(crate) fn record_misses(&self, count: u32) {
        saturating_add(&self.counter().miss_count, count as u64);
    }

    pub(crate) fn record_load_success(&self, load_time_nanos: u64) {
        let c = self.counter();
        saturating_add(&c.load_success_count, 1);
        saturating_add(&c.total_load_time_nanos, load_time_nanos);
    }

    pub(crate) fn record_load_failure(&self, load_time_nanos: u64) {
        let c = self.counter();
        saturating_add(&c.load_failure_count, 1);
        saturating_add(&c.total_load_time_nanos, load_time_nanos);
    }

    /// Increments the `eviction_count` and `eviction_weight` only when the `cause`
    /// is `Size`, `Expired` or `Collected`.
    pub(crate) fn record_removal(&self, weight: u32, cause: RemovalCause) {
        if cause.was_evicted() {
            let c = self.counter();
            saturating_add(&c.eviction_count, 1);
            saturating_add(&c.eviction_weight, weight as u64);
        }
    }

    pub(crate) fn snapshot(&self) -> CacheStats {
        self.counters
            .iter()
            .fold(CacheStats::default(), |acc, c| &acc + &c.snapshot())
    }
}

fn next_index() -> usize {
    static INDEX: AtomicUsize = AtomicUsize::new(0);
    INDEX.fetch_add(1, Ordering::Relaxed) % *NUM_COUNTERS
}

#[cfg(test)]
mod tests {
    use super::StatsCounter;
    use crate::notification::RemovalCause;
    use std::{sync::Arc, thread};

    #[test]
    fn counts_from_many_threads() {
        let counter = Arc::new(StatsCounter::default());
        let handles = (0..8)
            .map(|_| {
                let counter = Arc::clone(&counter);
                thread::spawn(move || {
                    for _ in 0..1_000 {
                        counter.record_hits(1);
                    }
                    counter.record_misses(2);
                    counter.record_load_success(10);
                    counter.record_load_failure(30);
                })
            })
            .collect::<Vec<_>>();
        handles.into_iter().for_each(|h| h.join().expect("thread panicked"));

        let stats = counter.snapshot();
        assert_eq!(stats.hit_count(), 8_000);
        assert_eq!(stats.miss_count(), 16);
        assert_eq!(stats.load_success_count(), 8);
        assert_eq!(stats.load_failure_count(), 8);
        assert_eq!(stats.total_load_time_nanos(), 320);
    }

    #[test]
    fn only_evictions_are_recorded() {
        let counter = StatsCounter::default();
        counter.record_removal(3, RemovalCause::Explicit);
        counter.record_removal(3, RemovalCause::Replaced);
        counter.record_removal(1, RemovalCause::Size);
        counter.record_removal(2, RemovalCause::Expired);
        counter.record_removal(4, RemovalCause::Collected);

        let stats = counter.snapshot();
        assert_eq!(stats.eviction_count(), 3);
        assert_eq!(stats.eviction_weight(), 7);
    }
}
