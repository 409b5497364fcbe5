use std::{
    fmt::{self, Debug},
    ops::Add,
};

/// An immutable snapshot of the statistics of a cache.
///
/// The counters are updated according to the following rules:
///
/// - When a lookup finds a live entry, `hit_count` is incremented.
/// - When a lookup does not find a live entry, `miss_count` is incremented. This
///   includes callers that join a load already in flight for the key.
///    - The caller that actually runs the loader increments `load_success_count`
///      or `load_failure_count`, and adds the time spent in the loader to
///      `total_load_time_nanos`. Background refreshes are counted the same way.
/// - When an entry is removed with the cause `Size`, `Expired` or `Collected`,
///   `eviction_count` is incremented and its weight is added to
///   `eviction_weight`.
/// - No counters are modified when an entry is invalidated or replaced by the
///   user.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct CacheStats {
    hit_count: u64,
    miss_count: u64,
    load_success_count: u64,
    load_failure_count: u64,
    total_load_time_nanos: u64,
    eviction_count: u64,
    eviction_weight: u64,
}

impl Debug for CacheStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CacheStats")
            .field("request_count", &self.request_count())
            .field("hit_count", &self.hit_count)
            .field("hit_rate", &self.hit_rate())
            .field("miss_count", &self.miss_count)
            .field("miss_rate", &self.miss_rate())
            .field("load_count", &self.load_count())
            .field("load_success_count", &self.load_success_count)
            .field("load_failure_count", &self.load_failure_count)
            .field("load_failure_rate", &self.load_failure_rate())
            .field("total_load_time_nanos", &self.total_load_time_nanos)
            .field(
                "average_load_penalty_nanos",
                &self.average_load_penalty_nanos(),
            )
            .field("eviction_count", &self.eviction_count)
            .field("eviction_weight", &self.eviction_weight)
            .finish()
    }
}

impl CacheStats {
    pub(crate) fn set_req_counts(&mut self, hit_count: u64, miss_count: u64) -> &mut Self {
        self.hit_count = hit_count;
        self.miss_count = miss_count;
        self
    }

    pub(crate) fn set_load_counts(
        &mut self,
        load_success_count: u64,
        load_failure_count: u64,
        total_load_time_nanos: u64,
    ) -> &mut Self {
        self.load_success_count = load_success_count;
        self.load_failure_count = load_failure_count;
        self.total_load_time_nanos = total_load_time_nanos;
        self
    }

    pub(crate) fn set_eviction_counts(
        &mut self,
        eviction_count: u64,
        eviction_weight: u64,
    ) -> &mut Self {
        self.eviction_count = eviction_count;
        self.eviction_weight = eviction_weight;
        self
    }

    pub fn request_count(&self) -> u64 {
        self.hit_count.saturating_add(self.miss_count)
    }

    pub fn hit_count(&self) -> u64 {
        self.hit_count
    }

    /// Returns `1.0` when no requests were made.
    pub fn hit_rate(&self) -> f64 {
        let req_count = self.request_count();
        if req_count == 0 {
            1.0
        } else {
            self.hit_count as f64 / req_count as f64
        }
    }

    pub fn miss_count(&self) -> u64 {
        self.miss_count
    }

    pub fn miss_rate(&self) -> f64 {
        let req_count = self.request_count();
        if req_count == 0 {
            0.0
        } else {
            self.miss_count as f64 / req_count as f64
        }
    }

    pub fn load_count(&self) -> u64 {
        self.load_success_count
            .saturating_add(self.load_failure_count)
    }

    pub fn load_success_count(&self) -> u64 {
        self.load_success_count
    }

    /// The number of times the loader returned an error or panicked.
    pub fn load_failure_count(&self) -> u64 {
        self.load_failure_count
    }

    pub fn load_failure_rate(&self) -> f64 {
        let load_count = self.load_count();
        if load_count == 0 {
            0.0
        } else {
            self.load_failure_count as f64 / load_count as f64
        }
    }

    pub fn total_load_time_nanos(&self) -> u64 {
        self.total_load_time_nanos
    }

    pub fn average_load_penalty_nanos(&self) -> f64 {
        let load_count = self.load_count();
        if load_count == 0 {
            0.0
        } else {
            self.total_load_time_nanos as f64 / load_count as f64
        }
    }

    pub fn eviction_count(&self) -> u64 {
        self.eviction_count
    }

    pub fn eviction_weight(&self) -> u64 {
        self.eviction_weight
    }
}

impl<'a> Add for &'a CacheStats {
    type Output = CacheStats;

    fn add(self, other: Self) -> CacheStats {
        CacheStats {
            hit_count: self.hit_count.saturating_add(other.hit_count),
            miss_count: self.miss_count.saturating_add(other.miss_count),
            load_success_count: self
                .load_success_count
                .saturating_add(other.load_success_count),
            load_failure_count: self
                .load_failure_count
                .saturating_add(other.load_failure_count),
            total_load_time_nanos: self
                .total_load_time_nanos
                .saturating_add(other.total_load_time_nanos),
            eviction_count: self.eviction_count.saturating_add(other.eviction_count),
            eviction_weight: self.eviction_weight.saturating_add(other.eviction_weight),
        }
    }
}
