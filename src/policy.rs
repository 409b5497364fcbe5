use std::time::Duration;

/// The reference strength of the values of a cache.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ValueStrength {
    /// The cache keeps the values alive.
    Strong,
    /// The cache holds `Weak` references; an entry is removed with
    /// `RemovalCause::Collected` once its value is dropped everywhere else.
    Weak,
    /// The cache keeps the values alive until `reclaim_soft_values` is called,
    /// which removes the values that no one else holds.
    Soft,
}

#[derive(Clone, Debug)]
/// The policy of a cache, as it was configured at construction.
pub struct Policy {
    max_capacity: Option<u64>,
    max_weight: Option<u64>,
    num_segments: usize,
    time_to_live: Option<Duration>,
    time_to_idle: Option<Duration>,
    refresh_after_write: Option<Duration>,
    weak_keys: bool,
    value_strength: ValueStrength,
}

impl Policy {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        max_capacity: Option<u64>,
        max_weight: Option<u64>,
        num_segments: usize,
        time_to_live: Option<Duration>,
        time_to_idle: Option<Duration>,
        refresh_after_write: Option<Duration>,
        weak_keys: bool,
        value_strength: ValueStrength,
    ) -> Self {
        Self {
            max_capacity,
            max_weight,
            num_segments,
            time_to_live,
            time_to_idle,
            refresh_after_write,
            weak_keys,
            value_strength,
        }
    }

    /// Returns the `max_capacity` (maximum number of entries) of the cache.
    pub fn max_capacity(&self) -> Option<u64> {
        self.max_capacity
    }

    /// Returns the `max_weight` of the cache.
    pub fn max_weight(&self) -> Option<u64> {
        self.max_weight
    }

    /// Returns the number of internal segments of the cache.
    pub fn num_segments(&self) -> usize {
        self.num_segments
    }

    pub fn time_to_live(&self) -> Option<Duration> {
        self.time_to_live
    }

    pub fn time_to_idle(&self) -> Option<Duration> {
        self.time_to_idle
    }

    pub fn refresh_after_write(&self) -> Option<Duration> {
        self.refresh_after_write
    }

    /// Returns `true` if keys are held weakly and compared by identity.
    pub fn weak_keys(&self) -> bool {
        self.weak_keys
    }

    pub fn value_strength(&self) -> ValueStrength {
        self.value_strength
    }
}
