use std::time::Duration;

pub(crate) mod clock;

pub use clock::{Clock, Mock};

pub(crate) const MAX_NANOS: u64 = u64::MAX - 1;

/// `Instant` represents a point in time since the `Clock` was created. It has
/// nanosecond precision.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub(crate) struct Instant {
    elapsed_ns: u64,
}

impl Instant {
    pub(crate) fn from_nanos(nanos: u64) -> Instant {
        debug_assert!(nanos <= MAX_NANOS);
        Instant { elapsed_ns: nanos }
    }

    pub(crate) fn from_duration_since_clock_start(duration: Duration) -> Instant {
        Instant::from_nanos(Self::duration_to_saturating_nanoseconds(duration))
    }

    /// Converts a `std::time::Duration` to nanoseconds, saturating to
    /// `MAX_NANOS` (`u64::MAX - 1`) if the duration is too large.
    /// (`Duration::as_nanos` returns `u128`)
    pub(crate) fn duration_to_saturating_nanoseconds(duration: Duration) -> u64 {
        u64::try_from(duration.as_nanos())
            .map(|n| n.min(MAX_NANOS))
            .unwrap_or(MAX_NANOS)
    }

    pub(crate) fn saturating_add(&self, duration: Duration) -> Instant {
        let dur_ns = Self::duration_to_saturating_nanoseconds(duration);
        Instant::from_nanos(self.elapsed_ns.saturating_add(dur_ns).min(MAX_NANOS))
    }

    pub(crate) fn saturating_duration_since(&self, earlier: Self) -> Duration {
        Duration::from_nanos(self.elapsed_ns.saturating_sub(earlier.elapsed_ns))
    }

    /// Returns `true` if `duration` has fully elapsed between `since` and `self`.
    /// A `None` duration never elapses.
    #[inline]
    pub(crate) fn has_elapsed(&self, since: Instant, duration: Option<Duration>) -> bool {
        match duration {
            Some(d) => since.saturating_add(d) <= *self,
            None => false,
        }
    }
}
