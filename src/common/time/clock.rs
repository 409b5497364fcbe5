use std::{
    fmt,
    sync::Arc,
    time::{Duration, Instant as StdInstant},
};

use parking_lot::RwLock;

// This is the crate's `Instant` struct, not `std::time::Instant`.
use super::Instant;

/// A source of monotonic time for expiration, refresh and load-time decisions.
///
/// `Clock::default()` measures the time elapsed since the clock was created.
/// `Clock::mock()` creates a clock that only advances when told to, which makes
/// time-based behavior testable without sleeping.
///
/// # Examples
///
/// ```rust
/// use loadcache::{sync::{from_fn, Cache}, Clock};
/// use std::time::Duration;
///
/// let (clock, mock) = Clock::mock();
/// let cache = Cache::builder()
///     .time_to_live(Duration::from_secs(10))
///     .clock(clock)
///     .build(from_fn(|k: &u32| Ok(*k)))
///     .unwrap();
///
/// cache.put(1, 1);
/// mock.increment(Duration::from_secs(10));
/// assert!(cache.get_if_present(&1).is_none());
/// ```
#[derive(Default, Clone)]
pub struct Clock {
    ty: ClockType,
}

impl fmt::Debug for Clock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match &self.ty {
            ClockType::Standard { .. } => "Standard",
            #[cfg(feature = "quanta")]
            ClockType::Hybrid { .. } => "Hybrid",
            ClockType::Mocked { .. } => "Mocked",
        };
        f.debug_struct("Clock").field("type", &name).finish()
    }
}

#[derive(Clone)]
enum ClockType {
    /// A clock that uses `std::time::Instant` as the source of time.
    Standard { origin: StdInstant },
    #[cfg(feature = "quanta")]
    /// A clock that uses both `std::time::Instant` and `quanta::Instant` as the
    /// sources of time.
    Hybrid {
        std_origin: StdInstant,
        quanta_origin: quanta::Instant,
    },
    /// A clock that uses a mocked source of time.
    Mocked { mock: Arc<Mock> },
}

impl Default for ClockType {
    /// Create a new `ClockType` with the current time as the origin.
    ///
    /// If the `quanta` feature is enabled, `Hybrid` will be used. Otherwise,
    /// `Standard` will be used.
    fn default() -> Self {
        #[cfg(feature = "quanta")]
        {
            return ClockType::Hybrid {
                std_origin: StdInstant::now(),
                quanta_origin: quanta::Instant::now(),
            };
        }

        #[allow(unreachable_code)]
        ClockType::Standard {
            origin: StdInstant::now(),
        }
    }
}

impl Clock {
    /// Creates a new `Clock` with a mocked source of time, and returns it with
    /// the handle to advance the time.
    pub fn mock() -> (Clock, Arc<Mock>) {
        let mock = Arc::new(Mock::default());
        let clock = Clock {
            ty: ClockType::Mocked {
                mock: Arc::clone(&mock),
            },
        };
        (clock, mock)
    }

    /// Returns the current time using a reliable source of time.
    pub(crate) fn now(&self) -> Instant {
        match &self.ty {
            ClockType::Standard { origin } => {
                Instant::from_duration_since_clock_start(origin.elapsed())
            }
            #[cfg(feature = "quanta")]
            ClockType::Hybrid { std_origin, .. } => {
                Instant::from_duration_since_clock_start(std_origin.elapsed())
            }
            ClockType::Mocked { mock } => Instant::from_duration_since_clock_start(mock.elapsed()),
        }
    }

    /// Returns the current time _maybe_ using a fast but less reliable source of
    /// time. Only used for measuring load times for the statistics.
    pub(crate) fn fast_now(&self) -> Instant {
        match &self.ty {
            #[cfg(feature = "quanta")]
            ClockType::Hybrid { quanta_origin, .. } => {
                Instant::from_duration_since_clock_start(quanta_origin.elapsed())
            }
            ClockType::Standard { .. } => self.now(),
            ClockType::Mocked { .. } => self.now(),
        }
    }
}

/// The handle of a mocked [`Clock`](./struct.Clock.html). Time only moves when
/// `increment` is called.
pub struct Mock {
    origin: StdInstant,
    now: RwLock<StdInstant>,
}

impl Default for Mock {
    fn default() -> Self {
        let origin = StdInstant::now();
        Self {
            origin,
            now: RwLock::new(origin),
        }
    }
}

impl fmt::Debug for Mock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Mock")
            .field("elapsed", &self.elapsed())
            .finish()
    }
}

impl Mock {
    /// Advances the mocked time by `amount`.
    pub fn increment(&self, amount: Duration) {
        *self.now.write() += amount;
    }

    pub(crate) fn elapsed(&self) -> Duration {
        self.now.read().duration_since(self.origin)
    }
}

#[cfg(test)]
mod tests {
    use super::Clock;
    use std::time::Duration;

    #[test]
    fn mocked_clock_only_moves_on_increment() {
        let (clock, mock) = Clock::mock();
        let t0 = clock.now();
        assert_eq!(clock.now(), t0);

        mock.increment(Duration::from_secs(3));
        let t1 = clock.now();
        assert_eq!(t1.saturating_duration_since(t0), Duration::from_secs(3));
        assert_eq!(clock.fast_now(), t1);
    }

    #[test]
    fn default_clock_is_monotonic() {
        let clock = Clock::default();
        let t0 = clock.now();
        std::thread::sleep(Duration::from_millis(2));
        assert!(clock.now() > t0);
    }
}
