/// The number of entries examined by the maintenance work piggybacked on a
/// single write (per recency order and for the reference check).
pub(crate) const WRITE_MAINTENANCE_BATCH_SIZE: usize = 16;

/// A segment runs the piggybacked maintenance on every this-many reads.
pub(crate) const READ_MAINTENANCE_INTERVAL: u32 = 64;

/// The default desired number of segments.
pub(crate) const DEFAULT_CONCURRENCY_LEVEL: usize = 4;

/// A bounded cache does not split into more segments than would leave each
/// segment with this many weight units.
pub(crate) const MIN_SEGMENT_WEIGHT: u64 = 20;

/// Maximum number of notifications a single notification task delivers before
/// it yields the worker thread.
pub(crate) const MAX_NOTIFICATIONS_PER_TASK: u16 = 5_000;
