//! Common data types for notifications.

pub(crate) mod notifier;

use std::{fmt, sync::Arc};

/// A removal listener closure. Called once for each removed entry.
pub type RemovalListener<K, V> =
    Arc<dyn Fn(RemovalNotification<K, V>) + Send + Sync + 'static>;

// NOTE: Dropping the cache drops all entries without sending notifications.
// Call `invalidate_all` before dropping the cache to get them notified.

/// Specifies how and when removal notifications should be delivered to the
/// removal listener.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Default)]
pub enum DeliveryMode {
    /// The listener is called on the thread that removed the entry, after the
    /// entry has been unlinked and before the removing operation returns.
    ///
    /// The calling operation absorbs the latency of the listener. A panic in the
    /// listener is caught and reported; it never undoes the removal.
    #[default]
    Immediate,
    /// Notifications are queued and delivered by a background worker thread.
    ///
    /// Notifications for different keys may be delivered in any order, but
    /// notifications for the same key are delivered in the order of removals.
    Queued,
}

/// Indicates the reason why a cached entry was removed.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum RemovalCause {
    /// The entry was manually removed by the user.
    Explicit,
    /// The entry itself was not actually removed, but its value was replaced by
    /// `put` or by a reload.
    Replaced,
    /// The key or the value of the entry was dropped by all of its other owners
    /// (weak references), or the value was reclaimed (soft references).
    Collected,
    /// The entry's expiration timestamp has passed.
    Expired,
    /// The entry was evicted due to size constraints.
    Size,
}

impl RemovalCause {
    /// Returns `true` if the removal was not initiated by the user, i.e. the
    /// cause is `Collected`, `Expired` or `Size`.
    pub fn was_evicted(&self) -> bool {
        matches!(self, Self::Collected | Self::Expired | Self::Size)
    }
}

/// A notification of the removal of a single entry.
///
/// The key is absent when the entry was removed because its weakly referenced
/// key had been dropped. The value is absent when its weakly referenced value
/// had been dropped.
pub struct RemovalNotification<K, V> {
    key: Option<Arc<K>>,
    value: Option<Arc<V>>,
    cause: RemovalCause,
}

impl<K, V> RemovalNotification<K, V> {
    pub(crate) fn new(key: Option<Arc<K>>, value: Option<Arc<V>>, cause: RemovalCause) -> Self {
        Self { key, value, cause }
    }

    pub fn key(&self) -> Option<&Arc<K>> {
        self.key.as_ref()
    }

    pub fn value(&self) -> Option<&Arc<V>> {
        self.value.as_ref()
    }

    pub fn cause(&self) -> RemovalCause {
        self.cause
    }

    pub fn was_evicted(&self) -> bool {
        self.cause.was_evicted()
    }

    pub fn into_parts(self) -> (Option<Arc<K>>, Option<Arc<V>>, RemovalCause) {
        (self.key, self.value, self.cause)
    }
}

impl<K: fmt::Debug, V: fmt::Debug> fmt::Debug for RemovalNotification<K, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemovalNotification")
            .field("key", &self.key)
            .field("value", &self.value)
            .field("cause", &self.cause)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::{RemovalCause, RemovalNotification};
    use std::sync::Arc;

    #[test]
    fn evicted_causes() {
        assert!(!RemovalCause::Explicit.was_evicted());
        assert!(!RemovalCause::Replaced.was_evicted());
        assert!(RemovalCause::Collected.was_evicted());
        assert!(RemovalCause::Expired.was_evicted());
        assert!(RemovalCause::Size.was_evicted());
    }

    #[test]
    fn notification_parts() {
        let n = RemovalNotification::new(
            Some(Arc::new("a")),
            None::<Arc<u32>>,
            RemovalCause::Collected,
        );
        assert_eq!(n.key().map(|k| **k), Some("a"));
        assert!(n.value().is_none());
        assert!(n.was_evicted());

        let (key, value, cause) = n.into_parts();
        assert_eq!(key.as_deref(), Some(&"a"));
        assert!(value.is_none());
        assert_eq!(cause, RemovalCause::Collected);
    }
}
