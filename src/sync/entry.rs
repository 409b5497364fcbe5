use std::{
    ptr::NonNull,
    sync::{Arc, Weak},
    time::Duration,
};

use triomphe::Arc as TrioArc;

use super::value_initializer::Waiter;
pub(crate) use crate::policy::ValueStrength;
use crate::common::{deque::DeqNode, time::Instant};

/// A reference from the cache to a key. Weak keys are compared by identity, so
/// a weak key also carries the address of the referent.
pub(crate) enum KeyRef<K> {
    Strong(Arc<K>),
    Weak { id: usize, key: Weak<K> },
}

impl<K> Clone for KeyRef<K> {
    fn clone(&self) -> Self {
        match self {
            Self::Strong(key) => Self::Strong(Arc::clone(key)),
            Self::Weak { id, key } => Self::Weak {
                id: *id,
                key: Weak::clone(key),
            },
        }
    }
}

impl<K> KeyRef<K> {
    pub(crate) fn new(key: &Arc<K>, weak: bool) -> Self {
        if weak {
            Self::Weak {
                id: key_id(key.as_ref()),
                key: Arc::downgrade(key),
            }
        } else {
            Self::Strong(Arc::clone(key))
        }
    }

    pub(crate) fn upgrade(&self) -> Option<Arc<K>> {
        match self {
            Self::Strong(key) => Some(Arc::clone(key)),
            Self::Weak { key, .. } => key.upgrade(),
        }
    }

    pub(crate) fn is_collected(&self) -> bool {
        match self {
            Self::Strong(_) => false,
            Self::Weak { key, .. } => key.strong_count() == 0,
        }
    }

    /// Returns `true` if both refer to the same key allocation.
    pub(crate) fn same(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Strong(a), Self::Strong(b)) => Arc::ptr_eq(a, b),
            (Self::Weak { id: a, .. }, Self::Weak { id: b, .. }) => a == b,
            _ => false,
        }
    }
}

/// The identity of a weakly referenced key: the address of the referent.
///
/// A `Weak` keeps the allocation of its referent alive, so the address cannot
/// be reused while the cache holds an entry for it.
pub(crate) fn key_id<K>(key: &K) -> usize {
    key as *const K as usize
}

/// How a lookup finds its bucket: by key equality (strong keys) or by identity
/// (weak keys).
pub(crate) struct KeyLookup<'a, K> {
    pub(crate) hash: u64,
    kind: LookupKind<'a, K>,
}

enum LookupKind<'a, K> {
    ByValue(&'a K),
    ById(usize),
}

impl<'a, K: Eq> KeyLookup<'a, K> {
    pub(crate) fn by_value(hash: u64, key: &'a K) -> Self {
        Self {
            hash,
            kind: LookupKind::ByValue(key),
        }
    }

    pub(crate) fn by_id(hash: u64, id: usize) -> Self {
        Self {
            hash,
            kind: LookupKind::ById(id),
        }
    }

    pub(crate) fn matches(&self, key_ref: &KeyRef<K>) -> bool {
        match (&self.kind, key_ref) {
            (LookupKind::ByValue(key), KeyRef::Strong(k)) => **key == **k,
            (LookupKind::ById(id), KeyRef::Weak { id: k_id, .. }) => id == k_id,
            _ => false,
        }
    }
}

/// A reference from the cache to a value.
pub(crate) enum ValueRef<V> {
    Strong(Arc<V>),
    Weak(Weak<V>),
    /// Held strongly; becomes reclaimable once the cache is the only owner.
    Soft(Arc<V>),
}

impl<V> ValueRef<V> {
    pub(crate) fn new(value: &Arc<V>, strength: ValueStrength) -> Self {
        match strength {
            ValueStrength::Strong => Self::Strong(Arc::clone(value)),
            ValueStrength::Weak => Self::Weak(Arc::downgrade(value)),
            ValueStrength::Soft => Self::Soft(Arc::clone(value)),
        }
    }

    pub(crate) fn get(&self) -> Option<Arc<V>> {
        match self {
            Self::Strong(v) | Self::Soft(v) => Some(Arc::clone(v)),
            Self::Weak(v) => v.upgrade(),
        }
    }

    pub(crate) fn is_collected(&self) -> bool {
        match self {
            Self::Weak(v) => v.strong_count() == 0,
            _ => false,
        }
    }

    pub(crate) fn is_reclaimable(&self) -> bool {
        match self {
            Self::Soft(v) => Arc::strong_count(v) == 1,
            _ => false,
        }
    }
}

/// The element of the access-order and write-order deques. Finds its bucket
/// again through the hash and the identity of the key.
pub(crate) struct DeqKey<K> {
    pub(crate) hash: u64,
    pub(crate) key: KeyRef<K>,
}

impl<K> Clone for DeqKey<K> {
    fn clone(&self) -> Self {
        Self {
            hash: self.hash,
            key: self.key.clone(),
        }
    }
}

impl<K> DeqKey<K> {
    pub(crate) fn same(&self, other: &Self) -> bool {
        self.hash == other.hash && self.key.same(&other.key)
    }
}

type KeyDeqNode<K> = NonNull<DeqNode<DeqKey<K>>>;

pub(crate) struct ValueEntry<K, V> {
    pub(crate) value: ValueRef<V>,
    pub(crate) weight: u32,
    pub(crate) last_accessed: Instant,
    pub(crate) last_modified: Instant,
    pub(crate) generation: u64,
    pub(crate) is_refreshing: bool,
    pub(crate) access_node: KeyDeqNode<K>,
    pub(crate) write_node: KeyDeqNode<K>,
}

impl<K, V> ValueEntry<K, V> {
    pub(crate) fn is_expired(&self, now: Instant, expiry: &Expiry) -> bool {
        now.has_elapsed(self.last_modified, expiry.time_to_live)
            || now.has_elapsed(self.last_accessed, expiry.time_to_idle)
    }

    pub(crate) fn needs_refresh(&self, now: Instant, refresh_after: Option<Duration>) -> bool {
        !self.is_refreshing && now.has_elapsed(self.last_modified, refresh_after)
    }
}

#[derive(Clone, Copy, Debug, Default)]
pub(crate) struct Expiry {
    pub(crate) time_to_live: Option<Duration>,
    pub(crate) time_to_idle: Option<Duration>,
}

pub(crate) enum Slot<K, V> {
    /// A load for the key is in flight. Not visible to readers as a value.
    Loading {
        generation: u64,
        waiter: TrioArc<Waiter<V>>,
    },
    Loaded(ValueEntry<K, V>),
}

pub(crate) struct Bucket<K, V> {
    pub(crate) hash: u64,
    pub(crate) key: KeyRef<K>,
    pub(crate) slot: Slot<K, V>,
}
