use std::{
    sync::{
        atomic::{AtomicU32, Ordering},
        Arc,
    },
    time::Duration,
};

use hashbrown::HashTable;
use parking_lot::{Mutex, MutexGuard};
use smallvec::SmallVec;
use triomphe::Arc as TrioArc;

use super::{
    entry::{Bucket, DeqKey, Expiry, KeyLookup, KeyRef, Slot, ValueEntry, ValueRef, ValueStrength},
    value_initializer::Waiter,
};
use crate::{
    common::{
        concurrent::constants::READ_MAINTENANCE_INTERVAL,
        deque::{DeqNode, DeqOrder, Deque},
        time::Instant,
    },
    notification::RemovalCause,
};

/// An entry that was unlinked from a segment and still has to be reported to
/// the statistics and the removal listener.
pub(crate) struct Removed<K, V> {
    pub(crate) key: Option<Arc<K>>,
    pub(crate) value: Option<Arc<V>>,
    pub(crate) weight: u32,
    pub(crate) cause: RemovalCause,
}

pub(crate) type Removals<K, V> = SmallVec<[Removed<K, V>; 4]>;

#[derive(Clone, Copy, Debug)]
pub(crate) struct SegmentConfig {
    pub(crate) max_weight: Option<u64>,
    pub(crate) expiry: Expiry,
    pub(crate) refresh_after_write: Option<Duration>,
    pub(crate) weak_keys: bool,
    pub(crate) value_strength: ValueStrength,
    pub(crate) initial_capacity: usize,
}

/// A request to reload a stale entry in the background. Created by a read that
/// observed the entry older than the refresh interval.
pub(crate) struct RefreshTicket<K, V> {
    pub(crate) key: Arc<K>,
    pub(crate) generation: u64,
    pub(crate) old_value: Arc<V>,
}

pub(crate) enum Lookup<K, V> {
    Hit {
        value: Arc<V>,
        refresh: Option<RefreshTicket<K, V>>,
    },
    Loading(TrioArc<Waiter<V>>),
    Absent,
}

pub(crate) struct Segment<K, V> {
    inner: Mutex<SegmentInner<K, V>>,
    reads: AtomicU32,
}

impl<K, V> Segment<K, V> {
    pub(crate) fn new(config: SegmentConfig) -> Self {
        Self {
            inner: Mutex::new(SegmentInner::new(config)),
            reads: AtomicU32::new(0),
        }
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, SegmentInner<K, V>> {
        self.inner.lock()
    }

    /// Counts a read, and returns `true` once every `READ_MAINTENANCE_INTERVAL`
    /// reads.
    pub(crate) fn should_maintain_on_read(&self) -> bool {
        let reads = self.reads.fetch_add(1, Ordering::Relaxed).wrapping_add(1);
        reads % READ_MAINTENANCE_INTERVAL == 0
    }
}

pub(crate) struct SegmentInner<K, V> {
    pub(crate) table: HashTable<Bucket<K, V>>,
    pub(crate) access_order: Deque<DeqKey<K>>,
    pub(crate) write_order: Deque<DeqKey<K>>,
    pub(crate) weighted_size: u64,
    pub(crate) entry_count: u64,
    pub(crate) config: SegmentConfig,
    next_generation: u64,
}

// Safety: The raw pointers to the deque nodes are only dereferenced while the
// segment's mutex is held, and every node is owned by exactly one deque.
unsafe impl<K: Send, V: Send> Send for SegmentInner<K, V> {}
unsafe impl<K: Sync, V: Sync> Sync for SegmentInner<K, V> {}

impl<K, V> SegmentInner<K, V> {
    pub(crate) fn new(config: SegmentConfig) -> Self {
        Self {
            table: HashTable::with_capacity(config.initial_capacity),
            access_order: Deque::new(DeqOrder::Access),
            write_order: Deque::new(DeqOrder::Write),
            weighted_size: 0,
            entry_count: 0,
            config,
            next_generation: 0,
        }
    }

    fn next_generation(&mut self) -> u64 {
        self.next_generation = self.next_generation.wrapping_add(1);
        self.next_generation
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.table.len()
    }

    /// Inserts a `Loading` placeholder for a key that has no bucket, and returns
    /// its generation.
    pub(crate) fn insert_placeholder(
        &mut self,
        hash: u64,
        key: KeyRef<K>,
        waiter: TrioArc<Waiter<V>>,
    ) -> u64 {
        let generation = self.next_generation();
        let bucket = Bucket {
            hash,
            key,
            slot: Slot::Loading { generation, waiter },
        };
        self.table.insert_unique(hash, bucket, |b| b.hash);
        generation
    }

    fn new_entry(
        &mut self,
        deq_key: &DeqKey<K>,
        value: &Arc<V>,
        weight: u32,
        now: Instant,
        generation: u64,
    ) -> ValueEntry<K, V> {
        let access_node = self
            .access_order
            .push_back(Box::new(DeqNode::new(deq_key.clone())));
        let write_node = self
            .write_order
            .push_back(Box::new(DeqNode::new(deq_key.clone())));
        self.weighted_size = self.weighted_size.saturating_add(weight as u64);
        self.entry_count += 1;
        ValueEntry {
            value: ValueRef::new(value, self.config.value_strength),
            weight,
            last_accessed: now,
            last_modified: now,
            generation,
            is_refreshing: false,
            access_node,
            write_node,
        }
    }

    fn unlink(&mut self, entry: ValueEntry<K, V>) {
        unsafe {
            self.access_order.unlink_and_drop(entry.access_node);
            self.write_order.unlink_and_drop(entry.write_node);
        }
        self.weighted_size = self.weighted_size.saturating_sub(entry.weight as u64);
        self.entry_count -= 1;
    }
}

impl<K, V> SegmentInner<K, V>
where
    K: Eq,
{
    /// Looks up a live value. A hit updates the access time and moves the entry
    /// to the most recent position of the access order. A stale entry (expired or
    /// collected) is removed and reported as absent.
    pub(crate) fn get(
        &mut self,
        lookup: &KeyLookup<'_, K>,
        now: Instant,
        removals: &mut Removals<K, V>,
    ) -> Lookup<K, V> {
        let expiry = self.config.expiry;
        let refresh_after = self.config.refresh_after_write;

        let stale_cause = match self.table.find_mut(lookup.hash, |b| lookup.matches(&b.key)) {
            None => return Lookup::Absent,
            Some(Bucket { key, slot, .. }) => match slot {
                Slot::Loading { waiter, .. } => return Lookup::Loading(TrioArc::clone(waiter)),
                Slot::Loaded(entry) => match entry.value.get() {
                    None => RemovalCause::Collected,
                    Some(_) if key.is_collected() => RemovalCause::Collected,
                    Some(_) if entry.is_expired(now, &expiry) => RemovalCause::Expired,
                    Some(value) => {
                        entry.last_accessed = now;
                        unsafe { self.access_order.move_to_back(entry.access_node) };

                        let mut refresh = None;
                        if entry.needs_refresh(now, refresh_after) {
                            if let Some(key) = key.upgrade() {
                                entry.is_refreshing = true;
                                refresh = Some(RefreshTicket {
                                    key,
                                    generation: entry.generation,
                                    old_value: Arc::clone(&value),
                                });
                            }
                        }
                        return Lookup::Hit { value, refresh };
                    }
                },
            },
        };

        self.remove(lookup, stale_cause, removals);
        Lookup::Absent
    }

    /// Returns the live value without touching the entry.
    pub(crate) fn peek(&self, lookup: &KeyLookup<'_, K>, now: Instant) -> Option<Arc<V>> {
        let bucket = self.table.find(lookup.hash, |b| lookup.matches(&b.key))?;
        match &bucket.slot {
            Slot::Loaded(entry)
                if !bucket.key.is_collected() && !entry.is_expired(now, &self.config.expiry) =>
            {
                entry.value.get()
            }
            _ => None,
        }
    }

    /// Publishes the value of a completed load. The value is discarded unless the
    /// key still holds the placeholder of the same generation.
    pub(crate) fn publish(
        &mut self,
        lookup: &KeyLookup<'_, K>,
        generation: u64,
        value: &Arc<V>,
        weight: u32,
        now: Instant,
        removals: &mut Removals<K, V>,
    ) -> bool {
        let deq_key = match self.table.find(lookup.hash, |b| lookup.matches(&b.key)) {
            Some(Bucket {
                hash,
                key,
                slot: Slot::Loading { generation: g, .. },
            }) if *g == generation => DeqKey {
                hash: *hash,
                key: key.clone(),
            },
            _ => return false,
        };

        let entry_gen = self.next_generation();
        let entry = self.new_entry(&deq_key, value, weight, now, entry_gen);
        if let Some(bucket) = self.table.find_mut(lookup.hash, |b| lookup.matches(&b.key)) {
            bucket.slot = Slot::Loaded(entry);
        }
        self.evict_lru_entries(&deq_key, removals);
        true
    }

    /// Removes the placeholder of a failed load, unless a newer write already
    /// replaced it.
    pub(crate) fn abandon(&mut self, lookup: &KeyLookup<'_, K>, generation: u64) {
        if let Ok(occupied) = self.table.find_entry(lookup.hash, |b| {
            lookup.matches(&b.key)
                && matches!(b.slot, Slot::Loading { generation: g, .. } if g == generation)
        }) {
            occupied.remove();
        }
    }

    /// Inserts or replaces the value for the key, and returns the previous live
    /// value. Supersedes any load in flight for the key.
    pub(crate) fn put(
        &mut self,
        lookup: &KeyLookup<'_, K>,
        key: &Arc<K>,
        value: &Arc<V>,
        weight: u32,
        now: Instant,
        removals: &mut Removals<K, V>,
    ) -> Option<Arc<V>> {
        let generation = self.next_generation();
        let expiry = self.config.expiry;
        let strength = self.config.value_strength;

        let (deq_key, previous) =
            match self.table.find_mut(lookup.hash, |b| lookup.matches(&b.key)) {
                Some(bucket) => {
                    let deq_key = DeqKey {
                        hash: bucket.hash,
                        key: bucket.key.clone(),
                    };
                    match &mut bucket.slot {
                        Slot::Loaded(entry) => {
                            let old_value = entry.value.get();
                            let cause = if old_value.is_none() || bucket.key.is_collected() {
                                RemovalCause::Collected
                            } else if entry.is_expired(now, &expiry) {
                                RemovalCause::Expired
                            } else {
                                RemovalCause::Replaced
                            };
                            let old_weight = entry.weight;

                            entry.value = ValueRef::new(value, strength);
                            entry.weight = weight;
                            entry.last_accessed = now;
                            entry.last_modified = now;
                            entry.generation = generation;
                            entry.is_refreshing = false;
                            unsafe {
                                self.access_order.move_to_back(entry.access_node);
                                self.write_order.move_to_back(entry.write_node);
                            }
                            self.weighted_size = self
                                .weighted_size
                                .saturating_sub(old_weight as u64)
                                .saturating_add(weight as u64);

                            let previous = match cause {
                                RemovalCause::Replaced => old_value.clone(),
                                _ => None,
                            };
                            removals.push(Removed {
                                key: Some(Arc::clone(key)),
                                value: old_value,
                                weight: old_weight,
                                cause,
                            });
                            (deq_key, previous)
                        }
                        Slot::Loading { .. } => {
                            let entry = self.new_entry(&deq_key, value, weight, now, generation);
                            if let Some(bucket) =
                                self.table.find_mut(lookup.hash, |b| lookup.matches(&b.key))
                            {
                                bucket.slot = Slot::Loaded(entry);
                            }
                            (deq_key, None)
                        }
                    }
                }
                None => {
                    let deq_key = DeqKey {
                        hash: lookup.hash,
                        key: KeyRef::new(key, self.config.weak_keys),
                    };
                    let entry = self.new_entry(&deq_key, value, weight, now, generation);
                    let bucket = Bucket {
                        hash: lookup.hash,
                        key: deq_key.key.clone(),
                        slot: Slot::Loaded(entry),
                    };
                    self.table.insert_unique(lookup.hash, bucket, |b| b.hash);
                    (deq_key, None)
                }
            };

        self.evict_lru_entries(&deq_key, removals);
        previous
    }

    /// Replaces the value of an entry with the result of a background reload.
    /// The result is discarded when the entry was written or removed after the
    /// reload started.
    pub(crate) fn replace_refreshed(
        &mut self,
        lookup: &KeyLookup<'_, K>,
        generation: u64,
        value: &Arc<V>,
        weight: u32,
        now: Instant,
        removals: &mut Removals<K, V>,
    ) -> bool {
        let new_generation = self.next_generation();
        let strength = self.config.value_strength;

        let deq_key = match self.table.find_mut(lookup.hash, |b| lookup.matches(&b.key)) {
            Some(Bucket {
                hash,
                key,
                slot: Slot::Loaded(entry),
            }) if entry.generation == generation => {
                let old_value = entry.value.get();
                let old_weight = entry.weight;

                entry.value = ValueRef::new(value, strength);
                entry.weight = weight;
                entry.last_modified = now;
                entry.generation = new_generation;
                entry.is_refreshing = false;
                unsafe { self.write_order.move_to_back(entry.write_node) };
                self.weighted_size = self
                    .weighted_size
                    .saturating_sub(old_weight as u64)
                    .saturating_add(weight as u64);

                removals.push(Removed {
                    key: key.upgrade(),
                    value: old_value,
                    weight: old_weight,
                    cause: RemovalCause::Replaced,
                });
                DeqKey {
                    hash: *hash,
                    key: key.clone(),
                }
            }
            _ => return false,
        };

        self.evict_lru_entries(&deq_key, removals);
        true
    }

    /// Clears the in-flight flag of an entry whose background reload failed.
    pub(crate) fn cancel_refresh(&mut self, lookup: &KeyLookup<'_, K>, generation: u64) {
        if let Some(Bucket {
            slot: Slot::Loaded(entry),
            ..
        }) = self.table.find_mut(lookup.hash, |b| lookup.matches(&b.key))
        {
            if entry.generation == generation {
                entry.is_refreshing = false;
            }
        }
    }

    /// Marks a live entry as being refreshed, and returns the ticket for the
    /// reload. Returns `None` if the entry is absent, stale, loading or already
    /// being refreshed.
    pub(crate) fn begin_refresh(
        &mut self,
        lookup: &KeyLookup<'_, K>,
        now: Instant,
    ) -> Option<RefreshTicket<K, V>> {
        let expiry = self.config.expiry;
        match self.table.find_mut(lookup.hash, |b| lookup.matches(&b.key)) {
            Some(Bucket {
                key,
                slot: Slot::Loaded(entry),
                ..
            }) if !entry.is_refreshing && !entry.is_expired(now, &expiry) => {
                let old_value = entry.value.get()?;
                let key = key.upgrade()?;
                entry.is_refreshing = true;
                Some(RefreshTicket {
                    key,
                    generation: entry.generation,
                    old_value,
                })
            }
            _ => None,
        }
    }

    pub(crate) fn is_loading(&self, lookup: &KeyLookup<'_, K>) -> bool {
        matches!(
            self.table.find(lookup.hash, |b| lookup.matches(&b.key)),
            Some(Bucket {
                slot: Slot::Loading { .. },
                ..
            })
        )
    }

    /// Removes the bucket of the key. A loaded entry is reported with `cause`, or
    /// with `Collected` if its key or value is gone. A placeholder is removed
    /// silently; the load in flight will discard its result.
    ///
    /// Returns the removed value if it was still reachable.
    pub(crate) fn remove(
        &mut self,
        lookup: &KeyLookup<'_, K>,
        cause: RemovalCause,
        removals: &mut Removals<K, V>,
    ) -> Option<Arc<V>> {
        let occupied = self
            .table
            .find_entry(lookup.hash, |b| lookup.matches(&b.key))
            .ok()?;
        let (bucket, _) = occupied.remove();
        match bucket.slot {
            Slot::Loading { .. } => None,
            Slot::Loaded(entry) => self.report_unlinked(bucket.key, entry, cause, removals),
        }
    }
}

impl<K, V> SegmentInner<K, V> {
    /// Removes the loaded entry that a deque element points to.
    pub(crate) fn remove_by_deq_key(
        &mut self,
        deq_key: &DeqKey<K>,
        cause: RemovalCause,
        removals: &mut Removals<K, V>,
    ) -> bool {
        let occupied = match self.table.find_entry(deq_key.hash, |b| {
            b.key.same(&deq_key.key) && matches!(b.slot, Slot::Loaded(_))
        }) {
            Ok(occupied) => occupied,
            Err(_) => return false,
        };
        let (bucket, _) = occupied.remove();
        if let Slot::Loaded(entry) = bucket.slot {
            self.report_unlinked(bucket.key, entry, cause, removals);
        }
        true
    }

    fn report_unlinked(
        &mut self,
        key_ref: KeyRef<K>,
        entry: ValueEntry<K, V>,
        cause: RemovalCause,
        removals: &mut Removals<K, V>,
    ) -> Option<Arc<V>> {
        let key = key_ref.upgrade();
        let value = entry.value.get();
        let cause = if key.is_none() || value.is_none() {
            RemovalCause::Collected
        } else {
            cause
        };
        let weight = entry.weight;
        self.unlink(entry);
        removals.push(Removed {
            key,
            value: value.clone(),
            weight,
            cause,
        });
        value
    }

    /// Evicts the least recently used entries while the segment is over its
    /// share of the capacity. Never evicts `protected`, the entry that was just
    /// written, so a single oversized entry is admitted and evicted by the next
    /// write.
    ///
    /// A refreshed entry keeps its place in the access order, so `protected`
    /// may be at the front. It is skipped.
    fn evict_lru_entries(&mut self, protected: &DeqKey<K>, removals: &mut Removals<K, V>) {
        let max_weight = match self.config.max_weight {
            Some(max) => max,
            None => return,
        };

        while self.weighted_size > max_weight {
            let victim = match self
                .access_order
                .iter()
                .find(|deq_key| !deq_key.same(protected))
            {
                Some(deq_key) => deq_key.clone(),
                None => break,
            };
            if !self.remove_by_deq_key(&victim, RemovalCause::Size, removals) {
                panic!(
                    "evict_lru_entries - the {} deque has an element with no entry",
                    self.access_order.order().name()
                );
            }
        }
    }

    /// Removes every entry. Placeholders are dropped silently.
    pub(crate) fn clear(&mut self, removals: &mut Removals<K, V>) {
        for bucket in self.table.drain() {
            if let Slot::Loaded(entry) = bucket.slot {
                let key = bucket.key.upgrade();
                let value = entry.value.get();
                let cause = if key.is_none() || value.is_none() {
                    RemovalCause::Collected
                } else {
                    RemovalCause::Explicit
                };
                removals.push(Removed {
                    key,
                    value,
                    weight: entry.weight,
                    cause,
                });
            }
        }
        // All nodes are released by dropping the deques.
        self.access_order = Deque::new(DeqOrder::Access);
        self.write_order = Deque::new(DeqOrder::Write);
        self.weighted_size = 0;
        self.entry_count = 0;
    }

    /// Returns the live entries without touching them.
    pub(crate) fn live_entries(&self, now: Instant) -> Vec<(Arc<K>, Arc<V>)> {
        let expiry = self.config.expiry;
        self.table
            .iter()
            .filter_map(|bucket| match &bucket.slot {
                Slot::Loaded(entry) if !entry.is_expired(now, &expiry) => {
                    Some((bucket.key.upgrade()?, entry.value.get()?))
                }
                _ => None,
            })
            .collect()
    }
}
