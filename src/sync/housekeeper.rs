use smallvec::SmallVec;

use super::{
    entry::{Bucket, DeqKey, Slot, ValueStrength},
    segment::{Removals, SegmentInner},
};
use crate::{
    common::{
        concurrent::constants::WRITE_MAINTENANCE_BATCH_SIZE, deque::DeqOrder, time::Instant,
    },
    notification::RemovalCause,
};

/// How much work a maintenance pass may do.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Budget {
    /// Examine a few entries per step. Piggybacked on writes and on every
    /// `READ_MAINTENANCE_INTERVAL`th read.
    Batch(usize),
    /// Sweep the whole segment. Used by `Cache::clean_up`.
    Unlimited,
}

impl Budget {
    pub(crate) fn batch() -> Self {
        Self::Batch(WRITE_MAINTENANCE_BATCH_SIZE)
    }

    fn allows(&self, done: usize) -> bool {
        match self {
            Self::Batch(max) => done < *max,
            Self::Unlimited => true,
        }
    }
}

impl<K, V> SegmentInner<K, V> {
    /// Removes expired entries and entries whose key or value was collected.
    pub(crate) fn run_maintenance(
        &mut self,
        now: Instant,
        budget: Budget,
        removals: &mut Removals<K, V>,
    ) {
        if self.config.expiry.time_to_live.is_some() {
            self.expire_from_head(DeqOrder::Write, now, budget, removals);
        }
        if self.config.expiry.time_to_idle.is_some() {
            self.expire_from_head(DeqOrder::Access, now, budget, removals);
        }
        if self.config.weak_keys || self.has_weak_values() {
            self.remove_collected(budget, removals);
        }
    }

    fn has_weak_values(&self) -> bool {
        self.config.value_strength == ValueStrength::Weak
    }

    /// Each deque is ordered by its own timestamp, so the sweep stops at the first
    /// entry that has not expired.
    fn expire_from_head(
        &mut self,
        order: DeqOrder,
        now: Instant,
        budget: Budget,
        removals: &mut Removals<K, V>,
    ) {
        let expiry = self.config.expiry;
        let mut done = 0;

        while budget.allows(done) {
            let deque = match order {
                DeqOrder::Access => &self.access_order,
                DeqOrder::Write => &self.write_order,
            };
            let deq_key = match deque.peek_front() {
                Some(node) => node.element.clone(),
                None => break,
            };

            let expired = match self.find_loaded(&deq_key) {
                Some(Bucket {
                    slot: Slot::Loaded(entry),
                    ..
                }) => match order {
                    DeqOrder::Access => now.has_elapsed(entry.last_accessed, expiry.time_to_idle),
                    DeqOrder::Write => now.has_elapsed(entry.last_modified, expiry.time_to_live),
                },
                _ => panic!(
                    "expire_from_head - the {} deque has an element with no entry",
                    order.name()
                ),
            };
            if !expired {
                break;
            }

            self.remove_by_deq_key(&deq_key, RemovalCause::Expired, removals);
            done += 1;
        }
    }

    /// Probes the entries for collected keys and values. A batch continues from
    /// where the previous batch stopped.
    fn remove_collected(&mut self, budget: Budget, removals: &mut Removals<K, V>) {
        let mut dead: SmallVec<[DeqKey<K>; 16]> = SmallVec::new();

        match budget {
            Budget::Batch(max) => {
                for _ in 0..max {
                    let deq_key = match self.write_order.next_at_cursor() {
                        Some(deq_key) => deq_key.clone(),
                        None => break,
                    };
                    if self.is_collected(&deq_key) {
                        dead.push(deq_key);
                    }
                }
            }
            Budget::Unlimited => {
                self.write_order.reset_cursor();
                dead.extend(
                    self.write_order
                        .iter()
                        .filter(|deq_key| self.is_collected(deq_key))
                        .cloned(),
                );
            }
        }

        for deq_key in dead {
            self.remove_by_deq_key(&deq_key, RemovalCause::Collected, removals);
        }
    }

    /// Removes the soft values that no one but the cache holds, and returns the
    /// number of removed entries.
    pub(crate) fn reclaim_soft_values(&mut self, removals: &mut Removals<K, V>) -> usize {
        let reclaimable = self
            .write_order
            .iter()
            .filter(|deq_key| {
                matches!(
                    self.find_loaded(deq_key),
                    Some(Bucket { slot: Slot::Loaded(entry), .. }) if entry.value.is_reclaimable()
                )
            })
            .cloned()
            .collect::<Vec<_>>();

        let count = reclaimable.len();
        for deq_key in reclaimable {
            self.remove_by_deq_key(&deq_key, RemovalCause::Collected, removals);
        }
        count
    }

    fn is_collected(&self, deq_key: &DeqKey<K>) -> bool {
        deq_key.key.is_collected()
            || matches!(
                self.find_loaded(deq_key),
                Some(Bucket { slot: Slot::Loaded(entry), .. }) if entry.value.is_collected()
            )
    }

    fn find_loaded(&self, deq_key: &DeqKey<K>) -> Option<&Bucket<K, V>> {
        self.table.find(deq_key.hash, |b| {
            b.key.same(&deq_key.key) && matches!(b.slot, Slot::Loaded(_))
        })
    }
}
