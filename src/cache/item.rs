//! Cached byte ranges and their LRU-K reference history.

use std::cmp::Ordering;

use serde::Serialize;

use super::buffer::{BufferElement, StreamId};
use super::subscription::PendingEviction;
use crate::table::{IndexLink, LinkField, ListLink, SlotId};

/// Number of references remembered per item (the K in LRU-K).
pub const TOUCH_HISTORY_LEN: usize = 3;

/// Eviction order of an item. Smaller keys are evicted first.
///
/// Items with fewer than K recorded references sort before every item with a
/// full history and are ordered by their oldest reference. Items with a full
/// history are ordered by their K-th most recent reference. The insertion
/// sequence makes the order total.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct LruKKey {
    pub full_history: bool,
    pub reference_tick: u64,
    pub sequence: u64,
}

/// Result of recording a reference.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TouchOutcome {
    /// Inside the correlation window; only the last-touch time moved.
    Correlated,
    /// Stored in the history. `left_burst` is set when this was the second
    /// reference, so the item stops counting against the burst budget.
    Recorded { left_burst: bool },
}

/// Identifies one particular item even after its slot is reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct ItemRef {
    pub(crate) slot: SlotId,
    pub(crate) sequence: u64,
}

pub(crate) struct CacheItem<B> {
    pub(crate) stream: StreamId,
    pub(crate) offset: u64,
    pub(crate) length: u64,
    pub(crate) buffer: B,
    pub(crate) sequence: u64,

    pub(crate) last_touch: u64,
    pub(crate) touch_history: [u64; TOUCH_HISTORY_LEN],
    pub(crate) next_touch_index: usize,
    pub(crate) touch_count: u32,
    pub(crate) lru_k_key: LruKKey,

    pub(crate) in_lru: bool,
    pub(crate) subscriptions: Vec<PendingEviction>,

    pub(crate) range_link: IndexLink<SlotId>,
    pub(crate) lru_k_link: IndexLink<SlotId>,
    pub(crate) lru_link: ListLink<SlotId>,
}

impl<B: BufferElement> CacheItem<B> {
    /// A new item whose insertion counts as its first reference.
    pub(crate) fn new(stream: StreamId, offset: u64, buffer: B, sequence: u64, now: u64) -> Self {
        let mut touch_history = [0; TOUCH_HISTORY_LEN];
        touch_history[0] = now;
        let mut item = Self {
            stream,
            offset,
            length: buffer.byte_len(),
            buffer,
            sequence,
            last_touch: now,
            touch_history,
            next_touch_index: 1 % TOUCH_HISTORY_LEN,
            touch_count: 1,
            lru_k_key: LruKKey {
                full_history: false,
                reference_tick: now,
                sequence,
            },
            in_lru: false,
            subscriptions: Vec::new(),
            range_link: IndexLink::unlinked(),
            lru_k_link: IndexLink::unlinked(),
            lru_link: ListLink::unlinked(),
        };
        item.lru_k_key = item.compute_lru_k_key();
        item
    }
}

impl<B> CacheItem<B> {
    /// One past the last byte covered.
    pub(crate) fn end(&self) -> u64 {
        self.offset + self.length
    }

    pub(crate) fn covers(&self, offset: u64) -> bool {
        self.offset <= offset && offset < self.end()
    }

    /// Order of this item's range key relative to `(stream, offset)`.
    pub(crate) fn range_cmp(&self, stream: StreamId, offset: u64) -> Ordering {
        (self.stream, self.offset).cmp(&(stream, offset))
    }

    /// Referenced exactly once since insertion.
    pub(crate) fn in_burst(&self) -> bool {
        self.touch_count == 1
    }

    pub(crate) fn item_ref(&self, slot: SlotId) -> ItemRef {
        ItemRef {
            slot,
            sequence: self.sequence,
        }
    }

    /// Record a reference at `now`.
    ///
    /// The LRU-K key is left alone: the caller must unlink the item from the
    /// LRU-K index, refresh the key and link it again.
    pub(crate) fn touch(&mut self, now: u64, correlation_window: u64, bypass: bool) -> TouchOutcome {
        if !bypass && now.saturating_sub(self.last_touch) < correlation_window {
            self.last_touch = now;
            return TouchOutcome::Correlated;
        }

        let was_burst = self.in_burst();
        self.touch_history[self.next_touch_index] = now;
        self.next_touch_index = (self.next_touch_index + 1) % TOUCH_HISTORY_LEN;
        self.touch_count = self.touch_count.saturating_add(1);
        self.last_touch = now;
        TouchOutcome::Recorded {
            left_burst: was_burst && !self.in_burst(),
        }
    }

    /// Drop pending subscriptions whose handles are gone.
    pub(crate) fn prune_subscriptions(&mut self) {
        self.subscriptions.retain(|pending| !pending.is_abandoned());
    }

    /// Recorded references run oldest to newest and none is later than the
    /// last touch.
    pub(crate) fn history_is_ordered(&self) -> bool {
        let recorded = (self.touch_count as usize).min(TOUCH_HISTORY_LEN);
        let start = if recorded == TOUCH_HISTORY_LEN {
            self.next_touch_index
        } else {
            0
        };
        let mut previous = 0;
        for step in 0..recorded {
            let tick = self.touch_history[(start + step) % TOUCH_HISTORY_LEN];
            if tick < previous {
                return false;
            }
            previous = tick;
        }
        previous <= self.last_touch
    }

    pub(crate) fn compute_lru_k_key(&self) -> LruKKey {
        if self.touch_count as usize >= TOUCH_HISTORY_LEN {
            // With a full ring the next write position holds the oldest entry.
            LruKKey {
                full_history: true,
                reference_tick: self.touch_history[self.next_touch_index],
                sequence: self.sequence,
            }
        } else {
            LruKKey {
                full_history: false,
                reference_tick: self.touch_history[0],
                sequence: self.sequence,
            }
        }
    }
}

pub(crate) type ItemCompare<B> = fn(&CacheItem<B>, &CacheItem<B>) -> Ordering;

fn compare_range<B>(a: &CacheItem<B>, b: &CacheItem<B>) -> Ordering {
    (a.stream, a.offset).cmp(&(b.stream, b.offset))
}

fn compare_lru_k<B>(a: &CacheItem<B>, b: &CacheItem<B>) -> Ordering {
    a.lru_k_key.cmp(&b.lru_k_key)
}

fn range_link<B>(item: &CacheItem<B>) -> &IndexLink<SlotId> {
    &item.range_link
}

fn range_link_mut<B>(item: &mut CacheItem<B>) -> &mut IndexLink<SlotId> {
    &mut item.range_link
}

fn lru_k_link<B>(item: &CacheItem<B>) -> &IndexLink<SlotId> {
    &item.lru_k_link
}

fn lru_k_link_mut<B>(item: &mut CacheItem<B>) -> &mut IndexLink<SlotId> {
    &mut item.lru_k_link
}

fn lru_link<B>(item: &CacheItem<B>) -> &ListLink<SlotId> {
    &item.lru_link
}

fn lru_link_mut<B>(item: &mut CacheItem<B>) -> &mut ListLink<SlotId> {
    &mut item.lru_link
}

pub(crate) fn range_field<B>() -> LinkField<CacheItem<B>, IndexLink<SlotId>> {
    LinkField::new(range_link::<B>, range_link_mut::<B>)
}

pub(crate) fn lru_k_field<B>() -> LinkField<CacheItem<B>, IndexLink<SlotId>> {
    LinkField::new(lru_k_link::<B>, lru_k_link_mut::<B>)
}

pub(crate) fn lru_field<B>() -> LinkField<CacheItem<B>, ListLink<SlotId>> {
    LinkField::new(lru_link::<B>, lru_link_mut::<B>)
}

pub(crate) fn range_order<B>() -> ItemCompare<B> {
    compare_range::<B>
}

pub(crate) fn lru_k_order<B>() -> ItemCompare<B> {
    compare_lru_k::<B>
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;

    use super::*;

    fn item(now: u64) -> CacheItem<Bytes> {
        CacheItem::new(StreamId::from(1u128), 100, Bytes::from_static(&[0; 50]), 7, now)
    }

    #[test]
    fn test_new_item_counts_one_reference() {
        let item = item(10);
        assert_eq!(item.touch_count, 1);
        assert_eq!(item.next_touch_index, 1);
        assert!(item.in_burst());
        assert_eq!(
            item.lru_k_key,
            LruKKey {
                full_history: false,
                reference_tick: 10,
                sequence: 7
            }
        );
        assert!(item.covers(100));
        assert!(item.covers(149));
        assert!(!item.covers(150));
    }

    #[test]
    fn test_second_reference_leaves_burst() {
        let mut item = item(0);
        assert_eq!(
            item.touch(5, 0, false),
            TouchOutcome::Recorded { left_burst: true }
        );
        assert_eq!(
            item.touch(6, 0, false),
            TouchOutcome::Recorded { left_burst: false }
        );
        assert!(!item.in_burst());
    }

    #[test]
    fn test_correlated_reference_only_moves_last_touch() {
        let mut item = item(0);
        assert_eq!(item.touch(1_000, 5_000, false), TouchOutcome::Correlated);
        assert_eq!(item.next_touch_index, 1);
        assert_eq!(item.last_touch, 1_000);

        // The window slides with every correlated reference.
        assert_eq!(item.touch(5_500, 5_000, false), TouchOutcome::Correlated);
        assert!(matches!(item.touch(5_500, 5_000, true), TouchOutcome::Recorded { .. }));
        assert_eq!(item.next_touch_index, 2);
    }

    #[test]
    fn test_full_history_key_uses_kth_reference() {
        let mut item = item(100);
        item.touch(200, 0, false);
        item.touch(300, 0, false);
        assert_eq!(item.compute_lru_k_key().reference_tick, 100);

        item.touch(400, 0, false);
        let key = item.compute_lru_k_key();
        assert!(key.full_history);
        assert_eq!(key.reference_tick, 200);
    }

    #[test]
    fn test_history_order_follows_ring() {
        let mut item = item(100);
        assert!(item.history_is_ordered());
        for now in [200, 300, 400, 500] {
            item.touch(now, 0, false);
            assert!(item.history_is_ordered());
        }

        // A reference recorded with an earlier tick than the previous one.
        item.touch(450, 0, false);
        assert!(!item.history_is_ordered());
    }

    #[test]
    fn test_partial_history_sorts_first() {
        let partial = LruKKey {
            full_history: false,
            reference_tick: 900,
            sequence: 9,
        };
        let full = LruKKey {
            full_history: true,
            reference_tick: 1,
            sequence: 1,
        };
        assert!(partial < full);
    }
}
