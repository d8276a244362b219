//! The byte-range read cache.
//!
//! Every cached range is one [`CacheItem`] stored in a slot arena and linked
//! into three intrusive structures at once:
//!
//! - the range index, ordered by `(stream, offset)`
//! - the LRU-K index, ordered by [`LruKKey`] (first = next eviction victim)
//! - the LRU list, most recently referenced first
//!
//! All state sits behind one mutex. Removed items are collected on a delete
//! list while locked; their subscriptions fire and their buffers drop only
//! after the lock is released.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, error, info, trace, warn};

use super::buffer::{BufferElement, StreamId};
use super::clock::{MonotonicClock, TickSource};
use super::item::{
    lru_field, lru_k_field, lru_k_order, range_field, range_order, CacheItem, ItemCompare,
    ItemRef, LruKKey, TouchOutcome,
};
use super::subscription::{EvictionOutcome, EvictionSubscription, Registration};
use crate::config::CacheConfig;
use crate::table::{Addressing, Arena, ArenaError, IntrusiveList, NodeTable, SlotId};

#[derive(Error, Debug)]
pub enum CacheError {
    #[error("No cached range covers stream {stream} offset {offset}")]
    KeyNotFound { stream: StreamId, offset: u64 },

    #[error("Range index already holds stream {stream} offset {offset}")]
    AlreadyExists { stream: StreamId, offset: u64 },

    #[error("Insufficient resources: {0}")]
    InsufficientResources(String),

    #[error("Invalid state: {0}")]
    InvalidState(&'static str),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),
}

impl From<ArenaError> for CacheError {
    fn from(err: ArenaError) -> Self {
        CacheError::InsufficientResources(err.to_string())
    }
}

/// Configured budgets in bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct CacheSize {
    pub total: u64,
    pub burst: u64,
}

/// Current usage in bytes.
///
/// `burst` counts only items referenced exactly once since insertion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct CacheUsage {
    pub total: u64,
    pub burst: u64,
    pub items: usize,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub inserts: u64,
    pub evictions: u64,
    pub overlap_removals: u64,
    pub range_removals: u64,
    pub correlated_touches: u64,
}

impl CacheStats {
    /// Hit rate (0.0 to 1.0).
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

/// Snapshot of one cached item, taken without counting as a reference.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ItemInfo {
    pub stream: StreamId,
    pub offset: u64,
    pub length: u64,
    pub touch_count: u32,
    pub next_touch_index: usize,
    pub last_touch_tick: u64,
    pub lru_k_key: LruKKey,
    pub in_burst: bool,
    pub pending_subscriptions: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RemovalReason {
    Evicted,
    Overlapped,
    RangeRemoved,
    Shutdown,
}

impl fmt::Display for RemovalReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RemovalReason::Evicted => write!(f, "evicted"),
            RemovalReason::Overlapped => write!(f, "overlapped"),
            RemovalReason::RangeRemoved => write!(f, "range-removed"),
            RemovalReason::Shutdown => write!(f, "shutdown"),
        }
    }
}

type ItemIndex<B> = NodeTable<CacheItem<B>, SlotId, ItemCompare<B>>;

/// Items unlinked under the lock, finished after it is released.
type DeleteList<B> = Vec<CacheItem<B>>;

struct CacheState<B> {
    items: Arena<CacheItem<B>>,
    range_index: ItemIndex<B>,
    lru_k_index: ItemIndex<B>,
    lru: IntrusiveList<CacheItem<B>, SlotId>,
    size: CacheSize,
    usage: CacheUsage,
    next_sequence: u64,
    correlation_window: u64,
    stats: CacheStats,
    shut_down: bool,
}

impl<B: BufferElement> CacheState<B> {
    fn new(config: &CacheConfig) -> Self {
        let mut state = Self {
            items: Arena::new(),
            range_index: NodeTable::new(range_field(), range_order()),
            lru_k_index: NodeTable::new(lru_k_field(), lru_k_order()),
            lru: IntrusiveList::new(lru_field()),
            size: CacheSize::default(),
            usage: CacheUsage::default(),
            next_sequence: 0,
            correlation_window: 0,
            stats: CacheStats::default(),
            shut_down: false,
        };
        state.configure(config);
        state
    }

    fn configure(&mut self, config: &CacheConfig) {
        self.size = CacheSize {
            total: config.total_cache_size,
            burst: config.target_burst_cache_size,
        };
        self.correlation_window =
            u64::try_from(config.correlation_window().as_millis()).unwrap_or(u64::MAX);
    }

    fn ensure_open(&self) -> Result<(), CacheError> {
        if self.shut_down {
            Err(CacheError::InvalidState("read cache has been shut down"))
        } else {
            Ok(())
        }
    }

    /// The item whose range contains `offset`.
    fn covering(&self, stream: StreamId, offset: u64) -> Option<SlotId> {
        let id = self
            .range_index
            .lookup_equal_or_previous_by(&self.items, |item| item.range_cmp(stream, offset))?;
        let item = self.items.record(id);
        (item.stream == stream && item.covers(offset)).then_some(id)
    }

    /// Every item of `stream` intersecting `[start, end)`, ascending.
    fn overlapping(&self, stream: StreamId, start: u64, end: u64) -> Vec<SlotId> {
        let mut found = Vec::new();
        let anchor = self
            .range_index
            .lookup_equal_or_previous_by(&self.items, |item| item.range_cmp(stream, start));

        let mut backward = anchor;
        while let Some(id) = backward {
            let item = self.items.record(id);
            if item.stream != stream || item.end() <= start {
                break;
            }
            found.push(id);
            backward = self.range_index.previous(&self.items, id);
        }
        found.reverse();

        let mut forward = match anchor {
            Some(id) => self.range_index.next(&self.items, id),
            None => self.range_index.first(&self.items),
        };
        while let Some(id) = forward {
            let item = self.items.record(id);
            if item.stream != stream || item.offset >= end {
                break;
            }
            found.push(id);
            forward = self.range_index.next(&self.items, id);
        }
        found
    }

    fn resolve(&self, target: ItemRef) -> Option<SlotId> {
        self.items
            .get(target.slot)
            .filter(|item| item.sequence == target.sequence)
            .map(|_| target.slot)
    }

    fn insert(
        &mut self,
        stream: StreamId,
        offset: u64,
        buffer: B,
        now: u64,
        delete_list: &mut DeleteList<B>,
    ) -> Result<(), CacheError> {
        self.ensure_open()?;
        let sequence = self.next_sequence;
        self.next_sequence += 1;

        // Allocate before touching any structure so a failure changes nothing.
        let id = self
            .items
            .try_insert(CacheItem::new(stream, offset, buffer, sequence, now))?;
        let (length, end) = {
            let item = self.items.record(id);
            (item.length, item.end())
        };

        for victim in self.overlapping(stream, offset, end) {
            self.unlink(victim, RemovalReason::Overlapped, delete_list);
        }

        if !self.range_index.insert(&mut self.items, id) {
            error!(%stream, offset, "Range index rejected a range with no overlap");
            self.items.remove(id);
            return Err(CacheError::AlreadyExists { stream, offset });
        }
        self.lru.push_front(&mut self.items, id);
        self.items.record_mut(id).in_lru = true;
        let linked = self.lru_k_index.insert(&mut self.items, id);
        debug_assert!(linked, "LRU-K keys are unique by sequence");

        self.usage.total += length;
        self.usage.burst += length;
        self.usage.items += 1;
        self.stats.inserts += 1;
        trace!(%stream, offset, length, sequence, "Cached range");

        self.evict(Some(id), delete_list);
        Ok(())
    }

    /// Record a reference to `id` and re-seat it in the LRU-K index.
    /// Returns `false` when the reference fell inside the correlation window.
    fn touch(&mut self, id: SlotId, now: u64, bypass: bool) -> bool {
        let window = self.correlation_window;
        let item = self.items.record_mut(id);
        item.prune_subscriptions();
        match item.touch(now, window, bypass) {
            TouchOutcome::Correlated => {
                self.stats.correlated_touches += 1;
                trace!(slot = %id, now, "Correlated reference suppressed");
                false
            }
            TouchOutcome::Recorded { left_burst } => {
                if left_burst {
                    let length = self.items.record(id).length;
                    self.usage.burst = self.usage.burst.saturating_sub(length);
                }
                if self.items.record(id).in_lru {
                    self.lru.move_to_front(&mut self.items, id);
                }

                self.lru_k_index.remove(&mut self.items, id);
                let item = self.items.record_mut(id);
                item.lru_k_key = item.compute_lru_k_key();
                let linked = self.lru_k_index.insert(&mut self.items, id);
                debug_assert!(linked, "LRU-K keys are unique by sequence");
                trace!(slot = %id, now, left_burst, "Reference recorded");
                true
            }
        }
    }

    fn over_budget(&self) -> bool {
        self.usage.total > self.size.total || self.usage.burst > self.size.burst
    }

    /// The coldest item other than `pinned`. Under burst pressure alone only
    /// items still counted against the burst budget qualify.
    fn eviction_candidate(&self, pinned: Option<SlotId>) -> Option<SlotId> {
        let burst_only = self.usage.total <= self.size.total;
        let mut cursor = self.lru_k_index.first(&self.items);
        while let Some(id) = cursor {
            if Some(id) != pinned && (!burst_only || self.items.record(id).in_burst()) {
                return Some(id);
            }
            cursor = self.lru_k_index.next(&self.items, id);
        }
        None
    }

    /// Evict from the cold end of the LRU-K index until both budgets hold.
    /// `pinned` (the item just inserted) is never chosen.
    fn evict(&mut self, pinned: Option<SlotId>, delete_list: &mut DeleteList<B>) {
        let mut evicted = 0usize;
        let mut freed = 0u64;
        while self.over_budget() {
            let Some(victim) = self.eviction_candidate(pinned) else {
                warn!(
                    total_usage = self.usage.total,
                    total_budget = self.size.total,
                    burst_usage = self.usage.burst,
                    burst_budget = self.size.burst,
                    "No eviction candidates left with budgets still exceeded"
                );
                break;
            };
            freed += self.items.record(victim).length;
            self.unlink(victim, RemovalReason::Evicted, delete_list);
            evicted += 1;
        }

        if evicted > 0 {
            info!(
                evicted,
                freed,
                total_usage = self.usage.total,
                burst_usage = self.usage.burst,
                "Eviction pass complete"
            );
        }
    }

    /// Take `id` out of every structure and the usage counters.
    fn unlink(&mut self, id: SlotId, reason: RemovalReason, delete_list: &mut DeleteList<B>) {
        self.range_index.remove(&mut self.items, id);
        self.lru_k_index.remove(&mut self.items, id);
        if self.items.record(id).in_lru {
            self.lru.unlink(&mut self.items, id);
        }
        let Some(mut item) = self.items.remove(id) else {
            return;
        };
        item.in_lru = false;

        self.usage.total = self.usage.total.saturating_sub(item.length);
        if item.in_burst() {
            self.usage.burst = self.usage.burst.saturating_sub(item.length);
        }
        self.usage.items -= 1;

        match reason {
            RemovalReason::Evicted => self.stats.evictions += 1,
            RemovalReason::Overlapped => self.stats.overlap_removals += 1,
            RemovalReason::RangeRemoved => self.stats.range_removals += 1,
            RemovalReason::Shutdown => {}
        }
        debug!(
            stream = %item.stream,
            offset = item.offset,
            length = item.length,
            subscriptions = item.subscriptions.len(),
            %reason,
            "Removed cached range"
        );
        delete_list.push(item);
    }

    fn info(&self, id: SlotId) -> ItemInfo {
        let item = self.items.record(id);
        ItemInfo {
            stream: item.stream,
            offset: item.offset,
            length: item.length,
            touch_count: item.touch_count,
            next_touch_index: item.next_touch_index,
            last_touch_tick: item.last_touch,
            lru_k_key: item.lru_k_key,
            in_burst: item.in_burst(),
            pending_subscriptions: item.subscriptions.len(),
        }
    }

    fn verify(&self) -> bool {
        if !self.range_index.verify_table(&self.items) || !self.lru_k_index.verify_table(&self.items) {
            return false;
        }
        let count = self.items.len();
        if self.range_index.count() != count
            || self.lru_k_index.count() != count
            || self.lru.len() != count
            || self.usage.items != count
        {
            debug!(
                items = count,
                range_index = self.range_index.count(),
                lru_k_index = self.lru_k_index.count(),
                lru = self.lru.len(),
                "Structure sizes disagree"
            );
            return false;
        }

        let mut total = 0;
        let mut burst = 0;
        let mut previous: Option<SlotId> = None;
        for id in self.range_index.iter(&self.items) {
            let item = self.items.record(id);
            total += item.length;
            if item.in_burst() {
                burst += item.length;
            }
            if item.lru_k_key != item.compute_lru_k_key() {
                debug!(slot = %id, "Stale LRU-K key");
                return false;
            }
            if !item.history_is_ordered() {
                debug!(slot = %id, history = ?item.touch_history, "Reference history out of order");
                return false;
            }
            if let Some(previous) = previous {
                let before = self.items.record(previous);
                if before.stream == item.stream && before.end() > item.offset {
                    debug!(slot = %id, "Overlapping cached ranges");
                    return false;
                }
            }
            previous = Some(id);
        }
        if total != self.usage.total || burst != self.usage.burst {
            debug!(total, burst, usage = ?self.usage, "Usage counters disagree");
            return false;
        }

        let forward: Vec<SlotId> = self.lru.iter(&self.items).collect();
        let mut backward = Vec::with_capacity(forward.len());
        let mut cursor = self.lru.tail();
        while let Some(id) = cursor {
            if backward.len() == forward.len() {
                break;
            }
            backward.push(id);
            cursor = self.lru.prev(&self.items, id);
        }
        backward.reverse();
        if forward != backward || self.lru.head() != forward.first().copied() {
            debug!(forward = forward.len(), backward = backward.len(), "LRU list links disagree");
            return false;
        }
        true
    }
}

/// Byte-range cache keyed by `(stream, offset)` with LRU-K eviction.
pub struct ReadCache<B = Bytes> {
    state: Mutex<CacheState<B>>,
    clock: Arc<dyn TickSource>,
    next_subscription: AtomicU64,
}

impl<B: BufferElement> ReadCache<B> {
    pub fn new(config: CacheConfig) -> Result<Self, CacheError> {
        Self::with_clock(config, Arc::new(MonotonicClock::new()))
    }

    pub fn with_clock(config: CacheConfig, clock: Arc<dyn TickSource>) -> Result<Self, CacheError> {
        config.validate()?;
        info!(
            total = config.total_cache_size,
            burst = config.target_burst_cache_size,
            correlated_timeout_secs = config.correlated_reference_timeout_in_seconds,
            "Read cache created"
        );
        Ok(Self {
            state: Mutex::new(CacheState::new(&config)),
            clock,
            next_subscription: AtomicU64::new(0),
        })
    }

    /// Cache `buffer` as the contents of `stream` starting at `offset`.
    ///
    /// Cached ranges that intersect the new one are removed first and their
    /// subscriptions fire. Exceeding a budget afterwards triggers eviction.
    pub fn add(&self, stream: StreamId, offset: u64, buffer: B) -> Result<(), CacheError> {
        let length = buffer.byte_len();
        if length == 0 {
            return Err(CacheError::InvalidArgument("empty buffer".to_string()));
        }
        if offset.checked_add(length).is_none() {
            return Err(CacheError::InvalidArgument(format!(
                "range at {offset} with length {length} overflows"
            )));
        }

        let mut delete_list = Vec::new();
        let mut state = self.state.lock();
        let now = self.clock.now_ticks();
        let result = state.insert(stream, offset, buffer, now, &mut delete_list);
        drop(state);
        retire(delete_list);
        result
    }

    /// The cached range containing `offset`, as `(actual_offset, buffer)`.
    /// A hit counts as a reference.
    pub fn query(&self, stream: StreamId, offset: u64) -> Option<(u64, B)> {
        let mut state = self.state.lock();
        let now = self.clock.now_ticks();
        let Some(id) = state.covering(stream, offset) else {
            state.stats.misses += 1;
            return None;
        };
        state.stats.hits += 1;
        state.touch(id, now, false);
        let item = state.items.record(id);
        Some((item.offset, item.buffer.clone()))
    }

    /// Start of the first cached range of `stream` at or after `offset`.
    /// Not a reference.
    pub fn query_equal_or_next(&self, stream: StreamId, offset: u64) -> Option<u64> {
        let state = self.state.lock();
        let id = state
            .range_index
            .lookup_equal_or_next_by(&state.items, |item| item.range_cmp(stream, offset))?;
        let item = state.items.record(id);
        (item.stream == stream).then_some(item.offset)
    }

    /// Record a reference to the range containing `offset` without reading it.
    /// Returns whether the reference entered the history (it does not when it
    /// falls inside the correlation window and `bypass_correlation` is unset).
    pub fn touch_range(
        &self,
        stream: StreamId,
        offset: u64,
        bypass_correlation: bool,
    ) -> Result<bool, CacheError> {
        let mut state = self.state.lock();
        state.ensure_open()?;
        let now = self.clock.now_ticks();
        let id = state
            .covering(stream, offset)
            .ok_or(CacheError::KeyNotFound { stream, offset })?;
        Ok(state.touch(id, now, bypass_correlation))
    }

    /// Remove every cached range of `stream` intersecting
    /// `[offset, offset + length)`. Returns how many were removed.
    pub fn remove_range(&self, stream: StreamId, offset: u64, length: u64) -> Result<usize, CacheError> {
        if length == 0 {
            return Ok(0);
        }
        let end = offset.saturating_add(length);
        let mut delete_list = Vec::new();
        {
            let mut state = self.state.lock();
            state.ensure_open()?;
            for id in state.overlapping(stream, offset, end) {
                state.unlink(id, RemovalReason::RangeRemoved, &mut delete_list);
            }
        }
        let removed = delete_list.len();
        retire(delete_list);
        Ok(removed)
    }

    /// A fresh, unarmed subscription.
    pub fn allocate_register_for_eviction(&self) -> EvictionSubscription {
        EvictionSubscription::new(self.next_subscription.fetch_add(1, Ordering::Relaxed))
    }

    /// Arm `subscription` on the item covering `(stream, offset)`.
    ///
    /// When nothing covers the offset the subscription completes immediately
    /// with [`EvictionOutcome::NotFound`].
    pub fn register_for_eviction(
        &self,
        subscription: &mut EvictionSubscription,
        stream: StreamId,
        offset: u64,
    ) -> Result<Registration, CacheError> {
        let pending = {
            let mut state = self.state.lock();
            state.ensure_open()?;
            let pending = subscription.arm(stream, offset)?;
            match state.covering(stream, offset) {
                Some(id) => {
                    let item = state.items.record_mut(id);
                    item.prune_subscriptions();
                    subscription.set_target(item.item_ref(id));
                    item.subscriptions.push(pending);
                    trace!(%stream, offset, subscription = subscription.id(), "Armed eviction subscription");
                    return Ok(Registration::Armed);
                }
                None => pending,
            }
        };
        pending.fire(EvictionOutcome::NotFound);
        Ok(Registration::NotFound)
    }

    /// Cancel an armed subscription. Returns `false` when it already fired
    /// (or was never armed); the outcome it fired with stands.
    pub fn cancel_eviction(&self, subscription: &mut EvictionSubscription) -> bool {
        let Some(target) = subscription.target() else {
            return false;
        };
        let mut state = self.state.lock();
        let pending = match state.resolve(target) {
            Some(id) => {
                let subscriptions = &mut state.items.record_mut(id).subscriptions;
                subscriptions
                    .iter()
                    .position(|p| p.id == subscription.id())
                    .map(|position| subscriptions.swap_remove(position))
            }
            None => None,
        };
        drop(state);
        match pending {
            Some(pending) => {
                drop(pending);
                subscription.complete(EvictionOutcome::Cancelled);
                true
            }
            None => false,
        }
    }

    /// Refresh the recency of the item an armed subscription watches.
    ///
    /// The subscription stays armed. Returns `false` when the item is gone
    /// (the subscription has fired) or the subscription was cancelled.
    pub fn touch(&self, subscription: &EvictionSubscription) -> bool {
        let Some(target) = subscription.target() else {
            return false;
        };
        let mut state = self.state.lock();
        let now = self.clock.now_ticks();
        let Some(id) = state.resolve(target) else {
            return false;
        };
        let armed = state
            .items
            .record(id)
            .subscriptions
            .iter()
            .any(|p| p.id == subscription.id());
        if armed {
            state.touch(id, now, false);
        }
        armed
    }

    /// Change both budgets, evicting at once if usage now exceeds them.
    pub fn set_cache_size(&self, total: u64, burst: u64) -> Result<(), CacheError> {
        validate_budgets(total, burst)?;
        let mut delete_list = Vec::new();
        {
            let mut state = self.state.lock();
            state.ensure_open()?;
            let previous = state.size;
            state.size = CacheSize { total, burst };
            info!(
                total,
                burst,
                previous_total = previous.total,
                previous_burst = previous.burst,
                "Cache budgets changed"
            );
            state.evict(None, &mut delete_list);
        }
        retire(delete_list);
        Ok(())
    }

    pub fn query_cache_size(&self) -> CacheSize {
        self.state.lock().size
    }

    pub fn query_cache_usage(&self) -> CacheUsage {
        self.state.lock().usage
    }

    pub fn stats(&self) -> CacheStats {
        self.state.lock().stats.clone()
    }

    pub fn len(&self) -> usize {
        self.state.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Inspect the item covering `offset` without counting a reference.
    pub fn inspect(&self, stream: StreamId, offset: u64) -> Option<ItemInfo> {
        let state = self.state.lock();
        state.covering(stream, offset).map(|id| state.info(id))
    }

    /// `(stream, offset)` of every item, most recently referenced first.
    pub fn lru_order(&self) -> Vec<(StreamId, u64)> {
        let state = self.state.lock();
        let order = state
            .lru
            .iter(&state.items)
            .map(|id| {
                let item = state.items.record(id);
                (item.stream, item.offset)
            })
            .collect();
        order
    }

    /// `(stream, offset)` of every item in eviction order.
    pub fn lru_k_order(&self) -> Vec<(StreamId, u64)> {
        let state = self.state.lock();
        let order = state
            .lru_k_index
            .iter(&state.items)
            .map(|id| {
                let item = state.items.record(id);
                (item.stream, item.offset)
            })
            .collect();
        order
    }

    /// Check both indexes, the LRU list and the usage counters against each
    /// other.
    pub fn verify(&self) -> bool {
        self.state.lock().verify()
    }

    /// Remove everything and refuse further mutation. Pending subscriptions
    /// complete with [`EvictionOutcome::Evicted`]. Returns the number of
    /// items dropped.
    pub fn shutdown(&self) -> usize {
        let mut delete_list = Vec::new();
        {
            let mut state = self.state.lock();
            if state.shut_down {
                return 0;
            }
            state.shut_down = true;
            while let Some(id) = state.range_index.first(&state.items) {
                state.unlink(id, RemovalReason::Shutdown, &mut delete_list);
            }
            info!(dropped = delete_list.len(), "Read cache shut down");
        }
        let dropped = delete_list.len();
        retire(delete_list);
        dropped
    }
}

pub(crate) fn validate_budgets(total: u64, burst: u64) -> Result<(), CacheError> {
    if burst > total {
        return Err(CacheError::InvalidArgument(format!(
            "burst budget {burst} exceeds total budget {total}"
        )));
    }
    Ok(())
}

/// Fire subscriptions of removed items and drop them. Never call under the lock.
fn retire<B>(delete_list: DeleteList<B>) {
    for mut item in delete_list {
        for pending in item.subscriptions.drain(..) {
            pending.fire(EvictionOutcome::Evicted);
        }
    }
}
