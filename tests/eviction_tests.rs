//! Integration tests for the eviction policy and eviction subscriptions.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;

use stream_read_cache::{
    CacheConfig, CacheError, EvictionOutcome, ManualClock, ReadCache, Registration, StreamId,
};

fn make_cache(total: u64, burst: u64, correlated_timeout: u32) -> (ReadCache, ManualClock) {
    let config = CacheConfig {
        total_cache_size: total,
        target_burst_cache_size: burst,
        correlated_reference_timeout_in_seconds: correlated_timeout,
    };
    let clock = ManualClock::new();
    let cache = ReadCache::with_clock(config, Arc::new(clock.clone())).unwrap();
    (cache, clock)
}

fn block(len: usize) -> Bytes {
    Bytes::from(vec![0u8; len])
}

#[test]
fn test_burst_budget_enforced_independently() {
    let (cache, clock) = make_cache(300, 100, 0);
    let stream = StreamId::from(1u128);

    cache.add(stream, 0, block(100)).unwrap();
    clock.advance(Duration::from_millis(1));
    cache.add(stream, 100, block(100)).unwrap();

    // Total usage (200) fits, burst usage does not.
    assert_eq!(cache.query_equal_or_next(stream, 0), Some(100));
    assert!(cache.inspect(stream, 0).is_none());

    clock.advance(Duration::from_millis(1));
    cache.add(stream, 200, block(100)).unwrap();

    let usage = cache.query_cache_usage();
    assert_eq!(usage.total, 100);
    assert_eq!(usage.burst, 100);
    assert_eq!(cache.lru_order(), vec![(stream, 200)]);
    assert_eq!(cache.stats().evictions, 2);
}

#[test]
fn test_burst_pressure_spares_proven_items() {
    let (cache, clock) = make_cache(1_000, 100, 0);
    let stream = StreamId::from(1u128);
    for offset in [0, 100, 200] {
        cache.add(stream, offset, block(100)).unwrap();
        clock.advance(Duration::from_millis(1));
        for _ in 0..2 {
            cache.query(stream, offset).unwrap();
            clock.advance(Duration::from_millis(1));
        }
    }
    assert_eq!(cache.query_cache_usage().burst, 0);

    // Only the new item counts against the burst budget, and it is pinned.
    cache.add(stream, 300, block(150)).unwrap();

    let usage = cache.query_cache_usage();
    assert_eq!(usage.items, 4);
    assert_eq!(usage.total, 450);
    assert_eq!(usage.burst, 150);
    assert_eq!(cache.stats().evictions, 0);
    assert!(cache.verify());
}

#[test]
fn test_scan_evicts_only_scan_items() {
    let (cache, clock) = make_cache(10_000, 300, 0);
    let hot = StreamId::from(1u128);
    let scan = StreamId::from(2u128);
    cache.add(hot, 0, block(100)).unwrap();
    clock.advance(Duration::from_millis(1));
    cache.query(hot, 0).unwrap();

    for index in 0..4u64 {
        clock.advance(Duration::from_millis(1));
        cache.add(scan, index * 100, block(100)).unwrap();
    }

    // The hot item sorts first in LRU-K order but frees no burst bytes.
    assert!(cache.inspect(hot, 0).is_some());
    assert!(cache.inspect(scan, 0).is_none());
    let usage = cache.query_cache_usage();
    assert_eq!(usage.total, 400);
    assert_eq!(usage.burst, 300);
    assert_eq!(cache.stats().evictions, 1);
}

#[test]
fn test_proven_items_do_not_count_against_burst() {
    let (cache, clock) = make_cache(300, 100, 0);
    let stream = StreamId::from(1u128);

    cache.add(stream, 0, block(100)).unwrap();
    clock.advance(Duration::from_millis(1));
    cache.query(stream, 0).unwrap();
    clock.advance(Duration::from_millis(1));
    cache.add(stream, 100, block(100)).unwrap();

    assert_eq!(cache.len(), 2);
    let usage = cache.query_cache_usage();
    assert_eq!(usage.total, 200);
    assert_eq!(usage.burst, 100);
}

#[test]
fn test_lru_k_evicts_item_without_full_history() {
    let (cache, clock) = make_cache(300, 300, 0);
    let stream = StreamId::from(1u128);

    for offset in [0, 100, 200] {
        cache.add(stream, offset, block(100)).unwrap();
        clock.advance(Duration::from_millis(10));
    }
    for _ in 0..2 {
        cache.query(stream, 150).unwrap();
        clock.advance(Duration::from_millis(10));
    }

    let b = cache.inspect(stream, 100).unwrap();
    assert_eq!(b.touch_count, 3);
    assert!(b.lru_k_key.full_history);
    assert_eq!(
        cache.lru_k_order(),
        vec![(stream, 0), (stream, 200), (stream, 100)]
    );

    cache.add(stream, 300, block(100)).unwrap();

    assert!(cache.inspect(stream, 0).is_none());
    assert!(cache.inspect(stream, 100).is_some());
    assert!(cache.inspect(stream, 200).is_some());
    assert!(cache.verify());
}

#[test]
fn test_full_histories_ordered_by_kth_reference() {
    let (cache, clock) = make_cache(10_000, 10_000, 0);
    let stream = StreamId::from(1u128);

    // A: references at 0, 10, 50. B: references at 20, 30, 40.
    clock.set(0);
    cache.add(stream, 0, block(10)).unwrap();
    clock.set(10);
    cache.query(stream, 0).unwrap();
    clock.set(20);
    cache.add(stream, 10, block(10)).unwrap();
    clock.set(30);
    cache.query(stream, 10).unwrap();
    clock.set(40);
    cache.query(stream, 10).unwrap();
    clock.set(50);
    cache.query(stream, 0).unwrap();

    // A's third most recent reference (0) is older than B's (20).
    assert_eq!(cache.lru_k_order(), vec![(stream, 0), (stream, 10)]);
    // Plain LRU would evict from the other end.
    assert_eq!(cache.lru_order(), vec![(stream, 0), (stream, 10)]);

    cache.set_cache_size(10, 10).unwrap();
    assert!(cache.inspect(stream, 0).is_none());
    assert!(cache.inspect(stream, 10).is_some());
}

#[test]
fn test_correlated_references_are_suppressed() {
    let (cache, clock) = make_cache(1_000, 1_000, 5);
    let stream = StreamId::from(1u128);
    cache.add(stream, 0, block(10)).unwrap();
    assert_eq!(cache.inspect(stream, 0).unwrap().next_touch_index, 1);

    clock.advance(Duration::from_secs(10));
    assert!(cache.touch_range(stream, 0, false).unwrap());
    assert_eq!(cache.inspect(stream, 0).unwrap().next_touch_index, 2);

    clock.advance(Duration::from_secs(1));
    assert!(!cache.touch_range(stream, 0, false).unwrap());
    let info = cache.inspect(stream, 0).unwrap();
    assert_eq!(info.next_touch_index, 2);
    assert_eq!(info.touch_count, 2);
    assert_eq!(info.last_touch_tick, 11_000);

    clock.advance(Duration::from_secs(10));
    assert!(cache.touch_range(stream, 0, false).unwrap());
    assert_eq!(cache.inspect(stream, 0).unwrap().next_touch_index, 0);
    assert_eq!(cache.stats().correlated_touches, 1);
}

#[test]
fn test_correlated_queries_do_not_leave_burst() {
    let (cache, clock) = make_cache(1_000, 1_000, 5);
    let stream = StreamId::from(1u128);
    cache.add(stream, 0, block(100)).unwrap();

    for _ in 0..4 {
        clock.advance(Duration::from_millis(500));
        assert!(cache.query(stream, 0).is_some());
    }
    let info = cache.inspect(stream, 0).unwrap();
    assert!(info.in_burst);
    assert_eq!(cache.query_cache_usage().burst, 100);

    // Bypassing suppression records the reference anyway.
    assert!(cache.touch_range(stream, 0, true).unwrap());
    assert_eq!(cache.query_cache_usage().burst, 0);
}

#[test]
fn test_eviction_fires_subscription_once() {
    let (cache, clock) = make_cache(200, 200, 0);
    let stream = StreamId::from(1u128);
    cache.add(stream, 0, block(100)).unwrap();
    clock.advance(Duration::from_millis(1));
    cache.add(stream, 100, block(100)).unwrap();

    let mut subscription = cache.allocate_register_for_eviction();
    assert_eq!(
        cache.register_for_eviction(&mut subscription, stream, 50).unwrap(),
        Registration::Armed
    );
    assert_eq!(cache.inspect(stream, 0).unwrap().pending_subscriptions, 1);

    clock.advance(Duration::from_millis(1));
    cache.add(stream, 200, block(100)).unwrap();

    assert_eq!(subscription.try_outcome(), Some(EvictionOutcome::Evicted));
    // Cancelling after the fact changes nothing.
    assert!(!cache.cancel_eviction(&mut subscription));
    assert_eq!(subscription.try_outcome(), Some(EvictionOutcome::Evicted));
    assert!(!cache.touch(&subscription));
}

#[test]
fn test_cancel_before_eviction_wins() {
    let (cache, _) = make_cache(1_000, 1_000, 0);
    let stream = StreamId::from(1u128);
    cache.add(stream, 0, block(100)).unwrap();

    let mut subscription = cache.allocate_register_for_eviction();
    cache.register_for_eviction(&mut subscription, stream, 0).unwrap();
    assert!(cache.cancel_eviction(&mut subscription));
    assert_eq!(subscription.try_outcome(), Some(EvictionOutcome::Cancelled));
    assert_eq!(cache.inspect(stream, 0).unwrap().pending_subscriptions, 0);

    assert_eq!(cache.remove_range(stream, 0, 100).unwrap(), 1);
    assert_eq!(subscription.try_outcome(), Some(EvictionOutcome::Cancelled));
    assert!(!cache.cancel_eviction(&mut subscription));
}

#[test]
fn test_register_on_missing_item_completes_not_found() {
    let (cache, _) = make_cache(1_000, 1_000, 0);
    let stream = StreamId::from(1u128);
    cache.add(stream, 0, block(100)).unwrap();

    let mut subscription = cache.allocate_register_for_eviction();
    assert_eq!(
        cache.register_for_eviction(&mut subscription, stream, 100).unwrap(),
        Registration::NotFound
    );
    assert_eq!(subscription.try_outcome(), Some(EvictionOutcome::NotFound));
    assert!(!cache.cancel_eviction(&mut subscription));

    // Subscriptions are single-use.
    assert!(matches!(
        cache.register_for_eviction(&mut subscription, stream, 0),
        Err(CacheError::InvalidState(_))
    ));
}

#[test]
fn test_touch_through_subscription_refreshes_recency() {
    let (cache, clock) = make_cache(300, 300, 0);
    let stream = StreamId::from(1u128);
    for offset in [0, 100, 200] {
        cache.add(stream, offset, block(100)).unwrap();
        clock.advance(Duration::from_millis(10));
    }

    let mut subscription = cache.allocate_register_for_eviction();
    cache.register_for_eviction(&mut subscription, stream, 0).unwrap();
    for _ in 0..2 {
        assert!(cache.touch(&subscription));
        clock.advance(Duration::from_millis(10));
    }
    assert_eq!(cache.lru_order()[0], (stream, 0));
    assert_eq!(subscription.try_outcome(), None);

    // The oldest item now has a full history, so the next oldest goes.
    cache.add(stream, 300, block(100)).unwrap();
    assert!(cache.inspect(stream, 0).is_some());
    assert!(cache.inspect(stream, 100).is_none());
    assert_eq!(subscription.try_outcome(), None);

    cache.remove_range(stream, 0, 1).unwrap();
    assert_eq!(subscription.try_outcome(), Some(EvictionOutcome::Evicted));
    assert!(!cache.touch(&subscription));
}

#[test]
fn test_shrinking_budget_evicts_immediately() {
    let (cache, clock) = make_cache(1_000, 1_000, 0);
    let stream = StreamId::from(1u128);
    let mut subscriptions = Vec::new();
    for i in 0..5u64 {
        cache.add(stream, i * 100, block(100)).unwrap();
        let mut subscription = cache.allocate_register_for_eviction();
        cache.register_for_eviction(&mut subscription, stream, i * 100).unwrap();
        subscriptions.push(subscription);
        clock.advance(Duration::from_millis(1));
    }

    cache.set_cache_size(250, 250).unwrap();

    let size = cache.query_cache_size();
    assert_eq!((size.total, size.burst), (250, 250));
    assert_eq!(cache.query_cache_usage().total, 200);
    let outcomes: Vec<_> = subscriptions.iter_mut().map(|s| s.try_outcome()).collect();
    assert_eq!(
        outcomes,
        vec![
            Some(EvictionOutcome::Evicted),
            Some(EvictionOutcome::Evicted),
            Some(EvictionOutcome::Evicted),
            None,
            None,
        ]
    );
    assert!(cache.verify());
}

#[test]
fn test_dropped_subscriptions_are_pruned() {
    let (cache, _) = make_cache(1_000, 1_000, 0);
    let stream = StreamId::from(1u128);
    cache.add(stream, 0, block(100)).unwrap();

    for _ in 0..10 {
        let mut subscription = cache.allocate_register_for_eviction();
        cache.register_for_eviction(&mut subscription, stream, 0).unwrap();
    }
    assert_eq!(cache.inspect(stream, 0).unwrap().pending_subscriptions, 10);

    let mut kept = cache.allocate_register_for_eviction();
    cache.register_for_eviction(&mut kept, stream, 0).unwrap();
    assert_eq!(cache.inspect(stream, 0).unwrap().pending_subscriptions, 1);

    let mut dropped = cache.allocate_register_for_eviction();
    cache.register_for_eviction(&mut dropped, stream, 0).unwrap();
    drop(dropped);
    cache.query(stream, 0).unwrap();
    assert_eq!(cache.inspect(stream, 0).unwrap().pending_subscriptions, 1);

    cache.remove_range(stream, 0, 100).unwrap();
    assert_eq!(kept.try_outcome(), Some(EvictionOutcome::Evicted));
}

#[test]
fn test_concurrent_references_keep_history_ordered() {
    let (cache, clock) = make_cache(10_000, 10_000, 0);
    let stream = StreamId::from(1u128);
    for offset in [0, 100] {
        cache.add(stream, offset, block(100)).unwrap();
    }

    std::thread::scope(|scope| {
        for worker in 0..4u64 {
            let cache = &cache;
            let clock = clock.clone();
            scope.spawn(move || {
                for round in 0..500u64 {
                    clock.advance(Duration::from_millis(1));
                    cache.query(stream, ((worker + round) % 2) * 100).unwrap();
                }
            });
        }
    });

    assert_eq!(cache.stats().hits, 2_000);
    assert!(cache.verify());
}

#[tokio::test]
async fn test_completion_delivered_to_waiting_task() {
    let (cache, _) = make_cache(1_000, 1_000, 0);
    let cache = Arc::new(cache);
    let stream = StreamId::from(1u128);
    cache.add(stream, 0, block(100)).unwrap();

    let mut subscription = cache.allocate_register_for_eviction();
    cache.register_for_eviction(&mut subscription, stream, 0).unwrap();
    let waiter = tokio::spawn(async move { subscription.completed().await });

    let remover = Arc::clone(&cache);
    tokio::task::spawn_blocking(move || remover.remove_range(stream, 0, 100))
        .await
        .unwrap()
        .unwrap();

    assert_eq!(waiter.await.unwrap().unwrap(), EvictionOutcome::Evicted);
}

#[tokio::test]
async fn test_shutdown_completes_pending_subscriptions() {
    let (cache, _) = make_cache(1_000, 1_000, 0);
    let stream = StreamId::from(1u128);
    let mut waiters = Vec::new();
    for offset in [0, 100, 200] {
        cache.add(stream, offset, block(100)).unwrap();
        let mut subscription = cache.allocate_register_for_eviction();
        cache.register_for_eviction(&mut subscription, stream, offset).unwrap();
        waiters.push(tokio::spawn(async move { subscription.completed().await }));
    }

    assert_eq!(cache.shutdown(), 3);
    for waiter in waiters {
        assert_eq!(waiter.await.unwrap().unwrap(), EvictionOutcome::Evicted);
    }
}
