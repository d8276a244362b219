//! stream-read-cache: byte-range read cache with LRU-K eviction.
//!
//! Callers cache freshly read buffers keyed by `(stream, offset)` and look
//! them up again on later reads. Two budgets bound the cache: a total budget
//! and a smaller burst budget for ranges referenced only once, so one-shot
//! scans cannot push out data that has proven hot.
//!
//! The ordering primitive underneath is an intrusive, allocation-free AVL
//! tree ([`table::NodeTable`]) whose links live inside the records it orders.

pub mod cache;
pub mod config;
pub mod table;

pub use cache::{
    BufferElement, CacheError, CacheSize, CacheStats, CacheUsage, EvictionOutcome,
    EvictionSubscription, ItemInfo, LruKKey, ManualClock, MonotonicClock, ReadCache, Registration,
    StreamId, TickSource,
};
pub use config::CacheConfig;
