//! Byte-range read cache.
//!
//! This module contains the cache built on the intrusive [`table`](crate::table)
//! structures:
//! - [`buffer`]: StreamId and the BufferElement contract
//! - [`clock`]: tick sources for reference timestamps
//! - [`item`]: CacheItem, LRU-K keys and reference history
//! - [`subscription`]: eviction notification handles
//! - [`read_cache`]: ReadCache (insert, overlap resolution, query, eviction)

pub mod buffer;
pub mod clock;
pub mod item;
pub mod read_cache;
pub mod subscription;

pub use buffer::{BufferElement, StreamId};
pub use clock::{ManualClock, MonotonicClock, TickSource};
pub use item::{LruKKey, TOUCH_HISTORY_LEN};
pub use read_cache::{CacheError, CacheSize, CacheStats, CacheUsage, ItemInfo, ReadCache};
pub use subscription::{EvictionOutcome, EvictionSubscription, Registration};
