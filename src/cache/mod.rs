//! Result caching: L1 in-process LRU+TTL, L2 durable store, and the tiered facade.

pub mod durable;
pub mod memory;
pub mod tiered;

pub use durable::{DurableCacheStats, DurableEntry, DurableStore, SledCacheStore};
pub use memory::{CacheEntry, MemoryCache, MemoryCacheStats};
pub use tiered::{PruneReport, TieredCache, TieredCacheStats};
