//! Baseline storage: memory cache, persistent store and predictive preloading.

pub mod cache;
pub mod memory;
pub mod sequence;
pub mod store;

pub use cache::{BaselineCache, BaselineCacheBuilder, CacheMetrics, CacheStatus};
pub use memory::{CacheEntry, MemoryCache};
pub use sequence::{BaselineSequence, NumericSuffixSequence};
pub use store::{BaselineSource, DiskStore, FsSource};
