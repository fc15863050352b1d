//! Content-addressed audio cache.
//!
//! One audio file per cache key plus a JSON index of
//! `key -> {sizeBytes, createdTime, lastAccessTime, hitCount}`. The store
//! enforces a size budget with two-phase eviction, exempts pinned keys, and
//! persists the index on a debounce timer.

mod entry;
mod error;
mod persist;
mod store;

pub use entry::{CacheEntry, CacheIndex, CacheStats};
pub use error::{CacheError, Result};
pub use store::{CacheConfig, CacheStore, INDEX_FILE_NAME};
