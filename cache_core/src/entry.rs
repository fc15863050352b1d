use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One cached audio artifact, as recorded in the index.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheEntry {
    pub size_bytes: u64,
    pub created_time: DateTime<Utc>,
    pub last_access_time: DateTime<Utc>,
    pub hit_count: u64,
}

impl CacheEntry {
    pub fn new(size_bytes: u64) -> Self {
        let now = Utc::now();
        Self {
            size_bytes,
            created_time: now,
            last_access_time: now,
            hit_count: 0,
        }
    }

    /// Record a successful lookup.
    pub fn record_access(&mut self) {
        self.last_access_time = Utc::now();
        self.hit_count += 1;
    }

    pub fn is_unused(&self) -> bool {
        self.hit_count == 0
    }
}

/// Serialized form of the index file: cache key -> entry.
pub type CacheIndex = HashMap<String, CacheEntry>;

/// Statistics reported by [`crate::CacheStore::stats`].
#[derive(Debug, Clone, Default, Serialize)]
pub struct CacheStats {
    pub entries: usize,
    pub pinned: usize,
    pub size_bytes: u64,
    pub max_size_bytes: u64,
    pub usage_percent: f64,
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
}
