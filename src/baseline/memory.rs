//! Size-bounded in-memory baseline store.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Share of entries dropped per eviction round.
const EVICTION_FRACTION: f64 = 0.25;

#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub data: Arc<Vec<u8>>,
    pub size: u64,
    pub last_access: Instant,
    pub created_at: Instant,
}

#[derive(Debug)]
pub struct MemoryCache {
    entries: HashMap<String, CacheEntry>,
    total_size: u64,
    max_size: u64,
}

impl MemoryCache {
    pub fn new(max_size: u64) -> Self {
        Self {
            entries: HashMap::new(),
            total_size: 0,
            max_size,
        }
    }

    /// Look up `id`, refreshing its last-access time on a hit.
    pub fn get(&mut self, id: &str) -> Option<Arc<Vec<u8>>> {
        self.get_at(id, Instant::now())
    }

    pub fn get_at(&mut self, id: &str, now: Instant) -> Option<Arc<Vec<u8>>> {
        let entry = self.entries.get_mut(id)?;
        entry.last_access = now;
        Some(Arc::clone(&entry.data))
    }

    pub fn contains(&self, id: &str) -> bool {
        self.entries.contains_key(id)
    }

    /// Insert or replace `id`, then enforce the size bound.
    ///
    /// Returns the ids evicted to make room. The new entry itself may be
    /// among them if it alone exceeds the bound.
    pub fn insert(&mut self, id: String, data: Arc<Vec<u8>>) -> Vec<String> {
        self.insert_at(id, data, Instant::now())
    }

    pub fn insert_at(&mut self, id: String, data: Arc<Vec<u8>>, now: Instant) -> Vec<String> {
        let size = data.len() as u64;
        let entry = CacheEntry {
            data,
            size,
            last_access: now,
            created_at: now,
        };
        if let Some(old) = self.entries.insert(id, entry) {
            self.total_size -= old.size;
        }
        self.total_size += size;
        self.enforce_bound()
    }

    /// Evict the least recently used quarter of the entries (at least one)
    /// until the aggregate size is within the bound.
    pub fn enforce_bound(&mut self) -> Vec<String> {
        let mut evicted = Vec::new();
        while self.total_size > self.max_size && !self.entries.is_empty() {
            let mut by_age: Vec<(Instant, &String)> = self
                .entries
                .iter()
                .map(|(id, entry)| (entry.last_access, id))
                .collect();
            by_age.sort();

            let count = ((by_age.len() as f64 * EVICTION_FRACTION).ceil() as usize).max(1);
            let victims: Vec<String> = by_age
                .into_iter()
                .take(count)
                .map(|(_, id)| id.clone())
                .collect();

            for id in victims {
                if let Some(entry) = self.entries.remove(&id) {
                    self.total_size -= entry.size;
                    evicted.push(id);
                }
            }
        }
        evicted
    }

    /// Remove entries created more than `max_age` before `now`, then
    /// re-enforce the size bound.
    pub fn sweep_expired(&mut self, max_age: Duration, now: Instant) -> Vec<String> {
        let expired: Vec<String> = self
            .entries
            .iter()
            .filter(|(_, entry)| now.saturating_duration_since(entry.created_at) > max_age)
            .map(|(id, _)| id.clone())
            .collect();

        let mut removed = Vec::with_capacity(expired.len());
        for id in expired {
            if let Some(entry) = self.entries.remove(&id) {
                self.total_size -= entry.size;
                removed.push(id);
            }
        }
        removed.extend(self.enforce_bound());
        removed
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.total_size = 0;
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn total_size(&self) -> u64 {
        self.total_size
    }

    pub fn max_size(&self) -> u64 {
        self.max_size
    }
}
