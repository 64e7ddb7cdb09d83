//! cache: detection sets already fetched this session
//!
//! Sets are handed out as `Arc`s.  Returning the cached `Arc` on a hit keeps
//! the overlay from re-indexing when the same task is shown again.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::debug;

use crate::api::TaskId;
use crate::detection::DetectionSet;

pub const DEFAULT_CAPACITY: usize = 8;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub len: usize,
    pub capacity: usize,
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    /// Cached task ids, most recently used first.
    pub task_ids: Vec<TaskId>,
}

#[derive(Debug)]
struct Entry {
    set: Arc<DetectionSet>,
    last_used: u64,
}

/// Bounded map with least-recently-used eviction.
#[derive(Debug)]
pub struct DetectionCache {
    entries: HashMap<TaskId, Entry>,
    capacity: usize,
    clock: u64,
    hits: u64,
    misses: u64,
    evictions: u64,
}

impl DetectionCache {
    /// `capacity` of zero is treated as one.
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: HashMap::new(),
            capacity: capacity.max(1),
            clock: 0,
            hits: 0,
            misses: 0,
            evictions: 0,
        }
    }

    fn tick(&mut self) -> u64 {
        self.clock += 1;
        self.clock
    }

    pub fn get(&mut self, task_id: &TaskId) -> Option<Arc<DetectionSet>> {
        let now = self.tick();
        match self.entries.get_mut(task_id) {
            Some(entry) => {
                entry.last_used = now;
                self.hits += 1;
                Some(Arc::clone(&entry.set))
            }
            None => {
                self.misses += 1;
                None
            }
        }
    }

    pub fn contains(&self, task_id: &TaskId) -> bool {
        self.entries.contains_key(task_id)
    }

    pub fn insert(&mut self, task_id: TaskId, set: Arc<DetectionSet>) {
        let now = self.tick();
        if !self.entries.contains_key(&task_id) && self.entries.len() >= self.capacity {
            self.evict_oldest();
        }
        debug!(%task_id, frames = set.len(), "caching detections");
        self.entries.insert(task_id, Entry { set, last_used: now });
    }

    pub fn remove(&mut self, task_id: &TaskId) -> bool {
        self.entries.remove(task_id).is_some()
    }

    pub fn clear(&mut self) -> usize {
        let removed = self.entries.len();
        self.entries.clear();
        removed
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn stats(&self) -> CacheStats {
        let mut ordered: Vec<(&TaskId, u64)> = self
            .entries
            .iter()
            .map(|(id, entry)| (id, entry.last_used))
            .collect();
        ordered.sort_by(|a, b| b.1.cmp(&a.1));
        CacheStats {
            len: self.entries.len(),
            capacity: self.capacity,
            hits: self.hits,
            misses: self.misses,
            evictions: self.evictions,
            task_ids: ordered.into_iter().map(|(id, _)| id.clone()).collect(),
        }
    }

    fn evict_oldest(&mut self) {
        let oldest = self
            .entries
            .iter()
            .min_by_key(|(_, entry)| entry.last_used)
            .map(|(id, _)| id.clone());
        if let Some(id) = oldest {
            self.entries.remove(&id);
            self.evictions += 1;
            debug!(task_id = %id, "evicted cached detections");
        }
    }
}

impl Default for DetectionCache {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(raw: &str) -> TaskId {
        TaskId::parse(raw).unwrap()
    }

    #[test]
    fn test_hit_returns_same_allocation() {
        let mut cache = DetectionCache::new(2);
        let set = Arc::new(DetectionSet::new());
        cache.insert(id("local_aaaaaa"), Arc::clone(&set));
        let hit = cache.get(&id("local_aaaaaa")).unwrap();
        assert!(Arc::ptr_eq(&hit, &set));
        assert!(cache.get(&id("local_bbbbbb")).is_none());

        let stats = cache.stats();
        assert_eq!((stats.hits, stats.misses), (1, 1));
    }

    #[test]
    fn test_least_recently_used_is_evicted() {
        let mut cache = DetectionCache::new(2);
        cache.insert(id("local_aaaaaa"), Arc::new(DetectionSet::new()));
        cache.insert(id("local_bbbbbb"), Arc::new(DetectionSet::new()));
        // Touch `a` so `b` becomes the oldest.
        cache.get(&id("local_aaaaaa"));
        cache.insert(id("local_cccccc"), Arc::new(DetectionSet::new()));

        assert!(cache.contains(&id("local_aaaaaa")));
        assert!(!cache.contains(&id("local_bbbbbb")));
        assert!(cache.contains(&id("local_cccccc")));
        let stats = cache.stats();
        assert_eq!(stats.evictions, 1);
        assert_eq!(stats.task_ids, vec![id("local_cccccc"), id("local_aaaaaa")]);
    }

    #[test]
    fn test_reinsert_does_not_evict() {
        let mut cache = DetectionCache::new(1);
        cache.insert(id("local_aaaaaa"), Arc::new(DetectionSet::new()));
        cache.insert(id("local_aaaaaa"), Arc::new(DetectionSet::new()));
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.stats().evictions, 0);
        assert!(cache.remove(&id("local_aaaaaa")));
        assert!(cache.is_empty());
        assert_eq!(cache.clear(), 0);
    }
}
