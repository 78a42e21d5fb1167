//! Bounded offset-keyed cache
//!
//! Backs the block cache and the key/docid byte caches. Eviction is
//! first-in first-out, which is all the contract asks for: a lookup never
//! returns an evicted entry, offsets never conflate, and an insert is
//! immediately visible.

use std::collections::{HashMap, VecDeque};

use super::sparse::BuildIdentityHasher;

#[derive(Debug)]
pub(crate) struct BoundedCache<V> {
    entries: HashMap<i64, V, BuildIdentityHasher>,
    order: VecDeque<i64>,
    bound: usize,
}

impl<V: Clone> BoundedCache<V> {
    pub(crate) fn new(bound: usize) -> Self {
        assert!(bound >= 1);
        Self {
            entries: HashMap::default(),
            order: VecDeque::new(),
            bound,
        }
    }

    pub(crate) fn lookup(&self, offset: i64) -> Option<V> {
        self.entries.get(&offset).cloned()
    }

    pub(crate) fn insert(&mut self, offset: i64, value: V) {
        if self.entries.insert(offset, value).is_some() {
            // Refreshed entries move to the back of the eviction queue.
            self.order.retain(|&held| held != offset);
        }
        self.order.push_back(offset);
        while self.entries.len() > self.bound {
            if let Some(oldest) = self.order.pop_front() {
                self.entries.remove(&oldest);
            }
        }
    }

    pub(crate) fn evict(&mut self, offset: i64) -> Option<V> {
        self.order.retain(|&held| held != offset);
        self.entries.remove(&offset)
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn it_caches_and_evicts() {
        let mut cache = BoundedCache::new(64);
        for offset in 0..64i64 {
            cache.insert(offset, offset * 2);
            assert_eq!(cache.lookup(offset), Some(offset * 2));
            assert_eq!(cache.evict(offset), Some(offset * 2));
            assert_eq!(cache.lookup(offset), None);
        }
        assert_eq!(cache.len(), 0);
    }

    #[test]
    fn it_honours_the_bound() {
        let mut cache = BoundedCache::new(4);
        for offset in 0..10i64 {
            cache.insert(offset, ());
            assert!(cache.lookup(offset).is_some());
        }
        assert_eq!(cache.len(), 4);
        assert!(cache.lookup(0).is_none());
        assert!(cache.lookup(9).is_some());
    }

    #[test]
    fn it_keeps_refreshed_entries_alive() {
        let mut cache = BoundedCache::new(2);
        cache.insert(1, "a");
        cache.insert(2, "b");
        cache.insert(1, "c");
        cache.insert(3, "d");
        // 2 was the oldest untouched entry.
        assert!(cache.lookup(2).is_none());
        assert_eq!(cache.lookup(1), Some("c"));
        assert_eq!(cache.lookup(3), Some("d"));
    }
}
