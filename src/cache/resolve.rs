//! Resolution cache
//!
//! Bounded LRU cache of resolution results for read-only requests. Mutations
//! invalidate synchronously before they return. Every invalidation bumps an
//! epoch; a reader that resolved under an older epoch does not publish its
//! result.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use super::lru::LruTracker;
use crate::resolver::Resolution;
use crate::vpath::VirtualPath;

struct Inner {
    entries: HashMap<VirtualPath, Resolution>,
    lru: LruTracker<VirtualPath>,
}

/// Cache hit/miss counters
#[derive(Debug, Clone, Copy, Default)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub invalidations: u64,
    pub entries: usize,
}

pub struct ResolveCache {
    capacity: usize,
    inner: Mutex<Inner>,
    hits: AtomicU64,
    misses: AtomicU64,
    invalidations: AtomicU64,
    epoch: AtomicU64,
}

impl ResolveCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            inner: Mutex::new(Inner {
                entries: HashMap::new(),
                lru: LruTracker::new(),
            }),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            invalidations: AtomicU64::new(0),
            epoch: AtomicU64::new(0),
        }
    }

    pub fn get(&self, path: &VirtualPath) -> Option<Resolution> {
        let mut inner = self.inner.lock();
        match inner.entries.get(path).cloned() {
            Some(resolution) => {
                inner.lru.touch(path);
                self.hits.fetch_add(1, Ordering::Relaxed);
                Some(resolution)
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    /// Current invalidation epoch, taken before resolving a miss
    pub fn epoch(&self) -> u64 {
        self.epoch.load(Ordering::Acquire)
    }

    pub fn insert(&self, path: VirtualPath, resolution: Resolution) {
        let mut inner = self.inner.lock();
        Self::store(&mut inner, self.capacity, path, resolution);
    }

    /// Insert only if nothing was invalidated since `epoch` was read.
    /// Returns whether the entry was stored.
    pub fn insert_if_current(&self, path: VirtualPath, resolution: Resolution, epoch: u64) -> bool {
        let mut inner = self.inner.lock();
        if self.epoch.load(Ordering::Acquire) != epoch {
            return false;
        }
        Self::store(&mut inner, self.capacity, path, resolution);
        true
    }

    fn store(inner: &mut Inner, capacity: usize, path: VirtualPath, resolution: Resolution) {
        inner.lru.touch(&path);
        inner.entries.insert(path, resolution);
        while inner.entries.len() > capacity {
            match inner.lru.pop_oldest() {
                Some(oldest) => {
                    inner.entries.remove(&oldest);
                }
                None => break,
            }
        }
    }

    /// Forget a single path
    pub fn invalidate(&self, path: &VirtualPath) {
        let mut inner = self.inner.lock();
        if inner.entries.remove(path).is_some() {
            inner.lru.remove(path);
        }
        self.epoch.fetch_add(1, Ordering::AcqRel);
        self.invalidations.fetch_add(1, Ordering::Relaxed);
    }

    /// Forget a path, everything below it, and its parent
    pub fn invalidate_tree(&self, path: &VirtualPath) {
        let mut inner = self.inner.lock();
        let doomed: Vec<VirtualPath> = inner
            .entries
            .keys()
            .filter(|k| k.starts_with(path))
            .cloned()
            .chain(path.parent())
            .collect();
        for key in doomed {
            inner.entries.remove(&key);
            inner.lru.remove(&key);
        }
        self.epoch.fetch_add(1, Ordering::AcqRel);
        self.invalidations.fetch_add(1, Ordering::Relaxed);
    }

    pub fn clear(&self) {
        let mut inner = self.inner.lock();
        inner.entries.clear();
        inner.lru.clear();
        self.epoch.fetch_add(1, Ordering::AcqRel);
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            invalidations: self.invalidations.load(Ordering::Relaxed),
            entries: self.inner.lock().entries.len(),
        }
    }
}
