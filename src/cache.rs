//! Shared block cache keyed by `(reader identity, block offset)`.
//!
//! New entries land in a probationary queue and graduate to the main queue
//! once re-referenced; keys evicted before graduating are remembered in a
//! ghost queue so a quick re-insert skips probation. The cache is guarded by
//! a single mutex and is strictly optional: readers fall back to the block
//! source on every miss.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use crate::block::Block;

/// Maximum reference count tracked per entry.
const MAX_FREQUENCY: u8 = 3;

/// Identifies one cached block: the owning reader and the block's offset.
pub type CacheKey = (u64, u64);

struct Entry {
    block: Arc<Block>,
    freq: u8,
}

struct Inner {
    capacity: usize,
    max_main: usize,
    small: VecDeque<CacheKey>,
    main: VecDeque<CacheKey>,
    ghost: VecDeque<CacheKey>,
    entries: HashMap<CacheKey, Entry>,
}

pub struct BlockCache {
    inner: Mutex<Inner>,
    hits: AtomicUsize,
    misses: AtomicUsize,
}

impl BlockCache {
    /// Creates a cache holding at most `capacity` blocks.
    pub fn new(capacity: usize) -> Self {
        let max_small = capacity / 10;
        Self {
            inner: Mutex::new(Inner {
                capacity,
                max_main: capacity - max_small,
                small: VecDeque::new(),
                main: VecDeque::new(),
                ghost: VecDeque::new(),
                entries: HashMap::new(),
            }),
            hits: AtomicUsize::new(0),
            misses: AtomicUsize::new(0),
        }
    }

    pub fn get(&self, key: &CacheKey) -> Option<Arc<Block>> {
        let mut inner = match self.inner.lock() {
            Ok(inner) => inner,
            Err(_) => return None,
        };
        match inner.entries.get_mut(key) {
            Some(entry) => {
                entry.freq = (entry.freq + 1).min(MAX_FREQUENCY);
                self.hits.fetch_add(1, Ordering::Relaxed);
                Some(Arc::clone(&entry.block))
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    pub fn insert(&self, key: CacheKey, block: Arc<Block>) {
        let mut inner = match self.inner.lock() {
            Ok(inner) => inner,
            Err(_) => return,
        };
        if inner.capacity == 0 || inner.entries.contains_key(&key) {
            return;
        }
        inner.evict();

        let ghosted = inner.ghost.iter().any(|k| k == &key);
        if ghosted {
            inner.ghost.retain(|k| k != &key);
            inner.main.push_back(key);
        } else {
            inner.small.push_back(key);
        }
        inner.entries.insert(key, Entry { block, freq: 0 });
    }

    /// Number of resident blocks.
    pub fn len(&self) -> usize {
        self.inner.lock().map(|inner| inner.entries.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// `(hits, misses)` since creation.
    pub fn stats(&self) -> (usize, usize) {
        (
            self.hits.load(Ordering::Relaxed),
            self.misses.load(Ordering::Relaxed),
        )
    }
}

impl Inner {
    fn evict(&mut self) {
        while self.small.len() + self.main.len() >= self.capacity {
            if self.main.len() >= self.max_main || self.small.is_empty() {
                self.evict_main();
            } else {
                self.evict_small();
            }
        }
    }

    fn evict_main(&mut self) {
        while let Some(key) = self.main.pop_front() {
            let freq = self.entries.get(&key).map(|e| e.freq).unwrap_or(0);
            if freq > 0 {
                if let Some(entry) = self.entries.get_mut(&key) {
                    entry.freq = freq - 1;
                }
                self.main.push_back(key);
            } else {
                self.entries.remove(&key);
                self.remember_ghost(key);
                return;
            }
        }
    }

    fn evict_small(&mut self) {
        while let Some(key) = self.small.pop_front() {
            let freq = self.entries.get(&key).map(|e| e.freq).unwrap_or(0);
            if freq > 1 {
                self.main.push_back(key);
            } else {
                self.entries.remove(&key);
                self.remember_ghost(key);
                return;
            }
        }
    }

    fn remember_ghost(&mut self, key: CacheKey) {
        if self.ghost.len() >= self.capacity {
            self.ghost.pop_front();
        }
        self.ghost.push_back(key);
    }
}
