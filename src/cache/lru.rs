//! LRU (Least Recently Used) tracking

use std::collections::{HashMap, VecDeque};
use std::hash::Hash;

/// LRU order tracker with lazy removal.
///
/// Every touch appends a new generation to the queue; queue entries whose
/// generation no longer matches the key's current one are skipped on pop.
pub struct LruTracker<K: Clone + Eq + Hash> {
    /// Access order (front = oldest), possibly holding stale generations
    order: VecDeque<(K, u64)>,
    /// Current generation per live key
    generations: HashMap<K, u64>,
    next_generation: u64,
}

impl<K: Clone + Eq + Hash> LruTracker<K> {
    pub fn new() -> Self {
        LruTracker {
            order: VecDeque::new(),
            generations: HashMap::new(),
            next_generation: 0,
        }
    }

    /// Insert or refresh a key as most recently used
    pub fn touch(&mut self, key: &K) {
        self.next_generation += 1;
        self.generations.insert(key.clone(), self.next_generation);
        self.order.push_back((key.clone(), self.next_generation));
        if self.order.len() > self.generations.len() * 4 + 16 {
            self.compact();
        }
    }

    /// Stop tracking a key
    pub fn remove(&mut self, key: &K) {
        self.generations.remove(key);
    }

    /// Pop the least recently used key
    pub fn pop_oldest(&mut self) -> Option<K> {
        while let Some((key, generation)) = self.order.pop_front() {
            if self.generations.get(&key) == Some(&generation) {
                self.generations.remove(&key);
                return Some(key);
            }
        }
        None
    }

    pub fn len(&self) -> usize {
        self.generations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.generations.is_empty()
    }

    pub fn clear(&mut self) {
        self.order.clear();
        self.generations.clear();
    }

    /// Drop stale queue entries
    fn compact(&mut self) {
        let generations = &self.generations;
        self.order
            .retain(|(key, generation)| generations.get(key) == Some(generation));
    }
}

impl<K: Clone + Eq + Hash> Default for LruTracker<K> {
    fn default() -> Self {
        Self::new()
    }
}
