// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Cache Region
//!
//! One named, independently evictable key space. Values are immutable
//! snapshots (usually `Arc`s) replaced atomically per key.
//!
//! # Flow
//!
//! ```text
//! get(key) ──→ hit  → clone of the snapshot, hits += 1
//!          └─→ miss → None, misses += 1
//!
//! insert(key) ──→ at capacity? evict oldest (insertion order) first
//! ```

use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::metrics;

/// Per-region statistics
#[derive(Debug, Clone, PartialEq)]
pub struct RegionStats {
    pub name: String,
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    /// Current number of entries
    pub entries: usize,
    /// Hit rate (0.0 - 1.0)
    pub hit_rate: f64,
}

/// A stored value and the generation of the insert that created its key.
struct Slot<V> {
    value: V,
    generation: u64,
}

/// Insertion order of bounded regions. Records whose generation no longer
/// matches the live slot are stale and skipped.
struct Order<K> {
    queue: VecDeque<(K, u64)>,
    next_generation: u64,
}

pub struct CacheRegion<K, V> {
    name: String,
    entries: DashMap<K, Slot<V>>,
    /// Only maintained when bounded
    order: Mutex<Order<K>>,
    max_entries: Option<usize>,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
}

impl<K, V> CacheRegion<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    pub fn new(name: &str, max_entries: Option<usize>) -> Self {
        Self {
            name: name.to_string(),
            entries: DashMap::new(),
            order: Mutex::new(Order {
                queue: VecDeque::new(),
                next_generation: 0,
            }),
            max_entries: max_entries.map(|m| m.max(1)),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Lookup, counted in the region statistics.
    pub fn get(&self, key: &K) -> Option<V> {
        let value = self.entries.get(key).map(|slot| slot.value.clone());
        let hit = value.is_some();
        if hit {
            self.hits.fetch_add(1, Ordering::Relaxed);
        } else {
            self.misses.fetch_add(1, Ordering::Relaxed);
        }
        metrics::record_cache_lookup(&self.name, hit);
        value
    }

    /// Presence check that leaves the statistics alone.
    pub fn contains(&self, key: &K) -> bool {
        self.entries.contains_key(key)
    }

    pub fn insert(&self, key: K, value: V) {
        let Some(max_entries) = self.max_entries else {
            self.entries.insert(key, Slot { value, generation: 0 });
            return;
        };

        // bounded inserts are serialized by the order lock
        let mut order = self.order.lock();
        if let Some(mut slot) = self.entries.get_mut(&key) {
            slot.value = value;
            return;
        }

        let mut evicted = 0;
        while self.entries.len() >= max_entries {
            let Some((old, generation)) = order.queue.pop_front() else {
                break;
            };
            if self
                .entries
                .remove_if(&old, |_, slot| slot.generation == generation)
                .is_some()
            {
                evicted += 1;
            }
        }
        if evicted > 0 {
            self.evictions.fetch_add(evicted as u64, Ordering::Relaxed);
            metrics::record_eviction(&self.name, evicted);
        }

        let generation = order.next_generation;
        order.next_generation += 1;
        order.queue.push_back((key.clone(), generation));
        self.entries.insert(key, Slot { value, generation });

        if order.queue.len() > 2 * max_entries {
            order.queue.retain(|(k, g)| {
                self.entries
                    .get(k)
                    .is_some_and(|slot| slot.generation == *g)
            });
        }
    }

    /// Constant time; the order record goes stale and is dropped later.
    pub fn remove(&self, key: &K) {
        self.entries.remove(key);
    }

    /// Keep only entries for which `keep` returns true.
    pub fn retain<F>(&self, mut keep: F)
    where
        F: FnMut(&K, &V) -> bool,
    {
        self.entries.retain(|k, slot| keep(k, &slot.value));
    }

    pub fn clear(&self) {
        let mut order = self.order.lock();
        self.entries.clear();
        order.queue.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn stats(&self) -> RegionStats {
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let total = hits + misses;
        let entries = self.entries.len();
        metrics::set_region_entries(&self.name, entries);
        RegionStats {
            name: self.name.clone(),
            hits,
            misses,
            evictions: self.evictions.load(Ordering::Relaxed),
            entries,
            hit_rate: if total > 0 { hits as f64 / total as f64 } else { 0.0 },
        }
    }
}
