//! Key-value storage abstraction for id-keyed engine state.
//!
//! The dialogue engine keeps per-chat working state in a store behind this
//! trait so tests run against memory while production can plug in a real
//! cache without touching call sites. Reads and writes are individually
//! atomic; read-modify-write sequences rely on the caller serializing turns
//! per chat.

use std::collections::HashMap;
use std::sync::RwLock;
use std::time::{Duration, Instant};

pub trait KeyValueStore<V: Clone>: Send + Sync {
    fn get(&self, key: &str) -> Option<V>;
    fn set(&self, key: &str, value: V);
    fn delete(&self, key: &str) -> bool;
    fn keys(&self) -> Vec<String>;
}

pub struct InMemoryKeyValueStore<V> {
    entries: RwLock<HashMap<String, V>>,
}

impl<V> Default for InMemoryKeyValueStore<V> {
    fn default() -> Self {
        Self { entries: RwLock::new(HashMap::new()) }
    }
}

impl<V> InMemoryKeyValueStore<V> {
    pub fn new() -> Self {
        Self::default()
    }
}

impl<V: Clone + Send + Sync> KeyValueStore<V> for InMemoryKeyValueStore<V> {
    fn get(&self, key: &str) -> Option<V> {
        let entries = match self.entries.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        entries.get(key).cloned()
    }

    fn set(&self, key: &str, value: V) {
        let mut entries = match self.entries.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        entries.insert(key.to_string(), value);
    }

    fn delete(&self, key: &str) -> bool {
        let mut entries = match self.entries.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        entries.remove(key).is_some()
    }

    fn keys(&self) -> Vec<String> {
        let entries = match self.entries.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        entries.keys().cloned().collect()
    }
}

/// Bounded read-through cache with TTL, used in front of oracle calls
/// (intent classification, relation resolution). Purely an optimization: a
/// miss costs latency, never correctness.
pub struct TtlCache<V> {
    capacity: usize,
    ttl: Duration,
    entries: RwLock<HashMap<String, CacheSlot<V>>>,
}

struct CacheSlot<V> {
    value: V,
    inserted_at: Instant,
    last_used: Instant,
}

impl<V: Clone> TtlCache<V> {
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        Self { capacity: capacity.max(1), ttl, entries: RwLock::new(HashMap::new()) }
    }

    pub fn get(&self, key: &str) -> Option<V> {
        let now = Instant::now();
        let mut entries = match self.entries.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let slot = entries.get_mut(key)?;
        if now.duration_since(slot.inserted_at) > self.ttl {
            entries.remove(key);
            return None;
        }
        slot.last_used = now;
        Some(slot.value.clone())
    }

    pub fn insert(&self, key: impl Into<String>, value: V) {
        let now = Instant::now();
        let mut entries = match self.entries.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if entries.len() >= self.capacity {
            // Evict the least recently used slot to stay bounded.
            if let Some(oldest) = entries
                .iter()
                .min_by_key(|(_, slot)| slot.last_used)
                .map(|(key, _)| key.clone())
            {
                entries.remove(&oldest);
            }
        }
        entries.insert(key.into(), CacheSlot { value, inserted_at: now, last_used: now });
    }

    pub fn len(&self) -> usize {
        match self.entries.read() {
            Ok(guard) => guard.len(),
            Err(poisoned) => poisoned.into_inner().len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
