use super::model::{Policy, PolicyCandidate, RelationshipType};
use serde::Serialize;
use std::collections::HashMap;
use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::RwLock;

/// Outcome of a cached lookup: the row that matched and when it stops applying.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CachedLookup {
    pub id: i64,
    pub expires_at: Option<i64>,
}

impl CachedLookup {
    pub fn is_live(&self, now_ms: i64) -> bool {
        self.expires_at.map(|exp| exp > now_ms).unwrap_or(true)
    }
}

pub type RelationshipKey = (String, String, RelationshipType);

#[derive(Debug, Clone)]
struct Entry<V> {
    generation: u64,
    value: Option<V>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CacheMetrics {
    pub hits: u64,
    pub misses: u64,
    pub invalidations: u64,
    pub generation: u64,
}

/// Generation-tagged read cache for `match_policy` and `has_relationship`.
///
/// Entries written under an older generation are never returned. Writers bump
/// the generation only after commit, and readers sample it before querying, so
/// an entry tagged with the current generation never predates the last write.
/// Policy matches keep the whole row so a hit needs no connection.
pub struct PolicyCache {
    generation: AtomicU64,
    capacity: usize,
    matches: RwLock<HashMap<PolicyCandidate, Entry<Policy>>>,
    relationships: RwLock<HashMap<RelationshipKey, Entry<CachedLookup>>>,
    hits: AtomicU64,
    misses: AtomicU64,
    invalidations: AtomicU64,
}

impl PolicyCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            generation: AtomicU64::new(0),
            capacity: capacity.max(1),
            matches: RwLock::new(HashMap::new()),
            relationships: RwLock::new(HashMap::new()),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            invalidations: AtomicU64::new(0),
        }
    }

    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    /// Outer `None` is a miss; `Some(None)` is a cached negative result.
    pub fn get_match(&self, key: &PolicyCandidate) -> Option<Option<Policy>> {
        self.get(&self.matches, key)
    }

    pub fn put_match(&self, key: PolicyCandidate, value: Option<Policy>, generation: u64) {
        self.put(&self.matches, key, value, generation);
    }

    pub fn get_relationship(&self, key: &RelationshipKey) -> Option<Option<CachedLookup>> {
        self.get(&self.relationships, key)
    }

    pub fn put_relationship(
        &self,
        key: RelationshipKey,
        value: Option<CachedLookup>,
        generation: u64,
    ) {
        self.put(&self.relationships, key, value, generation);
    }

    pub fn invalidate(&self) {
        let next = self.generation.fetch_add(1, Ordering::AcqRel) + 1;
        self.invalidations.fetch_add(1, Ordering::Relaxed);
        if let Ok(mut map) = self.matches.write() {
            map.clear();
        }
        if let Ok(mut map) = self.relationships.write() {
            map.clear();
        }
        log::debug!("Policy cache invalidated, generation {}", next);
    }

    pub fn metrics(&self) -> CacheMetrics {
        CacheMetrics {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            invalidations: self.invalidations.load(Ordering::Relaxed),
            generation: self.generation(),
        }
    }

    fn get<K: Eq + Hash, V: Clone>(
        &self,
        map: &RwLock<HashMap<K, Entry<V>>>,
        key: &K,
    ) -> Option<Option<V>> {
        let current = self.generation();
        let found = map
            .read()
            .ok()
            .and_then(|map| map.get(key).cloned())
            .filter(|entry| entry.generation == current)
            .map(|entry| entry.value);
        match found {
            Some(value) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                Some(value)
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    fn put<K: Eq + Hash, V>(
        &self,
        map: &RwLock<HashMap<K, Entry<V>>>,
        key: K,
        value: Option<V>,
        generation: u64,
    ) {
        if let Ok(mut map) = map.write() {
            // Checked under the map lock so a concurrent invalidate either
            // rejects this entry or clears it.
            if generation != self.generation() {
                return;
            }
            if map.len() >= self.capacity {
                map.retain(|_, entry| entry.generation == generation);
                if map.len() >= self.capacity {
                    map.clear();
                }
            }
            map.insert(key, Entry { generation, value });
        }
    }
}
