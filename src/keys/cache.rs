use std::collections::HashMap;
use std::hash::Hash;

use serde::Serialize;

use crate::model::{NaturalKeyReference, SurrogateReference};

/// Cache key: record type plus the canonical rendering of the key
/// components.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CacheKey {
    pub record_type: String,
    pub key: String,
}

impl CacheKey {
    pub fn of(reference: &NaturalKeyReference) -> Self {
        Self {
            record_type: reference.record_type.clone(),
            key: reference.to_string(),
        }
    }
}

/// Position in a journaled map that a rollback can return to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Checkpoint(usize);

/// Insert-only map that remembers insertion order so entries learned
/// after a checkpoint can be discarded.
#[derive(Debug)]
struct Journaled<K, V> {
    entries: HashMap<K, V>,
    journal: Vec<K>,
}

impl<K: Clone + Eq + Hash, V: Copy> Journaled<K, V> {
    fn new() -> Self {
        Self {
            entries: HashMap::new(),
            journal: Vec::new(),
        }
    }

    fn get(&self, key: &K) -> Option<V> {
        self.entries.get(key).copied()
    }

    /// First writer wins; returns the stored value.
    fn insert(&mut self, key: K, value: V) -> V {
        if let Some(existing) = self.entries.get(&key) {
            return *existing;
        }
        self.journal.push(key.clone());
        self.entries.insert(key, value);
        value
    }

    fn checkpoint(&self) -> Checkpoint {
        Checkpoint(self.journal.len())
    }

    fn rollback_to(&mut self, checkpoint: Checkpoint) -> usize {
        let mut dropped = 0;
        while self.journal.len() > checkpoint.0 {
            if let Some(key) = self.journal.pop() {
                self.entries.remove(&key);
                dropped += 1;
            }
        }
        dropped
    }

    fn len(&self) -> usize {
        self.entries.len()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub entries: u64,
}

/// Natural key to destination id, owned by exactly one restore run.
#[derive(Debug)]
pub struct ResolutionCache {
    map: Journaled<CacheKey, i64>,
    hits: u64,
    misses: u64,
}

impl Default for ResolutionCache {
    fn default() -> Self {
        Self::new()
    }
}

impl ResolutionCache {
    pub fn new() -> Self {
        Self {
            map: Journaled::new(),
            hits: 0,
            misses: 0,
        }
    }

    pub fn get(&mut self, reference: &NaturalKeyReference) -> Option<i64> {
        let found = self.map.get(&CacheKey::of(reference));
        if found.is_some() {
            self.hits += 1;
        } else {
            self.misses += 1;
        }
        found
    }

    pub fn peek(&self, reference: &NaturalKeyReference) -> Option<i64> {
        self.map.get(&CacheKey::of(reference))
    }

    /// Stores a resolution. An existing entry is never replaced and its id
    /// is returned instead, so a run always sees one id per key.
    pub fn record(&mut self, reference: &NaturalKeyReference, id: i64) -> i64 {
        self.map.insert(CacheKey::of(reference), id)
    }

    pub fn checkpoint(&self) -> Checkpoint {
        self.map.checkpoint()
    }

    pub fn rollback_to(&mut self, checkpoint: Checkpoint) {
        let dropped = self.map.rollback_to(checkpoint);
        if dropped > 0 {
            tracing::debug!(target: "dossier", event = "cache_rollback", dropped);
        }
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.len() == 0
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits,
            misses: self.misses,
            entries: self.map.len() as u64,
        }
    }
}

/// Source surrogate id to destination id for records restored in this
/// run. Lets the raw strategy map bare surrogate references.
#[derive(Debug)]
pub struct SourceIdMap {
    map: Journaled<(String, i64), i64>,
}

impl Default for SourceIdMap {
    fn default() -> Self {
        Self::new()
    }
}

impl SourceIdMap {
    pub fn new() -> Self {
        Self {
            map: Journaled::new(),
        }
    }

    pub fn get(&self, reference: &SurrogateReference) -> Option<i64> {
        self.map.get(&(reference.record_type.clone(), reference.id))
    }

    pub fn record(&mut self, record_type: &str, source_id: i64, id: i64) -> i64 {
        self.map.insert((record_type.to_string(), source_id), id)
    }

    pub fn checkpoint(&self) -> Checkpoint {
        self.map.checkpoint()
    }

    pub fn rollback_to(&mut self, checkpoint: Checkpoint) {
        self.map.rollback_to(checkpoint);
    }
}
