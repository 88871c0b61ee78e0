//! In-memory key-value engine.
//!
//! Provides a BTreeMap-based store that persists only through explicit JSON
//! snapshots.

use std::collections::BTreeMap;
use std::ops::Bound;

use crate::error::StoreError;
use crate::kv::KvStore;

/// In-memory ordered key-value store.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct MemoryKvStore {
    /// Key storage
    entries: BTreeMap<String, String>,
}

impl MemoryKvStore {
    /// Create a new empty store.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &String)> {
        self.entries.iter()
    }

    /// Snapshot every entry as a JSON object.
    pub fn to_json(&self) -> Result<String, StoreError> {
        Ok(serde_json::to_string(&self.entries)?)
    }

    /// Rebuild a store from a [`to_json`](Self::to_json) snapshot.
    pub fn from_json(json: &str) -> Result<Self, StoreError> {
        Ok(Self {
            entries: serde_json::from_str(json)?,
        })
    }
}

impl From<BTreeMap<String, String>> for MemoryKvStore {
    fn from(entries: BTreeMap<String, String>) -> Self {
        Self { entries }
    }
}

impl KvStore for MemoryKvStore {
    fn get(&self, key: &str) -> Option<String> {
        self.entries.get(key).cloned()
    }

    fn get_next_key(&self, previous: &str) -> Option<String> {
        self.entries
            .range::<str, _>((Bound::Excluded(previous), Bound::Unbounded))
            .next()
            .map(|(k, _)| k.clone())
    }

    fn set(&mut self, key: &str, value: &str) {
        self.entries.insert(key.to_string(), value.to_string());
    }

    fn delete(&mut self, key: &str) {
        self.entries.remove(key);
    }

    fn clear(&mut self) {
        self.entries.clear();
    }
}

#[cfg(test)]
#[path = "memory_tests.rs"]
mod memory_tests;
