//! Vat-local key-value store with checkpointing.
//!
//! Lives on the vat side of the transport. The vat reads and writes freely;
//! at the end of each delivery it hands the kernel a [`VatCheckpoint`] holding
//! exactly the keys whose value differs from the previous checkpoint.

use std::collections::BTreeMap;
use std::ops::Bound;

use ocap_ipc::VatCheckpoint;

use crate::kv::KvStore;

#[derive(Clone, Debug, Default)]
pub struct VatKvStore {
    entries: BTreeMap<String, String>,
    /// Value each touched key had at the last checkpoint
    baseline: BTreeMap<String, Option<String>>,
}

impl VatKvStore {
    /// Start from the state the kernel persisted for this vat.
    pub fn new(state: BTreeMap<String, String>) -> Self {
        Self {
            entries: state,
            baseline: BTreeMap::new(),
        }
    }

    fn touch(&mut self, key: &str) {
        if !self.baseline.contains_key(key) {
            let previous = self.entries.get(key).cloned();
            self.baseline.insert(key.to_string(), previous);
        }
    }

    /// Collect the mutations since the last checkpoint and start a new one.
    pub fn checkpoint(&mut self) -> VatCheckpoint {
        let mut checkpoint = VatCheckpoint::default();
        for (key, before) in std::mem::take(&mut self.baseline) {
            let now = self.entries.get(&key);
            match (before, now) {
                (before, Some(value)) if before.as_ref() != Some(value) => {
                    checkpoint.sets.push((key, value.clone()));
                }
                (Some(_), None) => checkpoint.deletes.push(key),
                _ => {}
            }
        }
        checkpoint
    }

    /// Current contents.
    pub fn state(&self) -> &BTreeMap<String, String> {
        &self.entries
    }
}

impl KvStore for VatKvStore {
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
        self.touch(key);
        self.entries.insert(key.to_string(), value.to_string());
    }

    fn delete(&mut self, key: &str) {
        self.touch(key);
        self.entries.remove(key);
    }

    fn clear(&mut self) {
        let keys: Vec<String> = self.entries.keys().cloned().collect();
        for key in keys {
            self.delete(&key);
        }
    }
}
