//! Physical key-value contract.
//!
//! Everything the kernel persists is laid out as string keys over an ordered
//! key-value store. Engines only need point reads and writes plus ordered
//! iteration via [`KvStore::get_next_key`].

use crate::error::StoreError;

/// Ordered string key-value store.
pub trait KvStore {
    fn get(&self, key: &str) -> Option<String>;

    /// Smallest key strictly greater than `previous`.
    fn get_next_key(&self, previous: &str) -> Option<String>;

    fn set(&mut self, key: &str, value: &str);

    fn delete(&mut self, key: &str);

    /// Remove every key.
    fn clear(&mut self);

    fn get_required(&self, key: &str) -> Result<String, StoreError> {
        self.get(key)
            .ok_or_else(|| StoreError::MissingKey(key.to_string()))
    }

    /// All keys starting with `prefix`, in order.
    fn keys_with_prefix(&self, prefix: &str) -> Vec<String> {
        let mut keys = Vec::new();
        if self.get(prefix).is_some() {
            keys.push(prefix.to_string());
        }
        let mut cursor = prefix.to_string();
        while let Some(next) = self.get_next_key(&cursor) {
            if !next.starts_with(prefix) {
                break;
            }
            keys.push(next.clone());
            cursor = next;
        }
        keys
    }
}
