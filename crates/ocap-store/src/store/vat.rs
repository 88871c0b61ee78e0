//! Vat records, vat-local stores and termination cleanup.

use std::collections::BTreeMap;

use ocap_ipc::{EndpointId, KRef, VatCheckpoint, VatConfig, VatId};
use tracing::info;

use super::KernelStore;
use crate::error::StoreError;
use crate::kv::KvStore;

const VAT_CONFIG_PREFIX: &str = "vatConfig.";

fn vat_config_key(vat: &VatId) -> String {
    format!("{}{}", VAT_CONFIG_PREFIX, vat)
}

fn vat_store_prefix(vat: &VatId) -> String {
    format!("vs.{}.", vat)
}

impl<K: KvStore> KernelStore<K> {
    pub fn set_vat_config(&mut self, vat: &VatId, config: &VatConfig) -> Result<(), StoreError> {
        self.set_json(&vat_config_key(vat), config)
    }

    pub fn get_vat_config(&self, vat: &VatId) -> Result<Option<VatConfig>, StoreError> {
        self.get_json(&vat_config_key(vat))
    }

    pub fn delete_vat_config(&mut self, vat: &VatId) {
        self.kv.delete(&vat_config_key(vat));
    }

    /// Every persisted vat, in id order.
    pub fn get_all_vat_records(&self) -> Result<Vec<(VatId, VatConfig)>, StoreError> {
        let mut records = Vec::new();
        for key in self.kv.keys_with_prefix(VAT_CONFIG_PREFIX) {
            let vat: VatId = key[VAT_CONFIG_PREFIX.len()..].parse()?;
            if let Some(config) = self.get_json(&key)? {
                records.push((vat, config));
            }
        }
        Ok(records)
    }

    /// A vat's local store contents, keys without the `vs.<vat>.` prefix.
    pub fn get_vat_store(&self, vat: &VatId) -> BTreeMap<String, String> {
        let prefix = vat_store_prefix(vat);
        self.kv
            .keys_with_prefix(&prefix)
            .into_iter()
            .filter_map(|key| {
                let value = self.kv.get(&key)?;
                Some((key[prefix.len()..].to_string(), value))
            })
            .collect()
    }

    pub fn apply_vat_checkpoint(&mut self, vat: &VatId, checkpoint: &VatCheckpoint) {
        let prefix = vat_store_prefix(vat);
        for (key, value) in &checkpoint.sets {
            self.kv.set(&format!("{}{}", prefix, key), value);
        }
        for key in &checkpoint.deletes {
            self.kv.delete(&format!("{}{}", prefix, key));
        }
    }

    pub fn delete_vat_store(&mut self, vat: &VatId) {
        for key in self.kv.keys_with_prefix(&vat_store_prefix(vat)) {
            self.kv.delete(&key);
        }
    }

    /// Remove every trace of a terminated vat.
    ///
    /// Objects it exported lose their owner; its imports are dropped; its
    /// c-list, store, counters and config are deleted. Returns the unresolved
    /// promises it was deciding, which the caller must reject.
    pub fn cleanup_terminated_vat(&mut self, vat: &VatId) -> Result<Vec<KRef>, StoreError> {
        let endpoint = EndpointId::Vat(vat.clone());
        let entries = self.clist_entries(&endpoint)?;
        let mut orphaned = 0;
        for entry in &entries {
            if entry.kref.is_object() && entry.eref.is_export() {
                self.orphan_kernel_object(&entry.kref);
                self.forget_clist_entry(&endpoint, &entry.kref, &entry.eref);
                self.add_maybe_free(&entry.kref);
                orphaned += 1;
            } else {
                self.delete_clist_entry(&endpoint, &entry.kref, &entry.eref)?;
            }
        }

        let decided = self.get_promises_decided_by(&endpoint)?;
        self.delete_vat_store(vat);
        self.kv.delete(&format!("e.nextObjectId.{}", endpoint));
        self.kv.delete(&format!("e.nextPromiseId.{}", endpoint));
        self.delete_vat_config(vat);
        info!(
            vat = %vat,
            orphaned,
            released = entries.len() - orphaned,
            decided = decided.len(),
            "cleaned up terminated vat"
        );
        Ok(decided)
    }
}
