//! Per-endpoint c-lists.
//!
//! Each mapping is two co-located entries: `<ep>.c.<kref>` holding
//! `"R <eref>"` / `"_ <eref>"` (reachable flag plus eref) and `<ep>.c.<eref>`
//! holding the kref. Both exist or neither does.

use ocap_ipc::{ERef, EndpointId, KRef, RefDirection, RefKind};

use super::KernelStore;
use crate::error::StoreError;
use crate::kv::KvStore;
use crate::types::RefCountOptions;

fn clist_key(endpoint: &EndpointId, reference: &str) -> String {
    format!("{}.c.{}", endpoint, reference)
}

fn decode_kref_entry(key: &str, value: &str) -> Result<(bool, ERef), StoreError> {
    let (flag, eref) = value
        .split_once(' ')
        .ok_or_else(|| StoreError::corrupt(key, format!("bad c-list entry {:?}", value)))?;
    let reachable = match flag {
        "R" => true,
        "_" => false,
        other => return Err(StoreError::corrupt(key, format!("bad reachable flag {:?}", other))),
    };
    Ok((reachable, eref.parse()?))
}

fn encode_kref_entry(reachable: bool, eref: &ERef) -> String {
    format!("{} {}", if reachable { "R" } else { "_" }, eref)
}

/// One c-list mapping as seen from the kref side.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CListEntry {
    pub kref: KRef,
    pub eref: ERef,
    pub reachable: bool,
}

impl<K: KvStore> KernelStore<K> {
    /// Record a mapping with the reachable flag set. Counts are untouched.
    pub fn add_clist_entry(&mut self, endpoint: &EndpointId, kref: &KRef, eref: &ERef) {
        self.kv
            .set(&clist_key(endpoint, kref.as_str()), &encode_kref_entry(true, eref));
        self.kv.set(&clist_key(endpoint, eref.as_str()), kref.as_str());
    }

    pub fn has_clist_entry(&self, endpoint: &EndpointId, kref: &KRef) -> bool {
        self.kv.get(&clist_key(endpoint, kref.as_str())).is_some()
    }

    fn get_kref_entry(&self, endpoint: &EndpointId, kref: &KRef) -> Result<Option<(bool, ERef)>, StoreError> {
        let key = clist_key(endpoint, kref.as_str());
        match self.kv.get(&key) {
            Some(value) => Ok(Some(decode_kref_entry(&key, &value)?)),
            None => Ok(None),
        }
    }

    pub fn kref_to_eref(&self, endpoint: &EndpointId, kref: &KRef) -> Result<Option<ERef>, StoreError> {
        Ok(self.get_kref_entry(endpoint, kref)?.map(|(_, eref)| eref))
    }

    pub fn eref_to_kref(&self, endpoint: &EndpointId, eref: &ERef) -> Result<Option<KRef>, StoreError> {
        match self.kv.get(&clist_key(endpoint, eref.as_str())) {
            Some(kref) => Ok(Some(kref.parse()?)),
            None => Ok(None),
        }
    }

    /// The entry's reachable flag; false when there is no entry.
    pub fn get_reachable_flag(&self, endpoint: &EndpointId, kref: &KRef) -> Result<bool, StoreError> {
        Ok(self
            .get_kref_entry(endpoint, kref)?
            .map(|(reachable, _)| reachable)
            .unwrap_or(false))
    }

    /// Set the flag. An object import becoming reachable bumps the reachable count.
    pub fn set_reachable_flag(&mut self, endpoint: &EndpointId, kref: &KRef) -> Result<(), StoreError> {
        self.write_reachable_flag(endpoint, kref, true)
    }

    /// Clear the flag. An object import going unreachable drops the reachable count.
    pub fn clear_reachable_flag(&mut self, endpoint: &EndpointId, kref: &KRef) -> Result<(), StoreError> {
        self.write_reachable_flag(endpoint, kref, false)
    }

    fn write_reachable_flag(
        &mut self,
        endpoint: &EndpointId,
        kref: &KRef,
        reachable: bool,
    ) -> Result<(), StoreError> {
        let Some((current, eref)) = self.get_kref_entry(endpoint, kref)? else {
            return Err(StoreError::MissingCListEntry {
                endpoint: endpoint.clone(),
                reference: kref.to_string(),
            });
        };
        if current == reachable {
            return Ok(());
        }
        self.kv
            .set(&clist_key(endpoint, kref.as_str()), &encode_kref_entry(reachable, &eref));
        if kref.is_object() && eref.is_import() {
            self.adjust_reachable(kref, reachable)?;
        }
        Ok(())
    }

    /// Remove a mapping in both directions.
    ///
    /// The reachable flag is cleared first, then the entry's recognizable
    /// count is released.
    pub fn delete_clist_entry(
        &mut self,
        endpoint: &EndpointId,
        kref: &KRef,
        eref: &ERef,
    ) -> Result<(), StoreError> {
        if !self.has_clist_entry(endpoint, kref) {
            return Err(StoreError::MissingCListEntry {
                endpoint: endpoint.clone(),
                reference: kref.to_string(),
            });
        }
        self.clear_reachable_flag(endpoint, kref)?;
        self.decrement_ref_count(
            kref,
            "delete|kref",
            RefCountOptions {
                is_export: eref.is_export(),
                only_recognizable: true,
            },
        )?;
        self.forget_clist_entry(endpoint, kref, eref);
        Ok(())
    }

    /// Drop both keys of a mapping without touching any counts.
    pub(crate) fn forget_clist_entry(&mut self, endpoint: &EndpointId, kref: &KRef, eref: &ERef) {
        self.kv.delete(&clist_key(endpoint, kref.as_str()));
        self.kv.delete(&clist_key(endpoint, eref.as_str()));
    }

    /// Allocate the next import eref for `kref` in the endpoint's namespace
    /// and record the mapping.
    pub fn allocate_eref_for_kref(&mut self, endpoint: &EndpointId, kref: &KRef) -> Result<ERef, StoreError> {
        let (kind, counter) = if kref.is_promise() {
            (RefKind::Promise, format!("e.nextPromiseId.{}", endpoint))
        } else {
            (RefKind::Object, format!("e.nextObjectId.{}", endpoint))
        };
        let id = self.next_counter(&counter)?;
        let eref = ERef::new(endpoint.is_remote(), kind, RefDirection::Import, id);
        self.add_clist_entry(endpoint, kref, &eref);
        Ok(eref)
    }

    /// Every mapping in an endpoint's c-list, in kref order.
    pub fn clist_entries(&self, endpoint: &EndpointId) -> Result<Vec<CListEntry>, StoreError> {
        let prefix = format!("{}.c.k", endpoint);
        let mut entries = Vec::new();
        for key in self.kv.keys_with_prefix(&prefix) {
            let Some(value) = self.kv.get(&key) else {
                continue;
            };
            let kref: KRef = key[prefix.len() - 1..].parse()?;
            let (reachable, eref) = decode_kref_entry(&key, &value)?;
            entries.push(CListEntry {
                kref,
                eref,
                reachable,
            });
        }
        Ok(entries)
    }
}
