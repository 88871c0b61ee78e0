//! Kernel object records.

use ocap_ipc::{EndpointId, KRef};
use tracing::debug;

use super::KernelStore;
use crate::error::StoreError;
use crate::kv::KvStore;
use crate::types::RefCounts;

pub(crate) fn owner_key(kref: &KRef) -> String {
    format!("{}.owner", kref)
}

pub(crate) fn ref_count_key(kref: &KRef) -> String {
    format!("{}.refCount", kref)
}

impl<K: KvStore> KernelStore<K> {
    /// Allocate a new kernel object owned by `owner`, with counts `{1,1}`.
    pub fn init_kernel_object(&mut self, owner: &EndpointId) -> Result<KRef, StoreError> {
        let kref = KRef::object(self.next_counter("nextObjectId")?);
        self.kv.set(&owner_key(&kref), owner.as_str());
        self.set_object_ref_count(&kref, RefCounts::new(1, 1))?;
        debug!(kref = %kref, owner = %owner, "init kernel object");
        Ok(kref)
    }

    pub fn get_owner(&self, kref: &KRef) -> Result<Option<EndpointId>, StoreError> {
        match self.kv.get(&owner_key(kref)) {
            Some(owner) => Ok(Some(owner.parse()?)),
            None => Ok(None),
        }
    }

    /// Forget an object's owner. Later sends to it splat.
    pub fn orphan_kernel_object(&mut self, kref: &KRef) {
        self.kv.delete(&owner_key(kref));
    }

    /// Whether the kernel still has a record for `kref`.
    pub fn kernel_ref_exists(&self, kref: &KRef) -> bool {
        if kref.is_promise() {
            self.kv.get(&super::promise::state_key(kref)).is_some()
        } else {
            self.kv.get(&ref_count_key(kref)).is_some()
        }
    }

    pub fn delete_kernel_object(&mut self, kref: &KRef) {
        debug!(kref = %kref, "delete kernel object");
        self.kv.delete(&owner_key(kref));
        self.kv.delete(&ref_count_key(kref));
    }
}
