//! Counters and id allocation.

use ocap_ipc::{RemoteId, VatId};

use super::KernelStore;
use crate::error::StoreError;
use crate::kv::KvStore;

impl<K: KvStore> KernelStore<K> {
    /// Return the counter at `key` and advance it. Counters start at 1.
    pub(crate) fn next_counter(&mut self, key: &str) -> Result<u64, StoreError> {
        let id = self.get_u64(key)?.unwrap_or(1);
        self.set_u64(key, id + 1);
        Ok(id)
    }

    pub fn allocate_vat_id(&mut self) -> Result<VatId, StoreError> {
        Ok(VatId::new(self.next_counter("nextVatId")?))
    }

    pub fn allocate_remote_id(&mut self) -> Result<RemoteId, StoreError> {
        Ok(RemoteId::new(self.next_counter("nextRemoteId")?))
    }
}
