//! Translation between kernel references and endpoint references.

use ocap_ipc::{CapData, ERef, EndpointId, KRef, Message, Resolution};
use tracing::trace;

use super::KernelStore;
use crate::error::StoreError;
use crate::kv::KvStore;
use crate::types::RefCountOptions;

impl<K: KvStore> KernelStore<K> {
    /// Kernel → endpoint.
    ///
    /// With `import_if_needed` a kref the endpoint has never seen is imported
    /// (counted, then given a fresh eref); without it a missing mapping fails.
    pub fn translate_ref_k_to_v(
        &mut self,
        endpoint: &EndpointId,
        kref: &KRef,
        import_if_needed: bool,
    ) -> Result<ERef, StoreError> {
        if let Some(eref) = self.kref_to_eref(endpoint, kref)? {
            if eref.is_import() && !self.get_reachable_flag(endpoint, kref)? {
                self.set_reachable_flag(endpoint, kref)?;
            }
            return Ok(eref);
        }
        if !import_if_needed {
            return Err(StoreError::UnmappedKref {
                endpoint: endpoint.clone(),
                kref: kref.clone(),
            });
        }
        self.increment_ref_count(kref, "import", RefCountOptions::default())?;
        let eref = self.allocate_eref_for_kref(endpoint, kref)?;
        trace!(endpoint = %endpoint, kref = %kref, eref = %eref, "imported");
        Ok(eref)
    }

    /// Endpoint → kernel.
    ///
    /// An unknown export creates the kernel entity it names: a promise decided
    /// by the endpoint, or an object it owns. Unknown imports are a violation.
    pub fn translate_ref_v_to_k(
        &mut self,
        endpoint: &EndpointId,
        eref: &ERef,
    ) -> Result<KRef, StoreError> {
        if let Some(kref) = self.eref_to_kref(endpoint, eref)? {
            if eref.is_export() && !self.get_reachable_flag(endpoint, &kref)? {
                self.set_reachable_flag(endpoint, &kref)?;
            }
            return Ok(kref);
        }
        if eref.is_import() {
            return Err(StoreError::UnmappedEref {
                endpoint: endpoint.clone(),
                eref: eref.clone(),
            });
        }
        let kref = if eref.is_promise() {
            let (kpid, _) = self.init_kernel_promise()?;
            self.set_promise_decider(&kpid, Some(endpoint))?;
            kpid
        } else {
            let koid = self.init_kernel_object(endpoint)?;
            self.arena.fresh_exports.push(koid.clone());
            koid
        };
        self.increment_ref_count(&kref, "export", RefCountOptions::EXPORT)?;
        self.add_clist_entry(endpoint, &kref, eref);
        trace!(endpoint = %endpoint, kref = %kref, eref = %eref, "exported");
        Ok(kref)
    }

    /// Drop the creation count of objects exported by the syscall just handled.
    pub fn release_fresh_exports(&mut self) -> Result<(), StoreError> {
        for kref in std::mem::take(&mut self.arena.fresh_exports) {
            self.decrement_ref_count(&kref, "fresh|export", RefCountOptions::default())?;
        }
        Ok(())
    }

    pub fn translate_capdata_k_to_v(
        &mut self,
        endpoint: &EndpointId,
        data: &CapData<KRef>,
    ) -> Result<CapData<ERef>, StoreError> {
        data.try_map_slots(|kref| self.translate_ref_k_to_v(endpoint, kref, true))
    }

    pub fn translate_capdata_v_to_k(
        &mut self,
        endpoint: &EndpointId,
        data: &CapData<ERef>,
    ) -> Result<CapData<KRef>, StoreError> {
        data.try_map_slots(|eref| self.translate_ref_v_to_k(endpoint, eref))
    }

    pub fn translate_message_k_to_v(
        &mut self,
        endpoint: &EndpointId,
        message: &Message<KRef>,
    ) -> Result<Message<ERef>, StoreError> {
        let methargs = self.translate_capdata_k_to_v(endpoint, &message.methargs)?;
        let result = match &message.result {
            Some(kpid) => Some(self.translate_ref_k_to_v(endpoint, kpid, true)?),
            None => None,
        };
        Ok(Message::new(methargs, result))
    }

    pub fn translate_message_v_to_k(
        &mut self,
        endpoint: &EndpointId,
        message: &Message<ERef>,
    ) -> Result<Message<KRef>, StoreError> {
        let methargs = self.translate_capdata_v_to_k(endpoint, &message.methargs)?;
        let result = match &message.result {
            Some(vpid) => Some(self.translate_ref_v_to_k(endpoint, vpid)?),
            None => None,
        };
        Ok(Message::new(methargs, result))
    }

    pub fn translate_resolution_k_to_v(
        &mut self,
        endpoint: &EndpointId,
        resolution: &Resolution<KRef>,
    ) -> Result<Resolution<ERef>, StoreError> {
        let promise = self.translate_ref_k_to_v(endpoint, &resolution.promise, true)?;
        let data = self.translate_capdata_k_to_v(endpoint, &resolution.data)?;
        Ok(Resolution::new(promise, resolution.rejected, data))
    }

    pub fn translate_resolution_v_to_k(
        &mut self,
        endpoint: &EndpointId,
        resolution: &Resolution<ERef>,
    ) -> Result<Resolution<KRef>, StoreError> {
        let promise = self.translate_ref_v_to_k(endpoint, &resolution.promise)?;
        let data = self.translate_capdata_v_to_k(endpoint, &resolution.data)?;
        Ok(Resolution::new(promise, resolution.rejected, data))
    }
}
