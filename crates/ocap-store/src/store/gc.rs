//! GC bookkeeping: the pending action set, the reap queue, and collection of
//! krefs whose counts reached zero.

use std::collections::BTreeSet;

use ocap_ipc::{EndpointId, KRef, VatId};
use tracing::debug;

use super::KernelStore;
use crate::error::StoreError;
use crate::kv::KvStore;
use crate::types::{GcAction, GcActionType, RefCountOptions, RunQueueItem};

const GC_ACTIONS_KEY: &str = "gcActions";
const REAP_QUEUE_KEY: &str = "reapQueue";

impl<K: KvStore> KernelStore<K> {
    pub fn get_gc_actions(&self) -> Result<BTreeSet<String>, StoreError> {
        Ok(self.get_json(GC_ACTIONS_KEY)?.unwrap_or_default())
    }

    pub fn set_gc_actions(&mut self, actions: &BTreeSet<String>) -> Result<(), StoreError> {
        self.set_json(GC_ACTIONS_KEY, actions)
    }

    pub fn add_gc_actions(&mut self, new_actions: impl IntoIterator<Item = GcAction>) -> Result<(), StoreError> {
        let mut actions = self.get_gc_actions()?;
        let before = actions.len();
        actions.extend(new_actions.into_iter().map(|a| a.to_string()));
        if actions.len() != before {
            self.set_gc_actions(&actions)?;
        }
        Ok(())
    }

    pub(crate) fn get_reap_queue(&self) -> Result<Vec<VatId>, StoreError> {
        Ok(self.get_json(REAP_QUEUE_KEY)?.unwrap_or_default())
    }

    /// Ask `vat` to run local GC. A vat is queued at most once.
    pub fn schedule_reap(&mut self, vat: &VatId) -> Result<(), StoreError> {
        let mut queue = self.get_reap_queue()?;
        if !queue.contains(vat) {
            queue.push(vat.clone());
            self.set_json(REAP_QUEUE_KEY, &queue)?;
        }
        Ok(())
    }

    pub fn next_reap_action(&mut self) -> Result<Option<RunQueueItem>, StoreError> {
        let mut queue = self.get_reap_queue()?;
        if queue.is_empty() {
            return Ok(None);
        }
        let vat_id = queue.remove(0);
        self.set_json(REAP_QUEUE_KEY, &queue)?;
        Ok(Some(RunQueueItem::BringOutYourDead { vat_id }))
    }

    /// Drain the maybe-free set until it stays empty.
    ///
    /// Unreferenced promises are deleted (a settled one first releases the
    /// krefs in its value). Objects a vat owns that nobody can reach get a
    /// `dropExport` action, and a `retireExport` once nobody can recognize
    /// them either. Ownerless objects with no counts are deleted outright.
    pub fn collect_garbage(&mut self) -> Result<(), StoreError> {
        loop {
            let batch = self.take_maybe_free();
            if batch.is_empty() {
                return Ok(());
            }
            let mut actions = Vec::new();
            for kref in batch {
                if !self.kernel_ref_exists(&kref) {
                    continue;
                }
                if kref.is_promise() {
                    self.collect_promise(&kref)?;
                } else {
                    self.collect_object(&kref, &mut actions)?;
                }
            }
            self.add_gc_actions(actions)?;
        }
    }

    fn collect_promise(&mut self, kpid: &KRef) -> Result<(), StoreError> {
        if self.get_promise_ref_count(kpid)? > 0 {
            return Ok(());
        }
        let promise = self.get_kernel_promise(kpid)?;
        if promise.state.is_resolved() {
            if let Some(value) = &promise.value {
                for slot in &value.slots {
                    self.decrement_ref_count(slot, "gc|promise|slot", RefCountOptions::default())?;
                }
            }
        }
        self.delete_kernel_promise(kpid)
    }

    fn collect_object(&mut self, kref: &KRef, actions: &mut Vec<GcAction>) -> Result<(), StoreError> {
        let counts = self.get_object_ref_count(kref)?;
        match self.get_owner(kref)? {
            Some(EndpointId::Vat(owner)) => {
                if counts.reachable > 0 {
                    return Ok(());
                }
                let endpoint = EndpointId::Vat(owner.clone());
                if self.get_reachable_flag(&endpoint, kref)? {
                    actions.push(GcAction::new(owner.clone(), GcActionType::DropExport, kref.clone()));
                }
                if counts.recognizable == 0 {
                    actions.push(GcAction::new(owner, GcActionType::RetireExport, kref.clone()));
                }
            }
            // Remote exporters are not driven by kernel GC
            Some(EndpointId::Remote(_)) => {}
            None => {
                if counts.is_zero() {
                    self.delete_kernel_object(kref);
                }
            }
        }
        Ok(())
    }

    /// The exporter retired these objects: importers get `retireImport`
    /// actions and the kernel forgets the objects.
    pub fn retire_kernel_objects(&mut self, krefs: &[KRef]) -> Result<(), StoreError> {
        let vats: Vec<VatId> = self.get_all_vat_records()?.into_iter().map(|(v, _)| v).collect();
        let mut actions = Vec::new();
        for kref in krefs {
            let owner = self.get_owner(kref)?;
            for vat in &vats {
                let endpoint = EndpointId::Vat(vat.clone());
                if owner.as_ref() == Some(&endpoint) {
                    continue;
                }
                if self.has_clist_entry(&endpoint, kref) {
                    actions.push(GcAction::new(vat.clone(), GcActionType::RetireImport, kref.clone()));
                }
            }
            debug!(kref = %kref, "retire kernel object");
            self.delete_kernel_object(kref);
        }
        self.add_gc_actions(actions)
    }
}
