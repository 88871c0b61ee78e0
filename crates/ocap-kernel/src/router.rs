//! Delivery of run-queue items to vats.
//!
//! One [`KernelRouter`] is built per crank from disjoint borrows of the
//! kernel's parts. Routing failures are expressed as data: a message that
//! cannot reach an object splats, rejecting its result promise.

use std::collections::{BTreeMap, BTreeSet};

use ocap_ipc::{
    extract_single_ref, kser_error, CapData, EndpointId, KRef, Message, Resolution, VatDelivery,
    VatId,
};
use ocap_store::{KernelStore, KvStore, PromiseState, RefCountOptions, RunQueueItem, StoreError};
use tracing::{debug, error, info, warn};

use crate::error::KernelError;
use crate::queue::KernelQueue;
use crate::types::VatExit;
use crate::vat::{VatHandle, VatSyscallHandler};

/// Where a send goes.
#[derive(Debug, PartialEq, Eq)]
enum Route {
    Deliver { vat: VatId, target: KRef },
    /// Park on an unresolved promise
    Requeue { kpid: KRef },
    /// Drop, rejecting the result with this value
    Splat(CapData<KRef>),
}

pub struct KernelRouter<'a, K: KvStore> {
    store: &'a mut KernelStore<K>,
    queue: &'a mut KernelQueue,
    vats: &'a mut BTreeMap<VatId, VatHandle>,
    exits: &'a mut Vec<VatExit>,
}

impl<'a, K: KvStore> KernelRouter<'a, K> {
    pub fn new(
        store: &'a mut KernelStore<K>,
        queue: &'a mut KernelQueue,
        vats: &'a mut BTreeMap<VatId, VatHandle>,
        exits: &'a mut Vec<VatExit>,
    ) -> Self {
        Self {
            store,
            queue,
            vats,
            exits,
        }
    }

    pub async fn deliver(&mut self, item: RunQueueItem) -> Result<(), KernelError> {
        debug!(item = item.kind(), "deliver");
        match item {
            RunQueueItem::Send { target, message } => self.deliver_send(target, message).await,
            RunQueueItem::Notify { vat_id, kpid } => self.deliver_notify(vat_id, kpid).await,
            RunQueueItem::DropExports { vat_id, krefs } => {
                self.deliver_gc(vat_id, krefs, GcDelivery::DropExports).await
            }
            RunQueueItem::RetireExports { vat_id, krefs } => {
                self.deliver_gc(vat_id, krefs, GcDelivery::RetireExports).await
            }
            RunQueueItem::RetireImports { vat_id, krefs } => {
                self.deliver_gc(vat_id, krefs, GcDelivery::RetireImports).await
            }
            RunQueueItem::BringOutYourDead { vat_id } => {
                if self.vats.contains_key(&vat_id) {
                    self.deliver_to_vat(&vat_id, VatDelivery::BringOutYourDead)
                        .await?;
                }
                Ok(())
            }
        }
    }

    // ========================================================================
    // Messages
    // ========================================================================

    /// Follow `target` through settled promises to a deliverable object.
    fn route(&self, target: &KRef) -> Result<Route, KernelError> {
        let mut current = target.clone();
        let mut visited = BTreeSet::new();
        loop {
            if current.is_object() {
                return Ok(match self.store.get_owner(&current)? {
                    Some(EndpointId::Vat(vat)) => Route::Deliver {
                        vat,
                        target: current,
                    },
                    _ => Route::Splat(kser_error("no vat")),
                });
            }
            if !visited.insert(current.clone()) {
                return Ok(Route::Splat(kser_error("no object")));
            }
            let promise = self.store.get_kernel_promise(&current)?;
            match promise.state {
                PromiseState::Unresolved => return Ok(Route::Requeue { kpid: current }),
                PromiseState::Fulfilled => {
                    match promise.value.as_ref().and_then(extract_single_ref) {
                        Some(next) => current = next,
                        None => return Ok(Route::Splat(kser_error("no object"))),
                    }
                }
                PromiseState::Rejected => {
                    return Ok(Route::Splat(
                        promise.value.unwrap_or_else(|| kser_error("rejected")),
                    ))
                }
            }
        }
    }

    async fn deliver_send(&mut self, target: KRef, message: Message<KRef>) -> Result<(), KernelError> {
        let route = match self.route(&target)? {
            Route::Deliver { vat, .. } if !self.vats.contains_key(&vat) => {
                Route::Splat(kser_error("no vat"))
            }
            route => route,
        };
        match route {
            Route::Splat(reason) => {
                warn!(kref = %target, result = ?message.result, "message splat");
                if let Some(result) = &message.result {
                    self.queue.resolve_promises(
                        self.store,
                        None,
                        vec![Resolution::new(result.clone(), true, reason)],
                    )?;
                }
                self.release_send(&target, &message)?;
            }
            Route::Requeue { kpid } => {
                debug!(kref = %target, kpid = %kpid, "queued on promise");
                if kpid != target {
                    self.store
                        .increment_ref_count(&kpid, "pipeline|target", RefCountOptions::default())?;
                    self.store
                        .decrement_ref_count(&target, "pipeline|target", RefCountOptions::default())?;
                }
                self.store.enqueue_promise_message(&kpid, &message)?;
            }
            Route::Deliver { vat, target: object } => {
                let endpoint = EndpointId::Vat(vat.clone());
                if let Some(result) = &message.result {
                    self.store.set_promise_decider(result, Some(&endpoint))?;
                }
                let vtarget = self.store.translate_ref_k_to_v(&endpoint, &object, false)?;
                let vmessage = self.store.translate_message_k_to_v(&endpoint, &message)?;
                if let Some(result) = &message.result {
                    self.store
                        .decrement_ref_count(result, "deliver|result", RefCountOptions::default())?;
                }
                self.deliver_to_vat(
                    &vat,
                    VatDelivery::Message {
                        target: vtarget,
                        message: vmessage,
                    },
                )
                .await?;
                self.store
                    .decrement_ref_count(&target, "deliver|target", RefCountOptions::default())?;
                self.release_slots(&message.methargs)?;
            }
        }
        Ok(())
    }

    /// Drop the counts a queued send held.
    fn release_send(&mut self, target: &KRef, message: &Message<KRef>) -> Result<(), StoreError> {
        self.store
            .decrement_ref_count(target, "splat|target", RefCountOptions::default())?;
        if let Some(result) = &message.result {
            self.store
                .decrement_ref_count(result, "splat|result", RefCountOptions::default())?;
        }
        self.release_slots(&message.methargs)
    }

    fn release_slots(&mut self, data: &CapData<KRef>) -> Result<(), StoreError> {
        for slot in &data.slots {
            self.store
                .decrement_ref_count(slot, "queue|slot", RefCountOptions::default())?;
        }
        Ok(())
    }

    // ========================================================================
    // Notifications
    // ========================================================================

    async fn deliver_notify(&mut self, vat_id: VatId, kpid: KRef) -> Result<(), KernelError> {
        let endpoint = EndpointId::Vat(vat_id.clone());
        if !self.vats.contains_key(&vat_id) || !self.store.has_clist_entry(&endpoint, &kpid) {
            debug!(vat = %vat_id, kpid = %kpid, "notify target gone");
            self.store
                .decrement_ref_count(&kpid, "notify", RefCountOptions::default())?;
            return Ok(());
        }

        let promise = self.store.get_kernel_promise(&kpid)?;
        let Some(value) = promise.value else {
            return Err(StoreError::corrupt(kpid.as_str(), "notify for unresolved promise").into());
        };
        let revealed = self.store.get_kpids_to_retire(&kpid, &value)?;
        let mut resolutions = Vec::with_capacity(revealed.len());
        for k in &revealed {
            let settled = self.store.get_kernel_promise(k)?;
            let data = settled
                .value
                .ok_or_else(|| StoreError::corrupt(k.as_str(), "resolved promise has no value"))?;
            let resolution = Resolution::new(
                k.clone(),
                settled.state == PromiseState::Rejected,
                data,
            );
            resolutions.push(
                self.store
                    .translate_resolution_k_to_v(&endpoint, &resolution)?,
            );
        }

        self.deliver_to_vat(&vat_id, VatDelivery::Notify { resolutions })
            .await?;
        self.store
            .decrement_ref_count(&kpid, "notify", RefCountOptions::default())?;

        // The vat now knows these promises are settled
        for k in &revealed {
            if let Some(eref) = self.store.kref_to_eref(&endpoint, k)? {
                self.store.delete_clist_entry(&endpoint, k, &eref)?;
            }
        }
        Ok(())
    }

    // ========================================================================
    // GC
    // ========================================================================

    async fn deliver_gc(
        &mut self,
        vat_id: VatId,
        krefs: Vec<KRef>,
        kind: GcDelivery,
    ) -> Result<(), KernelError> {
        if !self.vats.contains_key(&vat_id) {
            debug!(vat = %vat_id, "gc delivery to missing vat skipped");
            return Ok(());
        }
        let endpoint = EndpointId::Vat(vat_id.clone());
        let mut mapped = Vec::with_capacity(krefs.len());
        for kref in krefs {
            if let Some(eref) = self.store.kref_to_eref(&endpoint, &kref)? {
                mapped.push((kref, eref));
            }
        }
        if mapped.is_empty() {
            return Ok(());
        }

        let vrefs = mapped.iter().map(|(_, eref)| eref.clone()).collect();
        let delivery = match kind {
            GcDelivery::DropExports => VatDelivery::DropExports { vrefs },
            GcDelivery::RetireExports => VatDelivery::RetireExports { vrefs },
            GcDelivery::RetireImports => VatDelivery::RetireImports { vrefs },
        };
        self.deliver_to_vat(&vat_id, delivery).await?;

        match kind {
            GcDelivery::DropExports => {
                for (kref, _) in &mapped {
                    self.store.clear_reachable_flag(&endpoint, kref)?;
                }
            }
            GcDelivery::RetireExports => {
                let mut retired = Vec::with_capacity(mapped.len());
                for (kref, eref) in mapped {
                    self.store.delete_clist_entry(&endpoint, &kref, &eref)?;
                    retired.push(kref);
                }
                self.store.retire_kernel_objects(&retired)?;
            }
            GcDelivery::RetireImports => {
                for (kref, eref) in &mapped {
                    self.store.delete_clist_entry(&endpoint, kref, eref)?;
                }
            }
        }
        Ok(())
    }

    // ========================================================================
    // Vat I/O
    // ========================================================================

    /// Hand one delivery to a vat, servicing its syscalls until it replies.
    ///
    /// A vat that fails the delivery or whose transport breaks is scheduled
    /// for termination; that is not an error for the kernel.
    async fn deliver_to_vat(&mut self, vat_id: &VatId, delivery: VatDelivery) -> Result<(), KernelError> {
        let Some(handle) = self.vats.get_mut(vat_id) else {
            return Err(KernelError::VatNotFound(vat_id.clone()));
        };
        let name = delivery.name();
        let store = &mut *self.store;
        let queue = &mut *self.queue;
        let exits = &mut *self.exits;
        let reply = handle
            .deliver(delivery, |syscall| {
                VatSyscallHandler::new(vat_id, store, queue, exits).handle(syscall)
            })
            .await;

        match reply {
            Ok(reply) => {
                store.apply_vat_checkpoint(vat_id, &reply.checkpoint);
                if let Some(reason) = reply.error {
                    warn!(vat = %vat_id, delivery = name, reason = %reason, "delivery failed");
                    exits.push(VatExit {
                        vat_id: vat_id.clone(),
                        is_failure: true,
                        info: kser_error(&format!("delivery failed: {}", reason)),
                    });
                }
            }
            // Cancelled by a termination request: a clean exit
            Err(KernelError::VatDeleted(_)) => {
                info!(vat = %vat_id, delivery = name, "delivery cancelled");
                exits.push(VatExit {
                    vat_id: vat_id.clone(),
                    is_failure: false,
                    info: kser_error("vat terminated"),
                });
            }
            Err(err) => {
                error!(vat = %vat_id, delivery = name, error = %err, "vat unreachable");
                exits.push(VatExit {
                    vat_id: vat_id.clone(),
                    is_failure: true,
                    info: kser_error(&err.to_string()),
                });
            }
        }
        Ok(())
    }
}

#[derive(Clone, Copy, Debug)]
enum GcDelivery {
    DropExports,
    RetireExports,
    RetireImports,
}
