//! Kernel promise records.

use std::collections::BTreeSet;

use ocap_ipc::{CapData, EndpointId, KRef, VatId};
use tracing::debug;

use super::KernelStore;
use crate::error::StoreError;
use crate::kv::KvStore;
use crate::types::{KernelPromise, PromiseState, RefCountOptions, RunQueueItem};

pub(crate) fn state_key(kpid: &KRef) -> String {
    format!("{}.state", kpid)
}

pub(crate) fn promise_ref_count_key(kpid: &KRef) -> String {
    format!("{}.refCount", kpid)
}

fn decider_key(kpid: &KRef) -> String {
    format!("{}.decider", kpid)
}

fn subscribers_key(kpid: &KRef) -> String {
    format!("{}.subscribers", kpid)
}

fn value_key(kpid: &KRef) -> String {
    format!("{}.value", kpid)
}

const KERNEL_SUBSCRIPTIONS_KEY: &str = "kernelSubscriptions";
const KERNEL_SUBSCRIPTION_TAG: &str = "kernel|subscription";

impl<K: KvStore> KernelStore<K> {
    /// Allocate an unresolved promise with no decider and a zero count.
    pub fn init_kernel_promise(&mut self) -> Result<(KRef, KernelPromise), StoreError> {
        let kpid = KRef::promise(self.next_counter("nextPromiseId")?);
        self.kv
            .set(&state_key(&kpid), PromiseState::Unresolved.as_str());
        self.set_u64(&promise_ref_count_key(&kpid), 0);
        self.set_json(&subscribers_key(&kpid), &Vec::<VatId>::new())?;
        debug!(kpid = %kpid, "init kernel promise");
        let promise = KernelPromise {
            state: PromiseState::Unresolved,
            decider: None,
            subscribers: Vec::new(),
            value: None,
        };
        Ok((kpid, promise))
    }

    pub fn get_kernel_promise(&self, kpid: &KRef) -> Result<KernelPromise, StoreError> {
        let key = state_key(kpid);
        let state: PromiseState = self
            .kv
            .get(&key)
            .ok_or_else(|| StoreError::UnknownPromise(kpid.clone()))?
            .parse()
            .map_err(|reason: String| StoreError::corrupt(&key, reason))?;
        let decider = match self.kv.get(&decider_key(kpid)) {
            Some(d) => Some(d.parse()?),
            None => None,
        };
        let subscribers = self.get_json(&subscribers_key(kpid))?.unwrap_or_default();
        let value = self.get_json(&value_key(kpid))?;
        Ok(KernelPromise {
            state,
            decider,
            subscribers,
            value,
        })
    }

    pub fn get_promise_state(&self, kpid: &KRef) -> Result<PromiseState, StoreError> {
        Ok(self.get_kernel_promise(kpid)?.state)
    }

    pub fn set_promise_decider(
        &mut self,
        kpid: &KRef,
        decider: Option<&EndpointId>,
    ) -> Result<(), StoreError> {
        if !self.kernel_ref_exists(kpid) {
            return Err(StoreError::UnknownPromise(kpid.clone()));
        }
        match decider {
            Some(d) => self.kv.set(&decider_key(kpid), d.as_str()),
            None => self.kv.delete(&decider_key(kpid)),
        }
        Ok(())
    }

    /// Register `vat` for notification. Subscribers stay sorted and unique.
    pub fn add_promise_subscriber(&mut self, kpid: &KRef, vat: &VatId) -> Result<(), StoreError> {
        let promise = self.get_kernel_promise(kpid)?;
        if promise.state.is_resolved() {
            return Err(StoreError::AlreadyResolved(kpid.clone()));
        }
        let mut subscribers: BTreeSet<VatId> = promise.subscribers.into_iter().collect();
        subscribers.insert(vat.clone());
        let subscribers: Vec<VatId> = subscribers.into_iter().collect();
        self.set_json(&subscribers_key(kpid), &subscribers)
    }

    /// Settle a promise.
    ///
    /// The value's slots gain a count (the resolution holds them), messages
    /// parked on the promise go back to the run queue still targeting the
    /// promise, and decider/subscriber bookkeeping is dropped.
    pub fn resolve_kernel_promise(
        &mut self,
        kpid: &KRef,
        rejected: bool,
        value: &CapData<KRef>,
    ) -> Result<(), StoreError> {
        let promise = self.get_kernel_promise(kpid)?;
        if promise.state.is_resolved() {
            return Err(StoreError::AlreadyResolved(kpid.clone()));
        }
        for slot in &value.slots {
            self.increment_ref_count(slot, "resolve|slot", RefCountOptions::default())?;
        }
        let queued = self.drain_promise_queue(kpid)?;

        let state = if rejected {
            PromiseState::Rejected
        } else {
            PromiseState::Fulfilled
        };
        self.kv.set(&state_key(kpid), state.as_str());
        self.set_json(&value_key(kpid), value)?;
        self.kv.delete(&decider_key(kpid));
        self.kv.delete(&subscribers_key(kpid));
        self.delete_queue(kpid.as_str())?;
        debug!(kpid = %kpid, state = state.as_str(), requeued = queued.len(), "resolved");

        for message in queued {
            self.enqueue_run(&RunQueueItem::Send {
                target: kpid.clone(),
                message,
            })?;
        }
        Ok(())
    }

    /// Every already-settled promise reachable from a resolution through its
    /// slots, starting with `orig_kpid` itself.
    pub fn get_kpids_to_retire(
        &self,
        orig_kpid: &KRef,
        orig_value: &CapData<KRef>,
    ) -> Result<Vec<KRef>, StoreError> {
        let mut seen: BTreeSet<KRef> = BTreeSet::new();
        let mut found = vec![orig_kpid.clone()];
        seen.insert(orig_kpid.clone());
        let mut worklist: Vec<CapData<KRef>> = vec![orig_value.clone()];

        while let Some(value) = worklist.pop() {
            for slot in value.slots {
                if !slot.is_promise() || seen.contains(&slot) {
                    continue;
                }
                let promise = self.get_kernel_promise(&slot)?;
                if !promise.state.is_resolved() {
                    continue;
                }
                seen.insert(slot.clone());
                found.push(slot);
                if let Some(v) = promise.value {
                    worklist.push(v);
                }
            }
        }
        Ok(found)
    }

    /// Unresolved promises whose decider is `endpoint`.
    pub fn get_promises_decided_by(&self, endpoint: &EndpointId) -> Result<Vec<KRef>, StoreError> {
        let mut kpids = Vec::new();
        for key in self.kv.keys_with_prefix("kp") {
            let Some(kpid) = key.strip_suffix(".decider") else {
                continue;
            };
            if self.kv.get(&key).as_deref() == Some(endpoint.as_str()) {
                kpids.push(kpid.parse()?);
            }
        }
        Ok(kpids)
    }

    pub fn delete_kernel_promise(&mut self, kpid: &KRef) -> Result<(), StoreError> {
        debug!(kpid = %kpid, "delete kernel promise");
        self.kv.delete(&state_key(kpid));
        self.kv.delete(&decider_key(kpid));
        self.kv.delete(&subscribers_key(kpid));
        self.kv.delete(&value_key(kpid));
        self.kv.delete(&promise_ref_count_key(kpid));
        self.delete_queue(kpid.as_str())
    }

    // ========================================================================
    // Kernel subscriptions
    // ========================================================================

    /// Kernel-originated result promises still holding their kernel pin.
    pub fn get_kernel_subscriptions(&self) -> Result<BTreeSet<KRef>, StoreError> {
        Ok(self.get_json(KERNEL_SUBSCRIPTIONS_KEY)?.unwrap_or_default())
    }

    /// Pin `kpid` on the kernel's behalf and remember that it did.
    pub fn pin_kernel_subscription(&mut self, kpid: &KRef) -> Result<(), StoreError> {
        let mut pinned = self.get_kernel_subscriptions()?;
        if !pinned.insert(kpid.clone()) {
            return Ok(());
        }
        self.increment_ref_count(kpid, KERNEL_SUBSCRIPTION_TAG, RefCountOptions::default())?;
        self.set_json(KERNEL_SUBSCRIPTIONS_KEY, &pinned)
    }

    /// Drop the kernel pin on `kpid`. Unpinned promises are left alone.
    pub fn unpin_kernel_subscription(&mut self, kpid: &KRef) -> Result<(), StoreError> {
        let mut pinned = self.get_kernel_subscriptions()?;
        if !pinned.remove(kpid) {
            return Ok(());
        }
        self.set_json(KERNEL_SUBSCRIPTIONS_KEY, &pinned)?;
        self.decrement_ref_count(kpid, KERNEL_SUBSCRIPTION_TAG, RefCountOptions::default())
    }

    /// Drop every kernel pin. Called when a kernel is rebuilt from storage:
    /// the callers that were waiting on these promises are gone.
    pub fn release_kernel_subscriptions(&mut self) -> Result<Vec<KRef>, StoreError> {
        let pinned = self.get_kernel_subscriptions()?;
        self.kv.delete(KERNEL_SUBSCRIPTIONS_KEY);
        let mut released = Vec::with_capacity(pinned.len());
        for kpid in pinned {
            if !self.kernel_ref_exists(&kpid) {
                continue;
            }
            self.decrement_ref_count(&kpid, KERNEL_SUBSCRIPTION_TAG, RefCountOptions::default())?;
            released.push(kpid);
        }
        Ok(released)
    }
}
