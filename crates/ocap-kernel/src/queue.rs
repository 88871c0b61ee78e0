//! Run-queue scheduling and promise resolution.
//!
//! `KernelQueue` owns the runtime half of the run queue: the wake-up signal
//! the run loop parks on and the one-shot channels of callers waiting on
//! kernel-originated messages. The persisted half lives in the store, which
//! every method takes by `&mut` so all mutation stays on the crank path.

use std::collections::BTreeMap;
use std::sync::Arc;

use ocap_ipc::{CapData, EndpointId, KRef, Message, Resolution, VatId};
use ocap_store::{
    process_gc_action_set, KernelStore, KvStore, RefCountOptions, RunQueueItem, StoreError,
};
use tokio::sync::{oneshot, Notify};
use tracing::debug;

use crate::error::KernelError;
use crate::types::PromiseSettlement;

pub struct KernelQueue {
    /// Fired once per empty -> non-empty transition; only the run loop waits on it
    signal: Arc<Notify>,
    /// Kernel-originated result promises and their waiters
    subscriptions: BTreeMap<KRef, oneshot::Sender<PromiseSettlement>>,
}

impl Default for KernelQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl KernelQueue {
    pub fn new() -> Self {
        Self {
            signal: Arc::new(Notify::new()),
            subscriptions: BTreeMap::new(),
        }
    }

    pub fn signal(&self) -> Arc<Notify> {
        Arc::clone(&self.signal)
    }

    /// Wake the run loop for work that is not on the run queue (reaps).
    pub fn wake(&self) {
        self.signal.notify_one();
    }

    fn wake_if_needed<K: KvStore>(&self, store: &mut KernelStore<K>) {
        if store.take_pending_wakeup() {
            self.signal.notify_one();
        }
    }

    /// Drop every waiter; their receivers see the kernel as shut down.
    pub fn clear_subscriptions(&mut self) {
        self.subscriptions.clear();
    }

    /// Next unit of work: GC first, then reaps, then the run queue.
    pub fn next_item<K: KvStore>(&self, store: &mut KernelStore<K>) -> Result<Option<RunQueueItem>, StoreError> {
        if let Some(item) = process_gc_action_set(store)? {
            return Ok(Some(item));
        }
        if let Some(item) = store.next_reap_action()? {
            return Ok(Some(item));
        }
        store.dequeue_run()
    }

    pub fn enqueue_run<K: KvStore>(&self, store: &mut KernelStore<K>, item: RunQueueItem) -> Result<(), StoreError> {
        store.enqueue_run(&item)?;
        self.wake_if_needed(store);
        Ok(())
    }

    /// Queue a send. The queue entry holds a count on the target, the result
    /// and every slot until it is delivered or splatted.
    pub fn enqueue_send<K: KvStore>(
        &self,
        store: &mut KernelStore<K>,
        target: KRef,
        message: Message<KRef>,
    ) -> Result<(), StoreError> {
        store.increment_ref_count(&target, "queue|target", RefCountOptions::default())?;
        if let Some(result) = &message.result {
            store.increment_ref_count(result, "queue|result", RefCountOptions::default())?;
        }
        for slot in &message.methargs.slots {
            store.increment_ref_count(slot, "queue|slot", RefCountOptions::default())?;
        }
        self.enqueue_run(store, RunQueueItem::Send { target, message })
    }

    pub fn enqueue_notify<K: KvStore>(
        &self,
        store: &mut KernelStore<K>,
        vat_id: VatId,
        kpid: KRef,
    ) -> Result<(), StoreError> {
        store.increment_ref_count(&kpid, "notify", RefCountOptions::default())?;
        self.enqueue_run(store, RunQueueItem::Notify { vat_id, kpid })
    }

    /// Send a message on the kernel's own behalf.
    ///
    /// The result promise is pinned until it settles; the receiver yields the
    /// settlement as data, never as an error.
    pub fn enqueue_message<K: KvStore>(
        &mut self,
        store: &mut KernelStore<K>,
        target: KRef,
        methargs: CapData<KRef>,
    ) -> Result<oneshot::Receiver<PromiseSettlement>, StoreError> {
        let (kpid, _) = store.init_kernel_promise()?;
        store.pin_kernel_subscription(&kpid)?;
        let (tx, rx) = oneshot::channel();
        self.subscriptions.insert(kpid.clone(), tx);
        debug!(kref = %target, result = %kpid, "queue message from kernel");
        self.enqueue_send(store, target, Message::new(methargs, Some(kpid)))?;
        Ok(rx)
    }

    /// Settle promises on behalf of `decider` (`None` = the kernel).
    ///
    /// Each promise must be unresolved and decided by the caller. Subscribers
    /// get a notify, the store commits the resolution, and a kernel waiter, if
    /// any, receives the value.
    pub fn resolve_promises<K: KvStore>(
        &mut self,
        store: &mut KernelStore<K>,
        decider: Option<&EndpointId>,
        resolutions: Vec<Resolution<KRef>>,
    ) -> Result<(), KernelError> {
        for resolution in resolutions {
            let kpid = resolution.promise;
            let promise = store.get_kernel_promise(&kpid)?;
            if promise.state.is_resolved() {
                return Err(StoreError::AlreadyResolved(kpid).into());
            }
            if promise.decider.as_ref() != decider {
                let reason = match &promise.decider {
                    Some(d) => format!("its decider is {}", d),
                    None => "it has no decider".to_string(),
                };
                return Err(StoreError::NotPermitted {
                    endpoint: decider.map_or_else(|| "kernel".to_string(), |d| d.to_string()),
                    kpid,
                    reason,
                }
                .into());
            }

            for subscriber in promise.subscribers {
                self.enqueue_notify(store, subscriber, kpid.clone())?;
            }
            store.resolve_kernel_promise(&kpid, resolution.rejected, &resolution.data)?;
            self.wake_if_needed(store);

            if let Some(waiter) = self.subscriptions.remove(&kpid) {
                let _ = waiter.send(PromiseSettlement::new(resolution.rejected, resolution.data));
            }
            store.unpin_kernel_subscription(&kpid)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ocap_ipc::{kser, methargs};
    use ocap_store::{MemoryKvStore, PromiseState};
    use serde_json::json;

    fn new_store() -> KernelStore<MemoryKvStore> {
        KernelStore::new(MemoryKvStore::new())
    }

    fn vat(n: u64) -> EndpointId {
        EndpointId::Vat(VatId::new(n))
    }

    fn resolution(kpid: &KRef, value: &str) -> Resolution<KRef> {
        Resolution::new(kpid.clone(), false, kser(&json!(value)))
    }

    #[test]
    fn test_only_decider_may_resolve() {
        let mut store = new_store();
        let mut queue = KernelQueue::new();
        let (kp, _) = store.init_kernel_promise().unwrap();
        store.set_promise_decider(&kp, Some(&vat(1))).unwrap();

        let err = queue
            .resolve_promises(&mut store, Some(&vat(2)), vec![resolution(&kp, "x")])
            .unwrap_err();
        assert_eq!(
            err.to_string(),
            format!("v2 not permitted to resolve {} because its decider is v1", kp)
        );

        let err = queue
            .resolve_promises(&mut store, None, vec![resolution(&kp, "x")])
            .unwrap_err();
        assert_eq!(
            err.to_string(),
            format!("kernel not permitted to resolve {} because its decider is v1", kp)
        );

        queue
            .resolve_promises(&mut store, Some(&vat(1)), vec![resolution(&kp, "x")])
            .unwrap();
        assert_eq!(store.get_promise_state(&kp).unwrap(), PromiseState::Fulfilled);
    }

    #[test]
    fn test_undecided_promise_rejects_vat_resolver() {
        let mut store = new_store();
        let mut queue = KernelQueue::new();
        let (kp, _) = store.init_kernel_promise().unwrap();

        let err = queue
            .resolve_promises(&mut store, Some(&vat(3)), vec![resolution(&kp, "x")])
            .unwrap_err();
        assert!(err.to_string().ends_with("because it has no decider"));
    }

    #[test]
    fn test_second_resolution_fails() {
        let mut store = new_store();
        let mut queue = KernelQueue::new();
        let (kp, _) = store.init_kernel_promise().unwrap();

        queue
            .resolve_promises(&mut store, None, vec![resolution(&kp, "first")])
            .unwrap();
        let err = queue
            .resolve_promises(&mut store, None, vec![resolution(&kp, "second")])
            .unwrap_err();
        assert_eq!(err.to_string(), format!("{} was already resolved", kp));
        let promise = store.get_kernel_promise(&kp).unwrap();
        assert_eq!(promise.value, Some(kser(&json!("first"))));
    }

    #[test]
    fn test_subscribers_are_notified() {
        let mut store = new_store();
        let mut queue = KernelQueue::new();
        let (kp, _) = store.init_kernel_promise().unwrap();
        store.add_promise_subscriber(&kp, &VatId::new(2)).unwrap();
        store.add_promise_subscriber(&kp, &VatId::new(1)).unwrap();

        queue
            .resolve_promises(&mut store, None, vec![resolution(&kp, "x")])
            .unwrap();
        assert_eq!(store.get_promise_ref_count(&kp).unwrap(), 2);
        assert_eq!(
            store.dequeue_run().unwrap(),
            Some(RunQueueItem::Notify {
                vat_id: VatId::new(1),
                kpid: kp.clone(),
            })
        );
        assert_eq!(
            store.dequeue_run().unwrap(),
            Some(RunQueueItem::Notify {
                vat_id: VatId::new(2),
                kpid: kp,
            })
        );
    }

    #[test]
    fn test_enqueue_send_holds_counts() {
        let mut store = new_store();
        let queue = KernelQueue::new();
        let target = store.init_kernel_object(&vat(1)).unwrap();
        let arg = store.init_kernel_object(&vat(1)).unwrap();
        let (result, _) = store.init_kernel_promise().unwrap();

        queue
            .enqueue_send(
                &mut store,
                target.clone(),
                Message::new(methargs("m", vec![], vec![arg.clone()]), Some(result.clone())),
            )
            .unwrap();

        assert_eq!(store.get_object_ref_count(&target).unwrap().reachable, 2);
        assert_eq!(store.get_object_ref_count(&arg).unwrap().reachable, 2);
        assert_eq!(store.get_promise_ref_count(&result).unwrap(), 1);
        assert_eq!(store.run_queue_length().unwrap(), 1);
    }

    #[tokio::test]
    async fn test_kernel_message_settles_waiter() {
        let mut store = new_store();
        let mut queue = KernelQueue::new();
        let target = store.init_kernel_object(&vat(1)).unwrap();

        let rx = queue
            .enqueue_message(&mut store, target, methargs("ping", vec![], vec![]))
            .unwrap();
        let Some(RunQueueItem::Send { message, .. }) = store.dequeue_run().unwrap() else {
            panic!("expected a send");
        };
        let kp = message.result.unwrap();
        // Pinned by the subscription plus the queue entry
        assert_eq!(store.get_promise_ref_count(&kp).unwrap(), 2);

        queue
            .resolve_promises(
                &mut store,
                None,
                vec![Resolution::new(kp.clone(), true, kser(&json!("bad")))],
            )
            .unwrap();
        assert_eq!(store.get_promise_ref_count(&kp).unwrap(), 1);
        assert!(store.get_kernel_subscriptions().unwrap().is_empty());
        assert_eq!(rx.await.unwrap(), PromiseSettlement::Rejected(kser(&json!("bad"))));
    }

    #[test]
    fn test_pin_released_without_waiter() {
        let mut store = new_store();
        let mut queue = KernelQueue::new();
        let target = store.init_kernel_object(&vat(1)).unwrap();
        let rx = queue
            .enqueue_message(&mut store, target, methargs("ping", vec![], vec![]))
            .unwrap();
        let kp = KRef::promise(1);

        queue.clear_subscriptions();
        drop(rx);
        queue
            .resolve_promises(&mut store, None, vec![resolution(&kp, "late")])
            .unwrap();
        // Only the queue entry is left
        assert_eq!(store.get_promise_ref_count(&kp).unwrap(), 1);
        assert!(store.get_kernel_subscriptions().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_enqueue_wakes_run_loop() {
        let mut store = new_store();
        let queue = KernelQueue::new();
        let target = store.init_kernel_object(&vat(1)).unwrap();
        let signal = queue.signal();

        queue
            .enqueue_send(&mut store, target, Message::new(methargs("m", vec![], vec![]), None))
            .unwrap();
        // Permit was stored; this completes immediately
        signal.notified().await;
    }

    #[test]
    fn test_next_item_prefers_gc_then_reap() {
        let mut store = new_store();
        let queue = KernelQueue::new();
        let ko = store.init_kernel_object(&vat(1)).unwrap();
        store.add_clist_entry(&vat(1), &ko, &"o+1".parse().unwrap());
        queue
            .enqueue_send(&mut store, ko.clone(), Message::new(methargs("m", vec![], vec![]), None))
            .unwrap();
        store.schedule_reap(&VatId::new(1)).unwrap();
        store
            .set_object_ref_count(&ko, ocap_store::RefCounts::new(0, 1))
            .unwrap();
        store
            .add_gc_actions([ocap_store::GcAction::new(
                VatId::new(1),
                ocap_store::GcActionType::DropExport,
                ko.clone(),
            )])
            .unwrap();

        assert!(matches!(
            queue.next_item(&mut store).unwrap(),
            Some(RunQueueItem::DropExports { .. })
        ));
        assert!(matches!(
            queue.next_item(&mut store).unwrap(),
            Some(RunQueueItem::BringOutYourDead { .. })
        ));
        assert!(matches!(
            queue.next_item(&mut store).unwrap(),
            Some(RunQueueItem::Send { .. })
        ));
        assert_eq!(queue.next_item(&mut store).unwrap(), None);
    }
}
