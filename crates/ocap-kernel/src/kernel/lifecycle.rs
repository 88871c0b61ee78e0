//! Vat lifecycle: launch, restart, terminate, reap, reset.

use ocap_ipc::{
    kser_error, kslot, methargs, CapData, ERef, EndpointId, KRef, RefDirection, RefKind,
    Resolution, VatConfig, VatId,
};
use ocap_store::KvStore;
use serde_json::{json, Map, Value};
use tokio::sync::oneshot;
use tracing::{error, info, warn};

use super::Kernel;
use crate::config::ClusterConfig;
use crate::error::KernelError;
use crate::types::PromiseSettlement;
use crate::vat::{VatHandle, VatSyscallHandler};
use crate::worker::VatWorkerService;

impl<K: KvStore, W: VatWorkerService> Kernel<K, W> {
    /// Create a vat and return its root object.
    ///
    /// The root is exported as `o+0` and keeps its creation count, so it
    /// stays alive for as long as the vat does.
    pub async fn launch_vat(&mut self, config: VatConfig) -> Result<KRef, KernelError> {
        let vat_id = self.store.allocate_vat_id()?;
        self.store.set_vat_config(&vat_id, &config)?;
        let endpoint = EndpointId::Vat(vat_id.clone());
        let root = self.store.init_kernel_object(&endpoint)?;
        let root_eref = ERef::new(false, RefKind::Object, RefDirection::Export, 0);
        self.store.add_clist_entry(&endpoint, &root, &root_eref);

        if let Err(err) = self.start_vat(vat_id.clone(), config).await {
            error!(vat = %vat_id, error = %err, "vat failed to start");
            if let Err(stop) = self.worker.terminate(&vat_id).await {
                warn!(vat = %vat_id, error = %stop, "worker failed to stop vat");
            }
            self.store.start_crank();
            let cleaned = self.discard_unstarted_vat(&vat_id, &root);
            self.store.end_crank();
            cleaned?;
            return Err(err);
        }
        info!(vat = %vat_id, root = %root, "vat launched");
        Ok(root)
    }

    /// Undo a launch whose vat never started. Its root still holds the
    /// creation pin, so it is deleted rather than orphaned.
    fn discard_unstarted_vat(&mut self, vat_id: &VatId, root: &KRef) -> Result<(), KernelError> {
        let decided = self.store.cleanup_terminated_vat(vat_id)?;
        if !decided.is_empty() {
            let endpoint = EndpointId::Vat(vat_id.clone());
            let rejections = decided
                .into_iter()
                .map(|kpid| Resolution::new(kpid, true, kser_error("vat failed to start")))
                .collect();
            self.queue
                .resolve_promises(&mut self.store, Some(&endpoint), rejections)?;
        }
        self.store.delete_kernel_object(root);
        self.store.collect_garbage()?;
        Ok(())
    }

    /// Launch a cluster's vats in name order and, if it names one, send the
    /// bootstrap vat `bootstrap(roots, services)`.
    ///
    /// Returns the bootstrap result receiver.
    pub async fn launch_subcluster(
        &mut self,
        config: ClusterConfig,
    ) -> Result<Option<oneshot::Receiver<PromiseSettlement>>, KernelError> {
        config.validate()?;
        if config.force_reset {
            self.reset().await?;
        }

        let mut roots = Vec::with_capacity(config.vats.len());
        for (name, vat_config) in &config.vats {
            let root = self.launch_vat(vat_config.clone()).await?;
            roots.push((name.clone(), root));
        }

        let Some(bootstrap) = &config.bootstrap else {
            return Ok(None);
        };
        let target = roots
            .iter()
            .find(|(name, _)| name == bootstrap)
            .map(|(_, root)| root.clone())
            .ok_or_else(|| KernelError::Config(format!("bootstrap vat {:?} not launched", bootstrap)))?;

        let mut record = Map::new();
        let mut slots = Vec::with_capacity(roots.len());
        for (index, (name, root)) in roots.into_iter().enumerate() {
            record.insert(name, kslot(index, false, "vatRoot"));
            slots.push(root);
        }
        let args = methargs("bootstrap", vec![Value::Object(record), json!({})], slots);
        info!(target_vat = %bootstrap, "bootstrapping subcluster");
        Ok(Some(self.queue_message_with_slots(target, args)?))
    }

    /// Attach a worker for `vat_id` and initialize it with its vat store.
    pub(super) async fn start_vat(&mut self, vat_id: VatId, config: VatConfig) -> Result<(), KernelError> {
        let stream = self.worker.launch(&vat_id, &config).await?;
        let mut handle = VatHandle::new(vat_id.clone(), config, stream);
        let state = self.store.get_vat_store(&vat_id);

        self.store.start_crank();
        let store = &mut self.store;
        let queue = &mut self.queue;
        let exits = &mut self.exits;
        let reply = handle
            .init(state, |syscall| {
                VatSyscallHandler::new(&vat_id, store, queue, exits).handle(syscall)
            })
            .await;
        let collected = self.store.collect_garbage();
        self.store.end_crank();
        collected?;

        let reply = reply?;
        if let Some(reason) = reply.error {
            handle.terminate();
            return Err(KernelError::VatFailed {
                vat: vat_id,
                reason,
            });
        }
        self.store.apply_vat_checkpoint(&vat_id, &reply.checkpoint);
        self.vats.insert(vat_id.clone(), handle);
        info!(vat = %vat_id, "vat started");
        Ok(())
    }

    /// Replace a vat's worker, keeping its id, config, c-list and store.
    pub async fn restart_vat(&mut self, vat_id: &VatId) -> Result<(), KernelError> {
        let Some(mut handle) = self.vats.remove(vat_id) else {
            return Err(KernelError::VatNotFound(vat_id.clone()));
        };
        handle.terminate();
        self.worker.terminate(vat_id).await?;
        let config = handle.config().clone();
        drop(handle);
        info!(vat = %vat_id, "restarting vat");
        self.start_vat(vat_id.clone(), config).await
    }

    /// Stop a vat and remove it from the kernel.
    ///
    /// Promises it was deciding are rejected with `reason`, or with
    /// `vat terminated` when none is given.
    pub async fn terminate_vat(
        &mut self,
        vat_id: &VatId,
        reason: Option<CapData<KRef>>,
    ) -> Result<(), KernelError> {
        self.store.start_crank();
        let result = self.terminate_vat_in_crank(vat_id, reason).await;
        let collected = self.store.collect_garbage();
        self.store.end_crank();
        result?;
        collected?;
        Ok(())
    }

    pub(super) async fn terminate_vat_in_crank(
        &mut self,
        vat_id: &VatId,
        reason: Option<CapData<KRef>>,
    ) -> Result<(), KernelError> {
        let Some(mut handle) = self.vats.remove(vat_id) else {
            return Err(KernelError::VatNotFound(vat_id.clone()));
        };
        handle.terminate();
        drop(handle);
        if let Err(err) = self.worker.terminate(vat_id).await {
            warn!(vat = %vat_id, error = %err, "worker failed to stop vat");
        }

        let decided = self.store.cleanup_terminated_vat(vat_id)?;
        let reason = reason.unwrap_or_else(|| kser_error("vat terminated"));
        let endpoint = EndpointId::Vat(vat_id.clone());
        let rejections = decided
            .into_iter()
            .map(|kpid| Resolution::new(kpid, true, reason.clone()))
            .collect();
        self.queue
            .resolve_promises(&mut self.store, Some(&endpoint), rejections)?;
        self.store.collect_garbage()?;
        info!(vat = %vat_id, "vat terminated");
        Ok(())
    }

    pub async fn terminate_all_vats(&mut self) -> Result<(), KernelError> {
        for vat_id in self.vat_ids() {
            self.terminate_vat(&vat_id, None).await?;
        }
        self.worker.terminate_all().await
    }

    /// Ask every vat matching `filter` to run its own garbage collection.
    pub fn reap_vats(&mut self, filter: impl Fn(&VatId) -> bool) -> Result<(), KernelError> {
        let mut scheduled = 0;
        for vat_id in self.vat_ids() {
            if filter(&vat_id) {
                self.store.schedule_reap(&vat_id)?;
                scheduled += 1;
            }
        }
        if scheduled > 0 {
            self.queue.wake();
        }
        info!(scheduled, "reap scheduled");
        Ok(())
    }

    /// Stop all vats and wipe the store.
    pub async fn reset(&mut self) -> Result<(), KernelError> {
        for handle in self.vats.values_mut() {
            handle.terminate();
        }
        self.vats.clear();
        self.worker.terminate_all().await?;
        self.store.reset();
        self.queue.clear_subscriptions();
        self.exits.clear();
        info!("kernel reset");
        Ok(())
    }
}
