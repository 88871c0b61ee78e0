//! Syscall adapter: vat-namespace syscalls to store and queue operations.
//!
//! A handler lives for one syscall. Any failure is reported back to the vat
//! as an error result and schedules the vat for termination; the kernel
//! itself keeps running.

use ocap_ipc::{
    kser_error, CapData, ERef, EndpointId, KRef, Message, Resolution, VRef, VatId, VatSyscall,
    VatSyscallResult,
};
use ocap_store::{KernelStore, KvStore, PromiseState, StoreError};
use tracing::{debug, error, warn};

use crate::error::KernelError;
use crate::queue::KernelQueue;
use crate::types::VatExit;

pub struct VatSyscallHandler<'a, K: KvStore> {
    vat_id: &'a VatId,
    endpoint: EndpointId,
    store: &'a mut KernelStore<K>,
    queue: &'a mut KernelQueue,
    /// Vats to terminate once the crank finishes
    exits: &'a mut Vec<VatExit>,
}

impl<'a, K: KvStore> VatSyscallHandler<'a, K> {
    pub fn new(
        vat_id: &'a VatId,
        store: &'a mut KernelStore<K>,
        queue: &'a mut KernelQueue,
        exits: &'a mut Vec<VatExit>,
    ) -> Self {
        Self {
            vat_id,
            endpoint: EndpointId::Vat(vat_id.clone()),
            store,
            queue,
            exits,
        }
    }

    pub fn handle(&mut self, syscall: VatSyscall) -> VatSyscallResult {
        let name = syscall.name();
        if syscall.is_legacy() {
            warn!(vat = %self.vat_id, syscall = name, "refusing legacy syscall");
            return VatSyscallResult::Error(KernelError::UnsupportedSyscall(name).to_string());
        }
        debug!(vat = %self.vat_id, syscall = name, "syscall");

        let outcome = self.dispatch(syscall);
        let released = self.store.release_fresh_exports().map_err(KernelError::from);
        match outcome.and(released) {
            Ok(()) => VatSyscallResult::ok(),
            Err(err) => {
                error!(vat = %self.vat_id, syscall = name, error = %err, "illegal syscall");
                self.exits.push(VatExit {
                    vat_id: self.vat_id.clone(),
                    is_failure: true,
                    info: kser_error(&format!("illegal syscall: {}", err)),
                });
                VatSyscallResult::Error(err.to_string())
            }
        }
    }

    fn dispatch(&mut self, syscall: VatSyscall) -> Result<(), KernelError> {
        match syscall {
            VatSyscall::Send { target, message } => self.send(&target, &message),
            VatSyscall::Subscribe { vpid } => self.subscribe(&vpid),
            VatSyscall::Resolve { resolutions } => self.resolve(&resolutions),
            VatSyscall::Exit { is_failure, info } => self.exit(is_failure, &info),
            VatSyscall::DropImports { vrefs } => self.drop_imports(&vrefs),
            VatSyscall::RetireImports { vrefs } => self.retire_imports(&vrefs),
            VatSyscall::RetireExports { vrefs } => self.retire_exports(&vrefs),
            VatSyscall::AbandonExports { vrefs } => self.abandon_exports(&vrefs),
            VatSyscall::CallNow { .. }
            | VatSyscall::VatstoreGet { .. }
            | VatSyscall::VatstoreSet { .. }
            | VatSyscall::VatstoreDelete { .. }
            | VatSyscall::VatstoreGetNextKey { .. } => Err(KernelError::UnsupportedSyscall("legacy")),
        }
    }

    // ========================================================================
    // Messaging
    // ========================================================================

    fn send(&mut self, target: &VRef, message: &Message<VRef>) -> Result<(), KernelError> {
        let target = self.store.translate_ref_v_to_k(&self.endpoint, target)?;
        let message = self.store.translate_message_v_to_k(&self.endpoint, message)?;
        if let Some(result) = &message.result {
            let promise = self.store.get_kernel_promise(result)?;
            if promise.state.is_resolved() {
                return Err(KernelError::violation(
                    self.vat_id,
                    format!("send result {} is already resolved", result),
                ));
            }
            if promise.decider.as_ref() != Some(&self.endpoint) {
                return Err(KernelError::violation(
                    self.vat_id,
                    format!("send result {} is not decided by this vat", result),
                ));
            }
            // Kernel decides until the message reaches its destination
            self.store.set_promise_decider(result, None)?;
        }
        self.queue.enqueue_send(self.store, target, message)?;
        Ok(())
    }

    fn subscribe(&mut self, vpid: &VRef) -> Result<(), KernelError> {
        if !vpid.is_promise() {
            return Err(KernelError::violation(
                self.vat_id,
                format!("subscribe to non-promise {}", vpid),
            ));
        }
        let kpid = self.store.translate_ref_v_to_k(&self.endpoint, vpid)?;
        if self.store.get_promise_state(&kpid)? == PromiseState::Unresolved {
            self.store.add_promise_subscriber(&kpid, self.vat_id)?;
        } else {
            self.queue.enqueue_notify(self.store, self.vat_id.clone(), kpid)?;
        }
        Ok(())
    }

    fn resolve(&mut self, resolutions: &[Resolution<VRef>]) -> Result<(), KernelError> {
        let mut translated = Vec::with_capacity(resolutions.len());
        for resolution in resolutions {
            if !resolution.promise.is_promise() {
                return Err(KernelError::violation(
                    self.vat_id,
                    format!("resolve non-promise {}", resolution.promise),
                ));
            }
            translated.push(
                self.store
                    .translate_resolution_v_to_k(&self.endpoint, resolution)?,
            );
        }
        let kpids: Vec<KRef> = translated.iter().map(|r| r.promise.clone()).collect();
        self.queue
            .resolve_promises(self.store, Some(&self.endpoint), translated)?;

        // The resolver is done with these promises
        for kpid in kpids {
            if let Some(eref) = self.store.kref_to_eref(&self.endpoint, &kpid)? {
                self.store.delete_clist_entry(&self.endpoint, &kpid, &eref)?;
            }
        }
        Ok(())
    }

    fn exit(&mut self, is_failure: bool, info: &CapData<VRef>) -> Result<(), KernelError> {
        let info = self.store.translate_capdata_v_to_k(&self.endpoint, info)?;
        debug!(vat = %self.vat_id, is_failure, "vat requested exit");
        self.exits.push(VatExit {
            vat_id: self.vat_id.clone(),
            is_failure,
            info,
        });
        Ok(())
    }

    // ========================================================================
    // GC
    // ========================================================================

    /// Kernel ref for an object reference the vat holds in the given direction.
    fn lookup_object(&self, vref: &ERef, export: bool, op: &str) -> Result<KRef, KernelError> {
        let direction_ok = if export { vref.is_export() } else { vref.is_import() };
        if !vref.is_object() || !direction_ok {
            let wanted = if export { "an object export" } else { "an object import" };
            return Err(KernelError::violation(
                self.vat_id,
                format!("{}: {} is not {}", op, vref, wanted),
            ));
        }
        self.store
            .eref_to_kref(&self.endpoint, vref)?
            .ok_or_else(|| {
                StoreError::UnmappedEref {
                    endpoint: self.endpoint.clone(),
                    eref: vref.clone(),
                }
                .into()
            })
    }

    fn drop_imports(&mut self, vrefs: &[VRef]) -> Result<(), KernelError> {
        for vref in vrefs {
            let kref = self.lookup_object(vref, false, "dropImports")?;
            self.store.clear_reachable_flag(&self.endpoint, &kref)?;
        }
        Ok(())
    }

    fn retire_imports(&mut self, vrefs: &[VRef]) -> Result<(), KernelError> {
        for vref in vrefs {
            let kref = self.lookup_object(vref, false, "retireImports")?;
            if self.store.get_reachable_flag(&self.endpoint, &kref)? {
                return Err(KernelError::violation(
                    self.vat_id,
                    format!("retireImports: {} is still reachable", vref),
                ));
            }
            self.store.delete_clist_entry(&self.endpoint, &kref, vref)?;
        }
        Ok(())
    }

    fn retire_exports(&mut self, vrefs: &[VRef]) -> Result<(), KernelError> {
        let mut retired = Vec::with_capacity(vrefs.len());
        for vref in vrefs {
            let kref = self.lookup_object(vref, true, "retireExports")?;
            let counts = self.store.get_object_ref_count(&kref)?;
            if counts.reachable != 0 {
                return Err(KernelError::violation(
                    self.vat_id,
                    format!("retireExports: {} is still reachable", vref),
                ));
            }
            self.store.delete_clist_entry(&self.endpoint, &kref, vref)?;
            retired.push(kref);
        }
        self.store.retire_kernel_objects(&retired)?;
        Ok(())
    }

    fn abandon_exports(&mut self, vrefs: &[VRef]) -> Result<(), KernelError> {
        for vref in vrefs {
            let kref = self.lookup_object(vref, true, "abandonExports")?;
            self.store.delete_clist_entry(&self.endpoint, &kref, vref)?;
            self.store.orphan_kernel_object(&kref);
            self.store.add_maybe_free(&kref);
        }
        Ok(())
    }
}
