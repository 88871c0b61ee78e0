//! The kernel: store, run queue and vat handles driven one crank at a time.
//!
//! Split across files:
//! - `mod.rs`: construction, the crank loop and the run loop
//! - `lifecycle`: launching, restarting, terminating and reaping vats

mod lifecycle;

use std::collections::{BTreeMap, BTreeSet};

use ocap_ipc::{methargs, CapData, KRef, VatId};
use ocap_store::{KernelStore, KvStore};
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::config::KernelOptions;
use crate::error::KernelError;
use crate::handle::KernelCommand;
use crate::queue::KernelQueue;
use crate::router::KernelRouter;
use crate::types::{KernelStatus, PromiseSettlement, VatExit, VatStatus};
use crate::vat::{VatCanceller, VatHandle};
use crate::worker::VatWorkerService;

pub struct Kernel<K: KvStore, W: VatWorkerService> {
    store: KernelStore<K>,
    queue: KernelQueue,
    /// Running vats
    vats: BTreeMap<VatId, VatHandle>,
    worker: W,
    /// Vats to terminate when the current crank finishes
    exits: Vec<VatExit>,
}

impl<K: KvStore, W: VatWorkerService> Kernel<K, W> {
    /// Build a kernel over `kv`, relaunching every vat it has a record for.
    pub async fn make(kv: K, worker: W, options: KernelOptions) -> Result<Self, KernelError> {
        let mut store = KernelStore::new(kv);
        if options.reset_storage {
            info!("resetting kernel storage");
            store.reset();
        }
        store.start_crank();
        let released = store.release_kernel_subscriptions();
        let collected = store.collect_garbage();
        store.end_crank();
        let released = released?;
        collected?;
        if !released.is_empty() {
            info!(count = released.len(), "released kernel pins left by a previous run");
        }
        let mut kernel = Self {
            store,
            queue: KernelQueue::new(),
            vats: BTreeMap::new(),
            worker,
            exits: Vec::new(),
        };
        for (vat_id, config) in kernel.store.get_all_vat_records()? {
            kernel.start_vat(vat_id, config).await?;
        }
        info!(vats = kernel.vats.len(), "kernel started");
        Ok(kernel)
    }

    pub fn store(&self) -> &KernelStore<K> {
        &self.store
    }

    pub fn vat_ids(&self) -> Vec<VatId> {
        self.vats.keys().cloned().collect()
    }

    /// Send `method(args)` to `target` on the kernel's behalf.
    ///
    /// The receiver yields the result promise's settlement once a crank
    /// resolves it.
    pub fn queue_message(
        &mut self,
        target: KRef,
        method: &str,
        args: Vec<Value>,
    ) -> Result<oneshot::Receiver<PromiseSettlement>, KernelError> {
        self.queue_message_with_slots(target, methargs(method, args, Vec::new()))
    }

    pub fn queue_message_with_slots(
        &mut self,
        target: KRef,
        methargs: CapData<KRef>,
    ) -> Result<oneshot::Receiver<PromiseSettlement>, KernelError> {
        Ok(self.queue.enqueue_message(&mut self.store, target, methargs)?)
    }

    pub fn get_status(&self) -> Result<KernelStatus, KernelError> {
        let vats = self
            .vats
            .values()
            .map(|handle| VatStatus {
                id: handle.vat_id().clone(),
                config: handle.config().clone(),
            })
            .collect();
        Ok(KernelStatus {
            vats,
            run_queue_length: self.store.run_queue_length()?,
            gc_actions: self.store.get_gc_actions()?.len(),
        })
    }

    // ========================================================================
    // Cranks
    // ========================================================================

    /// Process one unit of work. Returns `false` when there was none.
    pub async fn run_crank(&mut self) -> Result<bool, KernelError> {
        self.store.start_crank();
        let result = self.crank().await;
        self.store.end_crank();
        result
    }

    async fn crank(&mut self) -> Result<bool, KernelError> {
        let Some(item) = self.queue.next_item(&mut self.store)? else {
            return Ok(false);
        };
        debug!(item = item.kind(), "crank");
        KernelRouter::new(
            &mut self.store,
            &mut self.queue,
            &mut self.vats,
            &mut self.exits,
        )
        .deliver(item)
        .await?;
        self.process_exits().await?;
        self.store.collect_garbage()?;
        Ok(true)
    }

    /// Crank until no GC, reap or run-queue work is left.
    pub async fn run_until_idle(&mut self) -> Result<(), KernelError> {
        while self.run_crank().await? {}
        Ok(())
    }

    /// Terminate every vat that exited or misbehaved during the crank.
    async fn process_exits(&mut self) -> Result<(), KernelError> {
        let mut seen = BTreeSet::new();
        for exit in std::mem::take(&mut self.exits) {
            if !seen.insert(exit.vat_id.clone()) || !self.vats.contains_key(&exit.vat_id) {
                continue;
            }
            let reason = exit.is_failure.then_some(exit.info);
            self.terminate_vat_in_crank(&exit.vat_id, reason).await?;
        }
        Ok(())
    }

    // ========================================================================
    // Run loop
    // ========================================================================

    /// Serve commands and crank until the command channel closes.
    ///
    /// Parks on the run-queue signal when there is nothing to do. Errors
    /// from a crank end the loop; command errors go back to the caller.
    pub async fn run(&mut self, mut commands: mpsc::UnboundedReceiver<KernelCommand>) -> Result<(), KernelError> {
        let signal = self.queue.signal();
        info!("kernel run loop started");
        loop {
            loop {
                match commands.try_recv() {
                    Ok(command) => self.handle_command(command).await,
                    Err(mpsc::error::TryRecvError::Empty) => break,
                    Err(mpsc::error::TryRecvError::Disconnected) => {
                        info!("kernel command channel closed");
                        return Ok(());
                    }
                }
            }
            let mut deferred = Vec::new();
            let mut cancelled = BTreeSet::new();
            let cranked = self
                .run_crank_serving(&mut commands, &mut deferred, &mut cancelled)
                .await?;
            for command in deferred {
                match command {
                    // Already taken down by its cancelled delivery
                    KernelCommand::TerminateVat { vat_id, reply }
                        if cancelled.contains(&vat_id) && !self.vats.contains_key(&vat_id) =>
                    {
                        let _ = reply.send(Ok(()));
                    }
                    command => self.handle_command(command).await,
                }
            }
            if cranked {
                continue;
            }
            tokio::select! {
                command = commands.recv() => match command {
                    Some(command) => self.handle_command(command).await,
                    None => {
                        info!("kernel command channel closed");
                        return Ok(());
                    }
                },
                _ = signal.notified() => {}
            }
        }
    }

    /// One crank, taking commands while it runs.
    ///
    /// Commands are held until the crank is done, except that terminating a
    /// vat the crank is waiting on fails its in-flight delivery right away.
    /// A vat that never replies can therefore always be terminated.
    async fn run_crank_serving(
        &mut self,
        commands: &mut mpsc::UnboundedReceiver<KernelCommand>,
        deferred: &mut Vec<KernelCommand>,
        cancelled: &mut BTreeSet<VatId>,
    ) -> Result<bool, KernelError> {
        let cancellers: BTreeMap<VatId, VatCanceller> = self
            .vats
            .values()
            .map(|handle| (handle.vat_id().clone(), handle.canceller()))
            .collect();
        let crank = self.run_crank();
        tokio::pin!(crank);
        let mut open = true;
        loop {
            tokio::select! {
                biased;
                cranked = &mut crank => return cranked,
                command = commands.recv(), if open => match command {
                    Some(KernelCommand::TerminateVat { vat_id, reply }) => {
                        let waiting = cancellers.get(&vat_id).map_or(0, VatCanceller::cancel);
                        if waiting > 0 {
                            info!(vat = %vat_id, waiting, "cancelled in-flight commands");
                            cancelled.insert(vat_id.clone());
                        }
                        deferred.push(KernelCommand::TerminateVat { vat_id, reply });
                    }
                    Some(command) => deferred.push(command),
                    None => open = false,
                },
            }
        }
    }

    async fn handle_command(&mut self, command: KernelCommand) {
        debug!(command = command.name(), "kernel command");
        match command {
            KernelCommand::LaunchVat { config, reply } => {
                let _ = reply.send(self.launch_vat(config).await);
            }
            KernelCommand::LaunchSubcluster { config, reply } => {
                let _ = reply.send(self.launch_subcluster(config).await);
            }
            KernelCommand::QueueMessage {
                target,
                method,
                args,
                reply,
            } => {
                let _ = reply.send(self.queue_message(target, &method, args));
            }
            KernelCommand::RestartVat { vat_id, reply } => {
                let _ = reply.send(self.restart_vat(&vat_id).await);
            }
            KernelCommand::TerminateVat { vat_id, reply } => {
                let _ = reply.send(self.terminate_vat(&vat_id, None).await);
            }
            KernelCommand::ReapVats { filter, reply } => {
                let _ = reply.send(self.reap_vats(|vat| filter(vat)));
            }
            KernelCommand::Reset { reply } => {
                let _ = reply.send(self.reset().await);
            }
            KernelCommand::GetStatus { reply } => {
                let _ = reply.send(self.get_status());
            }
        }
    }

    /// Stop every vat and hand back the storage.
    pub async fn shutdown(mut self) -> Result<K, KernelError> {
        for handle in self.vats.values_mut() {
            handle.terminate();
        }
        self.vats.clear();
        self.queue.clear_subscriptions();
        if let Err(err) = self.worker.terminate_all().await {
            warn!(error = %err, "worker shutdown failed");
        }
        info!("kernel shut down");
        let Self { store, .. } = self;
        Ok(store.into_kv())
    }
}
