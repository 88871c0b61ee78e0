//! Scripted in-process vat worker for kernel scenario tests.
//!
//! Each bundle name maps to a factory producing a behavior: a closure that
//! turns one delivery into the syscalls the vat makes while handling it.
//! Every vat counts its deliveries in its vat store under `deliveryCount`.

#![allow(dead_code)]

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex};

use ocap_ipc::{
    decode_methargs, kser, vat_stream_pair, CommandReply, KernelToVat, Resolution, VRef,
    VatCommand, VatConfig, VatDelivery, VatId, VatPort, VatSource, VatStream, VatSyscall,
    VatSyscallResult, VatToKernel,
};
use ocap_kernel::{KernelError, VatWorkerService};
use ocap_store::{KvStore, VatKvStore};
use serde_json::Value;
use tokio::task::JoinHandle;

pub type Behavior = Box<dyn FnMut(&VatDelivery) -> Vec<VatSyscall> + Send>;
pub type BehaviorFactory = Arc<dyn Fn() -> Behavior + Send + Sync>;

/// Everything the test vats saw.
#[derive(Clone, Default)]
pub struct VatLog {
    deliveries: Arc<Mutex<Vec<(VatId, VatDelivery)>>>,
    syscall_results: Arc<Mutex<Vec<(VatId, VatSyscallResult)>>>,
}

impl VatLog {
    pub fn deliveries(&self, vat: &VatId) -> Vec<VatDelivery> {
        self.deliveries
            .lock()
            .unwrap()
            .iter()
            .filter(|(v, _)| v == vat)
            .map(|(_, d)| d.clone())
            .collect()
    }

    /// Method names of the messages delivered to `vat`, in order.
    pub fn methods(&self, vat: &VatId) -> Vec<String> {
        self.deliveries(vat)
            .into_iter()
            .filter_map(|d| match d {
                VatDelivery::Message { message, .. } => {
                    Some(decode_methargs(&message.methargs.body).unwrap().0)
                }
                _ => None,
            })
            .collect()
    }

    pub fn syscall_results(&self, vat: &VatId) -> Vec<VatSyscallResult> {
        self.syscall_results
            .lock()
            .unwrap()
            .iter()
            .filter(|(v, _)| v == vat)
            .map(|(_, r)| r.clone())
            .collect()
    }
}

pub struct TestVatWorker {
    bundles: BTreeMap<String, BehaviorFactory>,
    /// Bundles whose vats initialize but never answer a delivery
    silent: BTreeSet<String>,
    log: VatLog,
    tasks: BTreeMap<VatId, JoinHandle<()>>,
}

impl TestVatWorker {
    pub fn new() -> Self {
        Self {
            bundles: BTreeMap::new(),
            silent: BTreeSet::new(),
            log: VatLog::default(),
            tasks: BTreeMap::new(),
        }
    }

    pub fn with_bundle<F>(mut self, name: &str, factory: F) -> Self
    where
        F: Fn() -> Behavior + Send + Sync + 'static,
    {
        self.bundles.insert(name.to_string(), Arc::new(factory));
        self
    }

    pub fn with_silent_bundle(mut self, name: &str) -> Self {
        self.silent.insert(name.to_string());
        self.with_bundle(name, || -> Behavior { Box::new(|_: &VatDelivery| Vec::new()) })
    }

    pub fn log(&self) -> VatLog {
        self.log.clone()
    }
}

impl VatWorkerService for TestVatWorker {
    async fn launch(&mut self, vat_id: &VatId, config: &VatConfig) -> Result<VatStream, KernelError> {
        let VatSource::BundleName(name) = &config.source else {
            return Err(KernelError::Config("test worker only runs named bundles".into()));
        };
        let factory = self
            .bundles
            .get(name)
            .cloned()
            .ok_or_else(|| KernelError::Config(format!("unknown bundle {}", name)))?;
        let (stream, port) = vat_stream_pair();
        let silent = self.silent.contains(name);
        let task = tokio::spawn(run_vat(
            vat_id.clone(),
            factory(),
            silent,
            port,
            self.log.clone(),
        ));
        if let Some(old) = self.tasks.insert(vat_id.clone(), task) {
            old.abort();
        }
        Ok(stream)
    }

    async fn terminate(&mut self, vat_id: &VatId) -> Result<(), KernelError> {
        if let Some(task) = self.tasks.remove(vat_id) {
            task.abort();
        }
        Ok(())
    }

    async fn terminate_all(&mut self) -> Result<(), KernelError> {
        for (_, task) in std::mem::take(&mut self.tasks) {
            task.abort();
        }
        Ok(())
    }
}

async fn run_vat(
    vat_id: VatId,
    mut behavior: Behavior,
    silent: bool,
    mut port: VatPort,
    log: VatLog,
) {
    let mut kv = VatKvStore::default();
    let mut next_syscall = 1;
    while let Some(frame) = port.rx.recv().await {
        let KernelToVat::Command { id, command } = frame else {
            continue;
        };
        let reply = match command {
            VatCommand::InitVat { state, .. } => {
                kv = VatKvStore::new(state);
                CommandReply::default()
            }
            VatCommand::Ping => CommandReply::default(),
            VatCommand::Deliver(delivery) => {
                log.deliveries
                    .lock()
                    .unwrap()
                    .push((vat_id.clone(), delivery.clone()));
                if silent {
                    std::future::pending::<()>().await;
                }
                for syscall in behavior(&delivery) {
                    let syscall_id = next_syscall;
                    next_syscall += 1;
                    if port
                        .tx
                        .send(VatToKernel::Syscall {
                            id: syscall_id,
                            syscall,
                        })
                        .is_err()
                    {
                        return;
                    }
                    loop {
                        match port.rx.recv().await {
                            Some(KernelToVat::SyscallResult { id, result }) if id == syscall_id => {
                                log.syscall_results
                                    .lock()
                                    .unwrap()
                                    .push((vat_id.clone(), result));
                                break;
                            }
                            Some(_) => continue,
                            None => return,
                        }
                    }
                }
                let count: u64 = kv
                    .get("deliveryCount")
                    .and_then(|c| c.parse().ok())
                    .unwrap_or(0);
                kv.set("deliveryCount", &(count + 1).to_string());
                CommandReply::with_checkpoint(kv.checkpoint())
            }
        };
        if port.tx.send(VatToKernel::Reply { id, reply }).is_err() {
            return;
        }
    }
}

// ============================================================================
// Behaviors
// ============================================================================

/// Method name, args and result of a message delivery.
pub fn as_message(delivery: &VatDelivery) -> Option<(String, Vec<Value>, Vec<VRef>, Option<VRef>)> {
    match delivery {
        VatDelivery::Message { message, .. } => {
            let (method, args) = decode_methargs(&message.methargs.body).ok()?;
            Some((
                method,
                args,
                message.methargs.slots.clone(),
                message.result.clone(),
            ))
        }
        _ => None,
    }
}

pub fn resolve(vpid: VRef, value: Value) -> VatSyscall {
    VatSyscall::Resolve {
        resolutions: vec![Resolution::new(vpid, false, kser(&value))],
    }
}

/// Answers every message with `"<method>-reply"` and does nothing else.
pub fn echo() -> Behavior {
    Box::new(|delivery: &VatDelivery| match as_message(delivery) {
        Some((method, _, _, Some(result))) => {
            vec![resolve(result, Value::String(format!("{}-reply", method)))]
        }
        _ => Vec::new(),
    })
}

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_max_level(tracing::Level::DEBUG)
        .try_init();
}
